// Process runner
// Spawns external programs with streamed output and a hard timeout

use super::{HookRunError, OutputCallback};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// What to run and where
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    /// Added to the inherited environment
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    /// Last non-empty stderr line, else stdout's, for error messages
    pub fn failure_detail(&self) -> String {
        let last = |s: &str| {
            s.lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
        };
        let code = match self.exit_code {
            Some(c) => format!("exit status {}", c),
            None => "terminated by signal".to_string(),
        };
        match last(&self.stderr).or_else(|| last(&self.stdout)) {
            Some(line) => format!("{}: {}", code, line),
            None => code,
        }
    }
}

fn spawn_line_reader<R>(reader: R, on_line: Option<OutputCallback>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut output = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(cb) = &on_line {
                if !line.trim().is_empty() {
                    cb(&line);
                }
            }
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&line);
        }
        output
    })
}

/// Run a process to completion, streaming each output line to `on_line`
///
/// A non-zero exit is not an error here; callers inspect `exit_code`.
pub async fn run_process(
    spec: &ProcessSpec,
    on_line: Option<OutputCallback>,
) -> Result<ProcessOutput, HookRunError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = spec.work_dir.as_ref().filter(|d| !d.as_os_str().is_empty()) {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|source| HookRunError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    tracing::debug!(command = %spec.display(), pid = ?child.id(), "process started");

    let stdout = child
        .stdout
        .take()
        .map(|out| spawn_line_reader(out, on_line.clone()));
    let stderr = child
        .stderr
        .take()
        .map(|err| spawn_line_reader(err, on_line.clone()));

    let status = match spec.timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                let _ = child.kill().await;
                tracing::warn!(command = %spec.display(), "process timed out");
                return Err(HookRunError::Timeout(limit));
            }
        },
        None => child.wait().await,
    }
    .map_err(|source| HookRunError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let stdout = match stdout {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };
    let stderr = match stderr {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };
    Ok(ProcessOutput {
        stdout,
        stderr,
        exit_code: status.code(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_streams_lines_and_captures_output() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: OutputCallback = Arc::new(move |line: &str| sink.lock().unwrap().push(line.to_string()));

        let spec = ProcessSpec::new("sh").args(["-c", "echo one; echo two >&2; exit 3"]);
        let out = run_process(&spec, Some(cb)).await.unwrap();

        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout, "one");
        assert_eq!(out.stderr, "two");
        assert_eq!(out.failure_detail(), "exit status 3: two");
        let mut lines = seen.lock().unwrap().clone();
        lines.sort();
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let mut spec = ProcessSpec::new("sh").args(["-c", "sleep 5"]);
        spec.timeout = Some(Duration::from_millis(100));
        let err = run_process(&spec, None).await.unwrap_err();
        assert!(matches!(err, HookRunError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let spec = ProcessSpec::new("definitely-not-a-real-binary-ktl");
        let err = run_process(&spec, None).await.unwrap_err();
        assert!(matches!(err, HookRunError::Spawn { .. }));
    }
}
