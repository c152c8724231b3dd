// Script Runner
// Runs a hook's command vector directly, without a shell

use super::process::{run_process, ProcessSpec};
use super::{HookContext, HookRunError, HookRunner};
use crate::config::HookSpec;

#[derive(Debug, Clone, Default)]
pub struct ScriptRunner;

impl ScriptRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl HookRunner for ScriptRunner {
    async fn run(&self, hook: &HookSpec, ctx: &HookContext) -> Result<(), HookRunError> {
        let command = hook
            .script
            .as_ref()
            .map(|s| s.command.as_slice())
            .unwrap_or_default();
        let Some((program, args)) = command.split_first() else {
            return Err(HookRunError::Invalid("script.command is required".into()));
        };

        let spec = ProcessSpec {
            program: program.clone(),
            args: args.to_vec(),
            work_dir: Some(ctx.work_dir(hook)),
            env: ctx.env(hook),
            timeout: Some(ctx.timeout(hook)),
        };
        let out = run_process(&spec, ctx.on_output.clone())
            .await
            .map_err(|e| HookRunError::Failed(format!("script {}: {}", program, e)))?;
        if !out.success() {
            return Err(HookRunError::Failed(format!(
                "script {}: {}",
                program,
                out.failure_detail()
            )));
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{HookType, ScriptHookConfig};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn script_hook(cmd: &[&str]) -> HookSpec {
        HookSpec {
            hook_type: Some(HookType::Script),
            script: Some(ScriptHookConfig {
                command: cmd.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_script_sees_stack_env_and_workdir() {
        let dir = TempDir::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = HookContext {
            stack_root: dir.path().to_path_buf(),
            run_id: "run-7".into(),
            on_output: Some(Arc::new(move |l: &str| sink.lock().unwrap().push(l.to_string()))),
            ..Default::default()
        };
        let hook = script_hook(&["sh", "-c", "echo $KTL_STACK_RUN_ID; pwd"]);

        ScriptRunner::new().run(&hook, &ctx).await.unwrap();

        let lines = seen.lock().unwrap().clone();
        assert_eq!(lines[0], "run-7");
        let cwd = std::fs::canonicalize(&lines[1]).unwrap();
        assert_eq!(cwd, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let hook = script_hook(&["sh", "-c", "echo boom >&2; exit 2"]);
        let err = ScriptRunner::new()
            .run(&hook, &HookContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "script sh: exit status 2: boom");
    }

    #[tokio::test]
    async fn test_empty_command_is_invalid() {
        let hook = script_hook(&[]);
        let err = ScriptRunner::new()
            .run(&hook, &HookContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HookRunError::Invalid(_)));
    }
}
