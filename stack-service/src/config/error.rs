// Config error types
// Carries the file, location and a source excerpt for stack.yaml / release.yaml problems

use std::fmt;
use std::path::{Path, PathBuf};

/// Error raised while loading or validating stack configuration
#[derive(Debug, Clone)]
pub struct ConfigError {
    /// Human readable message
    pub message: String,
    /// File the error belongs to (if any)
    pub path: Option<PathBuf>,
    /// Line number (1-indexed, 0 = unknown)
    pub line: usize,
    /// Column number (1-indexed, 0 = unknown)
    pub column: usize,
    /// Source excerpt around the error
    pub context: String,
    /// Optional hint for fixing the error
    pub suggestion: Option<String>,
    pub kind: ConfigErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// YAML syntax or type error
    YamlSyntax,
    /// Wrong apiVersion / kind, missing required fields
    InvalidSchema,
    /// Semantically invalid values (hooks, runner settings, duplicates)
    Validation,
    /// File could not be read, or no stack.yaml at the root
    Io,
}

impl ConfigError {
    pub fn new(message: impl Into<String>, kind: ConfigErrorKind) -> Self {
        Self {
            message: message.into(),
            path: None,
            line: 0,
            column: 0,
            context: String::new(),
            suggestion: None,
            kind,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(message, ConfigErrorKind::Validation)
    }

    pub fn schema(path: &Path, message: impl Into<String>) -> Self {
        Self::new(message, ConfigErrorKind::InvalidSchema).with_path(path)
    }

    pub fn io(path: &Path, err: &std::io::Error) -> Self {
        Self::new(format!("read {}: {}", path.display(), err), ConfigErrorKind::Io)
            .with_path(path)
    }

    pub fn with_path(mut self, path: &Path) -> Self {
        self.path = Some(path.to_path_buf());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Build the excerpt shown under the message
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        if self.line == 0 {
            return self;
        }
        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let prefix = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", prefix, line_num, line));
            if line_num == self.line && self.column > 0 {
                let indicator = " ".repeat(self.column + 7) + "^";
                context.push_str(&format!("       | {}\n", indicator));
            }
        }
        self.context = context;
        self
    }

    /// Create from a serde_yaml error raised while parsing `path`
    pub fn from_yaml_error(path: &Path, err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((0, 0));

        let mut out = Self::new(format_yaml_error_message(err), ConfigErrorKind::YamlSyntax)
            .with_path(path);
        out.line = line;
        out.column = column;
        out.suggestion = suggest_yaml_fix(err, source, line);
        out.with_source_context(source, 2)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.path, self.line) {
            (Some(path), 0) => write!(f, "{}: {}", path.display(), self.message)?,
            (Some(path), line) => write!(
                f,
                "{}:{}:{}: {}",
                path.display(),
                line,
                self.column,
                self.message
            )?,
            (None, _) => write!(f, "{}", self.message)?,
        }
        if !self.context.is_empty() {
            write!(f, "\n{}", self.context.trim_end())?;
        }
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nhelp: {}", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigError {}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

fn format_yaml_error_message(err: &serde_yaml::Error) -> String {
    let msg = err.to_string();

    if msg.contains("missing field") {
        if let Some(field) = extract_between(&msg, "missing field `", "`") {
            return format!("missing required field '{}'", field);
        }
    }
    if msg.contains("unknown variant") {
        if let Some(variant) = extract_between(&msg, "unknown variant `", "`") {
            return format!("unknown value '{}'", variant);
        }
    }
    if msg.contains("invalid type") {
        if let (Some(expected), Some(found)) = (
            extract_between(&msg, "expected ", " at"),
            extract_between(&msg, "invalid type: ", ","),
        ) {
            return format!("expected {}, but found {}", expected, found);
        }
    }
    msg
}

fn extract_between(msg: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(msg[start..end].to_string())
}

fn suggest_yaml_fix(err: &serde_yaml::Error, source: &str, line: usize) -> Option<String> {
    let msg = err.to_string();
    let error_line = source
        .lines()
        .nth(line.saturating_sub(1))
        .unwrap_or_default();

    if error_line.starts_with('\t') {
        return Some("YAML does not allow tabs for indentation; use spaces".to_string());
    }
    if msg.contains("invalid duration") || (msg.contains("timeout") && msg.contains("invalid")) {
        return Some("durations are written like 30s, 5m or 1h30m".to_string());
    }

    let typo_suggestions = [
        ("dependson", "needs"),
        ("depends_on", "needs"),
        ("runonce:", "runOnce"),
        ("chart_version", "chartVersion"),
        ("defaultprofile", "defaultProfile"),
    ];
    let lower_line = error_line.to_lowercase();
    for (typo, correct) in typo_suggestions {
        if lower_line.contains(typo) {
            return Some(format!("did you mean '{}'?", correct));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display_with_location() {
        let mut err = ConfigError::schema(Path::new("/s/stack.yaml"), "kind must be Stack");
        err.line = 3;
        err.column = 1;
        let err = err
            .with_source_context("apiVersion: ktl.dev/v1\nname: demo\nkind: Nope\n", 1)
            .with_suggestion("use kind: Stack");

        let output = err.to_string();
        assert!(output.starts_with("/s/stack.yaml:3:1: kind must be Stack"));
        assert!(output.contains(">    3 | kind: Nope"));
        assert!(output.contains("help: use kind: Stack"));
    }

    #[test]
    fn test_from_yaml_error_points_at_line() {
        let source = "name: demo\nreleases:\n  - name: a\n    needs: 5\n";
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Doc {
            name: String,
            releases: Vec<Rel>,
        }
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Rel {
            name: String,
            needs: Vec<String>,
        }
        let yaml_err = serde_yaml::from_str::<Doc>(source).unwrap_err();
        let err = ConfigError::from_yaml_error(Path::new("stack.yaml"), &yaml_err, source);
        assert_eq!(err.kind, ConfigErrorKind::YamlSyntax);
        assert!(err.line > 0);
        assert!(!err.context.is_empty());
    }

    #[test]
    fn test_extract_between() {
        let msg = "missing field `chart` at line 10";
        assert_eq!(
            extract_between(msg, "missing field `", "`"),
            Some("chart".to_string())
        );
    }
}
