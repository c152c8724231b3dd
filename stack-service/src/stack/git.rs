// Git helpers
// Changed-file lookup for --git-range and stack provenance for run plans

use crate::error::{StackError, StackResult};

use std::path::Path;
use std::process::Command;

/// Commit and dirty flag of the repository containing the stack root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitIdentity {
    pub commit: String,
    pub dirty: bool,
}

/// Files changed in `range`, relative to `root`
pub fn changed_files(root: &Path, range: &str) -> StackResult<Vec<String>> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["diff", "--name-only", "--relative", range.trim()])
        .output()
        .map_err(|e| StackError::Validation(format!("git diff {}: {}", range, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StackError::Validation(format!(
            "git diff {}: {}",
            range,
            stderr.trim()
        )));
    }
    let mut files: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    files.sort();
    files.dedup();
    Ok(files)
}

/// Best effort; outside a repository both fields stay empty
pub fn git_identity(root: &Path) -> GitIdentity {
    let commit = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_default();
    if commit.is_empty() {
        return GitIdentity::default();
    }
    let dirty = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["status", "--porcelain", "--untracked-files=no"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| !o.stdout.iter().all(u8::is_ascii_whitespace))
        .unwrap_or(false);
    GitIdentity { commit, dirty }
}
