// Stack discovery
// Walks a stack root and loads every stack.yaml / release.yaml underneath it

use super::error::{ConfigError, ConfigResult};
use super::models::{ReleaseFile, ReleaseSpec, StackFile, StackProfile, CONFIG_API_VERSION};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const STACK_FILE_NAME: &str = "stack.yaml";
pub const RELEASE_FILE_NAME: &str = "release.yaml";

/// Directories never descended into
const SKIP_DIRS: [&str; 4] = [".git", "bin", "dist", ".ktl"];

/// A release found on disk, before any merging
#[derive(Debug, Clone)]
pub struct DiscoveredRelease {
    /// Directory the release is rooted at
    pub dir: PathBuf,
    /// File that declared it (release.yaml or the inline stack.yaml)
    pub source: PathBuf,
    pub spec: ReleaseSpec,
}

/// Everything found under a stack root
#[derive(Debug, Clone)]
pub struct Universe {
    pub root_dir: PathBuf,
    pub stack_name: String,
    pub default_profile: String,
    /// stack.yaml files keyed by their directory
    pub stacks: BTreeMap<PathBuf, StackFile>,
    pub releases: Vec<DiscoveredRelease>,
}

impl Universe {
    /// The stack.yaml at the root
    pub fn root_stack(&self) -> Option<&StackFile> {
        self.stacks.get(&self.root_dir)
    }

    /// Profile block of the root stack.yaml, if the profile exists
    pub fn root_profile(&self, profile: &str) -> Option<&StackProfile> {
        let profile = profile.trim();
        if profile.is_empty() {
            return None;
        }
        self.root_stack().and_then(|sf| sf.profiles.get(profile))
    }

    /// Profile to use when none was requested
    pub fn effective_profile(&self, requested: &str) -> String {
        let requested = requested.trim();
        if requested.is_empty() {
            self.default_profile.trim().to_string()
        } else {
            requested.to_string()
        }
    }
}

/// Load every stack.yaml / release.yaml under `root`
pub fn discover(root: &Path) -> ConfigResult<Universe> {
    let root_dir = fs::canonicalize(root).map_err(|e| ConfigError::io(root, &e))?;

    let mut stacks = BTreeMap::new();
    let mut releases = Vec::new();

    let walker = WalkDir::new(&root_dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 || !e.file_type().is_dir() {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !SKIP_DIRS.contains(&name.as_ref())
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            ConfigError::new(
                format!("walk {}: {}", root_dir.display(), e),
                super::error::ConfigErrorKind::Io,
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let dir = path.parent().unwrap_or(&root_dir).to_path_buf();
        match entry.file_name().to_str() {
            Some(STACK_FILE_NAME) => {
                let sf = read_stack_file(path, dir == root_dir)?;
                for spec in &sf.releases {
                    releases.push(DiscoveredRelease {
                        dir: dir.clone(),
                        source: path.to_path_buf(),
                        spec: spec.clone(),
                    });
                }
                stacks.insert(dir, sf);
            }
            Some(RELEASE_FILE_NAME) => {
                let rf = read_release_file(path)?;
                releases.push(DiscoveredRelease {
                    dir,
                    source: path.to_path_buf(),
                    spec: rf.release,
                });
            }
            _ => {}
        }
    }

    let Some(root_stack) = stacks.get(&root_dir) else {
        return Err(ConfigError::new(
            format!(
                "no {} found at stack root {}",
                STACK_FILE_NAME,
                root_dir.display()
            ),
            super::error::ConfigErrorKind::Io,
        ));
    };

    let stack_name = if root_stack.name.trim().is_empty() {
        root_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "stack".to_string())
    } else {
        root_stack.name.trim().to_string()
    };
    let default_profile = root_stack.default_profile.trim().to_string();

    tracing::debug!(
        root = %root_dir.display(),
        stacks = stacks.len(),
        releases = releases.len(),
        "discovered stack"
    );

    Ok(Universe {
        root_dir,
        stack_name,
        default_profile,
        stacks,
        releases,
    })
}

fn read_source(path: &Path) -> ConfigResult<String> {
    fs::read_to_string(path).map_err(|e| ConfigError::io(path, &e))
}

/// Parse and validate a stack.yaml; `is_root` permits runOnce hooks
pub fn read_stack_file(path: &Path, is_root: bool) -> ConfigResult<StackFile> {
    let source = read_source(path)?;
    let sf: StackFile = serde_yaml::from_str(&source)
        .map_err(|e| ConfigError::from_yaml_error(path, &e, &source))?;

    if !sf.kind.is_empty() && sf.kind != "Stack" {
        return Err(ConfigError::schema(
            path,
            format!("kind must be Stack (got {:?})", sf.kind),
        ));
    }
    check_api_version(path, &sf.api_version)?;

    for (i, rel) in sf.releases.iter().enumerate() {
        if rel.name.trim().is_empty() {
            return Err(ConfigError::schema(
                path,
                format!("releases[{}].name is required", i),
            ));
        }
        if rel.chart.trim().is_empty() {
            return Err(ConfigError::schema(
                path,
                format!("releases[{}].chart is required", i),
            ));
        }
        rel.hooks
            .validate(false, &format!("releases[{}].hooks", i))
            .map_err(|msg| ConfigError::validation(msg).with_path(path))?;
    }

    sf.hooks
        .validate(is_root, "hooks")
        .map_err(|msg| ConfigError::validation(msg).with_path(path))?;
    for (name, profile) in &sf.profiles {
        profile
            .hooks
            .validate(is_root, &format!("profiles.{}.hooks", name))
            .map_err(|msg| ConfigError::validation(msg).with_path(path))?;
    }
    Ok(sf)
}

/// Parse and validate a release.yaml
pub fn read_release_file(path: &Path) -> ConfigResult<ReleaseFile> {
    let source = read_source(path)?;
    let rf: ReleaseFile = serde_yaml::from_str(&source)
        .map_err(|e| ConfigError::from_yaml_error(path, &e, &source))?;

    if !rf.kind.is_empty() && rf.kind != "Release" {
        return Err(ConfigError::schema(
            path,
            format!("kind must be Release (got {:?})", rf.kind),
        ));
    }
    check_api_version(path, &rf.api_version)?;
    if rf.release.name.trim().is_empty() {
        return Err(ConfigError::schema(path, "name is required"));
    }
    if rf.release.chart.trim().is_empty() {
        return Err(ConfigError::schema(path, "chart is required"));
    }
    rf.release
        .hooks
        .validate(false, "hooks")
        .map_err(|msg| ConfigError::validation(msg).with_path(path))?;
    Ok(rf)
}

fn check_api_version(path: &Path, api_version: &str) -> ConfigResult<()> {
    if !api_version.is_empty() && api_version != CONFIG_API_VERSION {
        return Err(ConfigError::schema(
            path,
            format!(
                "apiVersion must be {} (got {:?})",
                CONFIG_API_VERSION, api_version
            ),
        )
        .with_suggestion(format!("set apiVersion: {}", CONFIG_API_VERSION)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_discover_stack_and_releases() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "stack.yaml",
            "apiVersion: ktl.dev/v1\nkind: Stack\ndefaultProfile: dev\nreleases:\n  - name: inline\n    chart: ./charts/inline\n",
        );
        write(
            tmp.path(),
            "apps/api/release.yaml",
            "apiVersion: ktl.dev/v1\nkind: Release\nname: api\nchart: ./chart\n",
        );
        write(
            tmp.path(),
            ".ktl/stack/release.yaml",
            "name: ignored\nchart: x\n",
        );

        let u = discover(tmp.path()).unwrap();
        let expected_name = tmp
            .path()
            .canonicalize()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .to_string();
        assert_eq!(u.stack_name, expected_name);
        assert_eq!(u.default_profile, "dev");
        assert_eq!(u.stacks.len(), 1);
        let names: Vec<_> = u.releases.iter().map(|r| r.spec.name.as_str()).collect();
        assert_eq!(names, vec!["api", "inline"]);
        assert!(u.root_stack().is_some());
    }

    #[test]
    fn test_discover_requires_root_stack() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a/release.yaml", "name: a\nchart: c\n");
        let err = discover(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("no stack.yaml found"));
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "stack.yaml", "kind: Release\n");
        let err = discover(tmp.path()).unwrap_err();
        assert!(err.message.contains("kind must be Stack"));
    }

    #[test]
    fn test_run_once_only_in_root() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "stack.yaml", "name: s\n");
        write(
            tmp.path(),
            "team/stack.yaml",
            "hooks:\n  preApply:\n    - type: script\n      runOnce: true\n      script:\n        command: [echo]\n",
        );
        let err = discover(tmp.path()).unwrap_err();
        assert!(err.message.contains("runOnce is not allowed here"));
    }

    #[test]
    fn test_release_requires_chart() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "stack.yaml", "name: s\n");
        write(tmp.path(), "db/release.yaml", "name: db\n");
        let err = discover(tmp.path()).unwrap_err();
        assert!(err.message.contains("chart is required"));
    }
}
