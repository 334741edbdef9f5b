// Launch file model.
//
// services:
//   <name>:
//     environment:
//       REPO_URL: https://github.com/acme/widgets
//       ACCESS_TOKEN: ...
//       RUNNER_WORKDIR: ./runners/widgets

use crate::errors::LauncherError;
use launcher_sdk::StringUtil;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// The `environment` block of one runner.
///
/// Every key is optional in the file; missing keys read as empty strings.
/// Scalars of any YAML type are accepted, so `ORG_RUNNER: true` and
/// `ORG_RUNNER: "1"` mean the same thing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerEnvironment {
    #[serde(rename = "REPO_URL", default, deserialize_with = "scalar")]
    pub repo_url: String,
    #[serde(rename = "ACCESS_TOKEN", default, deserialize_with = "scalar")]
    pub access_token: String,
    #[serde(rename = "RUNNER_NAME", default, deserialize_with = "scalar")]
    pub runner_name: String,
    #[serde(rename = "RUNNER_TOKEN", default, deserialize_with = "scalar")]
    pub runner_token: String,
    #[serde(rename = "RUNNER_WORKDIR", default, deserialize_with = "scalar")]
    pub runner_workdir: String,
    #[serde(rename = "ORG_RUNNER", default, deserialize_with = "scalar")]
    pub org_runner: String,
    #[serde(rename = "ORG_NAME", default, deserialize_with = "scalar")]
    pub org_name: String,
    #[serde(rename = "LABELS", default, deserialize_with = "scalar")]
    pub labels: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub environment: RunnerEnvironment,
}

impl RunnerConfig {
    /// `RUNNER_NAME` when set, otherwise the service key.
    pub fn effective_name<'a>(&'a self, key: &'a str) -> &'a str {
        match self.environment.runner_name.trim() {
            "" => key,
            name => name,
        }
    }

    /// Pre-issued registration token, if any.
    pub fn static_token(&self) -> Option<&str> {
        non_empty(&self.environment.runner_token)
    }

    pub fn access_token(&self) -> Option<&str> {
        non_empty(&self.environment.access_token)
    }

    pub fn is_org_runner(&self) -> bool {
        StringUtil::is_truthy(&self.environment.org_runner)
    }

    pub fn org_name(&self) -> Option<&str> {
        non_empty(&self.environment.org_name)
    }

    pub fn labels(&self) -> Vec<String> {
        StringUtil::split_list(&self.environment.labels)
    }

    /// Resolve `RUNNER_WORKDIR` to an absolute path.
    ///
    /// Relative paths are joined onto `config_dir`, the absolute directory of
    /// the launch file. The result is lexically normalized so the same
    /// declaration always yields the same path.
    pub fn resolve_work_dir(&self, runner: &str, config_dir: &Path) -> Result<PathBuf, LauncherError> {
        let declared = self.environment.runner_workdir.trim();
        if declared.is_empty() {
            return Err(LauncherError::WorkDir {
                runner: runner.to_string(),
                reason: "RUNNER_WORKDIR is empty".to_string(),
            });
        }

        let declared = Path::new(declared);
        let joined = if declared.is_absolute() {
            declared.to_path_buf()
        } else if config_dir.is_absolute() {
            config_dir.join(declared)
        } else {
            return Err(LauncherError::WorkDir {
                runner: runner.to_string(),
                reason: format!(
                    "relative workdir '{}' needs an absolute config directory, got '{}'",
                    declared.display(),
                    config_dir.display()
                ),
            });
        };
        Ok(normalize(&joined))
    }
}

/// The parsed launch file. Immutable once loaded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchConfig {
    #[serde(default)]
    pub services: BTreeMap<String, RunnerConfig>,

    /// Absolute directory of the file this config was read from.
    #[serde(skip)]
    config_dir: PathBuf,
}

impl LaunchConfig {
    /// Read and parse the launch file at `path`.
    pub fn load(path: &Path) -> Result<Self, LauncherError> {
        let config_error = |reason: String| LauncherError::ConfigFile {
            path: path.to_path_buf(),
            reason,
        };

        let contents = std::fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;

        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        let config_dir = if parent.is_absolute() {
            parent.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| config_error(format!("cannot determine current directory: {e}")))?
                .join(parent)
        };

        Self::from_yaml_str(&contents, &normalize(&config_dir)).map_err(|e| match e {
            LauncherError::ConfigFile { reason, .. } => config_error(reason),
            other => other,
        })
    }

    /// Parse launch YAML whose relative workdirs are anchored at `config_dir`.
    pub fn from_yaml_str(contents: &str, config_dir: &Path) -> Result<Self, LauncherError> {
        let mut config: LaunchConfig =
            serde_yaml::from_str(contents).map_err(|e| LauncherError::ConfigFile {
                path: config_dir.to_path_buf(),
                reason: e.to_string(),
            })?;
        config.config_dir = config_dir.to_path_buf();
        Ok(config)
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Every non-empty credential in the file, for registration with a secret masker.
    pub fn credentials(&self) -> impl Iterator<Item = &str> {
        self.services.values().flat_map(|runner| {
            [runner.access_token(), runner.static_token()]
                .into_iter()
                .flatten()
        })
    }
}

fn non_empty(value: &str) -> Option<&str> {
    match value.trim() {
        "" => None,
        v => Some(v),
    }
}

/// Drop `.` components and fold `..` onto their parent without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

fn scalar<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Scalar>::deserialize(deserializer)? {
        None => String::new(),
        Some(Scalar::Bool(b)) => b.to_string(),
        Some(Scalar::Int(i)) => i.to_string(),
        Some(Scalar::Float(f)) => f.to_string(),
        Some(Scalar::Str(s)) => s,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
services:
  widgets:
    environment:
      REPO_URL: https://github.com/acme/widgets
      ACCESS_TOKEN: ghp_access
      RUNNER_WORKDIR: ./runners/widgets
      LABELS: "gpu, linux"
  gadgets:
    environment:
      REPO_URL: https://github.com/acme/gadgets
      RUNNER_TOKEN: AABBCC
      RUNNER_NAME: gadgets-ci
      RUNNER_WORKDIR: /srv/gadgets
      ORG_RUNNER: true
"#;

    fn sample() -> LaunchConfig {
        LaunchConfig::from_yaml_str(SAMPLE, Path::new("/etc/launcher")).unwrap()
    }

    #[test]
    fn parses_services() {
        let config = sample();
        assert_eq!(config.services.len(), 2);
        let widgets = &config.services["widgets"];
        assert_eq!(widgets.environment.repo_url, "https://github.com/acme/widgets");
        assert_eq!(widgets.access_token(), Some("ghp_access"));
        assert_eq!(widgets.static_token(), None);
        assert_eq!(widgets.labels(), vec!["gpu", "linux"]);
    }

    #[test]
    fn boolean_scalars_are_accepted() {
        let config = sample();
        assert_eq!(config.services["gadgets"].environment.org_runner, "true");
        assert!(config.services["gadgets"].is_org_runner());
        assert!(!config.services["widgets"].is_org_runner());
    }

    #[test]
    fn name_override_beats_key() {
        let config = sample();
        assert_eq!(config.services["gadgets"].effective_name("gadgets"), "gadgets-ci");
        assert_eq!(config.services["widgets"].effective_name("widgets"), "widgets");
    }

    #[test]
    fn relative_workdir_resolves_against_config_dir() {
        let config = sample();
        let dir = config.services["widgets"]
            .resolve_work_dir("widgets", config.config_dir())
            .unwrap();
        assert_eq!(dir, PathBuf::from("/etc/launcher/runners/widgets"));
        // Same input, same output.
        assert_eq!(
            dir,
            config.services["widgets"]
                .resolve_work_dir("widgets", config.config_dir())
                .unwrap()
        );
    }

    #[test]
    fn absolute_workdir_is_kept() {
        let config = sample();
        let dir = config.services["gadgets"]
            .resolve_work_dir("gadgets-ci", config.config_dir())
            .unwrap();
        assert_eq!(dir, PathBuf::from("/srv/gadgets"));
    }

    #[test]
    fn parent_components_are_folded() {
        let runner = RunnerConfig {
            environment: RunnerEnvironment {
                runner_workdir: "../shared/./ci".into(),
                ..Default::default()
            },
        };
        let dir = runner.resolve_work_dir("ci", Path::new("/etc/launcher")).unwrap();
        assert_eq!(dir, PathBuf::from("/etc/shared/ci"));
    }

    #[test]
    fn empty_workdir_fails() {
        let runner = RunnerConfig::default();
        let err = runner.resolve_work_dir("ci", Path::new("/etc")).unwrap_err();
        assert!(matches!(err, LauncherError::WorkDir { ref runner, .. } if runner == "ci"));
    }

    #[test]
    fn empty_values_read_as_missing() {
        let yaml = "services:\n  a:\n    environment:\n      REPO_URL:\n      RUNNER_TOKEN: \"  \"\n";
        let config = LaunchConfig::from_yaml_str(yaml, Path::new("/")).unwrap();
        let runner = &config.services["a"];
        assert_eq!(runner.environment.repo_url, "");
        assert_eq!(runner.static_token(), None);
    }

    #[test]
    fn credentials_lists_every_secret() {
        let config = sample();
        let mut secrets: Vec<_> = config.credentials().collect();
        secrets.sort();
        assert_eq!(secrets, vec!["AABBCC", "ghp_access"]);
    }

    #[test]
    fn load_anchors_relative_workdirs_at_file_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launch.yml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = LaunchConfig::load(&path).unwrap();
        let expected = dir.path().join("runners").join("widgets");
        assert_eq!(
            config.services["widgets"]
                .resolve_work_dir("widgets", config.config_dir())
                .unwrap(),
            expected
        );
    }

    #[test]
    fn load_reports_missing_file() {
        let err = LaunchConfig::load(Path::new("/nonexistent/launch.yml")).unwrap_err();
        assert!(matches!(err, LauncherError::ConfigFile { .. }));
    }

    #[test]
    fn load_reports_malformed_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launch.yml");
        std::fs::write(&path, "services: [unclosed").unwrap();
        let err = LaunchConfig::load(&path).unwrap_err();
        match err {
            LauncherError::ConfigFile { path: p, .. } => assert_eq!(p, path),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
