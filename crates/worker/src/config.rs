use std::path::{Path, PathBuf};

use patchline_core::types::TargetIdentity;
use patchline_events::bus::DEFAULT_CAPACITY;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Worker configuration loaded from environment variables.
///
/// Directories default to locations under the system temp dir, suitable for
/// local runs. The job fields describe the single job the worker drives.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root of the scratch directory for temporary artifacts.
    pub work_dir: PathBuf,
    /// Where [`DirectoryInstaller`](crate::local::DirectoryInstaller) places
    /// installed artifacts.
    pub install_dir: PathBuf,
    /// Capacity of the installer event bus.
    pub event_capacity: usize,
    pub source: Option<PathBuf>,
    /// Operation ids in application order.
    pub operations: Vec<String>,
    pub target_name: Option<String>,
    pub target_version: Option<String>,
    /// Export destination for the signed artifact, if any.
    pub export_to: Option<PathBuf>,
    /// Whether to install after a successful build (default: `true`).
    pub install: bool,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default                   |
    /// |----------------------------|---------------------------|
    /// | `PATCHLINE_WORK_DIR`       | `<system temp>/patchline` |
    /// | `PATCHLINE_INSTALL_DIR`    | `<work dir>/installed`    |
    /// | `PATCHLINE_EVENT_CAPACITY` | `256`                     |
    /// | `PATCHLINE_SOURCE`         | (none)                    |
    /// | `PATCHLINE_OPERATIONS`     | (empty)                   |
    /// | `PATCHLINE_TARGET_NAME`    | (none)                    |
    /// | `PATCHLINE_TARGET_VERSION` | (none)                    |
    /// | `PATCHLINE_EXPORT_TO`      | (none)                    |
    /// | `PATCHLINE_INSTALL`        | `true`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through `lookup` instead of the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let work_dir = var("PATCHLINE_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("patchline"));

        let install_dir = var("PATCHLINE_INSTALL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| work_dir.join("installed"));

        let event_capacity = match var("PATCHLINE_EVENT_CAPACITY") {
            None => DEFAULT_CAPACITY,
            Some(value) => match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                Ok(_) => {
                    return Err(ConfigError::Invalid {
                        var: "PATCHLINE_EVENT_CAPACITY",
                        value,
                        reason: "must be greater than zero".to_string(),
                    })
                }
                Err(e) => {
                    return Err(ConfigError::Invalid {
                        var: "PATCHLINE_EVENT_CAPACITY",
                        value,
                        reason: e.to_string(),
                    })
                }
            },
        };

        let operations = var("PATCHLINE_OPERATIONS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let install = match var("PATCHLINE_INSTALL") {
            None => true,
            Some(value) => parse_bool(&value).ok_or_else(|| ConfigError::Invalid {
                var: "PATCHLINE_INSTALL",
                value,
                reason: "expected true or false".to_string(),
            })?,
        };

        Ok(Self {
            work_dir,
            install_dir,
            event_capacity,
            source: var("PATCHLINE_SOURCE").map(PathBuf::from),
            operations,
            target_name: var("PATCHLINE_TARGET_NAME").map(|v| v.trim().to_string()),
            target_version: var("PATCHLINE_TARGET_VERSION").map(|v| v.trim().to_string()),
            export_to: var("PATCHLINE_EXPORT_TO").map(PathBuf::from),
            install,
        })
    }

    /// Source artifact of the job.
    pub fn source(&self) -> Result<&Path, ConfigError> {
        self.source
            .as_deref()
            .ok_or(ConfigError::Missing("PATCHLINE_SOURCE"))
    }

    /// Target identity of the job.
    pub fn target(&self) -> Result<TargetIdentity, ConfigError> {
        let name = self
            .target_name
            .as_ref()
            .ok_or(ConfigError::Missing("PATCHLINE_TARGET_NAME"))?;
        let version = self
            .target_version
            .as_ref()
            .ok_or(ConfigError::Missing("PATCHLINE_TARGET_VERSION"))?;
        Ok(TargetIdentity::new(name.clone(), version.clone()))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).expect("config");
        assert_eq!(config.work_dir, std::env::temp_dir().join("patchline"));
        assert_eq!(config.install_dir, config.work_dir.join("installed"));
        assert_eq!(config.event_capacity, DEFAULT_CAPACITY);
        assert!(config.operations.is_empty());
        assert!(config.install);
        assert!(config.export_to.is_none());
        assert_eq!(config.source(), Err(ConfigError::Missing("PATCHLINE_SOURCE")));
        assert_eq!(
            config.target(),
            Err(ConfigError::Missing("PATCHLINE_TARGET_NAME"))
        );
    }

    #[test]
    fn job_fields_are_parsed() {
        let config = load(&[
            ("PATCHLINE_WORK_DIR", "/var/patchline"),
            ("PATCHLINE_SOURCE", "/data/base.apk"),
            ("PATCHLINE_OPERATIONS", " remove-ads, ,hide-shorts ,"),
            ("PATCHLINE_TARGET_NAME", "com.example.app"),
            ("PATCHLINE_TARGET_VERSION", " 19.16.39 "),
            ("PATCHLINE_INSTALL", "no"),
        ])
        .expect("config");

        assert_eq!(config.install_dir, PathBuf::from("/var/patchline/installed"));
        assert_eq!(config.operations, vec!["remove-ads", "hide-shorts"]);
        assert_eq!(config.source(), Ok(Path::new("/data/base.apk")));
        assert_eq!(
            config.target(),
            Ok(TargetIdentity::new("com.example.app", "19.16.39"))
        );
        assert!(!config.install);
    }

    #[test]
    fn invalid_capacity_is_an_error() {
        assert_matches!(
            load(&[("PATCHLINE_EVENT_CAPACITY", "lots")]),
            Err(ConfigError::Invalid { var: "PATCHLINE_EVENT_CAPACITY", .. })
        );
        assert_matches!(
            load(&[("PATCHLINE_EVENT_CAPACITY", "0")]),
            Err(ConfigError::Invalid { var: "PATCHLINE_EVENT_CAPACITY", .. })
        );
    }

    #[test]
    fn invalid_install_flag_is_an_error() {
        let err = load(&[("PATCHLINE_INSTALL", "maybe")]).expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "PATCHLINE_INSTALL has invalid value 'maybe': expected true or false"
        );
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = load(&[("PATCHLINE_EXPORT_TO", "  "), ("PATCHLINE_INSTALL", "")])
            .expect("config");
        assert!(config.export_to.is_none());
        assert!(config.install);
    }
}
