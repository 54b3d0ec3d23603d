//! Job submission types.
//!
//! A [`JobSpec`] is created once per submission and never mutated. Its
//! [`JobIdentity`] (target name + version) is the key used to deduplicate
//! concurrent executions.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Maximum length of a target name.
const MAX_NAME_LEN: usize = 255;

/// Maximum length of a target version string.
const MAX_VERSION_LEN: usize = 64;

// ---------------------------------------------------------------------------
// TargetIdentity
// ---------------------------------------------------------------------------

/// The artifact a job produces: package name plus version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetIdentity {
    pub name: String,
    pub version: String,
}

impl TargetIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Validate the identity.
    ///
    /// Rules:
    /// - Name must not be empty and must not exceed `MAX_NAME_LEN` characters.
    /// - Name may only contain alphanumeric, dot, underscore, or hyphen characters.
    /// - Version must not be empty and must not exceed `MAX_VERSION_LEN` characters.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.is_empty() {
            return Err(CoreError::Validation(
                "Target name must not be empty".to_string(),
            ));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(CoreError::Validation(format!(
                "Target name must not exceed {MAX_NAME_LEN} characters"
            )));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '.' || c == '_' || c == '-')
        {
            return Err(CoreError::Validation(
                "Target name may only contain alphanumeric, dot, underscore, or hyphen characters"
                    .to_string(),
            ));
        }
        if self.version.trim().is_empty() {
            return Err(CoreError::Validation(
                "Target version must not be empty".to_string(),
            ));
        }
        if self.version.len() > MAX_VERSION_LEN {
            return Err(CoreError::Validation(format!(
                "Target version must not exceed {MAX_VERSION_LEN} characters"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

// ---------------------------------------------------------------------------
// JobIdentity
// ---------------------------------------------------------------------------

/// Deduplication key for executions, derived from a [`TargetIdentity`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobIdentity(String);

impl JobIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&TargetIdentity> for JobIdentity {
    fn from(target: &TargetIdentity) -> Self {
        Self(target.to_string())
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// JobSpec
// ---------------------------------------------------------------------------

/// Immutable description of one build job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    source: PathBuf,
    output: PathBuf,
    operations: Vec<String>,
    target: TargetIdentity,
}

impl JobSpec {
    /// Create a spec. Operation ids keep their order; repeated ids are
    /// dropped (first occurrence wins).
    pub fn new<I, S>(
        source: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        operations: I,
        target: TargetIdentity,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered: Vec<String> = Vec::new();
        for op in operations {
            let op = op.into();
            if !ordered.contains(&op) {
                ordered.push(op);
            }
        }

        Self {
            source: source.into(),
            output: output.into(),
            operations: ordered,
            target,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn operations(&self) -> &[String] {
        &self.operations
    }

    pub fn target(&self) -> &TargetIdentity {
        &self.target
    }

    pub fn identity(&self) -> JobIdentity {
        JobIdentity::from(&self.target)
    }

    /// Check the spec before it is handed to the work queue.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.target.validate()?;
        if self.source.as_os_str().is_empty() {
            return Err(CoreError::Validation(
                "Source locator must not be empty".to_string(),
            ));
        }
        if self.output.as_os_str().is_empty() {
            return Err(CoreError::Validation(
                "Output locator must not be empty".to_string(),
            ));
        }
        if self.source == self.output {
            return Err(CoreError::Validation(
                "Output locator must differ from the source locator".to_string(),
            ));
        }
        Ok(())
    }

    /// Encode the spec as the JSON input payload of an execution.
    pub fn to_payload(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a spec from an execution input payload.
    pub fn from_payload(payload: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(payload)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
