//! Settings loading and validation.
//!
//! Validates configuration before the manager starts to catch errors early.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::manager::ManagerConfig;
use crate::sandbox::SandboxConfig;

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for ManagerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.max_sandboxes == 0 {
            result.add_error("max_sandboxes must be at least 1");
        }

        if self.cleanup_interval.is_zero() {
            result.add_error("cleanup_interval must be greater than zero");
        }

        // Idle sandboxes can outlive their timeout by up to one interval
        if self.cleanup_interval > self.idle_timeout {
            result.add_warning(
                "cleanup_interval exceeds idle_timeout - idle sandboxes will linger past their timeout",
            );
        }

        result
    }
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.image.trim().is_empty() {
            result.add_error("image cannot be empty");
        }

        if !self.work_dir.starts_with('/') {
            result.add_error(format!(
                "work_dir '{}' must be an absolute path",
                self.work_dir
            ));
        }

        if self.cpu_limit.is_nan() || self.cpu_limit <= 0.0 {
            result.add_error("cpu_limit must be greater than zero");
        }

        if !is_memory_limit(&self.memory_limit) {
            result.add_error(format!(
                "memory_limit '{}' is not a valid size (e.g. 512m, 2g)",
                self.memory_limit
            ));
        }

        if self.timeout.is_zero() {
            result.add_error("timeout must be greater than zero");
        }

        if self.network_enabled {
            result.add_warning("network_enabled lets sandboxed commands reach the network");
        }

        result
    }
}

fn is_memory_limit(value: &str) -> bool {
    memory_limit_bytes(value).is_some()
}

/// Parses docker-style sizes: digits with an optional b/k/m/g suffix.
pub(crate) fn memory_limit_bytes(value: &str) -> Option<i64> {
    let (digits, unit) = match value.chars().last()?.to_ascii_lowercase() {
        'b' => (&value[..value.len() - 1], 1),
        'k' => (&value[..value.len() - 1], 1 << 10),
        'm' => (&value[..value.len() - 1], 1 << 20),
        'g' => (&value[..value.len() - 1], 1 << 30),
        _ => (value, 1),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse::<i64>().ok()?.checked_mul(unit)
}

/// Top-level settings file.
///
/// ```toml
/// [manager]
/// max_sandboxes = 10
/// idle_timeout = 600
/// cleanup_interval = 60
///
/// [sandbox]
/// image = "python:3.12-slim"
/// memory_limit = "1g"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Pool limits and reclamation timing.
    pub manager: ManagerConfig,
    /// Defaults for sandboxes created without explicit options.
    pub sandbox: SandboxConfig,
}

impl Settings {
    /// Loads settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses settings from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid settings: {}", e)))
    }
}

impl Validate for Settings {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.merge(self.manager.validate());
        result.merge(self.sandbox.validate());
        result
    }
}

/// Serde adapter storing a [`Duration`] as (fractional) seconds.
pub(crate) mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
