//! Sandbox handle and provider traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::duration_secs;
use crate::error::Result;

/// Settings for a single sandbox, passed to [`SandboxProvider::create`].
///
/// Backends apply the fields that make sense for them: the local backend
/// ignores the image and resource limits, the docker backend honours all of
/// them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container image to boot.
    pub image: String,

    /// Working directory inside the sandbox.
    pub work_dir: String,

    /// Memory limit in docker notation (e.g. `512m`).
    pub memory_limit: String,

    /// CPU share (e.g. `1.0` for one core).
    pub cpu_limit: f64,

    /// Per-command timeout.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Whether the sandbox may reach the network.
    pub network_enabled: bool,

    /// Extra environment variables for every command.
    pub environment: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".to_string(),
            work_dir: "/workspace".to_string(),
            memory_limit: "512m".to_string(),
            cpu_limit: 1.0,
            timeout: Duration::from_secs(300),
            network_enabled: false,
            environment: HashMap::new(),
        }
    }
}

impl SandboxConfig {
    /// Sets the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

/// Output and exit status of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Stdout followed by stderr.
    pub output: String,
    /// Exit code, or -1 if the backend could not report one.
    pub exit_code: i64,
}

impl ExecResult {
    /// Returns true if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A live isolated execution environment.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Backend identifier of this sandbox (directory name, container name).
    fn id(&self) -> &str;

    /// Returns the configuration used to create this sandbox.
    fn config(&self) -> &SandboxConfig;

    /// Runs a shell command and returns its output and exit status.
    async fn run(&self, command: &str) -> Result<ExecResult>;

    /// Runs a shell command and returns its output.
    ///
    /// A non-zero exit is not an error; use [`Sandbox::run`] to see it.
    async fn execute(&self, command: &str) -> Result<String> {
        Ok(self.run(command).await?.output)
    }

    /// Releases the backing resource. Calling it again is a no-op.
    async fn destroy(&self) -> Result<()>;
}

/// Backend that provisions sandboxes.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Human-readable backend name (e.g. "local", "docker").
    fn name(&self) -> &str;

    /// Provisions a new sandbox.
    async fn create(&self, config: SandboxConfig) -> Result<Arc<dyn Sandbox>>;
}

/// Backend name for the next sandbox: `sandbox-{sequence}-{nonce}`.
pub(crate) fn sandbox_name(counter: &AtomicU64) -> String {
    let id = counter.fetch_add(1, Ordering::SeqCst);
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("sandbox-{}-{}", id, &nonce[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_has_sensible_defaults() {
        let config = SandboxConfig::default();

        assert_eq!(config.image, "python:3.12-slim");
        assert_eq!(config.work_dir, "/workspace");
        assert_eq!(config.memory_limit, "512m");
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert!(!config.network_enabled);
        assert!(config.environment.is_empty());
    }

    #[test]
    fn sandbox_config_builders_apply() {
        let config = SandboxConfig::default()
            .with_timeout(Duration::from_secs(5))
            .with_env("RUST_BACKTRACE", "1");

        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(
            config.environment.get("RUST_BACKTRACE").map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn sandbox_config_timeout_serializes_as_seconds() {
        let config = SandboxConfig::default().with_timeout(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["timeout"], serde_json::json!(1.5));

        let parsed: SandboxConfig =
            serde_json::from_str(r#"{"timeout": 2, "network_enabled": true}"#).unwrap();
        assert_eq!(parsed.timeout, Duration::from_secs(2));
        assert!(parsed.network_enabled);
        assert_eq!(parsed.image, "python:3.12-slim");
    }

    #[test]
    fn sandbox_names_put_sequence_before_nonce() {
        let counter = AtomicU64::new(0);
        let first = sandbox_name(&counter);
        let second = sandbox_name(&counter);

        let parts: Vec<&str> = first.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "sandbox");
        assert_eq!(parts[1], "0");
        assert_eq!(parts[2].len(), 8);
        assert!(second.starts_with("sandbox-1-"));
        assert_ne!(first, second);
    }

    #[test]
    fn exec_result_success_tracks_exit_code() {
        let ok = ExecResult {
            output: "done\n".to_string(),
            exit_code: 0,
        };
        let failed = ExecResult {
            output: String::new(),
            exit_code: 2,
        };
        assert!(ok.success());
        assert!(!failed.success());
    }
}
