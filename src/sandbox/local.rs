//! Directory-backed sandbox implementation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

use super::process;
use super::provider::{sandbox_name, ExecResult, Sandbox, SandboxConfig, SandboxProvider};

/// A sandbox implemented as a private working directory on the host.
///
/// Every command runs through `sh -c` with the directory as its working
/// directory, so files written by one command are visible to the next.
pub struct LocalSandboxInstance {
    /// Directory name, unique per provider.
    id: String,
    /// Path to the sandbox directory.
    path: PathBuf,
    /// The configuration used to create this sandbox.
    config: SandboxConfig,
    /// Whether the directory has been removed.
    destroyed: AtomicBool,
}

impl LocalSandboxInstance {
    /// Returns the working directory path of the sandbox.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Sandbox for LocalSandboxInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn config(&self) -> &SandboxConfig {
        &self.config
    }

    async fn run(&self, command: &str) -> Result<ExecResult> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Execution(format!(
                "sandbox {} has been destroyed",
                self.id
            )));
        }

        tracing::debug!(sandbox = %self.id, command = %command, "executing command");

        let output = process::run(
            Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.path)
                .envs(&self.config.environment),
            self.config.timeout,
        )
        .await?;

        Ok(ExecResult {
            output: process::combined_output(&output),
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
        })
    }

    async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                self.destroyed.store(false, Ordering::SeqCst);
                return Err(Error::Destroy {
                    id: self.id.clone(),
                    reason: e.to_string(),
                });
            }
        }

        tracing::debug!(sandbox = %self.id, path = ?self.path, "removed sandbox directory");
        Ok(())
    }
}

impl Drop for LocalSandboxInstance {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::SeqCst) {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!(error = %e, path = ?self.path, "failed to remove sandbox on drop");
                }
            }
        }
    }
}

/// Provider that creates sandboxes as directories under a base directory.
#[derive(Clone)]
pub struct LocalSandbox {
    /// Base directory for sandboxes. If None, uses a temp directory.
    base_dir: Option<PathBuf>,
    /// Counter for generating unique directory names (shared across clones).
    counter: Arc<AtomicU64>,
}

impl LocalSandbox {
    /// Creates a new local sandbox provider.
    ///
    /// If `base_dir` is provided, sandbox directories are created there.
    /// Otherwise, a system temp directory is used.
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self {
            base_dir,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    fn generate_name(&self) -> String {
        sandbox_name(&self.counter)
    }

    fn base(&self) -> PathBuf {
        match &self.base_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join("agent-sandboxes"),
        }
    }
}

#[async_trait]
impl SandboxProvider for LocalSandbox {
    fn name(&self) -> &str {
        "local"
    }

    async fn create(&self, config: SandboxConfig) -> Result<Arc<dyn Sandbox>> {
        let name = self.generate_name();
        let path = self.base().join(&name);

        tokio::fs::create_dir_all(&path).await.map_err(|e| {
            Error::Provisioning(format!("failed to create {}: {}", path.display(), e))
        })?;

        tracing::info!(path = ?path, sandbox = %name, "created local sandbox");

        Ok(Arc::new(LocalSandboxInstance {
            id: name,
            path,
            config,
            destroyed: AtomicBool::new(false),
        }))
    }
}
