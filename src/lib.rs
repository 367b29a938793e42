//! Agent Sandbox - bounded pool of isolated command sandboxes
//!
//! This library provides the lifecycle manager that tool-calling agents use to
//! create, reuse, and reclaim isolated execution environments, along with
//! directory- and container-backed sandbox providers.

pub mod config;
pub mod error;
pub mod manager;
pub mod sandbox;

pub use config::{Settings, Validate, ValidationResult};
pub use error::{Error, Result};
pub use manager::{ManagerConfig, ManagerStats, SandboxLease, SandboxManager};
pub use sandbox::{
    DockerSandbox, ExecResult, LocalSandbox, Sandbox, SandboxConfig, SandboxProvider,
};
