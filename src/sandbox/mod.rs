//! Sandbox module for isolated command execution environments.
//!
//! This module provides the [`Sandbox`] and [`SandboxProvider`] traits, a
//! [`LocalSandbox`] provider backed by host directories, and a
//! [`DockerSandbox`] provider backed by containers.

mod docker;
mod local;
mod process;
mod provider;

pub use docker::{DockerSandbox, DockerSandboxInstance};
pub use local::{LocalSandbox, LocalSandboxInstance};
pub use provider::{ExecResult, Sandbox, SandboxConfig, SandboxProvider};
