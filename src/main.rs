//! Agent Sandbox CLI
//!
//! Runs a single command inside a freshly provisioned sandbox.

use std::path::PathBuf;
use std::sync::Arc;

use agent_sandbox::{
    DockerSandbox, ExecResult, LocalSandbox, SandboxManager, SandboxProvider, Settings, Validate,
};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: agent-sandbox <command>");
        eprintln!("\nRuns a shell command in a fresh sandbox and prints its output.");
        eprintln!("Exits with the command's status, or 1 if the sandbox itself fails.");
        eprintln!("\nEnvironment variables:");
        eprintln!("  SANDBOX_BACKEND=local|docker  Select sandbox backend (default: local)");
        eprintln!("  SANDBOX_CONFIG=<path>         TOML settings file");
        std::process::exit(1);
    }

    let command = args[1..].join(" ");

    match run(&command).await {
        Ok(result) => {
            print!("{}", result.output);
            let code = exit_code(&result);
            if code != 0 {
                std::process::exit(code);
            }
        }
        Err(e) => {
            eprintln!("Sandbox run failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Maps a command's status onto a process exit code, keeping failures non-zero.
fn exit_code(result: &ExecResult) -> i32 {
    match i32::try_from(result.exit_code) {
        Ok(0) => 0,
        Ok(code) if (1..=255).contains(&code) => code,
        _ => 1,
    }
}

async fn run(command: &str) -> agent_sandbox::Result<ExecResult> {
    let settings = match std::env::var("SANDBOX_CONFIG") {
        Ok(path) => Settings::load(&PathBuf::from(path))?,
        Err(_) => Settings::default(),
    };
    for warning in settings.validate().into_result()? {
        tracing::warn!(%warning, "settings");
    }

    // Select backend based on environment variable
    let backend = std::env::var("SANDBOX_BACKEND").unwrap_or_else(|_| "local".to_string());
    let provider: Arc<dyn SandboxProvider> = match backend.as_str() {
        "docker" => {
            tracing::info!("using docker backend");
            Arc::new(DockerSandbox::new()?)
        }
        _ => {
            tracing::info!("using local backend");
            Arc::new(LocalSandbox::new(None))
        }
    };

    let manager =
        SandboxManager::with_sandbox_defaults(settings.manager, settings.sandbox, provider)?;
    manager.start();

    let result = async {
        let id = manager.create_sandbox(None).await?;
        let output = manager.run(&id, command).await?;
        if let Ok(stats) = serde_json::to_string(&manager.stats()) {
            tracing::debug!(%stats, "manager stats");
        }
        Ok::<_, agent_sandbox::Error>(output)
    }
    .await;

    manager.cleanup().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(exit_code: i64) -> ExecResult {
        ExecResult {
            output: String::new(),
            exit_code,
        }
    }

    #[test]
    fn exit_code_follows_command_status() {
        assert_eq!(exit_code(&status(0)), 0);
        assert_eq!(exit_code(&status(3)), 3);
        assert_eq!(exit_code(&status(255)), 255);
    }

    #[test]
    fn exit_code_stays_non_zero_for_unreportable_status() {
        assert_eq!(exit_code(&status(-1)), 1);
        assert_eq!(exit_code(&status(256)), 1);
        assert_eq!(exit_code(&status(i64::MAX)), 1);
    }
}
