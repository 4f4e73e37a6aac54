//! External tool gateway
//!
//! Every process this agent spawns (the issuance client, the proxy client,
//! iptables, sysctl, the container runtime) goes through a [`ToolGateway`].
//! Core logic only ever sees captured text output, which is what lets the
//! components be exercised against [`ScriptedGateway`] instead of the host.

mod scripted;

pub use scripted::{ScriptedGateway, ToolCall};

use crate::error::{RelayError, RelayResult};
use crate::validation::sanitize_error_message;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Captured result of one external invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, `None` if the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr joined, for diagnostics
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim(), self.stderr.trim()),
            (false, true) => self.stdout.trim().to_string(),
            _ => self.stderr.trim().to_string(),
        }
    }
}

/// Narrow process boundary: run a program, or check that it exists
#[async_trait]
pub trait ToolGateway: Send + Sync {
    /// Run `program` with `args` to completion and capture its output.
    ///
    /// A non-zero exit is *not* an error at this level; only failure to
    /// spawn the process is.
    async fn run(&self, program: &str, args: &[&str]) -> RelayResult<ToolOutput>;

    /// Check whether a binary is resolvable on this host
    async fn is_available(&self, binary: &str) -> bool;
}

/// Run a command and turn a non-zero exit into [`RelayError::ExternalTool`]
pub async fn run_checked(
    gateway: &dyn ToolGateway,
    program: &str,
    args: &[&str],
) -> RelayResult<ToolOutput> {
    let output = gateway.run(program, args).await?;
    if !output.success() {
        return Err(RelayError::ExternalTool {
            tool: format!("{} {}", program, args.join(" ")),
            code: output.code,
            output: sanitize_error_message(&output.combined()),
        });
    }
    Ok(output)
}

/// Gateway that spawns real processes with `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct SystemGateway;

impl SystemGateway {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolGateway for SystemGateway {
    async fn run(&self, program: &str, args: &[&str]) -> RelayResult<ToolOutput> {
        debug!("exec: {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| RelayError::ExternalTool {
                tool: program.to_string(),
                code: None,
                output: format!("failed to spawn: {}", e),
            })?;

        let result = ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if !result.success() {
            debug!("{} exited with {:?}: {}", program, result.code, result.stderr.trim());
        }

        Ok(result)
    }

    async fn is_available(&self, binary: &str) -> bool {
        match Command::new("which").arg(binary).output().await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output() {
        let out = ToolOutput {
            code: Some(1),
            stdout: "partial\n".to_string(),
            stderr: "boom\n".to_string(),
        };
        assert_eq!(out.combined(), "partial\nboom");
        assert_eq!(ToolOutput::failed(2, "only err").combined(), "only err");
    }

    #[tokio::test]
    async fn test_run_checked_maps_failure() {
        let gateway = ScriptedGateway::new(|_, _| ToolOutput::failed(3, "nope"));
        let err = run_checked(&gateway, "sysctl", &["-w", "net.ipv4.ip_forward=1"])
            .await
            .unwrap_err();

        match err {
            RelayError::ExternalTool { tool, code, output } => {
                assert_eq!(tool, "sysctl -w net.ipv4.ip_forward=1");
                assert_eq!(code, Some(3));
                assert_eq!(output, "nope");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_system_gateway_captures_output() {
        let gateway = SystemGateway::new();
        let output = gateway.run("sh", &["-c", "echo hello; exit 4"]).await.unwrap();
        assert_eq!(output.code, Some(4));
        assert_eq!(output.stdout.trim(), "hello");
        assert!(!gateway.is_available("definitely-not-a-real-binary-xyz").await);
    }
}
