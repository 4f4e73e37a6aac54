//! Error types for relayctl

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Bad port, domain or mode combination; raised before any side effect
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced domain or resource is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// An external client or utility failed to install or run
    #[error("{}", format_tool_error(.tool, .code, .output))]
    ExternalTool {
        tool: String,
        code: Option<i32>,
        output: String,
    },

    /// Mutually exclusive modes requested together, or a duplicate registration
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A multi-step operation stopped partway
    #[error("Step '{step}' failed after {completed} completed step(s): {reason}")]
    PartialApply {
        step: String,
        completed: usize,
        reason: String,
    },

    /// Certificate material is unusable (parse, mismatch)
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Certificate parsed and matched but its validity period has ended
    #[error("Certificate for {domain} expired at {not_after}")]
    CertificateExpired { domain: String, not_after: String },

    /// HTTP or DNS failure while probing the network
    #[error("Network error: {0}")]
    Network(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// D-Bus connection or registration failure
    #[error("Service error: {0}")]
    Service(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn format_tool_error(tool: &str, code: &Option<i32>, output: &str) -> String {
    match code {
        Some(code) => format!("'{}' failed with code {}: {}", tool, code, output.trim()),
        None => format!("'{}' failed: {}", tool, output.trim()),
    }
}

impl RelayError {
    /// True for errors raised before any side effect was attempted
    pub fn is_validation(&self) -> bool {
        matches!(self, RelayError::Validation(_))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(error: serde_json::Error) -> Self {
        RelayError::Parse(error.to_string())
    }
}

impl From<openssl::error::ErrorStack> for RelayError {
    fn from(error: openssl::error::ErrorStack) -> Self {
        RelayError::Certificate(error.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(error: reqwest::Error) -> Self {
        RelayError::Network(error.to_string())
    }
}

impl From<zbus::Error> for RelayError {
    fn from(error: zbus::Error) -> Self {
        RelayError::Service(error.to_string())
    }
}

impl From<RelayError> for zbus::fdo::Error {
    fn from(error: RelayError) -> Self {
        match error {
            RelayError::Validation(msg) => zbus::fdo::Error::InvalidArgs(msg),
            other => zbus::fdo::Error::Failed(other.to_string()),
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_display_includes_output() {
        let err = RelayError::ExternalTool {
            tool: "iptables -t nat -N RELAY_PROXY".to_string(),
            code: Some(1),
            output: "iptables: Chain already exists.\n".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "'iptables -t nat -N RELAY_PROXY' failed with code 1: iptables: Chain already exists."
        );
    }

    #[test]
    fn test_partial_apply_names_step() {
        let err = RelayError::PartialApply {
            step: "connect".to_string(),
            completed: 1,
            reason: "timeout".to_string(),
        };
        assert!(err.to_string().contains("'connect'"));
        assert!(err.to_string().contains("1 completed"));
    }

    #[test]
    fn test_validation_maps_to_invalid_args() {
        let err: zbus::fdo::Error = RelayError::Validation("bad port".to_string()).into();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));
    }
}
