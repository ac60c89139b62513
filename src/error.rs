use std::process::ExitCode;

use crate::coordinator::ClaimError;
use crate::store::StoreError;

/// Errors that cause handshake to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Store(String),

    #[error("{0}")]
    Contended(String),

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("command not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Config(_) => ExitCode::from(2),
            Self::Store(_) => ExitCode::from(3),
            Self::Contended(_) => ExitCode::from(4),
            Self::Timeout { .. } => ExitCode::from(5),
            Self::ToolNotFound { .. } => ExitCode::from(6),
            Self::ToolFailed { .. } => ExitCode::from(7),
            Self::Other(_) => ExitCode::from(1),
        }
    }
}

impl From<StoreError> for ExitError {
    fn from(e: StoreError) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<ClaimError> for ExitError {
    fn from(e: ClaimError) -> Self {
        match e {
            ClaimError::Store(e) => e.into(),
            e @ ClaimError::Contended { .. } => Self::Contended(e.to_string()),
        }
    }
}
