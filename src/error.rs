//! Crate-wide error taxonomy.
//!
//! Mirrors the kinds laid out by the lifecycle design: `InvalidArgument`
//! and `NotFound` map to 4xx at the HTTP boundary, everything else to 500.
//! Teardown paths never propagate these; they log and continue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("networking: {0}")]
    Networking(String),

    #[error("hypervisor: {0}")]
    Hypervisor(String),

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::InvalidArgument(format!("malformed JSON: {e}"))
    }
}

impl AgentError {
    /// HTTP status code this error kind maps to, per the error handling design.
    pub fn status_code(&self) -> u16 {
        match self {
            AgentError::InvalidArgument(_) => 400,
            AgentError::NotFound(_) => 404,
            AgentError::Conflict(_) => 409,
            AgentError::Storage(_)
            | AgentError::Networking(_)
            | AgentError::Hypervisor(_)
            | AgentError::Internal(_) => 500,
        }
    }
}
