// ABOUTME: Error taxonomy for supervising workers.
// ABOUTME: Launch, handshake and probe failures are usually recorded in health state, not returned.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("unknown worker: {0}")]
    NotFound(String),

    /// The worker was rejected while loading the configuration.
    #[error("worker {id} has an invalid configuration: {}", .reasons.join("; "))]
    Configuration { id: String, reasons: Vec<String> },

    /// No free port, or the concurrent worker limit is reached.
    #[error("{0}")]
    ResourceExhausted(String),

    #[error("{message}")]
    Launch { id: String, message: String },

    #[error("Handshake failed: {message}")]
    Handshake { id: String, message: String },

    #[error("Health probe failed: {message}")]
    Probe { id: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl SupervisorError {
    /// The worker this error concerns, when there is one.
    pub fn worker(&self) -> Option<&str> {
        match self {
            Self::NotFound(id) => Some(id),
            Self::Configuration { id, .. }
            | Self::Launch { id, .. }
            | Self::Handshake { id, .. }
            | Self::Probe { id, .. } => Some(id),
            Self::ResourceExhausted(_) | Self::Internal(_) => None,
        }
    }
}
