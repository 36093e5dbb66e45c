//! Errors surfaced by the bridge to its callers.

use std::time::Duration;

use crate::bridge::codec::EncodingError;
use crate::supervisor::ProcessState;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid outgoing message: {0}")]
    Encoding(#[from] EncodingError),

    #[error("engine did not answer '{id}' within {}ms", .timeout.as_millis())]
    EngineTimeout { id: String, timeout: Duration },

    #[error("engine rejected '{id}'{}: {message}", .code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default())]
    EngineError {
        id: String,
        code: Option<String>,
        message: String,
    },

    #[error("engine process crashed before answering '{id}'")]
    ProcessCrashed { id: String },

    #[error("write queue saturated ({depth} messages pending)")]
    BridgeSaturated { depth: usize },

    #[error("engine failed to start: {0}")]
    StartupFailure(String),

    #[error("engine restart budget exhausted ({restarts} restarts within {}s)", .window.as_secs())]
    RestartBudgetExhausted { restarts: u32, window: Duration },

    #[error("engine is not running (state: {0})")]
    NotRunning(ProcessState),

    #[error("engine was stopped before answering '{id}'")]
    EngineStopped { id: String },

    #[error("request '{0}' is already pending")]
    DuplicateRequest(String),

    #[error("bridge has been disposed")]
    Disposed,
}

impl BridgeError {
    /// Terminal for the bridge instance: the engine will not come back on its own.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StartupFailure(_) | Self::RestartBudgetExhausted { .. }
        )
    }

    /// Request id this error belongs to, for per-request failures.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::EngineTimeout { id, .. }
            | Self::EngineError { id, .. }
            | Self::ProcessCrashed { id }
            | Self::EngineStopped { id } => Some(id),
            Self::DuplicateRequest(id) => Some(id),
            _ => None,
        }
    }
}
