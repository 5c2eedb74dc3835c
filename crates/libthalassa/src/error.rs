use std::time::Duration;

use thalassa_protocol::{EnvironmentState, ErrorCode};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("environment {0} has a transition in progress")]
    EnvironmentBusy(String),

    #[error("environment {name} is {state}, operation requires {required}")]
    EnvironmentNotReady {
        name: String,
        state: EnvironmentState,
        required: &'static str,
    },

    #[error("environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("environment already exists: {0}")]
    EnvironmentExists(String),

    #[error("invalid environment name: {0:?}")]
    InvalidName(String),

    #[error("unknown ship template: {0}")]
    UnknownShip(String),

    #[error("agent session already active for {0}")]
    SessionAlreadyActive(String),

    #[error("agent session for {0} is not ready")]
    SessionNotReady(String),

    #[error("no agent session for {0}")]
    SessionNotFound(String),

    #[error("agent session for {0} was lost")]
    SessionLost(String),

    #[error("timed out while {operation} after {}ms", .after.as_millis())]
    TimedOut { operation: String, after: Duration },

    #[error("engine failure: {0}")]
    EngineFailure(String),

    #[error("environment {name} drifted: believed {believed}, observed {observed}")]
    ReconcileDrift {
        name: String,
        believed: EnvironmentState,
        observed: String,
    },

    #[error("agent error {code}: {message}")]
    AgentError { code: i64, message: String },

    #[error("agent protocol error: {0}")]
    AgentProtocol(String),

    #[error("history store error: {0}")]
    Store(String),
}

impl OrchestratorError {
    pub fn timed_out(operation: impl Into<String>, after: Duration) -> Self {
        Self::TimedOut {
            operation: operation.into(),
            after,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::EnvironmentBusy(_) => ErrorCode::EnvironmentBusy,
            Self::EnvironmentNotReady { .. } => ErrorCode::EnvironmentNotReady,
            Self::EnvironmentNotFound(_) => ErrorCode::EnvironmentNotFound,
            Self::EnvironmentExists(_) => ErrorCode::EnvironmentExists,
            Self::InvalidName(_) => ErrorCode::InvalidRequest,
            Self::UnknownShip(_) => ErrorCode::UnknownShip,
            Self::SessionAlreadyActive(_) => ErrorCode::SessionAlreadyActive,
            Self::SessionNotReady(_) => ErrorCode::SessionNotReady,
            Self::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Self::SessionLost(_) => ErrorCode::SessionLost,
            Self::TimedOut { .. } => ErrorCode::TimedOut,
            Self::EngineFailure(_) => ErrorCode::EngineFailure,
            Self::ReconcileDrift { .. } => ErrorCode::ReconcileDrift,
            Self::AgentError { .. } | Self::AgentProtocol(_) => ErrorCode::AgentError,
            Self::Store(_) => ErrorCode::ServerError,
        }
    }

    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            Self::Store(_) => (ErrorCode::ServerError, "history store unavailable".to_string()),
            other => (other.code(), other.to_string()),
        }
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::EnvironmentBusy(_)
                | Self::SessionNotReady(_)
                | Self::SessionLost(_)
                | Self::TimedOut { .. }
        )
    }
}

/// Failures reported by the container engine collaborator.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{command} exited with {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("container {0} not found")]
    NotFound(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EngineError> for OrchestratorError {
    fn from(err: EngineError) -> Self {
        OrchestratorError::EngineFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_sanitized() {
        let err = OrchestratorError::Store("disk I/O error at /secret/path".to_string());
        let (code, message) = err.to_error_code();
        assert_eq!(code, ErrorCode::ServerError);
        assert!(!message.contains("/secret"));
    }

    #[test]
    fn transient_classification() {
        assert!(OrchestratorError::EnvironmentBusy("a".into()).is_transient());
        assert!(OrchestratorError::timed_out("launching a", Duration::from_secs(1)).is_transient());
        assert!(!OrchestratorError::SessionAlreadyActive("a".into()).is_transient());
        assert!(!OrchestratorError::EngineFailure("x".into()).is_transient());
    }

    #[test]
    fn engine_errors_become_engine_failure() {
        let err: OrchestratorError = EngineError::NotFound("thalassa-alpha".into()).into();
        assert_eq!(err.code(), ErrorCode::EngineFailure);
        assert!(err.to_string().contains("thalassa-alpha"));
    }
}
