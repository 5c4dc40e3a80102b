//! Library error type.

use thiserror::Error;

/// Errors caused by a misbehaving engine or incorrect driver usage.
///
/// Cloneable so a terminal analysis failure can surface both from
/// `wait()` and from later `get()` calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine does not support option {name} (available options: {available})")]
    UnknownOption { name: String, available: String },

    #[error("cannot set {0} which is automatically managed")]
    ManagedOption(String),

    #[error("{0}")]
    InvalidValue(String),

    #[error("unknown option type: {0}")]
    UnknownOptionKind(String),

    #[error("invalid move from engine: {0}")]
    InvalidMove(String),

    #[error("engine did not declare required feature: {0}")]
    MissingFeature(&'static str),

    #[error("{0}")]
    Unsupported(String),

    #[error("tried to run command, but engine is not initialized")]
    NotInitialized,

    #[error("engine already initialized")]
    AlreadyInitialized,

    #[error("{0}")]
    Protocol(String),

    #[error("engine command finished before producing a result")]
    NoResult,

    #[error("engine process died unexpectedly (exit code: {code}{hint})")]
    EngineTerminated { code: i32, hint: &'static str },

    #[error("analysis is complete and all information has been consumed")]
    AnalysisComplete,

    #[error("engine operation timed out")]
    Timeout,

    #[error("command was preempted by a later command")]
    Cancelled,

    #[error("engine event loop dead")]
    Shutdown,

    #[error("engine I/O failed: {0}")]
    Io(String),
}

impl EngineError {
    pub(crate) fn terminated(code: i32) -> EngineError {
        // -4 is SIGILL on Unix, 0xC000001D is STATUS_ILLEGAL_INSTRUCTION.
        let hint = if code == -4 || code as u32 == 0xC000_001D {
            ", binary not compatible with cpu?"
        } else {
            ""
        };
        EngineError::EngineTerminated { code, hint }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<crate::board::InvalidMoveError> for EngineError {
    fn from(err: crate::board::InvalidMoveError) -> Self {
        EngineError::InvalidMove(err.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_hint() {
        let err = EngineError::terminated(-4);
        assert!(err.to_string().contains("binary not compatible with cpu?"));
        let err = EngineError::terminated(0xC000_001Du32 as i32);
        assert!(err.to_string().contains("binary not compatible with cpu?"));
        let err = EngineError::terminated(1);
        assert_eq!(err.to_string(), "engine process died unexpectedly (exit code: 1)");
    }
}
