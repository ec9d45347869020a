use std::time::Duration;
use thiserror::Error;

/// Failures reported by an automation target through the capability contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("Attach failed: {0}")]
    Attach(String),

    #[error("Module not found: {0}")]
    NotFound(String),

    #[error("Module locked: {0}")]
    Locked(String),

    #[error("Target disconnected: {0}")]
    Disconnected(String),

    #[error("Target busy: {0}")]
    Busy(String),

    #[error("Not supported by target: {0}")]
    Unsupported(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("Call '{operation}' timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Call '{0}' cancelled")]
    Cancelled(&'static str),

    #[error("Bridge closed")]
    Closed,

    #[error("Unexpected reply to '{0}'")]
    UnexpectedReply(&'static str),
}

impl BridgeError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Timeout { .. } | BridgeError::Adapter(AdapterError::Busy(_))
        )
    }

    /// Whether the connection to the target is gone and a re-attach is needed.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            BridgeError::Adapter(AdapterError::Disconnected(_)) | BridgeError::Closed
        )
    }
}

#[derive(Error, Debug)]
pub enum DebugError {
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Cannot attach to target: {0}")]
    Attach(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Breakpoint injection failed at {module}:{line}: {reason}")]
    InjectionFailed {
        module: String,
        line: u32,
        reason: String,
    },

    #[error("Breakpoint state out of sync at {module}:{line}: {detail}")]
    StateDesync {
        module: String,
        line: u32,
        detail: String,
    },

    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("'{command}' is not valid while the session is {state}")]
    InvalidState { command: String, state: String },

    #[error("Too many consecutive failures ({failures}); session degraded")]
    CircuitOpen { failures: u32 },

    #[error("Unknown stack frame {frame}")]
    UnknownFrame { frame: u64 },
}

impl DebugError {
    pub fn injection_failed(module: impl Into<String>, line: u32, reason: impl Into<String>) -> Self {
        Self::InjectionFailed {
            module: module.into(),
            line,
            reason: reason.into(),
        }
    }

    pub fn invalid_state(command: impl Into<String>, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            command: command.into(),
            state: state.to_string(),
        }
    }

    /// Errors that end the session instead of failing a single request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DebugError::Transport(_)
                | DebugError::ReconnectExhausted { .. }
                | DebugError::CircuitOpen { .. }
        )
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, DebugError::Bridge(e) if e.is_disconnect())
    }
}
