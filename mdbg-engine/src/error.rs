// Error types for each engine layer
//
// NativeError: faults reported by (or talking to) the native debugging layer
// EvalError:   expression compilation/resolution/runtime failures and remote faults
// EngineError: errors returned by the session facade

use crate::types::{EvalId, RemoteValue, ThreadId};
use thiserror::Error;

pub type NativeResult<T> = Result<T, NativeError>;
pub type EvalResult<T> = Result<T, EvalError>;
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum NativeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid handshake")]
    InvalidHandshake,

    #[error("Agent error code {0}: {1}")]
    AgentErrorCode(u16, String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("{0} was aborted")]
    EvalAborted(EvalId),
}

#[derive(Debug, Error)]
pub enum EvalError {
    /// Malformed or unsupported expression; it never runs.
    #[error("{0}")]
    Compilation(String),

    /// Unknown identifier, member or type, or a call that matches nothing.
    #[error("{0}")]
    Resolution(String),

    /// Failure while computing locally: overflow, divide by zero, null
    /// dereference, index out of range.
    #[error("{0}")]
    Runtime(String),

    /// The invoked method threw; the exception object stays in the target.
    #[error("evaluation threw {}", .0.type_name)]
    RemoteFault(RemoteValue),

    #[error("evaluation timed out")]
    Timeout,

    #[error(transparent)]
    Native(#[from] NativeError),
}

impl EvalError {
    pub fn compilation(msg: impl Into<String>) -> Self {
        Self::Compilation(msg.into())
    }

    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Native(#[from] NativeError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("invalid variables reference {0}")]
    InvalidReference(i64),

    #[error("invalid frame id {0}")]
    InvalidFrame(i64),

    #[error("no process is attached")]
    NoProcess,

    #[error("process is not stopped")]
    NotStopped,

    #[error("a step is already in progress on thread {0}")]
    StepInProgress(ThreadId),
}
