//! Run outcomes and the published loop state.

use std::fmt;

use crate::error::{CANCEL_CODE, EXCEPTION_CODE, OK_CODE, ScriptError, TIMEOUT_CODE};

// ─────────────────────────────────────────────────────────────────────────────
// Loop State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of an event loop, observable from any thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    /// The loop is running or has not started yet
    Running = 0,
    /// Drained to empty, or stopped by an explicit exit
    Ok = 1,
    /// Stopped by an external cancellation request
    Cancelled = 2,
    /// Stopped by an unhandled exception
    Failed = 3,
}

impl LoopState {
    /// Convert from u8
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Ok,
            2 => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != LoopState::Running
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Running => write!(f, "running"),
            LoopState::Ok => write!(f, "ok"),
            LoopState::Cancelled => write!(f, "cancelled"),
            LoopState::Failed => write!(f, "failed"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Script Status
// ─────────────────────────────────────────────────────────────────────────────

/// Final outcome of a loop run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStatus {
    /// Nothing left to do
    Ok,
    /// Guest code requested termination with this code
    Exit(i32),
    /// An external cancellation request was observed
    Cancelled,
    /// An exception was not handled by the fatal handler
    Failed(ScriptError),
}

impl ScriptStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            ScriptStatus::Ok => OK_CODE,
            ScriptStatus::Exit(code) => *code,
            ScriptStatus::Cancelled => CANCEL_CODE,
            ScriptStatus::Failed(err) if err.is_timeout() => TIMEOUT_CODE,
            ScriptStatus::Failed(_) => EXCEPTION_CODE,
        }
    }

    pub fn state(&self) -> LoopState {
        match self {
            ScriptStatus::Ok | ScriptStatus::Exit(_) => LoopState::Ok,
            ScriptStatus::Cancelled => LoopState::Cancelled,
            ScriptStatus::Failed(_) => LoopState::Failed,
        }
    }

    /// The exception that ended the run, if any.
    pub fn cause(&self) -> Option<&ScriptError> {
        match self {
            ScriptStatus::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.state() == LoopState::Ok
    }
}

impl fmt::Display for ScriptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptStatus::Ok => write!(f, "ok"),
            ScriptStatus::Exit(code) => write!(f, "exit({})", code),
            ScriptStatus::Cancelled => write!(f, "cancelled"),
            ScriptStatus::Failed(err) => write!(f, "failed: {}", err.message()),
        }
    }
}
