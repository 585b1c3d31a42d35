//! Error types for the event loop.
//!
//! Two families live here. `ScriptError` and `Throw` describe what guest code
//! does to a dispatched unit (raise an exception or request termination);
//! they never escape the loop except as the cause of a failed run.
//! `LoopError` covers host-side failures of the loop machinery itself.

use std::fmt;

use crate::poller::SourceKey;

/// Exit code reported for a clean run.
pub const OK_CODE: i32 = 0;
/// Exit code reported when an unhandled exception ended the run.
pub const EXCEPTION_CODE: i32 = -1;
/// Exit code reported when the run was cancelled from outside.
pub const CANCEL_CODE: i32 = -2;
/// Exit code reported when a unit overran the script time limit.
pub const TIMEOUT_CODE: i32 = -3;

/// An exception raised by guest code while a unit was being dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    message: String,
    stack: Option<String>,
    timed_out: bool,
}

impl ScriptError {
    /// Create an error carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            timed_out: false,
        }
    }

    /// Attach the guest-side stack trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// The error raised when a unit exceeds the script time limit.
    pub fn timeout() -> Self {
        Self {
            message: "Script timed out".to_string(),
            stack: None,
            timed_out: true,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    /// Whether this error was produced by the watchdog.
    pub fn is_timeout(&self) -> bool {
        self.timed_out
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(stack) = &self.stack {
            write!(f, "\n{}", stack)?;
        }
        Ok(())
    }
}

impl std::error::Error for ScriptError {}

/// Abrupt completion of a dispatched unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Throw {
    /// Guest code raised an exception. Routed through the fatal handler.
    Exception(ScriptError),
    /// Guest code asked the process to exit with the given code.
    /// Bypasses the fatal handler and stops the loop.
    Exit(i32),
}

impl Throw {
    /// Shorthand for raising an exception with a message.
    pub fn error(message: impl Into<String>) -> Self {
        Throw::Exception(ScriptError::new(message))
    }

    /// Shorthand for the guest exit primitive.
    pub fn exit(code: i32) -> Self {
        Throw::Exit(code)
    }
}

impl From<ScriptError> for Throw {
    fn from(err: ScriptError) -> Self {
        Throw::Exception(err)
    }
}

impl fmt::Display for Throw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Throw::Exception(err) => write!(f, "{}", err),
            Throw::Exit(code) => write!(f, "exit({})", code),
        }
    }
}

/// Result of running guest code on the loop thread.
pub type GuestResult<T = ()> = Result<T, Throw>;

/// Errors raised by the loop machinery.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("Failed to create I/O poller: {0}")]
    Poller(#[source] std::io::Error),

    #[error("I/O registration failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Event loop thread panicked")]
    ThreadPanic,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Unpaired unpin: pin count would drop to {0}")]
    PinUnderflow(i64),

    #[error("I/O source not registered: {0:?}")]
    UnknownSource(SourceKey),

    #[error("Invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_display_includes_stack() {
        let err = ScriptError::new("boom").with_stack("at main (index.js:1:1)");
        assert_eq!(err.to_string(), "boom\nat main (index.js:1:1)");
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_timeout_error_is_marked() {
        let err = ScriptError::timeout();
        assert!(err.is_timeout());
        assert_eq!(err.stack(), None);
    }

    #[test]
    fn test_throw_from_script_error() {
        let throw: Throw = ScriptError::new("bad").into();
        assert_eq!(throw, Throw::Exception(ScriptError::new("bad")));
        assert_eq!(Throw::exit(3).to_string(), "exit(3)");
    }
}
