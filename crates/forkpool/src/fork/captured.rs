//! Task failures as plain data.
//!
//! A failure raised inside a forked child has to cross a process boundary as JSON, so it is
//! flattened into a [`CapturedError`]: message, numeric code, trace text, a kind label and
//! (when known) the source location. Decoding one never runs code; it only restores fields.

use std::any::{Any, type_name};
use std::fmt;
use std::panic::Location;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Code for failures raised by the fork machinery rather than by the task.
pub const FORK_ERROR_CODE: i64 = 171;
/// Code recorded for a task that panicked.
pub const PANIC_CODE: i64 = 101;

/// Kind labels used for failures the task did not raise itself.
pub mod kind {
    pub const PANIC: &str = "panic";
    pub const TIMEOUT: &str = "timeout";
    /// The child exited without reporting a result.
    pub const EXITED: &str = "exited";
    pub const TERMINATED: &str = "terminated";
    /// The OS refused to fork.
    pub const FORK: &str = "fork";
    /// The child's report could not be decoded.
    pub const SNAPSHOT: &str = "snapshot";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedError {
    message: String,
    code: i64,
    #[serde(default)]
    trace: String,
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
}

impl CapturedError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, code: i64) -> Self {
        Self {
            message: message.into(),
            code,
            trace: String::new(),
            kind: kind.into(),
            file: None,
            line: None,
        }
    }

    /// Flatten an error chain.
    ///
    /// `kind` is the task's declared error type. When the chain holds a [`TaskFailure`], an
    /// `io::Error` or a `serde_json::Error`, the first of those found names the kind instead,
    /// so a task returning `anyhow::Result` still reports where its failure came from.
    ///
    /// The code comes from that error: a [`TaskFailure`]'s code or the OS error code, else 0.
    /// The trace is the alternate debug rendering: the cause chain, plus a backtrace when
    /// `RUST_BACKTRACE` enables one.
    pub fn from_error(kind: impl Into<String>, error: &anyhow::Error) -> Self {
        let mut captured = Self::new(kind, error.to_string(), 0);
        captured.trace = format!("{error:?}");

        for cause in error.chain() {
            if let Some(failure) = cause.downcast_ref::<TaskFailure>() {
                captured.kind = type_name::<TaskFailure>().to_string();
                captured.code = failure.code;
                captured.file = Some(failure.location.file().to_string());
                captured.line = Some(failure.location.line());
                break;
            }
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                captured.kind = type_name::<std::io::Error>().to_string();
                captured.code = io.raw_os_error().map_or(0, i64::from);
                break;
            }
            if cause.is::<serde_json::Error>() {
                captured.kind = type_name::<serde_json::Error>().to_string();
                break;
            }
        }
        captured
    }

    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };
        Self::new(kind::PANIC, message, PANIC_CODE)
    }

    pub(crate) fn timeout(elapsed: Duration, limit: Duration) -> Self {
        Self::new(
            kind::TIMEOUT,
            format!("fork ran for {elapsed:.1?}, past its {limit:?} limit"),
            FORK_ERROR_CODE,
        )
    }

    pub(crate) fn exited(status: impl fmt::Display) -> Self {
        Self::new(
            kind::EXITED,
            format!("child exited without reporting a result ({status})"),
            FORK_ERROR_CODE,
        )
    }

    pub(crate) fn terminated() -> Self {
        Self::new(kind::TERMINATED, "fork was terminated", FORK_ERROR_CODE)
    }

    pub(crate) fn fork_failed(error: impl fmt::Display) -> Self {
        Self::new(kind::FORK, format!("failed to fork: {error}"), FORK_ERROR_CODE)
    }

    pub(crate) fn snapshot(error: impl fmt::Display) -> Self {
        Self::new(
            kind::SNAPSHOT,
            format!("unreadable fork report: {error}"),
            FORK_ERROR_CODE,
        )
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> i64 {
        self.code
    }

    pub fn trace(&self) -> &str {
        &self.trace
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    pub fn line(&self) -> Option<u32> {
        self.line
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == kind::TIMEOUT
    }
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.kind, self.message)?;
        if let (Some(file), Some(line)) = (&self.file, self.line) {
            write!(f, " at {file}:{line}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CapturedError {}

/// An error a task can return to set the captured code and record where it was raised.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TaskFailure {
    message: String,
    code: i64,
    location: &'static Location<'static>,
}

impl TaskFailure {
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_code(message, 0)
    }

    #[track_caller]
    pub fn with_code(message: impl Into<String>, code: i64) -> Self {
        Self {
            message: message.into(),
            code,
            location: Location::caller(),
        }
    }

    pub fn code(&self) -> i64 {
        self.code
    }
}
