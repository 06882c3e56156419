//! Infrastructure errors surfaced to callers.
//!
//! A task's own failure is never one of these: it is captured as data
//! ([`CapturedError`](crate::fork::CapturedError)) and delivered through the fork's result.

use std::io;

use crate::coordination::{Method, TransportError};
use crate::fork::{ForkId, ForkStatus};

#[derive(Debug, thiserror::Error)]
pub enum ForkError {
    /// The OS refused to fork (process table or memory exhausted).
    #[error("failed to fork process for fork {id}: {source}")]
    Spawn {
        id: ForkId,
        #[source]
        source: io::Error,
    },

    #[error("failed to start coordination server: {0}")]
    ServerSpawn(#[source] io::Error),

    #[error("no free coordination port in {first}..={last}: {source}")]
    Bind {
        first: u16,
        last: u16,
        #[source]
        source: io::Error,
    },

    #[error("coordination request for {path} failed: {source}")]
    Coordination {
        path: String,
        #[source]
        source: TransportError,
    },

    #[error("invalid fork snapshot at {path}: {source}")]
    Snapshot {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("coordination server refused lease {lease}: replied {reply}")]
    LeaseRefused { lease: String, reply: Method },

    #[error("fork {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: ForkId,
        from: ForkStatus,
        to: ForkStatus,
    },

    #[error("fork {0} has no task to run")]
    MissingTask(ForkId),

    /// Raised by `await_forks` in strict mode.
    #[error("timed out waiting for forks: {}", .forks.join(", "))]
    WaitTimeout { forks: Vec<String> },

    #[error("interrupted while awaiting forks")]
    Interrupted,

    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),

    #[error("invalid value {value:?} for {var}")]
    Config { var: &'static str, value: String },
}

impl ForkError {
    pub(crate) fn coordination(path: impl Into<String>, source: TransportError) -> Self {
        Self::Coordination {
            path: path.into(),
            source,
        }
    }
}
