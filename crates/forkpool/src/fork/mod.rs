//! Fork handles.
//!
//! A [`ForkHandle`] owns one unit of work and its lifecycle:
//!
//! ```text
//! NOT_STARTED ──execute──► IN_PROGRESS ──poll_status──► COMPLETE | ERROR
//! ```
//!
//! Two backends run the work behind the same interface. The asynchronous one forks a
//! child process that reports its result through the coordination server; the synchronous
//! one runs the task inline. Status only moves forward, and a result's callback fires once,
//! in the process that created the handle.

#[cfg(unix)]
mod asynchronous;
mod captured;
mod synchronous;

use std::any::type_name;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

pub use captured::{CapturedError, FORK_ERROR_CODE, PANIC_CODE, TaskFailure, kind};

#[cfg(unix)]
pub(crate) use asynchronous::AsynchronousFork;

use crate::error::ForkError;

/// Sequential per manager, starting at 1. Orders results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForkId(u64);

impl ForkId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ForkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForkStatus {
    NotStarted,
    InProgress,
    Complete,
    Error,
}

impl ForkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::InProgress => 1,
            Self::Complete | Self::Error => 2,
        }
    }

    /// Forward moves only; a terminal status is final.
    pub fn can_become(self, next: Self) -> bool {
        next == self || (!self.is_terminal() && next.rank() > self.rank())
    }
}

impl fmt::Display for ForkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the fork a handle lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Parent,
    Child,
}

/// What a finished fork produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum ForkOutcome {
    Success(Value),
    Failure(CapturedError),
}

impl ForkOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&CapturedError> {
        match self {
            Self::Success(_) => None,
            Self::Failure(error) => Some(error),
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failure(_) => None,
        }
    }

    fn status(&self) -> ForkStatus {
        match self {
            Self::Success(_) => ForkStatus::Complete,
            Self::Failure(_) => ForkStatus::Error,
        }
    }
}

pub type SuccessCallback = Box<dyn FnOnce(&Value, &ForkHandle)>;
pub type ErrorCallback = Box<dyn FnOnce(&CapturedError, &ForkHandle)>;

pub(crate) type Task = Box<dyn FnOnce(&mut ForkHandle) -> Result<Value, CapturedError>>;

/// Wrap a typed task: serialize its value, flatten its error.
pub(crate) fn boxed_task<F, T, E>(task: F) -> Task
where
    F: FnOnce(&mut ForkHandle) -> Result<T, E> + 'static,
    T: Serialize,
    E: Into<anyhow::Error>,
{
    Box::new(move |fork: &mut ForkHandle| match task(fork) {
        Ok(value) => serde_json::to_value(value).map_err(|e| {
            CapturedError::from_error(type_name::<serde_json::Error>(), &anyhow::Error::new(e))
        }),
        Err(e) => Err(CapturedError::from_error(type_name::<E>(), &e.into())),
    })
}

/// Run a task; a panic is captured like any other failure.
fn run_task(task: Task, fork: &mut ForkHandle) -> ForkOutcome {
    match catch_unwind(AssertUnwindSafe(|| task(fork))) {
        Ok(Ok(value)) => ForkOutcome::Success(value),
        Ok(Err(error)) => ForkOutcome::Failure(error),
        Err(payload) => ForkOutcome::Failure(CapturedError::from_panic(payload.as_ref())),
    }
}

/// The state a child reports for its handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ForkSnapshot {
    id: ForkId,
    label: String,
    status: ForkStatus,
    result: Option<ForkOutcome>,
    finished_at: Option<DateTime<Utc>>,
}

pub(crate) enum ForkMode {
    #[cfg(unix)]
    Asynchronous(AsynchronousFork),
    Synchronous,
}

pub struct ForkHandle {
    id: ForkId,
    label: String,
    status: ForkStatus,
    result: Option<ForkOutcome>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    wait_timeout: Duration,
    task: Option<Task>,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
    mode: ForkMode,
}

impl fmt::Debug for ForkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkHandle")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("status", &self.status)
            .field("pid", &self.pid())
            .field("role", &self.role())
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

impl ForkHandle {
    /// A handle without an id yet; the manager assigns one with [`set_id`](Self::set_id).
    pub(crate) fn new(mode: ForkMode, wait_timeout: Duration) -> Self {
        Self {
            id: ForkId(0),
            label: String::new(),
            status: ForkStatus::NotStarted,
            result: None,
            started_at: None,
            finished_at: None,
            started: None,
            wait_timeout,
            task: None,
            on_success: None,
            on_error: None,
            mode,
        }
    }

    pub fn id(&self) -> ForkId {
        self.id
    }

    /// Assign the manager-scoped id. Also sets the default label if none was given.
    pub(crate) fn set_id(&mut self, id: ForkId) -> &mut Self {
        self.id = id;
        if self.label.is_empty() {
            self.label = format!("fork {id}");
        }
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_label(&mut self, label: impl Into<String>) -> &mut Self {
        self.label = label.into();
        self
    }

    /// Last known status. Call [`poll_status`](Self::poll_status) to refresh.
    pub fn status(&self) -> ForkStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ForkStatus) -> Result<&mut Self, ForkError> {
        if !self.status.can_become(status) {
            return Err(ForkError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        Ok(self)
    }

    pub fn result(&self) -> Option<&ForkOutcome> {
        self.result.as_ref()
    }

    pub fn set_result(&mut self, outcome: ForkOutcome) -> &mut Self {
        self.result = Some(outcome);
        self
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.started.map(|s| s.elapsed())
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    pub(crate) fn set_wait_timeout(&mut self, timeout: Duration) {
        self.wait_timeout = timeout;
    }

    /// Child process id, once an asynchronous fork has started.
    pub fn pid(&self) -> Option<i32> {
        match &self.mode {
            #[cfg(unix)]
            ForkMode::Asynchronous(state) => state.pid(),
            ForkMode::Synchronous => None,
        }
    }

    pub fn role(&self) -> Role {
        match &self.mode {
            #[cfg(unix)]
            ForkMode::Asynchronous(state) => state.role(),
            ForkMode::Synchronous => Role::Parent,
        }
    }

    pub fn is_asynchronous(&self) -> bool {
        !matches!(self.mode, ForkMode::Synchronous)
    }

    pub(crate) fn set_task(&mut self, task: Task) {
        self.task = Some(task);
    }

    pub(crate) fn has_task(&self) -> bool {
        self.task.is_some()
    }

    /// Attach a success callback. If the fork already completed it fires on the next poll.
    pub fn on_success<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnOnce(&Value, &ForkHandle) + 'static,
    {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_error<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnOnce(&CapturedError, &ForkHandle) + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Start the task. Asynchronous forks return as soon as the child exists; synchronous
    /// ones return with the task finished and its callback fired.
    pub fn execute(&mut self) -> Result<&mut Self, ForkError> {
        if self.status != ForkStatus::NotStarted {
            return Err(ForkError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: ForkStatus::InProgress,
            });
        }
        let task = self.task.take().ok_or(ForkError::MissingTask(self.id))?;
        self.status = ForkStatus::InProgress;
        self.started_at = Some(Utc::now());
        self.started = Some(Instant::now());

        match &self.mode {
            #[cfg(unix)]
            ForkMode::Asynchronous(state) => {
                let client = state.client().clone();
                asynchronous::execute(self, client, task)?;
            }
            ForkMode::Synchronous => synchronous::execute(self, task),
        }
        Ok(self)
    }

    /// Refresh the status and fire any pending callback.
    pub fn poll_status(&mut self) -> Result<ForkStatus, ForkError> {
        let polled = match &self.mode {
            #[cfg(unix)]
            ForkMode::Asynchronous(_) => asynchronous::poll(self),
            ForkMode::Synchronous => {
                synchronous::poll(self);
                Ok(())
            }
        };
        self.settle();
        polled.map(|()| self.status)
    }

    /// Stop an in-progress fork. A no-op for synchronous forks.
    pub fn terminate(&mut self) -> Result<&mut Self, ForkError> {
        match &self.mode {
            #[cfg(unix)]
            ForkMode::Asynchronous(_) => asynchronous::terminate(self),
            ForkMode::Synchronous => {}
        }
        self.settle();
        Ok(self)
    }

    fn finish(&mut self, outcome: ForkOutcome) {
        self.conclude(outcome.status(), Some(outcome));
    }

    /// Move to a terminal status. A handle that is already terminal keeps its status; it only
    /// picks up an outcome it is missing, and only one that agrees with that status.
    fn conclude(&mut self, status: ForkStatus, outcome: Option<ForkOutcome>) {
        if self.status.is_terminal() {
            let agrees = outcome.as_ref().is_some_and(|o| o.status() == self.status);
            if self.result.is_none() && agrees {
                self.result = outcome;
            } else if self.status != status || outcome.is_some() {
                warn!(
                    fork_id = %self.id,
                    label = %self.label,
                    status = %self.status,
                    ignored = %status,
                    "Fork already finished, ignoring later outcome"
                );
            }
            return;
        }

        self.status = status;
        self.result = outcome;
        self.finished_at = Some(Utc::now());
        info!(
            fork_id = %self.id,
            label = %self.label,
            status = %self.status,
            elapsed_ms = self.elapsed().map(|d| d.as_millis() as u64),
            "Fork finished"
        );
    }

    fn fail(&mut self, error: CapturedError) {
        self.finish(ForkOutcome::Failure(error));
    }

    /// How long the fork has been running, once that exceeds its wait timeout.
    fn overdue(&self) -> Option<Duration> {
        self.elapsed().filter(|elapsed| *elapsed > self.wait_timeout)
    }

    fn snapshot(&self) -> ForkSnapshot {
        ForkSnapshot {
            id: self.id,
            label: self.label.clone(),
            status: self.status,
            result: self.result.clone(),
            finished_at: self.finished_at,
        }
    }

    /// Adopt a child's report.
    fn apply(&mut self, snapshot: ForkSnapshot) {
        self.label = snapshot.label;
        if !snapshot.status.is_terminal() {
            self.fail(CapturedError::snapshot(format_args!(
                "child reported {} before finishing",
                snapshot.status
            )));
            return;
        }
        // A task may have finished its own handle before returning.
        match snapshot.result {
            Some(outcome) if outcome.status() == snapshot.status => self.finish(outcome),
            _ => self.conclude(snapshot.status, None),
        }
        if snapshot.finished_at.is_some() {
            self.finished_at = snapshot.finished_at;
        }
    }

    /// Fire the callback matching a terminal status, once.
    fn settle(&mut self) {
        match self.status {
            ForkStatus::Complete if self.on_success.is_some() => {
                if let (Some(callback), Some(ForkOutcome::Success(value))) =
                    (self.on_success.take(), &self.result)
                {
                    callback(value, self);
                }
            }
            ForkStatus::Error if self.on_error.is_some() => {
                if let (Some(callback), Some(ForkOutcome::Failure(error))) =
                    (self.on_error.take(), &self.result)
                {
                    callback(error, self);
                }
            }
            _ => {}
        }
    }
}
