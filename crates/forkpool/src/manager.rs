//! Fork manager: owns handles, caps parallelism, awaits and collects results.

use std::collections::{BTreeMap, BTreeSet};
#[cfg(unix)]
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ForkManagerConfig;
#[cfg(unix)]
use crate::coordination::CoordinationClient;
#[cfg(unix)]
use crate::coordination::spawn::{self, Lease};
use crate::error::ForkError;
#[cfg(unix)]
use crate::fork::AsynchronousFork;
use crate::fork::{
    CapturedError, ForkHandle, ForkId, ForkMode, ForkOutcome, ForkStatus, boxed_task,
};
use crate::interrupt::{self, Deferral, InterruptGuard};

/// Connection to this process tree's coordination server.
#[cfg(unix)]
#[derive(Debug)]
struct Coordination {
    client: CoordinationClient,
    /// Held only when this process owns the server.
    _lease: Option<Lease>,
    /// Signals outside an await kill the forks instead of orphaning them.
    _interrupts: Option<InterruptGuard>,
}

/// Runs tasks as forks, at most `max_forks` at a time, and hands back their results in
/// submission order.
///
/// ```no_run
/// use forkpool::ForkManager;
///
/// let mut manager = ForkManager::new();
/// for n in 0..4u64 {
///     manager.create()?.run(move |_| Ok::<_, anyhow::Error>(n * n)).submit()?;
/// }
/// let squares = manager.fork_values()?;
/// # Ok::<(), forkpool::ForkError>(())
/// ```
#[derive(Debug)]
pub struct ForkManager {
    config: ForkManagerConfig,
    forks: BTreeMap<ForkId, ForkHandle>,
    next_id: u64,
    owner_pid: u32,
    reported_timeouts: BTreeSet<ForkId>,
    #[cfg(unix)]
    coordination: Option<Coordination>,
}

impl Default for ForkManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ForkManager {
    pub fn new() -> Self {
        Self::with_config(ForkManagerConfig::default())
    }

    pub fn with_config(config: ForkManagerConfig) -> Self {
        Self {
            config,
            forks: BTreeMap::new(),
            next_id: 0,
            owner_pid: std::process::id(),
            reported_timeouts: BTreeSet::new(),
            #[cfg(unix)]
            coordination: None,
        }
    }

    pub fn config(&self) -> &ForkManagerConfig {
        &self.config
    }

    /// Forks really fork: requested, and supported on this platform.
    pub fn is_async(&self) -> bool {
        cfg!(unix) && self.config.use_async
    }

    pub fn max_forks(&self) -> usize {
        self.config.max_forks
    }

    pub fn set_max_forks(&mut self, max: usize) -> &mut Self {
        self.config.max_forks = max.max(1);
        self
    }

    pub fn wait_timeout(&self) -> Duration {
        self.config.wait_timeout
    }

    /// Applies to forks created later and to ones not yet finished.
    pub fn set_wait_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.wait_timeout = timeout;
        for handle in self.forks.values_mut().filter(|h| !h.status().is_terminal()) {
            handle.set_wait_timeout(timeout);
        }
        self
    }

    /// Affects forks created afterwards.
    pub fn set_async(&mut self, enabled: bool) -> &mut Self {
        self.config.use_async = enabled;
        self
    }

    pub fn set_strict_timeouts(&mut self, strict: bool) -> &mut Self {
        self.config.strict_timeouts = strict;
        self
    }

    /// Start building a fork. Nothing is scheduled until [`ForkBuilder::submit`].
    pub fn create(&mut self) -> Result<ForkBuilder<'_>, ForkError> {
        let mode = self.next_mode()?;
        self.next_id += 1;
        let mut handle = ForkHandle::new(mode, self.config.wait_timeout);
        handle.set_id(ForkId::new(self.next_id));
        Ok(ForkBuilder {
            manager: self,
            handle,
        })
    }

    fn next_mode(&mut self) -> Result<ForkMode, ForkError> {
        #[cfg(unix)]
        if self.config.use_async {
            let client = self.coordination_client()?;
            return Ok(ForkMode::Asynchronous(AsynchronousFork::new(client)));
        }
        Ok(ForkMode::Synchronous)
    }

    #[cfg(unix)]
    fn coordination_client(&mut self) -> Result<CoordinationClient, ForkError> {
        if let Some(coordination) = &self.coordination {
            return Ok(coordination.client.clone());
        }
        let interrupts = if self.config.handle_interrupts {
            Some(InterruptGuard::install()?)
        } else {
            None
        };
        let (client, lease) = spawn::acquire(&self.config.coordination)?;
        debug!(
            addr = %client.addr(),
            lease = lease.as_ref().map(Lease::path),
            "Coordination acquired"
        );
        self.coordination = Some(Coordination {
            client: client.clone(),
            _lease: lease,
            _interrupts: interrupts,
        });
        Ok(client)
    }

    /// Address of the coordination server, once an asynchronous fork has been created.
    #[cfg(unix)]
    pub fn coordination_addr(&self) -> Option<SocketAddr> {
        self.coordination.as_ref().map(|c| c.client.addr())
    }

    pub fn fork(&self, id: ForkId) -> Option<&ForkHandle> {
        self.forks.get(&id)
    }

    pub fn fork_mut(&mut self, id: ForkId) -> Option<&mut ForkHandle> {
        self.forks.get_mut(&id)
    }

    /// Handles in id order, optionally only those with `status`.
    pub fn forks(&self, status: Option<ForkStatus>) -> Vec<&ForkHandle> {
        self.forks
            .values()
            .filter(|h| status.is_none_or(|s| h.status() == s))
            .collect()
    }

    fn count(&self, status: ForkStatus) -> usize {
        self.forks.values().filter(|h| h.status() == status).count()
    }

    pub fn has_errors(&self) -> bool {
        self.forks.values().any(|h| h.status() == ForkStatus::Error)
    }

    /// One scheduling pass: poll running forks, then start queued ones while there is room.
    ///
    /// Returns how many forks are still running or queued. Every handle is visited even when
    /// one fails; the first error is returned after the pass.
    pub fn update_fork_status(&mut self) -> Result<usize, ForkError> {
        let mut first_error = None;

        for handle in self
            .forks
            .values_mut()
            .filter(|h| h.status() != ForkStatus::NotStarted)
        {
            if let Err(e) = handle.poll_status() {
                warn!(fork_id = %handle.id(), error = %e, "Polling fork failed");
                first_error.get_or_insert(e);
            }
        }

        while self.count(ForkStatus::InProgress) < self.config.max_forks {
            let Some(handle) = self
                .forks
                .values_mut()
                .find(|h| h.status() == ForkStatus::NotStarted)
            else {
                break;
            };
            debug!(fork_id = %handle.id(), label = %handle.label(), "Starting fork");
            if let Err(e) = handle.execute().map(|_| ()) {
                warn!(fork_id = %handle.id(), error = %e, "Starting fork failed");
                first_error.get_or_insert(e);
                // A handle that could not leave NOT_STARTED would be picked again forever.
                if handle.status() == ForkStatus::NotStarted {
                    let _ = handle.set_status(ForkStatus::Error);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(self.count(ForkStatus::InProgress) + self.count(ForkStatus::NotStarted))
    }

    /// Block until every fork has finished, polling at the configured interval.
    pub fn await_forks(&mut self) -> Result<&mut Self, ForkError> {
        self.await_forks_with(self.config.poll_interval)
    }

    /// Block until every fork has finished.
    ///
    /// The wait between passes starts at `poll_interval`, grows by a tenth of it after each
    /// pass that finished nothing (up to `max_poll_interval`), and resets when something
    /// finishes. SIGINT/SIGTERM while waiting terminates every fork and returns
    /// [`ForkError::Interrupted`].
    pub fn await_forks_with(&mut self, poll_interval: Duration) -> Result<&mut Self, ForkError> {
        let interrupts = if self.config.handle_interrupts {
            Some(InterruptGuard::install()?)
        } else {
            None
        };
        let _deferred = interrupts.as_ref().map(|_| Deferral::begin());
        let ceiling = self.config.max_poll_interval.max(poll_interval);
        let step = poll_interval / 10;
        let mut interval = poll_interval;

        loop {
            if interrupts.is_some() && interrupt::take() {
                return Err(self.interrupted());
            }

            let finished_before = self.finished();
            let remaining = self.update_fork_status()?;

            let timed_out = self.newly_timed_out();
            if self.config.strict_timeouts && !timed_out.is_empty() {
                return Err(self.strict_timeout(timed_out));
            }

            if remaining == 0 {
                break;
            }

            interval = if self.finished() > finished_before {
                poll_interval
            } else {
                (interval + step).min(ceiling)
            };
            std::thread::sleep(interval);
        }

        debug!(forks = self.forks.len(), "All forks finished");
        Ok(self)
    }

    fn finished(&self) -> usize {
        self.forks.values().filter(|h| h.status().is_terminal()).count()
    }

    /// Labels of forks that timed out since the last await pass looked.
    fn newly_timed_out(&mut self) -> Vec<String> {
        let mut labels = Vec::new();
        for handle in self.forks.values() {
            let timed_out = handle
                .result()
                .and_then(ForkOutcome::error)
                .is_some_and(CapturedError::is_timeout);
            if timed_out && self.reported_timeouts.insert(handle.id()) {
                labels.push(handle.label().to_string());
            }
        }
        labels
    }

    fn strict_timeout(&mut self, mut forks: Vec<String>) -> ForkError {
        forks.extend(
            self.forks
                .values()
                .filter(|h| !h.status().is_terminal())
                .map(|h| h.label().to_string()),
        );
        warn!(forks = ?forks, "Fork timed out, abandoning the wait");
        self.terminate_forks();
        ForkError::WaitTimeout { forks }
    }

    fn interrupted(&mut self) -> ForkError {
        warn!(
            in_progress = self.count(ForkStatus::InProgress),
            "Interrupted, terminating forks"
        );
        self.terminate_forks();
        #[cfg(unix)]
        {
            self.coordination = None;
        }
        ForkError::Interrupted
    }

    /// Kill every running fork. Does nothing outside the process that created the manager.
    pub fn terminate_forks(&mut self) -> &mut Self {
        if std::process::id() != self.owner_pid {
            return self;
        }
        for handle in self
            .forks
            .values_mut()
            .filter(|h| h.status() == ForkStatus::InProgress)
        {
            if let Err(e) = handle.terminate() {
                warn!(fork_id = %handle.id(), error = %e, "Failed to terminate fork");
            }
        }
        self
    }

    /// Await, then return outcomes in id order. Failures are left out unless
    /// `include_errors` is set.
    pub fn fork_results(&mut self, include_errors: bool) -> Result<Vec<ForkOutcome>, ForkError> {
        self.await_forks()?;
        Ok(self
            .forks
            .values()
            .filter(|h| include_errors || h.status() != ForkStatus::Error)
            .filter_map(|h| h.result().cloned())
            .collect())
    }

    /// Await, then return the successful values in id order.
    pub fn fork_values(&mut self) -> Result<Vec<Value>, ForkError> {
        Ok(self
            .fork_results(false)?
            .into_iter()
            .filter_map(ForkOutcome::into_value)
            .collect())
    }
}

impl Drop for ForkManager {
    fn drop(&mut self) {
        if self.count(ForkStatus::InProgress) > 0 {
            info!(
                in_progress = self.count(ForkStatus::InProgress),
                "Manager dropped with forks running, terminating"
            );
            self.terminate_forks();
        }
    }
}

/// A fork being configured. Submit it to schedule it.
#[must_use = "a fork does nothing until it is submitted"]
pub struct ForkBuilder<'a> {
    manager: &'a mut ForkManager,
    handle: ForkHandle,
}

impl ForkBuilder<'_> {
    pub fn id(&self) -> ForkId {
        self.handle.id()
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.handle.set_label(label);
        self
    }

    /// The work. Its value must serialize to JSON. Its error is captured with its type name
    /// as the kind, or the name of a recognised error found in its chain.
    pub fn run<F, T, E>(mut self, task: F) -> Self
    where
        F: FnOnce(&mut ForkHandle) -> Result<T, E> + 'static,
        T: Serialize,
        E: Into<anyhow::Error>,
    {
        self.handle.set_task(boxed_task(task));
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Value, &ForkHandle) + 'static,
    {
        self.handle.on_success(callback);
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&CapturedError, &ForkHandle) + 'static,
    {
        self.handle.on_error(callback);
        self
    }

    /// Queue the fork and run a scheduling pass.
    pub fn submit(self) -> Result<ForkId, ForkError> {
        let Self { manager, handle } = self;
        let id = handle.id();
        if !handle.has_task() {
            return Err(ForkError::MissingTask(id));
        }
        manager.forks.insert(id, handle);
        manager.update_fork_status()?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use serde_json::json;

    use super::*;
    use crate::fork::TaskFailure;

    fn inline() -> ForkManager {
        ForkManager::with_config(
            ForkManagerConfig::default()
                .with_async(false)
                .with_interrupt_handling(false),
        )
    }

    #[test]
    fn ids_are_sequential_from_one() {
        let mut manager = inline();
        let a = manager.create().unwrap().run(|_| Ok::<_, anyhow::Error>(1)).submit().unwrap();
        let b = manager.create().unwrap().run(|_| Ok::<_, anyhow::Error>(2)).submit().unwrap();
        assert_eq!((a.get(), b.get()), (1, 2));
        assert_eq!(manager.fork(b).unwrap().label(), "fork 2");
    }

    #[test]
    fn submit_without_task_is_rejected() {
        let mut manager = inline();
        let err = manager.create().unwrap().label("empty").submit().unwrap_err();
        assert!(matches!(err, ForkError::MissingTask(_)));
        assert!(manager.forks(None).is_empty());
    }

    #[test]
    fn values_keep_submission_order_and_skip_errors() {
        let mut manager = inline();
        for n in 0..5 {
            manager
                .create()
                .unwrap()
                .run(move |_| {
                    if n == 2 {
                        Err(TaskFailure::with_code("two is unlucky", 2))
                    } else {
                        Ok(n * 10)
                    }
                })
                .submit()
                .unwrap();
        }

        assert_eq!(
            manager.fork_values().unwrap(),
            vec![json!(0), json!(10), json!(30), json!(40)]
        );
        assert!(manager.has_errors());

        let all = manager.fork_results(true).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[2].error().map(CapturedError::code), Some(2));
        assert_eq!(manager.forks(Some(ForkStatus::Error)).len(), 1);
    }

    #[test]
    fn callbacks_fire_once_each() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let mut manager = inline();

        let ok = events.clone();
        let failed = events.clone();
        manager
            .create()
            .unwrap()
            .label("good")
            .run(|_| Ok::<_, anyhow::Error>("fine"))
            .on_success(move |value, fork| ok.borrow_mut().push(format!("{}={value}", fork.label())))
            .submit()
            .unwrap();
        manager
            .create()
            .unwrap()
            .label("bad")
            .run(|_| Err::<(), _>(anyhow::anyhow!("nope")))
            .on_error(move |error, fork| failed.borrow_mut().push(format!("{}!{}", fork.label(), error.message())))
            .submit()
            .unwrap();

        manager.await_forks().unwrap();
        manager.await_forks().unwrap();
        assert_eq!(*events.borrow(), vec!["good=\"fine\"", "bad!nope"]);
    }

    #[test]
    fn task_can_relabel_itself() {
        let mut manager = inline();
        let id = manager
            .create()
            .unwrap()
            .run(|fork| {
                fork.set_label("renamed");
                Ok::<_, anyhow::Error>(())
            })
            .submit()
            .unwrap();
        manager.await_forks().unwrap();
        assert_eq!(manager.fork(id).unwrap().label(), "renamed");
    }

    #[test]
    fn strict_timeouts_raise_with_labels() {
        let mut manager = inline();
        manager
            .set_wait_timeout(Duration::from_millis(10))
            .set_strict_timeouts(true);

        // Inline forks run during submit; the overrun is reported by the next await.
        manager
            .create()
            .unwrap()
            .label("sleepy")
            .run(|_| {
                std::thread::sleep(Duration::from_millis(40));
                Ok::<_, anyhow::Error>(())
            })
            .submit()
            .unwrap();

        let err = manager.await_forks().unwrap_err();
        assert!(matches!(&err, ForkError::WaitTimeout { forks } if forks == &["sleepy"]), "{err}");
    }

    #[test]
    fn lenient_timeouts_only_mark_the_fork() {
        let mut manager = inline();
        manager.set_wait_timeout(Duration::from_millis(10));
        manager
            .create()
            .unwrap()
            .run(|_| {
                std::thread::sleep(Duration::from_millis(40));
                Ok::<_, anyhow::Error>(())
            })
            .submit()
            .unwrap();

        assert!(manager.fork_values().unwrap().is_empty());
        assert!(manager.has_errors());
    }

    #[test]
    fn set_max_forks_has_a_floor() {
        let mut manager = inline();
        manager.set_max_forks(0);
        assert_eq!(manager.max_forks(), 1);
    }
}
