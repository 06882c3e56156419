//! Process backend.
//!
//! `execute` forks. The parent records the child's pid and returns; the child runs the task,
//! PUTs a snapshot of its handle to `/fork/<pid>` on the coordination server and exits.
//! Polling in the parent GETs that key: a HIT adopts the snapshot, reaps the child and
//! deletes the key; a MISS checks whether the child died silently or overran its timeout.

use std::io::Write;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpid};
use tracing::{debug, error, warn};

use super::{CapturedError, ForkHandle, ForkMode, ForkStatus, Role, Task};
use crate::coordination::{CoordinationClient, Method};
use crate::error::ForkError;

#[derive(Debug)]
pub(crate) struct AsynchronousFork {
    pid: Option<Pid>,
    role: Role,
    client: CoordinationClient,
}

impl AsynchronousFork {
    pub(crate) fn new(client: CoordinationClient) -> Self {
        Self {
            pid: None,
            role: Role::Parent,
            client,
        }
    }

    pub(crate) fn pid(&self) -> Option<i32> {
        self.pid.map(Pid::as_raw)
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn client(&self) -> &CoordinationClient {
        &self.client
    }
}

fn result_key(pid: Pid) -> String {
    format!("/fork/{pid}")
}

pub(super) fn execute(
    handle: &mut ForkHandle,
    client: CoordinationClient,
    task: Task,
) -> Result<(), ForkError> {
    // SAFETY: the child branch runs the task, reports and exits without returning to the
    // caller. No async runtime is alive across this call.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            if let ForkMode::Asynchronous(state) = &mut handle.mode {
                state.pid = Some(child);
            }
            crate::interrupt::track_child(child.as_raw());
            debug!(fork_id = %handle.id, label = %handle.label, pid = child.as_raw(), "Forked");
            Ok(())
        }
        Ok(ForkResult::Child) => run_child(handle, client, task),
        Err(errno) => {
            error!(fork_id = %handle.id, label = %handle.label, error = %errno, "Fork failed");
            handle.fail(CapturedError::fork_failed(errno));
            Err(ForkError::Spawn {
                id: handle.id,
                source: errno.into(),
            })
        }
    }
}

fn run_child(handle: &mut ForkHandle, client: CoordinationClient, task: Task) -> ! {
    crate::interrupt::reset_in_child();
    let pid = getpid();

    handle.mode = ForkMode::Asynchronous(AsynchronousFork {
        pid: Some(pid),
        role: Role::Child,
        client: client.clone(),
    });
    // Callbacks belong to the parent.
    handle.on_success = None;
    handle.on_error = None;

    let outcome = super::run_task(task, handle);
    handle.finish(outcome);

    let key = result_key(pid);
    let code = match serde_json::to_value(handle.snapshot()) {
        Ok(snapshot) => match client.put(&key, snapshot) {
            Ok(_) => 0,
            Err(e) => {
                error!(fork_id = %handle.id, path = %key, error = %e, "Failed to report fork result");
                1
            }
        },
        Err(e) => {
            error!(fork_id = %handle.id, error = %e, "Failed to encode fork result");
            1
        }
    };

    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    std::process::exit(code)
}

pub(super) fn poll(handle: &mut ForkHandle) -> Result<(), ForkError> {
    if handle.status != ForkStatus::InProgress {
        return Ok(());
    }
    let (pid, client) = match &handle.mode {
        ForkMode::Asynchronous(AsynchronousFork {
            pid: Some(pid),
            role: Role::Parent,
            client,
        }) => (*pid, client.clone()),
        _ => return Ok(()),
    };

    if fetch(handle, &client, pid)? {
        return Ok(());
    }

    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => {}
        Ok(status) => {
            crate::interrupt::untrack_child(pid.as_raw());
            // The child may have reported between the GET and its exit.
            if !fetch(handle, &client, pid)? {
                warn!(fork_id = %handle.id, pid = pid.as_raw(), ?status, "Child exited without a result");
                handle.fail(CapturedError::exited(describe(status)));
            }
            return Ok(());
        }
        Err(Errno::ECHILD) => {
            crate::interrupt::untrack_child(pid.as_raw());
            if !fetch(handle, &client, pid)? {
                handle.fail(CapturedError::exited("already reaped"));
            }
            return Ok(());
        }
        Err(e) => warn!(fork_id = %handle.id, pid = pid.as_raw(), error = %e, "waitpid failed"),
    }

    if let Some(elapsed) = handle.overdue() {
        warn!(
            fork_id = %handle.id,
            label = %handle.label,
            pid = pid.as_raw(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Fork timed out, killing"
        );
        let _ = kill(pid, Signal::SIGKILL);
        reap(pid);
        if !fetch(handle, &client, pid)? {
            handle.fail(CapturedError::timeout(elapsed, handle.wait_timeout));
        }
    }
    Ok(())
}

/// Adopt the child's report if it has been stored.
fn fetch(handle: &mut ForkHandle, client: &CoordinationClient, pid: Pid) -> Result<bool, ForkError> {
    let key = result_key(pid);
    let reply = client
        .get(&key)
        .map_err(|source| ForkError::coordination(key.clone(), source))?;
    if reply.method() != Method::Hit {
        return Ok(false);
    }

    reap(pid);
    if let Err(e) = client.delete(&key) {
        debug!(path = %key, error = %e, "Failed to clear fork result");
    }

    match serde_json::from_value(reply.into_payload()) {
        Ok(snapshot) => {
            handle.apply(snapshot);
            Ok(true)
        }
        Err(source) => {
            handle.fail(CapturedError::snapshot(&source));
            Err(ForkError::Snapshot { path: key, source })
        }
    }
}

pub(super) fn terminate(handle: &mut ForkHandle) {
    if handle.status != ForkStatus::InProgress {
        return;
    }
    let ForkMode::Asynchronous(AsynchronousFork { pid: Some(pid), role, .. }) = &handle.mode else {
        return;
    };
    let (pid, role) = (*pid, *role);

    if role == Role::Child {
        let _ = kill(getpid(), Signal::SIGKILL);
        return;
    }

    debug!(fork_id = %handle.id, pid = pid.as_raw(), "Terminating fork");
    if let Err(e) = kill(pid, Signal::SIGKILL)
        && e != Errno::ESRCH
    {
        warn!(fork_id = %handle.id, pid = pid.as_raw(), error = %e, "Failed to kill fork");
    }
    reap(pid);
    handle.fail(CapturedError::terminated());
}

fn reap(pid: Pid) {
    crate::interrupt::untrack_child(pid.as_raw());
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            _ => return,
        }
    }
}

fn describe(status: WaitStatus) -> String {
    match status {
        WaitStatus::Exited(_, code) => format!("exit code {code}"),
        WaitStatus::Signaled(_, signal, _) => format!("killed by {signal}"),
        other => format!("{other:?}"),
    }
}
