//! Inline backend: the task runs on the caller's thread inside `execute`.

use tracing::warn;

use super::{CapturedError, ForkHandle, ForkOutcome, ForkStatus, Task};

pub(super) fn execute(handle: &mut ForkHandle, task: Task) {
    let outcome = super::run_task(task, handle);

    // A deadline cannot interrupt inline work; an overrun is reported once it returns.
    match handle.overdue() {
        Some(elapsed) => {
            warn!(
                fork_id = %handle.id,
                label = %handle.label,
                elapsed_ms = elapsed.as_millis() as u64,
                "Inline fork overran its wait timeout"
            );
            handle.fail(CapturedError::timeout(elapsed, handle.wait_timeout));
        }
        None => handle.finish(outcome),
    }
    handle.settle();
}

pub(super) fn poll(handle: &mut ForkHandle) {
    if handle.status != ForkStatus::InProgress {
        return;
    }
    if let Some(elapsed) = handle.overdue() {
        handle.fail(CapturedError::timeout(elapsed, handle.wait_timeout));
    }
}
