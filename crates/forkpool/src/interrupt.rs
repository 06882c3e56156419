//! SIGINT/SIGTERM handling for managers that own forks.
//!
//! While at least one [`InterruptGuard`] is alive the handlers are installed. Inside an
//! await loop (a [`Deferral`] is alive) a signal only sets a flag; the loop notices it,
//! terminates its forks and returns. Anywhere else nothing would look at the flag, so the
//! handler kills the tracked children itself and re-raises the signal with the default
//! disposition. The previous dispositions come back when the last guard drops. Forked
//! children reset both signals to their defaults.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use crate::error::ForkError;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static DEFERRING: AtomicUsize = AtomicUsize::new(0);

const TRACKED_CAPACITY: usize = 256;
/// Pids of running children, readable from a signal handler. Zero marks a free slot.
static TRACKED: [AtomicI32; TRACKED_CAPACITY] = [const { AtomicI32::new(0) }; TRACKED_CAPACITY];

/// Clear the flag, returning whether it was set.
pub(crate) fn take() -> bool {
    INTERRUPTED.swap(false, Ordering::SeqCst)
}

/// Remember a child to kill if a signal arrives outside an await loop.
pub(crate) fn track_child(pid: i32) {
    let tracked = TRACKED
        .iter()
        .any(|slot| slot.compare_exchange(0, pid, Ordering::SeqCst, Ordering::SeqCst).is_ok());
    if !tracked {
        tracing::debug!(pid, "Child table full, not tracking for signal cleanup");
    }
}

pub(crate) fn untrack_child(pid: i32) {
    for slot in &TRACKED {
        let _ = slot.compare_exchange(pid, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}

#[cfg(unix)]
mod imp {
    use std::sync::atomic::Ordering;
    use std::sync::{Mutex, PoisonError};

    use nix::libc::c_int;
    use nix::sys::signal::{
        SaFlags, SigAction, SigHandler, SigSet, Signal, kill, raise, sigaction,
    };
    use nix::unistd::Pid;

    use super::{DEFERRING, INTERRUPTED, TRACKED};
    use crate::error::ForkError;

    const SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

    struct Installed {
        depth: usize,
        previous: Vec<(Signal, SigAction)>,
    }

    static INSTALLED: Mutex<Installed> = Mutex::new(Installed {
        depth: 0,
        previous: Vec::new(),
    });

    // Only async-signal-safe work below: atomics, kill, sigaction, raise.
    extern "C" fn record(signal: c_int) {
        if DEFERRING.load(Ordering::SeqCst) > 0 {
            INTERRUPTED.store(true, Ordering::SeqCst);
            return;
        }
        for slot in &TRACKED {
            let pid = slot.swap(0, Ordering::SeqCst);
            if pid > 0 {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
        let Ok(signal) = Signal::try_from(signal) else {
            return;
        };
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // SAFETY: installing the default disposition; the re-raised signal is delivered once
        // this handler returns.
        let _ = unsafe { sigaction(signal, &default) };
        let _ = raise(signal);
    }

    pub(super) fn install() -> Result<(), ForkError> {
        let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
        if installed.depth == 0 {
            let action = SigAction::new(
                SigHandler::Handler(record),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            for signal in SIGNALS {
                // SAFETY: the handler only touches atomics and async-signal-safe calls.
                let previous = unsafe { sigaction(signal, &action) }
                    .map_err(|errno| ForkError::Signal(errno.into()))?;
                installed.previous.push((signal, previous));
            }
        }
        installed.depth += 1;
        Ok(())
    }

    pub(super) fn uninstall() {
        let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
        installed.depth = installed.depth.saturating_sub(1);
        if installed.depth > 0 {
            return;
        }
        for (signal, previous) in installed.previous.drain(..) {
            // SAFETY: restores a disposition previously returned by sigaction.
            let _ = unsafe { sigaction(signal, &previous) };
        }
    }

    pub(super) fn reset_to_default() {
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        for signal in SIGNALS {
            // SAFETY: installing the default disposition.
            let _ = unsafe { sigaction(signal, &action) };
        }
        // Another thread of the parent may have held the lock at fork time; then the
        // bookkeeping stays as inherited.
        if let Ok(mut installed) = INSTALLED.try_lock() {
            installed.depth = 0;
            installed.previous.clear();
        }
    }
}

/// Keeps the interrupt handlers installed.
#[derive(Debug)]
pub(crate) struct InterruptGuard {
    _private: (),
}

impl InterruptGuard {
    pub(crate) fn install() -> Result<Self, ForkError> {
        #[cfg(unix)]
        imp::install()?;
        Ok(Self { _private: () })
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        imp::uninstall();
    }
}

/// While alive, a signal only sets the flag for an await loop to act on.
#[derive(Debug)]
pub(crate) struct Deferral {
    _private: (),
}

impl Deferral {
    pub(crate) fn begin() -> Self {
        DEFERRING.fetch_add(1, Ordering::SeqCst);
        Self { _private: () }
    }
}

impl Drop for Deferral {
    fn drop(&mut self) {
        DEFERRING.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Restore default signal handling in a freshly forked child.
pub(crate) fn reset_in_child() {
    INTERRUPTED.store(false, Ordering::SeqCst);
    DEFERRING.store(0, Ordering::SeqCst);
    for slot in &TRACKED {
        slot.store(0, Ordering::SeqCst);
    }
    #[cfg(unix)]
    imp::reset_to_default();
}
