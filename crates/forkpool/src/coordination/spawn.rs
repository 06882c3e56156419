//! One coordination server per process tree.
//!
//! The first manager in a process binds a loopback port, forks the server and records it in
//! a process-wide slot. Later managers in the same process take a lease on the running
//! server; managers in forked descendants find the inherited slot and reuse the server
//! without a lease. When the last lease exits the server halts and its owner reaps it.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpid, getppid};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::client::CoordinationClient;
use super::message::Method;
use super::server::CoordinationServer;
use crate::config::CoordinationConfig;
use crate::error::ForkError;

/// How long a halting server gets to exit before it is killed.
const REAP_GRACE: Duration = Duration::from_secs(2);
/// How often the server checks that lease owners are still alive.
const OWNER_CHECK: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct Coordinator {
    addr: SocketAddr,
    server_pid: Pid,
    owner_pid: Pid,
    next_lease: u64,
}

static COORDINATOR: Mutex<Option<Coordinator>> = Mutex::new(None);

fn slot() -> MutexGuard<'static, Option<Coordinator>> {
    COORDINATOR.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A registration with the server. Dropping it sends EXIT from the owning process.
#[derive(Debug)]
pub(crate) struct Lease {
    client: CoordinationClient,
    path: String,
    owner_pid: Pid,
    server_pid: Pid,
}

impl Lease {
    pub(crate) fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // A forked copy of the owner must not release the owner's lease.
        if getpid() != self.owner_pid {
            return;
        }
        let mut slot = slot();
        let reply = match self.client.close(&self.path) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(lease = %self.path, error = %e, "Lease exit failed, server already gone");
                return;
            }
        };
        let remaining = reply.payload().get("remaining").and_then(Value::as_u64);
        debug!(lease = %self.path, ?remaining, "Lease released");

        if remaining == Some(0) {
            if slot.as_ref().is_some_and(|c| c.server_pid == self.server_pid) {
                *slot = None;
            }
            reap_server(self.server_pid);
        }
    }
}

/// Client for this process tree's server, plus a lease when this process owns it.
pub(crate) fn acquire(
    config: &CoordinationConfig,
) -> Result<(CoordinationClient, Option<Lease>), ForkError> {
    let mut slot = slot();
    let me = getpid();

    if let Some(existing) = slot.as_mut() {
        let client = CoordinationClient::new(existing.addr).with_timeout(config.request_timeout);
        if existing.owner_pid != me {
            debug!(addr = %existing.addr, "Reusing coordination server from ancestor process");
            return Ok((client, None));
        }
        match register(existing, &client) {
            Ok(lease) => return Ok((client, Some(lease))),
            Err(e) => {
                warn!(addr = %existing.addr, error = %e, "Coordination server unreachable, respawning");
                reap_server(existing.server_pid);
                *slot = None;
            }
        }
    }

    let mut coordinator = spawn_server(config)?;
    let client = CoordinationClient::new(coordinator.addr).with_timeout(config.request_timeout);
    let lease = match register(&mut coordinator, &client) {
        Ok(lease) => lease,
        Err(e) => {
            let _ = kill(coordinator.server_pid, Signal::SIGKILL);
            reap_server(coordinator.server_pid);
            return Err(e);
        }
    };
    *slot = Some(coordinator);
    Ok((client, Some(lease)))
}

fn register(coordinator: &mut Coordinator, client: &CoordinationClient) -> Result<Lease, ForkError> {
    let path = format!("{}.{}", coordinator.owner_pid, coordinator.next_lease);
    coordinator.next_lease += 1;

    let reply = client
        .register(&path)
        .map_err(|source| ForkError::coordination(path.clone(), source))?;
    if reply.method() != Method::Welcome {
        return Err(ForkError::LeaseRefused {
            lease: path,
            reply: reply.method(),
        });
    }
    debug!(lease = %path, addr = %coordinator.addr, "Lease registered");

    Ok(Lease {
        client: client.clone(),
        path,
        owner_pid: coordinator.owner_pid,
        server_pid: coordinator.server_pid,
    })
}

/// Bind the first free loopback port at or above the configured one.
pub(crate) fn bind_listener(config: &CoordinationConfig) -> Result<TcpListener, ForkError> {
    let first = config.port;
    let mut last = first;
    let mut last_error = None;

    for offset in 0..config.port_attempts.max(1) {
        let Some(port) = first.checked_add(offset) else {
            break;
        };
        last = port;
        match TcpListener::bind((config.host, port)) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                debug!(port, "Coordination port in use, trying next");
                last_error = Some(e);
            }
            Err(source) => return Err(ForkError::Bind { first, last, source }),
        }
    }

    Err(ForkError::Bind {
        first,
        last,
        source: last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrInUse)),
    })
}

fn spawn_server(config: &CoordinationConfig) -> Result<Coordinator, ForkError> {
    let listener = bind_listener(config)?;
    let addr = listener.local_addr().map_err(ForkError::ServerSpawn)?;
    let owner = getpid();

    // SAFETY: the child never returns into the caller; it builds its own runtime, serves,
    // and exits the process.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            drop(listener);
            info!(%addr, server_pid = child.as_raw(), "Spawned coordination server");
            Ok(Coordinator {
                addr,
                server_pid: child,
                owner_pid: owner,
                next_lease: 0,
            })
        }
        Ok(ForkResult::Child) => run_server_process(listener, owner),
        Err(errno) => Err(ForkError::ServerSpawn(errno.into())),
    }
}

/// Whether a lease owner still runs. The server's own parent is checked through `getppid`:
/// an owner that died is a zombie until reaped, but its children are re-parented at once.
fn owner_alive(server_parent: Pid, pid: i32) -> bool {
    if pid == server_parent.as_raw() {
        return getppid() == server_parent;
    }
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

fn run_server_process(listener: TcpListener, owner: Pid) -> ! {
    crate::interrupt::reset_in_child();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build coordination server runtime");
            std::process::exit(1);
        }
    };
    let served = runtime.block_on(async {
        CoordinationServer::from_std(listener)?
            .watch_owners(OWNER_CHECK, move |pid| owner_alive(owner, pid))
            .serve()
            .await
    });
    let code = match served {
        Ok(_) => 0,
        Err(e) => {
            error!(error = %e, "Coordination server failed");
            1
        }
    };
    drop(runtime);
    std::process::exit(code)
}

/// Wait for a halting server, killing it if it overstays.
fn reap_server(pid: Pid) {
    let deadline = Instant::now() + REAP_GRACE;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => {
                debug!(server_pid = pid.as_raw(), ?status, "Coordination server reaped");
                return;
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return,
            Err(e) => {
                warn!(server_pid = pid.as_raw(), error = %e, "waitpid on coordination server failed");
                return;
            }
        }
        if Instant::now() >= deadline {
            warn!(server_pid = pid.as_raw(), "Coordination server did not halt, killing");
            let _ = kill(pid, Signal::SIGKILL);
            loop {
                match waitpid(pid, None) {
                    Err(Errno::EINTR) => continue,
                    _ => return,
                }
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
