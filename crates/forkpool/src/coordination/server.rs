//! Loopback rendezvous server.
//!
//! Connections are served concurrently but the store and the lease table have exactly one
//! owner: the dispatch loop. Connection tasks reassemble a request, hand it over a channel,
//! write back whatever the loop answers and close. When the last lease exits the loop stops
//! accepting, lets in-flight connections finish, and `serve` returns.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, trace, warn};

use super::message::{Message, MessageCodec, Method};

const DRAIN_GRACE: Duration = Duration::from_secs(1);
/// A peer that sends nothing for this long is dropped.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_QUEUE: usize = 64;

/// Reply payload for STATUS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Lease path to registration time (unix seconds).
    pub leases: BTreeMap<String, i64>,
    /// Stored paths, sorted.
    pub store: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ServerState {
    store: HashMap<String, Value>,
    leases: BTreeMap<String, i64>,
    halting: bool,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one request and build its reply.
    pub fn handle(&mut self, request: &Message, peer: Option<SocketAddr>) -> Message {
        let path = request.path();
        let peer = peer.map(|p| p.to_string()).unwrap_or_default();

        let reply = match request.method() {
            Method::Put => {
                let previous = self
                    .store
                    .insert(path.to_string(), request.payload().clone());
                let status = if previous.is_some() {
                    Method::Updated
                } else {
                    Method::New
                };
                Message::bare(status, path)
            }
            Method::Get => match self.store.get(path) {
                Some(value) => Message::new(Method::Hit, path, value.clone()),
                None => Message::bare(Method::Miss, path),
            },
            Method::Delete => {
                self.store.remove(path);
                Message::bare(Method::Ok, path)
            }
            Method::Register => {
                self.leases
                    .insert(path.to_string(), chrono::Utc::now().timestamp());
                Message::bare(Method::Welcome, path)
            }
            Method::Exit => {
                self.leases.remove(path);
                let remaining = self.leases.len();
                if remaining == 0 {
                    self.halting = true;
                }
                Message::new(Method::Bye, path, json!({ "remaining": remaining }))
            }
            Method::Status => {
                let status = serde_json::to_value(self.status()).unwrap_or_default();
                Message::new(Method::Ok, path, status)
            }
            other => {
                warn!(method = %other, path, peer, "Reply verb sent as a request");
                return Message::new(
                    Method::Error,
                    path,
                    json!({ "error": format!("{other} is not a request") }),
                );
            }
        };

        if reply.method() == Method::Miss {
            debug!(method = %request.method(), path, status = %reply.method(), peer, "Handled request");
        } else {
            info!(method = %request.method(), path, status = %reply.method(), peer, "Handled request");
        }
        reply
    }

    pub fn status(&self) -> ServerStatus {
        let mut store: Vec<String> = self.store.keys().cloned().collect();
        store.sort();
        ServerStatus {
            leases: self.leases.clone(),
            store,
        }
    }

    /// Drop every lease whose owning process is gone. Halts when that leaves no lease.
    ///
    /// A lease path starts with its owner's pid (`<pid>.<seq>`); paths that don't are left
    /// alone. Returns the released paths.
    pub fn release_orphaned(&mut self, alive: impl Fn(i32) -> bool) -> Vec<String> {
        let orphaned: Vec<String> = self
            .leases
            .keys()
            .filter(|path| lease_owner(path).is_some_and(|pid| !alive(pid)))
            .cloned()
            .collect();
        for path in &orphaned {
            self.leases.remove(path);
            warn!(lease = %path, "Lease owner is gone, releasing");
        }
        if !orphaned.is_empty() && self.leases.is_empty() {
            self.halting = true;
        }
        orphaned
    }

    /// Set once the last lease has exited.
    pub fn is_halting(&self) -> bool {
        self.halting
    }
}

fn lease_owner(path: &str) -> Option<i32> {
    path.split_once('.')?.0.parse().ok()
}

/// Periodic check for lease owners that died without sending EXIT.
struct OwnerWatch {
    every: Duration,
    alive: Box<dyn Fn(i32) -> bool + Send + Sync>,
}

struct Request {
    message: Message,
    peer: SocketAddr,
    reply: oneshot::Sender<Message>,
}

pub struct CoordinationServer {
    listener: TcpListener,
    state: ServerState,
    owners: Option<OwnerWatch>,
}

impl CoordinationServer {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: ServerState::new(),
            owners: None,
        }
    }

    /// Every `every`, release the leases of owners `alive` reports as gone.
    pub fn watch_owners(
        mut self,
        every: Duration,
        alive: impl Fn(i32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.owners = Some(OwnerWatch {
            every,
            alive: Box::new(alive),
        });
        self
    }

    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?))
    }

    /// Adopt a listener bound before the runtime existed. Must run inside a runtime.
    pub fn from_std(listener: std::net::TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self::new(TcpListener::from_std(listener)?))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the last lease exits. Returns the final state.
    pub async fn serve(self) -> io::Result<ServerState> {
        let Self {
            listener,
            mut state,
            owners,
        } = self;
        let addr = listener.local_addr()?;
        let (request_tx, mut request_rx) = mpsc::channel::<Request>(REQUEST_QUEUE);
        let mut connections = JoinSet::new();
        let mut owner_check =
            tokio::time::interval(owners.as_ref().map_or(IDLE_TIMEOUT, |w| w.every));
        owner_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(%addr, pid = std::process::id(), "Coordination server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        trace!(%peer, "Accepted connection");
                        connections.spawn(serve_connection(stream, peer, request_tx.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                Some(request) = request_rx.recv() => {
                    dispatch(&mut state, request);
                    if state.is_halting() {
                        break;
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = owner_check.tick(), if owners.is_some() => {
                    if let Some(watch) = &owners {
                        state.release_orphaned(&watch.alive);
                    }
                    if state.is_halting() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        drop(request_tx);
        info!(%addr, in_flight = connections.len(), "No leases left, draining");

        let drain = async {
            loop {
                tokio::select! {
                    Some(request) = request_rx.recv() => dispatch(&mut state, request),
                    joined = connections.join_next() => {
                        if joined.is_none() {
                            break;
                        }
                    }
                }
            }
        };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            warn!(remaining = connections.len(), "Drain grace elapsed, dropping connections");
            connections.abort_all();
        }

        info!(%addr, "Coordination server stopped");
        Ok(state)
    }
}

fn dispatch(state: &mut ServerState, request: Request) {
    let reply = state.handle(&request.message, Some(request.peer));
    // The connection may have gone away; nothing to tell it then.
    let _ = request.reply.send(reply);
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, requests: mpsc::Sender<Request>) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, MessageCodec::new());

    let message = match tokio::time::timeout(IDLE_TIMEOUT, reader.next()).await {
        Ok(Some(Ok(message))) => message,
        Ok(Some(Err(e))) => {
            warn!(%peer, error = %e, "Connection closed without a complete request");
            return;
        }
        Ok(None) => {
            trace!(%peer, "Connection closed before sending anything");
            return;
        }
        Err(_) => {
            warn!(%peer, buffered = reader.read_buffer().len(), "Connection idle, closing");
            return;
        }
    };
    trace!(%peer, method = %message.method(), "Request received");

    let (reply_tx, reply_rx) = oneshot::channel();
    let request = Request {
        message,
        peer,
        reply: reply_tx,
    };
    if requests.send(request).await.is_err() {
        return;
    }
    let Ok(reply) = reply_rx.await else {
        return;
    };

    let mut writer = FramedWrite::new(write_half, MessageCodec::new());
    if let Err(e) = writer.send(reply).await {
        warn!(%peer, error = %e, "Failed to write reply");
    }
    let _ = writer.into_inner().shutdown().await;
    trace!(%peer, "Connection closed");
}
