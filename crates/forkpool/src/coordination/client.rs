//! Client side of the coordination protocol: one request per connection.
//!
//! The blocking entry points build a throwaway current-thread runtime per call, so no runtime
//! or reactor state is alive when the caller forks.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use super::message::{Message, MessageCodec, MessageError, Method};
use super::server::ServerStatus;
use crate::config::DEFAULT_REQUEST_TIMEOUT;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to coordination server at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("coordination exchange with {addr} failed: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("coordination request to {addr} timed out after {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },

    #[error("invalid reply from coordination server: {0}")]
    Message(#[from] MessageError),

    #[error("unexpected {got} reply to {request}")]
    UnexpectedReply { request: Method, got: Method },

    #[error("invalid {method} reply payload: {source}")]
    Payload {
        method: Method,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to build client runtime: {0}")]
    Runtime(#[source] io::Error),
}

#[derive(Debug, Clone)]
pub struct CoordinationClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl CoordinationClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Bound on a whole exchange: connect, write and read.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send one message and wait for the reply.
    pub async fn request(&self, message: &Message) -> Result<Message, TransportError> {
        tokio::time::timeout(self.timeout, self.exchange(message))
            .await
            .map_err(|_| TransportError::Timeout {
                addr: self.addr,
                timeout: self.timeout,
            })?
    }

    async fn exchange(&self, message: &Message) -> Result<Message, TransportError> {
        let addr = self.addr;
        let stream_err = |e| match e {
            MessageError::Io(source) => TransportError::Io { addr, source },
            other => TransportError::Message(other),
        };

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect { addr, source })?;
        let (read_half, write_half) = stream.into_split();

        let mut writer = FramedWrite::new(write_half, MessageCodec::new());
        writer.send(message.clone()).await.map_err(stream_err)?;
        writer
            .into_inner()
            .shutdown()
            .await
            .map_err(|source| TransportError::Io { addr, source })?;

        let mut reader = FramedRead::new(read_half, MessageCodec::new());
        let reply = match reader.next().await {
            Some(reply) => reply.map_err(stream_err)?,
            None => return Err(MessageError::Incomplete { buffered: 0 }.into()),
        };
        debug!(
            method = %message.method(),
            path = message.path(),
            status = %reply.method(),
            "Coordination exchange"
        );
        Ok(reply)
    }

    /// Blocking [`request`](Self::request). Must not be called from inside a tokio runtime.
    pub fn send(&self, message: &Message) -> Result<Message, TransportError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(TransportError::Runtime)?;
        runtime.block_on(self.request(message))
    }

    /// HIT with the stored value, or MISS.
    pub fn get(&self, path: &str) -> Result<Message, TransportError> {
        self.send(&Message::bare(Method::Get, path))
    }

    pub fn put(&self, path: &str, payload: Value) -> Result<Message, TransportError> {
        self.send(&Message::new(Method::Put, path, payload))
    }

    pub fn delete(&self, path: &str) -> Result<Message, TransportError> {
        self.send(&Message::bare(Method::Delete, path))
    }

    pub fn register(&self, lease: &str) -> Result<Message, TransportError> {
        self.send(&Message::bare(Method::Register, lease))
    }

    /// Release a lease. The reply's payload carries the remaining lease count.
    pub fn close(&self, lease: &str) -> Result<Message, TransportError> {
        self.send(&Message::bare(Method::Exit, lease))
    }

    pub fn status(&self) -> Result<ServerStatus, TransportError> {
        let path = std::process::id().to_string();
        let reply = self.send(&Message::bare(Method::Status, path))?;
        if reply.method() != Method::Ok {
            return Err(TransportError::UnexpectedReply {
                request: Method::Status,
                got: reply.method(),
            });
        }
        serde_json::from_value(reply.into_payload()).map_err(|source| TransportError::Payload {
            method: Method::Status,
            source,
        })
    }
}
