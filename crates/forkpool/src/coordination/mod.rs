//! Loopback coordination service.
//!
//! - **message**: wire envelope, stream codec and chunk reassembly
//! - **server**: single-owner key-value and lease store behind a TCP listener
//! - **client**: one request per connection, async or blocking
//! - **spawn**: one server per process tree, leased by the processes that use it

pub mod client;
pub mod message;
pub mod server;
#[cfg(unix)]
pub(crate) mod spawn;

pub use client::{CoordinationClient, TransportError};
pub use message::{Message, MessageCodec, MessageError, Method, PartialMessage};
pub use server::{CoordinationServer, ServerState, ServerStatus};
