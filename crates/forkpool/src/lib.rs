//! forkpool: run closures in forked child processes, a bounded number at a time, and
//! collect their JSON results in submission order.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐  fork   ┌──────────────┐
//! │ ForkManager              │────────►│ child task   │
//! │  ForkHandle (id, status) │         └──────┬───────┘
//! │  poll: GET /fork/<pid>   │                │ PUT /fork/<pid>
//! └────────────┬─────────────┘                ▼
//!              │           ┌───────────────────────────────┐
//!              └──────────►│ coordination server (loopback) │
//!                          │  key-value store + leases      │
//!                          └───────────────────────────────┘
//! ```
//!
//! The coordination server is itself a forked process, started once per process tree and
//! shut down when the last manager that leased it goes away. Where `fork` is unavailable,
//! or when asked to, forks run inline with the same interface.
//!
//! # Failures
//!
//! A task's error or panic is captured as a [`CapturedError`] and delivered as its result;
//! it never unwinds into the manager. [`ForkError`] is reserved for the machinery itself:
//! the OS refusing to fork, the coordination server being unreachable, an interrupt, or a
//! strict-mode timeout.

pub mod config;
pub mod coordination;
mod error;
pub mod fork;
mod interrupt;
pub mod logging;
mod manager;

pub use config::{CoordinationConfig, ForkManagerConfig};
pub use error::ForkError;
pub use fork::{CapturedError, ForkHandle, ForkId, ForkOutcome, ForkStatus, Role, TaskFailure};
pub use manager::{ForkBuilder, ForkManager};
