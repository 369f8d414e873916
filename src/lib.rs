//! tonebridge - source-agnostic hi-fi control bridge.
//!
//! The adapter/bus/aggregator runtime behind one HTTP + SSE surface:
//! - in-process event bus with typed events
//! - zone aggregator (single source of truth for zone listings)
//! - adapter handles with a crash/restart budget and shutdown ACKs
//! - adapter coordinator (enable flags, command routing, graceful shutdown)
//! - DSP pipeline client (TCP/XML control protocol + UDP multicast
//!   discovery) and an LMS JSON-RPC adapter

// Deny the patterns that bite at 2am. Panics belong to tests and to genuine
// invariant violations only.
#![deny(unsafe_code)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

pub mod adapters;
pub mod aggregator;
pub mod api;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;

pub use api::Bridge;
pub use error::{BridgeError, Result};
