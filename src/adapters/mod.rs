//! Source adapters and their shared lifecycle plumbing.

pub mod handle;
pub mod hqp;
pub mod hqp_client;
pub mod hqp_discovery;
pub mod lms;
pub mod traits;

pub use traits::*;
