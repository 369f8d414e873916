//! Scripted protocol servers used by the integration tests.

pub mod hqplayer;
pub mod lms;
