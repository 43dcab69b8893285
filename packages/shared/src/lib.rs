//! Shared utilities for the Hiroba real-time communication server.
//!
//! Cross-cutting concerns used by the server (and any future client crate):
//! time/clock abstraction and logging setup.

pub mod logger;
pub mod time;
