//! Hiroba real-time session hub.
//!
//! This library holds all transient, in-memory, per-connection and
//! per-session state of a self-hosted communication server: the connection
//! registry and presence, the event router, the WebRTC media relay for voice
//! and screen share, and the clock-anchored synchronized playback engine.
//! Durable storage is an external collaborator behind the
//! [`domain::DataStore`] trait.

// layers
pub mod domain;
pub mod infrastructure;
pub mod ui;
pub mod usecase;

pub mod config;
