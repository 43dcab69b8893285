//! Transport surface: axum router, WebSocket handling, app state wiring.

pub mod handler;
pub mod server;
pub mod state;

pub use server::{router, run_server};
pub use state::AppState;
