//! Hiroba real-time communication server.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin hiroba-server
//! cargo run --bin hiroba-server -- --host 0.0.0.0 --port 3000
//! ```
//!
//! Standalone mode seeds an in-memory store with an admin account and logs
//! its session token; a durable store and the HTTP API layer (registration,
//! uploads) are external collaborators plugged in around this hub.

use std::sync::Arc;

use clap::Parser;
use uuid::Uuid;

use hiroba_server::config::Config;
use hiroba_server::domain::{ChannelKind, DataStore, User};
use hiroba_server::infrastructure::store::InMemoryDataStore;
use hiroba_server::ui::{AppState, run_server};
use hiroba_shared::logger::setup_logger;
use hiroba_shared::time::SystemClock;

#[tokio::main]
async fn main() {
    setup_logger(env!("CARGO_BIN_NAME"), "info");

    let config = Config::parse();

    // Standalone in-memory store with a usable default world
    let store = Arc::new(InMemoryDataStore::new());
    let admin_token = Uuid::new_v4().to_string();
    store
        .seed_user(User::admin("admin", "admin"), &admin_token)
        .await;
    if let Err(err) = store
        .create_channel("general", "general", ChannelKind::Text, "admin")
        .await
    {
        tracing::error!("seed text channel: {err}");
    }
    if let Err(err) = store
        .create_channel("voice", "voice", ChannelKind::Voice, "admin")
        .await
    {
        tracing::error!("seed voice channel: {err}");
    }
    tracing::info!("admin session token: {admin_token}");

    let state = match AppState::build(
        store as Arc<dyn DataStore>,
        Arc::new(SystemClock),
        &config,
    ) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!("media relay init: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run_server(&config, state).await {
        tracing::error!("server error: {err}");
        std::process::exit(1);
    }
}
