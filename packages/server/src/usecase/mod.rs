//! Use cases: the semantics behind each routed operation family.
//!
//! Each use case owns the per-entity state it mutates and broadcasts the
//! resulting events through the connection registry. Authorization failures
//! are silent no-ops; store failures abort before any broadcast.

mod channels;
mod chat;
mod connect;
mod media;
mod radio;
mod screen;
mod voice;

pub use channels::ChannelUseCase;
pub use chat::ChatUseCase;
pub use connect::{AuthError, ConnectUseCase};
pub use media::MediaUseCase;
pub use radio::RadioUseCase;
pub use screen::ScreenUseCase;
pub use voice::VoiceUseCase;

use std::sync::Arc;

use async_trait::async_trait;

use crate::infrastructure::dto::websocket::{ScreenSharePayload, VoiceStatePayload, envelope};
use crate::infrastructure::registry::ConnectionRegistry;
use crate::infrastructure::relay::RelayEvents;

/// Bridges relay callbacks back onto the hub's broadcast paths.
pub struct HubRelayEvents {
    registry: Arc<ConnectionRegistry>,
}

impl HubRelayEvents {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Arc<Self> {
        Arc::new(Self { registry })
    }
}

#[async_trait]
impl RelayEvents for HubRelayEvents {
    async fn signal(&self, user_id: &str, envelope: String) {
        self.registry.send_to_user(user_id, &envelope).await;
    }

    async fn voice_left(&self, user_id: &str) {
        // channel_id: null is the client-visible "left voice" signal
        self.registry
            .broadcast_all(&envelope(
                "voice_state_update",
                &VoiceStatePayload::left(user_id),
            ))
            .await;
    }

    async fn screen_share_stopped(&self, presenter_id: &str, channel_id: &str) {
        self.registry
            .broadcast_all(&envelope(
                "screen_share_stopped",
                &ScreenSharePayload {
                    user_id: presenter_id.to_string(),
                    channel_id: channel_id.to_string(),
                },
            ))
            .await;
    }
}
