//! Screen share: start/stop, viewer subscription, signaling forwarding.
//!
//! Negotiation failures the client must react to are the one place the hub
//! answers with an explicit error (`screen_share_error`) instead of a silent
//! no-op.

use std::sync::Arc;

use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::infrastructure::dto::websocket::{
    ChannelIdData, ScreenShareErrorPayload, ScreenSharePayload, envelope,
};
use crate::infrastructure::registry::ConnectionRegistry;
use crate::infrastructure::relay::MediaRelay;
use crate::domain::User;

pub struct ScreenUseCase {
    registry: Arc<ConnectionRegistry>,
    relay: Arc<MediaRelay>,
}

impl ScreenUseCase {
    pub fn new(registry: Arc<ConnectionRegistry>, relay: Arc<MediaRelay>) -> Arc<Self> {
        Arc::new(Self { registry, relay })
    }

    /// Start presenting in the caller's current voice channel. Rejected with
    /// an error event when no voice membership exists or a presenter is
    /// already active in the channel.
    pub async fn start(&self, user: &User, conn_id: Uuid) {
        let Some(room) = self.relay.user_room(&user.id).await else {
            self.send_error(conn_id, "must be in a voice channel to share screen")
                .await;
            return;
        };
        let channel_id = room.channel_id().to_string();

        if let Err(err) = self
            .relay
            .start_screen_share(&channel_id, &user.id, conn_id)
            .await
        {
            tracing::warn!(user_id = %user.id, "screen share start: {err}");
            self.send_error(conn_id, &err.to_string()).await;
            return;
        }

        self.registry
            .broadcast_all(&envelope(
                "screen_share_started",
                &ScreenSharePayload {
                    user_id: user.id.clone(),
                    channel_id,
                },
            ))
            .await;
    }

    pub async fn stop(&self, user: &User) {
        let Some(room) = self.relay.presenter_screen_room(&user.id).await else {
            return;
        };
        // stop broadcasts screen_share_stopped through the relay events
        let channel_id = room.channel_id().to_string();
        self.relay.stop_screen_share(&channel_id).await;
    }

    pub async fn subscribe(&self, user: &User, conn_id: Uuid, d: ChannelIdData) {
        let Some(room) = self.relay.screen_room(&d.channel_id).await else {
            self.send_error(conn_id, "no active screen share in this channel")
                .await;
            return;
        };
        if let Err(err) = room.add_viewer(&user.id, conn_id).await {
            tracing::warn!(user_id = %user.id, "screen share subscribe: {err}");
        }
    }

    pub async fn unsubscribe(&self, user: &User, d: ChannelIdData) {
        if let Some(room) = self.relay.screen_room(&d.channel_id).await {
            room.remove_viewer(&user.id).await;
        }
    }

    pub async fn handle_answer(&self, user: &User, sdp: &str, role: &str) {
        self.relay.handle_screen_answer(&user.id, sdp, role).await;
    }

    pub async fn handle_ice(&self, user: &User, candidate: RTCIceCandidateInit, role: &str) {
        self.relay.handle_screen_ice(&user.id, candidate, role).await;
    }

    async fn send_error(&self, conn_id: Uuid, error: &str) {
        self.registry
            .send_to_connection(
                conn_id,
                &envelope(
                    "screen_share_error",
                    &ScreenShareErrorPayload {
                        error: error.to_string(),
                    },
                ),
            )
            .await;
    }
}
