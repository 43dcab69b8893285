//! Channel management: create and delete.
//!
//! Deleting a voice channel kicks its participants and stops any screen
//! share before the channel row goes away, so no session state outlives the
//! entity it hangs off.

use std::sync::Arc;

use uuid::Uuid;

use crate::domain::{ChannelKind, DataStore, User};
use crate::infrastructure::dto::websocket::{
    ChannelDeletePayload, ChannelIdData, CreateChannelData, envelope,
};
use crate::infrastructure::registry::ConnectionRegistry;
use crate::infrastructure::relay::MediaRelay;

pub struct ChannelUseCase {
    store: Arc<dyn DataStore>,
    registry: Arc<ConnectionRegistry>,
    relay: Arc<MediaRelay>,
}

impl ChannelUseCase {
    pub fn new(
        store: Arc<dyn DataStore>,
        registry: Arc<ConnectionRegistry>,
        relay: Arc<MediaRelay>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            relay,
        })
    }

    pub async fn create_channel(&self, user: &User, d: CreateChannelData) {
        if d.name.is_empty() || d.name.len() > 32 {
            return;
        }
        let kind = match d.kind.as_str() {
            "text" => ChannelKind::Text,
            "voice" => ChannelKind::Voice,
            _ => return,
        };

        let channel_id = Uuid::new_v4().to_string();
        let channel = match self
            .store
            .create_channel(&channel_id, &d.name, kind, &user.id)
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                tracing::error!("create channel: {err}");
                return;
            }
        };

        self.registry
            .broadcast_all(&envelope("channel_create", &channel))
            .await;
    }

    pub async fn delete_channel(&self, user: &User, d: ChannelIdData) {
        if !self.can_manage(user, &d.channel_id).await {
            return;
        }

        // Kick voice participants first; each removal broadcasts its own
        // voice_state_update through the relay events
        if let Some(room) = self.relay.room(&d.channel_id).await {
            for user_id in room.peer_ids().await {
                room.remove_peer(&user_id).await;
            }
        }
        self.relay.stop_screen_share(&d.channel_id).await;

        if let Err(err) = self.store.delete_channel(&d.channel_id).await {
            tracing::error!("delete channel: {err}");
            return;
        }

        self.registry
            .broadcast_all(&envelope(
                "channel_delete",
                &ChannelDeletePayload {
                    channel_id: d.channel_id,
                },
            ))
            .await;
    }

    async fn can_manage(&self, user: &User, channel_id: &str) -> bool {
        if user.is_admin {
            return true;
        }
        self.store
            .is_channel_manager(channel_id, &user.id)
            .await
            .unwrap_or(false)
    }
}
