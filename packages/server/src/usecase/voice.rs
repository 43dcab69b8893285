//! Voice: join/leave, state flags, signaling forwarding.

use std::sync::Arc;

use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::domain::{ChannelKind, DataStore, User};
use crate::infrastructure::dto::websocket::{
    ChannelIdData, ServerMuteData, VoiceStatePayload, envelope,
};
use crate::infrastructure::registry::ConnectionRegistry;
use crate::infrastructure::relay::{MediaRelay, VoicePeer};

pub struct VoiceUseCase {
    store: Arc<dyn DataStore>,
    registry: Arc<ConnectionRegistry>,
    relay: Arc<MediaRelay>,
}

impl VoiceUseCase {
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

    /// Join a voice channel, leaving any current one first: a user holds at
    /// most one voice participant at a time.
    pub async fn join(&self, user: &User, conn_id: Uuid, d: ChannelIdData) {
        let Ok(Some(channel)) = self.store.get_channel(&d.channel_id).await else {
            return;
        };
        if channel.kind != ChannelKind::Voice {
            return;
        }

        if let Some(current) = self.relay.user_room(&user.id).await {
            // the removal broadcasts the leave through the relay events
            current.remove_peer(&user.id).await;
        }

        let room = self.relay.get_or_create_room(&d.channel_id).await;
        let peer = match room.add_peer(&user.id, conn_id).await {
            Ok(peer) => peer,
            Err(err) => {
                tracing::error!(user_id = %user.id, channel_id = %d.channel_id, "join voice: {err}");
                return;
            }
        };

        self.broadcast_state(&peer).await;
    }

    pub async fn leave(&self, user: &User) {
        // presenting ends with the voice session
        if let Some(screen_room) = self.relay.presenter_screen_room(&user.id).await {
            let channel_id = screen_room.channel_id().to_string();
            self.relay.stop_screen_share(&channel_id).await;
        }

        match self.relay.user_room(&user.id).await {
            Some(room) => {
                // remove_peer broadcasts the leave
                room.remove_peer(&user.id).await;
            }
            None => {
                // client thought it was in voice; confirm the leave anyway
                self.registry
                    .broadcast_all(&envelope(
                        "voice_state_update",
                        &VoiceStatePayload::left(&user.id),
                    ))
                    .await;
            }
        }
    }

    pub async fn set_self_mute(&self, user: &User, muted: bool) {
        if let Some(peer) = self.peer_of(&user.id).await {
            peer.set_self_mute(muted).await;
            self.broadcast_state(&peer).await;
        }
    }

    pub async fn set_self_deafen(&self, user: &User, deafened: bool) {
        if let Some(peer) = self.peer_of(&user.id).await {
            peer.set_self_deafen(deafened).await;
            self.broadcast_state(&peer).await;
        }
    }

    pub async fn set_speaking(&self, user: &User, speaking: bool) {
        if let Some(peer) = self.peer_of(&user.id).await {
            peer.set_speaking(speaking).await;
            self.broadcast_state(&peer).await;
        }
    }

    /// Admin-imposed mute; also enforced at the RTP forwarding loop.
    pub async fn set_server_mute(&self, caller: &User, d: ServerMuteData) {
        if !caller.is_admin {
            return;
        }
        if let Some(peer) = self.peer_of(&d.user_id).await {
            peer.set_server_mute(d.muted).await;
            self.broadcast_state(&peer).await;
        }
    }

    pub async fn handle_answer(&self, user: &User, sdp: &str) {
        if let Some(room) = self.relay.user_room(&user.id).await {
            room.handle_answer(&user.id, sdp).await;
        }
    }

    pub async fn handle_ice(&self, user: &User, candidate: RTCIceCandidateInit) {
        if let Some(room) = self.relay.user_room(&user.id).await {
            room.handle_ice(&user.id, candidate).await;
        }
    }

    async fn peer_of(&self, user_id: &str) -> Option<Arc<VoicePeer>> {
        self.relay.user_room(user_id).await?.peer(user_id).await
    }

    async fn broadcast_state(&self, peer: &Arc<VoicePeer>) {
        let state = peer.voice_state().await;
        self.registry
            .broadcast_all(&envelope("voice_state_update", &state))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::InMemoryDataStore;
    use crate::usecase::HubRelayEvents;
    use tokio::sync::{Notify, mpsc};

    async fn setup() -> (
        Arc<VoiceUseCase>,
        Arc<InMemoryDataStore>,
        Arc<ConnectionRegistry>,
        mpsc::Receiver<String>,
    ) {
        let store = Arc::new(InMemoryDataStore::new());
        store
            .create_channel("general", "general", ChannelKind::Voice, "admin")
            .await
            .unwrap();
        store
            .create_channel("music", "music", ChannelKind::Voice, "admin")
            .await
            .unwrap();
        store
            .create_channel("textual", "textual", ChannelKind::Text, "admin")
            .await
            .unwrap();

        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, rx) = mpsc::channel(64);
        registry
            .register(
                Uuid::new_v4(),
                &User::new("observer", "observer"),
                tx,
                Arc::new(Notify::new()),
            )
            .await;

        let relay = MediaRelay::new("", "", HubRelayEvents::new(Arc::clone(&registry))).unwrap();
        let voice = VoiceUseCase::new(
            store.clone() as Arc<dyn DataStore>,
            Arc::clone(&registry),
            relay,
        );
        (voice, store, registry, rx)
    }

    async fn drain_ops(rx: &mut mpsc::Receiver<String>) -> Vec<serde_json::Value> {
        let mut ops = Vec::new();
        while let Ok(text) = rx.try_recv() {
            ops.push(serde_json::from_str(&text).unwrap());
        }
        ops
    }

    fn channel(id: &str) -> ChannelIdData {
        ChannelIdData {
            channel_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_join_broadcasts_voice_state() {
        // given:
        let (voice, _store, _registry, mut rx) = setup().await;

        // when:
        voice
            .join(&User::new("alice", "alice"), Uuid::new_v4(), channel("general"))
            .await;

        // then:
        let ops = drain_ops(&mut rx).await;
        let update = ops
            .iter()
            .find(|v| v["op"] == "voice_state_update")
            .expect("voice_state_update");
        assert_eq!(update["d"]["user_id"], "alice");
        assert_eq!(update["d"]["channel_id"], "general");
    }

    #[tokio::test]
    async fn test_join_into_text_channel_is_rejected() {
        // given:
        let (voice, _store, _registry, mut rx) = setup().await;

        // when:
        voice
            .join(&User::new("alice", "alice"), Uuid::new_v4(), channel("textual"))
            .await;

        // then:
        assert!(drain_ops(&mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_switching_channels_is_leave_then_join() {
        // given: alice in general
        let (voice, _store, _registry, mut rx) = setup().await;
        let alice = User::new("alice", "alice");
        voice.join(&alice, Uuid::new_v4(), channel("general")).await;
        drain_ops(&mut rx).await;

        // when: she joins music
        voice.join(&alice, Uuid::new_v4(), channel("music")).await;

        // then: exactly one leave (null channel) before the music join —
        // never two simultaneous memberships
        let ops = drain_ops(&mut rx).await;
        let updates: Vec<&serde_json::Value> = ops
            .iter()
            .filter(|v| v["op"] == "voice_state_update")
            .collect();
        assert_eq!(updates.len(), 2);
        assert!(updates[0]["d"]["channel_id"].is_null());
        assert_eq!(updates[1]["d"]["channel_id"], "music");
    }

    #[tokio::test]
    async fn test_mute_is_state_only_and_broadcast() {
        // given:
        let (voice, _store, _registry, mut rx) = setup().await;
        let alice = User::new("alice", "alice");
        voice.join(&alice, Uuid::new_v4(), channel("general")).await;
        drain_ops(&mut rx).await;

        // when:
        voice.set_self_mute(&alice, true).await;

        // then: flags broadcast, membership intact
        let ops = drain_ops(&mut rx).await;
        let update = &ops[0];
        assert_eq!(update["d"]["self_mute"], true);
        assert_eq!(update["d"]["channel_id"], "general");
    }

    #[tokio::test]
    async fn test_server_mute_requires_admin() {
        // given:
        let (voice, _store, _registry, mut rx) = setup().await;
        let alice = User::new("alice", "alice");
        voice.join(&alice, Uuid::new_v4(), channel("general")).await;
        drain_ops(&mut rx).await;

        // when: a non-admin tries to server-mute
        voice
            .set_server_mute(
                &User::new("bob", "bob"),
                ServerMuteData {
                    user_id: "alice".to_string(),
                    muted: true,
                },
            )
            .await;

        // then: silently rejected
        assert!(drain_ops(&mut rx).await.is_empty());

        // when: an admin does it
        voice
            .set_server_mute(
                &User::admin("root", "root"),
                ServerMuteData {
                    user_id: "alice".to_string(),
                    muted: true,
                },
            )
            .await;

        // then:
        let ops = drain_ops(&mut rx).await;
        assert_eq!(ops[0]["d"]["server_mute"], true);
    }

    #[tokio::test]
    async fn test_leave_without_membership_still_confirms() {
        // given:
        let (voice, _store, _registry, mut rx) = setup().await;

        // when: a client leaves without being anywhere
        voice.leave(&User::new("ghost", "ghost")).await;

        // then: the null-channel confirmation still goes out
        let ops = drain_ops(&mut rx).await;
        assert_eq!(ops.len(), 1);
        assert!(ops[0]["d"]["channel_id"].is_null());
    }
}
