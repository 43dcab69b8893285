//! Connection lifecycle: authentication, the ready snapshot, presence
//! transitions, and disconnect cleanup.

use std::sync::Arc;

use hiroba_shared::time::Clock;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::domain::{DataStore, StoreError, User};
use crate::infrastructure::dto::websocket::{
    RadioPlaylistPayload, ReadyPayload, UserIdPayload, UserOnlinePayload, UserPayload, envelope,
};
use crate::infrastructure::registry::{ConnectionRegistry, OutboundSender};
use crate::infrastructure::relay::MediaRelay;
use crate::usecase::{MediaUseCase, RadioUseCase};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,

    #[error("account pending approval")]
    NotApproved,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ConnectUseCase {
    store: Arc<dyn DataStore>,
    registry: Arc<ConnectionRegistry>,
    relay: Arc<MediaRelay>,
    radio: Arc<RadioUseCase>,
    media: Arc<MediaUseCase>,
    clock: Arc<dyn Clock>,
}

impl ConnectUseCase {
    const UNREAD_NOTIFICATION_LIMIT: usize = 50;

    pub fn new(
        store: Arc<dyn DataStore>,
        registry: Arc<ConnectionRegistry>,
        relay: Arc<MediaRelay>,
        radio: Arc<RadioUseCase>,
        media: Arc<MediaUseCase>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            relay,
            radio,
            media,
            clock,
        })
    }

    /// Resolve a session token to an approved account.
    pub async fn authenticate(&self, token: &str) -> Result<User, AuthError> {
        let user = self
            .store
            .get_user_by_token(token)
            .await?
            .ok_or(AuthError::InvalidToken)?;
        if !user.approved {
            return Err(AuthError::NotApproved);
        }
        Ok(user)
    }

    /// Register the authenticated connection; announces presence when this
    /// is the user's first live connection.
    pub async fn register(
        &self,
        conn_id: Uuid,
        user: &User,
        tx: OutboundSender,
        abort: Arc<Notify>,
    ) {
        let first = self.registry.register(conn_id, user, tx, abort).await;
        if first {
            self.registry
                .broadcast_except_user(
                    &user.id,
                    &envelope(
                        "user_online",
                        &UserOnlinePayload {
                            user: UserPayload::from(user),
                        },
                    ),
                )
                .await;
        }
    }

    /// Full state snapshot so a new client renders without further round
    /// trips.
    pub async fn build_ready(&self, user: &User) -> Result<ReadyPayload, StoreError> {
        let channels = self.store.get_all_channels().await?;
        let deleted_channels = if user.is_admin {
            self.store.get_deleted_channels().await.unwrap_or_default()
        } else {
            Vec::new()
        };

        let all_users: Vec<UserPayload> = self
            .store
            .get_all_users()
            .await?
            .iter()
            .filter(|u| u.approved)
            .map(UserPayload::from)
            .collect();

        let notifications = self
            .store
            .get_unread_notifications(&user.id, Self::UNREAD_NOTIFICATION_LIMIT)
            .await
            .unwrap_or_default();

        let media_list = self.store.get_all_media().await.unwrap_or_default();
        let radio_stations = self.store.get_all_stations().await.unwrap_or_default();

        let mut radio_playlists = Vec::new();
        for playlist in self.store.get_all_playlists().await.unwrap_or_default() {
            let tracks = self
                .store
                .get_tracks_by_playlist(&playlist.id)
                .await
                .unwrap_or_default();
            radio_playlists.push(RadioPlaylistPayload {
                id: playlist.id,
                name: playlist.name,
                user_id: playlist.user_id,
                station_id: playlist.station_id,
                tracks,
            });
        }

        Ok(ReadyPayload {
            user: UserPayload::from(user),
            channels,
            online_users: self.registry.online_users().await,
            all_users,
            voice_states: self.relay.voice_states().await,
            notifications,
            screen_shares: self.relay.screen_shares().await,
            media_list,
            media_playback: self.media.snapshot().await,
            radio_stations,
            radio_playlists,
            radio_playback: self.radio.all_playback().await,
            radio_listeners: self.radio.all_listeners().await,
            server_time: self.clock.now_unix_secs(),
            deleted_channels,
        })
    }

    /// Tear down everything a closing connection held, in dependency order:
    /// screen roles, voice participant, radio tuning, then presence.
    pub async fn disconnect(&self, conn_id: Uuid, user_id: &str) {
        self.relay.drop_screen_roles_for_connection(conn_id).await;

        if let Some(room) = self.relay.user_room(user_id).await {
            let owns_voice = room
                .peer(user_id)
                .await
                .is_some_and(|peer| peer.conn_id == conn_id);
            if owns_voice {
                room.remove_peer(user_id).await;
            }
        }

        self.radio.untune(conn_id).await;

        if let Some(outcome) = self.registry.unregister(conn_id).await {
            if outcome.last_connection {
                self.registry
                    .broadcast_all(&envelope(
                        "user_offline",
                        &UserIdPayload {
                            user_id: outcome.user_id,
                        },
                    ))
                    .await;
            }
        }
    }

    // --- hooks for the API layer ---

    /// Moderation: drop every connection of a user.
    pub async fn force_disconnect(&self, user_id: &str) {
        self.registry.force_disconnect_user(user_id).await;
    }

    /// Announce that an account was approved (it may now authenticate).
    pub async fn announce_user_approved(&self, user: &User) {
        self.registry
            .broadcast_all(&envelope(
                "user_approved",
                &UserOnlinePayload {
                    user: UserPayload::from(user),
                },
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChannelKind;
    use crate::infrastructure::store::InMemoryDataStore;
    use crate::usecase::HubRelayEvents;
    use hiroba_shared::time::FixedClock;
    use tokio::sync::mpsc;

    struct Harness {
        connect: Arc<ConnectUseCase>,
        registry: Arc<ConnectionRegistry>,
        store: Arc<InMemoryDataStore>,
    }

    async fn setup() -> Harness {
        let store = Arc::new(InMemoryDataStore::new());
        store
            .create_channel("general", "general", ChannelKind::Text, "admin")
            .await
            .unwrap();
        store.seed_user(User::new("alice", "alice"), "tok-alice").await;
        store
            .seed_user(
                User {
                    approved: false,
                    ..User::new("pending", "pending")
                },
                "tok-pending",
            )
            .await;

        let registry = Arc::new(ConnectionRegistry::new());
        let relay = MediaRelay::new("", "", HubRelayEvents::new(Arc::clone(&registry))).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(1234.5));
        let radio = RadioUseCase::new(
            store.clone() as Arc<dyn DataStore>,
            Arc::clone(&registry),
            Arc::clone(&clock),
        );
        let media = MediaUseCase::new(Arc::clone(&registry), Arc::clone(&clock));
        let connect = ConnectUseCase::new(
            store.clone() as Arc<dyn DataStore>,
            Arc::clone(&registry),
            relay,
            radio,
            media,
            clock,
        );
        Harness {
            connect,
            registry,
            store,
        }
    }

    #[tokio::test]
    async fn test_authenticate_accepts_valid_token() {
        // given:
        let harness = setup().await;

        // when:
        let user = harness.connect.authenticate("tok-alice").await.unwrap();

        // then:
        assert_eq!(user.id, "alice");
    }

    #[tokio::test]
    async fn test_authenticate_rejects_unknown_and_unapproved() {
        // given:
        let harness = setup().await;

        // when / then:
        assert!(matches!(
            harness.connect.authenticate("tok-nope").await,
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            harness.connect.authenticate("tok-pending").await,
            Err(AuthError::NotApproved)
        ));
    }

    #[tokio::test]
    async fn test_ready_contains_clock_anchor_and_snapshot() {
        // given:
        let harness = setup().await;
        let alice = harness.connect.authenticate("tok-alice").await.unwrap();

        // when:
        let ready = harness.connect.build_ready(&alice).await.unwrap();

        // then:
        assert_eq!(ready.server_time, 1234.5);
        assert_eq!(ready.user.id, "alice");
        assert_eq!(ready.channels.len(), 1);
        assert!(ready.voice_states.is_empty());
        assert!(ready.media_playback.is_none());
        // unapproved accounts are not listed
        assert!(ready.all_users.iter().all(|u| u.id != "pending"));
        // non-admin sees no tombstones
        assert!(ready.deleted_channels.is_empty());
    }

    #[tokio::test]
    async fn test_first_connection_announces_online_once() {
        // given: bob observing
        let harness = setup().await;
        let bob = User::new("bob", "bob");
        let (bob_tx, mut bob_rx) = mpsc::channel(32);
        harness
            .registry
            .register(Uuid::new_v4(), &bob, bob_tx, Arc::new(Notify::new()))
            .await;

        let alice = User::new("alice", "alice");

        // when: alice connects twice (desktop + browser)
        let (tx1, _rx1) = mpsc::channel(32);
        let (tx2, _rx2) = mpsc::channel(32);
        harness
            .connect
            .register(Uuid::new_v4(), &alice, tx1, Arc::new(Notify::new()))
            .await;
        harness
            .connect
            .register(Uuid::new_v4(), &alice, tx2, Arc::new(Notify::new()))
            .await;

        // then: exactly one user_online
        let mut online_events = 0;
        while let Ok(text) = bob_rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["op"] == "user_online" {
                online_events += 1;
            }
        }
        assert_eq!(online_events, 1);
    }

    #[tokio::test]
    async fn test_last_disconnect_announces_offline_once() {
        // given: alice connected twice, bob observing
        let harness = setup().await;
        let bob = User::new("bob", "bob");
        let (bob_tx, mut bob_rx) = mpsc::channel(32);
        harness
            .registry
            .register(Uuid::new_v4(), &bob, bob_tx, Arc::new(Notify::new()))
            .await;

        let alice = User::new("alice", "alice");
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let (tx1, _rx1) = mpsc::channel(32);
        let (tx2, _rx2) = mpsc::channel(32);
        harness
            .connect
            .register(c1, &alice, tx1, Arc::new(Notify::new()))
            .await;
        harness
            .connect
            .register(c2, &alice, tx2, Arc::new(Notify::new()))
            .await;
        while bob_rx.try_recv().is_ok() {}

        // when: both connections close
        harness.connect.disconnect(c1, "alice").await;
        harness.connect.disconnect(c2, "alice").await;

        // then: exactly one user_offline
        let mut offline_events = 0;
        while let Ok(text) = bob_rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["op"] == "user_offline" {
                offline_events += 1;
            }
        }
        assert_eq!(offline_events, 1);
        assert!(!harness.registry.is_online("alice").await);
    }

    #[tokio::test]
    async fn test_ready_lists_radio_playlists_with_tracks() {
        // given:
        let harness = setup().await;
        harness
            .store
            .seed_playlist(
                crate::domain::Playlist {
                    id: "pl-1".to_string(),
                    name: "mix".to_string(),
                    user_id: "dj".to_string(),
                    station_id: "st-1".to_string(),
                },
                vec![crate::domain::Track {
                    id: "t-1".to_string(),
                    filename: "a.ogg".to_string(),
                    url: "/a.ogg".to_string(),
                    duration: 60.0,
                    position: 0,
                }],
            )
            .await;
        let alice = harness.connect.authenticate("tok-alice").await.unwrap();

        // when:
        let ready = harness.connect.build_ready(&alice).await.unwrap();

        // then:
        assert_eq!(ready.radio_playlists.len(), 1);
        assert_eq!(ready.radio_playlists[0].tracks.len(), 1);
    }
}
