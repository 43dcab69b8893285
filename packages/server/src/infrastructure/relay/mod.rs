//! Server-mediated WebRTC relay for voice and screen share.
//!
//! Star topology: every client holds exactly one media connection to the
//! server per active role (voice, screen presenter, screen viewer), and the
//! server forwards RTP between them. The server always initiates
//! negotiation: it creates offers reflecting the current track set, the
//! client answers, and ICE candidates flow both ways as separate envelopes.
//!
//! Renegotiation churn is O(participants) per join/leave and total forwarded
//! tracks per channel are O(N²) in the worst case — an accepted limit for a
//! self-hosted single-node deployment, not meant for large rooms.

mod peer;
mod screen_room;
mod voice_room;

pub use peer::{NegotiationPhase, VoicePeer};
pub use screen_room::ScreenRoom;
pub use voice_room::VoiceRoom;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

use super::dto::websocket::{ScreenSharePayload, VoiceStatePayload};

/// How long the relay waits for a client's answer before logging the leg as
/// lost. The session itself is never blocked on this.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Fmtp line for voice Opus: FEC + DTX, capped average bitrate.
const OPUS_VOICE_FMTP: &str = "minptime=10;useinbandfec=1;usedtx=1;maxaveragebitrate=128000";
/// Fmtp line for screen-share audio.
const OPUS_SCREEN_FMTP: &str = "minptime=10;useinbandfec=1";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("webrtc engine error: {0}")]
    Engine(#[from] webrtc::Error),

    #[error("screen share already active in channel {0}")]
    ScreenShareActive(String),

    #[error("relay shut down")]
    Shutdown,
}

/// Signals the relay sends back to the hub.
///
/// The relay knows nothing about connections or broadcasting; the hub
/// implements this seam on top of the connection registry.
#[async_trait]
pub trait RelayEvents: Send + Sync {
    /// Deliver a pre-encoded signaling envelope to every connection of a user.
    async fn signal(&self, user_id: &str, envelope: String);

    /// A voice participant is gone (leave, transport failure, disconnect).
    async fn voice_left(&self, user_id: &str);

    /// A screen share ended (stop, presenter failure, disconnect).
    async fn screen_share_stopped(&self, presenter_id: &str, channel_id: &str);
}

pub struct MediaRelay {
    voice_api: API,
    screen_api: API,
    config: RTCConfiguration,
    rooms: Mutex<HashMap<String, Arc<VoiceRoom>>>,
    screen_rooms: Mutex<HashMap<String, Arc<ScreenRoom>>>,
    events: Arc<dyn RelayEvents>,
}

impl MediaRelay {
    pub fn new(
        stun_server: &str,
        public_ip: &str,
        events: Arc<dyn RelayEvents>,
    ) -> Result<Arc<Self>, RelayError> {
        let voice_api = build_voice_api(public_ip)?;
        let screen_api = build_screen_api(public_ip)?;

        let mut ice_servers = Vec::new();
        if !stun_server.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_server.to_string()],
                ..Default::default()
            });
        }

        Ok(Arc::new(Self {
            voice_api,
            screen_api,
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
            rooms: Mutex::new(HashMap::new()),
            screen_rooms: Mutex::new(HashMap::new()),
            events,
        }))
    }

    pub(crate) fn voice_api(&self) -> &API {
        &self.voice_api
    }

    pub(crate) fn screen_api(&self) -> &API {
        &self.screen_api
    }

    pub(crate) fn pc_config(&self) -> RTCConfiguration {
        self.config.clone()
    }

    pub(crate) fn events(&self) -> Arc<dyn RelayEvents> {
        Arc::clone(&self.events)
    }

    // --- voice rooms ---

    pub async fn get_or_create_room(self: &Arc<Self>, channel_id: &str) -> Arc<VoiceRoom> {
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(channel_id) {
            return Arc::clone(room);
        }
        let room = VoiceRoom::new(channel_id.to_string(), Arc::downgrade(self));
        rooms.insert(channel_id.to_string(), Arc::clone(&room));
        room
    }

    pub async fn room(&self, channel_id: &str) -> Option<Arc<VoiceRoom>> {
        self.rooms.lock().await.get(channel_id).cloned()
    }

    /// The room a user currently participates in, if any.
    pub async fn user_room(&self, user_id: &str) -> Option<Arc<VoiceRoom>> {
        let rooms: Vec<Arc<VoiceRoom>> = self.rooms.lock().await.values().cloned().collect();
        for room in rooms {
            if room.has_peer(user_id).await {
                return Some(room);
            }
        }
        None
    }

    /// Drop a room that reported itself empty, unless someone joined since.
    pub(crate) async fn remove_room_if_empty(&self, channel_id: &str) {
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(channel_id) {
            if room.is_empty().await {
                rooms.remove(channel_id);
            }
        }
    }

    /// Snapshot of all voice participants for the ready payload.
    pub async fn voice_states(&self) -> Vec<VoiceStatePayload> {
        let rooms: Vec<Arc<VoiceRoom>> = self.rooms.lock().await.values().cloned().collect();
        let mut states = Vec::new();
        for room in rooms {
            states.extend(room.voice_states().await);
        }
        states
    }

    // --- screen rooms ---

    /// Start a share. Exactly one presenter per channel: a second start while
    /// one is active is rejected.
    pub async fn start_screen_share(
        self: &Arc<Self>,
        channel_id: &str,
        presenter_id: &str,
        presenter_conn: Uuid,
    ) -> Result<(), RelayError> {
        let room = {
            let mut screen_rooms = self.screen_rooms.lock().await;
            if screen_rooms.contains_key(channel_id) {
                return Err(RelayError::ScreenShareActive(channel_id.to_string()));
            }
            let room = ScreenRoom::new(
                channel_id.to_string(),
                presenter_id.to_string(),
                presenter_conn,
                Arc::downgrade(self),
            );
            screen_rooms.insert(channel_id.to_string(), Arc::clone(&room));
            room
        };

        if let Err(err) = room.setup_presenter().await {
            self.screen_rooms.lock().await.remove(channel_id);
            return Err(err);
        }
        Ok(())
    }

    /// Tear down a channel's share (all viewer legs included) and notify the
    /// hub.
    pub async fn stop_screen_share(&self, channel_id: &str) {
        let room = self.screen_rooms.lock().await.remove(channel_id);
        let Some(room) = room else {
            return;
        };
        room.stop().await;
        self.events
            .screen_share_stopped(room.presenter_id(), channel_id)
            .await;
    }

    pub async fn screen_room(&self, channel_id: &str) -> Option<Arc<ScreenRoom>> {
        self.screen_rooms.lock().await.get(channel_id).cloned()
    }

    /// The share a user is presenting, if any.
    pub async fn presenter_screen_room(&self, user_id: &str) -> Option<Arc<ScreenRoom>> {
        self.screen_rooms
            .lock()
            .await
            .values()
            .find(|room| room.presenter_id() == user_id)
            .cloned()
    }

    pub async fn screen_shares(&self) -> Vec<ScreenSharePayload> {
        self.screen_rooms
            .lock()
            .await
            .values()
            .map(|room| ScreenSharePayload {
                user_id: room.presenter_id().to_string(),
                channel_id: room.channel_id().to_string(),
            })
            .collect()
    }

    pub async fn handle_screen_answer(&self, user_id: &str, sdp: &str, role: &str) {
        let rooms: Vec<Arc<ScreenRoom>> =
            self.screen_rooms.lock().await.values().cloned().collect();
        for room in rooms {
            if room.handle_answer(user_id, sdp, role).await {
                return;
            }
        }
    }

    pub async fn handle_screen_ice(&self, user_id: &str, candidate: RTCIceCandidateInit, role: &str) {
        let rooms: Vec<Arc<ScreenRoom>> =
            self.screen_rooms.lock().await.values().cloned().collect();
        for room in rooms {
            if room.handle_ice(user_id, candidate.clone(), role).await {
                return;
            }
        }
    }

    /// Disconnect cleanup for screen roles owned by a closing connection.
    pub async fn drop_screen_roles_for_connection(&self, conn_id: Uuid) {
        // Presenter role: stop the whole share.
        let presented: Vec<String> = self
            .screen_rooms
            .lock()
            .await
            .values()
            .filter(|room| room.presenter_conn() == conn_id)
            .map(|room| room.channel_id().to_string())
            .collect();
        for channel_id in presented {
            self.stop_screen_share(&channel_id).await;
        }

        // Viewer role: drop that viewer's leg only.
        let rooms: Vec<Arc<ScreenRoom>> =
            self.screen_rooms.lock().await.values().cloned().collect();
        for room in rooms {
            room.remove_viewer_connection(conn_id).await;
        }
    }
}

/// Voice engine: Opus only, NACK via the default interceptor set.
fn build_voice_api(public_ip: &str) -> Result<API, RelayError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: OPUS_VOICE_FMTP.to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let mut setting_engine = SettingEngine::default();
    if !public_ip.is_empty() {
        setting_engine
            .set_nat_1to1_ips(vec![public_ip.to_string()], RTCIceCandidateType::Host);
    }

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

/// Screen engine: VP8 video + Opus audio.
fn build_screen_api(public_ip: &str) -> Result<API, RelayError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: OPUS_SCREEN_FMTP.to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let mut setting_engine = SettingEngine::default();
    if !public_ip.is_empty() {
        setting_engine
            .set_nat_1to1_ips(vec![public_ip.to_string()], RTCIceCandidateType::Host);
    }

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}
