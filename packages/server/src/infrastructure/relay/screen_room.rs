//! Per-channel screen-share session.
//!
//! One presenter uploads video (and optionally audio); each viewer gets a
//! dedicated relay connection with its own offer/answer/ICE exchange —
//! viewers never share a connection. Signaling envelopes carry a `role` so a
//! user who both presents in one channel and views another stays
//! disambiguated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use super::{MediaRelay, RelayError};
use crate::infrastructure::dto::websocket::{ScreenIcePayload, ScreenSdpPayload, envelope};

pub const ROLE_PRESENTER: &str = "presenter";
pub const ROLE_VIEWER: &str = "viewer";

struct ScreenViewer {
    user_id: String,
    conn_id: Uuid,
    pc: Arc<RTCPeerConnection>,
    needs_renegotiation: Arc<AtomicBool>,
}

#[derive(Default)]
struct ScreenRoomState {
    presenter_pc: Option<Arc<RTCPeerConnection>>,
    video_track: Option<Arc<TrackLocalStaticRTP>>,
    audio_track: Option<Arc<TrackLocalStaticRTP>>,
    stopped: bool,
}

pub struct ScreenRoom {
    channel_id: String,
    presenter_id: String,
    presenter_conn: Uuid,
    relay: Weak<MediaRelay>,
    state: Mutex<ScreenRoomState>,
    viewers: Mutex<HashMap<String, ScreenViewer>>,
}

impl ScreenRoom {
    pub(crate) fn new(
        channel_id: String,
        presenter_id: String,
        presenter_conn: Uuid,
        relay: Weak<MediaRelay>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel_id,
            presenter_id,
            presenter_conn,
            relay,
            state: Mutex::new(ScreenRoomState::default()),
            viewers: Mutex::new(HashMap::new()),
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn presenter_id(&self) -> &str {
        &self.presenter_id
    }

    pub fn presenter_conn(&self) -> Uuid {
        self.presenter_conn
    }

    pub async fn viewer_count(&self) -> usize {
        self.viewers.lock().await.len()
    }

    pub async fn has_viewer(&self, user_id: &str) -> bool {
        self.viewers.lock().await.contains_key(user_id)
    }

    /// Create the presenter's upstream connection and send its offer.
    pub(crate) async fn setup_presenter(self: &Arc<Self>) -> Result<(), RelayError> {
        let relay = self.relay.upgrade().ok_or(RelayError::Shutdown)?;
        let pc = Arc::new(
            relay
                .screen_api()
                .new_peer_connection(relay.pc_config())
                .await?,
        );
        let events = relay.events();

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            if let Err(err) = pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
            {
                let _ = pc.close().await;
                return Err(err.into());
            }
        }

        // Presenter media → per-kind forwarding track, fanned to viewers
        {
            let room = Arc::downgrade(self);
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let room = room.clone();
                Box::pin(async move {
                    let Some(room) = room.upgrade() else { return };
                    room.on_presenter_track(track).await;
                })
            }));
        }

        {
            let events = Arc::clone(&events);
            let presenter = self.presenter_id.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let events = Arc::clone(&events);
                let presenter = presenter.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            events
                                .signal(
                                    &presenter,
                                    envelope(
                                        "webrtc_screen_ice",
                                        &ScreenIcePayload {
                                            candidate: init,
                                            role: ROLE_PRESENTER.to_string(),
                                        },
                                    ),
                                )
                                .await;
                        }
                        Err(err) => tracing::warn!("screen ice to_json: {err}"),
                    }
                })
            }));
        }

        // Presenter transport failure ends the whole share
        {
            let relay_weak = self.relay.clone();
            let channel_id = self.channel_id.clone();
            let presenter = self.presenter_id.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let relay_weak = relay_weak.clone();
                let channel_id = channel_id.clone();
                let presenter = presenter.clone();
                Box::pin(async move {
                    tracing::debug!(user_id = %presenter, ?state, "screen presenter state");
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        if let Some(relay) = relay_weak.upgrade() {
                            relay.stop_screen_share(&channel_id).await;
                        }
                    }
                })
            }));
        }

        let offer = match pc.create_offer(None).await {
            Ok(offer) => offer,
            Err(err) => {
                let _ = pc.close().await;
                return Err(err.into());
            }
        };
        if let Err(err) = pc.set_local_description(offer.clone()).await {
            let _ = pc.close().await;
            return Err(err.into());
        }

        self.state.lock().await.presenter_pc = Some(Arc::clone(&pc));

        events
            .signal(
                &self.presenter_id,
                envelope(
                    "webrtc_screen_offer",
                    &ScreenSdpPayload {
                        sdp: offer.sdp,
                        role: ROLE_PRESENTER.to_string(),
                    },
                ),
            )
            .await;

        Ok(())
    }

    async fn on_presenter_track(self: &Arc<Self>, track: Arc<TrackRemote>) {
        tracing::debug!(
            channel_id = %self.channel_id,
            kind = ?track.kind(),
            "screen track received from presenter"
        );
        let local = Arc::new(TrackLocalStaticRTP::new(
            track.codec().capability,
            track.id(),
            track.stream_id(),
        ));

        {
            let mut state = self.state.lock().await;
            if track.kind() == RTPCodecType::Video {
                state.video_track = Some(Arc::clone(&local));
            } else {
                state.audio_track = Some(Arc::clone(&local));
            }
        }

        self.add_track_to_viewers(Arc::clone(&local)).await;

        let forward = Arc::clone(&local);
        tokio::spawn(async move {
            loop {
                let (packet, _attributes) = match track.read_rtp().await {
                    Ok(read) => read,
                    Err(_) => return,
                };
                if forward.write_rtp(&packet).await.is_err() {
                    return;
                }
            }
        });
    }

    /// Create a dedicated relay connection for one viewer and offer the
    /// currently available tracks.
    pub async fn add_viewer(self: &Arc<Self>, user_id: &str, conn_id: Uuid) -> Result<(), RelayError> {
        let relay = self.relay.upgrade().ok_or(RelayError::Shutdown)?;
        let pc = Arc::new(
            relay
                .screen_api()
                .new_peer_connection(relay.pc_config())
                .await?,
        );
        let events = relay.events();

        let (video, audio) = {
            let state = self.state.lock().await;
            (state.video_track.clone(), state.audio_track.clone())
        };
        for track in [video, audio].into_iter().flatten() {
            match pc
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                Ok(sender) => Self::spawn_rtcp_drain(sender),
                Err(err) => {
                    tracing::warn!(user_id, "adding screen track to viewer: {err}");
                }
            }
        }

        {
            let events = Arc::clone(&events);
            let uid = user_id.to_string();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let events = Arc::clone(&events);
                let uid = uid.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            events
                                .signal(
                                    &uid,
                                    envelope(
                                        "webrtc_screen_ice",
                                        &ScreenIcePayload {
                                            candidate: init,
                                            role: ROLE_VIEWER.to_string(),
                                        },
                                    ),
                                )
                                .await;
                        }
                        Err(err) => tracing::warn!("screen ice to_json: {err}"),
                    }
                })
            }));
        }

        {
            let room = Arc::downgrade(self);
            let uid = user_id.to_string();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let room = room.clone();
                let uid = uid.clone();
                Box::pin(async move {
                    tracing::debug!(user_id = %uid, ?state, "screen viewer state");
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        if let Some(room) = room.upgrade() {
                            room.remove_viewer(&uid).await;
                        }
                    }
                })
            }));
        }

        let offer = match pc.create_offer(None).await {
            Ok(offer) => offer,
            Err(err) => {
                let _ = pc.close().await;
                return Err(err.into());
            }
        };
        if let Err(err) = pc.set_local_description(offer.clone()).await {
            let _ = pc.close().await;
            return Err(err.into());
        }

        self.viewers.lock().await.insert(
            user_id.to_string(),
            ScreenViewer {
                user_id: user_id.to_string(),
                conn_id,
                pc,
                needs_renegotiation: Arc::new(AtomicBool::new(false)),
            },
        );

        events
            .signal(
                user_id,
                envelope(
                    "webrtc_screen_offer",
                    &ScreenSdpPayload {
                        sdp: offer.sdp,
                        role: ROLE_VIEWER.to_string(),
                    },
                ),
            )
            .await;

        Ok(())
    }

    pub async fn remove_viewer(&self, user_id: &str) {
        let viewer = self.viewers.lock().await.remove(user_id);
        if let Some(viewer) = viewer {
            if let Err(err) = viewer.pc.close().await {
                tracing::debug!(user_id, "closing viewer connection: {err}");
            }
        }
    }

    /// Disconnect cleanup: drop the viewer leg owned by a closing connection.
    pub(crate) async fn remove_viewer_connection(&self, conn_id: Uuid) {
        let user_id = self
            .viewers
            .lock()
            .await
            .values()
            .find(|viewer| viewer.conn_id == conn_id)
            .map(|viewer| viewer.user_id.clone());
        if let Some(user_id) = user_id {
            self.remove_viewer(&user_id).await;
        }
    }

    /// Close every connection of the session. Idempotent.
    pub(crate) async fn stop(&self) {
        let (presenter_pc, viewers) = {
            let mut state = self.state.lock().await;
            if state.stopped {
                return;
            }
            state.stopped = true;
            let pc = state.presenter_pc.take();
            let viewers: Vec<ScreenViewer> =
                self.viewers.lock().await.drain().map(|(_, v)| v).collect();
            (pc, viewers)
        };

        for viewer in viewers {
            if let Err(err) = viewer.pc.close().await {
                tracing::debug!(user_id = %viewer.user_id, "closing viewer: {err}");
            }
        }
        if let Some(pc) = presenter_pc {
            if let Err(err) = pc.close().await {
                tracing::debug!("closing presenter: {err}");
            }
        }
    }

    /// Apply an answer for whichever leg the (user, role) pair addresses.
    /// Returns false when this room holds no such leg.
    pub async fn handle_answer(self: &Arc<Self>, user_id: &str, sdp: &str, role: &str) -> bool {
        let pc = self.leg_for(user_id, role).await;
        let Some(pc) = pc else { return false };

        let answer = match RTCSessionDescription::answer(sdp.to_string()) {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(user_id, "invalid screen answer sdp: {err}");
                return true;
            }
        };
        if let Err(err) = pc.set_remote_description(answer).await {
            tracing::warn!(user_id, "screen set remote description: {err}");
            return true;
        }

        // Resume a deferred viewer renegotiation now that signaling settled
        if role != ROLE_PRESENTER && user_id != self.presenter_id {
            let deferred = {
                let viewers = self.viewers.lock().await;
                viewers
                    .get(user_id)
                    .map(|viewer| Arc::clone(&viewer.needs_renegotiation))
            };
            if let Some(flag) = deferred {
                if flag.swap(false, Ordering::SeqCst) {
                    self.renegotiate_viewer(user_id).await;
                }
            }
        }
        true
    }

    /// Route an ICE candidate to the right leg. Returns false when this room
    /// holds no such leg.
    pub async fn handle_ice(&self, user_id: &str, candidate: RTCIceCandidateInit, role: &str) -> bool {
        let Some(pc) = self.leg_for(user_id, role).await else {
            return false;
        };
        if let Err(err) = pc.add_ice_candidate(candidate).await {
            tracing::warn!(user_id, "screen add ice candidate: {err}");
        }
        true
    }

    async fn leg_for(&self, user_id: &str, role: &str) -> Option<Arc<RTCPeerConnection>> {
        if user_id == self.presenter_id && role != ROLE_VIEWER {
            return self.state.lock().await.presenter_pc.clone();
        }
        self.viewers
            .lock()
            .await
            .get(user_id)
            .map(|viewer| Arc::clone(&viewer.pc))
    }

    async fn add_track_to_viewers(self: &Arc<Self>, track: Arc<TrackLocalStaticRTP>) {
        let targets: Vec<(String, Arc<RTCPeerConnection>)> = self
            .viewers
            .lock()
            .await
            .values()
            .map(|viewer| (viewer.user_id.clone(), Arc::clone(&viewer.pc)))
            .collect();
        for (user_id, pc) in targets {
            match pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                Ok(sender) => {
                    Self::spawn_rtcp_drain(sender);
                    self.renegotiate_viewer(&user_id).await;
                }
                Err(err) => {
                    tracing::warn!(user_id = %user_id, "add screen track to viewer: {err}");
                }
            }
        }
    }

    async fn renegotiate_viewer(self: &Arc<Self>, user_id: &str) {
        let (pc, deferred) = {
            let viewers = self.viewers.lock().await;
            let Some(viewer) = viewers.get(user_id) else {
                return;
            };
            (
                Arc::clone(&viewer.pc),
                Arc::clone(&viewer.needs_renegotiation),
            )
        };

        if pc.signaling_state() != RTCSignalingState::Stable {
            deferred.store(true, Ordering::SeqCst);
            tracing::debug!(user_id, "deferring viewer renegotiation");
            return;
        }

        let offer = match pc.create_offer(None).await {
            Ok(offer) => offer,
            Err(err) => {
                tracing::warn!(user_id, "viewer renegotiation offer: {err}");
                return;
            }
        };
        if let Err(err) = pc.set_local_description(offer.clone()).await {
            tracing::warn!(user_id, "viewer set local description: {err}");
            return;
        }
        if let Some(relay) = self.relay.upgrade() {
            relay
                .events()
                .signal(
                    user_id,
                    envelope(
                        "webrtc_screen_offer",
                        &ScreenSdpPayload {
                            sdp: offer.sdp,
                            role: ROLE_VIEWER.to_string(),
                        },
                    ),
                )
                .await;
        }
    }

    fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::MediaRelay;
    use super::super::tests::RecordingEvents;
    use super::*;

    #[tokio::test]
    async fn test_viewer_subscribe_and_unsubscribe() {
        // given: an active share
        let events = RecordingEvents::new();
        let relay = MediaRelay::new("", "", events.clone()).unwrap();
        relay
            .start_screen_share("ch-1", "alice", Uuid::new_v4())
            .await
            .unwrap();
        let room = relay.screen_room("ch-1").await.unwrap();

        // when: a viewer joins then leaves
        room.add_viewer("bob", Uuid::new_v4()).await.unwrap();
        assert!(room.has_viewer("bob").await);
        room.remove_viewer("bob").await;

        // then:
        assert!(!room.has_viewer("bob").await);
        assert_eq!(room.viewer_count().await, 0);
    }

    #[tokio::test]
    async fn test_viewer_connection_cleanup_targets_only_that_connection() {
        // given: two viewers on distinct connections
        let events = RecordingEvents::new();
        let relay = MediaRelay::new("", "", events.clone()).unwrap();
        relay
            .start_screen_share("ch-1", "alice", Uuid::new_v4())
            .await
            .unwrap();
        let room = relay.screen_room("ch-1").await.unwrap();
        let bob_conn = Uuid::new_v4();
        room.add_viewer("bob", bob_conn).await.unwrap();
        room.add_viewer("carol", Uuid::new_v4()).await.unwrap();

        // when: bob's connection closes
        room.remove_viewer_connection(bob_conn).await;

        // then: carol is unaffected
        assert!(!room.has_viewer("bob").await);
        assert!(room.has_viewer("carol").await);
    }

    #[tokio::test]
    async fn test_answer_routing_respects_role() {
        // given:
        let events = RecordingEvents::new();
        let relay = MediaRelay::new("", "", events.clone()).unwrap();
        relay
            .start_screen_share("ch-1", "alice", Uuid::new_v4())
            .await
            .unwrap();
        let room = relay.screen_room("ch-1").await.unwrap();

        // when: an answer arrives for a user with no leg in this room
        let routed = room.handle_answer("stranger", "bogus", ROLE_VIEWER).await;

        // then:
        assert!(!routed);
    }
}
