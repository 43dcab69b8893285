//! Per-channel voice session.
//!
//! Created lazily on first join, destroyed when the last participant leaves.
//! All mutation of the peer set is serialized through the room's mutex; peer
//! connection handles are cloned out of the guarded map before any engine
//! call, so the lock is never held across signaling I/O.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
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

use super::peer::{NegotiationPhase, VoicePeer};
use super::{MediaRelay, NEGOTIATION_TIMEOUT, RelayError};
use crate::infrastructure::dto::websocket::{IcePayload, SdpPayload, VoiceStatePayload, envelope};

pub struct VoiceRoom {
    channel_id: String,
    relay: Weak<MediaRelay>,
    peers: Mutex<HashMap<String, Arc<VoicePeer>>>,
}

impl VoiceRoom {
    pub(crate) fn new(channel_id: String, relay: Weak<MediaRelay>) -> Arc<Self> {
        Arc::new(Self {
            channel_id,
            relay,
            peers: Mutex::new(HashMap::new()),
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub async fn has_peer(&self, user_id: &str) -> bool {
        self.peers.lock().await.contains_key(user_id)
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }

    pub async fn peer(&self, user_id: &str) -> Option<Arc<VoicePeer>> {
        self.peers.lock().await.get(user_id).cloned()
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.peers.lock().await.keys().cloned().collect()
    }

    pub async fn voice_states(&self) -> Vec<VoiceStatePayload> {
        let peers: Vec<Arc<VoicePeer>> = self.peers.lock().await.values().cloned().collect();
        let mut states = Vec::with_capacity(peers.len());
        for peer in peers {
            states.push(peer.voice_state().await);
        }
        states
    }

    /// Create this user's upstream media connection, wire the fan-out, and
    /// send the initial offer.
    pub async fn add_peer(
        self: &Arc<Self>,
        user_id: &str,
        conn_id: Uuid,
    ) -> Result<Arc<VoicePeer>, RelayError> {
        let relay = self.relay.upgrade().ok_or(RelayError::Shutdown)?;
        let pc = Arc::new(
            relay
                .voice_api()
                .new_peer_connection(relay.pc_config())
                .await?,
        );
        let events = relay.events();

        let peer = VoicePeer::new(
            user_id.to_string(),
            self.channel_id.clone(),
            conn_id,
            Arc::clone(&pc),
        );

        // Upstream audio from the client
        if let Err(err) = pc
            .add_transceiver_from_kind(
                RTPCodecType::Audio,
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

        // Incoming audio → forwarding track, added to every other participant
        {
            let room = Arc::downgrade(self);
            let peer_weak = Arc::downgrade(&peer);
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let room = room.clone();
                let peer_weak = peer_weak.clone();
                Box::pin(async move {
                    let (Some(room), Some(peer)) = (room.upgrade(), peer_weak.upgrade()) else {
                        return;
                    };
                    tracing::debug!(
                        channel_id = %room.channel_id,
                        user_id = %peer.user_id,
                        "voice track received"
                    );
                    let local = Arc::new(TrackLocalStaticRTP::new(
                        track.codec().capability,
                        track.id(),
                        track.stream_id(),
                    ));
                    peer.set_local_track(Arc::clone(&local)).await;
                    room.add_track_to_others(&peer.user_id, Arc::clone(&local))
                        .await;
                    Self::spawn_forward_loop(Arc::downgrade(&peer), track, local);
                })
            }));
        }

        // Trickle ICE down to the client
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
                                .signal(&uid, envelope("webrtc_ice", &IcePayload { candidate: init }))
                                .await;
                        }
                        Err(err) => tracing::warn!(user_id = %uid, "ice candidate to_json: {err}"),
                    }
                })
            }));
        }

        // Transport lifecycle: connected marks the phase, failure removes the
        // peer so others renegotiate without its track
        {
            let room = Arc::downgrade(self);
            let peer_weak = Arc::downgrade(&peer);
            let uid = user_id.to_string();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let room = room.clone();
                let peer_weak = peer_weak.clone();
                let uid = uid.clone();
                Box::pin(async move {
                    tracing::debug!(user_id = %uid, ?state, "voice transport state");
                    match state {
                        RTCPeerConnectionState::Connected => {
                            if let Some(peer) = peer_weak.upgrade() {
                                peer.set_phase(NegotiationPhase::Connected).await;
                            }
                        }
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            if let Some(room) = room.upgrade() {
                                room.remove_peer(&uid).await;
                            }
                        }
                        _ => {}
                    }
                })
            }));
        }

        // Forward every existing participant's track into the new connection
        let existing: Vec<Arc<VoicePeer>> =
            self.peers.lock().await.values().cloned().collect();
        for other in existing {
            let Some(track) = other.local_track().await else {
                continue;
            };
            match pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                Ok(sender) => {
                    Self::spawn_rtcp_drain(Arc::clone(&sender));
                    peer.register_sender(&other.user_id, sender).await;
                }
                Err(err) => {
                    tracing::warn!(
                        from = %other.user_id,
                        to = user_id,
                        "forwarding existing track: {err}"
                    );
                }
            }
        }

        // Initial offer goes out before the peer becomes visible to others,
        // so concurrent renegotiation correctly defers on signaling state
        let seq = peer.begin_offer().await;
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

        self.peers
            .lock()
            .await
            .insert(user_id.to_string(), Arc::clone(&peer));

        events
            .signal(user_id, envelope("webrtc_offer", &SdpPayload { sdp: offer.sdp }))
            .await;
        self.spawn_answer_timeout(&peer, seq);

        Ok(peer)
    }

    /// Remove a participant: close its upstream, strip its track from every
    /// remaining connection (renegotiating each), drop the room when empty.
    pub async fn remove_peer(self: &Arc<Self>, user_id: &str) -> bool {
        let (peer, empty) = {
            let mut peers = self.peers.lock().await;
            let Some(peer) = peers.remove(user_id) else {
                return false;
            };
            (peer, peers.is_empty())
        };

        peer.close().await;

        if let Some(relay) = self.relay.upgrade() {
            relay.events().voice_left(user_id).await;
        }

        let remaining: Vec<Arc<VoicePeer>> =
            self.peers.lock().await.values().cloned().collect();
        for other in remaining {
            if let Some(sender) = other.take_sender(user_id).await {
                if let Err(err) = other.pc().remove_track(&sender).await {
                    tracing::warn!(
                        user_id = %other.user_id,
                        "removing departed track: {err}"
                    );
                }
            }
            self.renegotiate(&other).await;
        }

        if empty {
            if let Some(relay) = self.relay.upgrade() {
                relay.remove_room_if_empty(&self.channel_id).await;
            }
        }
        true
    }

    /// Apply a client's SDP answer, then run any renegotiation that was
    /// deferred while this exchange was in flight.
    pub async fn handle_answer(self: &Arc<Self>, user_id: &str, sdp: &str) {
        let Some(peer) = self.peer(user_id).await else {
            tracing::warn!(user_id, "answer for unknown voice peer");
            return;
        };
        let answer = match RTCSessionDescription::answer(sdp.to_string()) {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(user_id, "invalid answer sdp: {err}");
                return;
            }
        };
        if let Err(err) = peer.pc().set_remote_description(answer).await {
            tracing::warn!(user_id, "set remote description: {err}");
            return;
        }
        peer.mark_answered();

        if peer.take_deferred_renegotiation() {
            tracing::debug!(user_id, "running deferred renegotiation");
            self.renegotiate(&peer).await;
        }
    }

    pub async fn handle_ice(&self, user_id: &str, candidate: RTCIceCandidateInit) {
        let Some(peer) = self.peer(user_id).await else {
            return;
        };
        if let Err(err) = peer.pc().add_ice_candidate(candidate).await {
            tracing::warn!(user_id, "add ice candidate: {err}");
        }
    }

    /// Offer the peer's current track set. Defers when a previous exchange
    /// has not settled; the deferral is resumed by `handle_answer`.
    async fn renegotiate(self: &Arc<Self>, peer: &Arc<VoicePeer>) {
        if peer.phase().await == NegotiationPhase::Closed {
            return;
        }
        let pc = peer.pc();
        if pc.signaling_state() != RTCSignalingState::Stable {
            peer.defer_renegotiation();
            tracing::debug!(user_id = %peer.user_id, "deferring renegotiation");
            return;
        }

        let seq = peer.begin_offer().await;
        let offer = match pc.create_offer(None).await {
            Ok(offer) => offer,
            Err(err) => {
                tracing::warn!(user_id = %peer.user_id, "renegotiation offer: {err}");
                return;
            }
        };
        if let Err(err) = pc.set_local_description(offer.clone()).await {
            tracing::warn!(user_id = %peer.user_id, "set local description: {err}");
            return;
        }
        if let Some(relay) = self.relay.upgrade() {
            relay
                .events()
                .signal(
                    &peer.user_id,
                    envelope("webrtc_offer", &SdpPayload { sdp: offer.sdp }),
                )
                .await;
        }
        self.spawn_answer_timeout(peer, seq);
    }

    async fn add_track_to_others(self: &Arc<Self>, from_user: &str, track: Arc<TrackLocalStaticRTP>) {
        let others: Vec<Arc<VoicePeer>> = self
            .peers
            .lock()
            .await
            .values()
            .filter(|p| p.user_id != from_user)
            .cloned()
            .collect();
        for other in others {
            match other
                .pc()
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                Ok(sender) => {
                    Self::spawn_rtcp_drain(Arc::clone(&sender));
                    other.register_sender(from_user, sender).await;
                    self.renegotiate(&other).await;
                }
                Err(err) => {
                    tracing::warn!(from = from_user, to = %other.user_id, "add track: {err}");
                }
            }
        }
    }

    /// Copy RTP from a participant's upstream into its forwarding track,
    /// dropping packets while server-muted. Exits when either side closes.
    fn spawn_forward_loop(
        peer: Weak<VoicePeer>,
        remote: Arc<TrackRemote>,
        local: Arc<TrackLocalStaticRTP>,
    ) {
        tokio::spawn(async move {
            loop {
                let (packet, _attributes) = match remote.read_rtp().await {
                    Ok(read) => read,
                    Err(_) => return,
                };
                let Some(peer) = peer.upgrade() else { return };
                if peer.is_server_muted() {
                    continue;
                }
                if local.write_rtp(&packet).await.is_err() {
                    return;
                }
            }
        });
    }

    /// RTCP must be drained for a sender to keep flowing.
    fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
    }

    /// A lost answer never blocks the session: after the timeout the leg is
    /// logged as absent and left to the next renegotiation.
    fn spawn_answer_timeout(&self, peer: &Arc<VoicePeer>, seq: u64) {
        let peer = Arc::downgrade(peer);
        tokio::spawn(async move {
            tokio::time::sleep(NEGOTIATION_TIMEOUT).await;
            let Some(peer) = peer.upgrade() else { return };
            if peer.phase().await == NegotiationPhase::Closed {
                return;
            }
            if peer.answered_seq() < seq {
                tracing::warn!(
                    user_id = %peer.user_id,
                    offer_seq = seq,
                    "no answer within negotiation timeout; media leg left absent"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::RecordingEvents;
    use super::*;

    async fn relay_with_events() -> (Arc<MediaRelay>, Arc<RecordingEvents>) {
        let events = RecordingEvents::new();
        let relay = MediaRelay::new("", "", events.clone()).unwrap();
        (relay, events)
    }

    #[tokio::test]
    async fn test_join_sends_server_initiated_offer() {
        // given:
        let (relay, events) = relay_with_events().await;
        let room = relay.get_or_create_room("general").await;

        // when:
        room.add_peer("alice", Uuid::new_v4()).await.unwrap();

        // then: the server, not the client, opened the exchange
        assert_eq!(events.offers_for("alice", "webrtc_offer").await, 1);
        assert!(room.has_peer("alice").await);
    }

    #[tokio::test]
    async fn test_user_room_lookup_is_id_keyed() {
        // given: two rooms with one participant each
        let (relay, _events) = relay_with_events().await;
        let general = relay.get_or_create_room("general").await;
        let music = relay.get_or_create_room("music").await;
        general.add_peer("alice", Uuid::new_v4()).await.unwrap();
        music.add_peer("bob", Uuid::new_v4()).await.unwrap();

        // when / then:
        assert_eq!(
            relay.user_room("alice").await.unwrap().channel_id(),
            "general"
        );
        assert_eq!(relay.user_room("bob").await.unwrap().channel_id(), "music");
        assert!(relay.user_room("carol").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_peer_fires_voice_left_and_drops_empty_room() {
        // given:
        let (relay, events) = relay_with_events().await;
        let room = relay.get_or_create_room("general").await;
        room.add_peer("alice", Uuid::new_v4()).await.unwrap();

        // when:
        let removed = room.remove_peer("alice").await;

        // then: the hub was told exactly once and the empty room is gone
        assert!(removed);
        assert_eq!(events.voice_left.lock().await.as_slice(), &["alice"]);
        assert!(relay.room("general").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_unknown_peer_is_noop() {
        // given:
        let (relay, events) = relay_with_events().await;
        let room = relay.get_or_create_room("general").await;

        // when / then:
        assert!(!room.remove_peer("ghost").await);
        assert!(events.voice_left.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_removed_peer_never_appears_in_voice_states() {
        // given:
        let (relay, _events) = relay_with_events().await;
        let room = relay.get_or_create_room("general").await;
        room.add_peer("alice", Uuid::new_v4()).await.unwrap();
        room.add_peer("bob", Uuid::new_v4()).await.unwrap();

        // when:
        room.remove_peer("alice").await;

        // then:
        let states = room.voice_states().await;
        assert!(states.iter().all(|s| s.user_id != "alice"));
        assert_eq!(states.len(), 1);
    }

    #[tokio::test]
    async fn test_voice_flags_are_state_only() {
        // given: a connected-ish participant
        let (relay, _events) = relay_with_events().await;
        let room = relay.get_or_create_room("general").await;
        let peer = room.add_peer("alice", Uuid::new_v4()).await.unwrap();

        // when: mute and speaking flip
        peer.set_self_mute(true).await;
        peer.set_speaking(true).await;
        peer.set_server_mute(true).await;

        // then: flags broadcastable, participant still in the room
        let state = peer.voice_state().await;
        assert!(state.flags.self_mute);
        assert!(state.flags.speaking);
        assert!(state.flags.server_mute);
        assert!(peer.is_server_muted());
        assert!(room.has_peer("alice").await);
    }
}
