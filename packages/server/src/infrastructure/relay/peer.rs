//! One voice participant's server-side media connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Mutex;
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::domain::VoiceStateFlags;
use crate::infrastructure::dto::websocket::VoiceStatePayload;

/// Lifecycle of a participant's media connection.
///
/// `Idle` exists only between construction and the first offer; `Closed` is
/// terminal and set before the underlying connection is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    Negotiating,
    Connected,
    Renegotiating,
    Closed,
}

pub struct VoicePeer {
    pub user_id: String,
    pub channel_id: String,
    /// Connection that created this participant; its close tears us down
    pub conn_id: Uuid,

    pc: Arc<RTCPeerConnection>,
    /// Forwarding track fed by this participant's upstream audio
    local_track: Mutex<Option<Arc<TrackLocalStaticRTP>>>,
    /// Senders on THIS peer's connection, keyed by source user id, so a
    /// departing participant's track can be removed precisely
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,

    phase: Mutex<NegotiationPhase>,
    /// Bumped per outgoing offer; lets answer-timeout tasks detect staleness
    offer_seq: AtomicU64,
    /// Highest offer sequence that has received its answer
    answered_seq: AtomicU64,
    needs_renegotiation: AtomicBool,

    /// Mirrored out of `flags` for the per-packet forwarding check
    server_muted: AtomicBool,
    flags: Mutex<VoiceStateFlags>,
}

impl VoicePeer {
    pub fn new(
        user_id: String,
        channel_id: String,
        conn_id: Uuid,
        pc: Arc<RTCPeerConnection>,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            channel_id,
            conn_id,
            pc,
            local_track: Mutex::new(None),
            senders: Mutex::new(HashMap::new()),
            phase: Mutex::new(NegotiationPhase::Idle),
            offer_seq: AtomicU64::new(0),
            answered_seq: AtomicU64::new(0),
            needs_renegotiation: AtomicBool::new(false),
            server_muted: AtomicBool::new(false),
            flags: Mutex::new(VoiceStateFlags::default()),
        })
    }

    pub fn pc(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.pc)
    }

    pub async fn set_local_track(&self, track: Arc<TrackLocalStaticRTP>) {
        *self.local_track.lock().await = Some(track);
    }

    pub async fn local_track(&self) -> Option<Arc<TrackLocalStaticRTP>> {
        self.local_track.lock().await.clone()
    }

    pub async fn register_sender(&self, from_user: &str, sender: Arc<RTCRtpSender>) {
        self.senders
            .lock()
            .await
            .insert(from_user.to_string(), sender);
    }

    pub async fn take_sender(&self, from_user: &str) -> Option<Arc<RTCRtpSender>> {
        self.senders.lock().await.remove(from_user)
    }

    // --- negotiation bookkeeping ---

    pub async fn phase(&self) -> NegotiationPhase {
        *self.phase.lock().await
    }

    pub async fn set_phase(&self, phase: NegotiationPhase) {
        let mut current = self.phase.lock().await;
        // Closed is terminal
        if *current != NegotiationPhase::Closed {
            *current = phase;
        }
    }

    /// Record an outgoing offer; returns its sequence number.
    pub async fn begin_offer(&self) -> u64 {
        let mut phase = self.phase.lock().await;
        if *phase != NegotiationPhase::Closed {
            *phase = if *phase == NegotiationPhase::Idle {
                NegotiationPhase::Negotiating
            } else {
                NegotiationPhase::Renegotiating
            };
        }
        self.offer_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn offer_seq(&self) -> u64 {
        self.offer_seq.load(Ordering::SeqCst)
    }

    /// Record that the latest offer has been answered.
    pub fn mark_answered(&self) {
        self.answered_seq
            .store(self.offer_seq.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    pub fn answered_seq(&self) -> u64 {
        self.answered_seq.load(Ordering::SeqCst)
    }

    pub fn defer_renegotiation(&self) {
        self.needs_renegotiation.store(true, Ordering::SeqCst);
    }

    pub fn take_deferred_renegotiation(&self) -> bool {
        self.needs_renegotiation.swap(false, Ordering::SeqCst)
    }

    // --- voice state flags (state-only; never touch media) ---

    pub async fn set_self_mute(&self, muted: bool) {
        self.flags.lock().await.self_mute = muted;
    }

    pub async fn set_self_deafen(&self, deafened: bool) {
        self.flags.lock().await.self_deafen = deafened;
    }

    pub async fn set_speaking(&self, speaking: bool) {
        self.flags.lock().await.speaking = speaking;
    }

    pub async fn set_server_mute(&self, muted: bool) {
        self.flags.lock().await.server_mute = muted;
        self.server_muted.store(muted, Ordering::SeqCst);
    }

    /// Cheap read used by the RTP forwarding loop.
    pub fn is_server_muted(&self) -> bool {
        self.server_muted.load(Ordering::SeqCst)
    }

    pub async fn voice_state(&self) -> VoiceStatePayload {
        let flags = *self.flags.lock().await;
        VoiceStatePayload {
            user_id: self.user_id.clone(),
            channel_id: Some(self.channel_id.clone()),
            flags,
        }
    }

    /// Mark closed and shut the media connection down.
    pub async fn close(&self) {
        *self.phase.lock().await = NegotiationPhase::Closed;
        if let Err(err) = self.pc.close().await {
            tracing::debug!(user_id = %self.user_id, "closing peer connection: {err}");
        }
    }
}
