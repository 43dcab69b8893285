//! WebSocket wire protocol.
//!
//! Every message in either direction is one JSON envelope `{"op": ..., "d":
//! ...}`. Inbound envelopes decode into the closed [`ClientOp`] enum through
//! an explicit op table; an unknown op or an undecodable payload yields
//! `None` and the message is dropped while the connection stays open
//! (forward compatibility with older/newer clients).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::domain::{
    Attachment, Channel, MediaItem, Notification, RadioStation, Track, User, VoiceStateFlags,
};

/// Raw envelope as read off the wire.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub op: String,
    #[serde(default)]
    pub d: serde_json::Value,
}

/// Build an outbound envelope. Payloads are plain serde structs, so
/// serialization cannot fail for well-formed data.
pub fn envelope<T: Serialize>(op: &str, data: &T) -> String {
    serde_json::to_string(&serde_json::json!({ "op": op, "d": data }))
        .expect("serialize server event")
}

/// An envelope with `d: null` (e.g. cleared media playback).
pub fn envelope_null(op: &str) -> String {
    format!("{{\"op\":\"{op}\",\"d\":null}}")
}

// --- client → server payloads ---

#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticateData {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageData {
    pub channel_id: String,
    pub content: Option<String>,
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub attachment_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EditMessageData {
    pub message_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteMessageData {
    pub message_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReactionData {
    pub message_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypingData {
    pub channel_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateChannelData {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelIdData {
    pub channel_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationIdData {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SdpData {
    pub sdp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IceData {
    pub candidate: RTCIceCandidateInit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScreenSdpData {
    pub sdp: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScreenIceData {
    pub candidate: RTCIceCandidateInit,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MutedData {
    pub muted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeafenedData {
    pub deafened: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeakingData {
    pub speaking: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerMuteData {
    pub user_id: String,
    pub muted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationIdData {
    pub station_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RadioPlayData {
    pub station_id: String,
    pub playlist_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RadioPositionData {
    pub station_id: String,
    pub position: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateStationData {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationModeData {
    pub station_id: String,
    pub mode: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPlayData {
    pub video_id: String,
    #[serde(default)]
    pub position: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPositionData {
    pub position: f64,
}

/// The closed set of inbound operations.
#[derive(Debug, Clone)]
pub enum ClientOp {
    Authenticate(AuthenticateData),
    Ping,
    SendMessage(SendMessageData),
    EditMessage(EditMessageData),
    DeleteMessage(DeleteMessageData),
    AddReaction(ReactionData),
    RemoveReaction(ReactionData),
    TypingStart(TypingData),
    CreateChannel(CreateChannelData),
    DeleteChannel(ChannelIdData),
    MarkNotificationRead(NotificationIdData),
    MarkAllNotificationsRead,
    JoinVoice(ChannelIdData),
    LeaveVoice,
    VoiceSelfMute(MutedData),
    VoiceSelfDeafen(DeafenedData),
    VoiceSpeaking(SpeakingData),
    VoiceServerMute(ServerMuteData),
    WebrtcAnswer(SdpData),
    WebrtcIce(IceData),
    ScreenShareStart,
    ScreenShareStop,
    ScreenShareSubscribe(ChannelIdData),
    ScreenShareUnsubscribe(ChannelIdData),
    WebrtcScreenAnswer(ScreenSdpData),
    WebrtcScreenIce(ScreenIceData),
    RadioTune(StationIdData),
    RadioUntune,
    RadioPlay(RadioPlayData),
    RadioPause(RadioPositionData),
    RadioResume(StationIdData),
    RadioSeek(RadioPositionData),
    RadioSkip(StationIdData),
    RadioStop(StationIdData),
    RadioTrackEnded(StationIdData),
    RadioStationCreate(CreateStationData),
    RadioStationDelete(StationIdData),
    RadioStationSetMode(StationModeData),
    MediaPlay(MediaPlayData),
    MediaPause(MediaPositionData),
    MediaSeek(MediaPositionData),
    MediaStop,
}

impl ClientOp {
    /// Decode one wire message. `None` means "drop it": malformed JSON,
    /// unknown op, or a payload that does not match the op's shape.
    pub fn decode(text: &str) -> Option<Self> {
        let env: Envelope = serde_json::from_str(text).ok()?;
        Self::from_envelope(&env.op, env.d)
    }

    fn from_envelope(op: &str, d: serde_json::Value) -> Option<Self> {
        fn data<T: DeserializeOwned>(d: serde_json::Value) -> Option<T> {
            serde_json::from_value(d).ok()
        }

        Some(match op {
            "authenticate" => Self::Authenticate(data(d)?),
            "ping" => Self::Ping,
            "send_message" => Self::SendMessage(data(d)?),
            "edit_message" => Self::EditMessage(data(d)?),
            "delete_message" => Self::DeleteMessage(data(d)?),
            "add_reaction" => Self::AddReaction(data(d)?),
            "remove_reaction" => Self::RemoveReaction(data(d)?),
            "typing_start" => Self::TypingStart(data(d)?),
            "create_channel" => Self::CreateChannel(data(d)?),
            "delete_channel" => Self::DeleteChannel(data(d)?),
            "mark_notification_read" => Self::MarkNotificationRead(data(d)?),
            "mark_all_notifications_read" => Self::MarkAllNotificationsRead,
            "join_voice" => Self::JoinVoice(data(d)?),
            "leave_voice" => Self::LeaveVoice,
            "voice_self_mute" => Self::VoiceSelfMute(data(d)?),
            "voice_self_deafen" => Self::VoiceSelfDeafen(data(d)?),
            "voice_speaking" => Self::VoiceSpeaking(data(d)?),
            "voice_server_mute" => Self::VoiceServerMute(data(d)?),
            "webrtc_answer" => Self::WebrtcAnswer(data(d)?),
            "webrtc_ice" => Self::WebrtcIce(data(d)?),
            "screen_share_start" => Self::ScreenShareStart,
            "screen_share_stop" => Self::ScreenShareStop,
            "screen_share_subscribe" => Self::ScreenShareSubscribe(data(d)?),
            "screen_share_unsubscribe" => Self::ScreenShareUnsubscribe(data(d)?),
            "webrtc_screen_answer" => Self::WebrtcScreenAnswer(data(d)?),
            "webrtc_screen_ice" => Self::WebrtcScreenIce(data(d)?),
            "radio_tune" => Self::RadioTune(data(d)?),
            "radio_untune" => Self::RadioUntune,
            "radio_play" => Self::RadioPlay(data(d)?),
            "radio_pause" => Self::RadioPause(data(d)?),
            "radio_resume" => Self::RadioResume(data(d)?),
            "radio_seek" => Self::RadioSeek(data(d)?),
            // older clients said radio_next
            "radio_skip" | "radio_next" => Self::RadioSkip(data(d)?),
            "radio_stop" => Self::RadioStop(data(d)?),
            "radio_track_ended" => Self::RadioTrackEnded(data(d)?),
            "radio_station_create" => Self::RadioStationCreate(data(d)?),
            "radio_station_delete" => Self::RadioStationDelete(data(d)?),
            "radio_station_set_mode" => Self::RadioStationSetMode(data(d)?),
            "media_play" => Self::MediaPlay(data(d)?),
            "media_pause" => Self::MediaPause(data(d)?),
            "media_seek" => Self::MediaSeek(data(d)?),
            "media_stop" => Self::MediaStop,
            _ => return None,
        })
    }
}

// --- server → client payloads ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPayload {
    pub id: String,
    pub username: String,
    pub is_admin: bool,
}

impl From<&User> for UserPayload {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            is_admin: user.is_admin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserOnlinePayload {
    pub user: UserPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdPayload {
    pub user_id: String,
}

/// Voice participant state as broadcast to clients. `channel_id: None` is the
/// client-visible "left voice" signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceStatePayload {
    pub user_id: String,
    pub channel_id: Option<String>,
    #[serde(flatten)]
    pub flags: VoiceStateFlags,
}

impl VoiceStatePayload {
    pub fn left(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            channel_id: None,
            flags: VoiceStateFlags::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCreatePayload {
    pub id: String,
    pub channel_id: String,
    pub author: UserPayload,
    pub content: Option<String>,
    pub reply_to: Option<ReplyToPayload>,
    pub attachments: Vec<Attachment>,
    pub mentions: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyToPayload {
    pub id: String,
    pub author: UserPayload,
    pub content: Option<String>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageUpdatePayload {
    pub id: String,
    pub channel_id: String,
    pub content: String,
    pub edited_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDeletePayload {
    pub id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingStartPayload {
    pub channel_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDeletePayload {
    pub channel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcePayload {
    pub candidate: RTCIceCandidateInit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenSdpPayload {
    pub sdp: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenIcePayload {
    pub candidate: RTCIceCandidateInit,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSharePayload {
    pub user_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenShareErrorPayload {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioPlaylistPayload {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub station_id: String,
    pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioPlaybackPayload {
    pub station_id: String,
    pub playlist_id: String,
    pub track_index: usize,
    pub track: Track,
    pub playing: bool,
    pub position: f64,
    pub updated_at: f64,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioStoppedPayload {
    pub station_id: String,
    pub stopped: bool,
}

impl RadioStoppedPayload {
    pub fn new(station_id: impl Into<String>) -> Self {
        Self {
            station_id: station_id.into(),
            stopped: true,
        }
    }
}

/// Coarse station status shown outside the player (sidebar).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioStatusPayload {
    pub station_id: String,
    pub playing: bool,
    pub track: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioListenersPayload {
    pub station_id: String,
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationIdPayload {
    pub station_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPlaybackPayload {
    pub video_id: String,
    pub playing: bool,
    pub position: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub user: UserPayload,
    pub channels: Vec<Channel>,
    pub online_users: Vec<UserPayload>,
    pub all_users: Vec<UserPayload>,
    pub voice_states: Vec<VoiceStatePayload>,
    pub notifications: Vec<Notification>,
    pub screen_shares: Vec<ScreenSharePayload>,
    pub media_list: Vec<MediaItem>,
    pub media_playback: Option<MediaPlaybackPayload>,
    pub radio_stations: Vec<RadioStation>,
    pub radio_playlists: Vec<RadioPlaylistPayload>,
    pub radio_playback: Vec<RadioPlaybackPayload>,
    pub radio_listeners: Vec<RadioListenersPayload>,
    /// Clock anchor: server wall clock (Unix seconds) at snapshot time
    pub server_time: f64,
    pub deleted_channels: Vec<Channel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_op() {
        // given:
        let text = r#"{"op":"join_voice","d":{"channel_id":"ch-1"}}"#;

        // when:
        let op = ClientOp::decode(text);

        // then:
        match op {
            Some(ClientOp::JoinVoice(d)) => assert_eq!(d.channel_id, "ch-1"),
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_op_is_dropped() {
        // given: an op from some newer client
        let text = r#"{"op":"holographic_call","d":{"x":1}}"#;

        // when / then:
        assert!(ClientOp::decode(text).is_none());
    }

    #[test]
    fn test_decode_malformed_json_is_dropped() {
        // given / when / then:
        assert!(ClientOp::decode("not json at all").is_none());
        assert!(ClientOp::decode(r#"{"op":"ping""#).is_none());
    }

    #[test]
    fn test_decode_payload_shape_mismatch_is_dropped() {
        // given: join_voice without its channel_id
        let text = r#"{"op":"join_voice","d":{}}"#;

        // when / then:
        assert!(ClientOp::decode(text).is_none());
    }

    #[test]
    fn test_decode_ping_without_payload() {
        // given / when / then: both bare and d-carrying pings decode
        assert!(matches!(
            ClientOp::decode(r#"{"op":"ping"}"#),
            Some(ClientOp::Ping)
        ));
        assert!(matches!(
            ClientOp::decode(r#"{"op":"ping","d":{}}"#),
            Some(ClientOp::Ping)
        ));
    }

    #[test]
    fn test_envelope_shape() {
        // given:
        let payload = UserIdPayload {
            user_id: "u-1".to_string(),
        };

        // when:
        let text = envelope("user_offline", &payload);
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        // then:
        assert_eq!(value["op"], "user_offline");
        assert_eq!(value["d"]["user_id"], "u-1");
    }

    #[test]
    fn test_envelope_null_clears_payload() {
        // given / when:
        let text = envelope_null("media_playback");
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        // then:
        assert_eq!(value["op"], "media_playback");
        assert!(value["d"].is_null());
    }

    #[test]
    fn test_voice_state_payload_flattens_flags() {
        // given:
        let payload = VoiceStatePayload {
            user_id: "u-1".to_string(),
            channel_id: Some("ch-1".to_string()),
            flags: VoiceStateFlags {
                self_mute: true,
                ..Default::default()
            },
        };

        // when:
        let value = serde_json::to_value(&payload).unwrap();

        // then: flags serialize at the top level, like every other field
        assert_eq!(value["self_mute"], true);
        assert_eq!(value["server_mute"], false);
        assert_eq!(value["channel_id"], "ch-1");
    }

    #[test]
    fn test_voice_state_left_has_null_channel() {
        // given / when:
        let value = serde_json::to_value(VoiceStatePayload::left("u-9")).unwrap();

        // then:
        assert!(value["channel_id"].is_null());
    }
}
