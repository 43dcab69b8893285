//! Voice participant state flags.

use serde::{Deserialize, Serialize};

/// Mute/deafen/speaking flags of a voice participant.
///
/// These are state-only: toggling them never tears down media. Self flags are
/// set by the participant, `server_mute` only by privileged callers; the flag
/// is additionally enforced at the relay's RTP forwarding loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateFlags {
    pub self_mute: bool,
    pub self_deafen: bool,
    pub server_mute: bool,
    pub speaking: bool,
}
