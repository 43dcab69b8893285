//! Radio station, playlist and track entities.

use serde::{Deserialize, Serialize};

/// What happens when the last track of the active playlist ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    /// Advance to the next playlist with tracks; stop after the last one
    PlayAll,
    /// Restart the current playlist
    LoopOne,
    /// Advance to the next playlist, wrapping around
    LoopAll,
    /// Stop
    Single,
}

impl PlaybackMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "play_all" => Some(Self::PlayAll),
            "loop_one" => Some(Self::LoopOne),
            "loop_all" => Some(Self::LoopAll),
            "single" => Some(Self::Single),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioStation {
    pub id: String,
    pub name: String,
    pub created_by: String,
    pub position: i32,
    pub playback_mode: PlaybackMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub user_id: String,
    /// Empty string when the playlist is not attached to a station
    pub station_id: String,
}

/// An audio track of a playlist. `duration` is in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub filename: String,
    pub url: String,
    pub duration: f64,
    pub position: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playback_mode_parse_known_modes() {
        // given / when / then:
        assert_eq!(PlaybackMode::parse("play_all"), Some(PlaybackMode::PlayAll));
        assert_eq!(PlaybackMode::parse("loop_one"), Some(PlaybackMode::LoopOne));
        assert_eq!(PlaybackMode::parse("loop_all"), Some(PlaybackMode::LoopAll));
        assert_eq!(PlaybackMode::parse("single"), Some(PlaybackMode::Single));
    }

    #[test]
    fn test_playback_mode_parse_rejects_unknown() {
        // given / when / then:
        assert_eq!(PlaybackMode::parse("shuffle"), None);
        assert_eq!(PlaybackMode::parse(""), None);
    }
}
