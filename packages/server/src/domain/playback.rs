//! Authoritative playback state for radio stations and the shared media
//! surface.
//!
//! The hub never streams a ticking clock. Each state stores the last written
//! `position` together with the wall-clock instant `updated_at` at which that
//! position was true; while `playing`, the live position is derived as
//! `position + (now - updated_at)`. Clients do the same derivation with the
//! clock anchor they received at connect time. `updated_at` is monotonically
//! non-decreasing.

use super::Track;

/// Playback state of one radio station.
#[derive(Debug, Clone, PartialEq)]
pub struct RadioPlayback {
    pub station_id: String,
    pub playlist_id: String,
    pub track_index: usize,
    /// Snapshot of the playlist's tracks taken when playback (re)started
    pub tracks: Vec<Track>,
    pub playing: bool,
    /// Position in seconds at the `updated_at` instant
    pub position: f64,
    /// Anchor: Unix seconds at which `position` was last true
    pub updated_at: f64,
    /// User controlling the playback
    pub user_id: String,
    /// Bumped on every mutation; stale auto-advance timers compare and no-op
    pub generation: u64,
}

impl RadioPlayback {
    pub fn start(
        station_id: String,
        playlist_id: String,
        tracks: Vec<Track>,
        user_id: String,
        now: f64,
    ) -> Self {
        Self {
            station_id,
            playlist_id,
            track_index: 0,
            tracks,
            playing: true,
            position: 0.0,
            updated_at: now,
            user_id,
            generation: 0,
        }
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.tracks.get(self.track_index)
    }

    /// Live position derived from the anchor. Frozen while paused.
    pub fn position_at(&self, now: f64) -> f64 {
        if self.playing {
            self.position + (now - self.updated_at).max(0.0)
        } else {
            self.position
        }
    }

    /// Seconds until the current track ends, None while paused or without a
    /// current track.
    pub fn remaining_at(&self, now: f64) -> Option<f64> {
        if !self.playing {
            return None;
        }
        let track = self.current_track()?;
        Some((track.duration - self.position_at(now)).max(0.0))
    }

    pub fn pause(&mut self, position: f64, now: f64) {
        self.playing = false;
        self.position = position.max(0.0);
        self.touch(now);
    }

    pub fn resume(&mut self, now: f64) {
        self.playing = true;
        self.touch(now);
    }

    pub fn seek(&mut self, position: f64, now: f64) {
        self.position = position.max(0.0);
        self.touch(now);
    }

    /// Move to the next track of the current snapshot. Returns false when the
    /// snapshot is exhausted (end-of-playlist handling is the caller's job).
    pub fn advance_within_playlist(&mut self, now: f64) -> bool {
        if self.track_index + 1 >= self.tracks.len() {
            return false;
        }
        self.track_index += 1;
        self.position = 0.0;
        self.playing = true;
        self.touch(now);
        true
    }

    /// Restart at track 0 of a (possibly different) playlist snapshot.
    pub fn restart_with(&mut self, playlist_id: String, tracks: Vec<Track>, now: f64) {
        self.playlist_id = playlist_id;
        self.tracks = tracks;
        self.track_index = 0;
        self.position = 0.0;
        self.playing = true;
        self.touch(now);
    }

    /// Whether the current track has played past its duration.
    pub fn ended_at(&self, now: f64) -> bool {
        match self.current_track() {
            Some(track) => self.playing && self.position_at(now) >= track.duration,
            None => false,
        }
    }

    fn touch(&mut self, now: f64) {
        // anchor never moves backwards
        self.updated_at = self.updated_at.max(now);
        self.generation += 1;
    }
}

/// Playback state of the single shared media surface.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlayback {
    pub video_id: String,
    pub playing: bool,
    pub position: f64,
    pub updated_at: f64,
}

impl MediaPlayback {
    pub fn start(video_id: String, position: f64, now: f64) -> Self {
        Self {
            video_id,
            playing: true,
            position: position.max(0.0),
            updated_at: now,
        }
    }

    pub fn position_at(&self, now: f64) -> f64 {
        if self.playing {
            self.position + (now - self.updated_at).max(0.0)
        } else {
            self.position
        }
    }

    pub fn pause(&mut self, position: f64, now: f64) {
        self.playing = false;
        self.position = position.max(0.0);
        self.updated_at = self.updated_at.max(now);
    }

    pub fn seek(&mut self, position: f64, now: f64) {
        self.position = position.max(0.0);
        self.updated_at = self.updated_at.max(now);
    }
}
