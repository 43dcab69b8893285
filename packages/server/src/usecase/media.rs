//! Shared media surface: one global, admin-controlled playback state for
//! group-watched video.

use std::sync::Arc;

use hiroba_shared::time::Clock;
use tokio::sync::Mutex;

use crate::domain::{MediaPlayback, User};
use crate::infrastructure::dto::websocket::{
    MediaPlaybackPayload, MediaPlayData, MediaPositionData, envelope, envelope_null,
};
use crate::infrastructure::registry::ConnectionRegistry;

pub struct MediaUseCase {
    registry: Arc<ConnectionRegistry>,
    clock: Arc<dyn Clock>,
    playback: Mutex<Option<MediaPlayback>>,
}

impl MediaUseCase {
    pub fn new(registry: Arc<ConnectionRegistry>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            clock,
            playback: Mutex::new(None),
        })
    }

    pub async fn play(&self, user: &User, d: MediaPlayData) {
        if !user.is_admin {
            return;
        }
        let now = self.clock.now_unix_secs();
        let payload = {
            let mut playback = self.playback.lock().await;
            let state = MediaPlayback::start(d.video_id, d.position, now);
            let payload = Self::payload_of(&state);
            *playback = Some(state);
            payload
        };
        self.broadcast(Some(payload)).await;
    }

    pub async fn pause(&self, user: &User, d: MediaPositionData) {
        if !user.is_admin {
            return;
        }
        let now = self.clock.now_unix_secs();
        let payload = {
            let mut playback = self.playback.lock().await;
            let Some(state) = playback.as_mut() else {
                return;
            };
            state.pause(d.position, now);
            Self::payload_of(state)
        };
        self.broadcast(Some(payload)).await;
    }

    pub async fn seek(&self, user: &User, d: MediaPositionData) {
        if !user.is_admin {
            return;
        }
        let now = self.clock.now_unix_secs();
        let payload = {
            let mut playback = self.playback.lock().await;
            let Some(state) = playback.as_mut() else {
                return;
            };
            state.seek(d.position, now);
            Self::payload_of(state)
        };
        self.broadcast(Some(payload)).await;
    }

    pub async fn stop(&self, user: &User) {
        if !user.is_admin {
            return;
        }
        *self.playback.lock().await = None;
        self.broadcast(None).await;
    }

    /// API-layer hook: a media item was deleted; clear playback if it is the
    /// one playing.
    pub async fn clear_if_video(&self, video_id: &str) {
        let cleared = {
            let mut playback = self.playback.lock().await;
            match playback.as_ref() {
                Some(state) if state.video_id == video_id => {
                    *playback = None;
                    true
                }
                _ => false,
            }
        };
        if cleared {
            self.broadcast(None).await;
        }
    }

    pub async fn snapshot(&self) -> Option<MediaPlaybackPayload> {
        self.playback.lock().await.as_ref().map(Self::payload_of)
    }

    fn payload_of(state: &MediaPlayback) -> MediaPlaybackPayload {
        MediaPlaybackPayload {
            video_id: state.video_id.clone(),
            playing: state.playing,
            position: state.position,
            updated_at: state.updated_at,
        }
    }

    async fn broadcast(&self, payload: Option<MediaPlaybackPayload>) {
        let text = match payload {
            Some(payload) => envelope("media_playback", &payload),
            None => envelope_null("media_playback"),
        };
        self.registry.broadcast_all(&text).await;
    }
}
