//! Radio stations: tuning, authoritative playback, auto-advance.
//!
//! One `RadioPlayback` per station, mutated only under the playback table's
//! mutex; the lock is released around every store call, with a generation
//! check on re-entry so a concurrent operation wins over a stale advance.
//! Clients derive live positions themselves from the broadcast anchor —
//! there is no ticking position stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hiroba_shared::time::Clock;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{DataStore, PlaybackMode, RadioPlayback, Track, User};
use crate::infrastructure::dto::websocket::{
    CreateStationData, RadioListenersPayload, RadioPlayData, RadioPlaybackPayload,
    RadioPositionData, RadioStatusPayload, RadioStoppedPayload, StationIdData, StationIdPayload,
    StationModeData, envelope,
};
use crate::infrastructure::registry::ConnectionRegistry;

/// Slack added to the expected track end before the server-side check fires.
const AUTO_ADVANCE_GRACE: Duration = Duration::from_millis(250);

pub struct RadioUseCase {
    store: Arc<dyn DataStore>,
    registry: Arc<ConnectionRegistry>,
    clock: Arc<dyn Clock>,
    playback: Mutex<HashMap<String, RadioPlayback>>,
    /// connection → (user, station) of its current tuning
    tuned: Mutex<HashMap<Uuid, (String, String)>>,
}

impl RadioUseCase {
    pub fn new(
        store: Arc<dyn DataStore>,
        registry: Arc<ConnectionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            clock,
            playback: Mutex::new(HashMap::new()),
            tuned: Mutex::new(HashMap::new()),
        })
    }

    // --- tuning ---

    pub async fn tune(&self, user_id: &str, conn_id: Uuid, d: StationIdData) {
        if d.station_id.is_empty() {
            return;
        }
        let previous = {
            let mut tuned = self.tuned.lock().await;
            tuned.insert(conn_id, (user_id.to_string(), d.station_id.clone()))
        };
        if let Some((_, prev_station)) = previous {
            if prev_station != d.station_id {
                self.broadcast_listeners(&prev_station).await;
            }
        }
        self.broadcast_listeners(&d.station_id).await;
    }

    pub async fn untune(&self, conn_id: Uuid) {
        let removed = self.tuned.lock().await.remove(&conn_id);
        if let Some((_, station_id)) = removed {
            self.broadcast_listeners(&station_id).await;
        }
    }

    // --- transport-facing controls ---

    pub async fn play(self: &Arc<Self>, user: &User, d: RadioPlayData) {
        if !self.can_manage(user, &d.station_id).await {
            return;
        }
        let Ok(Some(_station)) = self.store.get_station(&d.station_id).await else {
            return;
        };
        let Ok(tracks) = self.store.get_tracks_by_playlist(&d.playlist_id).await else {
            return;
        };
        if tracks.is_empty() {
            return;
        }

        let now = self.clock.now_unix_secs();
        let state = RadioPlayback::start(
            d.station_id.clone(),
            d.playlist_id,
            tracks,
            user.id.clone(),
            now,
        );
        let generation = state.generation;
        let payload = Self::payload_of(&state);
        self.playback
            .lock()
            .await
            .insert(d.station_id.clone(), state);

        if let Some(payload) = payload {
            self.broadcast_playing(&payload).await;
        }
        self.schedule_auto_advance(&d.station_id, generation).await;
    }

    pub async fn pause(&self, user: &User, d: RadioPositionData) {
        if !self.can_manage(user, &d.station_id).await {
            return;
        }
        let now = self.clock.now_unix_secs();
        let payload = {
            let mut playback = self.playback.lock().await;
            let Some(state) = playback.get_mut(&d.station_id) else {
                return;
            };
            state.pause(d.position, now);
            Self::payload_of(state)
        };
        if let Some(payload) = payload {
            self.broadcast_playing(&payload).await;
        }
    }

    pub async fn resume(self: &Arc<Self>, user: &User, d: StationIdData) {
        if !self.can_manage(user, &d.station_id).await {
            return;
        }
        let now = self.clock.now_unix_secs();
        let (payload, generation) = {
            let mut playback = self.playback.lock().await;
            let Some(state) = playback.get_mut(&d.station_id) else {
                return;
            };
            state.resume(now);
            (Self::payload_of(state), state.generation)
        };
        if let Some(payload) = payload {
            self.broadcast_playing(&payload).await;
        }
        self.schedule_auto_advance(&d.station_id, generation).await;
    }

    pub async fn seek(self: &Arc<Self>, user: &User, d: RadioPositionData) {
        if !self.can_manage(user, &d.station_id).await {
            return;
        }
        let now = self.clock.now_unix_secs();
        let (payload, generation) = {
            let mut playback = self.playback.lock().await;
            let Some(state) = playback.get_mut(&d.station_id) else {
                return;
            };
            state.seek(d.position, now);
            (Self::payload_of(state), state.generation)
        };
        if let Some(payload) = payload {
            self.broadcast_to_listeners(
                &payload.station_id,
                &envelope("radio_playback", &payload),
            )
            .await;
        }
        self.schedule_auto_advance(&d.station_id, generation).await;
    }

    pub async fn skip(self: &Arc<Self>, user: &User, d: StationIdData) {
        if !self.can_manage(user, &d.station_id).await {
            return;
        }
        self.advance(&d.station_id).await;
    }

    pub async fn stop(&self, user: &User, d: StationIdData) {
        if !self.can_manage(user, &d.station_id).await {
            return;
        }
        self.clear_playback(&d.station_id).await;
    }

    /// Client-side report that the current track finished. Any listener may
    /// send it; the advance logic is idempotent under the generation check.
    pub async fn track_ended(self: &Arc<Self>, d: StationIdData) {
        self.advance(&d.station_id).await;
    }

    // --- station management ---

    pub async fn station_create(&self, user: &User, d: CreateStationData) {
        let name = d.name.trim();
        if name.is_empty() || name.len() > 32 {
            return;
        }
        let station_id = Uuid::new_v4().to_string();
        let station = match self.store.create_station(&station_id, name, &user.id).await {
            Ok(station) => station,
            Err(err) => {
                tracing::error!("create radio station: {err}");
                return;
            }
        };
        self.registry
            .broadcast_all(&envelope("radio_station_create", &station))
            .await;
    }

    pub async fn station_delete(&self, user: &User, d: StationIdData) {
        let Ok(Some(_station)) = self.store.get_station(&d.station_id).await else {
            return;
        };
        if !self.can_manage(user, &d.station_id).await {
            return;
        }

        // Deleting the active station stops and clears its playback first
        self.clear_playback(&d.station_id).await;

        if let Err(err) = self.store.delete_station(&d.station_id).await {
            tracing::error!("delete radio station: {err}");
            return;
        }

        self.tuned
            .lock()
            .await
            .retain(|_, tuning| tuning.1 != d.station_id);

        self.registry
            .broadcast_all(&envelope(
                "radio_station_delete",
                &StationIdPayload {
                    station_id: d.station_id.clone(),
                },
            ))
            .await;
    }

    pub async fn station_set_mode(&self, user: &User, d: StationModeData) {
        let Some(mode) = PlaybackMode::parse(&d.mode) else {
            return;
        };
        if !self.can_manage(user, &d.station_id).await {
            return;
        }
        let Ok(Some(_station)) = self.store.get_station(&d.station_id).await else {
            return;
        };
        if let Err(err) = self.store.set_station_mode(&d.station_id, mode).await {
            tracing::error!("set radio station mode: {err}");
            return;
        }
        if let Ok(Some(updated)) = self.store.get_station(&d.station_id).await {
            self.registry
                .broadcast_all(&envelope("radio_station_update", &updated))
                .await;
        }
    }

    // --- hooks for the API layer ---

    /// Stop and clear a station's playback (e.g. its playlist was deleted).
    pub async fn clear_playback(&self, station_id: &str) {
        let removed = self.playback.lock().await.remove(station_id).is_some();
        if removed {
            self.broadcast_stopped(station_id).await;
        }
    }

    // --- ready snapshot ---

    pub async fn all_playback(&self) -> Vec<RadioPlaybackPayload> {
        self.playback
            .lock()
            .await
            .values()
            .filter_map(Self::payload_of)
            .collect()
    }

    pub async fn all_listeners(&self) -> Vec<RadioListenersPayload> {
        let tuned = self.tuned.lock().await;
        let mut by_station: HashMap<String, Vec<String>> = HashMap::new();
        for (user_id, station_id) in tuned.values() {
            let users = by_station.entry(station_id.clone()).or_default();
            if !users.contains(user_id) {
                users.push(user_id.clone());
            }
        }
        let mut listeners: Vec<RadioListenersPayload> = by_station
            .into_iter()
            .map(|(station_id, mut user_ids)| {
                user_ids.sort();
                RadioListenersPayload {
                    station_id,
                    user_ids,
                }
            })
            .collect();
        listeners.sort_by(|a, b| a.station_id.cmp(&b.station_id));
        listeners
    }

    // --- internals ---

    async fn can_manage(&self, user: &User, station_id: &str) -> bool {
        if user.is_admin {
            return true;
        }
        self.store
            .is_station_manager(station_id, &user.id)
            .await
            .unwrap_or(false)
    }

    /// End-of-track handling: advance within the playlist, or apply the
    /// station's playback mode when the playlist is exhausted.
    ///
    /// Returns a boxed future rather than an `async fn`: `advance` and
    /// `schedule_auto_advance` are mutually recursive (advance → schedule →
    /// spawn → advance), and boxing this edge type-erases the recursion so the
    /// spawned task's `Send` bound can be resolved.
    fn advance<'a>(
        self: &'a Arc<Self>,
        station_id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let now = self.clock.now_unix_secs();

        // In-playlist advance needs no store round trip.
        let (current_playlist, generation) = {
            let mut playback = self.playback.lock().await;
            let Some(state) = playback.get_mut(station_id) else {
                return;
            };
            if state.advance_within_playlist(now) {
                let payload = Self::payload_of(state);
                let generation = state.generation;
                drop(playback);
                if let Some(payload) = payload {
                    self.broadcast_playing(&payload).await;
                }
                self.schedule_auto_advance(station_id, generation).await;
                return;
            }
            (state.playlist_id.clone(), state.generation)
        };

        // Playlist finished: the mode decides, which requires store reads.
        // The table lock is NOT held across them; the generation check below
        // discards this advance if anything changed meanwhile.
        let Ok(Some(station)) = self.store.get_station(station_id).await else {
            self.clear_playback(station_id).await;
            return;
        };

        let next = match station.playback_mode {
            PlaybackMode::LoopOne => self
                .tracks_if_any(&current_playlist)
                .await
                .map(|tracks| (current_playlist.clone(), tracks)),
            PlaybackMode::PlayAll => {
                self.next_playlist_tracks(station_id, &current_playlist, false)
                    .await
            }
            PlaybackMode::LoopAll => {
                match self
                    .next_playlist_tracks(station_id, &current_playlist, true)
                    .await
                {
                    Some(found) => Some(found),
                    // Only one playlist: loop it
                    None => self
                        .tracks_if_any(&current_playlist)
                        .await
                        .map(|tracks| (current_playlist.clone(), tracks)),
                }
            }
            PlaybackMode::Single => None,
        };

        let Some((playlist_id, tracks)) = next else {
            self.clear_playback(station_id).await;
            return;
        };

        let now = self.clock.now_unix_secs();
        let (payload, new_generation) = {
            let mut playback = self.playback.lock().await;
            let Some(state) = playback.get_mut(station_id) else {
                return;
            };
            if state.generation != generation {
                // Someone operated the station while we were at the store
                return;
            }
            state.restart_with(playlist_id, tracks, now);
            (Self::payload_of(state), state.generation)
        };
        if let Some(payload) = payload {
            self.broadcast_playing(&payload).await;
        }
        self.schedule_auto_advance(station_id, new_generation).await;
        })
    }

    async fn tracks_if_any(&self, playlist_id: &str) -> Option<Vec<Track>> {
        match self.store.get_tracks_by_playlist(playlist_id).await {
            Ok(tracks) if !tracks.is_empty() => Some(tracks),
            _ => None,
        }
    }

    /// The next playlist of the station that has tracks, searching forward
    /// from the current one, optionally wrapping around.
    async fn next_playlist_tracks(
        &self,
        station_id: &str,
        current_playlist_id: &str,
        wrap: bool,
    ) -> Option<(String, Vec<Track>)> {
        let playlists = self
            .store
            .get_playlists_by_station(station_id)
            .await
            .ok()?;
        if playlists.is_empty() {
            return None;
        }
        let current = playlists
            .iter()
            .position(|p| p.id == current_playlist_id)?;

        for step in 1..playlists.len() {
            let idx = current + step;
            let idx = if idx >= playlists.len() {
                if !wrap {
                    return None;
                }
                idx % playlists.len()
            } else {
                idx
            };
            if let Some(tracks) = self.tracks_if_any(&playlists[idx].id).await {
                return Some((playlists[idx].id.clone(), tracks));
            }
        }
        None
    }

    /// Server-side auto-advance: check at the expected track end. The stored
    /// generation makes stale checks (after pause/seek/skip/stop) no-ops.
    async fn schedule_auto_advance(self: &Arc<Self>, station_id: &str, generation: u64) {
        let remaining = {
            let playback = self.playback.lock().await;
            let Some(state) = playback.get(station_id) else {
                return;
            };
            if state.generation != generation {
                return;
            }
            let Some(remaining) = state.remaining_at(self.clock.now_unix_secs()) else {
                return;
            };
            remaining
        };

        let this = Arc::clone(self);
        let station_id = station_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(remaining) + AUTO_ADVANCE_GRACE).await;
            let due = {
                let playback = this.playback.lock().await;
                match playback.get(&station_id) {
                    Some(state) => {
                        state.generation == generation
                            && state.ended_at(this.clock.now_unix_secs())
                    }
                    None => false,
                }
            };
            if due {
                this.advance(&station_id).await;
            }
        });
    }

    fn payload_of(state: &RadioPlayback) -> Option<RadioPlaybackPayload> {
        let track = state.current_track()?.clone();
        Some(RadioPlaybackPayload {
            station_id: state.station_id.clone(),
            playlist_id: state.playlist_id.clone(),
            track_index: state.track_index,
            track,
            playing: state.playing,
            position: state.position,
            updated_at: state.updated_at,
            user_id: state.user_id.clone(),
        })
    }

    async fn broadcast_playing(&self, payload: &RadioPlaybackPayload) {
        self.broadcast_to_listeners(&payload.station_id, &envelope("radio_playback", payload))
            .await;
        self.registry
            .broadcast_all(&envelope(
                "radio_status",
                &RadioStatusPayload {
                    station_id: payload.station_id.clone(),
                    playing: payload.playing,
                    track: Some(payload.track.filename.clone()),
                    user_id: Some(payload.user_id.clone()),
                },
            ))
            .await;
    }

    async fn broadcast_stopped(&self, station_id: &str) {
        self.broadcast_to_listeners(
            station_id,
            &envelope("radio_playback", &RadioStoppedPayload::new(station_id)),
        )
        .await;
        self.registry
            .broadcast_all(&envelope(
                "radio_status",
                &RadioStatusPayload {
                    station_id: station_id.to_string(),
                    playing: false,
                    track: None,
                    user_id: None,
                },
            ))
            .await;
    }

    async fn broadcast_to_listeners(&self, station_id: &str, text: &str) {
        let conns: Vec<Uuid> = {
            let tuned = self.tuned.lock().await;
            tuned
                .iter()
                .filter(|(_, (_, station))| station == station_id)
                .map(|(conn_id, _)| *conn_id)
                .collect()
        };
        for conn_id in conns {
            self.registry.send_to_connection(conn_id, text).await;
        }
    }

    async fn broadcast_listeners(&self, station_id: &str) {
        let user_ids = {
            let tuned = self.tuned.lock().await;
            let mut users: Vec<String> = Vec::new();
            for (user_id, station) in tuned.values() {
                if station == station_id && !users.contains(user_id) {
                    users.push(user_id.clone());
                }
            }
            users.sort();
            users
        };
        self.registry
            .broadcast_all(&envelope(
                "radio_listeners",
                &RadioListenersPayload {
                    station_id: station_id.to_string(),
                    user_ids,
                },
            ))
            .await;
    }
}
