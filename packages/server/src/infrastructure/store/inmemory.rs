//! In-memory `DataStore` implementation.
//!
//! Guarded maps behind a single mutex, in the shape the external relational
//! store would present. Channel and message deletion is soft (tombstoned),
//! mirroring the durable store's behavior so the hub's semantics do not
//! change when one is plugged in.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::domain::{
    Attachment, Channel, ChannelKind, DataStore, MediaItem, Message, Notification, PlaybackMode,
    Playlist, RadioStation, ReplyContext, StoreError, Track, User,
};

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    tokens: HashMap<String, String>,
    channels: HashMap<String, Channel>,
    deleted_channels: HashMap<String, Channel>,
    channel_managers: HashMap<String, HashSet<String>>,
    messages: HashMap<String, Message>,
    reactions: HashSet<(String, String, String)>,
    attachments: HashMap<String, Attachment>,
    message_attachments: HashMap<String, Vec<String>>,
    notifications: HashMap<String, Notification>,
    media: Vec<MediaItem>,
    stations: HashMap<String, RadioStation>,
    station_managers: HashMap<String, HashSet<String>>,
    playlists: HashMap<String, Playlist>,
    tracks: HashMap<String, Vec<Track>>,
    next_channel_position: i32,
    next_station_position: i32,
}

pub struct InMemoryDataStore {
    tables: Mutex<Tables>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    // --- seeding (standalone mode and tests) ---

    pub async fn seed_user(&self, user: User, token: &str) {
        let mut t = self.tables.lock().await;
        t.tokens.insert(token.to_string(), user.id.clone());
        t.users.insert(user.id.clone(), user);
    }

    pub async fn seed_attachment(&self, attachment: Attachment) {
        let mut t = self.tables.lock().await;
        t.attachments.insert(attachment.id.clone(), attachment);
    }

    pub async fn seed_media(&self, item: MediaItem) {
        let mut t = self.tables.lock().await;
        t.media.push(item);
    }

    pub async fn seed_playlist(&self, playlist: Playlist, tracks: Vec<Track>) {
        let mut t = self.tables.lock().await;
        t.tracks.insert(playlist.id.clone(), tracks);
        t.playlists.insert(playlist.id.clone(), playlist);
    }

    fn now_rfc3339() -> String {
        Utc::now().to_rfc3339()
    }
}

impl Default for InMemoryDataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn get_user_by_token(&self, token: &str) -> Result<Option<User>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.tokens
            .get(token)
            .and_then(|user_id| t.users.get(user_id))
            .cloned())
    }

    async fn get_all_users(&self) -> Result<Vec<User>, StoreError> {
        let t = self.tables.lock().await;
        let mut users: Vec<User> = t.users.values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.channels.get(channel_id).cloned())
    }

    async fn get_all_channels(&self) -> Result<Vec<Channel>, StoreError> {
        let t = self.tables.lock().await;
        let mut channels: Vec<Channel> = t.channels.values().cloned().collect();
        channels.sort_by_key(|c| c.position);
        Ok(channels)
    }

    async fn get_deleted_channels(&self) -> Result<Vec<Channel>, StoreError> {
        let t = self.tables.lock().await;
        let mut channels: Vec<Channel> = t.deleted_channels.values().cloned().collect();
        channels.sort_by_key(|c| c.position);
        Ok(channels)
    }

    async fn create_channel(
        &self,
        id: &str,
        name: &str,
        kind: ChannelKind,
        created_by: &str,
    ) -> Result<Channel, StoreError> {
        let mut t = self.tables.lock().await;
        if t.channels.contains_key(id) {
            return Err(StoreError::Conflict(format!("channel {id} exists")));
        }
        let position = t.next_channel_position;
        t.next_channel_position += 1;
        let channel = Channel {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            position,
        };
        t.channels.insert(id.to_string(), channel.clone());
        t.channel_managers
            .entry(id.to_string())
            .or_default()
            .insert(created_by.to_string());
        Ok(channel)
    }

    async fn delete_channel(&self, channel_id: &str) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        match t.channels.remove(channel_id) {
            Some(channel) => {
                t.deleted_channels.insert(channel_id.to_string(), channel);
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("channel {channel_id}"))),
        }
    }

    async fn is_channel_manager(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.channel_managers
            .get(channel_id)
            .is_some_and(|managers| managers.contains(user_id)))
    }

    async fn create_message<'a>(
        &self,
        id: &str,
        channel_id: &str,
        author_id: &str,
        content: Option<&'a str>,
        reply_to_id: Option<&'a str>,
    ) -> Result<Message, StoreError> {
        let mut t = self.tables.lock().await;
        if !t.channels.contains_key(channel_id) {
            return Err(StoreError::NotFound(format!("channel {channel_id}")));
        }
        let message = Message {
            id: id.to_string(),
            channel_id: channel_id.to_string(),
            author_id: Some(author_id.to_string()),
            content: content.map(str::to_string),
            reply_to_id: reply_to_id.map(str::to_string),
            created_at: Self::now_rfc3339(),
            edited_at: None,
            deleted_at: None,
        };
        t.messages.insert(id.to_string(), message.clone());
        Ok(message)
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.messages.get(message_id).cloned())
    }

    async fn edit_message(&self, message_id: &str, content: &str) -> Result<Message, StoreError> {
        let mut t = self.tables.lock().await;
        let message = t
            .messages
            .get_mut(message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        message.content = Some(content.to_string());
        message.edited_at = Some(Self::now_rfc3339());
        Ok(message.clone())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let message = t
            .messages
            .get_mut(message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        message.deleted_at = Some(Self::now_rfc3339());
        Ok(())
    }

    async fn get_reply_context(
        &self,
        message_id: &str,
    ) -> Result<Option<ReplyContext>, StoreError> {
        let t = self.tables.lock().await;
        let Some(message) = t.messages.get(message_id) else {
            return Ok(None);
        };
        let author_username = message
            .author_id
            .as_ref()
            .and_then(|id| t.users.get(id))
            .map(|u| u.username.clone())
            .unwrap_or_default();
        Ok(Some(ReplyContext {
            id: message.id.clone(),
            author_id: message.author_id.clone(),
            author_username,
            content: message.content.clone(),
            deleted: message.deleted_at.is_some(),
        }))
    }

    async fn link_attachments(
        &self,
        message_id: &str,
        attachment_ids: &[String],
    ) -> Result<Vec<Attachment>, StoreError> {
        let mut t = self.tables.lock().await;
        let linked: Vec<Attachment> = attachment_ids
            .iter()
            .filter_map(|id| t.attachments.get(id).cloned())
            .collect();
        t.message_attachments
            .insert(message_id.to_string(), attachment_ids.to_vec());
        Ok(linked)
    }

    async fn add_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<bool, StoreError> {
        let mut t = self.tables.lock().await;
        if !t.messages.contains_key(message_id) {
            return Err(StoreError::NotFound(format!("message {message_id}")));
        }
        Ok(t.reactions.insert((
            message_id.to_string(),
            user_id.to_string(),
            emoji.to_string(),
        )))
    }

    async fn remove_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<bool, StoreError> {
        let mut t = self.tables.lock().await;
        Ok(t.reactions.remove(&(
            message_id.to_string(),
            user_id.to_string(),
            emoji.to_string(),
        )))
    }

    async fn create_notification(
        &self,
        id: &str,
        user_id: &str,
        kind: &str,
        data: serde_json::Value,
    ) -> Result<Notification, StoreError> {
        let mut t = self.tables.lock().await;
        let notification = Notification {
            id: id.to_string(),
            user_id: user_id.to_string(),
            kind: kind.to_string(),
            data,
            read: false,
            created_at: Self::now_rfc3339(),
        };
        t.notifications.insert(id.to_string(), notification.clone());
        Ok(notification)
    }

    async fn get_unread_notifications(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        let t = self.tables.lock().await;
        let mut unread: Vec<Notification> = t
            .notifications
            .values()
            .filter(|n| n.user_id == user_id && !n.read)
            .cloned()
            .collect();
        unread.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        unread.truncate(limit);
        Ok(unread)
    }

    async fn mark_notification_read(&self, id: &str, user_id: &str) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        if let Some(n) = t.notifications.get_mut(id) {
            if n.user_id == user_id {
                n.read = true;
            }
        }
        Ok(())
    }

    async fn mark_all_notifications_read(&self, user_id: &str) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        for n in t.notifications.values_mut() {
            if n.user_id == user_id {
                n.read = true;
            }
        }
        Ok(())
    }

    async fn get_all_media(&self) -> Result<Vec<MediaItem>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.media.clone())
    }

    async fn create_station(
        &self,
        id: &str,
        name: &str,
        created_by: &str,
    ) -> Result<RadioStation, StoreError> {
        let mut t = self.tables.lock().await;
        if t.stations.contains_key(id) {
            return Err(StoreError::Conflict(format!("station {id} exists")));
        }
        let position = t.next_station_position;
        t.next_station_position += 1;
        let station = RadioStation {
            id: id.to_string(),
            name: name.to_string(),
            created_by: created_by.to_string(),
            position,
            playback_mode: PlaybackMode::PlayAll,
        };
        t.stations.insert(id.to_string(), station.clone());
        t.station_managers
            .entry(id.to_string())
            .or_default()
            .insert(created_by.to_string());
        Ok(station)
    }

    async fn get_station(&self, station_id: &str) -> Result<Option<RadioStation>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.stations.get(station_id).cloned())
    }

    async fn get_all_stations(&self) -> Result<Vec<RadioStation>, StoreError> {
        let t = self.tables.lock().await;
        let mut stations: Vec<RadioStation> = t.stations.values().cloned().collect();
        stations.sort_by_key(|s| s.position);
        Ok(stations)
    }

    async fn delete_station(&self, station_id: &str) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        t.stations
            .remove(station_id)
            .ok_or_else(|| StoreError::NotFound(format!("station {station_id}")))?;
        t.station_managers.remove(station_id);
        Ok(())
    }

    async fn is_station_manager(
        &self,
        station_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.station_managers
            .get(station_id)
            .is_some_and(|managers| managers.contains(user_id)))
    }

    async fn set_station_mode(
        &self,
        station_id: &str,
        mode: PlaybackMode,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let station = t
            .stations
            .get_mut(station_id)
            .ok_or_else(|| StoreError::NotFound(format!("station {station_id}")))?;
        station.playback_mode = mode;
        Ok(())
    }

    async fn get_all_playlists(&self) -> Result<Vec<Playlist>, StoreError> {
        let t = self.tables.lock().await;
        let mut playlists: Vec<Playlist> = t.playlists.values().cloned().collect();
        playlists.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(playlists)
    }

    async fn get_playlists_by_station(
        &self,
        station_id: &str,
    ) -> Result<Vec<Playlist>, StoreError> {
        let t = self.tables.lock().await;
        let mut playlists: Vec<Playlist> = t
            .playlists
            .values()
            .filter(|p| p.station_id == station_id)
            .cloned()
            .collect();
        playlists.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(playlists)
    }

    async fn get_tracks_by_playlist(&self, playlist_id: &str) -> Result<Vec<Track>, StoreError> {
        let t = self.tables.lock().await;
        let mut tracks = t.tracks.get(playlist_id).cloned().unwrap_or_default();
        tracks.sort_by_key(|track| track.position);
        Ok(tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_lookup_resolves_seeded_user() {
        // given:
        let store = InMemoryDataStore::new();
        store.seed_user(User::new("u-1", "alice"), "tok-1").await;

        // when:
        let found = store.get_user_by_token("tok-1").await.unwrap();
        let missing = store.get_user_by_token("tok-x").await.unwrap();

        // then:
        assert_eq!(found.unwrap().username, "alice");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_channel_delete_is_soft() {
        // given:
        let store = InMemoryDataStore::new();
        store
            .create_channel("ch-1", "general", ChannelKind::Text, "u-1")
            .await
            .unwrap();

        // when:
        store.delete_channel("ch-1").await.unwrap();

        // then: gone from the live list, present in the tombstones
        assert!(store.get_channel("ch-1").await.unwrap().is_none());
        let deleted = store.get_deleted_channels().await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].id, "ch-1");
    }

    #[tokio::test]
    async fn test_channel_creator_becomes_manager() {
        // given:
        let store = InMemoryDataStore::new();
        store
            .create_channel("ch-1", "general", ChannelKind::Text, "u-1")
            .await
            .unwrap();

        // when / then:
        assert!(store.is_channel_manager("ch-1", "u-1").await.unwrap());
        assert!(!store.is_channel_manager("ch-1", "u-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_reaction_add_is_idempotent() {
        // given:
        let store = InMemoryDataStore::new();
        store
            .create_channel("ch-1", "general", ChannelKind::Text, "u-1")
            .await
            .unwrap();
        store
            .create_message("m-1", "ch-1", "u-1", Some("hi"), None)
            .await
            .unwrap();

        // when: the same user adds the same emoji twice
        let first = store.add_reaction("m-1", "u-1", "👍").await.unwrap();
        let second = store.add_reaction("m-1", "u-1", "👍").await.unwrap();

        // then: one entry
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn test_remove_missing_reaction_is_noop() {
        // given:
        let store = InMemoryDataStore::new();

        // when:
        let removed = store.remove_reaction("m-1", "u-1", "👍").await.unwrap();

        // then: no error, nothing removed
        assert!(!removed);
    }

    #[tokio::test]
    async fn test_message_edit_sets_edited_at() {
        // given:
        let store = InMemoryDataStore::new();
        store
            .create_channel("ch-1", "general", ChannelKind::Text, "u-1")
            .await
            .unwrap();
        store
            .create_message("m-1", "ch-1", "u-1", Some("hi"), None)
            .await
            .unwrap();

        // when:
        let edited = store.edit_message("m-1", "hello").await.unwrap();

        // then:
        assert_eq!(edited.content.as_deref(), Some("hello"));
        assert!(edited.edited_at.is_some());
    }

    #[tokio::test]
    async fn test_unread_notifications_capped_and_filtered() {
        // given: three unread for alice, one read, one for bob
        let store = InMemoryDataStore::new();
        for i in 0..3 {
            store
                .create_notification(&format!("n-{i}"), "alice", "mention", serde_json::json!({}))
                .await
                .unwrap();
        }
        store
            .create_notification("n-read", "alice", "mention", serde_json::json!({}))
            .await
            .unwrap();
        store.mark_notification_read("n-read", "alice").await.unwrap();
        store
            .create_notification("n-bob", "bob", "mention", serde_json::json!({}))
            .await
            .unwrap();

        // when:
        let unread = store.get_unread_notifications("alice", 2).await.unwrap();

        // then:
        assert_eq!(unread.len(), 2);
        assert!(unread.iter().all(|n| n.user_id == "alice" && !n.read));
    }

    #[tokio::test]
    async fn test_tracks_sorted_by_position() {
        // given:
        let store = InMemoryDataStore::new();
        let playlist = Playlist {
            id: "pl-1".to_string(),
            name: "mix".to_string(),
            user_id: "u-1".to_string(),
            station_id: "st-1".to_string(),
        };
        let tracks = vec![
            Track {
                id: "t-2".to_string(),
                filename: "b.ogg".to_string(),
                url: "/b.ogg".to_string(),
                duration: 10.0,
                position: 2,
            },
            Track {
                id: "t-1".to_string(),
                filename: "a.ogg".to_string(),
                url: "/a.ogg".to_string(),
                duration: 10.0,
                position: 1,
            },
        ];
        store.seed_playlist(playlist, tracks).await;

        // when:
        let sorted = store.get_tracks_by_playlist("pl-1").await.unwrap();

        // then:
        assert_eq!(sorted[0].id, "t-1");
        assert_eq!(sorted[1].id, "t-2");
    }

    #[tokio::test]
    async fn test_station_mode_update() {
        // given:
        let store = InMemoryDataStore::new();
        store.create_station("st-1", "lofi", "u-1").await.unwrap();

        // when:
        store
            .set_station_mode("st-1", PlaybackMode::LoopAll)
            .await
            .unwrap();

        // then:
        let station = store.get_station("st-1").await.unwrap().unwrap();
        assert_eq!(station.playback_mode, PlaybackMode::LoopAll);
    }
}
