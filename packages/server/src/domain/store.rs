//! Persistence trait the hub consumes.
//!
//! The domain layer defines the interface it needs; the infrastructure layer
//! provides implementations (dependency inversion). Every call is a plain
//! async request/response against the external store — the hub never assumes
//! caching and aborts an operation before broadcasting when a call fails.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use super::{
    Attachment, Channel, ChannelKind, MediaItem, Message, Notification, PlaybackMode, Playlist,
    RadioStation, ReplyContext, StoreError, Track, User,
};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataStore: Send + Sync {
    // --- users ---

    /// Look up the account an opaque session token belongs to.
    async fn get_user_by_token(&self, token: &str) -> Result<Option<User>, StoreError>;

    async fn get_all_users(&self) -> Result<Vec<User>, StoreError>;

    // --- channels ---

    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>, StoreError>;

    async fn get_all_channels(&self) -> Result<Vec<Channel>, StoreError>;

    /// Soft-deleted channels, shown to admins only.
    async fn get_deleted_channels(&self) -> Result<Vec<Channel>, StoreError>;

    async fn create_channel(
        &self,
        id: &str,
        name: &str,
        kind: ChannelKind,
        created_by: &str,
    ) -> Result<Channel, StoreError>;

    async fn delete_channel(&self, channel_id: &str) -> Result<(), StoreError>;

    async fn is_channel_manager(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError>;

    // --- messages ---

    async fn create_message<'a>(
        &self,
        id: &str,
        channel_id: &str,
        author_id: &str,
        content: Option<&'a str>,
        reply_to_id: Option<&'a str>,
    ) -> Result<Message, StoreError>;

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, StoreError>;

    async fn edit_message(&self, message_id: &str, content: &str) -> Result<Message, StoreError>;

    async fn delete_message(&self, message_id: &str) -> Result<(), StoreError>;

    async fn get_reply_context(
        &self,
        message_id: &str,
    ) -> Result<Option<ReplyContext>, StoreError>;

    /// Attach previously uploaded files to a message and return them.
    async fn link_attachments(
        &self,
        message_id: &str,
        attachment_ids: &[String],
    ) -> Result<Vec<Attachment>, StoreError>;

    // --- reactions ---

    /// Returns false when the identical reaction already exists (idempotent).
    async fn add_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<bool, StoreError>;

    /// Returns false when there was nothing to remove (no-op, not an error).
    async fn remove_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<bool, StoreError>;

    // --- notifications ---

    async fn create_notification(
        &self,
        id: &str,
        user_id: &str,
        kind: &str,
        data: serde_json::Value,
    ) -> Result<Notification, StoreError>;

    async fn get_unread_notifications(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError>;

    async fn mark_notification_read(&self, id: &str, user_id: &str) -> Result<(), StoreError>;

    async fn mark_all_notifications_read(&self, user_id: &str) -> Result<(), StoreError>;

    // --- media catalog ---

    async fn get_all_media(&self) -> Result<Vec<MediaItem>, StoreError>;

    // --- radio ---

    async fn create_station(
        &self,
        id: &str,
        name: &str,
        created_by: &str,
    ) -> Result<RadioStation, StoreError>;

    async fn get_station(&self, station_id: &str) -> Result<Option<RadioStation>, StoreError>;

    async fn get_all_stations(&self) -> Result<Vec<RadioStation>, StoreError>;

    async fn delete_station(&self, station_id: &str) -> Result<(), StoreError>;

    async fn is_station_manager(
        &self,
        station_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError>;

    async fn set_station_mode(
        &self,
        station_id: &str,
        mode: PlaybackMode,
    ) -> Result<(), StoreError>;

    async fn get_all_playlists(&self) -> Result<Vec<Playlist>, StoreError>;

    async fn get_playlists_by_station(
        &self,
        station_id: &str,
    ) -> Result<Vec<Playlist>, StoreError>;

    async fn get_tracks_by_playlist(&self, playlist_id: &str) -> Result<Vec<Track>, StoreError>;
}
