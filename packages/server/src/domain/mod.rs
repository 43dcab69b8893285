//! Domain model: entities held by the hub, pure session-state machines, and
//! the trait seams the infrastructure layer implements.

mod channel;
mod error;
mod media;
mod notification;
mod playback;
mod radio;
mod rate_limit;
mod store;
mod user;
mod voice;

pub use channel::{Attachment, Channel, ChannelKind, Message, ReplyContext};
pub use error::StoreError;
pub use media::MediaItem;
pub use notification::Notification;
pub use playback::{MediaPlayback, RadioPlayback};
pub use radio::{Playlist, PlaybackMode, RadioStation, Track};
pub use rate_limit::RateLimitBucket;
pub use store::DataStore;
pub use user::User;
pub use voice::VoiceStateFlags;

#[cfg(test)]
pub use store::MockDataStore;
