//! Shared media catalog entity.

use serde::{Deserialize, Serialize};

/// An item of the shared media library (group-watched video/audio).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub filename: String,
    pub url: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub created_at: String,
}
