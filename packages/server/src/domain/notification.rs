//! Notification entity (mentions etc.), persisted through the store.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(skip_serializing)]
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    pub read: bool,
    pub created_at: String,
}
