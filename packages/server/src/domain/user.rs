//! User entity as returned by the external user store.

use serde::{Deserialize, Serialize};

/// An authenticated account.
///
/// The hub never stores users itself; instances of this struct are looked up
/// through [`super::DataStore`] at authentication time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub is_admin: bool,
    /// Unapproved accounts are rejected at the door
    pub approved: bool,
}

impl User {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            is_admin: false,
            approved: true,
        }
    }

    pub fn admin(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            is_admin: true,
            ..Self::new(id, username)
        }
    }
}
