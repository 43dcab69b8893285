//! Connection registry and presence.
//!
//! Tracks every authenticated live connection and its outbound send path.
//! Presence is derived, never stored: a user is online iff the registry
//! holds at least one connection for them, so multiple simultaneous
//! connections per user (desktop + browser) refcount naturally.
//!
//! Outbound delivery must never stall the mutation path: sends go through a
//! bounded channel with `try_send`, and a connection whose buffer is full is
//! aborted (the client reconnects with backoff) instead of queueing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, mpsc};
use uuid::Uuid;

use super::dto::websocket::UserPayload;
use crate::domain::User;

/// Outbound buffer per connection; overflowing it drops the connection.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Sender half of a connection's outbound path.
pub type OutboundSender = mpsc::Sender<String>;

struct ConnectionEntry {
    user_id: String,
    username: String,
    is_admin: bool,
    tx: OutboundSender,
    /// Fired to make the connection's writer task shut the socket down
    abort: Arc<Notify>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<Uuid, ConnectionEntry>,
    by_user: HashMap<String, HashSet<Uuid>>,
}

/// Outcome of removing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnregisterOutcome {
    pub user_id: String,
    /// True when this was the user's last live connection
    pub last_connection: bool,
}

pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Register an authenticated connection. Returns true when this is the
    /// user's first live connection (presence transition to online).
    pub async fn register(
        &self,
        conn_id: Uuid,
        user: &User,
        tx: OutboundSender,
        abort: Arc<Notify>,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        inner.connections.insert(
            conn_id,
            ConnectionEntry {
                user_id: user.id.clone(),
                username: user.username.clone(),
                is_admin: user.is_admin,
                tx,
                abort,
            },
        );
        let conns = inner.by_user.entry(user.id.clone()).or_default();
        conns.insert(conn_id);
        let first = conns.len() == 1;
        tracing::debug!(
            user_id = %user.id,
            %conn_id,
            first_connection = first,
            "connection registered"
        );
        first
    }

    /// Remove a connection. Returns the owning user and whether it was their
    /// last connection (presence transition to offline).
    pub async fn unregister(&self, conn_id: Uuid) -> Option<UnregisterOutcome> {
        let mut inner = self.inner.lock().await;
        let entry = inner.connections.remove(&conn_id)?;
        let last = match inner.by_user.get_mut(&entry.user_id) {
            Some(conns) => {
                conns.remove(&conn_id);
                if conns.is_empty() {
                    inner.by_user.remove(&entry.user_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        };
        tracing::debug!(user_id = %entry.user_id, %conn_id, last_connection = last, "connection unregistered");
        Some(UnregisterOutcome {
            user_id: entry.user_id,
            last_connection: last,
        })
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.inner.lock().await.by_user.contains_key(user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    /// Currently online users, one entry per user.
    pub async fn online_users(&self) -> Vec<UserPayload> {
        let inner = self.inner.lock().await;
        let mut seen = HashSet::new();
        let mut users: Vec<UserPayload> = inner
            .connections
            .values()
            .filter(|entry| seen.insert(entry.user_id.clone()))
            .map(|entry| UserPayload {
                id: entry.user_id.clone(),
                username: entry.username.clone(),
                is_admin: entry.is_admin,
            })
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    /// Send to one specific connection.
    pub async fn send_to_connection(&self, conn_id: Uuid, text: &str) {
        let inner = self.inner.lock().await;
        if let Some(entry) = inner.connections.get(&conn_id) {
            Self::push(entry, text);
        }
    }

    /// Send to every connection of one user.
    pub async fn send_to_user(&self, user_id: &str, text: &str) {
        let inner = self.inner.lock().await;
        let Some(conns) = inner.by_user.get(user_id) else {
            return;
        };
        for conn_id in conns {
            if let Some(entry) = inner.connections.get(conn_id) {
                Self::push(entry, text);
            }
        }
    }

    /// Send to every live connection.
    pub async fn broadcast_all(&self, text: &str) {
        let inner = self.inner.lock().await;
        for entry in inner.connections.values() {
            Self::push(entry, text);
        }
    }

    /// Send to every live connection except the given user's.
    pub async fn broadcast_except_user(&self, user_id: &str, text: &str) {
        let inner = self.inner.lock().await;
        for entry in inner.connections.values() {
            if entry.user_id != user_id {
                Self::push(entry, text);
            }
        }
    }

    /// Moderation hook: shut down every connection of a user.
    pub async fn force_disconnect_user(&self, user_id: &str) {
        let inner = self.inner.lock().await;
        let Some(conns) = inner.by_user.get(user_id) else {
            return;
        };
        for conn_id in conns {
            if let Some(entry) = inner.connections.get(conn_id) {
                entry.abort.notify_one();
            }
        }
    }

    fn push(entry: &ConnectionEntry, text: &str) {
        if entry.tx.try_send(text.to_string()).is_err() {
            // Buffer full or writer gone: disconnect the slow client rather
            // than queueing behind it.
            tracing::warn!(user_id = %entry.user_id, "outbound buffer full, dropping connection");
            entry.abort.notify_one();
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user(id: &str) -> User {
        User::new(id, format!("{id}-name"))
    }

    fn channel_pair(cap: usize) -> (OutboundSender, mpsc::Receiver<String>, Arc<Notify>) {
        let (tx, rx) = mpsc::channel(cap);
        (tx, rx, Arc::new(Notify::new()))
    }

    #[tokio::test]
    async fn test_presence_is_refcounted_across_connections() {
        // given: one user with two live connections
        let registry = ConnectionRegistry::new();
        let user = test_user("alice");
        let (tx1, _rx1, abort1) = channel_pair(8);
        let (tx2, _rx2, abort2) = channel_pair(8);
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();

        // when:
        let first = registry.register(c1, &user, tx1, abort1).await;
        let second = registry.register(c2, &user, tx2, abort2).await;

        // then: only the first registration is a presence transition
        assert!(first);
        assert!(!second);
        assert!(registry.is_online("alice").await);

        // when: the first connection closes
        let outcome = registry.unregister(c1).await.unwrap();

        // then: still online, not the last connection
        assert!(!outcome.last_connection);
        assert!(registry.is_online("alice").await);

        // when: the last connection closes
        let outcome = registry.unregister(c2).await.unwrap();

        // then: exactly one offline transition
        assert!(outcome.last_connection);
        assert!(!registry.is_online("alice").await);
    }

    #[tokio::test]
    async fn test_unregister_unknown_connection_is_noop() {
        // given:
        let registry = ConnectionRegistry::new();

        // when / then:
        assert!(registry.unregister(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_connections() {
        // given:
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1, abort1) = channel_pair(8);
        let (tx2, mut rx2, abort2) = channel_pair(8);
        registry
            .register(Uuid::new_v4(), &test_user("alice"), tx1, abort1)
            .await;
        registry
            .register(Uuid::new_v4(), &test_user("bob"), tx2, abort2)
            .await;

        // when:
        registry.broadcast_all("hello").await;

        // then:
        assert_eq!(rx1.recv().await.as_deref(), Some("hello"));
        assert_eq!(rx2.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_broadcast_except_user_skips_that_user() {
        // given:
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1, abort1) = channel_pair(8);
        let (tx2, mut rx2, abort2) = channel_pair(8);
        registry
            .register(Uuid::new_v4(), &test_user("alice"), tx1, abort1)
            .await;
        registry
            .register(Uuid::new_v4(), &test_user("bob"), tx2, abort2)
            .await;

        // when:
        registry.broadcast_except_user("alice", "psst").await;

        // then:
        assert_eq!(rx2.recv().await.as_deref(), Some("psst"));
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_user_hits_every_connection_of_that_user() {
        // given: alice on two devices
        let registry = ConnectionRegistry::new();
        let user = test_user("alice");
        let (tx1, mut rx1, abort1) = channel_pair(8);
        let (tx2, mut rx2, abort2) = channel_pair(8);
        registry.register(Uuid::new_v4(), &user, tx1, abort1).await;
        registry.register(Uuid::new_v4(), &user, tx2, abort2).await;

        // when:
        registry.send_to_user("alice", "direct").await;

        // then:
        assert_eq!(rx1.recv().await.as_deref(), Some("direct"));
        assert_eq!(rx2.recv().await.as_deref(), Some("direct"));
    }

    #[tokio::test]
    async fn test_slow_client_is_aborted_not_queued() {
        // given: a connection with a full outbound buffer
        let registry = ConnectionRegistry::new();
        let (tx, _rx, abort) = channel_pair(1);
        tx.try_send("stuck".to_string()).unwrap();
        let conn_id = Uuid::new_v4();
        registry
            .register(conn_id, &test_user("slow"), tx, abort.clone())
            .await;

        let notified = abort.notified();

        // when:
        registry.broadcast_all("overflow").await;

        // then: the connection's abort is fired instead of blocking
        tokio::time::timeout(std::time::Duration::from_millis(100), notified)
            .await
            .expect("abort should fire for the slow client");
    }

    #[tokio::test]
    async fn test_online_users_dedupes_multi_connection_users() {
        // given:
        let registry = ConnectionRegistry::new();
        let user = test_user("alice");
        let (tx1, _rx1, abort1) = channel_pair(8);
        let (tx2, _rx2, abort2) = channel_pair(8);
        registry.register(Uuid::new_v4(), &user, tx1, abort1).await;
        registry.register(Uuid::new_v4(), &user, tx2, abort2).await;

        // when:
        let online = registry.online_users().await;

        // then:
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].id, "alice");
    }

    #[tokio::test]
    async fn test_force_disconnect_fires_abort_for_all_connections() {
        // given:
        let registry = ConnectionRegistry::new();
        let user = test_user("banned");
        let (tx1, _rx1, abort1) = channel_pair(8);
        let (tx2, _rx2, abort2) = channel_pair(8);
        registry
            .register(Uuid::new_v4(), &user, tx1, abort1.clone())
            .await;
        registry
            .register(Uuid::new_v4(), &user, tx2, abort2.clone())
            .await;
        let n1 = abort1.notified();
        let n2 = abort2.notified();

        // when:
        registry.force_disconnect_user("banned").await;

        // then:
        let wait = std::time::Duration::from_millis(100);
        tokio::time::timeout(wait, n1).await.expect("first abort");
        tokio::time::timeout(wait, n2).await.expect("second abort");
    }
}
