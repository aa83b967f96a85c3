//! Presence registry: which users currently hold a live transport session.
//!
//! One handle per user; registering again replaces the previous handle and
//! drops its queue, which ends the old socket's writer. Pushes never block.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use courier_shared::protocol::ServerEvent;
use courier_shared::types::{SessionId, UserId};

/// The outbound side of one connected session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    tx: mpsc::Sender<ServerEvent>,
}

impl SessionHandle {
    /// Create a handle with a bounded queue of `capacity` events.
    pub fn new(user_id: UserId, capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            session_id: SessionId::new(),
            user_id,
            created_at: Utc::now(),
            tx,
        };
        (handle, rx)
    }

    /// Queue an event without waiting. A full or closed queue drops it.
    pub fn push(&self, event: ServerEvent) -> bool {
        let name = event.name();
        if self.tx.try_send(event).is_err() {
            debug!(
                user = %self.user_id,
                session = %self.session_id,
                event = name,
                "Dropping event for slow or closed session"
            );
            return false;
        }
        true
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<UserId, SessionHandle>>>,
    queue_size: usize,
}

impl SessionRegistry {
    pub fn new(queue_size: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            queue_size,
        }
    }

    /// A new handle sized for this registry, not yet registered.
    pub fn open_session(&self, user: UserId) -> (SessionHandle, mpsc::Receiver<ServerEvent>) {
        SessionHandle::new(user, self.queue_size)
    }

    /// Register `handle`, replacing any previous handle of the same user, and
    /// tell every other session the user is online.
    pub async fn register(&self, handle: SessionHandle) {
        let user = handle.user_id.clone();
        let session = handle.session_id;
        let replaced = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(user.clone(), handle)
        };

        info!(
            user = %user,
            session = %session,
            replaced = replaced.is_some(),
            "Session registered"
        );

        self.broadcast_except(&user, ServerEvent::UserOnline { user_id: user.clone() })
            .await;
    }

    /// Drop whatever handle `user` has. Emits exactly one `user-offline` when
    /// a handle was removed and nothing otherwise.
    pub async fn unregister(&self, user: &UserId) -> bool {
        let removed = self.sessions.write().await.remove(user);
        self.announce_offline(user, removed.is_some()).await
    }

    /// Like [`unregister`](Self::unregister), but only if the handle is still
    /// `session_id`, so a stale socket closing after a reconnect leaves the
    /// newer session alone.
    pub async fn unregister_session(&self, user: &UserId, session_id: SessionId) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(user) {
                Some(handle) if handle.session_id == session_id => sessions.remove(user),
                _ => None,
            }
        };
        self.announce_offline(user, removed.is_some()).await
    }

    async fn announce_offline(&self, user: &UserId, removed: bool) -> bool {
        if removed {
            info!(user = %user, "Session unregistered");
            self.broadcast_except(user, ServerEvent::UserOffline { user_id: user.clone() })
                .await;
        }
        removed
    }

    pub async fn lookup(&self, user: &UserId) -> Option<SessionHandle> {
        self.sessions.read().await.get(user).cloned()
    }

    /// Push `event` to every registered session except `user`'s.
    pub async fn broadcast_except(&self, user: &UserId, event: ServerEvent) {
        let targets: Vec<SessionHandle> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(id, _)| *id != user)
                .map(|(_, handle)| handle.clone())
                .collect()
        };

        for handle in targets {
            handle.push(event.clone());
        }
    }

    /// Users with a live session, sorted.
    pub async fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.sessions.read().await.keys().cloned().collect();
        users.sort();
        users
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
