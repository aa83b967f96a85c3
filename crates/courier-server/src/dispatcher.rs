//! Best-effort fan-out of server events to online users.

use courier_shared::protocol::ServerEvent;
use courier_shared::types::UserId;

use crate::sessions::SessionRegistry;

#[derive(Clone)]
pub struct Dispatcher {
    sessions: SessionRegistry,
}

impl Dispatcher {
    pub fn new(sessions: SessionRegistry) -> Self {
        Self { sessions }
    }

    /// Push to `user` if they are online. Returns whether the event was queued.
    pub async fn push(&self, user: &UserId, event: ServerEvent) -> bool {
        match self.sessions.lookup(user).await {
            Some(handle) => handle.push(event),
            None => false,
        }
    }

    /// Push the same event to several users; offline users are skipped.
    pub async fn push_many<'a, I>(&self, users: I, event: &ServerEvent) -> usize
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        let mut delivered = 0;
        for user in users {
            if self.push(user, event.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }
}
