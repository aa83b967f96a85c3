//! Read-only view of group membership.
//!
//! Membership itself is managed by another service; the engines only ask
//! whether a user is an active member and who the members are.

use courier_shared::types::{GroupId, UserId};

use crate::error::ServerError;
use crate::store::Store;

pub trait MembershipLookup: Send + Sync {
    fn is_active_member(&self, group: &GroupId, user: &UserId) -> Result<bool, ServerError>;

    /// Active members of `group`.
    fn members(&self, group: &GroupId) -> Result<Vec<UserId>, ServerError>;

    fn require_active(&self, group: &GroupId, user: &UserId) -> Result<(), ServerError> {
        if self.is_active_member(group, user)? {
            Ok(())
        } else {
            Err(ServerError::forbidden(format!(
                "{user} is not an active member of group {group}"
            )))
        }
    }
}

/// Membership mirrored into the local `group_members` table.
pub struct StoreMembership {
    store: Store,
}

impl StoreMembership {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl MembershipLookup for StoreMembership {
    fn is_active_member(&self, group: &GroupId, user: &UserId) -> Result<bool, ServerError> {
        self.store.run(|db| db.is_active_group_member(group, user))
    }

    fn members(&self, group: &GroupId) -> Result<Vec<UserId>, ServerError> {
        self.store.run(|db| db.active_group_members(group))
    }
}
