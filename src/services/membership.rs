//! Cached membership for one room.
//!
//! Loaded from the store when a room actor spawns and refreshed on
//! membership mutation, so the hot path never touches the database for an
//! authorization check. Fail-closed behavior lives at the load sites: when
//! the store cannot answer, there is no cache and nobody is authorized.

use std::collections::HashMap;

use uuid::Uuid;

use crate::event::{MemberInfo, MemberRole, RoomError};

#[derive(Debug, Default)]
pub struct RoomMembership {
    /// Ordered by `(joined_at, user_id)`, the store's contract.
    members: Vec<MemberInfo>,
    index: HashMap<Uuid, usize>,
}

impl RoomMembership {
    #[must_use]
    pub fn from_rows(members: Vec<MemberInfo>) -> Self {
        let index = members
            .iter()
            .enumerate()
            .map(|(i, m)| (m.user_id, i))
            .collect();
        Self { members, index }
    }

    /// Require membership, returning the role or `Forbidden`.
    pub fn authorize(&self, user_id: Uuid) -> Result<MemberRole, RoomError> {
        self.role_of(user_id).ok_or(RoomError::Forbidden("not a room member"))
    }

    #[must_use]
    pub fn contains(&self, user_id: Uuid) -> bool {
        self.index.contains_key(&user_id)
    }

    #[must_use]
    pub fn role_of(&self, user_id: Uuid) -> Option<MemberRole> {
        self.index.get(&user_id).map(|i| self.members[*i].role)
    }

    #[must_use]
    pub fn name_of(&self, user_id: Uuid) -> Option<&str> {
        self.index.get(&user_id).map(|i| self.members[*i].name.as_str())
    }

    #[must_use]
    pub fn members(&self) -> &[MemberInfo] {
        &self.members
    }

    #[must_use]
    pub fn user_ids(&self) -> Vec<Uuid> {
        self.members.iter().map(|m| m.user_id).collect()
    }

    /// Members other than `sender` — the recipient set for receipt math.
    #[must_use]
    pub fn recipient_count(&self, sender: Uuid) -> usize {
        self.members.iter().filter(|m| m.user_id != sender).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
#[path = "membership_test.rs"]
mod tests;
