//! Session → room membership.
//!
//! Rooms are a derived view: a slug maps to the set of sessions currently
//! joined under it, and the entry disappears with its last member. Nothing
//! here is persisted.
//!
//! The registry is plain data with no interior locking; the relay actor owns
//! it exclusively, which is what makes every join/leave atomic with respect to
//! broadcasts.

use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

use crate::protocol::Slug;

/// Identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    rooms: HashMap<Slug, HashSet<SessionId>>,
    membership: HashMap<SessionId, Slug>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `session` in room `slug`, leaving any previous room.
    ///
    /// Returns the room the session left, if it changed rooms.
    pub fn join(&mut self, session: SessionId, slug: Slug) -> Option<Slug> {
        if self.membership.get(&session) == Some(&slug) {
            return None;
        }
        let previous = self.leave(session);
        self.rooms.entry(slug.clone()).or_default().insert(session);
        self.membership.insert(session, slug);
        previous
    }

    /// Remove `session` from whatever room holds it.
    pub fn leave(&mut self, session: SessionId) -> Option<Slug> {
        let slug = self.membership.remove(&session)?;
        if let Some(members) = self.rooms.get_mut(&slug) {
            members.remove(&session);
            if members.is_empty() {
                self.rooms.remove(&slug);
            }
        }
        Some(slug)
    }

    /// Broadcast targets: everyone in `slug` except `session`.
    pub fn members_excluding(&self, slug: &Slug, session: SessionId) -> Vec<SessionId> {
        self.rooms
            .get(slug)
            .map(|members| members.iter().copied().filter(|s| *s != session).collect())
            .unwrap_or_default()
    }

    pub fn members(&self, slug: &Slug) -> Vec<SessionId> {
        self.rooms
            .get(slug)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn room_of(&self, session: SessionId) -> Option<&Slug> {
        self.membership.get(&session)
    }

    pub fn is_member(&self, slug: &Slug, session: SessionId) -> bool {
        self.membership.get(&session) == Some(slug)
    }

    pub fn room_size(&self, slug: &Slug) -> usize {
        self.rooms.get(slug).map_or(0, HashSet::len)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Sessions currently in some room.
    pub fn session_count(&self) -> usize {
        self.membership.len()
    }
}
