use std::collections::{BTreeSet, HashMap};

use mesh_protocol::{Identity, RoomId};
use thiserror::Error;

/// Room-management decision consumed by the registry. Rooms are owned,
/// created and scheduled elsewhere; this is the read-only view of them.
pub trait RoomDirectory: Send + Sync {
    fn lookup(&self, room_id: &RoomId) -> Option<RoomPolicy>;
    fn may_join(&self, identity: &Identity, room: &RoomPolicy) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    Public,
    /// Only the listed user ids may join or observe.
    Private(BTreeSet<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomPolicy {
    pub id: RoomId,
    pub capacity: usize,
    pub visibility: Visibility,
}

impl RoomPolicy {
    pub fn public(id: RoomId, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            visibility: Visibility::Public,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomSpecError {
    #[error("room entry '{0}' must look like name:capacity[:user|user]")]
    Malformed(String),
    #[error("invalid room id in '{entry}': {reason}")]
    InvalidId { entry: String, reason: String },
    #[error("invalid capacity in '{0}'")]
    InvalidCapacity(String),
}

/// Directory built from configuration.
///
/// When `open_capacity` is set, any well-formed room id that is not listed
/// explicitly is treated as a public room with that capacity.
#[derive(Debug, Default, Clone)]
pub struct StaticRoomDirectory {
    rooms: HashMap<RoomId, RoomPolicy>,
    open_capacity: Option<usize>,
}

impl StaticRoomDirectory {
    pub fn new(rooms: impl IntoIterator<Item = RoomPolicy>, open_capacity: Option<usize>) -> Self {
        Self {
            rooms: rooms.into_iter().map(|r| (r.id.clone(), r)).collect(),
            open_capacity,
        }
    }

    /// Parses `lobby:8,standup:4:alice|bob` style room lists.
    pub fn parse_spec(spec: &str) -> Result<Vec<RoomPolicy>, RoomSpecError> {
        spec.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(parse_entry)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

fn parse_entry(entry: &str) -> Result<RoomPolicy, RoomSpecError> {
    let mut parts = entry.splitn(3, ':');
    let (Some(name), Some(capacity)) = (parts.next(), parts.next()) else {
        return Err(RoomSpecError::Malformed(entry.to_string()));
    };
    let id = RoomId::parse(name).map_err(|err| RoomSpecError::InvalidId {
        entry: entry.to_string(),
        reason: err.to_string(),
    })?;
    let capacity: usize = capacity
        .parse()
        .ok()
        .filter(|c| *c > 0)
        .ok_or_else(|| RoomSpecError::InvalidCapacity(entry.to_string()))?;
    let visibility = match parts.next() {
        Some(members) => Visibility::Private(
            members
                .split('|')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        None => Visibility::Public,
    };
    Ok(RoomPolicy {
        id,
        capacity,
        visibility,
    })
}

impl RoomDirectory for StaticRoomDirectory {
    fn lookup(&self, room_id: &RoomId) -> Option<RoomPolicy> {
        self.rooms.get(room_id).cloned().or_else(|| {
            self.open_capacity
                .map(|capacity| RoomPolicy::public(room_id.clone(), capacity))
        })
    }

    fn may_join(&self, identity: &Identity, room: &RoomPolicy) -> bool {
        match &room.visibility {
            Visibility::Public => true,
            Visibility::Private(members) => members.contains(&identity.user_id),
        }
    }
}
