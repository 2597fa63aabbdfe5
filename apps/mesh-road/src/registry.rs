use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mesh_protocol::{IdError, Identity, PeerId, PeerRecord, PresenceEvent, RoomId, ServerMessage};
use metrics::{counter, decrement_gauge, increment_gauge};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::rooms::{RoomDirectory, RoomPolicy};

pub type SubscriberId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("room {0} not found")]
    NotFound(RoomId),
    #[error("peer {0} is not present")]
    PeerNotFound(PeerId),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("room {room_id} is at capacity ({capacity})")]
    RoomFull { room_id: RoomId, capacity: usize },
}

impl From<IdError> for RegistryError {
    fn from(err: IdError) -> Self {
        RegistryError::InvalidArgument(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub rooms: usize,
    pub peers: usize,
    pub subscribers: usize,
}

struct PeerEntry {
    record: PeerRecord,
    last_seen: Instant,
}

struct Subscriber {
    user_id: String,
    sender: mpsc::Sender<ServerMessage>,
}

#[derive(Default)]
struct RoomInner {
    peers: BTreeMap<PeerId, PeerEntry>,
    subscribers: HashMap<SubscriberId, Subscriber>,
    /// Set once the room has been dropped from the map. A retired room is
    /// never mutated again; callers that raced with retirement start over.
    retired: bool,
}

impl RoomInner {
    fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.values().map(|entry| entry.record.clone()).collect()
    }

    fn is_idle(&self) -> bool {
        self.peers.is_empty() && self.subscribers.is_empty()
    }

    /// Fans an event out to every subscriber without waiting on any of them.
    /// Subscribers whose buffer is full or whose receiver is gone are removed;
    /// their stream ends and they resubscribe for a fresh snapshot.
    fn publish(&mut self, room_id: &RoomId, event: PresenceEvent) {
        let message = ServerMessage::from(event);
        let mut evicted = Vec::new();
        for (id, subscriber) in self.subscribers.iter() {
            match subscriber.sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        room = %room_id,
                        subscriber = id,
                        user = %subscriber.user_id,
                        "presence subscriber stalled; dropping from fan-out"
                    );
                    counter!("mesh_road_subscribers_dropped_total", 1, "reason" => "stalled");
                    evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(room = %room_id, subscriber = id, "presence subscriber closed");
                    evicted.push(*id);
                }
            }
        }
        for id in evicted {
            if self.subscribers.remove(&id).is_some() {
                decrement_gauge!("mesh_road_subscribers", 1.0);
            }
        }
    }
}

struct RoomState {
    policy: RoomPolicy,
    inner: Mutex<RoomInner>,
}

impl RoomState {
    fn new(policy: RoomPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(RoomInner::default()),
        }
    }
}

type RoomMap = DashMap<RoomId, Arc<RoomState>>;

/// Drops an idle room from the map. Called with the room lock held, so no
/// join or subscribe can slip in between the check and the removal.
fn retire_if_idle(rooms: &RoomMap, room: &Arc<RoomState>, inner: &mut RoomInner) {
    if inner.retired || !inner.is_idle() {
        return;
    }
    inner.retired = true;
    rooms.remove_if(&room.policy.id, |_, current| Arc::ptr_eq(current, room));
    debug!(room = %room.policy.id, "idle room released");
}

/// Live presence stream for one room.
///
/// The first message is always a `Snapshot`. Dropping the subscription
/// removes it from fan-out and nothing else; registry membership is only
/// changed by an explicit leave or the liveness sweep.
pub struct Subscription {
    id: SubscriberId,
    room: Arc<RoomState>,
    rooms: Arc<RoomMap>,
    receiver: mpsc::Receiver<ServerMessage>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room.policy.id
    }

    /// Returns `None` once the registry dropped this subscriber from fan-out.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut inner = self.room.inner.lock();
        if inner.subscribers.remove(&self.id).is_some() {
            decrement_gauge!("mesh_road_subscribers", 1.0);
            debug!(room = %self.room.policy.id, subscriber = self.id, "presence subscriber removed");
        }
        retire_if_idle(&self.rooms, &self.room, &mut inner);
    }
}

/// Authoritative per-room set of present peers.
///
/// Each room is guarded by its own mutex, so every join, leave and
/// subscribe for a room is serialized and events reach each subscriber in
/// mutation order. Rooms never share state.
///
/// Only join and subscribe materialize a room; it is released again once it
/// has neither peers nor subscribers. Reads and no-op writes against a room
/// the registry does not hold leave the map untouched.
pub struct RoomRegistry {
    rooms: Arc<RoomMap>,
    directory: Arc<dyn RoomDirectory>,
    subscriber_buffer: usize,
    next_subscriber: AtomicU64,
}

impl RoomRegistry {
    pub fn new(directory: Arc<dyn RoomDirectory>, subscriber_buffer: usize) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            directory,
            subscriber_buffer: subscriber_buffer.max(1),
            next_subscriber: AtomicU64::new(1),
        }
    }

    fn policy(&self, room_id: &RoomId) -> Result<RoomPolicy, RegistryError> {
        self.directory
            .lookup(room_id)
            .ok_or_else(|| RegistryError::NotFound(room_id.clone()))
    }

    fn authorize(&self, room_id: &RoomId, identity: &Identity) -> Result<RoomPolicy, RegistryError> {
        let policy = self.policy(room_id)?;
        if !self.directory.may_join(identity, &policy) {
            return Err(RegistryError::Unauthorized(format!(
                "user {} may not join room {}",
                identity.user_id, room_id
            )));
        }
        Ok(policy)
    }

    fn existing(&self, room_id: &RoomId) -> Option<Arc<RoomState>> {
        self.rooms.get(room_id).map(|room| room.value().clone())
    }

    // The map guard is released before the caller takes the room lock.
    fn materialize(&self, policy: &RoomPolicy) -> Arc<RoomState> {
        self.rooms
            .entry(policy.id.clone())
            .or_insert_with(|| Arc::new(RoomState::new(policy.clone())))
            .value()
            .clone()
    }

    /// Upserts the peer record and emits `PeerJoined`. Re-joining with the
    /// same peer id replaces the record instead of adding a second one.
    pub fn join(
        &self,
        room_id: &RoomId,
        peer_id: PeerId,
        identity: &Identity,
    ) -> Result<PeerRecord, RegistryError> {
        let policy = self.authorize(room_id, identity)?;
        loop {
            let room = self.materialize(&policy);
            let mut inner = room.inner.lock();
            if inner.retired {
                continue;
            }
            return Self::join_locked(&room, &mut inner, room_id, peer_id, identity);
        }
    }

    fn join_locked(
        room: &RoomState,
        inner: &mut RoomInner,
        room_id: &RoomId,
        peer_id: PeerId,
        identity: &Identity,
    ) -> Result<PeerRecord, RegistryError> {
        let joined_at = match inner.peers.get(&peer_id) {
            Some(existing) if existing.record.user_id != identity.user_id => {
                return Err(RegistryError::Unauthorized(format!(
                    "peer id {} belongs to another user",
                    peer_id
                )));
            }
            Some(existing) => existing.record.joined_at,
            None => {
                if inner.peers.len() >= room.policy.capacity {
                    return Err(RegistryError::RoomFull {
                        room_id: room_id.clone(),
                        capacity: room.policy.capacity,
                    });
                }
                chrono::Utc::now().timestamp_millis()
            }
        };

        let record = PeerRecord {
            peer_id: peer_id.clone(),
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            joined_at,
        };
        let replaced = inner
            .peers
            .insert(
                peer_id.clone(),
                PeerEntry {
                    record: record.clone(),
                    last_seen: Instant::now(),
                },
            )
            .is_some();
        inner.publish(room_id, PresenceEvent::PeerJoined(record.clone()));

        counter!("mesh_road_joins_total", 1);
        info!(
            room = %room_id,
            peer = %peer_id,
            user = %identity.user_id,
            replaced,
            "peer joined"
        );
        Ok(record)
    }

    /// Removes the peer and emits `PeerLeft`. Leaving an absent peer is a
    /// no-op and emits nothing; the return value says whether a record was
    /// removed.
    pub fn leave(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        identity: &Identity,
    ) -> Result<bool, RegistryError> {
        self.policy(room_id)?;
        let Some(room) = self.existing(room_id) else {
            debug!(room = %room_id, peer = %peer_id, "leave for absent peer ignored");
            return Ok(false);
        };
        let mut inner = room.inner.lock();
        match inner.peers.get(peer_id) {
            None => {
                debug!(room = %room_id, peer = %peer_id, "leave for absent peer ignored");
                return Ok(false);
            }
            Some(entry) if entry.record.user_id != identity.user_id => {
                return Err(RegistryError::Unauthorized(format!(
                    "peer id {} belongs to another user",
                    peer_id
                )));
            }
            Some(_) => {}
        }
        inner.peers.remove(peer_id);
        inner.publish(room_id, PresenceEvent::PeerLeft(peer_id.clone()));
        retire_if_idle(&self.rooms, &room, &mut inner);
        drop(inner);

        counter!("mesh_road_leaves_total", 1, "reason" => "explicit");
        info!(room = %room_id, peer = %peer_id, "peer left");
        Ok(true)
    }

    /// Consistent snapshot ordered by peer id.
    pub fn list_peers(
        &self,
        room_id: &RoomId,
        identity: &Identity,
    ) -> Result<Vec<PeerRecord>, RegistryError> {
        self.authorize(room_id, identity)?;
        Ok(self
            .existing(room_id)
            .map(|room| room.inner.lock().snapshot())
            .unwrap_or_default())
    }

    /// Refreshes the liveness deadline of a present peer.
    pub fn heartbeat(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        identity: &Identity,
    ) -> Result<(), RegistryError> {
        self.policy(room_id)?;
        let room = self
            .existing(room_id)
            .ok_or_else(|| RegistryError::PeerNotFound(peer_id.clone()))?;
        let mut inner = room.inner.lock();
        match inner.peers.get_mut(peer_id) {
            Some(entry) if entry.record.user_id == identity.user_id => {
                entry.last_seen = Instant::now();
                Ok(())
            }
            Some(_) => Err(RegistryError::Unauthorized(format!(
                "peer id {} belongs to another user",
                peer_id
            ))),
            None => Err(RegistryError::PeerNotFound(peer_id.clone())),
        }
    }

    /// Opens a presence stream. The snapshot is queued and the subscriber
    /// registered under the same lock, so no event can fall between them.
    pub fn subscribe(
        &self,
        room_id: &RoomId,
        identity: &Identity,
    ) -> Result<Subscription, RegistryError> {
        let policy = self.authorize(room_id, identity)?;
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.subscriber_buffer);
        let room = loop {
            let room = self.materialize(&policy);
            let mut inner = room.inner.lock();
            if inner.retired {
                continue;
            }
            let snapshot = ServerMessage::Snapshot {
                room_id: room_id.clone(),
                peers: inner.snapshot(),
            };
            // Fresh channel with capacity >= 1, the first send cannot fail.
            let _ = sender.try_send(snapshot);
            inner.subscribers.insert(
                id,
                Subscriber {
                    user_id: identity.user_id.clone(),
                    sender,
                },
            );
            drop(inner);
            break room;
        };
        increment_gauge!("mesh_road_subscribers", 1.0);
        debug!(room = %room_id, subscriber = id, user = %identity.user_id, "presence subscriber added");
        Ok(Subscription {
            id,
            room,
            rooms: self.rooms.clone(),
            receiver,
        })
    }

    /// Sends a keepalive `Ping` to every subscriber of every room.
    pub fn broadcast_ping(&self) {
        for room in self.rooms_snapshot() {
            let mut inner = room.inner.lock();
            if !inner.subscribers.is_empty() {
                inner.publish(&room.policy.id, PresenceEvent::Ping);
            }
        }
    }

    /// Removes peers that have not joined or sent a heartbeat within
    /// `timeout` of `now`, emitting `PeerLeft` for each. Rooms left idle,
    /// including those whose last subscriber was evicted, are released.
    pub fn expire_stale(&self, timeout: Duration, now: Instant) -> Vec<(RoomId, PeerId)> {
        let mut expired = Vec::new();
        for room in self.rooms_snapshot() {
            let mut inner = room.inner.lock();
            let stale: Vec<PeerId> = inner
                .peers
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) > timeout)
                .map(|(peer_id, _)| peer_id.clone())
                .collect();
            for peer_id in stale {
                inner.peers.remove(&peer_id);
                inner.publish(&room.policy.id, PresenceEvent::PeerLeft(peer_id.clone()));
                counter!("mesh_road_leaves_total", 1, "reason" => "liveness");
                info!(
                    room = %room.policy.id,
                    peer = %peer_id,
                    "removing stale peer (heartbeat timeout)"
                );
                expired.push((room.policy.id.clone(), peer_id));
            }
            retire_if_idle(&self.rooms, &room, &mut inner);
        }
        expired
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for room in self.rooms_snapshot() {
            let inner = room.inner.lock();
            stats.rooms += 1;
            stats.peers += inner.peers.len();
            stats.subscribers += inner.subscribers.len();
        }
        stats
    }

    // Clone the room handles out so no DashMap guard is held while a room
    // mutex is taken.
    fn rooms_snapshot(&self) -> Vec<Arc<RoomState>> {
        self.rooms.iter().map(|entry| entry.value().clone()).collect()
    }
}
