use serde::{Deserialize, Serialize};

use crate::ids::{PeerId, RoomId};

/// Externally verified identity attached to every registry call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

/// One present participant of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub user_id: String,
    pub display_name: String,
    /// Milliseconds since the unix epoch.
    pub joined_at: i64,
}

/// Incremental presence notification produced by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    PeerJoined(PeerRecord),
    PeerLeft(PeerId),
    Ping,
}

/// Frames pushed from mesh-road to a presence subscriber.
///
/// The first frame on every subscription is always `Snapshot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot {
        room_id: RoomId,
        peers: Vec<PeerRecord>,
    },
    PeerJoined {
        peer: PeerRecord,
    },
    PeerLeft {
        peer_id: PeerId,
    },
    Ping,
    Error {
        message: String,
    },
}

impl From<PresenceEvent> for ServerMessage {
    fn from(event: PresenceEvent) -> Self {
        match event {
            PresenceEvent::PeerJoined(peer) => ServerMessage::PeerJoined { peer },
            PresenceEvent::PeerLeft(peer_id) => ServerMessage::PeerLeft { peer_id },
            PresenceEvent::Ping => ServerMessage::Ping,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub room_id: RoomId,
    pub peer: PeerRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerListResponse {
    pub room_id: RoomId,
    pub peers: Vec<PeerRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    NotFound,
    InvalidArgument,
    RoomFull,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub rooms: usize,
    pub peers: usize,
    pub subscribers: usize,
}
