//! Shared protocol definitions for mesh-road ↔ peer communication.
//! Keeping this in a dedicated crate lets the server and the peer core
//! agree on identifiers, presence frames and HTTP bodies without either
//! side pulling in the other's runtime.

mod ids;
mod messages;
pub mod routes;

pub use ids::{IdError, PeerId, RoomId, MAX_ID_LEN};
pub use messages::{
    ErrorBody, ErrorCode, HealthStatus, Identity, JoinRequest, JoinResponse, PeerListResponse,
    PeerRecord, PresenceEvent, ServerMessage,
};
