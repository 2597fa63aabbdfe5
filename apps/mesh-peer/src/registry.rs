use async_trait::async_trait;
use mesh_protocol::{PeerId, PeerRecord, RoomId};

use tracing::info;

use crate::error::SessionError;

/// Client side of the room registry. Authentication is carried by the
/// implementation; every call acts as that identity.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    async fn join(&self, room: &RoomId, peer: &PeerId) -> Result<PeerRecord, SessionError>;

    /// Idempotent; leaving an absent peer succeeds.
    async fn leave(&self, room: &RoomId, peer: &PeerId) -> Result<(), SessionError>;

    /// `NotFound` means the registry no longer lists the peer.
    async fn heartbeat(&self, room: &RoomId, peer: &PeerId) -> Result<(), SessionError>;
}

/// Result of one liveness round against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// The registry had expired the peer and it joined again.
    Rejoined,
}

/// Refreshes the peer's liveness, joining again if the registry no longer
/// lists it.
pub async fn keep_alive(
    registry: &dyn RegistryApi,
    room: &RoomId,
    peer: &PeerId,
) -> Result<Liveness, SessionError> {
    match registry.heartbeat(room, peer).await {
        Ok(()) => Ok(Liveness::Alive),
        Err(SessionError::NotFound(_)) => {
            info!(room = %room, peer = %peer, "registry dropped this peer; re-joining");
            registry.join(room, peer).await?;
            Ok(Liveness::Rejoined)
        }
        Err(err) => Err(err),
    }
}
