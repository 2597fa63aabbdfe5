use std::time::Duration;

use mesh_protocol::{PeerId, RoomId};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::lifecycle::ConnectionManager;
use crate::media::LocalMediaSession;
use crate::registry::RegistryApi;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub registry_leave: LeaveOutcome,
    pub connections_closed: usize,
    pub tracks_stopped: usize,
}

/// Unwinds a session in order: registry leave (best effort, bounded by
/// `leave_timeout`), close every connection, release local media, cancel
/// the presence and heartbeat tasks. The registry itself announces the
/// departure to the other peers. Everything after the leave runs no matter
/// how the leave went.
pub async fn teardown(
    registry: &dyn RegistryApi,
    room: &RoomId,
    local: &PeerId,
    leave_timeout: Duration,
    connections: &mut ConnectionManager,
    media: &LocalMediaSession,
    background: &CancellationToken,
) -> TeardownReport {
    let registry_leave = match timeout(leave_timeout, registry.leave(room, local)).await {
        Ok(Ok(())) => LeaveOutcome::Left,
        Ok(Err(err)) => {
            warn!(room = %room, peer = %local, error = %err, "registry leave failed");
            LeaveOutcome::Failed(err.to_string())
        }
        Err(_) => {
            warn!(room = %room, peer = %local, ?leave_timeout, "registry leave timed out");
            LeaveOutcome::TimedOut
        }
    };

    let connections_closed = connections.close_all();
    let tracks_stopped = media.release();
    background.cancel();

    let report = TeardownReport {
        registry_leave,
        connections_closed,
        tracks_stopped,
    };
    info!(room = %room, peer = %local, ?report, "session torn down");
    report
}
