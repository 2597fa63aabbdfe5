use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

use crate::registry::RoomRegistry;

/// Periodically pushes `Ping` to every presence subscriber so clients can
/// tell a quiet room from a dead channel.
pub fn spawn_keepalive(registry: Arc<RoomRegistry>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            registry.broadcast_ping();
        }
    })
}

/// Removes peers whose heartbeats stopped, e.g. a client that crashed
/// without leaving.
pub fn spawn_liveness_monitor(
    registry: Arc<RoomRegistry>,
    sweep_every: Duration,
    liveness_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(sweep_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = registry.expire_stale(liveness_timeout, Instant::now());
            if !expired.is_empty() {
                debug!(count = expired.len(), "liveness sweep removed stale peers");
            }
        }
    })
}
