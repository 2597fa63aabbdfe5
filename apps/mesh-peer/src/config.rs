use std::time::Duration;

use mesh_protocol::RoomId;

use crate::media::MediaConstraints;
use crate::presence::PresenceConfig;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room: RoomId,
    pub constraints: MediaConstraints,
    /// Silence on the push channel after which it is considered dead.
    pub ping_timeout: Duration,
    pub poll_interval: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// Bound on one presence subscribe attempt.
    pub request_timeout: Duration,
    /// How long the passive side of a pair waits for the inbound call, and
    /// how long an outbound call may stay unanswered.
    pub callee_timeout: Duration,
    pub resync_interval: Duration,
    pub heartbeat_interval: Duration,
    pub leave_timeout: Duration,
}

impl SessionConfig {
    pub fn new(room: RoomId) -> Self {
        Self {
            room,
            constraints: MediaConstraints::default(),
            ping_timeout: Duration::from_secs(75),
            poll_interval: Duration::from_secs(2),
            reconnect_min: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            callee_timeout: Duration::from_secs(12),
            resync_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            leave_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_callee_timeout(mut self, timeout: Duration) -> Self {
        self.callee_timeout = timeout;
        self
    }

    pub fn with_leave_timeout(mut self, timeout: Duration) -> Self {
        self.leave_timeout = timeout;
        self
    }

    pub fn presence(&self) -> PresenceConfig {
        PresenceConfig {
            ping_timeout: self.ping_timeout,
            poll_interval: self.poll_interval,
            reconnect_min: self.reconnect_min,
            reconnect_max: self.reconnect_max,
            request_timeout: self.request_timeout,
        }
    }
}
