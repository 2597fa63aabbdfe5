use std::net::SocketAddr;
use std::time::Duration;

use crate::auth::TokenVerifier;
use crate::rooms::{RoomPolicy, StaticRoomDirectory};

#[derive(Debug, Clone)]
pub enum AuthMode {
    Jwt {
        secret: String,
        issuer: Option<String>,
        audience: Option<String>,
    },
    /// Tokens are taken at face value. Development only.
    Insecure,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub auth: AuthMode,
    pub rooms: Vec<RoomPolicy>,
    /// Capacity for rooms that are not listed; `None` rejects them.
    pub open_room_capacity: Option<usize>,
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
    pub sweep_interval: Duration,
    pub subscriber_buffer: usize,
    pub send_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn verifier(&self) -> TokenVerifier {
        match &self.auth {
            AuthMode::Jwt {
                secret,
                issuer,
                audience,
            } => TokenVerifier::hs256(secret.as_bytes(), issuer.as_deref(), audience.as_deref()),
            AuthMode::Insecure => TokenVerifier::Insecure,
        }
    }

    pub fn directory(&self) -> StaticRoomDirectory {
        StaticRoomDirectory::new(self.rooms.clone(), self.open_room_capacity)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            auth: AuthMode::Insecure,
            rooms: Vec::new(),
            open_room_capacity: Some(16),
            ping_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(45),
            sweep_interval: Duration::from_secs(5),
            subscriber_buffer: 64,
            send_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}
