//! Path builders for the mesh-road HTTP surface. The server mounts the
//! same shapes with axum path parameters.

use crate::ids::{PeerId, RoomId};

pub fn peers(room_id: &RoomId) -> String {
    format!("/rooms/{}/peers", room_id)
}

pub fn peer(room_id: &RoomId, peer_id: &PeerId) -> String {
    format!("/rooms/{}/peers/{}", room_id, peer_id)
}

pub fn heartbeat(room_id: &RoomId, peer_id: &PeerId) -> String {
    format!("/rooms/{}/peers/{}/heartbeat", room_id, peer_id)
}

pub fn presence(room_id: &RoomId) -> String {
    format!("/rooms/{}/presence", room_id)
}
