use mesh_protocol::PeerId;

/// Whether the local side places the call to `remote`.
///
/// The lesser id (byte-wise lexicographic order) dials and the other side
/// waits. Both peers evaluate the same pair to opposite answers, so at most
/// one of them ever calls.
pub fn should_initiate(local: &PeerId, remote: &PeerId) -> bool {
    local < remote
}
