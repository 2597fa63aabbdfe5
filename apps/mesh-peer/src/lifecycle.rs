use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mesh_protocol::PeerId;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::media::MediaStream;
use crate::transport::{CallId, MediaCall, MediaTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Initiating,
    Negotiating,
    Connected,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn is_live(self) -> bool {
        !matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }

    fn can_move_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed | Errored, _) => false,
            (_, Errored) => true,
            (Idle, Initiating | Negotiating) => true,
            (Initiating, Negotiating) => true,
            (Negotiating, Connected) => true,
            (_, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Initiating => "initiating",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
            ConnectionState::Errored => "errored",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Local,
    RemoteLeft,
    TransportClosed,
    Teardown,
}

/// The local view of the connection to one remote peer.
#[derive(Debug)]
pub struct ConnectionHandle {
    peer: PeerId,
    direction: Direction,
    state: ConnectionState,
    call: Option<Arc<dyn MediaCall>>,
    remote_stream: Option<MediaStream>,
    since: Instant,
}

impl ConnectionHandle {
    fn new(peer: PeerId, direction: Direction) -> Self {
        Self {
            peer,
            direction,
            state: ConnectionState::Idle,
            call: None,
            remote_stream: None,
            since: Instant::now(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn call_id(&self) -> Option<CallId> {
        self.call.as_ref().map(|call| call.id())
    }

    fn advance(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_move_to(next) {
            warn!(
                peer = %self.peer,
                from = %self.state,
                to = %next,
                "ignoring invalid connection transition"
            );
            return false;
        }
        debug!(peer = %self.peer, from = %self.state, to = %next, "connection transition");
        self.state = next;
        self.since = Instant::now();
        if !next.is_live() {
            self.remote_stream = None;
            if let Some(call) = self.call.take() {
                call.close();
            }
        }
        true
    }
}

/// Owns every connection handle of the local participant and enforces
/// that at most one live handle exists per remote peer. Terminal handles
/// are dropped immediately, which frees the peer id for a fresh attempt.
#[derive(Debug)]
pub struct ConnectionManager {
    local: PeerId,
    handles: BTreeMap<PeerId, ConnectionHandle>,
}

impl ConnectionManager {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            handles: BTreeMap::new(),
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn has_live(&self, peer: &PeerId) -> bool {
        self.handles.contains_key(peer)
    }

    pub fn state(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.handles.get(peer).map(ConnectionHandle::state)
    }

    pub fn call_id(&self, peer: &PeerId) -> Option<CallId> {
        self.handles.get(peer).and_then(ConnectionHandle::call_id)
    }

    pub fn direction(&self, peer: &PeerId) -> Option<Direction> {
        self.handles.get(peer).map(ConnectionHandle::direction)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Places an outbound call to `peer`.
    pub fn connect(
        &mut self,
        transport: &dyn MediaTransport,
        peer: &PeerId,
        stream: MediaStream,
    ) -> Result<(), SessionError> {
        if self.handles.contains_key(peer) {
            return Err(SessionError::DuplicateConnection(peer.clone()));
        }
        let mut handle = ConnectionHandle::new(peer.clone(), Direction::Outbound);
        handle.advance(ConnectionState::Initiating);
        match transport.call(peer, stream) {
            Ok(call) => {
                handle.call = Some(call);
                handle.advance(ConnectionState::Negotiating);
                info!(peer = %peer, "placing call");
                self.handles.insert(peer.clone(), handle);
                Ok(())
            }
            Err(err) => {
                handle.advance(ConnectionState::Errored);
                Err(err)
            }
        }
    }

    /// Answers an inbound call, or closes it if a live handle for the
    /// caller already exists.
    pub fn accept(
        &mut self,
        call: Arc<dyn MediaCall>,
        stream: MediaStream,
    ) -> Result<(), SessionError> {
        let peer = call.remote().clone();
        if self.handles.contains_key(&peer) {
            call.close();
            return Err(SessionError::DuplicateConnection(peer));
        }
        let mut handle = ConnectionHandle::new(peer.clone(), Direction::Inbound);
        match call.answer(stream) {
            Ok(()) => {
                handle.call = Some(call);
                handle.advance(ConnectionState::Negotiating);
                info!(peer = %peer, "answered call");
                self.handles.insert(peer, handle);
                Ok(())
            }
            Err(err) => {
                call.close();
                handle.advance(ConnectionState::Errored);
                Err(err)
            }
        }
    }

    /// Looks up the live handle for `peer` if it still owns `call`; events
    /// from superseded calls are ignored.
    fn current(&mut self, peer: &PeerId, call: CallId) -> Option<&mut ConnectionHandle> {
        match self.handles.get_mut(peer) {
            Some(handle) if handle.call_id() == Some(call) => Some(handle),
            Some(_) => {
                debug!(peer = %peer, call, "ignoring event for superseded call");
                None
            }
            None => None,
        }
    }

    fn finish(&mut self, peer: &PeerId, next: ConnectionState) -> bool {
        let Some(mut handle) = self.handles.remove(peer) else {
            return false;
        };
        handle.advance(next)
    }

    pub fn on_remote_stream(&mut self, peer: &PeerId, call: CallId, stream: MediaStream) -> bool {
        let Some(handle) = self.current(peer, call) else {
            return false;
        };
        if handle.state != ConnectionState::Negotiating {
            return false;
        }
        handle.remote_stream = Some(stream);
        let advanced = handle.advance(ConnectionState::Connected);
        if advanced {
            info!(peer = %peer, "connected");
        }
        advanced
    }

    pub fn on_call_closed(&mut self, peer: &PeerId, call: CallId) -> bool {
        if self.current(peer, call).is_none() {
            return false;
        }
        info!(peer = %peer, "call closed by transport");
        self.finish(peer, ConnectionState::Closed)
    }

    /// Moves the handle to `Errored` and returns the transport error.
    pub fn on_call_failed(
        &mut self,
        peer: &PeerId,
        call: CallId,
        reason: String,
    ) -> Option<SessionError> {
        self.current(peer, call)?;
        self.finish(peer, ConnectionState::Errored);
        Some(SessionError::Transport {
            peer: peer.clone(),
            reason,
        })
    }

    pub fn close(&mut self, peer: &PeerId, reason: CloseReason) -> bool {
        let closed = self.finish(peer, ConnectionState::Closed);
        if closed {
            info!(peer = %peer, ?reason, "connection closed");
        }
        closed
    }

    /// Closes every handle regardless of state; returns how many there were.
    pub fn close_all(&mut self) -> usize {
        let peers: Vec<PeerId> = self.handles.keys().cloned().collect();
        peers
            .iter()
            .filter(|peer| self.close(peer, CloseReason::Teardown))
            .count()
    }

    /// Errors out handles stuck negotiating for longer than `limit`.
    pub fn expire_negotiations(&mut self, now: Instant, limit: Duration) -> Vec<PeerId> {
        let stuck: Vec<PeerId> = self
            .handles
            .values()
            .filter(|h| {
                matches!(
                    h.state,
                    ConnectionState::Initiating | ConnectionState::Negotiating
                ) && now.saturating_duration_since(h.since) >= limit
            })
            .map(|h| h.peer.clone())
            .collect();
        for peer in &stuck {
            warn!(peer = %peer, ?limit, "negotiation timed out");
            self.finish(peer, ConnectionState::Errored);
        }
        stuck
    }

    pub fn next_negotiation_deadline(&self, limit: Duration) -> Option<Instant> {
        self.handles
            .values()
            .filter(|h| {
                matches!(
                    h.state,
                    ConnectionState::Initiating | ConnectionState::Negotiating
                )
            })
            .map(|h| h.since + limit)
            .min()
    }

    pub fn active_participants(&self) -> BTreeSet<PeerId> {
        self.handles
            .values()
            .filter(|h| h.state == ConnectionState::Connected)
            .map(|h| h.peer.clone())
            .collect()
    }

    pub fn remote_streams(&self) -> BTreeMap<PeerId, MediaStream> {
        self.handles
            .values()
            .filter_map(|h| h.remote_stream.clone().map(|s| (h.peer.clone(), s)))
            .collect()
    }

    pub fn states(&self) -> BTreeMap<PeerId, ConnectionState> {
        self.handles
            .iter()
            .map(|(peer, h)| (peer.clone(), h.state))
            .collect()
    }
}
