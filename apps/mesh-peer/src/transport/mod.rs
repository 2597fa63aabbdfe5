//! Seam to the media transport that performs the actual ICE/SDP
//! negotiation. The session only places, answers and closes calls and
//! reacts to [`TransportEvent`]s.

pub mod loopback;

use std::fmt;
use std::sync::Arc;

use mesh_protocol::PeerId;
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::media::MediaStream;

pub type CallId = u64;

/// One negotiation attempt with a remote peer.
pub trait MediaCall: Send + Sync + fmt::Debug {
    fn id(&self) -> CallId;
    fn remote(&self) -> &PeerId;
    /// Accepts an inbound call, attaching the local stream.
    fn answer(&self, stream: MediaStream) -> Result<(), SessionError>;
    /// Idempotent.
    fn close(&self);
}

pub enum TransportEvent {
    IncomingCall(Arc<dyn MediaCall>),
    RemoteStream {
        call: CallId,
        peer: PeerId,
        stream: MediaStream,
    },
    CallClosed {
        call: CallId,
        peer: PeerId,
    },
    CallFailed {
        call: CallId,
        peer: PeerId,
        reason: String,
    },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::IncomingCall(call) => f
                .debug_struct("IncomingCall")
                .field("call", &call.id())
                .field("peer", call.remote())
                .finish(),
            TransportEvent::RemoteStream { call, peer, stream } => f
                .debug_struct("RemoteStream")
                .field("call", call)
                .field("peer", peer)
                .field("stream", &stream.id())
                .finish(),
            TransportEvent::CallClosed { call, peer } => f
                .debug_struct("CallClosed")
                .field("call", call)
                .field("peer", peer)
                .finish(),
            TransportEvent::CallFailed { call, peer, reason } => f
                .debug_struct("CallFailed")
                .field("call", call)
                .field("peer", peer)
                .field("reason", reason)
                .finish(),
        }
    }
}

pub trait MediaTransport: Send + Sync {
    /// Identifier the transport assigned to this client connection.
    fn local_peer_id(&self) -> PeerId;

    /// Starts a call; negotiation continues in the background and reports
    /// through the event stream.
    fn call(&self, remote: &PeerId, stream: MediaStream)
        -> Result<Arc<dyn MediaCall>, SessionError>;

    /// Takes the event stream. There is a single consumer; later calls fail.
    fn take_events(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, SessionError>;
}
