//! In-process transport: every endpoint of a [`LoopbackNetwork`] can call
//! every other one, and streams are exchanged by reference. Used by the
//! `simulate` command and by tests, with hooks to inject failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mesh_protocol::PeerId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{CallId, MediaCall, MediaTransport, TransportEvent};
use crate::error::SessionError;
use crate::media::MediaStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallPhase {
    Ringing,
    Established,
}

#[derive(Debug)]
struct CallRecord {
    caller: PeerId,
    callee: PeerId,
    caller_stream: MediaStream,
    phase: CallPhase,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<PeerId, mpsc::UnboundedSender<TransportEvent>>,
    calls: BTreeMap<CallId, CallRecord>,
    call_log: Vec<(PeerId, PeerId)>,
    /// Outbound calls that fail immediately, per caller.
    failing_calls: HashMap<PeerId, usize>,
    /// Outbound calls that never reach the callee, per caller.
    lost_calls: HashMap<PeerId, usize>,
    /// Answers that fail negotiation, per callee.
    failing_answers: HashMap<PeerId, usize>,
}

impl NetworkInner {
    fn deliver(&self, to: &PeerId, event: TransportEvent) {
        if let Some(sender) = self.endpoints.get(to) {
            let _ = sender.send(event);
        }
    }

    fn take_fault(faults: &mut HashMap<PeerId, usize>, peer: &PeerId) -> bool {
        match faults.get_mut(peer) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[derive(Default)]
pub struct LoopbackNetwork {
    inner: Mutex<NetworkInner>,
    next_call: AtomicU64,
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork").finish_non_exhaustive()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn endpoint(self: &Arc<Self>, peer: PeerId) -> LoopbackTransport {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.lock().endpoints.insert(peer.clone(), sender);
        LoopbackTransport {
            network: Arc::clone(self),
            local: peer,
            events: Mutex::new(Some(receiver)),
        }
    }

    /// The next `count` calls placed by `caller` fail synchronously.
    pub fn fail_next_calls(&self, caller: &PeerId, count: usize) {
        self.inner.lock().failing_calls.insert(caller.clone(), count);
    }

    /// The next `count` calls placed by `caller` are silently lost.
    pub fn lose_next_calls(&self, caller: &PeerId, count: usize) {
        self.inner.lock().lost_calls.insert(caller.clone(), count);
    }

    /// The next `count` answers by `callee` fail negotiation.
    pub fn fail_next_answers(&self, callee: &PeerId, count: usize) {
        self.inner.lock().failing_answers.insert(callee.clone(), count);
    }

    /// Every call ever placed, as (caller, callee).
    pub fn call_log(&self) -> Vec<(PeerId, PeerId)> {
        self.inner.lock().call_log.clone()
    }

    /// Established calls as (caller, callee).
    pub fn established(&self) -> Vec<(PeerId, PeerId)> {
        self.inner
            .lock()
            .calls
            .values()
            .filter(|c| c.phase == CallPhase::Established)
            .map(|c| (c.caller.clone(), c.callee.clone()))
            .collect()
    }

    /// Calls between the two peers in either direction that are not closed.
    pub fn open_calls_between(&self, a: &PeerId, b: &PeerId) -> usize {
        self.inner
            .lock()
            .calls
            .values()
            .filter(|c| (&c.caller == a && &c.callee == b) || (&c.caller == b && &c.callee == a))
            .count()
    }

    /// Removes the endpoint, closing every call it takes part in.
    pub fn disconnect(&self, peer: &PeerId) {
        let mut inner = self.inner.lock();
        inner.endpoints.remove(peer);
        let ids: Vec<CallId> = inner
            .calls
            .iter()
            .filter(|(_, c)| &c.caller == peer || &c.callee == peer)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(record) = inner.calls.remove(&id) {
                let other = if &record.caller == peer {
                    record.callee
                } else {
                    record.caller
                };
                inner.deliver(
                    &other,
                    TransportEvent::CallClosed {
                        call: id,
                        peer: peer.clone(),
                    },
                );
            }
        }
    }

    fn place_call(
        self: &Arc<Self>,
        caller: &PeerId,
        callee: &PeerId,
        stream: MediaStream,
    ) -> Result<Arc<dyn MediaCall>, SessionError> {
        let mut inner = self.inner.lock();
        inner.call_log.push((caller.clone(), callee.clone()));
        if NetworkInner::take_fault(&mut inner.failing_calls, caller) {
            return Err(SessionError::Transport {
                peer: callee.clone(),
                reason: "injected call failure".into(),
            });
        }
        if !inner.endpoints.contains_key(callee) {
            return Err(SessionError::Transport {
                peer: callee.clone(),
                reason: "peer unreachable".into(),
            });
        }

        let id = self.next_call.fetch_add(1, Ordering::Relaxed) + 1;
        inner.calls.insert(
            id,
            CallRecord {
                caller: caller.clone(),
                callee: callee.clone(),
                caller_stream: stream,
                phase: CallPhase::Ringing,
            },
        );
        let lost = NetworkInner::take_fault(&mut inner.lost_calls, caller);
        if lost {
            debug!(call = id, caller = %caller, callee = %callee, "loopback call lost");
        } else {
            let incoming: Arc<dyn MediaCall> = Arc::new(LoopbackCall {
                id,
                remote: caller.clone(),
                network: Arc::clone(self),
            });
            inner.deliver(callee, TransportEvent::IncomingCall(incoming));
        }
        Ok(Arc::new(LoopbackCall {
            id,
            remote: callee.clone(),
            network: Arc::clone(self),
        }))
    }

    fn answer(&self, id: CallId, remote: &PeerId, stream: MediaStream) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.calls.get(&id) else {
            return Err(SessionError::Transport {
                peer: remote.clone(),
                reason: format!("call {} no longer exists", id),
            });
        };
        let caller = record.caller.clone();
        let callee = record.callee.clone();

        if NetworkInner::take_fault(&mut inner.failing_answers, &callee) {
            inner.calls.remove(&id);
            let reason = "injected negotiation failure".to_string();
            inner.deliver(
                &caller,
                TransportEvent::CallFailed {
                    call: id,
                    peer: callee.clone(),
                    reason: reason.clone(),
                },
            );
            inner.deliver(
                &callee,
                TransportEvent::CallFailed {
                    call: id,
                    peer: caller,
                    reason,
                },
            );
            return Ok(());
        }

        let caller_stream = match inner.calls.get_mut(&id) {
            Some(record) => {
                record.phase = CallPhase::Established;
                record.caller_stream.clone()
            }
            None => return Ok(()),
        };
        inner.deliver(
            &callee,
            TransportEvent::RemoteStream {
                call: id,
                peer: caller.clone(),
                stream: caller_stream,
            },
        );
        inner.deliver(
            &caller,
            TransportEvent::RemoteStream {
                call: id,
                peer: callee,
                stream,
            },
        );
        Ok(())
    }

    fn close(&self, id: CallId, closing: &PeerId) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.calls.remove(&id) {
            let other = if &record.caller == closing {
                record.callee
            } else {
                record.caller
            };
            inner.deliver(
                &other,
                TransportEvent::CallClosed {
                    call: id,
                    peer: closing.clone(),
                },
            );
        }
    }
}

#[derive(Debug)]
struct LoopbackCall {
    id: CallId,
    remote: PeerId,
    network: Arc<LoopbackNetwork>,
}

impl MediaCall for LoopbackCall {
    fn id(&self) -> CallId {
        self.id
    }

    fn remote(&self) -> &PeerId {
        &self.remote
    }

    fn answer(&self, stream: MediaStream) -> Result<(), SessionError> {
        self.network.answer(self.id, &self.remote, stream)
    }

    fn close(&self) {
        // The closing side is whichever end is not `remote`.
        let closing = {
            let inner = self.network.inner.lock();
            inner.calls.get(&self.id).map(|record| {
                if record.caller == self.remote {
                    record.callee.clone()
                } else {
                    record.caller.clone()
                }
            })
        };
        if let Some(closing) = closing {
            self.network.close(self.id, &closing);
        }
    }
}

pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    local: PeerId,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl LoopbackTransport {
    pub fn network(&self) -> &Arc<LoopbackNetwork> {
        &self.network
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.network.disconnect(&self.local);
    }
}

impl MediaTransport for LoopbackTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local.clone()
    }

    fn call(
        &self,
        remote: &PeerId,
        stream: MediaStream,
    ) -> Result<Arc<dyn MediaCall>, SessionError> {
        self.network.place_call(&self.local, remote, stream)
    }

    fn take_events(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, SessionError> {
        self.events
            .lock()
            .take()
            .ok_or_else(|| SessionError::Protocol("transport events already taken".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaStream;

    fn id(raw: &str) -> PeerId {
        PeerId::parse(raw).unwrap()
    }

    fn stream(label: &str) -> MediaStream {
        MediaStream::new(label, Vec::new())
    }

    #[test_timeout::tokio_timeout_test]
    async fn call_answer_exchanges_streams() {
        let network = LoopbackNetwork::new();
        let a = network.endpoint(id("aaa"));
        let b = network.endpoint(id("bbb"));
        let mut a_events = a.take_events().unwrap();
        let mut b_events = b.take_events().unwrap();
        assert!(a.take_events().is_err());

        let outbound = a.call(&id("bbb"), stream("a-cam")).unwrap();
        let inbound = match b_events.recv().await {
            Some(TransportEvent::IncomingCall(call)) => call,
            other => panic!("expected incoming call, got {:?}", other),
        };
        assert_eq!(inbound.remote(), &id("aaa"));
        assert_eq!(inbound.id(), outbound.id());
        inbound.answer(stream("b-cam")).unwrap();

        match b_events.recv().await {
            Some(TransportEvent::RemoteStream { stream, .. }) => assert_eq!(stream.id(), "a-cam"),
            other => panic!("unexpected {:?}", other),
        }
        match a_events.recv().await {
            Some(TransportEvent::RemoteStream { stream, peer, .. }) => {
                assert_eq!(stream.id(), "b-cam");
                assert_eq!(peer, id("bbb"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(network.established(), vec![(id("aaa"), id("bbb"))]);

        outbound.close();
        match b_events.recv().await {
            Some(TransportEvent::CallClosed { peer, .. }) => assert_eq!(peer, id("aaa")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(network.open_calls_between(&id("aaa"), &id("bbb")), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn injected_faults() {
        let network = LoopbackNetwork::new();
        let a = network.endpoint(id("aaa"));
        let b = network.endpoint(id("bbb"));
        let mut a_events = a.take_events().unwrap();
        let mut b_events = b.take_events().unwrap();

        network.fail_next_calls(&id("aaa"), 1);
        assert!(matches!(
            a.call(&id("bbb"), stream("a")),
            Err(SessionError::Transport { .. })
        ));

        network.fail_next_answers(&id("bbb"), 1);
        a.call(&id("bbb"), stream("a")).unwrap();
        let Some(TransportEvent::IncomingCall(call)) = b_events.recv().await else {
            panic!("expected incoming call");
        };
        call.answer(stream("b")).unwrap();
        assert!(matches!(
            a_events.recv().await,
            Some(TransportEvent::CallFailed { .. })
        ));
        assert!(matches!(
            b_events.recv().await,
            Some(TransportEvent::CallFailed { .. })
        ));
        assert_eq!(network.call_log().len(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropping_an_endpoint_closes_its_calls() {
        let network = LoopbackNetwork::new();
        let a = network.endpoint(id("aaa"));
        let b = network.endpoint(id("bbb"));
        let mut a_events = a.take_events().unwrap();
        a.call(&id("bbb"), stream("a")).unwrap();
        drop(b);
        assert!(matches!(
            a_events.recv().await,
            Some(TransportEvent::CallClosed { .. })
        ));
        assert!(matches!(
            a.call(&id("bbb"), stream("a")),
            Err(SessionError::Transport { .. })
        ));
    }
}
