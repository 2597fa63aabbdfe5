use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use mesh_protocol::{PeerId, PeerRecord, RoomId};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::lifecycle::{CloseReason, ConnectionManager, ConnectionState};
use crate::media::{LocalMediaSession, MediaDevices, MediaStream};
use crate::presence::{spawn_presence, ChannelMode, PresenceBackend, PresenceUpdate};
use crate::reconciler::Reconciler;
use crate::registry::{keep_alive, RegistryApi};
use crate::teardown::{teardown, TeardownReport};
use crate::tiebreak::should_initiate;
use crate::transport::{MediaTransport, TransportEvent};

/// External collaborators of a session.
#[derive(Clone)]
pub struct SessionDeps {
    pub registry: Arc<dyn RegistryApi>,
    pub presence: Arc<dyn PresenceBackend>,
    pub transport: Arc<dyn MediaTransport>,
    pub devices: Arc<dyn MediaDevices>,
}

/// Read-only state for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub local: PeerId,
    pub presence: ChannelMode,
    pub known_peers: BTreeSet<PeerId>,
    pub connections: BTreeMap<PeerId, ConnectionState>,
    pub active_participants: BTreeSet<PeerId>,
    pub remote_streams: BTreeMap<PeerId, MediaStream>,
    pub ended: bool,
}

impl SessionView {
    fn new(local: PeerId) -> Self {
        Self {
            local,
            presence: ChannelMode::Connecting,
            known_peers: BTreeSet::new(),
            connections: BTreeMap::new(),
            active_participants: BTreeSet::new(),
            remote_streams: BTreeMap::new(),
            ended: false,
        }
    }
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub report: TeardownReport,
    /// Set when the session ended on its own because of a fatal error.
    pub error: Option<SessionError>,
}

pub struct MeshSession;

impl MeshSession {
    pub async fn start(
        config: SessionConfig,
        deps: SessionDeps,
    ) -> Result<SessionHandle, SessionError> {
        Self::start_with_cancel(config, deps, &CancellationToken::new()).await
    }

    /// Acquires local media, joins the room and starts the session loop.
    ///
    /// Cancelling `cancel` aborts a pending media acquisition and, once
    /// started, tears the session down as `leave` would.
    pub async fn start_with_cancel(
        config: SessionConfig,
        deps: SessionDeps,
        cancel: &CancellationToken,
    ) -> Result<SessionHandle, SessionError> {
        let local = deps.transport.local_peer_id();
        let media = Arc::new(deps.devices.acquire(config.constraints, cancel).await?);

        let events = match deps.transport.take_events() {
            Ok(events) => events,
            Err(err) => {
                media.release();
                return Err(err);
            }
        };
        let record = match deps.registry.join(&config.room, &local).await {
            Ok(record) => record,
            Err(err) => {
                warn!(room = %config.room, peer = %local, error = %err, "join failed");
                media.release();
                return Err(err);
            }
        };
        info!(room = %config.room, peer = %local, user = %record.user_id, "joined room");

        let shutdown = cancel.child_token();
        let background = CancellationToken::new();
        let heartbeat = background.child_token();
        let (presence, _) = spawn_presence(
            deps.presence.clone(),
            config.room.clone(),
            config.presence(),
            background.clone(),
        );
        spawn_heartbeat(
            deps.registry.clone(),
            config.room.clone(),
            local.clone(),
            config.heartbeat_interval,
            heartbeat.clone(),
        );

        let (view_tx, view_rx) = watch::channel(SessionView::new(local.clone()));
        let session = SessionLoop {
            reconciler: Reconciler::new(local.clone()),
            connections: ConnectionManager::new(local.clone()),
            local: local.clone(),
            registry: deps.registry,
            transport: deps.transport,
            media: media.clone(),
            present: Vec::new(),
            passive_waits: BTreeMap::new(),
            presence_mode: ChannelMode::Connecting,
            view_tx,
            shutdown: shutdown.clone(),
            heartbeat,
            background,
            config,
        };
        let task = tokio::spawn(session.run(presence, events));

        Ok(SessionHandle {
            local,
            view: view_rx,
            media,
            shutdown,
            task: Some(task),
        })
    }
}

/// Owner-side handle of a running session. Dropping it tears the session
/// down in the background.
pub struct SessionHandle {
    local: PeerId,
    view: watch::Receiver<SessionView>,
    media: Arc<LocalMediaSession>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<SessionOutcome>>,
}

impl SessionHandle {
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local
    }

    pub fn view(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn snapshot(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn active_participants(&self) -> BTreeSet<PeerId> {
        self.view.borrow().active_participants.clone()
    }

    pub fn remote_streams(&self) -> BTreeMap<PeerId, MediaStream> {
        self.view.borrow().remote_streams.clone()
    }

    /// Mute toggles act on the local tracks directly; remote peers need no
    /// message.
    pub fn set_audio_enabled(&self, enabled: bool) {
        self.media.set_audio_enabled(enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.media.set_video_enabled(enabled);
    }

    pub fn local_stream(&self) -> MediaStream {
        self.media.stream()
    }

    /// Resolves once the session has ended, whether by `leave` or by a
    /// fatal error.
    pub async fn ended(&mut self) {
        let _ = self.view.wait_for(|view| view.ended).await;
    }

    /// Leaves the room and waits for teardown to finish.
    pub async fn leave(mut self) -> Result<SessionOutcome, SessionError> {
        self.shutdown.cancel();
        let task = self
            .task
            .take()
            .ok_or_else(|| SessionError::Task("session already left".into()))?;
        task.await.map_err(|err| SessionError::Task(err.to_string()))
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_heartbeat(
    registry: Arc<dyn RegistryApi>,
    room: RoomId,
    local: PeerId,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let beat = tokio::select! {
                _ = cancel.cancelled() => break,
                result = keep_alive(registry.as_ref(), &room, &local) => result,
            };
            match beat {
                Ok(_) => {}
                Err(err) => warn!(room = %room, peer = %local, error = %err, "heartbeat failed"),
            }
        }
    })
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct SessionLoop {
    config: SessionConfig,
    local: PeerId,
    registry: Arc<dyn RegistryApi>,
    transport: Arc<dyn MediaTransport>,
    media: Arc<LocalMediaSession>,
    reconciler: Reconciler,
    connections: ConnectionManager,
    /// Latest observed peer set, re-applied on every resync tick.
    present: Vec<PeerId>,
    /// Peers we expect to call us, with the time we stop waiting.
    passive_waits: BTreeMap<PeerId, Instant>,
    presence_mode: ChannelMode,
    view_tx: watch::Sender<SessionView>,
    shutdown: CancellationToken,
    heartbeat: CancellationToken,
    background: CancellationToken,
}

impl SessionLoop {
    async fn run(
        mut self,
        mut presence: mpsc::Receiver<PresenceUpdate>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> SessionOutcome {
        let mut resync = interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        resync.tick().await;
        let mut failure = None;

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                update = presence.recv() => match update {
                    Some(PresenceUpdate::Peers(peers)) => self.on_presence(peers),
                    Some(PresenceUpdate::Mode(mode)) => self.presence_mode = mode,
                    Some(PresenceUpdate::Fatal(err)) => {
                        error!(peer = %self.local, error = %err, "presence failed; ending session");
                        failure = Some(err);
                        break;
                    }
                    None => {
                        failure = Some(SessionError::Task("presence driver stopped".into()));
                        break;
                    }
                },
                event = events.recv() => match event {
                    Some(event) => self.on_transport_event(event),
                    None => {
                        failure = Some(SessionError::Task("transport event stream closed".into()));
                        break;
                    }
                },
                _ = resync.tick() => self.reconcile(),
                _ = sleep_until_some(deadline) => self.on_deadline(),
            }
            self.publish(false);
        }

        self.heartbeat.cancel();
        let report = teardown(
            self.registry.as_ref(),
            &self.config.room,
            &self.local,
            self.config.leave_timeout,
            &mut self.connections,
            &self.media,
            &self.background,
        )
        .await;
        self.passive_waits.clear();
        self.publish(true);
        SessionOutcome {
            report,
            error: failure,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let passive = self.passive_waits.values().min().copied();
        let negotiating = self
            .connections
            .next_negotiation_deadline(self.config.callee_timeout);
        match (passive, negotiating) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn on_presence(&mut self, peers: Vec<PeerRecord>) {
        self.present = peers.into_iter().map(|peer| peer.peer_id).collect();
        self.reconcile();
    }

    fn reconcile(&mut self) {
        let delta = self.reconciler.reconcile(self.present.iter().cloned());
        if delta.is_empty() {
            return;
        }
        debug!(
            peer = %self.local,
            added = ?delta.added,
            removed = ?delta.removed,
            "presence changed"
        );
        for peer in delta.removed {
            self.passive_waits.remove(&peer);
            self.connections.close(&peer, CloseReason::RemoteLeft);
        }
        for peer in delta.added {
            self.evaluate(peer);
        }
    }

    fn evaluate(&mut self, peer: PeerId) {
        if self.connections.has_live(&peer) {
            return;
        }
        if !should_initiate(&self.local, &peer) {
            debug!(peer = %peer, "waiting for inbound call");
            self.passive_waits
                .insert(peer, Instant::now() + self.config.callee_timeout);
            return;
        }
        match self
            .connections
            .connect(self.transport.as_ref(), &peer, self.media.stream())
        {
            Ok(()) | Err(SessionError::DuplicateConnection(_)) => {}
            Err(err) => {
                warn!(peer = %peer, error = %err, "call failed; retrying on a later pass");
                self.reconciler.forget(&peer);
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::IncomingCall(call) => {
                let peer = call.remote().clone();
                self.passive_waits.remove(&peer);
                match self.connections.accept(call, self.media.stream()) {
                    Ok(()) => {}
                    Err(SessionError::DuplicateConnection(_)) => {
                        debug!(peer = %peer, "closed redundant inbound call");
                    }
                    Err(err) => {
                        warn!(peer = %peer, error = %err, "answering failed");
                        self.reconciler.forget(&peer);
                    }
                }
            }
            TransportEvent::RemoteStream { call, peer, stream } => {
                self.connections.on_remote_stream(&peer, call, stream);
            }
            TransportEvent::CallClosed { call, peer } => {
                if self.connections.on_call_closed(&peer, call) {
                    self.reconciler.forget(&peer);
                }
            }
            TransportEvent::CallFailed { call, peer, reason } => {
                if let Some(err) = self.connections.on_call_failed(&peer, call, reason) {
                    warn!(error = %err, "connection errored; peer stays eligible for retry");
                    self.reconciler.forget(&peer);
                }
            }
        }
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        let expired: Vec<PeerId> = self
            .passive_waits
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in expired {
            self.passive_waits.remove(&peer);
            if !self.connections.has_live(&peer) {
                info!(
                    peer = %peer,
                    timeout = ?self.config.callee_timeout,
                    "no inbound call; re-evaluating"
                );
                self.reconciler.forget(&peer);
            }
        }
        for peer in self
            .connections
            .expire_negotiations(now, self.config.callee_timeout)
        {
            self.reconciler.forget(&peer);
        }
        self.reconcile();
    }

    fn publish(&self, ended: bool) {
        let view = SessionView {
            local: self.local.clone(),
            presence: self.presence_mode,
            known_peers: self.reconciler.known().clone(),
            connections: self.connections.states(),
            active_participants: self.connections.active_participants(),
            remote_streams: self.connections.remote_streams(),
            ended,
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}
