#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use mesh_peer_core::{
    media::SyntheticDevices,
    presence::{PresenceBackend, PresenceStream},
    registry::RegistryApi,
    transport::loopback::LoopbackNetwork,
    MeshSession, SessionConfig, SessionDeps, SessionError, SessionHandle, SessionView,
};
use mesh_protocol::{Identity, PeerId, PeerRecord, RoomId};
use mesh_road::{
    monitor::spawn_keepalive,
    registry::{RegistryError, RoomRegistry},
    rooms::{RoomPolicy, StaticRoomDirectory},
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::timeout;

pub const ROOM: &str = "standup";

pub fn peer(raw: &str) -> PeerId {
    PeerId::parse(raw).unwrap()
}

fn session_error(err: RegistryError) -> SessionError {
    match err {
        RegistryError::NotFound(room) => SessionError::NotFound(room.to_string()),
        RegistryError::PeerNotFound(peer) => SessionError::NotFound(peer.to_string()),
        RegistryError::InvalidArgument(msg) => SessionError::InvalidArgument(msg),
        RegistryError::Unauthorized(msg) => SessionError::Unauthorized(msg),
        other @ RegistryError::RoomFull { .. } => SessionError::RoomFull(other.to_string()),
    }
}

/// Registry and presence backend that call straight into an in-process
/// `RoomRegistry`, with a switch that cuts the push channel.
pub struct InMemoryClient {
    registry: Arc<RoomRegistry>,
    identity: Identity,
    push: watch::Receiver<bool>,
}

async fn push_cut(push: &mut watch::Receiver<bool>) {
    loop {
        if !*push.borrow_and_update() {
            return;
        }
        if push.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl RegistryApi for InMemoryClient {
    async fn join(&self, room: &RoomId, peer: &PeerId) -> Result<PeerRecord, SessionError> {
        self.registry
            .join(room, peer.clone(), &self.identity)
            .map_err(session_error)
    }

    async fn leave(&self, room: &RoomId, peer: &PeerId) -> Result<(), SessionError> {
        self.registry
            .leave(room, peer, &self.identity)
            .map(|_| ())
            .map_err(session_error)
    }

    async fn heartbeat(&self, room: &RoomId, peer: &PeerId) -> Result<(), SessionError> {
        self.registry
            .heartbeat(room, peer, &self.identity)
            .map_err(session_error)
    }
}

#[async_trait]
impl PresenceBackend for InMemoryClient {
    async fn subscribe(&self, room: &RoomId) -> Result<PresenceStream, SessionError> {
        if !*self.push.borrow() {
            return Err(SessionError::ChannelDisconnected("push channel is down".into()));
        }
        let subscription = self
            .registry
            .subscribe(room, &self.identity)
            .map_err(session_error)?;
        let frames = stream::unfold(
            (subscription, self.push.clone()),
            |(mut subscription, mut push)| async move {
                tokio::select! {
                    message = subscription.recv() => {
                        message.map(|message| (Ok(message), (subscription, push)))
                    }
                    _ = push_cut(&mut push) => None,
                }
            },
        );
        Ok(frames.boxed())
    }

    async fn snapshot(&self, room: &RoomId) -> Result<Vec<PeerRecord>, SessionError> {
        self.registry
            .list_peers(room, &self.identity)
            .map_err(session_error)
    }
}

pub struct Harness {
    pub registry: Arc<RoomRegistry>,
    pub network: Arc<LoopbackNetwork>,
    pub room: RoomId,
    push: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl Harness {
    pub fn new(capacity: usize) -> Self {
        let room = RoomId::parse(ROOM).unwrap();
        let directory = StaticRoomDirectory::new([RoomPolicy::public(room.clone(), capacity)], None);
        let registry = Arc::new(RoomRegistry::new(Arc::new(directory), 64));
        spawn_keepalive(registry.clone(), Duration::from_secs(30));
        Self {
            registry,
            network: LoopbackNetwork::new(),
            room,
            push: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> SessionConfig {
        SessionConfig::new(self.room.clone()).with_poll_interval(Duration::from_secs(2))
    }

    fn push_switch(&self, user: &str) -> watch::Receiver<bool> {
        self.push
            .lock()
            .entry(user.to_string())
            .or_insert_with(|| watch::channel(true).0)
            .subscribe()
    }

    /// Cuts or restores the push channel of every client acting as `user`.
    /// Polling keeps working either way.
    pub fn set_push(&self, user: &str, up: bool) {
        if let Some(switch) = self.push.lock().get(user) {
            switch.send_replace(up);
        }
    }

    pub fn client(&self, user: &str) -> Arc<InMemoryClient> {
        Arc::new(InMemoryClient {
            registry: self.registry.clone(),
            identity: Identity {
                user_id: user.to_string(),
                display_name: user.to_uppercase(),
            },
            push: self.push_switch(user),
        })
    }

    pub fn deps(&self, id: &str) -> SessionDeps {
        let client = self.client(id);
        SessionDeps {
            registry: client.clone(),
            presence: client,
            transport: Arc::new(self.network.endpoint(peer(id))),
            devices: Arc::new(SyntheticDevices::new(id)),
        }
    }

    pub async fn start(&self, id: &str) -> SessionHandle {
        self.start_with(id, self.config()).await
    }

    pub async fn start_with(&self, id: &str, config: SessionConfig) -> SessionHandle {
        MeshSession::start(config, self.deps(id)).await.unwrap()
    }

    pub fn present(&self) -> Vec<PeerId> {
        let identity = Identity {
            user_id: "observer".into(),
            display_name: "Observer".into(),
        };
        self.registry
            .list_peers(&self.room, &identity)
            .unwrap()
            .into_iter()
            .map(|record| record.peer_id)
            .collect()
    }
}

/// Waits, in virtual time, until the session view satisfies `done`.
pub async fn wait_for_view(
    session: &SessionHandle,
    what: &str,
    done: impl FnMut(&SessionView) -> bool,
) -> SessionView {
    let mut view = session.view();
    let result = timeout(Duration::from_secs(120), view.wait_for(done)).await;
    match result {
        Ok(Ok(view)) => view.clone(),
        Ok(Err(_)) => panic!("{}: session view closed while waiting for {}", session.local_peer_id(), what),
        Err(_) => panic!(
            "{}: timed out waiting for {}; last view {:?}",
            session.local_peer_id(),
            what,
            session.snapshot()
        ),
    }
}

pub async fn wait_connected_to(session: &SessionHandle, others: &[&str]) -> SessionView {
    let expected: Vec<PeerId> = others.iter().map(|id| peer(id)).collect();
    wait_for_view(session, "full mesh", |view| {
        view.active_participants.len() == expected.len()
            && expected
                .iter()
                .all(|peer| view.active_participants.contains(peer))
    })
    .await
}
