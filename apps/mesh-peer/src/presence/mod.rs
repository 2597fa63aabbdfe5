//! Client end of the presence channel.
//!
//! The driver keeps a full view of the room's peers and hands every change
//! to the session as a complete list, whether the change came from the push
//! stream or from a polled snapshot. When the push stream dies it polls at
//! `poll_interval` while reconnecting with exponential backoff.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use mesh_protocol::{PeerId, PeerRecord, RoomId, ServerMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SessionError;

pub type PresenceStream = BoxStream<'static, Result<ServerMessage, SessionError>>;

#[async_trait]
pub trait PresenceBackend: Send + Sync {
    /// Opens the push stream. The first frame is a snapshot.
    async fn subscribe(&self, room: &RoomId) -> Result<PresenceStream, SessionError>;

    /// Polling fallback.
    async fn snapshot(&self, room: &RoomId) -> Result<Vec<PeerRecord>, SessionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Connecting,
    Push,
    Polling,
}

#[derive(Debug)]
pub enum PresenceUpdate {
    /// The complete current peer set of the room.
    Peers(Vec<PeerRecord>),
    Mode(ChannelMode),
    /// The channel gave up; the session cannot continue.
    Fatal(SessionError),
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub ping_timeout: Duration,
    pub poll_interval: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// Upper bound on a single subscribe attempt. Each snapshot poll is
    /// bounded by `poll_interval`.
    pub request_timeout: Duration,
}

#[derive(Debug)]
struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: min,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Spawns the presence driver for `room`. It runs until `cancel` fires,
/// the receiver is dropped, or a fatal error has been reported.
pub fn spawn_presence(
    backend: Arc<dyn PresenceBackend>,
    room: RoomId,
    config: PresenceConfig,
    cancel: CancellationToken,
) -> (mpsc::Receiver<PresenceUpdate>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(32);
    let driver = PresenceDriver {
        backoff: Backoff::new(config.reconnect_min, config.reconnect_max),
        backend,
        room,
        config,
        cancel,
        tx,
        view: BTreeMap::new(),
    };
    (rx, tokio::spawn(driver.run()))
}

struct PresenceDriver {
    backend: Arc<dyn PresenceBackend>,
    room: RoomId,
    config: PresenceConfig,
    cancel: CancellationToken,
    tx: mpsc::Sender<PresenceUpdate>,
    view: BTreeMap<PeerId, PeerRecord>,
    backoff: Backoff,
}

impl PresenceDriver {
    async fn run(mut self) {
        if let Flow::Stop = self.emit(PresenceUpdate::Mode(ChannelMode::Connecting)).await {
            return;
        }
        loop {
            let subscribed = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = timeout(self.config.request_timeout, self.backend.subscribe(&self.room)) => {
                    result.unwrap_or_else(|_| {
                        Err(SessionError::ChannelDisconnected(format!(
                            "subscribe took longer than {:?}",
                            self.config.request_timeout
                        )))
                    })
                }
            };
            match subscribed {
                Ok(stream) => {
                    if let Flow::Stop = self.pump(stream).await {
                        return;
                    }
                }
                Err(err) if err.is_fatal() => {
                    self.fatal(err).await;
                    return;
                }
                Err(err) => warn!(room = %self.room, error = %err, "presence subscribe failed"),
            }
            if let Flow::Stop = self.poll_until_retry().await {
                return;
            }
        }
    }

    async fn emit(&self, update: PresenceUpdate) -> Flow {
        match self.tx.send(update).await {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Stop,
        }
    }

    async fn emit_view(&self) -> Flow {
        let peers = self.view.values().cloned().collect();
        self.emit(PresenceUpdate::Peers(peers)).await
    }

    async fn fatal(&self, err: SessionError) {
        warn!(room = %self.room, error = %err, "presence channel failed permanently");
        let _ = self.tx.send(PresenceUpdate::Fatal(err)).await;
    }

    fn replace(&mut self, peers: Vec<PeerRecord>) {
        self.view = peers
            .into_iter()
            .map(|peer| (peer.peer_id.clone(), peer))
            .collect();
    }

    /// Folds pushed frames into the view until the stream ends or goes
    /// silent for longer than `ping_timeout`.
    async fn pump(&mut self, mut stream: PresenceStream) -> Flow {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Flow::Stop,
                next = timeout(self.config.ping_timeout, stream.next()) => next,
            };
            let message = match next {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(err))) if err.is_fatal() => {
                    self.fatal(err).await;
                    return Flow::Stop;
                }
                Ok(Some(Err(err))) => {
                    self.disconnected(err.to_string());
                    return Flow::Continue;
                }
                Ok(None) => {
                    self.disconnected("stream ended".into());
                    return Flow::Continue;
                }
                Err(_) => {
                    self.disconnected(format!(
                        "no frames for {:?}",
                        self.config.ping_timeout
                    ));
                    return Flow::Continue;
                }
            };
            match message {
                ServerMessage::Snapshot { peers, .. } => {
                    self.replace(peers);
                    self.backoff.reset();
                    if let Flow::Stop = self.emit(PresenceUpdate::Mode(ChannelMode::Push)).await {
                        return Flow::Stop;
                    }
                }
                ServerMessage::PeerJoined { peer } => {
                    self.view.insert(peer.peer_id.clone(), peer);
                }
                ServerMessage::PeerLeft { peer_id } => {
                    self.view.remove(&peer_id);
                }
                ServerMessage::Ping => continue,
                ServerMessage::Error { message } => {
                    self.disconnected(message);
                    return Flow::Continue;
                }
            }
            if let Flow::Stop = self.emit_view().await {
                return Flow::Stop;
            }
        }
    }

    fn disconnected(&self, reason: String) {
        let err = SessionError::ChannelDisconnected(reason);
        warn!(room = %self.room, error = %err, "presence push channel lost");
    }

    /// Polls snapshots until the next reconnect attempt is due.
    async fn poll_until_retry(&mut self) -> Flow {
        let retry_in = self.backoff.next_delay();
        if let Flow::Stop = self.emit(PresenceUpdate::Mode(ChannelMode::Polling)).await {
            return Flow::Stop;
        }
        info!(room = %self.room, ?retry_in, "presence polling until reconnect");

        let reconnect = sleep(retry_in);
        tokio::pin!(reconnect);
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Flow::Stop,
                _ = &mut reconnect => return Flow::Continue,
                _ = ticker.tick() => {}
            }
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => return Flow::Stop,
                _ = &mut reconnect => return Flow::Continue,
                result = timeout(self.config.poll_interval, self.backend.snapshot(&self.room)) => result,
            };
            match polled {
                Err(_) => debug!(room = %self.room, "presence poll timed out"),
                Ok(Ok(peers)) => {
                    self.replace(peers);
                    if let Flow::Stop = self.emit_view().await {
                        return Flow::Stop;
                    }
                }
                Ok(Err(err)) if err.is_fatal() => {
                    self.fatal(err).await;
                    return Flow::Stop;
                }
                Ok(Err(err)) => debug!(room = %self.room, error = %err, "presence poll failed"),
            }
        }
    }
}
