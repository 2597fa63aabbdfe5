use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mesh_peer_core::{
    http::MeshRoadClient,
    media::SyntheticDevices,
    presence::{spawn_presence, PresenceUpdate},
    registry::{keep_alive, RegistryApi},
    transport::loopback::LoopbackNetwork,
    MeshSession, SessionConfig, SessionDeps,
};
use mesh_protocol::{PeerId, RoomId};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "mesh-peer", about = "Drive mesh sessions against a mesh-road server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// mesh-road base URL.
    #[arg(long, env = "MESH_PEER_SERVER", default_value = "http://127.0.0.1:8080")]
    server: Url,

    #[arg(long, env = "MESH_PEER_ROOM")]
    room: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run several peers in one process over an in-memory media transport
    /// and print the resulting topology.
    Simulate {
        #[command(flatten)]
        server: ServerArgs,

        #[arg(long, default_value_t = 3)]
        peers: usize,

        /// Seconds to let the mesh settle before everyone leaves.
        #[arg(long, default_value_t = 10)]
        settle_secs: u64,

        /// Bearer token shared by every peer. Without one each peer sends
        /// its own insecure-mode token.
        #[arg(long, env = "MESH_PEER_TOKEN")]
        token: Option<String>,
    },
    /// Join a room as a media-less peer and log presence until interrupted.
    Probe {
        #[command(flatten)]
        server: ServerArgs,

        #[arg(long, env = "MESH_PEER_TOKEN")]
        token: String,

        #[arg(long)]
        peer_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    match Cli::parse().command {
        Commands::Simulate {
            server,
            peers,
            settle_secs,
            token,
        } => simulate(server, peers, Duration::from_secs(settle_secs), token).await,
        Commands::Probe {
            server,
            token,
            peer_id,
        } => probe(server, token, peer_id).await,
    }
}

fn fresh_peer_id(prefix: &str) -> Result<PeerId> {
    PeerId::parse(format!("{}-{}", prefix, Uuid::new_v4().simple())).context("invalid peer id")
}

async fn simulate(
    args: ServerArgs,
    count: usize,
    settle: Duration,
    token: Option<String>,
) -> Result<()> {
    let room = RoomId::parse(args.room).context("invalid room id")?;
    let network = LoopbackNetwork::new();
    let mut sessions = Vec::with_capacity(count);

    for index in 0..count {
        let peer = fresh_peer_id("sim")?;
        let token = token
            .clone()
            .unwrap_or_else(|| format!("sim-{}:Sim {}", index, index));
        let client = Arc::new(MeshRoadClient::new(args.server.clone(), token)?);
        let deps = SessionDeps {
            registry: client.clone(),
            presence: client,
            transport: Arc::new(network.endpoint(peer.clone())),
            devices: Arc::new(SyntheticDevices::new(format!("sim-{}", index))),
        };
        let session = MeshSession::start(SessionConfig::new(room.clone()), deps)
            .await
            .with_context(|| format!("peer {} failed to start", peer))?;
        info!(peer = %peer, "peer started");
        sessions.push(session);
    }

    tokio::select! {
        _ = tokio::time::sleep(settle) => {}
        _ = signal::ctrl_c() => info!("interrupted"),
    }

    for session in &sessions {
        let view = session.snapshot();
        println!(
            "{} sees {} of {} peers: {:?}",
            view.local,
            view.active_participants.len(),
            count.saturating_sub(1),
            view.active_participants
        );
    }
    println!("established calls: {}", network.established().len());

    for session in sessions {
        let peer = session.local_peer_id().clone();
        match session.leave().await {
            Ok(outcome) => info!(peer = %peer, report = ?outcome.report, "peer left"),
            Err(err) => warn!(peer = %peer, error = %err, "peer did not shut down cleanly"),
        }
    }
    Ok(())
}

async fn probe(args: ServerArgs, token: String, peer_id: Option<String>) -> Result<()> {
    let room = RoomId::parse(args.room).context("invalid room id")?;
    let peer = match peer_id {
        Some(raw) => PeerId::parse(raw).context("invalid peer id")?,
        None => fresh_peer_id("probe")?,
    };
    let client = Arc::new(MeshRoadClient::new(args.server, token)?);
    let record = client.join(&room, &peer).await?;
    info!(peer = %record.peer_id, user = %record.user_id, room = %room, "joined");

    let config = SessionConfig::new(room.clone());
    let cancel = CancellationToken::new();
    let (mut updates, driver) = spawn_presence(
        client.clone(),
        room.clone(),
        config.presence(),
        cancel.clone(),
    );
    let mut beat = tokio::time::interval(config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = beat.tick() => {
                if let Err(err) = keep_alive(client.as_ref(), &room, &peer).await {
                    warn!(error = %err, "heartbeat failed");
                }
            }
            update = updates.recv() => match update {
                Some(PresenceUpdate::Peers(peers)) => {
                    let ids: Vec<&str> = peers.iter().map(|p| p.peer_id.as_str()).collect();
                    println!("peers: {:?}", ids);
                }
                Some(PresenceUpdate::Mode(mode)) => info!(?mode, "presence channel"),
                Some(PresenceUpdate::Fatal(err)) => {
                    warn!(error = %err, "presence failed");
                    break;
                }
                None => break,
            },
        }
    }

    cancel.cancel();
    let _ = driver.await;
    client.leave(&room, &peer).await?;
    info!(peer = %peer, "left");
    Ok(())
}
