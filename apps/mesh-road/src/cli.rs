use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use mesh_protocol::{routes, RoomId, ServerMessage};
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        Message,
    },
};
use tracing::{debug, warn};

use crate::config::{AuthMode, Config};
use crate::rooms::StaticRoomDirectory;

#[derive(Parser, Debug)]
#[command(name = "mesh-road", author, version)]
#[command(about = "Room presence server for full-mesh calls, plus a presence watch client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the presence stream of a room as it arrives
    Watch {
        /// Server URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Room to observe
        #[arg(short, long)]
        room: String,

        /// Identity token sent as a bearer token
        #[arg(short, long, env = "MESH_TOKEN")]
        token: String,
    },
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "MESH_ROAD_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Shared HS256 secret used to verify identity tokens.
    #[arg(long, env = "MESH_ROAD_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Expected `iss` claim.
    #[arg(long, env = "MESH_ROAD_JWT_ISSUER")]
    pub jwt_issuer: Option<String>,

    /// Expected `aud` claim.
    #[arg(long, env = "MESH_ROAD_JWT_AUDIENCE")]
    pub jwt_audience: Option<String>,

    /// Accept `user[:name]` tokens without verification (development only).
    #[arg(long, env = "MESH_ROAD_INSECURE_AUTH", default_value_t = false)]
    pub insecure_auth: bool,

    /// Known rooms, e.g. `lobby:8,standup:4:alice|bob`.
    #[arg(long, env = "MESH_ROAD_ROOMS", default_value = "")]
    pub rooms: String,

    /// Capacity of rooms that are not listed; 0 rejects unknown rooms.
    #[arg(long, env = "MESH_ROAD_OPEN_ROOM_CAPACITY", default_value_t = 0)]
    pub open_room_capacity: usize,

    /// Keepalive period for presence streams.
    #[arg(long, env = "MESH_ROAD_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Peers without a heartbeat for this long are removed.
    #[arg(long, env = "MESH_ROAD_LIVENESS_TIMEOUT_SECS", default_value_t = 45)]
    pub liveness_timeout_secs: u64,

    /// Frames buffered per presence subscriber before it is dropped.
    #[arg(long, env = "MESH_ROAD_SUBSCRIBER_BUFFER", default_value_t = 64)]
    pub subscriber_buffer: usize,

    /// Maximum time a single presence frame write may take.
    #[arg(long, env = "MESH_ROAD_SEND_TIMEOUT_SECS", default_value_t = 5)]
    pub send_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "MESH_ROAD_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<ServeArgs> for Config {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        let auth = match (args.jwt_secret, args.insecure_auth) {
            (Some(secret), _) if !secret.is_empty() => AuthMode::Jwt {
                secret,
                issuer: args.jwt_issuer,
                audience: args.jwt_audience,
            },
            (_, true) => AuthMode::Insecure,
            _ => bail!("either --jwt-secret or --insecure-auth is required"),
        };
        let rooms = StaticRoomDirectory::parse_spec(&args.rooms)?;
        let open_room_capacity = (args.open_room_capacity > 0).then_some(args.open_room_capacity);
        if rooms.is_empty() && open_room_capacity.is_none() {
            bail!("no rooms configured; pass --rooms or --open-room-capacity");
        }
        if args.ping_interval_secs == 0 || args.liveness_timeout_secs == 0 {
            bail!("ping interval and liveness timeout must be greater than zero");
        }
        let liveness_timeout = Duration::from_secs(args.liveness_timeout_secs);
        Ok(Config {
            listen_addr,
            auth,
            rooms,
            open_room_capacity,
            ping_interval: Duration::from_secs(args.ping_interval_secs),
            liveness_timeout,
            sweep_interval: (liveness_timeout / 4).max(Duration::from_secs(1)),
            subscriber_buffer: args.subscriber_buffer.max(1),
            send_timeout: Duration::from_secs(args.send_timeout_secs.max(1)),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

/// Connects to a room's presence stream and prints each frame.
pub async fn run_watch(url: String, room: String, token: String) -> Result<()> {
    let room = RoomId::parse(room)?;
    let ws_url = format!("{}{}", url.trim_end_matches('/'), routes::presence(&room));
    debug!("Connecting to {}", ws_url);

    let mut request = ws_url.as_str().into_client_request()?;
    request.headers_mut().insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token)).context("invalid token")?,
    );

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(request)).await {
        Ok(result) => result.with_context(|| format!("failed to connect to {}", ws_url))?,
        Err(_) => bail!("connection timeout - is mesh-road running?"),
    };
    let (_write, mut read) = ws_stream.split();

    while let Some(frame) = read.next().await {
        match frame? {
            Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::Snapshot { peers, .. }) => {
                    println!("snapshot ({} peers)", peers.len());
                    for peer in peers {
                        println!("  {} {} ({})", peer.peer_id, peer.display_name, peer.user_id);
                    }
                }
                Ok(ServerMessage::PeerJoined { peer }) => {
                    println!("+ {} {} ({})", peer.peer_id, peer.display_name, peer.user_id);
                }
                Ok(ServerMessage::PeerLeft { peer_id }) => println!("- {}", peer_id),
                Ok(ServerMessage::Ping) => debug!("ping"),
                Ok(ServerMessage::Error { message }) => println!("! {}", message),
                Err(err) => warn!("unparseable frame: {}", err),
            },
            Message::Close(frame) => {
                println!("closed: {:?}", frame.map(|f| f.reason.to_string()));
                break;
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["mesh-road"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test_timeout::timeout]
    fn serve_args_build_config() {
        let cli = parse(&[
            "--jwt-secret",
            "s3cret",
            "--rooms",
            "lobby:8",
            "--liveness-timeout-secs",
            "40",
        ]);
        let config = Config::try_from(cli.serve).unwrap();
        assert!(matches!(config.auth, AuthMode::Jwt { .. }));
        assert_eq!(config.rooms.len(), 1);
        assert_eq!(config.open_room_capacity, None);
        assert_eq!(config.sweep_interval, Duration::from_secs(10));
    }

    #[test_timeout::timeout]
    fn auth_mode_is_required() {
        let cli = parse(&["--rooms", "lobby:8"]);
        assert!(Config::try_from(cli.serve).is_err());
    }

    #[test_timeout::timeout]
    fn some_room_source_is_required() {
        let cli = parse(&["--insecure-auth"]);
        assert!(Config::try_from(cli.serve).is_err());
        let cli = parse(&["--insecure-auth", "--open-room-capacity", "6"]);
        assert_eq!(Config::try_from(cli.serve).unwrap().open_room_capacity, Some(6));
    }

    #[test_timeout::timeout]
    fn watch_subcommand_parses() {
        let cli = parse(&["watch", "--room", "lobby", "--token", "alice"]);
        match cli.command {
            Some(Commands::Watch { room, url, .. }) => {
                assert_eq!(room, "lobby");
                assert_eq!(url, "ws://localhost:8080");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
