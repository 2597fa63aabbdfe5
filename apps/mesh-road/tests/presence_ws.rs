use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mesh_protocol::{routes, Identity, PeerId, RoomId, ServerMessage};
use mesh_road::{config::Config, rooms::StaticRoomDirectory, AppState};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, http::HeaderValue, Message},
};

struct TestServer {
    base: String,
    state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn start_server(config: Config) -> TestServer {
    let state = AppState::from_config(&config, None);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    let serve_state = state.clone();
    tokio::spawn(async move {
        let _ = mesh_road::serve(listener, serve_state, &config, async move {
            let _ = rx.await;
        })
        .await;
    });
    TestServer {
        base: format!("ws://{}", addr),
        state,
        shutdown: Some(tx),
    }
}

fn config() -> Config {
    Config {
        rooms: StaticRoomDirectory::parse_spec("lobby:8,standup:4:alice").unwrap(),
        open_room_capacity: None,
        ..Config::default()
    }
}

fn identity(user: &str) -> Identity {
    Identity {
        user_id: user.into(),
        display_name: user.to_uppercase(),
    }
}

async fn next_message<S>(stream: &mut S) -> ServerMessage
where
    S: StreamExt<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let frame = timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("frame within deadline")
            .expect("stream open")
            .expect("frame ok");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[test_timeout::tokio_timeout_test]
async fn snapshot_then_live_events() {
    let server = start_server(config()).await;
    let lobby = RoomId::parse("lobby").unwrap();
    server
        .state
        .registry
        .join(&lobby, PeerId::parse("aaa").unwrap(), &identity("alice"))
        .unwrap();

    let url = format!("{}{}?token=bob", server.base, routes::presence(&lobby));
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

    match next_message(&mut ws).await {
        ServerMessage::Snapshot { room_id, peers } => {
            assert_eq!(room_id, lobby);
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].peer_id.as_str(), "aaa");
        }
        other => panic!("expected snapshot, got {:?}", other),
    }

    server
        .state
        .registry
        .join(&lobby, PeerId::parse("bbb").unwrap(), &identity("bob"))
        .unwrap();
    server
        .state
        .registry
        .leave(&lobby, &PeerId::parse("aaa").unwrap(), &identity("alice"))
        .unwrap();

    assert!(matches!(
        next_message(&mut ws).await,
        ServerMessage::PeerJoined { peer } if peer.peer_id.as_str() == "bbb"
    ));
    assert!(matches!(
        next_message(&mut ws).await,
        ServerMessage::PeerLeft { peer_id } if peer_id.as_str() == "aaa"
    ));
    ws.close(None).await.unwrap();
}

#[test_timeout::tokio_timeout_test]
async fn lagging_subscriber_gets_error_then_close() {
    let server = start_server(Config {
        subscriber_buffer: 1,
        ..config()
    })
    .await;
    let lobby = RoomId::parse("lobby").unwrap();

    let url = format!("{}{}?token=bob", server.base, routes::presence(&lobby));
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    assert!(matches!(next_message(&mut ws).await, ServerMessage::Snapshot { .. }));

    // No await between joins, so the forwarder cannot drain in between.
    for (peer, user) in [("bbb", "bob"), ("ccc", "carol"), ("ddd", "dave")] {
        server
            .state
            .registry
            .join(&lobby, PeerId::parse(peer).unwrap(), &identity(user))
            .unwrap();
    }
    assert_eq!(server.state.registry.stats().subscribers, 0);

    assert!(matches!(
        next_message(&mut ws).await,
        ServerMessage::PeerJoined { peer } if peer.peer_id.as_str() == "bbb"
    ));
    match next_message(&mut ws).await {
        ServerMessage::Error { message } => assert_eq!(message, "presence stream lagged"),
        other => panic!("expected error frame, got {:?}", other),
    }
    let close = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("close within deadline");
    match close {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 1013),
        other => panic!("expected close 1013, got {:?}", other),
    }
}

#[test_timeout::tokio_timeout_test]
async fn closing_the_socket_does_not_leave() {
    let server = start_server(config()).await;
    let lobby = RoomId::parse("lobby").unwrap();
    server
        .state
        .registry
        .join(&lobby, PeerId::parse("aaa").unwrap(), &identity("alice"))
        .unwrap();

    let mut request = format!("{}{}", server.base, routes::presence(&lobby))
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("authorization", HeaderValue::from_static("Bearer alice"));
    let (mut ws, _) = connect_async(request).await.unwrap();
    assert!(matches!(next_message(&mut ws).await, ServerMessage::Snapshot { .. }));
    assert_eq!(server.state.registry.stats().subscribers, 1);

    ws.close(None).await.unwrap();
    drop(ws);

    for _ in 0..50 {
        if server.state.registry.stats().subscribers == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let stats = server.state.registry.stats();
    assert_eq!(stats.subscribers, 0);
    assert_eq!(stats.peers, 1);
}

#[test_timeout::tokio_timeout_test]
async fn rejected_before_upgrade() {
    let server = start_server(config()).await;
    let standup = RoomId::parse("standup").unwrap();

    let url = format!("{}{}", server.base, routes::presence(&standup));
    match connect_async(url.as_str()).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected http 401, got {:?}", other.map(|_| ())),
    }

    let url = format!("{}{}?token=mallory", server.base, routes::presence(&standup));
    match connect_async(url.as_str()).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 403),
        other => panic!("expected http 403, got {:?}", other.map(|_| ())),
    }

    let nowhere = RoomId::parse("nowhere").unwrap();
    let url = format!("{}{}?token=alice", server.base, routes::presence(&nowhere));
    match connect_async(url.as_str()).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 404),
        other => panic!("expected http 404, got {:?}", other.map(|_| ())),
    }
}
