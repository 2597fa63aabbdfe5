//! mesh-road client over HTTP and websockets.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use mesh_protocol::{
    routes, ErrorBody, JoinRequest, JoinResponse, PeerId, PeerListResponse, PeerRecord, RoomId,
    ServerMessage,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        Error as WsError, Message,
    },
};
use tokio::time::timeout;
use tracing::debug;
use url::Url;

use crate::error::SessionError;
use crate::presence::{PresenceBackend, PresenceStream};
use crate::registry::RegistryApi;

/// Bound on every HTTP request and on the websocket handshake.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Talks to one mesh-road server as one identity.
#[derive(Clone)]
pub struct MeshRoadClient {
    http: Client,
    request_timeout: Duration,
    base: Url,
    token: String,
}

impl MeshRoadClient {
    /// `base` is the server's http(s) URL. It may carry a path prefix when
    /// the server sits behind a reverse proxy.
    pub fn new(base: Url, token: impl Into<String>) -> Result<Self, SessionError> {
        Self::with_timeout(base, token, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        mut base: Url,
        token: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, SessionError> {
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SessionError::InvalidArgument(format!(
                "unsupported server url scheme: {}",
                base.scheme()
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(request_timeout))
            .build()?;
        Ok(Self {
            http,
            request_timeout,
            base,
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, SessionError> {
        // Routes are absolute; joining them relative keeps the base prefix.
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|err| SessionError::InvalidArgument(err.to_string()))
    }

    fn presence_url(&self, room: &RoomId) -> Result<Url, SessionError> {
        let mut url = self.url(&routes::presence(room))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| SessionError::InvalidArgument("cannot derive websocket url".into()))?;
        Ok(url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.token)
    }
}

async fn check(response: Response) -> Result<Response, SessionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ErrorBody>().await {
        Ok(body) => Err(SessionError::from_body(body)),
        Err(_) => Err(status_error(status, "request failed")),
    }
}

fn status_error(status: StatusCode, context: &str) -> SessionError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SessionError::Unauthorized(format!("{}: {}", context, status))
        }
        StatusCode::NOT_FOUND => SessionError::NotFound(format!("{}: {}", context, status)),
        StatusCode::BAD_REQUEST => {
            SessionError::InvalidArgument(format!("{}: {}", context, status))
        }
        StatusCode::CONFLICT => SessionError::RoomFull(format!("{}: {}", context, status)),
        _ => SessionError::Protocol(format!("{}: {}", context, status)),
    }
}

#[async_trait]
impl RegistryApi for MeshRoadClient {
    async fn join(&self, room: &RoomId, peer: &PeerId) -> Result<PeerRecord, SessionError> {
        let request = JoinRequest {
            peer_id: peer.clone(),
        };
        let response = self
            .authorized(self.http.post(self.url(&routes::peers(room))?))
            .json(&request)
            .send()
            .await?;
        let body: JoinResponse = check(response).await?.json().await?;
        Ok(body.peer)
    }

    async fn leave(&self, room: &RoomId, peer: &PeerId) -> Result<(), SessionError> {
        let response = self
            .authorized(self.http.delete(self.url(&routes::peer(room, peer))?))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn heartbeat(&self, room: &RoomId, peer: &PeerId) -> Result<(), SessionError> {
        let response = self
            .authorized(self.http.post(self.url(&routes::heartbeat(room, peer))?))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl PresenceBackend for MeshRoadClient {
    async fn subscribe(&self, room: &RoomId) -> Result<PresenceStream, SessionError> {
        let url = self.presence_url(room)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| SessionError::InvalidArgument(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|err| SessionError::InvalidArgument(err.to_string()))?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);

        let connected = timeout(self.request_timeout, connect_async(request))
            .await
            .map_err(|_| {
                SessionError::ChannelDisconnected(format!(
                    "presence handshake took longer than {:?}",
                    self.request_timeout
                ))
            })?;
        let (socket, _) = match connected {
            Ok(connected) => connected,
            Err(WsError::Http(response)) => {
                let status = StatusCode::from_u16(response.status().as_u16())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                return Err(status_error(status, "presence subscribe rejected"));
            }
            Err(err) => return Err(SessionError::ChannelDisconnected(err.to_string())),
        };
        debug!(room = %room, "presence stream connected");

        let frames = socket.filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => Some(
                    serde_json::from_str::<ServerMessage>(&text).map_err(SessionError::from),
                ),
                Ok(Message::Close(frame)) => Some(Err(SessionError::ChannelDisconnected(
                    frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "closed by server".into()),
                ))),
                Ok(_) => None,
                Err(err) => Some(Err(SessionError::ChannelDisconnected(err.to_string()))),
            }
        });
        Ok(frames.boxed())
    }

    async fn snapshot(&self, room: &RoomId) -> Result<Vec<PeerRecord>, SessionError> {
        let response = self
            .authorized(self.http.get(self.url(&routes::peers(room))?))
            .send()
            .await?;
        let body: PeerListResponse = check(response).await?.json().await?;
        Ok(body.peers)
    }
}
