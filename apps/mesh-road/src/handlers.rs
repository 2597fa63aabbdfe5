use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use mesh_protocol::{
    ErrorBody, ErrorCode, HealthStatus, IdError, Identity, JoinRequest, JoinResponse, PeerId,
    PeerListResponse, RoomId,
};
use tracing::{debug, warn};

use crate::auth::{bearer, AuthError};
use crate::registry::RegistryError;
use crate::AppState;

/// JSON error returned by every HTTP endpoint.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error,
                message: message.into(),
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> ErrorCode {
        self.body.error
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let message = err.to_string();
        match err {
            RegistryError::NotFound(_) | RegistryError::PeerNotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, ErrorCode::NotFound, message)
            }
            RegistryError::InvalidArgument(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::InvalidArgument, message)
            }
            RegistryError::Unauthorized(_) => {
                ApiError::new(StatusCode::FORBIDDEN, ErrorCode::Unauthorized, message)
            }
            RegistryError::RoomFull { .. } => {
                ApiError::new(StatusCode::CONFLICT, ErrorCode::RoomFull, message)
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        debug!(error = %err, "rejecting unauthenticated request");
        ApiError::new(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized, err.to_string())
    }
}

impl From<IdError> for ApiError {
    fn from(err: IdError) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::InvalidArgument, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(err: JsonRejection) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::InvalidArgument, err.body_text())
    }
}

pub(crate) fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    fallback: Option<&str>,
) -> Result<Identity, ApiError> {
    let token = bearer(headers)
        .or(fallback)
        .ok_or(AuthError::MissingToken)?;
    Ok(state.verifier.verify(token)?)
}

pub async fn join_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<JoinRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JoinResponse>), ApiError> {
    let identity = authenticate(&state, &headers, None)?;
    let room_id = RoomId::parse(room_id)?;
    let Json(request) = body?;
    let peer = state.registry.join(&room_id, request.peer_id, &identity)?;
    Ok((StatusCode::OK, Json(JoinResponse { room_id, peer })))
}

/// Leaving is idempotent: an absent peer still yields 204.
pub async fn leave_room(
    State(state): State<AppState>,
    Path((room_id, peer_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let identity = authenticate(&state, &headers, None)?;
    let room_id = RoomId::parse(room_id)?;
    let peer_id = PeerId::parse(peer_id)?;
    state.registry.leave(&room_id, &peer_id, &identity)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path((room_id, peer_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let identity = authenticate(&state, &headers, None)?;
    let room_id = RoomId::parse(room_id)?;
    let peer_id = PeerId::parse(peer_id)?;
    state.registry.heartbeat(&room_id, &peer_id, &identity)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Polling fallback for the presence channel.
pub async fn list_peers(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PeerListResponse>, ApiError> {
    let identity = authenticate(&state, &headers, None)?;
    let room_id = RoomId::parse(room_id)?;
    let peers = state.registry.list_peers(&room_id, &identity)?;
    Ok(Json(PeerListResponse { room_id, peers }))
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    let stats = state.registry.stats();
    Json(HealthStatus {
        status: "ok".into(),
        rooms: stats.rooms,
        peers: stats.peers,
        subscribers: stats.subscribers,
    })
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => {
            warn!("metrics requested but no recorder is installed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use mesh_protocol::routes;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::TokenVerifier;
    use crate::registry::RoomRegistry;
    use crate::rooms::StaticRoomDirectory;

    fn state() -> AppState {
        let rooms = StaticRoomDirectory::parse_spec("lobby:8,duo:1,standup:4:alice").unwrap();
        AppState {
            registry: Arc::new(RoomRegistry::new(
                Arc::new(StaticRoomDirectory::new(rooms, None)),
                16,
            )),
            verifier: Arc::new(TokenVerifier::Insecure),
            metrics: None,
            send_timeout: Duration::from_secs(1),
        }
    }

    fn request(method: Method, uri: &str, token: Option<&str>, body: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(state: &AppState, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = crate::router(state.clone()).oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn room(id: &str) -> RoomId {
        RoomId::parse(id).unwrap()
    }

    fn peer(id: &str) -> PeerId {
        PeerId::parse(id).unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn join_list_and_leave() {
        let state = state();
        let (status, body) = send(
            &state,
            request(
                Method::POST,
                &routes::peers(&room("lobby")),
                Some("alice:Alice"),
                Some(r#"{"peer_id":"aaa"}"#),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["peer"]["display_name"], "Alice");

        let (status, body) = send(
            &state,
            request(Method::GET, &routes::peers(&room("lobby")), Some("bob"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["peers"].as_array().map(Vec::len), Some(1));

        let uri = routes::peer(&room("lobby"), &peer("aaa"));
        let (status, _) = send(&state, request(Method::DELETE, &uri, Some("alice"), None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        // second leave is a no-op
        let (status, _) = send(&state, request(Method::DELETE, &uri, Some("alice"), None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.registry.stats().peers, 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_token_is_unauthorized() {
        let state = state();
        let (status, body) = send(
            &state,
            request(
                Method::POST,
                &routes::peers(&room("lobby")),
                None,
                Some(r#"{"peer_id":"aaa"}"#),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");
    }

    #[test_timeout::tokio_timeout_test]
    async fn error_codes_follow_registry_errors() {
        let state = state();

        let (status, body) = send(
            &state,
            request(
                Method::POST,
                &routes::peers(&room("nowhere")),
                Some("alice"),
                Some(r#"{"peer_id":"aaa"}"#),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (status, body) = send(
            &state,
            request(
                Method::POST,
                &routes::peers(&room("lobby")),
                Some("alice"),
                Some(r#"{"peer_id":"not valid"}"#),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_argument");

        let (status, body) = send(
            &state,
            request(
                Method::POST,
                &routes::peers(&room("standup")),
                Some("mallory"),
                Some(r#"{"peer_id":"mmm"}"#),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "unauthorized");

        for (user, peer_id, expected) in [
            ("alice", "aaa", StatusCode::OK),
            ("bob", "bbb", StatusCode::CONFLICT),
        ] {
            let (status, _) = send(
                &state,
                request(
                    Method::POST,
                    &routes::peers(&room("duo")),
                    Some(user),
                    Some(format!(r#"{{"peer_id":"{}"}}"#, peer_id).as_str()),
                ),
            )
            .await;
            assert_eq!(status, expected);
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn heartbeat_requires_presence() {
        let state = state();
        let uri = routes::heartbeat(&room("lobby"), &peer("aaa"));
        let (status, body) = send(&state, request(Method::POST, &uri, Some("alice"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        state
            .registry
            .join(
                &room("lobby"),
                peer("aaa"),
                &Identity {
                    user_id: "alice".into(),
                    display_name: "Alice".into(),
                },
            )
            .unwrap();
        let (status, _) = send(&state, request(Method::POST, &uri, Some("alice"), None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[test_timeout::tokio_timeout_test]
    async fn health_reports_counts() {
        let state = state();
        let (status, body) = send(&state, request(Method::GET, "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["peers"], 0);
    }
}
