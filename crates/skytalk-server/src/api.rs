use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{DefaultBodyLimit, FromRef, FromRequestParts, Multipart, Path, State},
    http::{header, request::Parts, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use skytalk_shared::constants::{MAX_USERNAME_CHARS, MIN_USERNAME_CHARS, PROTOCOL_VERSION};
use skytalk_shared::protocol::{MessageDeleted, MessagePayload};
use skytalk_shared::reconnect::ReconnectPolicy;
use skytalk_shared::{RelayError, UserId};
use skytalk_store::{ConversationSummary, FriendRequestStatus, User};

use crate::auth::{bearer_token, AuthError, IdentityVerifier, TokenPair, UserIdentity};
use crate::blob_store::BlobStore;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::presence::PresenceRegistry;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::relay::Relay;
use crate::session::{ws_handler, SessionManager};
use crate::store::{FriendshipOracle, MessageStore, SqliteStore, UserDirectory};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub verifier: Arc<IdentityVerifier>,
    pub users: Arc<dyn UserDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub friends: Arc<dyn FriendshipOracle>,
    pub presence: Arc<PresenceRegistry>,
    pub relay: Relay,
    pub sessions: SessionManager,
    pub blob_store: Arc<BlobStore>,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    /// Wire every component around one SQLite store.
    pub async fn build(config: ServerConfig, store: SqliteStore) -> Result<Self, ServerError> {
        let verifier = Arc::new(IdentityVerifier::from_config(&config));
        let blob_store = Arc::new(
            BlobStore::new(config.blob_storage_path.clone(), config.max_blob_size).await?,
        );

        let users: Arc<dyn UserDirectory> = Arc::new(store.clone());
        let messages: Arc<dyn MessageStore> = Arc::new(store.clone());
        let friends: Arc<dyn FriendshipOracle> = Arc::new(store);

        let presence = Arc::new(PresenceRegistry::new());
        let relay = Relay::new(presence.clone(), messages.clone(), friends.clone());
        let sessions = SessionManager::new(
            verifier.clone(),
            users.clone(),
            relay.clone(),
            RateLimiter::new(config.event_rate_per_sec, config.event_burst),
            config.typing_timeout,
        )
        .with_keep_alive(config.ping_interval, config.idle_timeout);
        let rate_limiter = RateLimiter::new(config.http_rate_per_sec, config.http_burst);

        Ok(Self {
            config: Arc::new(config),
            verifier,
            users,
            messages,
            friends,
            presence,
            relay,
            sessions,
            blob_store,
            rate_limiter,
        })
    }
}

impl FromRef<AppState> for SessionManager {
    fn from_ref(state: &AppState) -> Self {
        state.sessions.clone()
    }
}

/// The authenticated caller of an HTTP request.
pub struct AuthUser(pub UserIdentity);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token);
        let identity = state.sessions.authenticate(token).await?;
        Ok(AuthUser(identity))
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let body_limit = state.config.max_blob_size + 64 * 1024;

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(ws_handler))
        .route("/api/auth/register", post(register))
        .route("/api/auth/refresh-token", post(refresh_token))
        .route("/api/auth/me", get(me))
        .route("/api/friends/list", get(friends_list))
        .route("/api/friends/requests/pending", get(pending_requests))
        .route("/api/friends/request", post(request_friend))
        .route("/api/friends/:friend_id", delete(remove_friend))
        .route("/api/chat/conversation/:friend_id", get(conversation))
        .route("/api/chat/conversations", get(conversations))
        .route("/api/chat/delete-message/:message_id", post(delete_message))
        .route("/api/chat/upload", post(upload))
        .route("/api/chat/files/:id", get(download))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    online_users: usize,
    reconnect: ReconnectPolicy,
}

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    user: UserIdentity,
    #[serde(flatten)]
    tokens: TokenPair,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
}

#[derive(Serialize)]
struct FriendsResponse {
    count: usize,
    friends: Vec<User>,
}

#[derive(Serialize)]
struct PendingRequestsResponse {
    count: usize,
    requests: Vec<User>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FriendRequest {
    receiver_id: String,
}

#[derive(Serialize)]
struct FriendRequestResponse {
    status: FriendRequestStatus,
}

#[derive(Serialize)]
struct RemoveFriendResponse {
    removed: bool,
}

#[derive(Serialize)]
struct ConversationResponse {
    messages: Vec<MessagePayload>,
}

#[derive(Serialize)]
struct ConversationsResponse {
    conversations: Vec<ConversationSummary>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    file_url: String,
    file_name: String,
    file_size: u64,
    file_type: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        online_users: state.presence.online_count(),
        reconnect: ReconnectPolicy::default(),
    })
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ServerError> {
    if !state.config.allow_registration {
        return Err(ServerError::Forbidden("Registration is disabled".to_string()));
    }

    let username = req.username.trim().to_string();
    let len = username.chars().count();
    if !(MIN_USERNAME_CHARS..=MAX_USERNAME_CHARS).contains(&len) {
        return Err(ServerError::BadRequest(format!(
            "Username must be {MIN_USERNAME_CHARS} to {MAX_USERNAME_CHARS} characters"
        )));
    }

    let user = state.users.register(username).await?;
    let tokens = state.verifier.issue_pair(user.id)?;

    info!(user = %user.id, username = %user.username, "User registered");
    Ok((StatusCode::CREATED, Json(RegisterResponse { user, tokens })))
}

async fn refresh_token(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, ServerError> {
    let (user, access_token) = state.verifier.refresh(&req.refresh_token)?;

    let known = state
        .users
        .find_user(user)
        .await
        .map_err(|e| AuthError::DirectoryUnavailable(e.to_string()))?;
    if known.is_none() {
        return Err(AuthError::UnknownUser.into());
    }

    info!(user = %user, "Access credential refreshed");
    Ok(Json(RefreshResponse { access_token }))
}

async fn me(AuthUser(identity): AuthUser) -> Json<UserIdentity> {
    Json(identity)
}

fn parse_friend_id(raw: &str) -> Result<UserId, ServerError> {
    raw.parse()
        .map_err(|_| ServerError::BadRequest("Invalid friend ID".to_string()))
}

async fn friends_list(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> Result<Json<FriendsResponse>, ServerError> {
    let friends = state.friends.friends_of(identity.id).await?;
    Ok(Json(FriendsResponse {
        count: friends.len(),
        friends,
    }))
}

async fn pending_requests(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> Result<Json<PendingRequestsResponse>, ServerError> {
    let requests = state.friends.pending_requests(identity.id).await?;
    Ok(Json(PendingRequestsResponse {
        count: requests.len(),
        requests,
    }))
}

async fn request_friend(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Json(req): Json<FriendRequest>,
) -> Result<Json<FriendRequestResponse>, ServerError> {
    let receiver = parse_friend_id(&req.receiver_id)?;
    if receiver == identity.id {
        return Err(ServerError::BadRequest(
            "You cannot send a friend request to yourself".to_string(),
        ));
    }

    let status = state
        .friends
        .request_friendship(identity.id, receiver)
        .await?;
    info!(user = %identity.id, receiver = %receiver, ?status, "Friend request");
    Ok(Json(FriendRequestResponse { status }))
}

async fn remove_friend(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(friend_id): Path<String>,
) -> Result<Json<RemoveFriendResponse>, ServerError> {
    let friend = parse_friend_id(&friend_id)?;
    if !state.friends.remove_friendship(identity.id, friend).await? {
        return Err(RelayError::NotFound("Friend").into());
    }
    info!(user = %identity.id, friend = %friend, "Friend removed");
    Ok(Json(RemoveFriendResponse { removed: true }))
}

async fn conversation(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(friend_id): Path<String>,
) -> Result<Json<ConversationResponse>, ServerError> {
    let friend = parse_friend_id(&friend_id)?;

    if !state.friends.are_friends(identity.id, friend).await? {
        return Err(ServerError::Forbidden(
            "You can only chat with friends".to_string(),
        ));
    }

    let messages = state
        .messages
        .read_conversation(identity.id, friend, state.config.history_limit)
        .await?;

    Ok(Json(ConversationResponse {
        messages: messages.iter().map(MessagePayload::from).collect(),
    }))
}

async fn conversations(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> Result<Json<ConversationsResponse>, ServerError> {
    let conversations = state.messages.conversations(identity.id).await?;
    Ok(Json(ConversationsResponse { conversations }))
}

async fn delete_message(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(message_id): Path<String>,
) -> Result<Json<MessageDeleted>, ServerError> {
    let notice = state
        .relay
        .delete_message(identity.id, &message_id, None)
        .await?;
    Ok(Json(notice))
}

async fn upload(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ServerError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or("file").to_string();
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;

        let stored = state
            .blob_store
            .store_file(&data, &file_name, content_type.as_deref())
            .await?;

        info!(
            id = %stored.id,
            user = %identity.id,
            size = stored.size,
            "File uploaded"
        );

        return Ok(Json(UploadResponse {
            file_url: format!("{}/api/chat/files/{}", state.config.public_url, stored.id),
            file_name: stored.name,
            file_size: stored.size,
            file_type: stored.content_type,
        }));
    }

    Err(ServerError::BadRequest(
        "Missing 'file' field in multipart form".to_string(),
    ))
}

async fn download(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServerError> {
    let (meta, data) = state.blob_store.get_file(id).await?;

    let content_type = HeaderValue::from_str(&meta.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let disposition = HeaderValue::from_str(&format!("inline; filename=\"{}\"", meta.name))
        .unwrap_or_else(|_| HeaderValue::from_static("inline"));

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        data,
    )
        .into_response())
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(state, listener).await
}

/// Serve on an already bound listener.
pub async fn serve_on(state: AppState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %listener.local_addr()?, "Starting HTTP API server");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use skytalk_store::User;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn test_state_with(config: ServerConfig) -> (AppState, SqliteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            blob_storage_path: dir.path().join("uploads"),
            ..config
        };
        let store = SqliteStore::in_memory().unwrap();
        let state = AppState::build(config, store.clone()).await.unwrap();
        (state, store, dir)
    }

    async fn test_state() -> (AppState, SqliteStore, TempDir) {
        test_state_with(ServerConfig::default()).await
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_build_wires_shared_presence() {
        let (state, _store, _dir) = test_state().await;
        assert!(Arc::ptr_eq(&state.presence, state.relay.presence()));
    }

    #[tokio::test]
    async fn test_health_and_info() {
        let (state, _store, _dir) = test_state().await;
        let router = build_router(state);

        let resp = router
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");

        let resp = router
            .oneshot(Request::get("/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let info = body_json(resp).await;
        assert_eq!(info["name"], "SkyTalk");
        assert_eq!(info["onlineUsers"], 0);
        assert_eq!(info["reconnect"]["maxAttempts"], 5);
        assert_eq!(info["reconnect"]["initialDelayMs"], 1000);
    }

    #[tokio::test]
    async fn test_chat_routes_require_credential() {
        let (state, _store, _dir) = test_state().await;
        let resp = build_router(state)
            .oneshot(
                Request::get("/api/chat/conversations")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error"], "No token provided");
    }

    #[tokio::test]
    async fn test_expired_credential_is_flagged() {
        let (state, _store, _dir) = test_state_with(ServerConfig {
            access_token_ttl_secs: -5,
            ..ServerConfig::default()
        })
        .await;
        let token = state.verifier.issue_access(UserId::new()).unwrap();

        let resp = build_router(state)
            .oneshot(
                Request::get("/api/auth/me")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["expired"], true);
    }

    #[tokio::test]
    async fn test_upload_and_download() {
        let (state, store, _dir) = test_state().await;
        let user = User::new("alice");
        let token = state.verifier.issue_access(user.id).unwrap();
        store.insert_user(user).await.unwrap();

        let boundary = "skytalk-boundary";
        let multipart = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"notes.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             hello\r\n\
             --{boundary}--\r\n"
        );
        let router = build_router(state);
        let resp = router
            .clone()
            .oneshot(
                Request::post("/api/chat/upload")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .header(
                        header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(multipart))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let uploaded = body_json(resp).await;
        assert_eq!(uploaded["fileName"], "notes.txt");
        assert_eq!(uploaded["fileSize"], 5);
        assert_eq!(uploaded["fileType"], "text/plain");

        let url = uploaded["fileUrl"].as_str().unwrap();
        let path = url.trim_start_matches("http://localhost:4000");
        let resp = router
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/plain");
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn test_delete_route_enforces_participants() {
        let (state, store, _dir) = test_state().await;
        let alice = User::new("alice");
        let bob = User::new("bob");
        let carol = User::new("carol");
        for user in [&alice, &bob, &carol] {
            store.insert_user(user.clone()).await.unwrap();
        }
        let sent = state
            .messages
            .insert(skytalk_store::NewMessage::text(alice.id, bob.id, "hi"))
            .await
            .unwrap();
        let carol_token = state.verifier.issue_access(carol.id).unwrap();
        let bob_token = state.verifier.issue_access(bob.id).unwrap();
        let router = build_router(state);

        let delete = |token: &str| {
            Request::post(format!("/api/chat/delete-message/{}", sent.id))
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap()
        };

        let resp = router.clone().oneshot(delete(&carol_token)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = router.clone().oneshot(delete(&bob_token)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["deletedBy"], "receiver");

        let resp = router.oneshot(delete(&bob_token)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    fn register_request(username: &str) -> Request<Body> {
        Request::post("/api/auth/register")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({ "username": username }).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_issues_usable_credentials() {
        let (state, _store, _dir) = test_state().await;
        let router = build_router(state);

        let resp = router.clone().oneshot(register_request("  dana ")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["user"]["username"], "dana");
        let token = body["accessToken"].as_str().unwrap().to_string();
        assert!(body["refreshToken"].is_string());

        let resp = router
            .clone()
            .oneshot(
                Request::get("/api/auth/me")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["id"], body["user"]["id"]);

        let resp = router.clone().oneshot(register_request("dana")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = router.oneshot(register_request("ab")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_register_can_be_disabled() {
        let (state, _store, _dir) = test_state_with(ServerConfig {
            allow_registration: false,
            ..ServerConfig::default()
        })
        .await;
        let resp = build_router(state)
            .oneshot(register_request("dana"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
