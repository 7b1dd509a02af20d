//! Realtime Session Manager
//!
//! Authenticates each WebSocket connection before the upgrade, binds the
//! identity to the connection for its lifetime, keeps the presence registry
//! in sync and routes client events to the relay.
//!
//! Events of one connection are handled strictly one after another. Each
//! relay call runs in its own task so a panic inside it is reported to the
//! client instead of taking the connection down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use skytalk_shared::constants::{DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_PING_INTERVAL_SECS};
use skytalk_shared::protocol::{ClientEvent, ServerEvent};
use skytalk_shared::{RelayError, UserId};

use crate::auth::{bearer_token, AuthError, IdentityVerifier, UserIdentity};
use crate::error::ServerError;
use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::rate_limit::RateLimiter;
use crate::relay::Relay;
use crate::store::UserDirectory;

#[derive(Clone)]
pub struct SessionManager {
    verifier: Arc<IdentityVerifier>,
    users: Arc<dyn UserDirectory>,
    relay: Relay,
    limiter: RateLimiter<UserId>,
    typing_timeout: Duration,
    ping_interval: Duration,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        verifier: Arc<IdentityVerifier>,
        users: Arc<dyn UserDirectory>,
        relay: Relay,
        limiter: RateLimiter<UserId>,
        typing_timeout: Duration,
    ) -> Self {
        Self {
            verifier,
            users,
            relay,
            limiter,
            typing_timeout,
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }

    /// Server pings go out every `ping_interval`; a connection that sends
    /// nothing (pongs included) for `idle_timeout` is dropped.
    pub fn with_keep_alive(mut self, ping_interval: Duration, idle_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.idle_timeout = idle_timeout;
        self
    }

    fn presence(&self) -> &Arc<PresenceRegistry> {
        self.relay.presence()
    }

    /// Handshake: verify the credential and resolve it to an account.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<UserIdentity, AuthError> {
        let token = credential.ok_or(AuthError::MissingCredential)?;
        let user = self.verifier.verify_access(token)?;
        self.users
            .find_user(user)
            .await
            .map_err(|e| AuthError::DirectoryUnavailable(e.to_string()))?
            .ok_or(AuthError::UnknownUser)
    }

    /// Register a freshly authenticated connection and announce it.
    pub fn open(&self, identity: UserIdentity) -> (Session, mpsc::Receiver<ServerEvent>) {
        let (handle, rx) = ConnectionHandle::new(identity);
        let user = handle.user_id();

        if let Some(previous) = self.presence().register(handle.clone()) {
            info!(
                user = %user,
                replaced = %previous.handle.id,
                connected_at = %previous.connected_at,
                "Replaced existing connection"
            );
        }

        let notified = self
            .presence()
            .broadcast_except(user, &ServerEvent::user_online(user));
        info!(user = %user, conn = %handle.id, notified, "User online");

        let session = Session {
            manager: self.clone(),
            handle,
            typing: HashMap::new(),
        };
        (session, rx)
    }
}

/// State owned by one active connection.
pub struct Session {
    manager: SessionManager,
    handle: ConnectionHandle,
    typing: HashMap<UserId, JoinHandle<()>>,
}

impl Session {
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub async fn handle_frame(&mut self, frame: &str) {
        match ClientEvent::decode(frame) {
            Ok(event) => self.handle_event(event).await,
            Err(err) => self.reject(err),
        }
    }

    pub async fn handle_event(&mut self, event: ClientEvent) {
        let user = self.handle.user_id();
        if !self.manager.limiter.check(user).await {
            debug!(user = %user, event = event.name(), "Event rate limited");
            self.reject(RelayError::RateLimited);
            return;
        }

        let name = event.name();
        let result = match event {
            ClientEvent::SendMessage(payload) => {
                let relay = self.manager.relay.clone();
                let origin = self.handle.clone();
                isolated(async move { relay.send_message(&origin, payload).await })
                    .await
                    .map(|outcome| self.clear_typing(outcome.message.receiver_id))
            }
            ClientEvent::Typing(target) => self
                .manager
                .relay
                .typing(&self.handle.identity, &target.receiver_id, true)
                .map(|receiver| self.arm_typing(receiver)),
            ClientEvent::StopTyping(target) => self
                .manager
                .relay
                .typing(&self.handle.identity, &target.receiver_id, false)
                .map(|receiver| {
                    if let Some(timer) = self.typing.remove(&receiver) {
                        timer.abort();
                    }
                }),
            ClientEvent::DeleteMessage(payload) => {
                let relay = self.manager.relay.clone();
                let origin = self.handle.clone();
                isolated(async move {
                    relay
                        .delete_message(origin.user_id(), &payload.message_id, Some(&origin))
                        .await
                })
                .await
                .map(|_| ())
            }
        };

        if let Err(err) = result {
            debug!(user = %user, event = name, error = %err, "Event failed");
            self.reject(err);
        }
    }

    /// Report a failure to this connection only.
    pub fn reject(&self, err: RelayError) {
        self.handle.send(err.into());
    }

    /// (Re)start the safety timer that clears a stale typing indicator.
    fn arm_typing(&mut self, receiver: UserId) {
        if let Some(previous) = self.typing.remove(&receiver) {
            previous.abort();
        }

        let relay = self.manager.relay.clone();
        let sender = self.handle.identity.clone();
        let timeout = self.manager.typing_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            relay.forward_typing(&sender, receiver, false);
        });
        self.typing.insert(receiver, timer);
    }

    /// A delivered message ends the sender's typing indicator.
    fn clear_typing(&mut self, receiver: UserId) {
        if let Some(timer) = self.typing.remove(&receiver) {
            if !timer.is_finished() {
                timer.abort();
                self.manager
                    .relay
                    .forward_typing(&self.handle.identity, receiver, false);
            }
        }
    }

    /// Tear the session down: cancel typing timers, leave the registry and
    /// announce the user offline if this connection was still the active one.
    pub async fn close(mut self) {
        let user = self.handle.user_id();

        let receivers: Vec<UserId> = self.typing.keys().copied().collect();
        for receiver in receivers {
            self.clear_typing(receiver);
        }

        let presence = Arc::clone(self.manager.presence());
        if presence.unregister(user, self.handle.id) {
            self.manager.limiter.forget(&user).await;
            let notified = presence.broadcast_except(user, &ServerEvent::user_offline(user));
            info!(user = %user, conn = %self.handle.id, notified, "User offline");
        } else {
            debug!(user = %user, conn = %self.handle.id, "Closed replaced connection");
        }
    }
}

/// Run a handler on its own task so that a panic becomes an error event.
async fn isolated<T, F>(handler: F) -> Result<T, RelayError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, RelayError>> + Send + 'static,
{
    match tokio::spawn(handler).await {
        Ok(result) => result,
        Err(join) => {
            error!(error = %join, "Event handler panicked");
            Err(RelayError::Internal)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// `GET /ws`: authenticate, then upgrade. Failed handshakes never reach the
/// presence registry.
pub async fn ws_handler(
    State(sessions): State<SessionManager>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let credential = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
        .or(params.token);

    match sessions.authenticate(credential.as_deref()).await {
        Ok(identity) => {
            info!(user = %identity.id, username = %identity.username, "Handshake accepted");
            ws.on_upgrade(move |socket| run_connection(sessions, identity, socket))
        }
        Err(err) => {
            warn!(error = %err, "Handshake rejected");
            ServerError::from(err).into_response()
        }
    }
}

/// Drive one upgraded connection until the transport closes or goes quiet.
pub async fn run_connection(sessions: SessionManager, identity: UserIdentity, socket: WebSocket) {
    let (mut sink, stream) = socket.split();
    let ping_interval = sessions.ping_interval;
    let idle_timeout = sessions.idle_timeout;
    let (session, mut rx) = sessions.open(identity);
    let conn = session.handle().id;

    let writer = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + ping_interval;
        let mut ping = tokio::time::interval_at(start, ping_interval);
        loop {
            let outbound = tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    match event.encode() {
                        Ok(text) => Message::Text(text),
                        Err(e) => {
                            error!(error = %e, event = event.name(), "Failed to encode event");
                            continue;
                        }
                    }
                }
                _ = ping.tick() => Message::Ping(Vec::new()),
            };
            if sink.send(outbound).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    read_frames(session, stream, idle_timeout).await;
    if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
        debug!(conn = %conn, "Writer did not drain in time");
    }
}

/// Feed inbound frames to the session, then close it. Half-open transports
/// are caught by `idle_timeout`.
async fn read_frames<S, E>(mut session: Session, mut stream: S, idle_timeout: Duration)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let conn = session.handle().id;
    loop {
        let frame = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(_) => {
                warn!(conn = %conn, user = %session.handle().user_id(), "Idle timeout");
                break;
            }
        };
        match frame {
            Ok(Message::Text(text)) => session.handle_frame(&text).await,
            Ok(Message::Binary(_)) => {
                session.reject(RelayError::validation("binary frames are not supported"))
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn = %conn, error = %e, "Transport error");
                break;
            }
        }
    }

    session.close().await;
}
