use std::time::{Duration, Instant};

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::{AuthError, AuthGateway, MessageResponse, NewUser};
use crate::relay::{RelayState, SensorPayload};

#[derive(Clone)]
pub struct AppState {
    pub relay: RelayState,
    pub auth: AuthGateway,
}

/// Liveness settings for real-time connections.
#[derive(Debug, Clone, Copy)]
pub struct SocketConfig {
    pub ping_interval: Duration,
    pub send_timeout: Duration,
}

impl SocketConfig {
    /// A client silent for this long (no pong or any other frame) is dropped.
    pub fn idle_timeout(&self) -> Duration {
        self.ping_interval.saturating_mul(2)
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            send_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
struct SocketState {
    relay: RelayState,
    config: SocketConfig,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct SensorDataResponse {
    temperature: Option<String>,
}

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Serialize)]
struct TokenResponse {
    token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    user_id: i64,
}

#[derive(Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    phone: Option<String>,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn sensor_data(State(state): State<AppState>) -> Json<SensorDataResponse> {
    Json(SensorDataResponse {
        temperature: state.relay.current().map(|p| p.to_text()),
    })
}

async fn login(
    State(state): State<AppState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, AuthError> {
    let Json(req) = body.map_err(|e| {
        tracing::debug!("unreadable login body: {}", e);
        AuthError::MissingCredentials
    })?;
    let username = req.username.unwrap_or_default();
    let password = req.password.unwrap_or_default();
    let token = state.auth.login(&username, &password).await?;
    Ok(Json(TokenResponse { token }))
}

async fn profile(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ProfileResponse>, AuthError> {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let user_id = state.auth.authenticate(authorization)?;
    Ok(Json(ProfileResponse { user_id }))
}

async fn register(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AuthError> {
    let Json(req) = body.map_err(|e| {
        tracing::debug!("unreadable registration body: {}", e);
        AuthError::MissingFields
    })?;
    let user = state
        .auth
        .register(NewUser {
            username: req.username.unwrap_or_default(),
            email: req.email.unwrap_or_default(),
            password: req.password.unwrap_or_default(),
            phone: req.phone,
        })
        .await?;
    tracing::info!(user_id = user.id, username = %user.username, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            message: "User registered successfully".into(),
        }),
    ))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<SocketState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state.relay, state.config))
}

fn frame(payload: &SensorPayload) -> Message {
    match payload.as_str() {
        Some(text) => Message::Text(text.to_owned().into()),
        None => Message::Binary(payload.as_bytes().clone()),
    }
}

/// Serve one real-time client until it leaves, fails, or the relay shuts down.
async fn handle_ws(socket: WebSocket, relay: RelayState, config: SocketConfig) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let subscription = relay.attach();
    let id = subscription.id;
    let mut queue = subscription.rx;
    tracing::info!(subscriber = %id, "websocket connection established");

    // Time of the last inbound frame, pongs included
    let (seen_tx, seen_rx) = watch::channel(Instant::now());

    // Task: relay queue -> WebSocket, pinging and dropping peers that stop answering
    let mut tx_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(config.ping_interval);
        ping.tick().await;
        loop {
            let msg = tokio::select! {
                next = queue.recv() => match next {
                    Some(payload) => frame(&payload),
                    // Queue closed: relay is shutting down.
                    None => Message::Close(None),
                },
                _ = ping.tick() => {
                    let idle = seen_rx.borrow().elapsed();
                    if idle > config.idle_timeout() {
                        tracing::debug!(subscriber = %id, ?idle, "client stopped answering pings");
                        break;
                    }
                    Message::Ping(Default::default())
                }
            };
            let closing = matches!(msg, Message::Close(_));
            match tokio::time::timeout(config.send_timeout, ws_tx.send(msg)).await {
                Ok(Ok(())) if !closing => {}
                Ok(Ok(())) => break,
                Ok(Err(e)) => {
                    tracing::debug!(subscriber = %id, "send failed: {}", e);
                    break;
                }
                Err(_) => {
                    tracing::debug!(subscriber = %id, "send timed out");
                    break;
                }
            }
        }
    });

    // Task: inbound frames are logged and otherwise ignored
    let mut rx_task = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            if msg.is_ok() {
                seen_tx.send_replace(Instant::now());
            }
            match msg {
                Ok(Message::Text(text)) => {
                    tracing::debug!(subscriber = %id, message = %text.as_str(), "message from client")
                }
                Ok(Message::Binary(data)) => {
                    tracing::debug!(subscriber = %id, len = data.len(), "binary message from client")
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(subscriber = %id, "websocket error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut tx_task => rx_task.abort(),
        _ = &mut rx_task => tx_task.abort(),
    }

    relay.detach(id);
    tracing::info!(subscriber = %id, "websocket connection closed");
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sensor-data", get(sensor_data))
        .route("/login", post(login))
        .route("/profile", get(profile))
        .route("/api/users/register", post(register))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for the real-time channel; clients may upgrade at `/` or `/ws`.
pub fn ws_router(relay: RelayState, config: SocketConfig) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(SocketState { relay, config })
}
