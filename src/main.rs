use std::time::Duration;

use clap::Parser;
use sensor_relay::{
    api,
    auth::{AuthGateway, TokenService, UserStore, UserStoreError},
    config::{Config, ConfigError},
    mqtt::{BrokerSubscription, EVENT_CHANNEL_CAPACITY},
    relay::{FanoutRelay, RelayState},
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("user store error: {0}")]
    UserStore(#[from] UserStoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sensor_relay=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    config.validate()?;
    tracing::info!("sensor-relay starting");

    let relay = RelayState::new(config.subscriber_queue);

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let relay_task = FanoutRelay::new(relay.clone(), event_rx).spawn();
    let broker_task = BrokerSubscription::new(config.broker(), event_tx).spawn();

    let users = UserStore::open(&config.database_path)?;
    tracing::info!(path = %config.database_path, "user store opened");
    let tokens = TokenService::new(config.jwt_secret.as_bytes(), config.token_ttl());
    let state = api::AppState {
        relay: relay.clone(),
        auth: AuthGateway::new(users, tokens),
    };

    let http_addr = config.http_addr()?;
    let ws_addr = config.ws_addr()?;
    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    let ws_listener = tokio::net::TcpListener::bind(ws_addr).await?;
    tracing::info!(%http_addr, "HTTP API listening");
    tracing::info!(%ws_addr, "WebSocket server listening");

    let (stop_tx, stop_rx) = watch::channel(false);

    let http = axum::serve(http_listener, api::router(state))
        .with_graceful_shutdown(stopped(stop_rx.clone()));
    let ws = axum::serve(ws_listener, api::ws_router(relay.clone(), config.socket()))
        .with_graceful_shutdown(stopped(stop_rx));

    let http_task = tokio::spawn(async move { http.await });
    let ws_task = tokio::spawn(async move { ws.await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    relay.shutdown();
    let _ = stop_tx.send(true);
    if tokio::time::timeout(SHUTDOWN_GRACE, relay.wait_for_drained())
        .await
        .is_err()
    {
        tracing::warn!(remaining = relay.subscriber_count(), "subscribers did not close in time");
    }

    broker_task.abort();
    relay_task.abort();
    for task in [http_task, ws_task] {
        match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
            Ok(Ok(Err(e))) => tracing::error!("server error: {}", e),
            Ok(_) => {}
            Err(_) => tracing::warn!("server did not stop in time"),
        }
    }

    tracing::info!("sensor-relay stopped");
    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
