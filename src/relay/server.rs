use std::future::Future;
use std::net::SocketAddr;

use anyhow::Result;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use colored::*;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use super::hub::{HubStats, RelayHub};
use crate::config::RelayConfig;

#[derive(Clone)]
pub struct AppState {
    pub hub: RelayHub,
    pub started_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    hub: HubStats,
    echo_policy: super::EchoPolicy,
    started_at: DateTime<Utc>,
}

pub fn router(hub: RelayHub) -> Router {
    let state = AppState {
        hub,
        started_at: Utc::now(),
    };

    Router::new()
        .route("/", get(|| async { "Geoshare Relay" }))
        .route("/health", get(|| async { Json("OK") }))
        .route("/stats", get(get_stats))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(config: &RelayConfig) -> Result<()> {
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    let hub = RelayHub::new(config.echo_policy);

    println!(
        "{} Relay running at {}",
        "✓".green(),
        format!("ws://{}/ws", addr).bright_blue()
    );

    serve_with_shutdown(listener, hub, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_with_shutdown<F>(listener: TcpListener, hub: RelayHub, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local: SocketAddr = listener.local_addr()?;
    tracing::info!(%local, echo = ?hub.echo_policy(), "relay listening");

    axum::serve(listener, router(hub))
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("relay stopped");
    Ok(())
}

async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(state, socket))
}

async fn handle_ws(state: AppState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut rx) = state.hub.on_connect();

    // Forward relayed frames to this participant
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame.as_ref().into())).await.is_err() {
                break;
            }
        }
    });

    // Receive from the participant and fan out
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                state.hub.on_message(conn_id, text.as_str());
            }
            Ok(Message::Binary(bin)) => match std::str::from_utf8(&bin) {
                Ok(text) => {
                    state.hub.on_message(conn_id, text);
                }
                Err(_) => tracing::debug!(connection = %conn_id, "dropping non-utf8 binary frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                tracing::debug!(connection = %conn_id, "websocket error: {e}");
                break;
            }
        }
    }

    state.hub.on_disconnect(conn_id);
    send_task.abort();
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        hub: state.hub.stats(),
        echo_policy: state.hub.echo_policy(),
        started_at: state.started_at,
    })
}
