//! WebSocket server + REST endpoints for workers and dispatch observers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        ConnectInfo, Path, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatcher::{CLOSE_NORMAL, Dispatcher};
use super::model::DispatchEvent;
use super::registry::{Outbound, WorkerConnection};
use super::router;
use crate::error::{DispatchError, Result};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

/// Build the Axum router with worker/event WebSockets and REST routes.
pub fn dispatch_routes(dispatcher: Arc<Dispatcher>) -> Router {
    let state = AppState { dispatcher };

    Router::new()
        .route("/ws", get(worker_ws_handler))
        .route("/ws/events", get(events_ws_handler))
        .route("/health", get(health))
        .route("/api/stats", get(get_stats))
        .route("/api/workers", get(list_workers))
        .route("/api/tasks", post(submit_task))
        .route("/api/tasks/{id}", delete(cancel_task))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the dispatch routes on `listener` until the dispatcher shuts down.
pub async fn serve(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let shutdown = dispatcher.shutdown_signal();
    let app = dispatch_routes(dispatcher);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "agent-dispatch"
    }))
}

// ── Worker WebSocket ────────────────────────────────────────────────────

async fn worker_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    info!(origin = %addr, "Worker connecting");
    ws.on_upgrade(move |socket| handle_worker_socket(socket, state.dispatcher, addr.to_string()))
}

async fn handle_worker_socket(mut socket: WebSocket, dispatcher: Arc<Dispatcher>, origin: String) {
    let (connection, mut outbound) = WorkerConnection::channel();

    let worker_id = match dispatcher.connect(connection, Some(origin)).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Refusing worker connection");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_NORMAL,
                    reason: "Server shutdown".into(),
                })))
                .await;
            return;
        }
    };

    let mut close_code: Option<u16> = None;
    let mut close_reason = "connection closed".to_string();

    loop {
        tokio::select! {
            // Frames queued by the dispatcher for this worker
            frame = outbound.recv() => {
                match frame {
                    Some(Outbound::Message(msg)) => {
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(worker_id = %worker_id, error = %e, "Failed to encode message");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            close_reason = "send failed".to_string();
                            break;
                        }
                    }
                    Some(Outbound::Ping) => {
                        if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                            close_reason = "ping failed".to_string();
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.clone().into(),
                            })))
                            .await;
                        close_code = Some(code);
                        close_reason = reason;
                        break;
                    }
                    None => break,
                }
            }

            // Frames from the worker, handled in arrival order
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        router::route_message(&dispatcher, worker_id, text.as_str()).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        dispatcher.heartbeat(worker_id).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            close_reason = "pong failed".to_string();
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(frame) = frame {
                            close_code = Some(frame.code);
                            close_reason = frame.reason.as_str().to_string();
                        }
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(worker_id = %worker_id, "Ignoring binary frame");
                    }
                    Some(Err(e)) => {
                        warn!(worker_id = %worker_id, error = %e, "WebSocket error");
                        close_reason = e.to_string();
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    dispatcher
        .disconnect(worker_id, close_code, close_reason)
        .await;
}

// ── Event WebSocket ─────────────────────────────────────────────────────

async fn events_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_events_socket(socket, state.dispatcher))
}

async fn send_stats(socket: &mut WebSocket, dispatcher: &Dispatcher) -> bool {
    let snapshot = DispatchEvent::Stats {
        stats: dispatcher.stats().await,
    };
    match serde_json::to_string(&snapshot) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => true,
    }
}

async fn handle_events_socket(mut socket: WebSocket, dispatcher: Arc<Dispatcher>) {
    debug!("Event subscriber connected");

    // Subscribe before the snapshot so nothing falls between them
    let mut rx = dispatcher.subscribe();
    if !send_stats(&mut socket, &dispatcher).await {
        return;
    }

    let shutdown = dispatcher.shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Event subscriber lagged behind broadcast");
                        if !send_stats(&mut socket, &dispatcher).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }

            _ = &mut shutdown => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_NORMAL,
                        reason: "Server shutdown".into(),
                    })))
                    .await;
                break;
            }
        }
    }

    debug!("Event subscriber disconnected");
}

// ── REST Endpoints ──────────────────────────────────────────────────────

async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.dispatcher.stats().await)
}

async fn list_workers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.dispatcher.workers().await)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitTaskRequest {
    #[serde(default)]
    required_capabilities: Vec<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

async fn submit_task(
    State(state): State<AppState>,
    Json(body): Json<SubmitTaskRequest>,
) -> impl IntoResponse {
    let handle = state
        .dispatcher
        .submit_task(body.required_capabilities, body.payload)
        .await;
    let task_id = handle.task_id();

    match handle.await {
        Ok(response) => (
            StatusCode::OK,
            Json(serde_json::json!({"taskId": task_id, "response": response})),
        ),
        Err(e) => {
            let status = match e {
                DispatchError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
                DispatchError::Cancelled { .. } => StatusCode::CONFLICT,
                _ => StatusCode::BAD_GATEWAY,
            };
            (
                status,
                Json(serde_json::json!({"taskId": task_id, "error": e.to_string()})),
            )
        }
    }
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let task_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid task ID"})),
            );
        }
    };

    if state.dispatcher.cancel(task_id).await {
        (
            StatusCode::OK,
            Json(serde_json::json!({"status": "cancelled"})),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Task not found or already finished"})),
        )
    }
}
