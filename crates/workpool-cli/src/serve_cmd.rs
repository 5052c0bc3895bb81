use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use workpool_core::coordinator::{Coordinator, CoordinatorConfig, CoordinatorHandle};
use workpool_core::engine::PoolEngine;
use workpool_core::protocol::{ClientMessage, Message, ProtocolError, decode};
use workpool_core::transport::BroadcastTransport;
use workpool_core::worker::SimulatedWorker;

use crate::config::WorkpoolConfig;

const INDEX_HTML: &str = include_str!("../assets/index.html");

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn unavailable(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub coordinator: CoordinatorHandle,
    pub transport: Arc<BroadcastTransport>,
    /// Cancelled on server shutdown; open sockets close when it fires.
    pub shutdown: CancellationToken,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/api/status", get(status_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(config: WorkpoolConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.bind, config.port))?;

    let transport = Arc::new(BroadcastTransport::default());
    let coordinator = Coordinator::new(
        Arc::new(PoolEngine::new(config.pool_size)),
        Arc::new(SimulatedWorker::new(config.simulation.clone())),
        transport.clone(),
        CoordinatorConfig {
            poll_backoff: config.poll_backoff,
        },
    );
    let (handle, task) = coordinator.spawn();

    let shutdown = CancellationToken::new();
    install_signal_handler(shutdown.clone());

    let app = build_router(AppState {
        coordinator: handle.clone(),
        transport,
        shutdown: shutdown.clone(),
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        pool_size = config.pool_size,
        "workpool serve listening on http://{addr}"
    );
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;

    // Also reached when serving fails: sockets and the pool go down either way.
    shutdown.cancel();
    handle.stop();
    if let Err(e) = task.await {
        tracing::error!(error = %e, "coordinator task failed");
    }
    served?;
    tracing::info!("workpool serve shut down");
    Ok(())
}

/// First Ctrl+C cancels `shutdown`; a second one exits immediately.
fn install_signal_handler(shutdown: CancellationToken) {
    let got_first_signal = Arc::new(AtomicBool::new(false));
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            shutdown.cancel();
        }
    });
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn status_handler(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    let status = state
        .coordinator
        .status()
        .await
        .map_err(AppError::unavailable)?;
    Ok(Json(status).into_response())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Pump one observer connection: every broadcast goes out as a text frame,
/// every inbound text frame is treated as a client request.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let mut events = BroadcastStream::new(state.transport.subscribe());
    tracing::info!(
        observers = state.transport.observer_count(),
        "observer connected"
    );

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
            event = events.next() => match event {
                Some(Ok(msg)) => {
                    let text = match msg.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(error = %e, ?msg, "failed to encode event");
                            continue;
                        }
                    };
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "observer lagging; events dropped");
                }
                None => break,
            },
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    // Bad frames are dropped; the connection stays open.
                    if let Ok(msg) = handle_client_text(&state.coordinator, text.as_str()) {
                        tracing::trace!(op = msg.op(), "frame forwarded");
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "websocket receive failed");
                    break;
                }
            },
        }
    }
    tracing::info!("observer disconnected");
}

/// Decode one inbound frame and hand it to the coordinator.
pub fn handle_client_text(
    coordinator: &CoordinatorHandle,
    text: &str,
) -> Result<ClientMessage, ProtocolError> {
    let msg = decode::<ClientMessage>(text).inspect_err(|e| {
        tracing::warn!(error = %e, frame = text, "discarding malformed client message");
    })?;
    tracing::debug!(op = msg.op(), "client request");
    if let Err(e) = coordinator.send(msg) {
        tracing::warn!(error = %e, "client request dropped");
    }
    Ok(msg)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use workpool_core::coordinator::{Coordinator, CoordinatorConfig};
    use workpool_core::protocol::{ClientMessage, ProtocolError};
    use workpool_core::transport::BroadcastTransport;
    use workpool_core::worker::Worker;
    use workpool_test_utils::ManualEngine;

    use super::{AppState, build_router, handle_client_text};

    fn state() -> (AppState, Arc<ManualEngine>) {
        let engine = Arc::new(ManualEngine::new());
        let transport = Arc::new(BroadcastTransport::default());
        let worker: Arc<dyn Worker> =
            Arc::new(|_: u64, _: workpool_core::channel::WorkerEnd| {});
        let (coordinator, _task) = Coordinator::new(
            engine.clone(),
            worker,
            transport.clone(),
            CoordinatorConfig::default(),
        )
        .spawn();
        (
            AppState {
                coordinator,
                transport,
                shutdown: tokio_util::sync::CancellationToken::new(),
            },
            engine,
        )
    }

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    async fn send_request(state: AppState, uri: &str) -> axum::response::Response {
        let app = build_router(state);
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_index_returns_html() {
        let (state, _engine) = state();

        let resp = send_request(state, "/").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .expect("should have content-type header")
            .to_str()
            .unwrap();
        assert!(
            content_type.contains("text/html"),
            "content-type should contain text/html, got: {content_type}"
        );
    }

    #[tokio::test]
    async fn test_status_starts_empty() {
        let (state, _engine) = state();

        let resp = send_request(state, "/api/status").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            serde_json::json!({ "completed": 0, "active": 0, "queued": 0 })
        );
    }

    #[tokio::test]
    async fn test_status_reflects_queued_jobs() {
        let (state, engine) = state();
        handle_client_text(&state.coordinator, r#"{"op":"start"}"#).unwrap();
        handle_client_text(&state.coordinator, r#"{"op":"start"}"#).unwrap();

        let resp = send_request(state, "/api/status").await;
        let json = body_json(resp).await;
        assert_eq!(json["queued"], 2);
        assert_eq!(engine.submitted(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_status_unavailable_after_stop() {
        let (state, _engine) = state();
        state.coordinator.stop();
        // Let the control loop exit.
        while !state.coordinator.is_closed() {
            tokio::task::yield_now().await;
        }

        let resp = send_request(state, "/api/status").await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_json(resp).await.get("error").is_some());
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let (state, _engine) = state();
        let resp = send_request(state, "/ws").await;
        assert!(
            resp.status().is_client_error(),
            "plain GET on /ws should be rejected, got {}",
            resp.status()
        );
    }

    #[tokio::test]
    async fn test_client_text_is_decoded_and_forwarded() {
        let (state, engine) = state();
        let msg = handle_client_text(&state.coordinator, r#"{"op":"cancel","id":3}"#).unwrap();
        assert_eq!(msg, ClientMessage::Cancel { id: Some(3) });

        handle_client_text(&state.coordinator, r#"{"op":"start"}"#).unwrap();
        state.coordinator.status().await.unwrap();
        assert_eq!(engine.submitted(), vec![1]);
    }

    #[tokio::test]
    async fn test_malformed_client_text_is_discarded() {
        let (state, engine) = state();
        for frame in [
            "not json",
            r#"{"op":"launch"}"#,
            r#"{"id":1}"#,
            r#"{"op":"cancel","id":"one"}"#,
        ] {
            assert!(handle_client_text(&state.coordinator, frame).is_err(), "{frame}");
        }
        assert!(matches!(
            handle_client_text(&state.coordinator, r#"{"op":"launch"}"#),
            Err(ProtocolError::UnknownOp(op)) if op == "launch"
        ));

        let status = state.coordinator.status().await.unwrap();
        assert_eq!(status.queued, 0);
        assert!(engine.submitted().is_empty());
    }
}
