//! The `weavesync-server` binary: wires the sync kernel to a WebSocket
//! transport via axum.
//!
//! Grounded on `enterprise::realtime::{gateway, connection}` for the
//! WebSocket-upgrade-then-per-connection-task shape; the HTTP surface beyond
//! `/ws` and `/metrics` (application auth, routing) is out of scope (§1) —
//! this binary exists to give the kernel a runnable home, not to be a
//! complete application server.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use weavesync::policy::{AiSanitizationPolicy, CanonMark, PolicyManifest};
use weavesync::protocol::{self, ErrorCode, Payload};
use weavesync::storage::{FileBacked, InMemory, OsFileSystem, StorageBackend};
use weavesync::sync::auth::DefaultAuthAdapter;
use weavesync::sync::server::{
    spawn_background_tasks, HandshakeRejection, ServerConfig, SyncServer, CLOSE_HANDSHAKE_TIMEOUT,
    CLOSE_POLICY_VIOLATION,
};
use weavesync::sync::SinkMessage;

#[derive(Clone)]
struct AppState {
    server: Arc<SyncServer>,
    config: ServerConfig,
}

fn default_server_manifest() -> PolicyManifest {
    PolicyManifest {
        policy_id: "weave:v1".to_string(),
        ai_sanitization_policy: AiSanitizationPolicy {
            allowed_marks: [
                CanonMark::Bold,
                CanonMark::Italic,
                CanonMark::Underline,
                CanonMark::Code,
                CanonMark::Link,
            ]
            .into_iter()
            .collect(),
            allowed_block_types: ["paragraph", "heading", "bullet_list", "code_block"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        },
        max_update_size: 10 * 1024 * 1024,
        protocol_features: BTreeSet::new(),
        presence_ttl_ms: 30_000,
    }
}

fn build_storage() -> Arc<dyn StorageBackend> {
    match std::env::var("WEAVESYNC_STORAGE_DIR") {
        Ok(dir) => {
            tracing::info!(dir, "using file-backed storage");
            Arc::new(FileBacked::new(dir, OsFileSystem))
        }
        Err(_) => {
            tracing::info!("WEAVESYNC_STORAGE_DIR unset; using in-memory storage");
            Arc::new(InMemory::new())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = ServerConfig::default();
    let storage = build_storage();
    let server = Arc::new(
        SyncServer::new(
            config.clone(),
            default_server_manifest(),
            storage,
            Arc::new(DefaultAuthAdapter),
            Arc::new(weavesync::audit::InMemoryOperationLog::new()),
        )
        .expect("server manifest is a crate-defined constant and always validates"),
    );

    let background = {
        let server_for_docs = server.clone();
        spawn_background_tasks(server.clone(), move || server_for_docs.doc_ids())
    };

    let state = AppState { server: server.clone(), config };
    let app = Router::new()
        .route("/ws/:doc_id", get(ws_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr: SocketAddr = std::env::var("WEAVESYNC_ADDR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8787)));

    tracing::info!(%addr, "weavesync-server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    for handle in background {
        handle.abort();
    }
    server.shutdown().await;
    Ok(())
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.server.metrics().render_prometheus()
}

async fn ws_handler(
    Path(doc_id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, doc_id, state))
}

/// Drive one client connection end to end: enforce the handshake timeout,
/// then dispatch every subsequent frame to the kernel until the socket
/// closes.
async fn handle_socket(socket: WebSocket, doc_id: String, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SinkMessage>();

    let forward_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            match message {
                SinkMessage::Frame(envelope) => {
                    let Ok(raw) = protocol::serialize_envelope(&envelope) else {
                        continue;
                    };
                    if ws_tx.send(Message::Text(raw)).await.is_err() {
                        break;
                    }
                }
                SinkMessage::Close(code) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                            code,
                            reason: std::borrow::Cow::Borrowed(""),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let temp_id = Uuid::new_v4().to_string();
    let handshake_timeout = Duration::from_millis(state.config.handshake_timeout_ms);

    let first_frame = tokio::time::timeout(handshake_timeout, next_text_frame(&mut ws_rx)).await;
    let raw = match first_frame {
        Ok(Some(raw)) => raw,
        Ok(None) => {
            forward_task.abort();
            return;
        }
        Err(_) => {
            send_error_and_close(
                &outbound_tx,
                &doc_id,
                &temp_id,
                ErrorCode::HandshakeTimeout,
                "handshake did not arrive in time",
                CLOSE_HANDSHAKE_TIMEOUT,
            );
            drop(outbound_tx);
            let _ = forward_task.await;
            return;
        }
    };

    let validation = protocol::validate_server_inbound(&raw);
    let client_id = match validation.envelope {
        Some(envelope) if matches!(envelope.payload, Payload::Handshake(_)) => {
            let client_id = envelope.client_id.clone();
            let Payload::Handshake(payload) = envelope.payload else {
                unreachable!()
            };
            match state
                .server
                .handle_handshake(&doc_id, &client_id, payload, outbound_tx.clone())
                .await
            {
                Ok(outcome) => {
                    let ack = protocol::Envelope {
                        version: weavesync::PROTOCOL_VERSION.to_string(),
                        doc_id: doc_id.clone(),
                        client_id: client_id.clone(),
                        seq: 0,
                        timestamp: chrono::Utc::now().to_rfc3339(),
                        payload: Payload::HandshakeAck(outcome.ack),
                    };
                    let _ = outbound_tx.send(SinkMessage::Frame(ack));
                    client_id
                }
                Err(rejection) => {
                    send_rejection(&outbound_tx, &doc_id, &client_id, rejection);
                    drop(outbound_tx);
                    let _ = forward_task.await;
                    return;
                }
            }
        }
        _ => {
            send_error_and_close(
                &outbound_tx,
                &doc_id,
                &temp_id,
                ErrorCode::HandshakeTimeout,
                "first message must be handshake",
                CLOSE_HANDSHAKE_TIMEOUT,
            );
            drop(outbound_tx);
            let _ = forward_task.await;
            return;
        }
    };

    while let Some(Ok(message)) = ws_rx.next().await {
        let raw = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => continue,
        };

        let validation = protocol::validate_server_inbound(&raw);
        let Some(envelope) = validation.envelope else {
            state
                .server
                .metrics()
                .incr_counter(
                    weavesync::observability::series::SYNC_INVALID_MESSAGES_TOTAL,
                    &weavesync::observability::metrics::label("source", "server"),
                );
            continue;
        };

        if let weavesync::ratelimit::Decision::Denied { retry_after_ms } =
            state.server.check_rate_limit(&client_id)
        {
            let payload = protocol::build_error_payload(
                ErrorCode::RateLimited,
                "rate limit exceeded",
                Some(retry_after_ms as i64),
                None,
            );
            let _ = outbound_tx.send(SinkMessage::Frame(protocol::Envelope {
                version: weavesync::PROTOCOL_VERSION.to_string(),
                doc_id: doc_id.clone(),
                client_id: client_id.clone(),
                seq: envelope.seq,
                timestamp: chrono::Utc::now().to_rfc3339(),
                payload: Payload::Error(payload),
            }));
            continue;
        }

        match envelope.payload {
            Payload::DocUpdate(payload) => {
                let ack = state
                    .server
                    .handle_doc_update(&doc_id, &client_id, envelope.seq, payload)
                    .await;
                let _ = outbound_tx.send(SinkMessage::Frame(protocol::Envelope {
                    version: weavesync::PROTOCOL_VERSION.to_string(),
                    doc_id: doc_id.clone(),
                    client_id: client_id.clone(),
                    seq: envelope.seq,
                    timestamp: chrono::Utc::now().to_rfc3339(),
                    payload: Payload::DocAck(ack),
                }));
            }
            Payload::Presence(payload) => {
                state.server.handle_presence(&doc_id, &client_id, payload).await;
            }
            Payload::CatchUpRequest(payload) => {
                match state
                    .server
                    .handle_catch_up_request(&doc_id, &client_id, payload)
                    .await
                {
                    Ok(response) => {
                        let _ = outbound_tx.send(SinkMessage::Frame(protocol::Envelope {
                            version: weavesync::PROTOCOL_VERSION.to_string(),
                            doc_id: doc_id.clone(),
                            client_id: client_id.clone(),
                            seq: envelope.seq,
                            timestamp: chrono::Utc::now().to_rfc3339(),
                            payload: Payload::CatchUpResponse(response),
                        }));
                    }
                    Err(code) => send_error(&outbound_tx, &doc_id, &client_id, code, "no document state"),
                }
            }
            Payload::Ping(_) => {
                state.server.touch_client(&doc_id, &client_id).await;
                let _ = outbound_tx.send(SinkMessage::Frame(protocol::Envelope {
                    version: weavesync::PROTOCOL_VERSION.to_string(),
                    doc_id: doc_id.clone(),
                    client_id: client_id.clone(),
                    seq: envelope.seq,
                    timestamp: chrono::Utc::now().to_rfc3339(),
                    payload: Payload::Pong(protocol::EmptyPayload {}),
                }));
            }
            _ => {}
        }
    }

    state.server.disconnect(&doc_id, &client_id).await;
    drop(outbound_tx);
    let _ = forward_task.await;
}

async fn next_text_frame(
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
) -> Option<String> {
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

fn send_error(
    outbound_tx: &mpsc::UnboundedSender<SinkMessage>,
    doc_id: &str,
    client_id: &str,
    code: ErrorCode,
    message: &str,
) {
    let payload = protocol::build_error_payload(code, message, None, None);
    let _ = outbound_tx.send(SinkMessage::Frame(protocol::Envelope {
        version: weavesync::PROTOCOL_VERSION.to_string(),
        doc_id: doc_id.to_string(),
        client_id: client_id.to_string(),
        seq: 0,
        timestamp: chrono::Utc::now().to_rfc3339(),
        payload: Payload::Error(payload),
    }));
}

/// Send an `error` frame and instruct the transport to close with
/// `close_code` (§6's code-to-reason table), e.g. `4008` for a handshake
/// that never arrived.
fn send_error_and_close(
    outbound_tx: &mpsc::UnboundedSender<SinkMessage>,
    doc_id: &str,
    client_id: &str,
    code: ErrorCode,
    message: &str,
    close_code: u16,
) {
    send_error(outbound_tx, doc_id, client_id, code, message);
    let _ = outbound_tx.send(SinkMessage::Close(close_code));
}

/// Every handshake rejection (`ROOM_FULL`, `ERR_POLICY_INCOMPATIBLE`,
/// `UNAUTHORIZED`, ...) is a policy/authorization violation at the transport
/// level, so all of them close with `1008` regardless of the specific code.
fn send_rejection(
    outbound_tx: &mpsc::UnboundedSender<SinkMessage>,
    doc_id: &str,
    client_id: &str,
    rejection: HandshakeRejection,
) {
    send_error_and_close(
        outbound_tx,
        doc_id,
        client_id,
        rejection.code,
        &rejection.reason,
        CLOSE_POLICY_VIOLATION,
    );
}
