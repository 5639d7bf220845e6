//! The connection gateway: accepts a WebSocket, authenticates via the
//! injected verifier, resolves or creates the adventure, and relays frames
//! between the socket and the owning session engine.

use crate::config::{ClientConfig, ServerConfig};
use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tale_core::{
    ClientFrame, ClientId, OutboundMessage, ServerFrame, TaleError, TokenVerifier,
};
use tale_engine::{EngineConfig, EngineDeps, SchedulerConfig, SessionEngine, SessionParams, TaskScheduler};
use tale_session::FindActiveRequest;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// WebSocket close code for policy violations (failed verification).
const POLICY_VIOLATION: u16 = 1008;

#[derive(Clone)]
pub struct AppState {
    pub deps: EngineDeps,
    pub verifier: Arc<dyn TokenVerifier>,
    pub config: Arc<ServerConfig>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .route("/client-config", get(client_config))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn client_config(State(state): State<AppState>) -> Json<ClientConfig> {
    Json(ClientConfig::from(state.config.as_ref()))
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub story_category: String,
    pub lesson_topic: String,
    #[serde(default)]
    pub client_uuid: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

async fn ws_handler(
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    tracing::info!(
        story_category = %query.story_category,
        lesson_topic = %query.lesson_topic,
        "WebSocket upgrade request"
    );
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, query: WsQuery) {
    let user_id = match state.verifier.verify(query.token.as_deref()).await {
        Ok(user) => user,
        Err(error) => {
            tracing::warn!(%error, "token verification failed");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: POLICY_VIOLATION,
                    reason: error.kind().into(),
                })))
                .await;
            return;
        }
    };

    let client_uuid = query.client_uuid.clone().map(ClientId::new);
    let cancel = CancellationToken::new();
    let scheduler = TaskScheduler::new(SchedulerConfig::default(), cancel.clone());
    let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundMessage>(256);
    let (inbound_tx, inbound_rx) = mpsc::channel::<ClientFrame>(64);

    let engine_config = EngineConfig {
        word_delay: Duration::from_millis(state.config.word_delay_ms),
        paragraph_delay: Duration::from_millis(state.config.paragraph_delay_ms),
        environment: state.config.environment.clone(),
    };

    // Resolve or create: the persisted copy is authoritative on a hit.
    let existing = state
        .deps
        .store
        .find_active(FindActiveRequest {
            user_id: user_id.clone(),
            client_uuid: client_uuid.clone(),
            story_category: query.story_category.clone(),
            lesson_topic: query.lesson_topic.clone(),
        })
        .await;

    let engine = match existing {
        Ok(Some(row)) => {
            tracing::info!(adventure_id = %row.id, "resuming adventure");
            SessionEngine::resume_from(
                state.deps.clone(),
                engine_config,
                scheduler.clone(),
                outbound_tx.clone(),
                row,
            )
        }
        Ok(None) | Err(_) => {
            let params = SessionParams {
                story_category: query.story_category,
                lesson_topic: query.lesson_topic,
                client_uuid,
                user_id,
                story_length: state.config.story_length_default,
            };
            match SessionEngine::start_new(
                state.deps.clone(),
                engine_config,
                scheduler.clone(),
                outbound_tx.clone(),
                params,
            )
            .await
            {
                Ok(engine) => engine,
                Err(error) => {
                    tracing::warn!(%error, "session setup failed");
                    let frame = ServerFrame::Error {
                        kind: error.kind().to_string(),
                        message: error.to_string(),
                    };
                    if let Ok(payload) = serde_json::to_string(&frame) {
                        let _ = socket.send(Message::Text(payload.into())).await;
                    }
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: POLICY_VIOLATION,
                            reason: error.kind().into(),
                        })))
                        .await;
                    return;
                }
            }
        }
    };

    let engine_task = tokio::spawn(engine.run(inbound_rx));

    let (sink, stream) = socket.split();
    let send_task = tokio::spawn(relay_outbound(outbound_rx, sink));

    relay_inbound(stream, inbound_tx, outbound_tx).await;

    // Socket is gone: cooperative cancel, then let the engine finish its
    // final persist before the relay tasks are reaped.
    cancel.cancel();
    if let Err(error) = engine_task.await {
        tracing::warn!(%error, "engine task panicked");
    }
    let _ = send_task.await;
}

/// Engine → socket. Raw text chunks go out verbatim; frames are JSON.
async fn relay_outbound(
    mut outbound: mpsc::Receiver<OutboundMessage>,
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
) {
    while let Some(message) = outbound.recv().await {
        let ws_message = match message {
            OutboundMessage::Text(text) => Message::Text(text.into()),
            OutboundMessage::Frame(frame) => match serde_json::to_string(&frame) {
                Ok(payload) => Message::Text(payload.into()),
                Err(error) => {
                    tracing::warn!(%error, "unserializable frame");
                    continue;
                }
            },
        };
        if sink.send(ws_message).await.is_err() {
            break;
        }
    }
}

/// Socket → engine. Unknown frames get a single protocol error; the engine
/// never sees them.
async fn relay_inbound(
    mut stream: futures::stream::SplitStream<WebSocket>,
    inbound: mpsc::Sender<ClientFrame>,
    outbound: mpsc::Sender<OutboundMessage>,
) {
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => {
                    if inbound.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(error) => {
                    tracing::debug!(%error, "unparseable client frame");
                    let protocol_error =
                        TaleError::Protocol(format!("unrecognized frame: {error}"));
                    let frame = ServerFrame::Error {
                        kind: protocol_error.kind().to_string(),
                        message: protocol_error.to_string(),
                    };
                    if outbound.send(OutboundMessage::Frame(frame)).await.is_err() {
                        break;
                    }
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
}
