//! WebSocket upgrade handler for `/api/v1/asr/stream` (SPEC_FULL.md §4.10).
//!
//! Each accepted connection gets its own bounded outbound channel and its
//! own `SessionActor`, spawned and linked through the root supervisor so a
//! crash is observable without this handler having to poll for it. Socket
//! halves run as two tasks, mirroring the ingest/egress split this codebase
//! uses for other duplex WebSocket endpoints; whichever task ends first
//! tears down the other.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use sig_protocol::{InboundEvent, OutboundEvent};
use sig_session::{SessionArgs, SessionMsg};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    token: Option<String>,
}

pub async fn stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&state, &headers, &query) {
        return (StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn authorized(state: &AppState, headers: &HeaderMap, query: &StreamQuery) -> bool {
    let Some(expected) = state.config.bearer_token.as_deref() else {
        return true;
    };

    let header_token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    header_token == Some(expected) || query.token.as_deref() == Some(expected)
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = Uuid::new_v4().to_string();
    let span = info_span!("session", session_id = %session_id);

    async move {
        let (outbound_tx, outbound_rx) = mpsc::channel(state.config.outbound_channel_capacity);

        let args = SessionArgs {
            session_id: session_id.clone(),
            outbound: outbound_tx,
            worker: state.worker.clone(),
            insight_manager: state.insight_manager.clone(),
            metrics: state.metrics.clone(),
            defaults: state.session_defaults.clone(),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if state
            .root
            .cast(sig_session::RootMsg::SpawnSession(Box::new(args), reply_tx))
            .is_err()
        {
            warn!("root_supervisor_unreachable");
            return;
        }
        let Ok(session_ref) = reply_rx.await else {
            warn!("session_spawn_failed");
            return;
        };

        info!("ws_session_opened");

        let (ws_sender, ws_receiver) = socket.split();

        let mut ingest = tokio::spawn(ingest_loop(ws_receiver, session_ref.clone()));
        let mut egress = tokio::spawn(egress_loop(ws_sender, outbound_rx));

        tokio::select! {
            _ = &mut ingest => { egress.abort(); }
            _ = &mut egress => { ingest.abort(); }
        }

        let _ = session_ref.cast(SessionMsg::Inbound(InboundEvent::Stop {}));

        info!("ws_session_closed");
    }
    .instrument(span)
    .await
}

async fn ingest_loop(
    mut ws_receiver: futures_util::stream::SplitStream<WebSocket>,
    session_ref: ractor::ActorRef<SessionMsg>,
) {
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<InboundEvent>(text.as_str()) {
                Ok(event) => {
                    if session_ref.cast(SessionMsg::Inbound(event)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "inbound_frame_not_understood");
                    break;
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

async fn egress_loop(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<OutboundEvent>,
) {
    while let Some(event) = outbound_rx.recv().await {
        let is_terminal = event.is_terminal();
        let payload = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "outbound_event_encode_failed");
                continue;
            }
        };
        if ws_sender.send(Message::Text(payload.into())).await.is_err() {
            break;
        }
        if is_terminal {
            break;
        }
    }
    let _ = ws_sender.close().await;
}
