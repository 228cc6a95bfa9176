//! Manages the WebSocket connection lifecycle for a vocabulary session.

use super::{
    protocol::{ClientMessage, ServerMessage},
    turn_io::{Inbound, WsTurnIo},
};
use crate::state::AppState;
use anyhow::{Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};
use uuid::Uuid;
use vocab_core::SessionEvents;

const CHANNEL_CAPACITY: usize = 32;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// Waits for the `init` frame, then runs one orchestrated session. The
/// reader feeds learner input to the agents and the writer serializes
/// everything the session sends back.
#[instrument(name = "ws_connection", skip_all, fields(connection_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    tracing::Span::current().record("connection_id", &connection_id.to_string());
    info!(model = %state.config.chat_model, "New WebSocket connection. Awaiting initialization...");

    let (mut socket_tx, mut socket_rx) = socket.split();

    let metadata = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => parse_init(&text),
        Some(Ok(_)) => Err(anyhow!("First message was not a text `init` message.")),
        _ => {
            info!("Client disconnected before sending init message.");
            return;
        }
    };
    let metadata = match metadata {
        Ok(metadata) => metadata,
        Err(e) => {
            error!("Session initialization failed: {:?}", e);
            let _ = send_msg(
                &mut socket_tx,
                ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (event_tx, mut event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    let writer = tokio::spawn(write_loop(socket_tx, outbound_rx, cancel.clone()).in_current_span());
    let reader = tokio::spawn(read_loop(socket_rx, inbound_tx).in_current_span());

    let forward_tx = outbound_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if forward_tx.send(ServerMessage::from(event)).await.is_err() {
                break;
            }
        }
    });

    let session_span = tracing::info_span!(
        "vocab_session",
        user_id = %metadata["user_id"],
        word_id = %metadata["word_id"],
    );
    let mut io = WsTurnIo::new(inbound_rx, outbound_tx.clone());
    let result = state
        .orchestrator
        .start(&metadata, &mut io, cancel.clone(), SessionEvents::channel(event_tx))
        .instrument(session_span)
        .await;
    drop(io);

    let _ = forwarder.await;
    match result {
        Ok(outcome) => info!(outcome = outcome.label(), "Vocabulary session finished."),
        Err(e) => {
            warn!(error = %e, "Vocabulary session rejected.");
            let _ = outbound_tx
                .send(ServerMessage::Error {
                    message: e.to_string(),
                })
                .await;
        }
    }
    drop(outbound_tx);

    if let Err(e) = writer.await {
        error!(error = ?e, "WebSocket writer task failed.");
    }
    reader.abort();
    info!("WebSocket connection closed.");
}

fn parse_init(text: &str) -> Result<serde_json::Value> {
    match serde_json::from_str::<ClientMessage>(text)? {
        ClientMessage::Init { metadata } => Ok(metadata),
        _ => Err(anyhow!("First message must be `init`")),
    }
}

/// Forwards learner frames to the session. Returning drops `inbound`, which
/// the session sees as the learner leaving.
async fn read_loop(mut socket_rx: SplitStream<WebSocket>, inbound: mpsc::Sender<Inbound>) {
    while let Some(msg_result) = socket_rx.next().await {
        let forwarded = match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Transcript {
                    text,
                    is_final: true,
                }) => Some(Inbound::Transcript(text)),
                Ok(ClientMessage::Transcript { .. }) => None,
                Ok(ClientMessage::PlaybackFinished) => Some(Inbound::PlaybackFinished),
                Ok(ClientMessage::Init { .. }) => {
                    warn!("Ignoring repeated `init` message.");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring unparseable client message.");
                    None
                }
            },
            Ok(Message::Close(_)) => {
                info!("Client sent close frame.");
                break;
            }
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary frame.");
                None
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Err(e) => {
                error!("Error receiving from client WebSocket: {:?}", e);
                break;
            }
        };
        if let Some(input) = forwarded {
            if inbound.send(input).await.is_err() {
                break;
            }
        }
    }
}

/// Writes server messages until every sender is gone. A failed write means
/// the client is unreachable, so the session is cancelled.
async fn write_loop(
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    cancel: CancellationToken,
) {
    while let Some(msg) = outbound.recv().await {
        if let Err(e) = send_msg(&mut socket_tx, msg).await {
            warn!(error = %e, "Failed to write to client. Cancelling session.");
            cancel.cancel();
            break;
        }
    }
    // Keep draining until the session drops its senders.
    while outbound.recv().await.is_some() {}
    let _ = socket_tx.close().await;
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init_returns_metadata() {
        let metadata = parse_init(
            r#"{"type":"init","metadata":{"room_type":"vocabulary","user_id":1,"chat_id":"c","word_id":42}}"#,
        )
        .unwrap();
        assert_eq!(metadata["chat_id"], "c");
    }

    #[test]
    fn test_parse_init_rejects_other_messages() {
        assert!(parse_init(r#"{"type":"playback_finished"}"#).is_err());
        assert!(parse_init("not json").is_err());
    }
}
