use super::protocol::ServerMessage;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use vocab_core::error::TurnError;
use vocab_core::io::TurnIo;

/// Learner input forwarded by the socket reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Transcript(String),
    PlaybackFinished,
}

/// `TurnIo` over the WebSocket reader and writer channels.
///
/// The inbound channel closing means the learner left. Transcripts that
/// arrive while a reply is still playing are queued for the next turn.
pub struct WsTurnIo {
    inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::Sender<ServerMessage>,
    pending: VecDeque<String>,
}

impl WsTurnIo {
    pub fn new(inbound: mpsc::Receiver<Inbound>, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            inbound,
            outbound,
            pending: VecDeque::new(),
        }
    }
}

#[async_trait]
impl TurnIo for WsTurnIo {
    async fn next_user_turn(&mut self) -> Result<Option<String>, TurnError> {
        if let Some(text) = self.pending.pop_front() {
            return Ok(Some(text));
        }
        loop {
            match self.inbound.recv().await {
                Some(Inbound::Transcript(text)) => return Ok(Some(text)),
                // Stale acknowledgement.
                Some(Inbound::PlaybackFinished) => continue,
                None => return Ok(None),
            }
        }
    }

    async fn speak(&mut self, text: &str) -> Result<(), TurnError> {
        self.outbound
            .send(ServerMessage::Speak {
                text: text.to_string(),
            })
            .await
            .map_err(|_| TurnError::Disconnected)?;
        loop {
            match self.inbound.recv().await {
                Some(Inbound::PlaybackFinished) => return Ok(()),
                Some(Inbound::Transcript(text)) => self.pending.push_back(text),
                None => return Err(TurnError::Disconnected),
            }
        }
    }
}
