//! Defines the WebSocket message protocol between the client and the API server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vocab_core::{GreetingStyle, PhaseId, SessionEvent, SessionOutcome};

/// Messages sent from the client to the server.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens the session. This must be the first message.
    Init {
        /// Room metadata: `room_type`, `user_id`, `chat_id`, `word_id`.
        metadata: serde_json::Value,
    },
    /// Speech-to-text output for the learner's utterance.
    Transcript {
        text: String,
        #[serde(default = "default_final")]
        is_final: bool,
    },
    /// The client finished playing the last `speak` message.
    PlaybackFinished,
}

fn default_final() -> bool {
    true
}

/// Messages sent from the server to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The session context is loaded and the entry point is chosen.
    Initialized {
        entry: Option<PhaseId>,
        greeting: Option<GreetingStyle>,
    },
    /// Text for the client to synthesize. Answer with `playback_finished`.
    Speak { text: String },
    PhaseStarted { phase: PhaseId },
    PhaseCompleted {
        phase: PhaseId,
        completed_at: DateTime<Utc>,
    },
    SessionEnded { outcome: SessionOutcome },
    /// Reports a fatal error to the client.
    Error { message: String },
}

impl From<SessionEvent> for ServerMessage {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Entered { entry, greeting } => {
                ServerMessage::Initialized { entry, greeting }
            }
            SessionEvent::PhaseStarted { phase } => ServerMessage::PhaseStarted { phase },
            SessionEvent::PhaseCompleted {
                phase,
                completed_at,
            } => ServerMessage::PhaseCompleted {
                phase,
                completed_at,
            },
            SessionEvent::Finished { outcome } => ServerMessage::SessionEnded { outcome },
        }
    }
}
