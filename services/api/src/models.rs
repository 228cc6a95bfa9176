//! API and Database Models
//!
//! Row types mapped with `sqlx` and converted into the core records, plus the
//! response bodies documented with `utoipa`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use utoipa::ToSchema;
use vocab_core::error::RepositoryError;
use vocab_core::model::{
    ChatTurn, EnglishLevel, ProgressRecord, SentenceType, TurnRole, UserProfile, WordRecord,
};
use vocab_core::phase::PhaseId;

#[derive(FromRow, Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub nickname: String,
    pub hobbies: String,
    pub english_level: Json<EnglishLevel>,
}

impl From<UserRow> for UserProfile {
    fn from(row: UserRow) -> Self {
        UserProfile {
            id: row.id,
            nickname: row.nickname,
            hobbies: row.hobbies,
            english_level: row.english_level.0,
        }
    }
}

#[derive(FromRow, Debug, Clone)]
pub struct WordRow {
    pub id: i64,
    pub word: String,
    pub example_sentence: Option<String>,
    pub similar_words: Vec<String>,
}

impl From<WordRow> for WordRecord {
    fn from(row: WordRow) -> Self {
        WordRecord {
            id: row.id,
            word: row.word,
            example_sentence: row.example_sentence,
            similar_words: row.similar_words,
        }
    }
}

#[derive(FromRow, Debug, Clone)]
pub struct ProgressRow {
    pub phase_id: String,
    pub completed_at: DateTime<Utc>,
}

impl From<ProgressRow> for ProgressRecord {
    fn from(row: ProgressRow) -> Self {
        ProgressRecord {
            phase_id: PhaseId::from(row.phase_id),
            completed_at: row.completed_at,
        }
    }
}

#[derive(FromRow, Debug, Clone)]
pub struct ChatTurnRow {
    pub chat_id: String,
    pub user_id: i64,
    pub word_id: i64,
    pub role: String,
    pub content: String,
    pub phase_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn parse_role(raw: &str) -> Option<TurnRole> {
    match raw {
        "user" => Some(TurnRole::User),
        "assistant" => Some(TurnRole::Assistant),
        "tool" => Some(TurnRole::Tool),
        _ => None,
    }
}

impl TryFrom<ChatTurnRow> for ChatTurn {
    type Error = RepositoryError;

    fn try_from(row: ChatTurnRow) -> Result<Self, Self::Error> {
        let role = parse_role(&row.role).ok_or_else(|| {
            RepositoryError::Unavailable(format!("unknown chat role '{}'", row.role))
        })?;
        Ok(ChatTurn {
            chat_id: row.chat_id,
            user_id: row.user_id,
            word_id: row.word_id,
            role,
            content: row.content,
            phase: row.phase_id.map(PhaseId::from),
            created_at: row.created_at,
        })
    }
}

pub fn sentence_type_label(sentence_type: SentenceType) -> &'static str {
    match sentence_type {
        SentenceType::Simple => "simple",
        SentenceType::Compound => "compound",
        SentenceType::Complex => "complex",
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct CompletedPhase {
    #[schema(example = "analysis_route")]
    pub phase_id: String,
    pub completed_at: DateTime<Utc>,
}

/// Where a learner stands on one word.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ProgressView {
    pub user_id: i64,
    pub word_id: i64,
    pub completed: Vec<CompletedPhase>,
    /// Phase the next session would start at; absent once every phase is done.
    #[schema(example = "word_creation_logic")]
    pub next_phase: Option<String>,
    #[schema(example = "brief-continue")]
    pub greeting: Option<String>,
    pub complete: bool,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct PhaseListResponse {
    pub phases: Vec<String>,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
