//! Learner, word and progress records exchanged with the persistence layer.

use crate::phase::PhaseId;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = i64;
pub type WordId = i64;

/// CEFR band used to pitch explanations at the learner's level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Cefr {
    #[default]
    A1,
    A2,
    B1,
    B2,
    C1,
    C2,
}

impl fmt::Display for Cefr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Cefr::A1 => "A1",
            Cefr::A2 => "A2",
            Cefr::B1 => "B1",
            Cefr::B2 => "B2",
            Cefr::C1 => "C1",
            Cefr::C2 => "C2",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EnglishLevel {
    pub listening: Cefr,
    pub reading: Cefr,
    pub writing: Cefr,
    pub speaking: Cefr,
}

impl fmt::Display for EnglishLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "listening: {}, reading: {}, writing: {}, speaking: {}",
            self.listening, self.reading, self.writing, self.speaking
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub nickname: String,
    pub hobbies: String,
    #[serde(default)]
    pub english_level: EnglishLevel,
}

impl UserProfile {
    /// Interests and preferences, formatted for prompt templates.
    pub fn characteristics(&self) -> String {
        format!("Hobbies: {}", self.hobbies)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordRecord {
    pub id: WordId,
    pub word: String,
    #[serde(default)]
    pub example_sentence: Option<String>,
    #[serde(default)]
    pub similar_words: Vec<String>,
}

/// Handle on the conversation log owned by the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatHistoryRef {
    pub chat_id: String,
    pub user_id: UserId,
    pub word_id: WordId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    Tool,
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnRole::User => write!(f, "user"),
            TurnRole::Assistant => write!(f, "assistant"),
            TurnRole::Tool => write!(f, "tool"),
        }
    }
}

/// One entry of the append-only chat log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub chat_id: String,
    pub user_id: UserId,
    pub word_id: WordId,
    pub role: TurnRole,
    pub content: String,
    pub phase: Option<PhaseId>,
    pub created_at: DateTime<Utc>,
}

/// A phase completion for one (user, word) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub phase_id: PhaseId,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SentenceType {
    Simple,
    Compound,
    Complex,
}

/// Scored feedback on a sentence the learner produced during practice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentenceEvaluation {
    pub user_id: UserId,
    pub chat_id: String,
    pub word_id: WordId,
    pub sentence: String,
    pub meaning_cn: String,
    pub grammar_accuracy: u8,
    pub vocabulary_proficiency: u8,
    pub sentence_complexity: u8,
    pub sentence_type: SentenceType,
    pub explanation: String,
    pub corrected_sentence: String,
    pub native_sentence: String,
}
