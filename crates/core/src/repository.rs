//! Persistence repository contract.
//!
//! The repository owns users, words, chat logs and learning progress. Progress
//! is only ever written through a `ProgressTransaction`: dropping one without
//! calling `commit` discards everything it staged.

use crate::error::RepositoryError;
use crate::model::{
    ChatHistoryRef, ChatTurn, ProgressRecord, SentenceEvaluation, TurnRole, UserId, UserProfile,
    WordId, WordRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserProfile>, RepositoryError>;

    async fn get_word(&self, word_id: WordId) -> Result<Option<WordRecord>, RepositoryError>;

    /// Completed phases for the pair, oldest first.
    async fn get_progress(
        &self,
        user_id: UserId,
        word_id: WordId,
    ) -> Result<Vec<ProgressRecord>, RepositoryError>;

    /// Time of the learner's most recent turn about this word, in any session.
    async fn get_last_interaction(
        &self,
        user_id: UserId,
        word_id: WordId,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError>;

    /// Returns the chat log for `chat_id`, creating it for this user and word
    /// if needed. An existing chat comes back with its recorded owner, which
    /// callers must compare against their own ids.
    async fn ensure_chat(
        &self,
        user_id: UserId,
        chat_id: &str,
        word_id: WordId,
    ) -> Result<ChatHistoryRef, RepositoryError>;

    async fn append_chat_turn(&self, turn: &ChatTurn) -> Result<(), RepositoryError>;

    /// The last `limit` turns of the chat, oldest first.
    async fn recent_turns(
        &self,
        chat: &ChatHistoryRef,
        limit: usize,
    ) -> Result<Vec<ChatTurn>, RepositoryError>;

    async fn save_sentence_evaluation(
        &self,
        evaluation: &SentenceEvaluation,
    ) -> Result<(), RepositoryError>;

    async fn begin_progress(&self) -> Result<Box<dyn ProgressTransaction>, RepositoryError>;
}

/// A unit of progress writes that commits atomically.
#[async_trait]
pub trait ProgressTransaction: Send {
    /// Stages a completion. Re-appending a phase already stored is a no-op.
    async fn append_progress(
        &mut self,
        user_id: UserId,
        word_id: WordId,
        record: &ProgressRecord,
    ) -> Result<(), RepositoryError>;

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError>;
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<UserId, UserProfile>,
    words: HashMap<WordId, WordRecord>,
    progress: HashMap<(UserId, WordId), Vec<ProgressRecord>>,
    chats: HashMap<String, ChatHistoryRef>,
    turns: Vec<ChatTurn>,
    evaluations: Vec<SentenceEvaluation>,
}

/// A `Repository` held entirely in memory, for development and tests.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<Mutex<MemoryState>>,
    failing_commits: Arc<AtomicU32>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: UserProfile) {
        self.state.lock().await.users.insert(user.id, user);
    }

    pub async fn insert_word(&self, word: WordRecord) {
        self.state.lock().await.words.insert(word.id, word);
    }

    pub async fn insert_progress(&self, user_id: UserId, word_id: WordId, record: ProgressRecord) {
        self.state
            .lock()
            .await
            .progress
            .entry((user_id, word_id))
            .or_default()
            .push(record);
    }

    pub async fn insert_turn(&self, turn: ChatTurn) {
        self.state.lock().await.turns.push(turn);
    }

    /// Makes the next `count` commits fail with a write error.
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    pub async fn progress_of(&self, user_id: UserId, word_id: WordId) -> Vec<ProgressRecord> {
        self.state
            .lock()
            .await
            .progress
            .get(&(user_id, word_id))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn turns(&self) -> Vec<ChatTurn> {
        self.state.lock().await.turns.clone()
    }

    pub async fn evaluations(&self) -> Vec<SentenceEvaluation> {
        self.state.lock().await.evaluations.clone()
    }

    fn take_commit_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserProfile>, RepositoryError> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn get_word(&self, word_id: WordId) -> Result<Option<WordRecord>, RepositoryError> {
        Ok(self.state.lock().await.words.get(&word_id).cloned())
    }

    async fn get_progress(
        &self,
        user_id: UserId,
        word_id: WordId,
    ) -> Result<Vec<ProgressRecord>, RepositoryError> {
        Ok(self.progress_of(user_id, word_id).await)
    }

    async fn get_last_interaction(
        &self,
        user_id: UserId,
        word_id: WordId,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .turns
            .iter()
            .filter(|t| t.user_id == user_id && t.word_id == word_id && t.role == TurnRole::User)
            .map(|t| t.created_at)
            .max())
    }

    async fn ensure_chat(
        &self,
        user_id: UserId,
        chat_id: &str,
        word_id: WordId,
    ) -> Result<ChatHistoryRef, RepositoryError> {
        let mut state = self.state.lock().await;
        let chat = state
            .chats
            .entry(chat_id.to_string())
            .or_insert_with(|| ChatHistoryRef {
                chat_id: chat_id.to_string(),
                user_id,
                word_id,
            });
        Ok(chat.clone())
    }

    async fn append_chat_turn(&self, turn: &ChatTurn) -> Result<(), RepositoryError> {
        self.state.lock().await.turns.push(turn.clone());
        Ok(())
    }

    async fn recent_turns(
        &self,
        chat: &ChatHistoryRef,
        limit: usize,
    ) -> Result<Vec<ChatTurn>, RepositoryError> {
        let state = self.state.lock().await;
        let turns: Vec<ChatTurn> = state
            .turns
            .iter()
            .filter(|t| t.chat_id == chat.chat_id)
            .cloned()
            .collect();
        let skip = turns.len().saturating_sub(limit);
        Ok(turns.into_iter().skip(skip).collect())
    }

    async fn save_sentence_evaluation(
        &self,
        evaluation: &SentenceEvaluation,
    ) -> Result<(), RepositoryError> {
        self.state.lock().await.evaluations.push(evaluation.clone());
        Ok(())
    }

    async fn begin_progress(&self) -> Result<Box<dyn ProgressTransaction>, RepositoryError> {
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            staged: Vec::new(),
            fail_on_commit: self.take_commit_failure(),
        }))
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    staged: Vec<(UserId, WordId, ProgressRecord)>,
    fail_on_commit: bool,
}

#[async_trait]
impl ProgressTransaction for MemoryTransaction {
    async fn append_progress(
        &mut self,
        user_id: UserId,
        word_id: WordId,
        record: &ProgressRecord,
    ) -> Result<(), RepositoryError> {
        self.staged.push((user_id, word_id, record.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        if self.fail_on_commit {
            return Err(RepositoryError::Write("injected commit failure".into()));
        }
        let mut state = self.state.lock().await;
        for (user_id, word_id, record) in self.staged {
            let rows = state.progress.entry((user_id, word_id)).or_default();
            if !rows.iter().any(|r| r.phase_id == record.phase_id) {
                rows.push(record);
            }
        }
        Ok(())
    }
}
