//! Per-session learner state shared with every phase agent.

use crate::error::{ContextError, RepositoryError, SessionError};
use crate::model::{
    ChatHistoryRef, ChatTurn, ProgressRecord, TurnRole, UserId, UserProfile, WordId, WordRecord,
};
use crate::orchestrator::{Collaborators, OrchestratorSettings};
use crate::phase::{PhaseId, PhaseTable};
use crate::prompt_store::{PhasePrompt, PromptStore, load_phase_prompt};
use crate::repository::Repository;
use crate::resumption::EntryDecision;
use crate::retry::RetryPolicy;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Everything the phase agents of one session may read.
///
/// `progress` only holds completions made during this session. What the
/// repository already knew is kept apart in `prior_progress` and is never
/// written back.
#[derive(Debug)]
pub struct SessionContext {
    user: UserProfile,
    word: WordRecord,
    chat: ChatHistoryRef,
    phases: Arc<PhaseTable>,
    locale: String,
    entry: EntryDecision,
    prior_progress: Vec<ProgressRecord>,
    progress: Vec<ProgressRecord>,
    prompt_cache: HashMap<PhaseId, PhasePrompt>,
    last_interaction_at: Option<DateTime<Utc>>,
}

impl SessionContext {
    /// Loads the learner's state and the entry phase's prompt.
    ///
    /// Fails with `NotFound` for an unknown user or word, with
    /// `InvalidMetadata` if `chat_id` is already owned by another
    /// (user, word) pair and with `ConfigUnavailable` if the entry phase has
    /// no usable prompt after retries. Prompts for later phases are loaded lazily.
    pub async fn initialize(
        collaborators: &Collaborators,
        settings: &OrchestratorSettings,
        user_id: UserId,
        chat_id: &str,
        word_id: WordId,
    ) -> Result<Self, SessionError> {
        let repo = collaborators.repository.as_ref();
        let retry = &settings.retry;

        let (user, word, prior_progress, last_interaction_at) = tokio::try_join!(
            retry.run("get_user", || repo.get_user(user_id)),
            retry.run("get_word", || repo.get_word(word_id)),
            retry.run("get_progress", || repo.get_progress(user_id, word_id)),
            retry.run("get_last_interaction", || {
                repo.get_last_interaction(user_id, word_id)
            }),
        )
        .map_err(SessionError::RepositoryRead)?;

        let user = user.ok_or_else(|| SessionError::NotFound {
            entity: "user",
            id: user_id.to_string(),
        })?;
        let word = word.ok_or_else(|| SessionError::NotFound {
            entity: "word",
            id: word_id.to_string(),
        })?;

        let chat = retry
            .run("ensure_chat", || repo.ensure_chat(user_id, chat_id, word_id))
            .await
            .map_err(SessionError::RepositoryRead)?;
        if chat.user_id != user_id || chat.word_id != word_id {
            return Err(SessionError::InvalidMetadata(format!(
                "chat '{chat_id}' belongs to another learner or word"
            )));
        }

        let entry = settings.resumption.choose_entry(
            &collaborators.phases,
            user_id,
            word_id,
            &prior_progress,
            last_interaction_at,
            Utc::now(),
        );

        let mut ctx = Self {
            user,
            word,
            chat,
            phases: collaborators.phases.clone(),
            locale: settings.locale.clone(),
            entry,
            prior_progress,
            progress: Vec::new(),
            prompt_cache: HashMap::new(),
            last_interaction_at,
        };

        if let EntryDecision::Start { phase, .. } = &ctx.entry {
            let phase = phase.clone();
            ctx.ensure_prompt(collaborators.prompts.as_ref(), retry, &phase)
                .await?;
        }

        info!(
            user_id,
            word_id,
            word = %ctx.word.word,
            prior = ctx.prior_progress.len(),
            "Session context initialized"
        );
        Ok(ctx)
    }

    pub fn user_id(&self) -> UserId {
        self.user.id
    }

    pub fn chat_id(&self) -> &str {
        &self.chat.chat_id
    }

    pub fn user(&self) -> &UserProfile {
        &self.user
    }

    pub fn word(&self) -> &WordRecord {
        &self.word
    }

    pub fn target_word(&self) -> &str {
        &self.word.word
    }

    pub fn chat(&self) -> &ChatHistoryRef {
        &self.chat
    }

    pub fn phases(&self) -> &PhaseTable {
        &self.phases
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn entry(&self) -> &EntryDecision {
        &self.entry
    }

    /// Phases completed in earlier sessions, as loaded at start.
    pub fn prior_progress(&self) -> &[ProgressRecord] {
        &self.prior_progress
    }

    /// Phases completed during this session, in completion order.
    pub fn progress(&self) -> &[ProgressRecord] {
        &self.progress
    }

    pub fn last_interaction_at(&self) -> Option<DateTime<Utc>> {
        self.last_interaction_at
    }

    pub fn is_complete(&self, phase: &PhaseId) -> bool {
        self.progress.iter().any(|r| &r.phase_id == phase)
            || self.prior_progress.iter().any(|r| &r.phase_id == phase)
    }

    pub fn prompt(&self, phase: &PhaseId) -> Option<&PhasePrompt> {
        self.prompt_cache.get(phase)
    }

    /// Loads `phase`'s prompt unless it is already cached. Cached prompts are
    /// never replaced.
    pub async fn ensure_prompt(
        &mut self,
        prompts: &dyn PromptStore,
        retry: &RetryPolicy,
        phase: &PhaseId,
    ) -> Result<(), SessionError> {
        if self.prompt_cache.contains_key(phase) {
            return Ok(());
        }
        let locale = self.locale.as_str();
        let prompt = retry
            .run("load_phase_prompt", || load_phase_prompt(prompts, phase, locale))
            .await
            .map_err(SessionError::ConfigUnavailable)?;
        debug!(%phase, few_shot = prompt.few_shot.len(), "Prompt cached");
        self.prompt_cache.entry(phase.clone()).or_insert(prompt);
        Ok(())
    }

    /// Appends a completion for `phase`.
    ///
    /// Returns `Ok(false)` if the phase is already recorded. Completions must
    /// follow the phase order, and each timestamp is pushed past the previous
    /// one if the clock did not move.
    pub fn mark_phase_complete(
        &mut self,
        phase: &PhaseId,
        at: DateTime<Utc>,
    ) -> Result<bool, ContextError> {
        let position = self
            .phases
            .position(phase)
            .ok_or_else(|| ContextError::UnknownPhase(phase.clone()))?;

        if self.progress.iter().any(|r| &r.phase_id == phase) {
            return Ok(false);
        }

        let mut completed_at = at;
        if let Some(last) = self.progress.last() {
            let last_position = self.phases.position(&last.phase_id).unwrap_or(0);
            if position <= last_position {
                return Err(ContextError::OutOfOrder {
                    phase: phase.clone(),
                    last: last.phase_id.clone(),
                });
            }
            if completed_at <= last.completed_at {
                completed_at = last.completed_at + TimeDelta::microseconds(1);
            }
        }

        self.progress.push(ProgressRecord {
            phase_id: phase.clone(),
            completed_at,
        });
        Ok(true)
    }

    /// Writes this session's completions in one transaction.
    ///
    /// The whole transaction is retried; a failed attempt is dropped, which
    /// rolls it back. Returns the number of records written.
    pub async fn persist(
        &self,
        repository: &dyn Repository,
        retry: &RetryPolicy,
    ) -> Result<usize, SessionError> {
        if self.progress.is_empty() {
            return Ok(0);
        }
        retry
            .run("persist_progress", || self.write_progress(repository))
            .await
            .map_err(SessionError::RepositoryWrite)?;
        Ok(self.progress.len())
    }

    async fn write_progress(&self, repository: &dyn Repository) -> Result<(), RepositoryError> {
        let mut tx = repository.begin_progress().await?;
        for record in &self.progress {
            tx.append_progress(self.user.id, self.word.id, record).await?;
        }
        tx.commit().await
    }

    /// Substitutes the learner's details into a prompt template.
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{word}", &self.word.word)
            .replace("{nickname}", &self.user.nickname)
            .replace("{english_level}", &self.user.english_level.to_string())
            .replace("{user_characteristics}", &self.user.characteristics())
            .replace("{similar_words}", &self.word.similar_words.join(", "))
    }

    /// Metadata attached to chat turns recorded during `phase`.
    pub fn metadata(&self, phase: &PhaseId) -> serde_json::Value {
        json!({
            "phase": phase,
            "word_id": self.word.id,
            "word": self.word.word,
        })
    }

    pub fn chat_turn(&self, role: TurnRole, content: impl Into<String>, phase: &PhaseId) -> ChatTurn {
        ChatTurn {
            chat_id: self.chat.chat_id.clone(),
            user_id: self.user.id,
            word_id: self.word.id,
            role,
            content: content.into(),
            phase: Some(phase.clone()),
            created_at: Utc::now(),
        }
    }
}
