//! Data Access Layer
//!
//! `Db` is the PostgreSQL implementation of the core `Repository`. Queries are
//! built at runtime with `sqlx::query_as` and mapped through the row types in
//! `models`. Progress is written only through `PgProgressTransaction`, which
//! wraps a `sqlx::Transaction` and rolls back when dropped uncommitted.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use vocab_core::error::RepositoryError;
use vocab_core::model::{
    ChatHistoryRef, ChatTurn, ProgressRecord, SentenceEvaluation, UserId, UserProfile, WordId,
    WordRecord,
};
use vocab_core::repository::{ProgressTransaction, Repository};

use crate::models::{ChatTurnRow, ProgressRow, UserRow, WordRow, sentence_type_label};

fn read_err(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Unavailable(err.to_string())
}

fn write_err(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Write(err.to_string())
}

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Repository for Db {
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserProfile>, RepositoryError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, nickname, hobbies, english_level FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(read_err)?;
        Ok(row.map(UserProfile::from))
    }

    async fn get_word(&self, word_id: WordId) -> Result<Option<WordRecord>, RepositoryError> {
        let row = sqlx::query_as::<_, WordRow>(
            "SELECT id, word, example_sentence, similar_words FROM vocabularies WHERE id = $1",
        )
        .bind(word_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(read_err)?;
        Ok(row.map(WordRecord::from))
    }

    async fn get_progress(
        &self,
        user_id: UserId,
        word_id: WordId,
    ) -> Result<Vec<ProgressRecord>, RepositoryError> {
        let rows = sqlx::query_as::<_, ProgressRow>(
            r#"
            SELECT phase_id, completed_at
            FROM learning_progress
            WHERE user_id = $1 AND word_id = $2
            ORDER BY completed_at ASC
            "#,
        )
        .bind(user_id)
        .bind(word_id)
        .fetch_all(&self.pool)
        .await
        .map_err(read_err)?;
        Ok(rows.into_iter().map(ProgressRecord::from).collect())
    }

    async fn get_last_interaction(
        &self,
        user_id: UserId,
        word_id: WordId,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(created_at) FROM chat_turns WHERE user_id = $1 AND word_id = $2 AND role = 'user'",
        )
        .bind(user_id)
        .bind(word_id)
        .fetch_one(&self.pool)
        .await
        .map_err(read_err)
    }

    async fn ensure_chat(
        &self,
        user_id: UserId,
        chat_id: &str,
        word_id: WordId,
    ) -> Result<ChatHistoryRef, RepositoryError> {
        // The no-op update makes RETURNING yield the stored owner on conflict.
        let (id, user_id, word_id) = sqlx::query_as::<_, (String, i64, i64)>(
            r#"
            INSERT INTO chats (id, user_id, word_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET id = EXCLUDED.id
            RETURNING id, user_id, word_id
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(word_id)
        .fetch_one(&self.pool)
        .await
        .map_err(write_err)?;

        Ok(ChatHistoryRef {
            chat_id: id,
            user_id,
            word_id,
        })
    }

    async fn append_chat_turn(&self, turn: &ChatTurn) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO chat_turns (chat_id, user_id, word_id, role, content, phase_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&turn.chat_id)
        .bind(turn.user_id)
        .bind(turn.word_id)
        .bind(turn.role.to_string())
        .bind(&turn.content)
        .bind(turn.phase.as_ref().map(|p| p.as_str().to_string()))
        .bind(turn.created_at)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn recent_turns(
        &self,
        chat: &ChatHistoryRef,
        limit: usize,
    ) -> Result<Vec<ChatTurn>, RepositoryError> {
        let rows = sqlx::query_as::<_, ChatTurnRow>(
            r#"
            SELECT chat_id, user_id, word_id, role, content, phase_id, created_at
            FROM (
                SELECT id, chat_id, user_id, word_id, role, content, phase_id, created_at
                FROM chat_turns
                WHERE chat_id = $1
                ORDER BY id DESC
                LIMIT $2
            ) recent
            ORDER BY id ASC
            "#,
        )
        .bind(&chat.chat_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(read_err)?;
        rows.into_iter().map(ChatTurn::try_from).collect()
    }

    async fn save_sentence_evaluation(
        &self,
        evaluation: &SentenceEvaluation,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO sentence_evaluations (
                user_id, chat_id, word_id, sentence, meaning_cn,
                grammar_accuracy, vocabulary_proficiency, sentence_complexity,
                sentence_type, explanation, corrected_sentence, native_sentence
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(evaluation.user_id)
        .bind(&evaluation.chat_id)
        .bind(evaluation.word_id)
        .bind(&evaluation.sentence)
        .bind(&evaluation.meaning_cn)
        .bind(i16::from(evaluation.grammar_accuracy))
        .bind(i16::from(evaluation.vocabulary_proficiency))
        .bind(i16::from(evaluation.sentence_complexity))
        .bind(sentence_type_label(evaluation.sentence_type))
        .bind(&evaluation.explanation)
        .bind(&evaluation.corrected_sentence)
        .bind(&evaluation.native_sentence)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn begin_progress(&self) -> Result<Box<dyn ProgressTransaction>, RepositoryError> {
        let tx = self.pool.begin().await.map_err(write_err)?;
        Ok(Box::new(PgProgressTransaction { tx }))
    }
}

pub struct PgProgressTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ProgressTransaction for PgProgressTransaction {
    async fn append_progress(
        &mut self,
        user_id: UserId,
        word_id: WordId,
        record: &ProgressRecord,
    ) -> Result<(), RepositoryError> {
        // The primary key makes a repeated completion a no-op.
        sqlx::query(
            r#"
            INSERT INTO learning_progress (user_id, word_id, phase_id, completed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, word_id, phase_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(word_id)
        .bind(record.phase_id.as_str())
        .bind(record.completed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        let PgProgressTransaction { tx } = *self;
        tx.commit().await.map_err(write_err)
    }
}
