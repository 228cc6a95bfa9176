//! Error types shared across the vocabulary core.
//!
//! Collaborator errors (`RepositoryError`, `PromptStoreError`, `TurnError`) are
//! classified into a `SessionError` at the context/orchestrator boundary. Only
//! `SessionError::NotFound` and `SessionError::InvalidMetadata` ever reach the
//! caller of `PhaseOrchestrator::start`; everything else degrades the outcome.

use crate::phase::PhaseId;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by a persistence repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Repository unavailable: {0}")]
    Unavailable(String),
    #[error("Repository write failed: {0}")]
    Write(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Failures reported by a prompt store.
#[derive(Debug, Error)]
pub enum PromptStoreError {
    #[error("No {kind} configured for phase '{phase}' (locale {locale})")]
    Missing {
        kind: &'static str,
        phase: PhaseId,
        locale: String,
    },
    #[error("Malformed prompt content for phase '{phase}': {reason}")]
    Malformed { phase: PhaseId, reason: String },
    #[error("Prompt store unreachable: {0}")]
    Unreachable(String),
}

/// Failures of the dialogue transport a phase agent talks through.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TurnError {
    #[error("Learner disconnected")]
    Disconnected,
    #[error("Turn limit of {limit} reached")]
    TurnLimitReached { limit: u32 },
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Violations of the session-context invariants.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("Phase '{0}' is not part of the configured phase order")]
    UnknownPhase(PhaseId),
    #[error("Phase '{phase}' cannot be completed after '{last}'")]
    OutOfOrder { phase: PhaseId, last: PhaseId },
}

/// Which ceiling a phase ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseLimit {
    Turns(u32),
    WallTime(Duration),
}

impl std::fmt::Display for PhaseLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseLimit::Turns(n) => write!(f, "{} turns", n),
            PhaseLimit::WallTime(d) => write!(f, "{}s", d.as_secs()),
        }
    }
}

/// Session-level error taxonomy.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },
    #[error("Prompt configuration unavailable: {0}")]
    ConfigUnavailable(#[source] PromptStoreError),
    #[error("Failed to read learner state: {0}")]
    RepositoryRead(#[source] RepositoryError),
    #[error("Failed to persist progress: {0}")]
    RepositoryWrite(#[source] RepositoryError),
    #[error("Phase '{phase}' exceeded its ceiling of {limit}")]
    PhaseTimeout { phase: PhaseId, limit: PhaseLimit },
    #[error("Invalid room metadata: {0}")]
    InvalidMetadata(String),
}

impl SessionError {
    /// True for errors that must be surfaced to the caller as session-start failures.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::NotFound { .. } | SessionError::InvalidMetadata(_)
        )
    }
}
