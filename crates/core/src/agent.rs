//! The phase-agent capability.
//!
//! Every pedagogical phase is driven by a `PhaseAgent`. Agents hold no session
//! identity of their own: everything they know about the learner comes from
//! the `PhaseHandle` the orchestrator lends them for the duration of one phase.

use crate::context::SessionContext;
use crate::error::TurnError;
use crate::io::TurnIo;
use crate::phase::PhaseId;
use crate::prompt_store::PhasePrompt;
use crate::resumption::GreetingStyle;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Why a session stopped before its last phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AbandonReason {
    Disconnected,
    Cancelled,
    TurnLimit,
    TimeLimit,
    AgentFailed(String),
    PromptUnavailable,
    RepositoryUnavailable,
    PersistFailed,
}

impl From<TurnError> for AbandonReason {
    fn from(err: TurnError) -> Self {
        match err {
            TurnError::Disconnected => AbandonReason::Disconnected,
            TurnError::TurnLimitReached { .. } => AbandonReason::TurnLimit,
            TurnError::Transport(msg) => AbandonReason::AgentFailed(msg),
        }
    }
}

/// The single terminal signal an agent emits for its phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseSignal {
    Advance,
    Abandon(AbandonReason),
}

/// An agent's window onto the session for one phase.
///
/// Gives read access to the whole context. The only write is
/// `mark_phase_complete`, which stages the completion for the orchestrator to
/// commit once the agent signals `Advance`.
pub struct PhaseHandle<'a> {
    ctx: &'a SessionContext,
    phase: &'a PhaseId,
    greeting: Option<GreetingStyle>,
    staged: &'a mut Option<DateTime<Utc>>,
}

impl<'a> PhaseHandle<'a> {
    pub(crate) fn new(
        ctx: &'a SessionContext,
        phase: &'a PhaseId,
        greeting: Option<GreetingStyle>,
        staged: &'a mut Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            ctx,
            phase,
            greeting,
            staged,
        }
    }

    pub fn context(&self) -> &'a SessionContext {
        self.ctx
    }

    pub fn phase_id(&self) -> &'a PhaseId {
        self.phase
    }

    /// Greeting to open with; only set for the session's entry phase.
    pub fn greeting(&self) -> Option<GreetingStyle> {
        self.greeting
    }

    pub fn prompt(&self) -> Option<&'a PhasePrompt> {
        self.ctx.prompt(self.phase)
    }

    /// Marks the current phase complete now. Repeated calls keep the first timestamp.
    pub fn mark_phase_complete(&mut self) -> bool {
        self.mark_phase_complete_at(Utc::now())
    }

    pub fn mark_phase_complete_at(&mut self, at: DateTime<Utc>) -> bool {
        if self.staged.is_some() {
            return false;
        }
        *self.staged = Some(at);
        true
    }

    pub fn is_marked_complete(&self) -> bool {
        self.staged.is_some()
    }
}

/// A conversational agent responsible for one phase.
#[async_trait]
pub trait PhaseAgent: Send {
    /// Drives the phase over as many turns as it needs and returns exactly one signal.
    async fn run_phase(&mut self, phase: &mut PhaseHandle<'_>, io: &mut dyn TurnIo) -> PhaseSignal;

    /// Closing turn spoken when the orchestrator cuts the phase short.
    async fn farewell(&mut self, _io: &mut dyn TurnIo, _reason: &AbandonReason) {}
}

/// Creates a fresh agent each time its phase is entered.
pub trait PhaseAgentFactory: Send + Sync {
    fn create(&self, phase: &PhaseId) -> Box<dyn PhaseAgent>;
}
