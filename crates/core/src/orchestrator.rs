//! The phase orchestrator: sequences phase agents for one learner session.
//!
//! States are the configured phases plus the terminals `Done` and `Abandoned`.
//! An agent's `Advance` moves to the next phase (or `Done` after the last
//! one); anything else ends the session. Both terminals persist the progress
//! made during the session exactly once.

use crate::agent::{AbandonReason, PhaseAgent, PhaseHandle, PhaseSignal};
use crate::context::SessionContext;
use crate::error::{PhaseLimit, SessionError};
use crate::io::{BoundedTurnIo, TurnIo};
use crate::metadata::RoomMetadata;
use crate::phase::{self, PhaseId, PhaseTable};
use crate::prompt_store::PromptStore;
use crate::repository::Repository;
use crate::resumption::{EntryDecision, GreetingStyle, ResumptionPolicy};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared collaborators. Cloning is cheap; every session gets the same ones.
#[derive(Clone)]
pub struct Collaborators {
    pub repository: Arc<dyn Repository>,
    pub prompts: Arc<dyn PromptStore>,
    pub phases: Arc<PhaseTable>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub locale: String,
    pub max_turns_per_phase: u32,
    pub max_phase_duration: Duration,
    /// Upper bound on the closing turn spoken after a ceiling is hit.
    pub farewell_timeout: Duration,
    pub retry: RetryPolicy,
    pub resumption: ResumptionPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            locale: "zh-CN".to_string(),
            max_turns_per_phase: 40,
            max_phase_duration: Duration::from_secs(900),
            farewell_timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
            resumption: ResumptionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    Done,
    Abandoned {
        phase: Option<PhaseId>,
        reason: AbandonReason,
    },
    AlreadyComplete,
}

impl SessionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::Done => "done",
            SessionOutcome::Abandoned { .. } => "abandoned",
            SessionOutcome::AlreadyComplete => "already_complete",
        }
    }

    fn abandoned(phase: &PhaseId, reason: AbandonReason) -> Self {
        SessionOutcome::Abandoned {
            phase: Some(phase.clone()),
            reason,
        }
    }
}

/// Progress notifications for the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Entered {
        entry: Option<PhaseId>,
        greeting: Option<GreetingStyle>,
    },
    PhaseStarted {
        phase: PhaseId,
    },
    PhaseCompleted {
        phase: PhaseId,
        completed_at: DateTime<Utc>,
    },
    Finished {
        outcome: SessionOutcome,
    },
}

/// Optional sink for `SessionEvent`s. A dropped receiver is logged, not fatal.
#[derive(Debug, Clone, Default)]
pub struct SessionEvents {
    tx: Option<mpsc::Sender<SessionEvent>>,
}

impl SessionEvents {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn channel(tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    async fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).await.is_err() {
                warn!("Session event receiver dropped");
            }
        }
    }
}

pub struct PhaseOrchestrator {
    collaborators: Collaborators,
    settings: OrchestratorSettings,
}

impl PhaseOrchestrator {
    pub fn new(collaborators: Collaborators, settings: OrchestratorSettings) -> Self {
        Self {
            collaborators,
            settings,
        }
    }

    pub fn phases(&self) -> &PhaseTable {
        &self.collaborators.phases
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.collaborators.repository
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Opens a session from room metadata and runs it to a terminal state.
    ///
    /// Only `InvalidMetadata` and `NotFound` are returned as errors. Every
    /// other failure is folded into an `Abandoned` outcome.
    pub async fn start(
        &self,
        metadata: &serde_json::Value,
        io: &mut dyn TurnIo,
        cancel: CancellationToken,
        events: SessionEvents,
    ) -> Result<SessionOutcome, SessionError> {
        let room = RoomMetadata::parse(metadata)?;
        info!(
            user_id = room.user_id,
            word_id = room.word_id,
            chat_id = %room.chat_id,
            "Starting vocabulary session"
        );

        let mut ctx = match SessionContext::initialize(
            &self.collaborators,
            &self.settings,
            room.user_id,
            &room.chat_id,
            room.word_id,
        )
        .await
        {
            Ok(ctx) => ctx,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                let reason = match &e {
                    SessionError::ConfigUnavailable(_) => AbandonReason::PromptUnavailable,
                    _ => AbandonReason::RepositoryUnavailable,
                };
                warn!(error = %e, "Session could not be initialized");
                let outcome = SessionOutcome::Abandoned {
                    phase: None,
                    reason,
                };
                events
                    .emit(SessionEvent::Finished {
                        outcome: outcome.clone(),
                    })
                    .await;
                return Ok(outcome);
            }
        };

        let entered = match ctx.entry() {
            EntryDecision::Start { phase, greeting } => SessionEvent::Entered {
                entry: Some(phase.clone()),
                greeting: Some(*greeting),
            },
            EntryDecision::AlreadyComplete => SessionEvent::Entered {
                entry: None,
                greeting: None,
            },
        };
        events.emit(entered).await;

        Ok(self.run(&mut ctx, io, &cancel, &events).await)
    }

    /// Runs phases from the context's entry phase until a terminal state,
    /// then persists the session's progress.
    pub async fn run(
        &self,
        ctx: &mut SessionContext,
        io: &mut dyn TurnIo,
        cancel: &CancellationToken,
        events: &SessionEvents,
    ) -> SessionOutcome {
        let mut outcome = match ctx.entry().clone() {
            EntryDecision::AlreadyComplete => {
                info!(
                    user_id = ctx.user_id(),
                    word_id = ctx.word().id,
                    "All phases already complete"
                );
                SessionOutcome::AlreadyComplete
            }
            EntryDecision::Start { phase, greeting } => {
                self.run_phases(ctx, io, cancel, events, &phase, greeting)
                    .await
            }
        };

        if let Err(e) = ctx
            .persist(self.collaborators.repository.as_ref(), &self.settings.retry)
            .await
        {
            warn!(error = %e, previous = outcome.label(), "Discarding session progress");
            let phase = match outcome {
                SessionOutcome::Abandoned { phase, .. } => phase,
                _ => None,
            };
            outcome = SessionOutcome::Abandoned {
                phase,
                reason: AbandonReason::PersistFailed,
            };
        }

        info!(
            user_id = ctx.user_id(),
            word_id = ctx.word().id,
            outcome = outcome.label(),
            completed = ctx.progress().len(),
            "Session finished"
        );
        events
            .emit(SessionEvent::Finished {
                outcome: outcome.clone(),
            })
            .await;
        outcome
    }

    async fn run_phases(
        &self,
        ctx: &mut SessionContext,
        io: &mut dyn TurnIo,
        cancel: &CancellationToken,
        events: &SessionEvents,
        entry: &PhaseId,
        greeting: GreetingStyle,
    ) -> SessionOutcome {
        let phases = self.collaborators.phases.clone();
        let Some(start) = phases.position(entry) else {
            error!(phase = %entry, "Entry phase is not in the phase table");
            return SessionOutcome::abandoned(
                entry,
                AbandonReason::AgentFailed("unknown entry phase".to_string()),
            );
        };

        let mut greeting = Some(greeting);
        for index in start..phases.len() {
            let Some(descriptor) = phases.get(index) else {
                break;
            };
            let phase = &descriptor.id;

            if cancel.is_cancelled() {
                return SessionOutcome::abandoned(phase, AbandonReason::Cancelled);
            }

            if has_nothing_to_teach(ctx, phase) {
                info!(%phase, word = %ctx.target_word(), "Word has no synonyms. Skipping phase");
                events
                    .emit(SessionEvent::PhaseStarted {
                        phase: phase.clone(),
                    })
                    .await;
                if let Err(outcome) = self.complete_phase(ctx, phase, Utc::now(), events).await {
                    return outcome;
                }
                continue;
            }

            if let Err(e) = ctx
                .ensure_prompt(
                    self.collaborators.prompts.as_ref(),
                    &self.settings.retry,
                    phase,
                )
                .await
            {
                warn!(%phase, error = %e, "Prompt unavailable for phase");
                return SessionOutcome::abandoned(phase, AbandonReason::PromptUnavailable);
            }

            info!(%phase, "Phase started");
            events
                .emit(SessionEvent::PhaseStarted {
                    phase: phase.clone(),
                })
                .await;

            let greeting = greeting.take();
            let mut agent = descriptor.factory.create(phase);
            let mut staged = None;
            let signal = self
                .drive_phase(agent.as_mut(), ctx, phase, greeting, &mut staged, io, cancel)
                .await;

            match signal {
                PhaseSignal::Advance => {
                    let at = staged.unwrap_or_else(Utc::now);
                    if let Err(outcome) = self.complete_phase(ctx, phase, at, events).await {
                        return outcome;
                    }
                }
                PhaseSignal::Abandon(reason) => {
                    info!(%phase, ?reason, "Phase abandoned");
                    if wants_farewell(&reason) {
                        let farewell = agent.farewell(io, &reason);
                        if tokio::time::timeout(self.settings.farewell_timeout, farewell)
                            .await
                            .is_err()
                        {
                            debug!(%phase, "Farewell timed out");
                        }
                    }
                    return SessionOutcome::abandoned(phase, reason);
                }
            }
        }

        SessionOutcome::Done
    }

    /// Records a completion and reports it. An error carries the outcome that
    /// ends the session.
    async fn complete_phase(
        &self,
        ctx: &mut SessionContext,
        phase: &PhaseId,
        at: DateTime<Utc>,
        events: &SessionEvents,
    ) -> Result<(), SessionOutcome> {
        if let Err(e) = ctx.mark_phase_complete(phase, at) {
            error!(%phase, error = %e, "Could not record phase completion");
            return Err(SessionOutcome::abandoned(
                phase,
                AbandonReason::AgentFailed(e.to_string()),
            ));
        }
        let completed_at = ctx
            .progress()
            .last()
            .map(|r| r.completed_at)
            .unwrap_or(at);
        info!(%phase, "Phase completed");
        events
            .emit(SessionEvent::PhaseCompleted {
                phase: phase.clone(),
                completed_at,
            })
            .await;
        Ok(())
    }

    /// Runs one agent under the cancellation token and both phase ceilings.
    #[allow(clippy::too_many_arguments)]
    async fn drive_phase(
        &self,
        agent: &mut dyn PhaseAgent,
        ctx: &SessionContext,
        phase: &PhaseId,
        greeting: Option<GreetingStyle>,
        staged: &mut Option<DateTime<Utc>>,
        io: &mut dyn TurnIo,
        cancel: &CancellationToken,
    ) -> PhaseSignal {
        let mut handle = PhaseHandle::new(ctx, phase, greeting, staged);
        let mut bounded = BoundedTurnIo::new(io, self.settings.max_turns_per_phase);
        let limit = self.settings.max_phase_duration;

        let signal = tokio::select! {
            biased;
            _ = cancel.cancelled() => PhaseSignal::Abandon(AbandonReason::Cancelled),
            result = tokio::time::timeout(limit, agent.run_phase(&mut handle, &mut bounded)) => {
                match result {
                    Ok(signal) => signal,
                    Err(_) => {
                        let err = SessionError::PhaseTimeout {
                            phase: phase.clone(),
                            limit: PhaseLimit::WallTime(limit),
                        };
                        warn!(error = %err, "Phase ceiling reached");
                        PhaseSignal::Abandon(AbandonReason::TimeLimit)
                    }
                }
            }
        };

        if signal == PhaseSignal::Abandon(AbandonReason::TurnLimit) {
            let err = SessionError::PhaseTimeout {
                phase: phase.clone(),
                limit: PhaseLimit::Turns(self.settings.max_turns_per_phase),
            };
            warn!(error = %err, "Phase ceiling reached");
        }
        signal
    }
}

/// Synonym differentiation needs at least one similar word to contrast.
fn has_nothing_to_teach(ctx: &SessionContext, id: &PhaseId) -> bool {
    id.as_str() == phase::SYNONYM_DIFFERENTIATION && ctx.word().similar_words.is_empty()
}

fn wants_farewell(reason: &AbandonReason) -> bool {
    matches!(
        reason,
        AbandonReason::TurnLimit | AbandonReason::TimeLimit | AbandonReason::AgentFailed(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProgressRecord;
    use crate::phase::{self, DEFAULT_ORDER, PhaseRegistry, parse_order};
    use crate::repository::InMemoryRepository;
    use crate::test_support::{
        Script, ScriptedFactory, ScriptedIo, collaborators_with, quiet_settings, seeded_repository,
    };
    use chrono::TimeDelta;
    use serde_json::json;

    fn metadata(user_id: i64, word_id: i64) -> serde_json::Value {
        json!({
            "room_type": "vocabulary",
            "user_id": user_id,
            "chat_id": format!("chat-{user_id}-{word_id}"),
            "word_id": word_id,
        })
    }

    fn orchestrator(repo: &InMemoryRepository, factory: &ScriptedFactory) -> PhaseOrchestrator {
        PhaseOrchestrator::new(collaborators_with(repo, factory), quiet_settings())
    }

    fn ids(records: &[ProgressRecord]) -> Vec<&str> {
        records.iter().map(|r| r.phase_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_full_run_from_fresh_start() {
        let repo = seeded_repository().await;
        let factory = ScriptedFactory::advancing();
        let orch = orchestrator(&repo, &factory);
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());

        let outcome = orch
            .start(&metadata(1, 42), &mut io, CancellationToken::new(), SessionEvents::none())
            .await
            .unwrap();

        assert_eq!(outcome, SessionOutcome::Done);
        let stored = repo.progress_of(1, 42).await;
        assert_eq!(ids(&stored), DEFAULT_ORDER.to_vec());
        assert!(stored.windows(2).all(|w| w[0].completed_at < w[1].completed_at));
        assert_eq!(factory.created(), 5);
        assert_eq!(
            factory.greetings()[0],
            (PhaseId::from(phase::ANALYSIS_ROUTE), Some(GreetingStyle::Fresh))
        );
        assert!(factory.greetings()[1..].iter().all(|(_, g)| g.is_none()));
    }

    #[tokio::test]
    async fn test_custom_order_runs_in_order() {
        let repo = seeded_repository().await;
        let factory = ScriptedFactory::advancing();
        let order = parse_order("co_occurrence, analysis_route, question_answer");
        let registry = PhaseRegistry::new().with_fallback(Arc::new(factory.clone()));
        let table = PhaseTable::from_order(&order, &registry).unwrap();
        let mut collab = collaborators_with(&repo, &factory);
        collab.phases = Arc::new(table);
        let orch = PhaseOrchestrator::new(collab, quiet_settings());
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());

        let outcome = orch
            .start(&metadata(1, 42), &mut io, CancellationToken::new(), SessionEvents::none())
            .await
            .unwrap();

        assert_eq!(outcome, SessionOutcome::Done);
        assert_eq!(
            ids(&repo.progress_of(1, 42).await),
            vec!["co_occurrence", "analysis_route", "question_answer"]
        );
    }

    #[tokio::test]
    async fn test_already_complete_runs_no_agent() {
        let repo = seeded_repository().await;
        for (i, id) in DEFAULT_ORDER.iter().enumerate() {
            repo.insert_progress(
                1,
                42,
                ProgressRecord {
                    phase_id: PhaseId::from(*id),
                    completed_at: Utc::now() - TimeDelta::days(2) + TimeDelta::minutes(i as i64),
                },
            )
            .await;
        }
        let factory = ScriptedFactory::advancing();
        let orch = orchestrator(&repo, &factory);
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());

        let outcome = orch
            .start(&metadata(1, 42), &mut io, CancellationToken::new(), SessionEvents::none())
            .await
            .unwrap();

        assert_eq!(outcome, SessionOutcome::AlreadyComplete);
        assert_eq!(factory.created(), 0);
        assert_eq!(repo.progress_of(1, 42).await.len(), 5);
    }

    #[tokio::test]
    async fn test_abandon_keeps_earlier_phases_only() {
        let repo = seeded_repository().await;
        let factory = ScriptedFactory::advancing().with_script(
            phase::SYNONYM_DIFFERENTIATION,
            Script::MarkThenAbandon(AbandonReason::Disconnected),
        );
        let orch = orchestrator(&repo, &factory);
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());

        let outcome = orch
            .start(&metadata(1, 42), &mut io, CancellationToken::new(), SessionEvents::none())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SessionOutcome::Abandoned {
                phase: Some(PhaseId::from(phase::SYNONYM_DIFFERENTIATION)),
                reason: AbandonReason::Disconnected,
            }
        );
        assert_eq!(
            ids(&repo.progress_of(1, 42).await),
            vec![phase::ANALYSIS_ROUTE, phase::WORD_CREATION_LOGIC]
        );
        assert_eq!(factory.created(), 3);
    }

    #[tokio::test]
    async fn test_resume_after_long_gap() {
        let repo = seeded_repository().await;
        repo.insert_progress(
            1,
            42,
            ProgressRecord {
                phase_id: PhaseId::from(phase::ANALYSIS_ROUTE),
                completed_at: Utc::now() - TimeDelta::days(10),
            },
        )
        .await;
        repo.insert_turn(crate::model::ChatTurn {
            chat_id: "older-chat".into(),
            user_id: 1,
            word_id: 42,
            role: crate::model::TurnRole::User,
            content: "bye".into(),
            phase: Some(PhaseId::from(phase::ANALYSIS_ROUTE)),
            created_at: Utc::now() - TimeDelta::days(10),
        })
        .await;
        let factory = ScriptedFactory::advancing();
        let orch = orchestrator(&repo, &factory);
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());
        let (tx, mut rx) = mpsc::channel(32);

        let outcome = orch
            .start(&metadata(1, 42), &mut io, CancellationToken::new(), SessionEvents::channel(tx))
            .await
            .unwrap();

        assert_eq!(outcome, SessionOutcome::Done);
        assert_eq!(factory.created(), 4);
        assert_eq!(
            factory.greetings()[0],
            (PhaseId::from(phase::WORD_CREATION_LOGIC), Some(GreetingStyle::WarmReturn))
        );
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::Entered {
                entry: Some(PhaseId::from(phase::WORD_CREATION_LOGIC)),
                greeting: Some(GreetingStyle::WarmReturn),
            })
        );
        assert_eq!(repo.progress_of(1, 42).await.len(), 5);
    }

    #[tokio::test]
    async fn test_resume_shortly_after_is_brief_continue() {
        let repo = seeded_repository().await;
        repo.insert_progress(
            1,
            42,
            ProgressRecord {
                phase_id: PhaseId::from(phase::ANALYSIS_ROUTE),
                completed_at: Utc::now() - TimeDelta::minutes(2),
            },
        )
        .await;
        repo.insert_turn(crate::model::ChatTurn {
            chat_id: "chat-1-42".into(),
            user_id: 1,
            word_id: 42,
            role: crate::model::TurnRole::User,
            content: "one moment".into(),
            phase: Some(PhaseId::from(phase::ANALYSIS_ROUTE)),
            created_at: Utc::now() - TimeDelta::minutes(1),
        })
        .await;
        let factory = ScriptedFactory::advancing();
        let orch = orchestrator(&repo, &factory);
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());

        orch.start(&metadata(1, 42), &mut io, CancellationToken::new(), SessionEvents::none())
            .await
            .unwrap();

        assert_eq!(
            factory.greetings()[0],
            (PhaseId::from(phase::WORD_CREATION_LOGIC), Some(GreetingStyle::BriefContinue))
        );
    }

    #[tokio::test]
    async fn test_unknown_phase_in_progress_restarts_fresh() {
        let repo = seeded_repository().await;
        repo.insert_progress(
            1,
            42,
            ProgressRecord {
                phase_id: PhaseId::from("legacy_phase"),
                completed_at: Utc::now() - TimeDelta::days(1),
            },
        )
        .await;
        let factory = ScriptedFactory::advancing();
        let orch = orchestrator(&repo, &factory);
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());

        let outcome = orch
            .start(&metadata(1, 42), &mut io, CancellationToken::new(), SessionEvents::none())
            .await
            .unwrap();

        assert_eq!(outcome, SessionOutcome::Done);
        assert_eq!(
            factory.greetings()[0],
            (PhaseId::from(phase::ANALYSIS_ROUTE), Some(GreetingStyle::Fresh))
        );
    }

    #[tokio::test]
    async fn test_turn_ceiling_abandons_with_farewell() {
        let repo = seeded_repository().await;
        let factory = ScriptedFactory::advancing()
            .with_script(phase::ANALYSIS_ROUTE, Script::ConsumeTurns);
        let mut settings = quiet_settings();
        settings.max_turns_per_phase = 2;
        let orch = PhaseOrchestrator::new(collaborators_with(&repo, &factory), settings);
        let mut io = ScriptedIo::endless("I think so");

        let outcome = orch
            .start(&metadata(1, 42), &mut io, CancellationToken::new(), SessionEvents::none())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SessionOutcome::Abandoned {
                phase: Some(PhaseId::from(phase::ANALYSIS_ROUTE)),
                reason: AbandonReason::TurnLimit,
            }
        );
        assert_eq!(io.spoken.last().map(String::as_str), Some("goodbye"));
        assert!(repo.progress_of(1, 42).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_time_ceiling_abandons() {
        let repo = seeded_repository().await;
        let factory =
            ScriptedFactory::advancing().with_script(phase::WORD_CREATION_LOGIC, Script::Hang);
        let orch = orchestrator(&repo, &factory);
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());

        let outcome = orch
            .start(&metadata(1, 42), &mut io, CancellationToken::new(), SessionEvents::none())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SessionOutcome::Abandoned {
                phase: Some(PhaseId::from(phase::WORD_CREATION_LOGIC)),
                reason: AbandonReason::TimeLimit,
            }
        );
        assert_eq!(ids(&repo.progress_of(1, 42).await), vec![phase::ANALYSIS_ROUTE]);
    }

    #[tokio::test]
    async fn test_cancellation_mid_phase() {
        let repo = seeded_repository().await;
        let factory =
            ScriptedFactory::advancing().with_script(phase::CO_OCCURRENCE, Script::Hang);
        let orch = orchestrator(&repo, &factory);
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(32);

        let trigger = cancel.clone();
        let watcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event
                    == (SessionEvent::PhaseStarted {
                        phase: PhaseId::from(phase::CO_OCCURRENCE),
                    })
                {
                    trigger.cancel();
                }
            }
        });

        let outcome = orch
            .start(&metadata(1, 42), &mut io, cancel, SessionEvents::channel(tx))
            .await
            .unwrap();
        watcher.await.unwrap();

        assert_eq!(
            outcome,
            SessionOutcome::Abandoned {
                phase: Some(PhaseId::from(phase::CO_OCCURRENCE)),
                reason: AbandonReason::Cancelled,
            }
        );
        assert_eq!(repo.progress_of(1, 42).await.len(), 3);
    }

    #[tokio::test]
    async fn test_persist_failure_discards_progress() {
        let repo = seeded_repository().await;
        repo.fail_next_commits(1);
        let factory = ScriptedFactory::advancing();
        let orch = orchestrator(&repo, &factory);
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());

        let outcome = orch
            .start(&metadata(1, 42), &mut io, CancellationToken::new(), SessionEvents::none())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SessionOutcome::Abandoned {
                phase: None,
                reason: AbandonReason::PersistFailed,
            }
        );
        assert!(repo.progress_of(1, 42).await.is_empty());
    }

    #[tokio::test]
    async fn test_lazy_prompt_failure_abandons() {
        let repo = seeded_repository().await;
        let factory = ScriptedFactory::advancing();
        let mut collab = collaborators_with(&repo, &factory);
        collab.prompts = Arc::new(
            crate::prompt_store::InMemoryPromptStore::new().with_phase(
                phase::ANALYSIS_ROUTE,
                "zh-CN",
                "Explain {word}",
                Vec::new(),
            ),
        );
        let orch = PhaseOrchestrator::new(collab, quiet_settings());
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());

        let outcome = orch
            .start(&metadata(1, 42), &mut io, CancellationToken::new(), SessionEvents::none())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SessionOutcome::Abandoned {
                phase: Some(PhaseId::from(phase::WORD_CREATION_LOGIC)),
                reason: AbandonReason::PromptUnavailable,
            }
        );
        assert_eq!(ids(&repo.progress_of(1, 42).await), vec![phase::ANALYSIS_ROUTE]);
    }

    #[tokio::test]
    async fn test_marking_twice_records_once() {
        let repo = seeded_repository().await;
        let factory = ScriptedFactory::advancing()
            .with_script(phase::ANALYSIS_ROUTE, Script::MarkTwiceAndAdvance);
        let orch = orchestrator(&repo, &factory);
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());

        orch.start(&metadata(1, 42), &mut io, CancellationToken::new(), SessionEvents::none())
            .await
            .unwrap();

        let stored = repo.progress_of(1, 42).await;
        assert_eq!(stored.len(), 5);
        assert_eq!(
            stored
                .iter()
                .filter(|r| r.phase_id.as_str() == phase::ANALYSIS_ROUTE)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_invalid_metadata_and_not_found_are_errors() {
        let repo = seeded_repository().await;
        let factory = ScriptedFactory::advancing();
        let orch = orchestrator(&repo, &factory);
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());

        let err = orch
            .start(&json!({"room_type": "vocabulary"}), &mut io, CancellationToken::new(), SessionEvents::none())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidMetadata(_)));

        let err = orch
            .start(&metadata(1, 4040), &mut io, CancellationToken::new(), SessionEvents::none())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound { entity: "word", .. }));
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_missing_entry_prompt_is_an_outcome() {
        let repo = seeded_repository().await;
        let factory = ScriptedFactory::advancing();
        let mut collab = collaborators_with(&repo, &factory);
        collab.prompts = Arc::new(crate::prompt_store::InMemoryPromptStore::new());
        let orch = PhaseOrchestrator::new(collab, quiet_settings());
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());

        let outcome = orch
            .start(&metadata(1, 42), &mut io, CancellationToken::new(), SessionEvents::none())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Abandoned {
                phase: None,
                reason: AbandonReason::PromptUnavailable,
            }
        );
    }

    #[tokio::test]
    async fn test_synonym_phase_completes_without_dialogue_for_word_without_synonyms() {
        let repo = seeded_repository().await;
        let factory = ScriptedFactory::advancing();
        let orch = orchestrator(&repo, &factory);
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());
        let (tx, mut rx) = mpsc::channel(64);

        let outcome = orch
            .start(&metadata(1, 44), &mut io, CancellationToken::new(), SessionEvents::channel(tx))
            .await
            .unwrap();

        assert_eq!(outcome, SessionOutcome::Done);
        assert_eq!(ids(&repo.progress_of(1, 44).await), DEFAULT_ORDER.to_vec());
        assert_eq!(factory.created(), 4);
        assert!(
            factory
                .greetings()
                .iter()
                .all(|(id, _)| id.as_str() != phase::SYNONYM_DIFFERENTIATION)
        );

        let mut completed = Vec::new();
        while let Some(event) = rx.recv().await {
            if let SessionEvent::PhaseCompleted { phase, .. } = event {
                completed.push(phase.to_string());
            }
        }
        assert_eq!(completed, DEFAULT_ORDER.to_vec());
    }

    #[tokio::test]
    async fn test_skipped_entry_phase_hands_greeting_to_next_phase() {
        let repo = seeded_repository().await;
        let now = Utc::now();
        for (i, id) in [phase::ANALYSIS_ROUTE, phase::WORD_CREATION_LOGIC].iter().enumerate() {
            repo.insert_progress(
                1,
                44,
                ProgressRecord {
                    phase_id: PhaseId::from(*id),
                    completed_at: now - TimeDelta::days(3) + TimeDelta::minutes(i as i64),
                },
            )
            .await;
        }
        let factory = ScriptedFactory::advancing();
        let orch = orchestrator(&repo, &factory);
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());

        let outcome = orch
            .start(&metadata(1, 44), &mut io, CancellationToken::new(), SessionEvents::none())
            .await
            .unwrap();

        assert_eq!(outcome, SessionOutcome::Done);
        assert_eq!(factory.created(), 2);
        let greetings = factory.greetings();
        assert_eq!(greetings[0].0, PhaseId::from(phase::CO_OCCURRENCE));
        assert!(greetings[0].1.is_some());
        assert_eq!(greetings[1].1, None);
        assert_eq!(repo.progress_of(1, 44).await.len(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_are_isolated() {
        let repo = seeded_repository().await;
        let factory = ScriptedFactory::advancing().with_script(
            phase::CO_OCCURRENCE,
            Script::AbandonFor(2, AbandonReason::Disconnected),
        );
        let orch = Arc::new(orchestrator(&repo, &factory));

        let mut handles = Vec::new();
        for (user_id, word_id) in [(1, 42), (2, 43)] {
            let orch = orch.clone();
            handles.push(tokio::spawn(async move {
                let mut io = ScriptedIo::with_turns(Vec::<&str>::new());
                orch.start(
                    &metadata(user_id, word_id),
                    &mut io,
                    CancellationToken::new(),
                    SessionEvents::none(),
                )
                .await
            }));
        }
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(outcomes[0], SessionOutcome::Done);
        assert!(matches!(outcomes[1], SessionOutcome::Abandoned { .. }));
        assert_eq!(repo.progress_of(1, 42).await.len(), 5);
        assert_eq!(repo.progress_of(2, 43).await.len(), 3);
        assert!(repo.progress_of(1, 43).await.is_empty());
    }

    #[tokio::test]
    async fn test_events_mirror_progress() {
        let repo = seeded_repository().await;
        let factory = ScriptedFactory::advancing();
        let orch = orchestrator(&repo, &factory);
        let mut io = ScriptedIo::with_turns(Vec::<&str>::new());
        let (tx, mut rx) = mpsc::channel(64);

        orch.start(&metadata(1, 42), &mut io, CancellationToken::new(), SessionEvents::channel(tx))
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        // entered + 5 x (started, completed) + finished
        assert_eq!(events.len(), 12);
        assert!(matches!(events[1], SessionEvent::PhaseStarted { .. }));
        assert!(matches!(events[2], SessionEvent::PhaseCompleted { .. }));
        assert_eq!(
            events.last(),
            Some(&SessionEvent::Finished {
                outcome: SessionOutcome::Done
            })
        );
    }
}
