//! Scripted collaborators and fixtures shared by unit tests.

use crate::agent::{AbandonReason, PhaseAgent, PhaseAgentFactory, PhaseHandle, PhaseSignal};
use crate::error::TurnError;
use crate::io::TurnIo;
use crate::model::{UserId, UserProfile, WordRecord};
use crate::orchestrator::{Collaborators, OrchestratorSettings};
use crate::phase::{DEFAULT_ORDER, PhaseId, PhaseRegistry, PhaseTable, default_order};
use crate::prompt_store::{FewShotExample, InMemoryPromptStore};
use crate::repository::InMemoryRepository;
use crate::resumption::GreetingStyle;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) const LOCALE: &str = "zh-CN";

/// What a scripted agent does when its phase runs.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// Speak once, mark complete, advance.
    Advance,
    /// Mark complete, then abandon anyway.
    MarkThenAbandon(AbandonReason),
    /// Abandon only when the session belongs to this user; advance otherwise.
    AbandonFor(UserId, AbandonReason),
    MarkTwiceAndAdvance,
    /// Keep asking for learner turns until the transport refuses.
    ConsumeTurns,
    /// Never return.
    Hang,
}

#[derive(Clone)]
pub(crate) struct ScriptedFactory {
    default: Script,
    overrides: HashMap<PhaseId, Script>,
    created: Arc<AtomicUsize>,
    greetings: Arc<Mutex<Vec<(PhaseId, Option<GreetingStyle>)>>>,
}

impl ScriptedFactory {
    pub(crate) fn advancing() -> Self {
        Self {
            default: Script::Advance,
            overrides: HashMap::new(),
            created: Arc::new(AtomicUsize::new(0)),
            greetings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn with_script(mut self, phase: &str, script: Script) -> Self {
        self.overrides.insert(PhaseId::from(phase), script);
        self
    }

    /// Number of agents created so far.
    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Greeting each agent saw, in run order.
    pub(crate) fn greetings(&self) -> Vec<(PhaseId, Option<GreetingStyle>)> {
        self.greetings.lock().unwrap().clone()
    }
}

impl PhaseAgentFactory for ScriptedFactory {
    fn create(&self, phase: &PhaseId) -> Box<dyn PhaseAgent> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let script = self
            .overrides
            .get(phase)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        Box::new(ScriptedAgent {
            script,
            greetings: self.greetings.clone(),
        })
    }
}

struct ScriptedAgent {
    script: Script,
    greetings: Arc<Mutex<Vec<(PhaseId, Option<GreetingStyle>)>>>,
}

#[async_trait]
impl PhaseAgent for ScriptedAgent {
    async fn run_phase(&mut self, phase: &mut PhaseHandle<'_>, io: &mut dyn TurnIo) -> PhaseSignal {
        self.greetings
            .lock()
            .unwrap()
            .push((phase.phase_id().clone(), phase.greeting()));

        match self.script.clone() {
            Script::Advance => {
                if let Err(e) = io.speak(&format!("{} done", phase.phase_id())).await {
                    return PhaseSignal::Abandon(e.into());
                }
                phase.mark_phase_complete();
                PhaseSignal::Advance
            }
            Script::MarkThenAbandon(reason) => {
                phase.mark_phase_complete();
                PhaseSignal::Abandon(reason)
            }
            Script::AbandonFor(user_id, reason) => {
                if phase.context().user_id() == user_id {
                    PhaseSignal::Abandon(reason)
                } else {
                    phase.mark_phase_complete();
                    PhaseSignal::Advance
                }
            }
            Script::MarkTwiceAndAdvance => {
                assert!(phase.mark_phase_complete());
                assert!(!phase.mark_phase_complete());
                PhaseSignal::Advance
            }
            Script::ConsumeTurns => loop {
                match io.next_user_turn().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => return PhaseSignal::Abandon(AbandonReason::Disconnected),
                    Err(e) => return PhaseSignal::Abandon(e.into()),
                }
            },
            Script::Hang => std::future::pending::<PhaseSignal>().await,
        }
    }

    async fn farewell(&mut self, io: &mut dyn TurnIo, _reason: &AbandonReason) {
        let _ = io.speak("goodbye").await;
    }
}

/// A transport fed from a fixed list of learner turns.
///
/// Once the list is exhausted the learner is considered gone, unless the IO
/// was built with `endless`.
pub(crate) struct ScriptedIo {
    turns: VecDeque<String>,
    repeat: Option<String>,
    pub(crate) spoken: Vec<String>,
}

impl ScriptedIo {
    pub(crate) fn with_turns<I, S>(turns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            turns: turns.into_iter().map(Into::into).collect(),
            repeat: None,
            spoken: Vec::new(),
        }
    }

    pub(crate) fn endless(turn: &str) -> Self {
        Self {
            turns: VecDeque::new(),
            repeat: Some(turn.to_string()),
            spoken: Vec::new(),
        }
    }
}

#[async_trait]
impl TurnIo for ScriptedIo {
    async fn next_user_turn(&mut self) -> Result<Option<String>, TurnError> {
        Ok(self.turns.pop_front().or_else(|| self.repeat.clone()))
    }

    async fn speak(&mut self, text: &str) -> Result<(), TurnError> {
        self.spoken.push(text.to_string());
        Ok(())
    }
}

pub(crate) fn table_for(factory: &ScriptedFactory) -> PhaseTable {
    let registry = PhaseRegistry::new().with_fallback(Arc::new(factory.clone()));
    PhaseTable::from_order(&default_order(), &registry).unwrap()
}

pub(crate) fn default_table() -> PhaseTable {
    table_for(&ScriptedFactory::advancing())
}

pub(crate) fn prompt_store() -> InMemoryPromptStore {
    DEFAULT_ORDER
        .iter()
        .fold(InMemoryPromptStore::new(), |store, phase| {
            store.with_phase(
                *phase,
                LOCALE,
                &format!("Guide {{nickname}} through {} for the word {{word}}.", phase),
                vec![FewShotExample {
                    user: "I'm ready.".to_string(),
                    assistant: "Great, let's look at {word}.".to_string(),
                }],
            )
        })
}

/// Learners 1 and 2, words 42 and 43, and word 44 which has no synonyms.
pub(crate) async fn seeded_repository() -> InMemoryRepository {
    let repo = InMemoryRepository::new();
    repo.insert_user(UserProfile {
        id: 1,
        nickname: "Lin".to_string(),
        hobbies: "basketball".to_string(),
        english_level: Default::default(),
    })
    .await;
    repo.insert_user(UserProfile {
        id: 2,
        nickname: "Mei".to_string(),
        hobbies: "painting".to_string(),
        english_level: Default::default(),
    })
    .await;
    repo.insert_word(WordRecord {
        id: 42,
        word: "abandon".to_string(),
        example_sentence: Some("They had to abandon the car.".to_string()),
        similar_words: vec!["desert".to_string(), "forsake".to_string()],
    })
    .await;
    repo.insert_word(WordRecord {
        id: 43,
        word: "brisk".to_string(),
        example_sentence: None,
        similar_words: vec!["quick".to_string()],
    })
    .await;
    repo.insert_word(WordRecord {
        id: 44,
        word: "photosynthesis".to_string(),
        example_sentence: None,
        similar_words: Vec::new(),
    })
    .await;
    repo
}

pub(crate) fn collaborators_with(
    repo: &InMemoryRepository,
    factory: &ScriptedFactory,
) -> Collaborators {
    Collaborators {
        repository: Arc::new(repo.clone()),
        prompts: Arc::new(prompt_store()),
        phases: Arc::new(table_for(factory)),
    }
}

pub(crate) fn collaborators(repo: &InMemoryRepository) -> Collaborators {
    collaborators_with(repo, &ScriptedFactory::advancing())
}

/// Default settings without retry backoff.
pub(crate) fn quiet_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        retry: RetryPolicy::none(),
        ..OrchestratorSettings::default()
    }
}
