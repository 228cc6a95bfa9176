//! Prompt store: per-phase instructions and few-shot examples.
//!
//! Lookups are keyed by phase id and locale; the environment is fixed per
//! store instance. Stores may serve slightly stale content, so sessions copy
//! what they need into their own cache once and never re-read mid-phase.

use crate::error::PromptStoreError;
use crate::phase::PhaseId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

/// One example exchange shown to the model before the live conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub user: String,
    pub assistant: String,
}

/// Everything a phase agent needs from the prompt store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePrompt {
    pub instruction: String,
    pub few_shot: Vec<FewShotExample>,
}

#[async_trait]
pub trait PromptStore: Send + Sync {
    async fn get_instruction(&self, phase: &PhaseId, locale: &str) -> Result<String, PromptStoreError>;

    async fn get_few_shot(
        &self,
        phase: &PhaseId,
        locale: &str,
    ) -> Result<Vec<FewShotExample>, PromptStoreError>;
}

/// Loads the instruction and few-shot examples for one phase.
///
/// Missing few-shot examples are not an error; a phase can run on its
/// instruction alone.
pub async fn load_phase_prompt(
    store: &dyn PromptStore,
    phase: &PhaseId,
    locale: &str,
) -> Result<PhasePrompt, PromptStoreError> {
    let instruction = store.get_instruction(phase, locale).await?;
    let few_shot = match store.get_few_shot(phase, locale).await {
        Ok(examples) => examples,
        Err(PromptStoreError::Missing { .. }) => {
            debug!(%phase, locale, "No few-shot examples configured");
            Vec::new()
        }
        Err(e) => return Err(e),
    };
    Ok(PhasePrompt {
        instruction,
        few_shot,
    })
}

/// A fixed in-memory store, used in tests and as a bundled fallback.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPromptStore {
    prompts: HashMap<(PhaseId, String), PhasePrompt>,
}

impl InMemoryPromptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_phase(
        mut self,
        phase: impl Into<PhaseId>,
        locale: &str,
        instruction: &str,
        few_shot: Vec<FewShotExample>,
    ) -> Self {
        self.prompts.insert(
            (phase.into(), locale.to_string()),
            PhasePrompt {
                instruction: instruction.to_string(),
                few_shot,
            },
        );
        self
    }

    fn lookup(&self, phase: &PhaseId, locale: &str) -> Option<&PhasePrompt> {
        self.prompts.get(&(phase.clone(), locale.to_string()))
    }
}

#[async_trait]
impl PromptStore for InMemoryPromptStore {
    async fn get_instruction(&self, phase: &PhaseId, locale: &str) -> Result<String, PromptStoreError> {
        self.lookup(phase, locale)
            .map(|p| p.instruction.clone())
            .ok_or_else(|| PromptStoreError::Missing {
                kind: "instruction",
                phase: phase.clone(),
                locale: locale.to_string(),
            })
    }

    async fn get_few_shot(
        &self,
        phase: &PhaseId,
        locale: &str,
    ) -> Result<Vec<FewShotExample>, PromptStoreError> {
        self.lookup(phase, locale)
            .map(|p| p.few_shot.clone())
            .ok_or_else(|| PromptStoreError::Missing {
                kind: "few-shot examples",
                phase: phase.clone(),
                locale: locale.to_string(),
            })
    }
}

/// Reads prompts from `<root>/<env>/<locale>/<phase>.md` and
/// `<phase>.fewshot.json`.
#[derive(Debug, Clone)]
pub struct DirectoryPromptStore {
    root: PathBuf,
    env: String,
}

impl DirectoryPromptStore {
    pub fn new(root: impl Into<PathBuf>, env: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            env: env.into(),
        }
    }

    fn path_for(&self, phase: &PhaseId, locale: &str, suffix: &str) -> PathBuf {
        self.root
            .join(&self.env)
            .join(locale)
            .join(format!("{}{}", phase, suffix))
    }

    async fn read(
        &self,
        phase: &PhaseId,
        locale: &str,
        suffix: &str,
        kind: &'static str,
    ) -> Result<String, PromptStoreError> {
        let path = self.path_for(phase, locale, suffix);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PromptStoreError::Missing {
                kind,
                phase: phase.clone(),
                locale: locale.to_string(),
            }),
            Err(e) => Err(PromptStoreError::Unreachable(format!(
                "{}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl PromptStore for DirectoryPromptStore {
    async fn get_instruction(&self, phase: &PhaseId, locale: &str) -> Result<String, PromptStoreError> {
        self.read(phase, locale, ".md", "instruction").await
    }

    async fn get_few_shot(
        &self,
        phase: &PhaseId,
        locale: &str,
    ) -> Result<Vec<FewShotExample>, PromptStoreError> {
        let raw = self
            .read(phase, locale, ".fewshot.json", "few-shot examples")
            .await?;
        serde_json::from_str(&raw).map_err(|e| PromptStoreError::Malformed {
            phase: phase.clone(),
            reason: e.to_string(),
        })
    }
}

struct Cached<T> {
    value: T,
    fetched_at: Instant,
}

type CacheMap<T> = RwLock<HashMap<(PhaseId, String), Cached<T>>>;

/// Process-wide cache in front of a slower store.
///
/// Entries are refreshed after `ttl`. A failed refresh keeps serving the stale
/// entry, so a config-server blip never takes running sessions down.
pub struct CachedPromptStore {
    inner: Arc<dyn PromptStore>,
    ttl: Duration,
    instructions: CacheMap<String>,
    few_shots: CacheMap<Vec<FewShotExample>>,
}

impl CachedPromptStore {
    pub fn new(inner: Arc<dyn PromptStore>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            instructions: RwLock::new(HashMap::new()),
            few_shots: RwLock::new(HashMap::new()),
        }
    }

    async fn cached_or_fetch<T, F>(
        &self,
        cache: &CacheMap<T>,
        phase: &PhaseId,
        locale: &str,
        fetch: F,
    ) -> Result<T, PromptStoreError>
    where
        T: Clone,
        F: std::future::Future<Output = Result<T, PromptStoreError>>,
    {
        let key = (phase.clone(), locale.to_string());
        if let Some(entry) = cache.read().await.get(&key) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.value.clone());
            }
        }

        match fetch.await {
            Ok(value) => {
                cache.write().await.insert(
                    key,
                    Cached {
                        value: value.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(value)
            }
            Err(e) => match cache.read().await.get(&key) {
                Some(stale) => {
                    warn!(%phase, locale, error = %e, "Prompt refresh failed; serving stale entry");
                    Ok(stale.value.clone())
                }
                None => Err(e),
            },
        }
    }
}

#[async_trait]
impl PromptStore for CachedPromptStore {
    async fn get_instruction(&self, phase: &PhaseId, locale: &str) -> Result<String, PromptStoreError> {
        self.cached_or_fetch(
            &self.instructions,
            phase,
            locale,
            self.inner.get_instruction(phase, locale),
        )
        .await
    }

    async fn get_few_shot(
        &self,
        phase: &PhaseId,
        locale: &str,
    ) -> Result<Vec<FewShotExample>, PromptStoreError> {
        self.cached_or_fetch(
            &self.few_shots,
            phase,
            locale,
            self.inner.get_few_shot(phase, locale),
        )
        .await
    }
}
