//! Prompt store backed by a Nacos-style configuration server.
//!
//! Each phase has two config entries, `vocab.<phase>.<locale>.instruction`
//! (plain text) and `vocab.<phase>.<locale>.fewshot` (a JSON list), read from
//! `GET /nacos/v1/cs/configs`. The group is the environment and the tenant is
//! the namespace. When the server cannot supply an entry, a bundled fallback
//! store answers instead.

use crate::error::PromptStoreError;
use crate::phase::PhaseId;
use crate::prompt_store::{FewShotExample, PromptStore};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const CONFIG_PATH: &str = "/nacos/v1/cs/configs";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ConfigServerPromptStore {
    client: reqwest::Client,
    base_url: String,
    namespace: String,
    group: String,
    fallback: Option<Arc<dyn PromptStore>>,
}

impl ConfigServerPromptStore {
    pub fn new(
        base_url: impl Into<String>,
        namespace: impl Into<String>,
        env: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            group: env.into(),
            fallback: None,
        }
    }

    /// Store consulted when the server is unreachable or lacks an entry.
    pub fn with_fallback(mut self, fallback: Arc<dyn PromptStore>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn data_id(phase: &PhaseId, locale: &str, kind: &str) -> String {
        format!("vocab.{}.{}.{}", phase, locale, kind)
    }

    /// Fetches one config entry. `Ok(None)` means the server has no content for it.
    async fn fetch(&self, data_id: &str) -> Result<Option<String>, PromptStoreError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, CONFIG_PATH))
            .query(&[
                ("dataId", data_id),
                ("group", self.group.as_str()),
                ("tenant", self.namespace.as_str()),
            ])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| PromptStoreError::Unreachable(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(PromptStoreError::Unreachable(format!(
                "config server returned {} for {}",
                response.status(),
                data_id
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| PromptStoreError::Unreachable(e.to_string()))?;
        if body.trim().is_empty() {
            warn!(data_id, group = %self.group, "Config server returned empty content");
            return Ok(None);
        }
        Ok(Some(body))
    }

    async fn fetch_instruction(&self, phase: &PhaseId, locale: &str) -> Result<String, PromptStoreError> {
        self.fetch(&Self::data_id(phase, locale, "instruction"))
            .await?
            .ok_or_else(|| PromptStoreError::Missing {
                kind: "instruction",
                phase: phase.clone(),
                locale: locale.to_string(),
            })
    }

    async fn fetch_few_shot(
        &self,
        phase: &PhaseId,
        locale: &str,
    ) -> Result<Vec<FewShotExample>, PromptStoreError> {
        let raw = self
            .fetch(&Self::data_id(phase, locale, "fewshot"))
            .await?
            .ok_or_else(|| PromptStoreError::Missing {
                kind: "few-shot examples",
                phase: phase.clone(),
                locale: locale.to_string(),
            })?;
        serde_json::from_str(&raw).map_err(|e| PromptStoreError::Malformed {
            phase: phase.clone(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl PromptStore for ConfigServerPromptStore {
    async fn get_instruction(&self, phase: &PhaseId, locale: &str) -> Result<String, PromptStoreError> {
        match self.fetch_instruction(phase, locale).await {
            Ok(text) => Ok(text),
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    warn!(%phase, locale, error = %e, "Falling back to bundled instruction");
                    fallback.get_instruction(phase, locale).await
                }
                None => Err(e),
            },
        }
    }

    async fn get_few_shot(
        &self,
        phase: &PhaseId,
        locale: &str,
    ) -> Result<Vec<FewShotExample>, PromptStoreError> {
        match self.fetch_few_shot(phase, locale).await {
            Ok(examples) => Ok(examples),
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    debug!(%phase, locale, error = %e, "Falling back to bundled few-shot examples");
                    fallback.get_few_shot(phase, locale).await
                }
                None => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt_store::{CachedPromptStore, DirectoryPromptStore, InMemoryPromptStore};
    use axum::{
        Router,
        extract::{Query, State},
        routing::get,
    };
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// In-process stand-in for the config server's `configs` endpoint.
    #[derive(Default)]
    struct FakeConfigServer {
        entries: Mutex<HashMap<String, String>>,
        failing: AtomicBool,
        requests: AtomicU32,
    }

    impl FakeConfigServer {
        fn with_entry(self, data_id: &str, content: &str) -> Self {
            self.entries
                .lock()
                .unwrap()
                .insert(data_id.to_string(), content.to_string());
            self
        }
    }

    async fn configs(
        State(server): State<Arc<FakeConfigServer>>,
        Query(params): Query<HashMap<String, String>>,
    ) -> (StatusCode, String) {
        server.requests.fetch_add(1, Ordering::SeqCst);
        if server.failing.load(Ordering::SeqCst) {
            return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
        }
        if params.get("group").map(String::as_str) != Some("dev")
            || params.get("tenant").map(String::as_str) != Some("public")
        {
            return (StatusCode::NOT_FOUND, "config data not exist".to_string());
        }
        let entry = params
            .get("dataId")
            .and_then(|id| server.entries.lock().unwrap().get(id).cloned());
        match entry {
            Some(content) => (StatusCode::OK, content),
            None => (StatusCode::NOT_FOUND, "config data not exist".to_string()),
        }
    }

    async fn spawn_config_server(server: Arc<FakeConfigServer>) -> String {
        let app = Router::new()
            .route(CONFIG_PATH, get(configs))
            .with_state(server);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn analysis_server() -> FakeConfigServer {
        FakeConfigServer::default()
            .with_entry(
                "vocab.analysis_route.zh-CN.instruction",
                "Split {word} into prefix, root and suffix.",
            )
            .with_entry(
                "vocab.analysis_route.zh-CN.fewshot",
                r#"[{"user": "What is the root?", "assistant": "The root is 'band'."}]"#,
            )
    }

    fn bundled_prompts() -> DirectoryPromptStore {
        DirectoryPromptStore::new(concat!(env!("CARGO_MANIFEST_DIR"), "/../../prompts"), "dev")
    }

    /// A base URL nothing is listening on.
    fn dead_server() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}/", port)
    }

    #[test]
    fn test_data_id_format() {
        assert_eq!(
            ConfigServerPromptStore::data_id(&PhaseId::from("co_occurrence"), "zh-CN", "fewshot"),
            "vocab.co_occurrence.zh-CN.fewshot"
        );
    }

    #[tokio::test]
    async fn test_unreachable_without_fallback() {
        let store = ConfigServerPromptStore::new(dead_server(), "public", "dev");
        let err = store
            .get_instruction(&PhaseId::from("analysis_route"), "zh-CN")
            .await
            .unwrap_err();
        assert!(matches!(err, PromptStoreError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_uses_fallback() {
        let bundled = InMemoryPromptStore::new().with_phase(
            "analysis_route",
            "zh-CN",
            "Break {word} into its parts.",
            Vec::new(),
        );
        let store = ConfigServerPromptStore::new(dead_server(), "public", "dev")
            .with_fallback(Arc::new(bundled));

        let instruction = store
            .get_instruction(&PhaseId::from("analysis_route"), "zh-CN")
            .await
            .unwrap();
        assert_eq!(instruction, "Break {word} into its parts.");
        assert!(
            store
                .get_few_shot(&PhaseId::from("analysis_route"), "zh-CN")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_fetches_instruction_and_few_shot_from_server() {
        let server = Arc::new(analysis_server());
        let store = ConfigServerPromptStore::new(
            spawn_config_server(server.clone()).await,
            "public",
            "dev",
        );
        let phase = PhaseId::from("analysis_route");

        assert_eq!(
            store.get_instruction(&phase, "zh-CN").await.unwrap(),
            "Split {word} into prefix, root and suffix."
        );
        let few_shot = store.get_few_shot(&phase, "zh-CN").await.unwrap();
        assert_eq!(few_shot.len(), 1);
        assert_eq!(few_shot[0].assistant, "The root is 'band'.");
        assert_eq!(server.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_entry_without_fallback() {
        let server = Arc::new(analysis_server());
        let store =
            ConfigServerPromptStore::new(spawn_config_server(server).await, "public", "dev");

        let err = store
            .get_instruction(&PhaseId::from("co_occurrence"), "zh-CN")
            .await
            .unwrap_err();
        assert!(matches!(err, PromptStoreError::Missing { .. }));

        // Another namespace does not see the entries.
        let server = Arc::new(analysis_server());
        let store =
            ConfigServerPromptStore::new(spawn_config_server(server).await, "staging", "dev");
        assert!(
            store
                .get_instruction(&PhaseId::from("analysis_route"), "zh-CN")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_missing_entry_falls_back_to_bundled_directory() {
        let server = Arc::new(analysis_server());
        let store = ConfigServerPromptStore::new(spawn_config_server(server).await, "public", "dev")
            .with_fallback(Arc::new(bundled_prompts()));

        let phase = PhaseId::from("co_occurrence");
        let instruction = store.get_instruction(&phase, "zh-CN").await.unwrap();
        assert!(instruction.contains("{nickname}"));
        assert!(!store.get_few_shot(&phase, "zh-CN").await.unwrap().is_empty());

        // Entries the server has still come from the server.
        assert_eq!(
            store
                .get_instruction(&PhaseId::from("analysis_route"), "zh-CN")
                .await
                .unwrap(),
            "Split {word} into prefix, root and suffix."
        );
    }

    #[tokio::test]
    async fn test_cache_serves_stale_entry_while_server_errors() {
        let server = Arc::new(analysis_server());
        let source = ConfigServerPromptStore::new(
            spawn_config_server(server.clone()).await,
            "public",
            "dev",
        );
        // A zero ttl makes every read a refresh.
        let cached = CachedPromptStore::new(Arc::new(source), Duration::ZERO);
        let phase = PhaseId::from("analysis_route");

        let fresh = cached.get_instruction(&phase, "zh-CN").await.unwrap();
        server.failing.store(true, Ordering::SeqCst);
        let stale = cached.get_instruction(&phase, "zh-CN").await.unwrap();

        assert_eq!(stale, fresh);
        assert_eq!(server.requests.load(Ordering::SeqCst), 2);

        let err = cached
            .get_instruction(&PhaseId::from("question_answer"), "zh-CN")
            .await
            .unwrap_err();
        assert!(matches!(err, PromptStoreError::Unreachable(_)));
    }
}
