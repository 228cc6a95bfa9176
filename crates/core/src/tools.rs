//! Phase tool service
//!
//! MCP tools exposed to the LLM while it runs a phase. The service owns a small
//! shared state record; the agent inspects it after each tool round to learn
//! whether the phase goal has been reached.

use crate::context::SessionContext;
use crate::model::{SentenceEvaluation, SentenceType, UserId, WordId};
use crate::phase::PhaseId;
use crate::repository::Repository;
use rmcp::{
    ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const MAX_SCORE: u8 = 10;

/// What the LLM can see and change about the running phase.
#[derive(Serialize, Debug, Clone)]
pub struct PhaseToolState {
    pub phase: PhaseId,
    pub word: String,
    /// Phases finished before this one, in this or earlier sessions.
    pub completed_phases: Vec<PhaseId>,
    /// Set once `complete_phase` has been called, with the LLM's reason.
    pub completion: Option<String>,
    pub evaluations_saved: u32,
}

impl PhaseToolState {
    pub fn new(ctx: &SessionContext, phase: &PhaseId) -> Self {
        let completed_phases = ctx
            .phases()
            .ids()
            .filter(|id| ctx.is_complete(id))
            .cloned()
            .collect();
        Self {
            phase: phase.clone(),
            word: ctx.target_word().to_string(),
            completed_phases,
            completion: None,
            evaluations_saved: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completion.is_some()
    }
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct CompletePhaseArgs {
    #[schemars(description = "One sentence on what the learner demonstrated")]
    pub reason: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct SentenceEvaluationArgs {
    #[schemars(description = "The sentence exactly as the learner said it")]
    pub sentence: String,
    #[schemars(description = "Chinese translation of the sentence's meaning")]
    pub meaning_cn: String,
    #[schemars(description = "Grammar accuracy score from 0 to 10")]
    pub grammar_accuracy: u8,
    #[schemars(description = "Vocabulary proficiency score from 0 to 10")]
    pub vocabulary_proficiency: u8,
    #[schemars(description = "Sentence complexity score from 0 to 10")]
    pub sentence_complexity: u8,
    pub sentence_type: SentenceType,
    #[schemars(description = "Short feedback for the learner")]
    pub explanation: String,
    pub corrected_sentence: String,
    #[schemars(description = "How a native speaker would phrase it")]
    pub native_sentence: String,
}

pub struct PhaseToolService {
    pub state: Arc<Mutex<PhaseToolState>>,
    repository: Arc<dyn Repository>,
    /// The session's learner, word and chat. Evaluations are filed under these.
    user_id: UserId,
    word_id: WordId,
    chat_id: String,
    tool_router: ToolRouter<Self>,
}

#[tool_handler]
impl ServerHandler for PhaseToolService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[tool_router]
impl PhaseToolService {
    pub fn new(
        state: Arc<Mutex<PhaseToolState>>,
        repository: Arc<dyn Repository>,
        ctx: &SessionContext,
    ) -> Self {
        Self {
            state,
            repository,
            user_id: ctx.user_id(),
            word_id: ctx.word().id,
            chat_id: ctx.chat_id().to_string(),
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Get the current phase, the target word and which phases the learner has already finished."
    )]
    pub async fn get_phase_status(&self) -> Result<String, String> {
        info!("Executing tool 'get_phase_status'");
        let state = self.state.lock().await;
        serde_json::to_string(&*state).map_err(|e| format!("Failed to serialize phase state: {}", e))
    }

    /// Flags the phase goal as met. The agent advances after its next reply.
    #[tool(
        description = "Mark the current phase as complete once the learner has met its goal. Afterwards give a short closing remark."
    )]
    pub async fn complete_phase(&self, args: Parameters<CompletePhaseArgs>) -> Result<String, String> {
        info!(reason = %args.0.reason, "Executing tool 'complete_phase'");
        let mut state = self.state.lock().await;
        if state.completion.is_some() {
            return Ok(format!("OK. Phase '{}' is already complete.", state.phase));
        }
        state.completion = Some(args.0.reason);
        Ok(format!(
            "OK. Phase '{}' is complete. Close this part of the lesson in one or two sentences.",
            state.phase
        ))
    }

    /// Records scored feedback on a sentence the learner produced.
    #[tool(
        description = "Save an evaluation of a sentence the learner made with the target word. Scores range from 0 to 10."
    )]
    pub async fn save_sentence_evaluation(
        &self,
        args: Parameters<SentenceEvaluationArgs>,
    ) -> Result<String, String> {
        let args = args.0;
        info!(sentence = %args.sentence, "Executing tool 'save_sentence_evaluation'");
        for (name, score) in [
            ("grammar_accuracy", args.grammar_accuracy),
            ("vocabulary_proficiency", args.vocabulary_proficiency),
            ("sentence_complexity", args.sentence_complexity),
        ] {
            if score > MAX_SCORE {
                return Err(format!("{} must be between 0 and {}, got {}", name, MAX_SCORE, score));
            }
        }

        let evaluation = SentenceEvaluation {
            user_id: self.user_id,
            chat_id: self.chat_id.clone(),
            word_id: self.word_id,
            sentence: args.sentence,
            meaning_cn: args.meaning_cn,
            grammar_accuracy: args.grammar_accuracy,
            vocabulary_proficiency: args.vocabulary_proficiency,
            sentence_complexity: args.sentence_complexity,
            sentence_type: args.sentence_type,
            explanation: args.explanation,
            corrected_sentence: args.corrected_sentence,
            native_sentence: args.native_sentence,
        };
        if let Err(e) = self.repository.save_sentence_evaluation(&evaluation).await {
            warn!(error = %e, "Failed to save sentence evaluation");
            return Err(format!("Could not save the evaluation: {}", e));
        }

        let mut state = self.state.lock().await;
        state.evaluations_saved += 1;
        Ok(format!(
            "OK. Evaluation saved ({} so far).",
            state.evaluations_saved
        ))
    }
}
