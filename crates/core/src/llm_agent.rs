//! The LLM-backed phase agent used for every configured phase.
//!
//! Each phase gets its own in-process MCP tool service. A turn is one ReAct
//! cycle: the LLM either answers directly or calls tools, in which case the
//! results are fed back and the reply is streamed afterwards.

use crate::agent::{AbandonReason, PhaseAgent, PhaseAgentFactory, PhaseHandle, PhaseSignal};
use crate::context::SessionContext;
use crate::error::TurnError;
use crate::io::TurnIo;
use crate::llm_client::{LLMAction, LLMClient, ToolCall, collect_stream};
use crate::model::TurnRole;
use crate::phase::PhaseId;
use crate::prompt_store::PhasePrompt;
use crate::repository::Repository;
use crate::resumption::GreetingStyle;
use crate::tools::{PhaseToolService, PhaseToolState};
use anyhow::{Context, Result};
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionToolArgs,
    FunctionObjectArgs,
};
use async_trait::async_trait;
use rmcp::{
    ServiceExt,
    model::{CallToolRequestParam, RawContent},
    service::{RoleClient, RunningService},
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const DEFAULT_HISTORY_WINDOW: usize = 20;
const FAREWELL: &str =
    "We need to stop here for now. Great effort today, and we'll pick up right where we left off next time!";

pub struct LlmPhaseAgentFactory {
    llm: Arc<dyn LLMClient>,
    repository: Arc<dyn Repository>,
    history_window: usize,
}

impl LlmPhaseAgentFactory {
    pub fn new(llm: Arc<dyn LLMClient>, repository: Arc<dyn Repository>) -> Self {
        Self {
            llm,
            repository,
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }

    /// Number of earlier chat turns replayed into the prompt.
    pub fn with_history_window(mut self, turns: usize) -> Self {
        self.history_window = turns;
        self
    }
}

impl PhaseAgentFactory for LlmPhaseAgentFactory {
    fn create(&self, phase: &PhaseId) -> Box<dyn PhaseAgent> {
        debug!(%phase, "Creating LLM phase agent");
        Box::new(LlmPhaseAgent {
            llm: self.llm.clone(),
            repository: self.repository.clone(),
            history_window: self.history_window,
        })
    }
}

pub struct LlmPhaseAgent {
    llm: Arc<dyn LLMClient>,
    repository: Arc<dyn Repository>,
    history_window: usize,
}

/// Aborts the tool service task when the phase ends, however it ends.
struct ToolTask(JoinHandle<()>);

impl Drop for ToolTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl PhaseAgent for LlmPhaseAgent {
    async fn run_phase(&mut self, phase: &mut PhaseHandle<'_>, io: &mut dyn TurnIo) -> PhaseSignal {
        match self.converse(phase, io).await {
            Ok(signal) => signal,
            Err(e) => match e.downcast_ref::<TurnError>() {
                Some(turn_error) => PhaseSignal::Abandon(turn_error.clone().into()),
                None => {
                    warn!(phase = %phase.phase_id(), error = ?e, "Phase agent failed");
                    PhaseSignal::Abandon(AbandonReason::AgentFailed(e.to_string()))
                }
            },
        }
    }

    async fn farewell(&mut self, io: &mut dyn TurnIo, reason: &AbandonReason) {
        debug!(?reason, "Speaking farewell");
        if let Err(e) = io.speak(FAREWELL).await {
            debug!(error = %e, "Farewell not delivered");
        }
    }
}

impl LlmPhaseAgent {
    async fn converse(
        &self,
        handle: &mut PhaseHandle<'_>,
        io: &mut dyn TurnIo,
    ) -> Result<PhaseSignal> {
        let ctx = handle.context();
        let phase = handle.phase_id();
        let prompt = handle
            .prompt()
            .with_context(|| format!("No prompt loaded for phase '{}'", phase))?;

        let tool_state = Arc::new(Mutex::new(PhaseToolState::new(ctx, phase)));
        let service =
            PhaseToolService::new(tool_state.clone(), self.repository.clone(), ctx);
        let (server_transport, client_transport) = tokio::io::duplex(4096);
        let _tool_task = ToolTask(tokio::spawn(async move {
            if let Ok(running) = service.serve(server_transport).await {
                let _ = running.waiting().await;
            }
        }));
        let mcp_client = ().serve(client_transport).await?;
        let tools = list_tools(&mcp_client).await?;

        let mut messages = self
            .initial_messages(ctx, phase, prompt, handle.greeting())
            .await?;

        let opening = collect_stream(self.llm.stream_reply(messages.clone()).await?).await?;
        if !opening.is_empty() {
            io.speak(&opening).await?;
            self.record(ctx, phase, TurnRole::Assistant, &opening).await;
            messages.push(assistant_message(&opening)?);
        }

        loop {
            if tool_state.lock().await.is_complete() {
                handle.mark_phase_complete();
                return Ok(PhaseSignal::Advance);
            }

            let Some(user_text) = io.next_user_turn().await? else {
                return Ok(PhaseSignal::Abandon(AbandonReason::Disconnected));
            };
            self.record(ctx, phase, TurnRole::User, &user_text).await;
            messages.push(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user_text)
                    .build()?
                    .into(),
            );

            let reply = self
                .respond(ctx, phase, &mcp_client, &mut messages, tools.clone())
                .await?;
            if !reply.is_empty() {
                io.speak(&reply).await?;
                self.record(ctx, phase, TurnRole::Assistant, &reply).await;
                messages.push(assistant_message(&reply)?);
            }
        }
    }

    /// One ReAct cycle. Tool calls and their results are appended to `messages`.
    async fn respond(
        &self,
        ctx: &SessionContext,
        phase: &PhaseId,
        mcp_client: &RunningService<RoleClient, ()>,
        messages: &mut Vec<ChatCompletionRequestMessage>,
        tools: Vec<ChatCompletionTool>,
    ) -> Result<String> {
        let action = self.llm.decide_action(messages.clone(), tools).await?;
        let tool_calls = match action {
            LLMAction::TextResponse(text) => return Ok(text),
            LLMAction::ToolCall(calls) => calls,
        };

        let mut results = Vec::with_capacity(tool_calls.len());
        for call in &tool_calls {
            let result = call_tool(mcp_client, call).await;
            self.record(
                ctx,
                phase,
                TurnRole::Tool,
                &format!("{}({}) -> {}", call.function.name, call.function.arguments, result),
            )
            .await;
            results.push(result);
        }

        messages.push(
            ChatCompletionRequestAssistantMessageArgs::default()
                .tool_calls(tool_calls.clone())
                .build()?
                .into(),
        );
        for (call, result) in tool_calls.iter().zip(results) {
            messages.push(
                ChatCompletionRequestToolMessageArgs::default()
                    .tool_call_id(call.id.clone())
                    .content(result)
                    .build()?
                    .into(),
            );
        }

        collect_stream(self.llm.stream_reply(messages.clone()).await?).await
    }

    async fn initial_messages(
        &self,
        ctx: &SessionContext,
        phase: &PhaseId,
        prompt: &PhasePrompt,
        greeting: Option<GreetingStyle>,
    ) -> Result<Vec<ChatCompletionRequestMessage>> {
        let mut messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system_prompt(ctx, phase, prompt, greeting))
                .build()?
                .into(),
        ];

        for example in &prompt.few_shot {
            messages.push(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(ctx.render(&example.user))
                    .build()?
                    .into(),
            );
            messages.push(assistant_message(&ctx.render(&example.assistant))?);
        }

        let history = match self
            .repository
            .recent_turns(ctx.chat(), self.history_window)
            .await
        {
            Ok(turns) => turns,
            Err(e) => {
                warn!(error = %e, "Could not load recent turns, continuing without them");
                Vec::new()
            }
        };
        for turn in history {
            match turn.role {
                TurnRole::User => messages.push(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(turn.content)
                        .build()?
                        .into(),
                ),
                TurnRole::Assistant => messages.push(assistant_message(&turn.content)?),
                TurnRole::Tool => {}
            }
        }
        Ok(messages)
    }

    /// Appends a chat turn. Failures are logged; the conversation goes on.
    async fn record(&self, ctx: &SessionContext, phase: &PhaseId, role: TurnRole, content: &str) {
        let turn = ctx.chat_turn(role, content, phase);
        if let Err(e) = self.repository.append_chat_turn(&turn).await {
            warn!(
                error = %e,
                %role,
                metadata = %ctx.metadata(phase),
                "Failed to persist chat turn"
            );
        }
    }
}

fn system_prompt(
    ctx: &SessionContext,
    phase: &PhaseId,
    prompt: &PhasePrompt,
    greeting: Option<GreetingStyle>,
) -> String {
    let user = ctx.user();
    let word = ctx.word();
    let mut text = format!(
        "{}\n\n# Learner\n\nNickname: {}\nEnglish level: {}\n{}\n\n# Target Word\n\n{}",
        ctx.render(&prompt.instruction),
        user.nickname,
        user.english_level,
        user.characteristics(),
        word.word,
    );
    if let Some(example) = &word.example_sentence {
        text.push_str(&format!("\nExample: {}", example));
    }
    if !word.similar_words.is_empty() {
        text.push_str(&format!("\nSimilar words: {}", word.similar_words.join(", ")));
    }
    text.push_str(&format!(
        "\n\n# Current Phase\n\nYou are running the '{}' phase. Call `complete_phase` as soon as the learner has met this phase's goal.",
        phase
    ));
    if let Some(style) = greeting {
        text.push_str("\n\n# Opening\n\n");
        text.push_str(greeting_directive(style));
    }
    text
}

fn greeting_directive(style: GreetingStyle) -> &'static str {
    match style {
        GreetingStyle::Fresh => {
            "This is the learner's first lesson on this word. Greet them by nickname and introduce the word."
        }
        GreetingStyle::WarmReturn => {
            "The learner is back after a long break. Welcome them back and briefly recap what they covered before continuing."
        }
        GreetingStyle::BriefContinue => {
            "The learner was here only a moment ago. Skip the greeting and continue where you left off."
        }
    }
}

fn assistant_message(text: &str) -> Result<ChatCompletionRequestMessage> {
    Ok(ChatCompletionRequestAssistantMessageArgs::default()
        .content(text)
        .build()?
        .into())
}

async fn list_tools(mcp_client: &RunningService<RoleClient, ()>) -> Result<Vec<ChatCompletionTool>> {
    mcp_client
        .list_all_tools()
        .await?
        .into_iter()
        .map(|t| -> Result<ChatCompletionTool> {
            Ok(ChatCompletionToolArgs::default()
                .function(
                    FunctionObjectArgs::default()
                        .name(t.name)
                        .description(t.description.unwrap_or_default())
                        .parameters(serde_json::to_value(&*t.input_schema)?)
                        .build()?,
                )
                .build()?)
        })
        .collect()
}

/// Runs a tool and returns its text. Any failure, including arguments the
/// tool cannot accept, comes back as an `{"error": ...}` text for the LLM to
/// read and correct.
async fn call_tool(mcp_client: &RunningService<RoleClient, ()>, call: &ToolCall) -> String {
    match try_call_tool(mcp_client, call).await {
        Ok(text) => text,
        Err(e) => {
            let message = format!("{e:#}");
            warn!(tool = %call.function.name, error = %message, "Tool call failed");
            json!({ "error": message }).to_string()
        }
    }
}

async fn try_call_tool(
    mcp_client: &RunningService<RoleClient, ()>,
    call: &ToolCall,
) -> Result<String> {
    let arguments = if call.function.arguments.trim().is_empty() {
        serde_json::Map::new()
    } else {
        serde_json::from_str(&call.function.arguments)
            .with_context(|| format!("Invalid arguments for tool '{}'", call.function.name))?
    };
    let result = mcp_client
        .peer()
        .call_tool(CallToolRequestParam {
            name: call.function.name.clone().into(),
            arguments: Some(arguments),
        })
        .await
        .with_context(|| format!("Tool '{}' rejected the call", call.function.name))?;

    let annotated_content = result
        .content
        .context("Tool call returned no content")?
        .pop()
        .context("Content list was empty")?;
    Ok(match annotated_content.raw {
        RawContent::Text(text_content) => text_content.text,
        _ => "{\"error\": \"Unexpected content type from tool\"}".to_string(),
    })
}
