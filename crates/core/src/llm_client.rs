use anyhow::{Result, anyhow};
use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestMessage, ChatCompletionTool, CreateChatCompletionRequestArgs,
        CreateChatCompletionResponse,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// A tool call requested by the LLM.
pub type ToolCall = async_openai::types::ChatCompletionMessageToolCall;

#[derive(Debug, Clone)]
pub enum LLMStreamEvent {
    TextChunk(String),
}

/// A stream of text chunks from the LLM.
pub type LLMStream = Pin<Box<dyn Stream<Item = Result<LLMStreamEvent, OpenAIError>> + Send>>;

/// The two possible outcomes of a decision turn.
#[derive(Debug, Clone)]
pub enum LLMAction {
    /// The LLM answered directly.
    TextResponse(String),
    /// The LLM wants one or more tools executed first.
    ToolCall(Vec<ToolCall>),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Single non-streaming call that either answers or requests tools.
    async fn decide_action(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        tools: Vec<ChatCompletionTool>,
    ) -> Result<LLMAction>;

    /// Streams a reply with no tools offered, e.g. after tool results are in
    /// the history or for an opening turn.
    async fn stream_reply(&self, messages: Vec<ChatCompletionRequestMessage>) -> Result<LLMStream>;
}

/// Drains a reply stream into one string. Chunk errors end the reply early.
pub async fn collect_stream(mut stream: LLMStream) -> Result<String> {
    let mut reply = String::new();
    while let Some(event) = stream.next().await {
        match event {
            Ok(LLMStreamEvent::TextChunk(chunk)) => reply.push_str(&chunk),
            Err(e) if reply.is_empty() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(error = %e, "Reply stream interrupted");
                break;
            }
        }
    }
    Ok(reply)
}

/// `LLMClient` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleClient {
    /// # Arguments
    ///
    /// * `config` - API key and base URL of the provider.
    /// * `model` - Chat model identifier (e.g., "gpt-4.1").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

#[async_trait]
impl LLMClient for OpenAICompatibleClient {
    async fn decide_action(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        tools: Vec<ChatCompletionTool>,
    ) -> Result<LLMAction> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .tools(tools)
            .tool_choice("auto")
            .build()?;

        let response: CreateChatCompletionResponse = self.client.chat().create(request).await?;
        let choice = response
            .choices
            .first()
            .ok_or_else(|| anyhow!("LLM response contained no choices."))?;

        if let Some(tool_calls) = &choice.message.tool_calls {
            Ok(LLMAction::ToolCall(tool_calls.clone()))
        } else if let Some(content) = &choice.message.content {
            Ok(LLMAction::TextResponse(content.clone()))
        } else {
            Err(anyhow!(
                "LLM response had neither text content nor tool calls."
            ))
        }
    }

    async fn stream_reply(&self, messages: Vec<ChatCompletionRequestMessage>) -> Result<LLMStream> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .stream(true)
            .build()?;

        let stream = self.client.chat().create_stream(request).await?;

        Ok(Box::pin(stream.filter_map(|result| async {
            match result {
                Ok(response) => {
                    let content = response.choices.first()?.delta.content.clone()?;
                    (!content.is_empty()).then_some(Ok(LLMStreamEvent::TextChunk(content)))
                }
                Err(e) => Some(Err(e)),
            }
        })))
    }
}
