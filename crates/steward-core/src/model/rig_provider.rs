use async_trait::async_trait;
use futures::StreamExt;
use rig::completion::{CompletionModel, CompletionRequest, Message, ToolDefinition};
use rig::message::{AssistantContent, Text, ToolResult, ToolResultContent, UserContent};
use rig::OneOrMany;
use tracing::debug;

use super::structured::parse_structured;
use super::{
    ChatMessage, EventStream, ModelEvent, ModelPool, ModelProvider, ModelTier, ProviderError,
    ToolCallRequest, ToolSpec,
};
use crate::store::RetryPolicy;
use crate::util::preview;

fn user_text(text: &str) -> Message {
    Message::User {
        content: OneOrMany::one(UserContent::Text(Text {
            text: text.to_string(),
        })),
    }
}

/// Convert the transcript into rig messages. Consecutive tool outputs are
/// folded into a single user message, the way providers expect them.
fn to_rig_history(messages: &[ChatMessage]) -> Vec<Message> {
    let mut history: Vec<Message> = Vec::new();
    let mut pending_results: Vec<UserContent> = Vec::new();

    let flush = |pending: &mut Vec<UserContent>, history: &mut Vec<Message>| {
        if let Ok(content) = OneOrMany::many(std::mem::take(pending)) {
            history.push(Message::User { content });
        }
    };

    for msg in messages {
        match msg {
            ChatMessage::ToolOutput {
                call_id, result, ..
            } => {
                pending_results.push(UserContent::ToolResult(ToolResult {
                    id: call_id.clone(),
                    call_id: None,
                    content: OneOrMany::one(ToolResultContent::Text(Text {
                        text: result.to_string(),
                    })),
                }));
            }
            ChatMessage::User(text) => {
                flush(&mut pending_results, &mut history);
                history.push(user_text(text));
            }
            ChatMessage::Assistant { text, tool_calls } => {
                flush(&mut pending_results, &mut history);
                let mut parts: Vec<AssistantContent> = Vec::new();
                if !text.is_empty() {
                    parts.push(AssistantContent::Text(Text { text: text.clone() }));
                }
                for call in tool_calls {
                    parts.push(AssistantContent::tool_call(
                        call.id.clone(),
                        call.name.clone(),
                        call.arguments.clone(),
                    ));
                }
                let content = OneOrMany::many(parts).unwrap_or_else(|_| {
                    OneOrMany::one(AssistantContent::Text(Text {
                        text: String::new(),
                    }))
                });
                history.push(Message::Assistant { id: None, content });
            }
        }
    }
    flush(&mut pending_results, &mut history);
    history
}

fn json_only_prompt(prompt: &str, schema: &serde_json::Value) -> String {
    format!(
        "{prompt}\n\n\
         Respond with ONLY a JSON object that conforms to this JSON schema, no markdown fences:\n{}",
        serde_json::to_string_pretty(schema).unwrap_or_default()
    )
}

/// [`ModelProvider`] backed by rig completion handles.
///
/// rig's completion API returns the whole response at once; `converse`
/// replays it as an event stream.
pub struct RigProvider {
    pool: ModelPool,
    temperature: f64,
    max_tokens: u64,
    retry: RetryPolicy,
}

impl RigProvider {
    pub fn new(pool: ModelPool, temperature: f64, max_tokens: u64) -> Self {
        Self {
            pool,
            temperature,
            max_tokens,
            retry: RetryPolicy::external(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &ModelPool {
        &self.pool
    }

    async fn complete(
        &self,
        tier: ModelTier,
        preamble: Option<String>,
        history: Vec<Message>,
        tools: Vec<ToolDefinition>,
        temperature: f64,
    ) -> Result<OneOrMany<AssistantContent>, ProviderError> {
        let (model, model_name) = self.pool.get(tier);
        let chat_history = OneOrMany::many(history)
            .map_err(|_| ProviderError::Validation("empty transcript".into()))?;

        debug!(
            "LLM request [{} / {model_name}]: {} messages, {} tools",
            tier.as_str(),
            chat_history.len(),
            tools.len()
        );

        let request = CompletionRequest {
            preamble,
            chat_history,
            documents: Vec::new(),
            tools,
            temperature: Some(temperature),
            max_tokens: Some(self.max_tokens),
            tool_choice: None,
            additional_params: None,
        };

        let llm_start = std::time::Instant::now();
        let response = self
            .retry
            .retry(
                model_name,
                || {
                    let request = request.clone();
                    async move {
                        model
                            .completion(request)
                            .await
                            .map_err(|e| ProviderError::Transport(e.to_string()))
                    }
                },
                ProviderError::is_transient,
            )
            .await?;
        debug!(
            "LLM response [{}]: {} part(s) in {:.1}s",
            tier.as_str(),
            response.choice.len(),
            llm_start.elapsed().as_secs_f64()
        );
        Ok(response.choice)
    }

    async fn structured(
        &self,
        tier: ModelTier,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let choice = self
            .complete(
                tier,
                None,
                vec![user_text(&json_only_prompt(prompt, schema))],
                Vec::new(),
                0.0,
            )
            .await?;

        let text: String = choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(t) => Some(t.text.clone()),
                _ => None,
            })
            .collect();

        parse_structured(&text, schema).inspect_err(|e| {
            debug!("Structured output rejected ({e}); raw: {}", preview(&text, 300));
        })
    }
}

#[async_trait]
impl ModelProvider for RigProvider {
    async fn classify(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        self.structured(ModelTier::Light, prompt, schema).await
    }

    async fn converse(
        &self,
        tier: ModelTier,
        system_prompt: &str,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<EventStream, ProviderError> {
        let tool_defs: Vec<ToolDefinition> = tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            })
            .collect();

        let choice = self
            .complete(
                tier,
                Some(system_prompt.to_string()),
                to_rig_history(messages),
                tool_defs,
                self.temperature,
            )
            .await?;

        let mut events = Vec::new();
        for content in choice.iter() {
            match content {
                AssistantContent::Text(t) => events.push(ModelEvent::TextDelta(t.text.clone())),
                AssistantContent::ToolCall(tc) => {
                    events.push(ModelEvent::ToolCall(ToolCallRequest {
                        id: tc.id.clone(),
                        name: tc.function.name.clone(),
                        arguments: tc.function.arguments.clone(),
                    }))
                }
                AssistantContent::Reasoning(r) => {
                    debug!("Model reasoning: {}", r.reasoning.join(" "));
                }
                _ => {}
            }
        }
        events.push(ModelEvent::Done);

        Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn extract(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        self.structured(ModelTier::Capable, prompt, schema).await
    }
}
