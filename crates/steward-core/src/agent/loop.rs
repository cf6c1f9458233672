use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::agent::context::{ContextBuilder, TurnMetadata};
use crate::memory::MemoryRetriever;
use crate::model::{
    ChatMessage, ComplexityRouter, ModelEvent, ModelProvider, ModelTier, ProviderError,
    ToolCallRequest, ToolSpec,
};
use crate::session::{prompt_text, ContentPart, Message, Role, Session};
use crate::store::PersistenceStore;
use crate::tools::ToolGateway;

const EMPTY_RESPONSE: &str = "I've completed processing but have no response to give.";
const BUDGET_EXHAUSTED: &str = "I reached the step limit for this request before finishing.";

/// Progress of a turn, streamed to the caller while the loop runs.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentEvent {
    Text {
        delta: String,
    },
    Tool {
        id: String,
        name: String,
        result: serde_json::Value,
    },
    Done {
        steps: usize,
        tier: ModelTier,
    },
    Error {
        message: String,
    },
}

/// Result of one interactive turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub text: String,
    pub tier: ModelTier,
    /// Model calls made. Never more than the step budget.
    pub steps: usize,
    pub tools_used: Vec<String>,
}

/// A turn whose context has been assembled; nothing has been sent yet.
#[derive(Debug, Clone)]
pub struct PreparedTurn {
    pub session_id: String,
    pub owner_id: String,
    /// The request as persisted, attachments included.
    pub user_parts: Vec<ContentPart>,
    pub tier: ModelTier,
    pub system_prompt: String,
    transcript: Vec<ChatMessage>,
    tools: Vec<ToolSpec>,
}

/// What one model call produced.
struct StepOutput {
    text: String,
    tool_calls: Vec<ToolCallRequest>,
    error: Option<ProviderError>,
}

/// Drives one interactive turn: model call, tool dispatch, repeat.
pub struct AgentLoop {
    provider: Arc<dyn ModelProvider>,
    router: ComplexityRouter,
    retriever: Arc<MemoryRetriever>,
    gateway: Arc<ToolGateway>,
    store: Arc<dyn PersistenceStore>,
    context: ContextBuilder,
    max_steps: usize,
    memory_window: usize,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        retriever: Arc<MemoryRetriever>,
        gateway: Arc<ToolGateway>,
        store: Arc<dyn PersistenceStore>,
        context: ContextBuilder,
    ) -> Self {
        Self {
            router: ComplexityRouter::new(provider.clone()),
            provider,
            retriever,
            gateway,
            store,
            context,
            max_steps: 5,
            memory_window: 50,
        }
    }

    pub fn with_limits(mut self, max_steps: usize, memory_window: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self.memory_window = memory_window;
        self
    }

    pub fn gateway(&self) -> &Arc<ToolGateway> {
        &self.gateway
    }

    /// Load the session and return the windowed history as model messages.
    async fn load_history(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let session = Session {
            id: session_id.to_string(),
            messages: self
                .store
                .session_messages(session_id)
                .await
                .with_context(|| format!("failed to load session '{session_id}'"))?,
        };
        Ok(session
            .history(self.memory_window)
            .iter()
            .map(|m| match m.role {
                Role::User => ChatMessage::User(m.prompt_text()),
                Role::Assistant => ChatMessage::Assistant {
                    text: m.flat_text(),
                    tool_calls: Vec::new(),
                },
            })
            .collect())
    }

    /// Run one turn for `user_message`. Errors only on setup or persistence
    /// failures; model and tool failures are fed back to the model.
    pub async fn process_message(
        &self,
        session_id: &str,
        owner_id: &str,
        user_message: &str,
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> Result<TurnOutcome> {
        let turn = self.prepare(session_id, owner_id, user_message).await?;
        self.execute(turn, events).await
    }

    /// Everything that must succeed before the first model call: history,
    /// routing, memory retrieval and the system prompt.
    pub async fn prepare(
        &self,
        session_id: &str,
        owner_id: &str,
        user_message: &str,
    ) -> Result<PreparedTurn> {
        let parts = vec![ContentPart::Text {
            text: user_message.to_string(),
        }];
        self.prepare_parts(session_id, owner_id, parts).await
    }

    /// [`prepare`](Self::prepare) for a request made of typed parts.
    pub async fn prepare_parts(
        &self,
        session_id: &str,
        owner_id: &str,
        user_parts: Vec<ContentPart>,
    ) -> Result<PreparedTurn> {
        let user_message = prompt_text(&user_parts);
        let mut transcript = self.load_history(session_id).await?;
        transcript.push(ChatMessage::User(user_message.clone()));

        let tier = self.router.select(&user_message).await;
        let memory_context = self.retriever.retrieve(&user_message, owner_id).await;
        let tools = self.gateway.specs();
        let system_prompt = self.context.build_system_prompt(
            &memory_context,
            &TurnMetadata {
                owner_id,
                session_id,
                tier,
                tools: &tools,
            },
        );
        debug!(
            "Context: system={} chars, history={} messages, memory={} chars",
            system_prompt.len(),
            transcript.len(),
            memory_context.len()
        );

        Ok(PreparedTurn {
            session_id: session_id.to_string(),
            owner_id: owner_id.to_string(),
            user_parts,
            tier,
            system_prompt,
            transcript,
            tools,
        })
    }

    /// Drive the step loop for a prepared turn and persist the exchange.
    pub async fn execute(
        &self,
        turn: PreparedTurn,
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> Result<TurnOutcome> {
        let PreparedTurn {
            session_id,
            owner_id,
            user_parts,
            tier,
            system_prompt,
            mut transcript,
            tools,
        } = turn;

        let emit = |event: AgentEvent| {
            if let Some(tx) = events {
                // Receiver gone means the client disconnected; keep going
                let _ = tx.send(event);
            }
        };

        let mut streamed = String::new();
        let mut tools_used = Vec::new();
        let mut steps = 0;
        let mut finished = false;

        while steps < self.max_steps {
            steps += 1;
            let step = self
                .step(tier, &system_prompt, &transcript, &tools, &emit)
                .await;
            streamed.push_str(&step.text);

            if let Some(e) = step.error {
                warn!("Model call [{steps}/{}] failed: {e}", self.max_steps);
                // Recorded as a failed pseudo tool call so the model sees it next step
                let call = ToolCallRequest {
                    id: format!("model-error-{steps}"),
                    name: "model_call".into(),
                    arguments: serde_json::json!({}),
                };
                transcript.push(ChatMessage::Assistant {
                    text: step.text,
                    tool_calls: vec![call.clone()],
                });
                transcript.push(ChatMessage::ToolOutput {
                    call_id: call.id,
                    name: call.name,
                    result: serde_json::json!({ "error": e.to_string() }),
                });
                continue;
            }

            if step.tool_calls.is_empty() {
                transcript.push(ChatMessage::Assistant {
                    text: step.text,
                    tool_calls: Vec::new(),
                });
                finished = true;
                break;
            }

            debug!(
                "LLM response [{steps}/{}]: {} tool call(s)",
                self.max_steps,
                step.tool_calls.len()
            );
            transcript.push(ChatMessage::Assistant {
                text: step.text,
                tool_calls: step.tool_calls.clone(),
            });

            for call in step.tool_calls {
                debug!("Dispatching [{steps}/{}]: {}", self.max_steps, call.name);
                let result = self
                    .gateway
                    .invoke(&call.name, call.arguments.clone())
                    .await
                    .to_value();
                tools_used.push(call.name.clone());
                emit(AgentEvent::Tool {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    result: result.clone(),
                });
                transcript.push(ChatMessage::ToolOutput {
                    call_id: call.id,
                    name: call.name,
                    result,
                });
            }
        }

        if !finished {
            info!("Step budget of {} exhausted for session '{session_id}'", self.max_steps);
        }

        let text = if !streamed.trim().is_empty() {
            streamed
        } else if finished {
            EMPTY_RESPONSE.to_string()
        } else {
            BUDGET_EXHAUSTED.to_string()
        };

        self.store
            .append_message(&Message::new(&session_id, &owner_id, Role::User, user_parts))
            .await
            .context("failed to persist user message")?;
        self.store
            .append_message(&Message::text(&session_id, &owner_id, Role::Assistant, &text))
            .await
            .context("failed to persist assistant message")?;

        emit(AgentEvent::Done { steps, tier });

        Ok(TurnOutcome {
            text,
            tier,
            steps,
            tools_used,
        })
    }

    /// One model call, consumed until `Done` or the stream ends.
    async fn step(
        &self,
        tier: ModelTier,
        system_prompt: &str,
        transcript: &[ChatMessage],
        tools: &[ToolSpec],
        emit: &impl Fn(AgentEvent),
    ) -> StepOutput {
        let mut out = StepOutput {
            text: String::new(),
            tool_calls: Vec::new(),
            error: None,
        };

        let mut stream = match self
            .provider
            .converse(tier, system_prompt, transcript, tools)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                out.error = Some(e);
                return out;
            }
        };

        while let Some(event) = stream.next().await {
            match event {
                Ok(ModelEvent::TextDelta(delta)) => {
                    out.text.push_str(&delta);
                    emit(AgentEvent::Text { delta });
                }
                Ok(ModelEvent::ToolCall(call)) => out.tool_calls.push(call),
                Ok(ModelEvent::Done) => break,
                Err(e) => {
                    out.error = Some(e);
                    break;
                }
            }
        }
        out
    }
}
