pub mod pool;
pub mod rig_provider;
pub mod router;
pub mod structured;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use pool::ModelPool;
pub use rig_provider::RigProvider;
pub use router::ComplexityRouter;

/// Model capability level. `Capable` is the "heavy" tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Light,
    Capable,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Light => "light",
            ModelTier::Capable => "capable",
        }
    }
}

/// A tool call emitted by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One event of a conversational model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    ToolCall(ToolCallRequest),
    Done,
}

/// Transcript entry sent to the model.
#[derive(Debug, Clone)]
pub enum ChatMessage {
    User(String),
    Assistant {
        text: String,
        tool_calls: Vec<ToolCallRequest>,
    },
    ToolOutput {
        call_id: String,
        name: String,
        result: serde_json::Value,
    },
}

/// Tool definition advertised to the model.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("model transport error: {0}")]
    Transport(String),
    #[error("structured output failed validation: {0}")]
    Validation(String),
    #[error("missing credential: {0}")]
    MissingCredential(String),
}

impl ProviderError {
    /// Network failures, rate limits and provider overload. Auth and
    /// validation failures are permanent.
    pub fn is_transient(&self) -> bool {
        const MARKERS: [&str; 11] = [
            "429",
            "500",
            "502",
            "503",
            "504",
            "rate limit",
            "overloaded",
            "timed out",
            "timeout",
            "connection",
            "error sending request",
        ];
        match self {
            ProviderError::Transport(msg) => {
                let msg = msg.to_lowercase();
                MARKERS.iter().any(|m| msg.contains(m))
            }
            _ => false,
        }
    }
}

pub type EventStream = BoxStream<'static, Result<ModelEvent, ProviderError>>;

/// Language model capability used by the core.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Structured classification on the light tier. The result conforms to `schema`.
    async fn classify(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;

    /// One model call. The stream ends with `ModelEvent::Done`.
    async fn converse(
        &self,
        tier: ModelTier,
        system_prompt: &str,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<EventStream, ProviderError>;

    /// Structured extraction. The result conforms to `schema`.
    async fn extract(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_classified_by_cause() {
        let transport = |m: &str| ProviderError::Transport(m.into());
        assert!(transport("HttpError: error sending request for url").is_transient());
        assert!(transport("ProviderError: 429 Too Many Requests").is_transient());
        assert!(transport("Anthropic is Overloaded").is_transient());
        assert!(!transport("ProviderError: invalid x-api-key").is_transient());
        assert!(!ProviderError::Validation("timeout field missing".into()).is_transient());
    }
}
