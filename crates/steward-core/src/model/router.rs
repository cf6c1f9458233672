use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{info, warn};

use super::structured::classify_as;
use super::{ModelProvider, ModelTier};

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct Complexity {
    /// True when the request needs multi-step reasoning, code, or tools.
    is_complex: bool,
    reason: String,
}

const CLASSIFIER_PROMPT: &str = "You route requests for an automation assistant. \
Decide whether the request below is complex: it needs multi-step reasoning, code changes, \
deployments, database work, or several tool calls. Greetings, short factual questions and \
simple lookups are not complex.";

/// Picks a model tier for one interactive turn.
pub struct ComplexityRouter {
    provider: Arc<dyn ModelProvider>,
}

impl ComplexityRouter {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }

    /// Classify the latest user turn. Any classification failure selects the
    /// capable tier.
    pub async fn select(&self, user_text: &str) -> ModelTier {
        let prompt = format!("{CLASSIFIER_PROMPT}\n\nRequest:\n{user_text}");
        match classify_as::<Complexity>(self.provider.as_ref(), &prompt).await {
            Ok(verdict) => {
                let tier = if verdict.is_complex {
                    ModelTier::Capable
                } else {
                    ModelTier::Light
                };
                info!("Router selected '{}' tier: {}", tier.as_str(), verdict.reason);
                tier
            }
            Err(e) => {
                warn!("Complexity classification failed, using capable tier: {e}");
                ModelTier::Capable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatMessage, EventStream, ProviderError, ToolSpec};
    use async_trait::async_trait;

    /// Returns a fixed classification result.
    struct FixedClassifier(Result<serde_json::Value, String>);

    #[async_trait]
    impl ModelProvider for FixedClassifier {
        async fn classify(
            &self,
            _prompt: &str,
            _schema: &serde_json::Value,
        ) -> Result<serde_json::Value, ProviderError> {
            self.0.clone().map_err(ProviderError::Transport)
        }

        async fn converse(
            &self,
            _tier: ModelTier,
            _system_prompt: &str,
            _messages: &[ChatMessage],
            _tools: &[ToolSpec],
        ) -> Result<EventStream, ProviderError> {
            Err(ProviderError::Transport("not scripted".into()))
        }

        async fn extract(
            &self,
            _prompt: &str,
            _schema: &serde_json::Value,
        ) -> Result<serde_json::Value, ProviderError> {
            Err(ProviderError::Transport("not scripted".into()))
        }
    }

    fn router(result: Result<serde_json::Value, String>) -> ComplexityRouter {
        ComplexityRouter::new(Arc::new(FixedClassifier(result)))
    }

    #[tokio::test]
    async fn simple_request_uses_light_tier() {
        let r = router(Ok(serde_json::json!({"isComplex": false, "reason": "greeting"})));
        assert_eq!(r.select("hi there").await, ModelTier::Light);
    }

    #[tokio::test]
    async fn complex_request_uses_capable_tier() {
        let r = router(Ok(serde_json::json!({"isComplex": true, "reason": "deploy"})));
        assert_eq!(r.select("redeploy and check logs").await, ModelTier::Capable);
    }

    #[tokio::test]
    async fn classifier_error_fails_toward_capable() {
        let r = router(Err("connection reset".into()));
        assert_eq!(r.select("hi").await, ModelTier::Capable);
    }

    #[tokio::test]
    async fn malformed_classification_fails_toward_capable() {
        let r = router(Ok(serde_json::json!({"complex": "maybe"})));
        assert_eq!(r.select("hi").await, ModelTier::Capable);
    }
}
