use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use super::{ModelProvider, ProviderError};
use crate::tools::validate::validate_params;

/// Strip markdown code fences from an LLM response to extract raw content.
/// Handles ```json, ```, and plain text (no fences).
pub fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
    {
        rest.strip_suffix("```").unwrap_or(rest).trim()
    } else {
        trimmed
    }
}

/// JSON schema of `T` as a plain value.
pub fn schema_value<T: JsonSchema>() -> serde_json::Value {
    let mut schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default();
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
    }
    schema
}

/// Parse raw model text into a JSON value that satisfies `schema`.
pub fn parse_structured(
    text: &str,
    schema: &serde_json::Value,
) -> Result<serde_json::Value, ProviderError> {
    let json_str = strip_markdown_fences(text);
    let value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| ProviderError::Validation(format!("not valid JSON: {e}")))?;
    let errors = validate_params(&value, schema);
    if !errors.is_empty() {
        return Err(ProviderError::Validation(errors.join("; ")));
    }
    Ok(value)
}

fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, ProviderError> {
    serde_json::from_value(value).map_err(|e| ProviderError::Validation(e.to_string()))
}

/// Typed wrapper over [`ModelProvider::classify`].
pub async fn classify_as<T>(provider: &dyn ModelProvider, prompt: &str) -> Result<T, ProviderError>
where
    T: DeserializeOwned + JsonSchema,
{
    let value = provider.classify(prompt, &schema_value::<T>()).await?;
    decode(value)
}

/// Typed wrapper over [`ModelProvider::extract`].
pub async fn extract_as<T>(provider: &dyn ModelProvider, prompt: &str) -> Result<T, ProviderError>
where
    T: DeserializeOwned + JsonSchema,
{
    let value = provider.extract(prompt, &schema_value::<T>()).await?;
    decode(value)
}
