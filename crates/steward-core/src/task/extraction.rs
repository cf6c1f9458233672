use std::sync::OnceLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::model::structured::extract_as;
use crate::model::{ModelProvider, ProviderError};
use crate::store::Contact;
use crate::tools::web::SearchHit;

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex is valid"))
}

/// Structured output of one collector iteration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Extraction {
    pub journalists: Vec<Contact>,
    /// Suggest the next query to find more journalists in a different region or city.
    pub next_query: String,
}

impl Extraction {
    /// Reject the whole extraction on any malformed record. Nothing is
    /// coerced.
    pub fn validate(self) -> Result<Self, ProviderError> {
        if self.next_query.trim().is_empty() {
            return Err(ProviderError::Validation("nextQuery is empty".into()));
        }
        for (i, contact) in self.journalists.iter().enumerate() {
            if !email_re().is_match(contact.email.trim()) {
                return Err(ProviderError::Validation(format!(
                    "journalists[{i}].email: '{}' is not an e-mail address",
                    contact.email
                )));
            }
            if contact.name.trim().is_empty() {
                return Err(ProviderError::Validation(format!(
                    "journalists[{i}].name is empty"
                )));
            }
        }
        Ok(self)
    }
}

pub fn extraction_prompt(results: &[SearchHit], current_query: &str) -> String {
    let results = serde_json::to_string(results).unwrap_or_default();
    format!(
        "Extract journalist information (name, e-mail, outlet, role) from the following search results: {results}\n\n\
         Only include people whose e-mail address appears in the results. \
         Also suggest a next search query to continue coverage of Polish cities and regions. \
         Current query was: {current_query}"
    )
}

pub async fn extract_contacts(
    provider: &dyn ModelProvider,
    results: &[SearchHit],
    current_query: &str,
) -> Result<Extraction, ProviderError> {
    extract_as::<Extraction>(provider, &extraction_prompt(results, current_query))
        .await?
        .validate()
}
