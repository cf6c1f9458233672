use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a persisted message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One part of a message body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    File {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    Image {
        url: String,
    },
}

/// Render parts for a text-only model transcript.
pub fn prompt_text(parts: &[ContentPart]) -> String {
    parts
        .iter()
        .map(|p| match p {
            ContentPart::Text { text } => text.clone(),
            ContentPart::Image { url } => format!("[image: {url}]"),
            ContentPart::File { url, media_type } => match media_type {
                Some(mt) => format!("[file ({mt}): {url}]"),
                None => format!("[file: {url}]"),
            },
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// A persisted chat message. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub session_id: String,
    pub owner_id: String,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(session_id: &str, owner_id: &str, role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            session_id: session_id.to_string(),
            owner_id: owner_id.to_string(),
            role,
            parts,
            created_at: Utc::now(),
        }
    }

    pub fn text(session_id: &str, owner_id: &str, role: Role, text: &str) -> Self {
        Self::new(
            session_id,
            owner_id,
            role,
            vec![ContentPart::Text {
                text: text.to_string(),
            }],
        )
    }

    /// Text shown to the model. Attachments are referenced by URL so the
    /// model can hand them to tools.
    pub fn prompt_text(&self) -> String {
        prompt_text(&self.parts)
    }

    /// Flatten the parts into plain text. Non-text parts become placeholders.
    pub fn flat_text(&self) -> String {
        self.parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => text.as_str(),
                ContentPart::Image { .. } => "[image]",
                ContentPart::File { .. } => "[file]",
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// An ordered conversation. Created on the first request that names it.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
}

impl Session {
    /// The last `max` messages, oldest first.
    pub fn history(&self, max: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(max);
        &self.messages[start..]
    }
}
