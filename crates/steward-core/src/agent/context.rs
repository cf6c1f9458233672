use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::{ModelTier, ToolSpec};

/// Used when no persona file is configured or it cannot be read.
pub const DEFAULT_PERSONA: &str = "You are Steward, an operations assistant for a small product team. \
You answer questions, look things up, and carry out changes in code hosting, deployments and the \
database on the user's behalf. Be concise and precise.";

/// Per-turn facts rendered into the operational section of the prompt.
pub struct TurnMetadata<'a> {
    pub owner_id: &'a str,
    pub session_id: &'a str,
    pub tier: ModelTier,
    pub tools: &'a [ToolSpec],
}

/// Builds the system prompt: persona, memory context and operational metadata.
pub struct ContextBuilder {
    workspace: PathBuf,
    persona_path: Option<PathBuf>,
}

impl ContextBuilder {
    /// `persona` is a file path; relative paths resolve against `workspace`.
    pub fn new(workspace: &Path, persona: Option<&str>) -> Self {
        let persona_path = persona.map(|p| {
            let path = PathBuf::from(p);
            if path.is_absolute() {
                path
            } else {
                workspace.join(path)
            }
        });
        Self {
            workspace: workspace.to_path_buf(),
            persona_path,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn persona(&self) -> String {
        let Some(ref path) = self.persona_path else {
            return DEFAULT_PERSONA.to_string();
        };
        match std::fs::read_to_string(path) {
            Ok(content) if !content.trim().is_empty() => content.trim().to_string(),
            Ok(_) => DEFAULT_PERSONA.to_string(),
            Err(e) => {
                warn!("Failed to read persona file {}: {e}", path.display());
                DEFAULT_PERSONA.to_string()
            }
        }
    }

    pub fn build_system_prompt(&self, memory_context: &str, meta: &TurnMetadata<'_>) -> String {
        let mut parts = vec![self.persona()];

        if !memory_context.is_empty() {
            parts.push(memory_context.to_string());
        }

        parts.push(self.operations(meta));

        parts.join("\n\n---\n\n")
    }

    fn operations(&self, meta: &TurnMetadata<'_>) -> String {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M (%A)");
        let tz = chrono::Local::now().format("%Z");
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;
        let tools = if meta.tools.is_empty() {
            "(none)".to_string()
        } else {
            meta.tools
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };

        format!(
            r#"# Operations

## Current Time
{now} ({tz})

## Runtime
{os} {arch}, Rust. Workspace: {workspace}

## Session
owner: {owner}, session: {session}, model tier: {tier}

## Tools
{tools}

Tools that change external systems answer with status "requires_approval" instead of running.
Show the user what would happen and ask. Only after the user explicitly agrees, repeat the
exact same call with "confirm": true. Never set confirm on your own initiative.
Tool failures come back as {{"error": ...}}; read them and decide how to continue."#,
            workspace = self.workspace.display(),
            owner = meta.owner_id,
            session = meta.session_id,
            tier = meta.tier.as_str(),
        )
    }
}
