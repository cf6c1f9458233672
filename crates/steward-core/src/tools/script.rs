use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use tokio::process::Command;

use super::{Tool, ToolError};
use crate::util::floor_char_boundary;

const MAX_OUTPUT: usize = 10_000;

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    Python,
    Javascript,
}

impl ScriptLanguage {
    fn interpreter(self) -> (&'static str, &'static str) {
        match self {
            ScriptLanguage::Python => ("python3", "-c"),
            ScriptLanguage::Javascript => ("node", "-e"),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunScriptArgs {
    pub language: ScriptLanguage,
    /// Source code to run. Print results to stdout.
    pub code: String,
}

/// Run a short utility script in a subprocess with a hard timeout.
pub struct RunUtilityScriptTool {
    working_dir: PathBuf,
    timeout: Duration,
}

impl RunUtilityScriptTool {
    pub fn new(working_dir: PathBuf, timeout_secs: u64) -> Self {
        Self {
            working_dir,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

fn truncate(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    if text.len() > MAX_OUTPUT {
        let end = floor_char_boundary(&text, MAX_OUTPUT);
        format!(
            "{}\n... (truncated, {} more chars)",
            &text[..end],
            text.len() - end
        )
    } else {
        text.into_owned()
    }
}

#[async_trait]
impl Tool for RunUtilityScriptTool {
    type Args = RunScriptArgs;
    const NAME: &'static str = "run_utility_script";
    const MUTATING: bool = true;

    fn description(&self) -> &str {
        "Run a short Python or JavaScript snippet and return its stdout, stderr and exit code."
    }

    async fn execute(&self, args: RunScriptArgs) -> Result<serde_json::Value, ToolError> {
        let (program, flag) = args.language.interpreter();
        let result = tokio::time::timeout(
            self.timeout,
            Command::new(program)
                .arg(flag)
                .arg(&args.code)
                .current_dir(&self.working_dir)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => Ok(serde_json::json!({
                "exitCode": output.status.code().unwrap_or(-1),
                "stdout": truncate(&output.stdout),
                "stderr": truncate(&output.stderr),
            })),
            Ok(Err(e)) => Err(ToolError::Execution(format!(
                "failed to start {program}: {e}"
            ))),
            Err(_) => Err(ToolError::Execution(format!(
                "script timed out after {} seconds",
                self.timeout.as_secs()
            ))),
        }
    }
}
