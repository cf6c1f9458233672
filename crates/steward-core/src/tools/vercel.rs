use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use steward_config::VercelConfig;

use super::{send_json, Tool, ToolError};

const VERCEL_API: &str = "https://api.vercel.com";
const DEFAULT_LOG_LINES: u32 = 100;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DeployTarget {
    #[default]
    Production,
    Preview,
    Development,
}

impl DeployTarget {
    fn as_str(&self) -> &'static str {
        match self {
            DeployTarget::Production => "production",
            DeployTarget::Preview => "preview",
            DeployTarget::Development => "development",
        }
    }
}

/// Vercel REST client shared by the vercel_* tools.
pub struct VercelClient {
    client: reqwest::Client,
    api_base: String,
    token: String,
    project_id: String,
}

impl VercelClient {
    pub fn new(config: &VercelConfig) -> Self {
        Self::with_base(config, VERCEL_API)
    }

    pub fn with_base(config: &VercelConfig, api_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            project_id: config.project_id.clone(),
        }
    }

    fn check_token(&self) -> Result<(), ToolError> {
        if self.token.is_empty() {
            return Err(ToolError::MissingCredential("VERCEL_API_TOKEN"));
        }
        Ok(())
    }

    fn project(&self) -> Result<&str, ToolError> {
        if self.project_id.is_empty() {
            return Err(ToolError::MissingCredential("tools.vercel.projectId"));
        }
        Ok(&self.project_id)
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value, ToolError> {
        send_json(
            self.client
                .get(format!("{}{path}", self.api_base))
                .bearer_auth(&self.token)
                .timeout(Duration::from_secs(30)),
        )
        .await
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        send_json(
            self.client
                .post(format!("{}{path}", self.api_base))
                .bearer_auth(&self.token)
                .json(&body)
                .timeout(Duration::from_secs(30)),
        )
        .await
    }

    /// Fetch a deployment by id, or the latest one of the configured project.
    async fn deployment(
        &self,
        deployment_id: Option<&str>,
        target: Option<DeployTarget>,
    ) -> Result<serde_json::Value, ToolError> {
        if let Some(id) = deployment_id.filter(|id| !id.is_empty()) {
            return self.get(&format!("/v13/deployments/{id}")).await;
        }
        let mut path = format!("/v6/deployments?projectId={}&limit=1", self.project()?);
        if let Some(target) = target {
            path.push_str(&format!("&target={}", target.as_str()));
        }
        let list = self.get(&path).await?;
        list.get("deployments")
            .and_then(|d| d.get(0))
            .cloned()
            .ok_or_else(|| ToolError::Execution("project has no deployments".into()))
    }
}

fn deployment_id(deployment: &serde_json::Value) -> Result<String, ToolError> {
    deployment
        .get("uid")
        .or_else(|| deployment.get("id"))
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| ToolError::Execution("deployment response has no id".into()))
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RedeployArgs {
    /// Deployment to rebuild. Defaults to the latest deployment of the project.
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub target: DeployTarget,
}

/// Trigger a fresh build of an existing Vercel deployment.
pub struct VercelRedeployTool {
    vercel: Arc<VercelClient>,
}

impl VercelRedeployTool {
    pub fn new(vercel: Arc<VercelClient>) -> Self {
        Self { vercel }
    }
}

#[async_trait]
impl Tool for VercelRedeployTool {
    type Args = RedeployArgs;
    const NAME: &'static str = "vercel_redeploy";
    const MUTATING: bool = true;

    fn description(&self) -> &str {
        "Redeploy the project on Vercel by rebuilding an existing deployment."
    }

    async fn execute(&self, args: RedeployArgs) -> Result<serde_json::Value, ToolError> {
        self.vercel.check_token()?;
        let source = self
            .vercel
            .deployment(args.deployment_id.as_deref(), Some(args.target))
            .await?;
        let uid = deployment_id(&source)?;
        let name = source
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::Execution("deployment response has no name".into()))?;

        let created = self
            .vercel
            .post(
                "/v13/deployments?forceNew=1",
                serde_json::json!({
                    "name": name,
                    "deploymentId": uid,
                    "target": args.target,
                }),
            )
            .await?;

        Ok(serde_json::json!({
            "id": created.get("id").cloned().unwrap_or_default(),
            "url": created.get("url").cloned().unwrap_or_default(),
            "readyState": created.get("readyState").cloned().unwrap_or_default(),
            "redeployedFrom": uid,
        }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetLogsArgs {
    /// Deployment to read. Defaults to the latest deployment of the project.
    pub deployment_id: Option<String>,
    /// Maximum number of log lines, newest last. Defaults to 100.
    pub limit: Option<u32>,
}

/// Build and runtime output of a deployment, so a failed build can be
/// diagnosed and fixed.
pub struct VercelGetLogsTool {
    vercel: Arc<VercelClient>,
}

impl VercelGetLogsTool {
    pub fn new(vercel: Arc<VercelClient>) -> Self {
        Self { vercel }
    }
}

/// Flatten deployment events into printable lines.
fn log_lines(events: &serde_json::Value) -> Vec<String> {
    events
        .as_array()
        .map(|events| {
            events
                .iter()
                .filter_map(|e| {
                    e.get("text")
                        .or_else(|| e.get("payload").and_then(|p| p.get("text")))
                        .and_then(|t| t.as_str())
                })
                .filter(|t| !t.trim().is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Tool for VercelGetLogsTool {
    type Args = GetLogsArgs;
    const NAME: &'static str = "vercel_get_logs";
    const MUTATING: bool = false;

    fn description(&self) -> &str {
        "Read the build logs and state of a Vercel deployment."
    }

    async fn execute(&self, args: GetLogsArgs) -> Result<serde_json::Value, ToolError> {
        self.vercel.check_token()?;
        let deployment = self
            .vercel
            .deployment(args.deployment_id.as_deref(), None)
            .await?;
        let id = deployment_id(&deployment)?;
        let limit = args.limit.unwrap_or(DEFAULT_LOG_LINES).max(1);
        let events = self
            .vercel
            .get(&format!("/v3/deployments/{id}/events?limit={limit}&direction=backward"))
            .await?;

        let mut lines = log_lines(&events);
        // Backward pagination returns newest first
        lines.reverse();
        Ok(serde_json::json!({
            "deploymentId": id,
            "state": deployment
                .get("readyState")
                .or_else(|| deployment.get("state"))
                .cloned()
                .unwrap_or_default(),
            "logs": lines,
        }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AddEnvArgs {
    /// Variable name.
    pub key: String,
    pub value: String,
    /// Environments that receive the variable. Defaults to all three.
    #[serde(default)]
    pub targets: Vec<DeployTarget>,
}

/// Create or overwrite a project environment variable.
pub struct VercelAddEnvTool {
    vercel: Arc<VercelClient>,
}

impl VercelAddEnvTool {
    pub fn new(vercel: Arc<VercelClient>) -> Self {
        Self { vercel }
    }
}

#[async_trait]
impl Tool for VercelAddEnvTool {
    type Args = AddEnvArgs;
    const NAME: &'static str = "vercel_add_env";
    const MUTATING: bool = true;

    fn description(&self) -> &str {
        "Add or update an environment variable on the Vercel project. Takes effect on the next deployment."
    }

    fn preview(&self, args: &serde_json::Value) -> serde_json::Value {
        let mut shown = args.clone();
        if let Some(obj) = shown.as_object_mut() {
            if obj.contains_key("value") {
                obj.insert("value".into(), "<hidden>".into());
            }
        }
        shown
    }

    async fn execute(&self, args: AddEnvArgs) -> Result<serde_json::Value, ToolError> {
        self.vercel.check_token()?;
        let project = self.vercel.project()?;
        if args.key.trim().is_empty() {
            return Err(ToolError::InvalidArguments("key must not be empty".into()));
        }
        let targets = if args.targets.is_empty() {
            vec![
                DeployTarget::Production,
                DeployTarget::Preview,
                DeployTarget::Development,
            ]
        } else {
            args.targets
        };

        let created = self
            .vercel
            .post(
                &format!("/v10/projects/{project}/env?upsert=true"),
                serde_json::json!({
                    "key": args.key,
                    "value": args.value,
                    "type": "encrypted",
                    "target": targets,
                }),
            )
            .await?;

        Ok(serde_json::json!({
            "key": args.key,
            "targets": targets,
            "created": created.get("created").is_some() || created.get("id").is_some(),
        }))
    }
}
