use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Method;
use schemars::JsonSchema;
use serde::Deserialize;
use steward_config::GithubConfig;

use super::{send_json, Tool, ToolError};

const GITHUB_API: &str = "https://api.github.com";

/// Thin GitHub REST client shared by the github_* tools.
pub struct GithubClient {
    client: reqwest::Client,
    api_base: String,
    token: String,
    default_owner: String,
    default_repo: String,
}

impl GithubClient {
    pub fn new(config: &GithubConfig) -> Self {
        Self::with_base(config, GITHUB_API)
    }

    pub fn with_base(config: &GithubConfig, api_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            default_owner: config.owner.clone(),
            default_repo: config.repo.clone(),
        }
    }

    /// Resolve "owner/repo", falling back to the configured defaults.
    fn repo_path(&self, owner: Option<&str>, repo: Option<&str>) -> Result<String, ToolError> {
        let owner = owner.filter(|o| !o.is_empty()).unwrap_or(&self.default_owner);
        let repo = repo.filter(|r| !r.is_empty()).unwrap_or(&self.default_repo);
        if owner.is_empty() || repo.is_empty() {
            return Err(ToolError::InvalidArguments(
                "owner and repo are required (no default repository configured)".into(),
            ));
        }
        Ok(format!("repos/{owner}/{repo}"))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ToolError> {
        if self.token.is_empty() {
            return Err(ToolError::MissingCredential("GITHUB_TOKEN"));
        }
        let mut req = self
            .client
            .request(method, format!("{}/{path}", self.api_base))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", "steward")
            .timeout(Duration::from_secs(30));
        if let Some(body) = body {
            req = req.json(&body);
        }
        send_json(req).await
    }

    /// Current blob sha of a file, or None if it does not exist yet.
    async fn file_sha(&self, repo: &str, path: &str, branch: &str) -> Result<Option<String>, ToolError> {
        match self
            .request(
                Method::GET,
                &format!("{repo}/contents/{path}?ref={branch}"),
                None,
            )
            .await
        {
            Ok(v) => Ok(v.get("sha").and_then(|s| s.as_str()).map(String::from)),
            Err(ToolError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn str_field(v: &serde_json::Value, key: &str) -> serde_json::Value {
    v.get(key).cloned().unwrap_or(serde_json::Value::Null)
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    /// Path of the file inside the repository.
    pub path: String,
    /// Branch, tag or commit. Defaults to the repository default branch.
    pub branch: Option<String>,
    pub owner: Option<String>,
    pub repo: Option<String>,
}

pub struct GithubReadFileTool {
    github: Arc<GithubClient>,
}

impl GithubReadFileTool {
    pub fn new(github: Arc<GithubClient>) -> Self {
        Self { github }
    }
}

#[async_trait]
impl Tool for GithubReadFileTool {
    type Args = ReadFileArgs;
    const NAME: &'static str = "github_read_file";
    const MUTATING: bool = false;

    fn description(&self) -> &str {
        "Read a file from a GitHub repository."
    }

    async fn execute(&self, args: ReadFileArgs) -> Result<serde_json::Value, ToolError> {
        let repo = self
            .github
            .repo_path(args.owner.as_deref(), args.repo.as_deref())?;
        let mut path = format!("{repo}/contents/{}", args.path.trim_start_matches('/'));
        if let Some(branch) = args.branch.as_deref().filter(|b| !b.is_empty()) {
            path.push_str(&format!("?ref={branch}"));
        }
        let file = self.github.request(Method::GET, &path, None).await?;

        let encoded: String = file
            .get("content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| ToolError::Execution(format!("'{}' is not a file", args.path)))?
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ToolError::Execution(format!("malformed file content: {e}")))?;

        Ok(serde_json::json!({
            "path": args.path,
            "sha": str_field(&file, "sha"),
            "content": String::from_utf8_lossy(&bytes),
        }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListFilesArgs {
    /// Only list files under this directory.
    pub path: Option<String>,
    /// Branch, tag or commit. Defaults to "main".
    pub branch: Option<String>,
    pub owner: Option<String>,
    pub repo: Option<String>,
}

pub struct GithubListFilesTool {
    github: Arc<GithubClient>,
}

impl GithubListFilesTool {
    pub fn new(github: Arc<GithubClient>) -> Self {
        Self { github }
    }
}

/// Blob paths of a git tree listing under `prefix`.
fn tree_files(tree: &serde_json::Value, prefix: &str) -> Vec<String> {
    let prefix = prefix.trim_matches('/');
    tree.get("tree")
        .and_then(|t| t.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter(|e| e.get("type").and_then(|t| t.as_str()) == Some("blob"))
                .filter_map(|e| e.get("path").and_then(|p| p.as_str()))
                .filter(|p| {
                    prefix.is_empty()
                        || p.strip_prefix(prefix)
                            .is_some_and(|rest| rest.starts_with('/'))
                })
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Tool for GithubListFilesTool {
    type Args = ListFilesArgs;
    const NAME: &'static str = "github_list_files";
    const MUTATING: bool = false;

    fn description(&self) -> &str {
        "List the files of a GitHub repository, optionally under one directory."
    }

    async fn execute(&self, args: ListFilesArgs) -> Result<serde_json::Value, ToolError> {
        let repo = self
            .github
            .repo_path(args.owner.as_deref(), args.repo.as_deref())?;
        let branch = args.branch.as_deref().filter(|b| !b.is_empty()).unwrap_or("main");
        let tree = self
            .github
            .request(
                Method::GET,
                &format!("{repo}/git/trees/{branch}?recursive=1"),
                None,
            )
            .await?;

        Ok(serde_json::json!({
            "branch": branch,
            "files": tree_files(&tree, args.path.as_deref().unwrap_or("")),
            "truncated": tree.get("truncated").and_then(|t| t.as_bool()).unwrap_or(false),
        }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateIssueArgs {
    pub title: String,
    pub body: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub owner: Option<String>,
    pub repo: Option<String>,
}

pub struct GithubCreateIssueTool {
    github: Arc<GithubClient>,
}

impl GithubCreateIssueTool {
    pub fn new(github: Arc<GithubClient>) -> Self {
        Self { github }
    }
}

#[async_trait]
impl Tool for GithubCreateIssueTool {
    type Args = CreateIssueArgs;
    const NAME: &'static str = "github_create_issue";
    const MUTATING: bool = true;

    fn description(&self) -> &str {
        "Open an issue in a GitHub repository."
    }

    async fn execute(&self, args: CreateIssueArgs) -> Result<serde_json::Value, ToolError> {
        let repo = self
            .github
            .repo_path(args.owner.as_deref(), args.repo.as_deref())?;
        let issue = self
            .github
            .request(
                Method::POST,
                &format!("{repo}/issues"),
                Some(serde_json::json!({
                    "title": args.title,
                    "body": args.body.unwrap_or_default(),
                    "labels": args.labels,
                })),
            )
            .await?;
        Ok(serde_json::json!({
            "number": str_field(&issue, "number"),
            "url": str_field(&issue, "html_url"),
        }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateBranchArgs {
    /// Name of the new branch.
    pub branch: String,
    /// Branch to start from. Defaults to "main".
    pub from: Option<String>,
    pub owner: Option<String>,
    pub repo: Option<String>,
}

pub struct GithubCreateBranchTool {
    github: Arc<GithubClient>,
}

impl GithubCreateBranchTool {
    pub fn new(github: Arc<GithubClient>) -> Self {
        Self { github }
    }
}

#[async_trait]
impl Tool for GithubCreateBranchTool {
    type Args = CreateBranchArgs;
    const NAME: &'static str = "github_create_branch";
    const MUTATING: bool = true;

    fn description(&self) -> &str {
        "Create a new branch in a GitHub repository from an existing branch."
    }

    async fn execute(&self, args: CreateBranchArgs) -> Result<serde_json::Value, ToolError> {
        let repo = self
            .github
            .repo_path(args.owner.as_deref(), args.repo.as_deref())?;
        let from = args.from.as_deref().unwrap_or("main");
        let base = self
            .github
            .request(Method::GET, &format!("{repo}/git/ref/heads/{from}"), None)
            .await?;
        let sha = base
            .get("object")
            .and_then(|o| o.get("sha"))
            .and_then(|s| s.as_str())
            .ok_or_else(|| ToolError::Execution(format!("branch '{from}' has no commit sha")))?
            .to_string();

        self.github
            .request(
                Method::POST,
                &format!("{repo}/git/refs"),
                Some(serde_json::json!({
                    "ref": format!("refs/heads/{}", args.branch),
                    "sha": sha,
                })),
            )
            .await?;
        Ok(serde_json::json!({ "branch": args.branch, "from": from, "sha": sha }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PushFileArgs {
    /// Path of the file inside the repository.
    pub path: String,
    /// Full new file content.
    pub content: String,
    /// Commit message.
    pub message: String,
    pub branch: Option<String>,
    pub owner: Option<String>,
    pub repo: Option<String>,
}

pub struct GithubPushFileTool {
    github: Arc<GithubClient>,
}

impl GithubPushFileTool {
    pub fn new(github: Arc<GithubClient>) -> Self {
        Self { github }
    }
}

#[async_trait]
impl Tool for GithubPushFileTool {
    type Args = PushFileArgs;
    const NAME: &'static str = "github_push_file";
    const MUTATING: bool = true;

    fn description(&self) -> &str {
        "Create or update a file in a GitHub repository with a commit."
    }

    fn preview(&self, args: &serde_json::Value) -> serde_json::Value {
        let mut shown = args.clone();
        if let Some(obj) = shown.as_object_mut() {
            if let Some(content) = obj.get("content").and_then(|c| c.as_str()) {
                let summary = format!("<{} bytes hidden>", content.len());
                obj.insert("content".into(), summary.into());
            }
        }
        shown
    }

    async fn execute(&self, args: PushFileArgs) -> Result<serde_json::Value, ToolError> {
        let repo = self
            .github
            .repo_path(args.owner.as_deref(), args.repo.as_deref())?;
        let path = args.path.trim_start_matches('/');
        let branch = args.branch.as_deref().unwrap_or("main");
        let sha = self.github.file_sha(&repo, path, branch).await?;

        let mut body = serde_json::json!({
            "message": args.message,
            "content": base64::engine::general_purpose::STANDARD.encode(args.content.as_bytes()),
            "branch": branch,
        });
        if let Some(sha) = sha {
            body["sha"] = sha.into();
        }
        let result = self
            .github
            .request(Method::PUT, &format!("{repo}/contents/{path}"), Some(body))
            .await?;
        Ok(serde_json::json!({
            "path": path,
            "branch": branch,
            "commit": result.get("commit").map(|c| str_field(c, "sha")),
        }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreatePullRequestArgs {
    pub title: String,
    /// Branch containing the changes.
    pub head: String,
    /// Branch to merge into. Defaults to "main".
    pub base: Option<String>,
    pub body: Option<String>,
    pub owner: Option<String>,
    pub repo: Option<String>,
}

pub struct GithubCreatePullRequestTool {
    github: Arc<GithubClient>,
}

impl GithubCreatePullRequestTool {
    pub fn new(github: Arc<GithubClient>) -> Self {
        Self { github }
    }
}

#[async_trait]
impl Tool for GithubCreatePullRequestTool {
    type Args = CreatePullRequestArgs;
    const NAME: &'static str = "github_create_pull_request";
    const MUTATING: bool = true;

    fn description(&self) -> &str {
        "Open a pull request in a GitHub repository."
    }

    async fn execute(&self, args: CreatePullRequestArgs) -> Result<serde_json::Value, ToolError> {
        let repo = self
            .github
            .repo_path(args.owner.as_deref(), args.repo.as_deref())?;
        let pr = self
            .github
            .request(
                Method::POST,
                &format!("{repo}/pulls"),
                Some(serde_json::json!({
                    "title": args.title,
                    "head": args.head,
                    "base": args.base.as_deref().unwrap_or("main"),
                    "body": args.body.unwrap_or_default(),
                })),
            )
            .await?;
        Ok(serde_json::json!({
            "number": str_field(&pr, "number"),
            "url": str_field(&pr, "html_url"),
        }))
    }
}
