use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use steward_core::session::ContentPart;
use steward_core::store::{PersistenceStore, StoreError};
use steward_core::task;
use steward_core::tools::gateway::GatewayError;
use steward_core::AgentEvent;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::state::AppState;

/// Error response rendered as `{error}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::new(StatusCode::NOT_FOUND, what),
            StoreError::LeaseHeld { .. } | StoreError::InvalidState(_) => {
                Self::new(StatusCode::CONFLICT, e.to_string())
            }
            other => {
                error!("Store error: {other}");
                Self::internal(other.to_string())
            }
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        let status = match e {
            GatewayError::UnknownInvocation(_) => StatusCode::NOT_FOUND,
            GatewayError::IllegalTransition { .. } => StatusCode::CONFLICT,
        };
        Self::new(status, e.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// A chat turn. `parts` carries typed content (text, images, files);
/// `message` is shorthand for a single text part.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub parts: Vec<ContentPart>,
}

impl ChatRequest {
    /// Request parts in order, `message` first. Blank text parts are dropped.
    fn into_parts(self) -> Vec<ContentPart> {
        self.message
            .map(|text| ContentPart::Text { text })
            .into_iter()
            .chain(self.parts)
            .filter(|p| !matches!(p, ContentPart::Text { text } if text.trim().is_empty()))
            .collect()
    }
}

/// Run one turn and stream its events as NDJSON. Anything that fails before
/// the first model call is a 500; later failures arrive as an `error` event.
pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Response> {
    let session_id = req.session_id.clone();
    let parts = req.into_parts();
    if session_id.trim().is_empty() || parts.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "session_id and a message or parts are required",
        ));
    }
    let agent = state
        .agent
        .clone()
        .ok_or_else(|| ApiError::internal("no model tier is configured"))?;

    let turn = agent
        .prepare_parts(&session_id, &state.owner_id, parts)
        .await
        .map_err(|e| {
            error!("Chat setup failed for session '{session_id}': {e:#}");
            ApiError::internal(format!("{e:#}"))
        })?;

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Err(e) = agent.execute(turn, Some(&tx)).await {
            error!("Chat turn failed: {e:#}");
            let _ = tx.send(AgentEvent::Error {
                message: format!("{e:#}"),
            });
        }
    });

    let lines = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let mut line = serde_json::to_string(&event).unwrap_or_else(|e| {
            json!({ "type": "error", "message": e.to_string() }).to_string()
        });
        line.push('\n');
        Some((Ok::<_, Infallible>(line), rx))
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub session_id: Option<String>,
}

pub async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Response> {
    let Some(session_id) = params.session_id.filter(|s| !s.is_empty()) else {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "session_id is required"));
    };
    let messages = state.store.session_messages(&session_id).await?;
    Ok(Json(messages).into_response())
}

pub async fn pending_tools(State(state): State<AppState>) -> Response {
    Json(state.gateway.pending()).into_response()
}

pub async fn approve_tool(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let result = state.gateway.approve(&id).await?;
    Ok(Json(result.to_value()).into_response())
}

pub async fn reject_tool(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let invocation = state.gateway.reject(&id)?;
    Ok(Json(invocation).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct StartTaskRequest {
    /// Overrides the configured default query for the first iteration.
    #[serde(default)]
    pub query: Option<String>,
}

/// Create a run and start the collector on it in the background.
pub async fn start_task(
    State(state): State<AppState>,
    Json(req): Json<StartTaskRequest>,
) -> ApiResult<Response> {
    let tasks = state
        .tasks
        .clone()
        .ok_or_else(|| ApiError::internal("no model tier is configured"))?;

    let run = task::start_run(state.store.as_ref(), &state.owner_id).await?;
    info!("Task run {} created", run.id);
    tasks.spawn(&run.id, req.query);

    Ok((StatusCode::CREATED, Json(run)).into_response())
}

/// Put a stopped run back in progress and drive it from its latest
/// checkpoint. A run this process is already driving is left as is.
pub async fn resume_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StartTaskRequest>,
) -> ApiResult<Response> {
    let tasks = state
        .tasks
        .clone()
        .ok_or_else(|| ApiError::internal("no model tier is configured"))?;

    let run = task::resume_run(state.store.as_ref(), &id).await?;
    if tasks.spawn(&run.id, req.query) {
        info!("Task run {id} resumed");
    } else {
        warn!("Task run {id} is already running here");
    }
    Ok(Json(run).into_response())
}

pub async fn stop_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    task::stop_run(state.store.as_ref(), &id).await?;
    info!("Task run {id} stop requested");
    Ok(Json(json!({ "id": id, "status": "stopped" })).into_response())
}

pub async fn task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    match task::run_status(state.store.as_ref(), &id).await? {
        Some(status) => Ok(Json(status).into_response()),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("task run {id}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::Request;
    use futures::StreamExt;
    use serde_json::Value;
    use steward_core::agent::ContextBuilder;
    use steward_core::memory::{HashingEmbedder, MemoryRetriever};
    use steward_core::model::{
        ChatMessage, EventStream, ModelEvent, ModelProvider, ModelTier, ProviderError, ToolSpec,
    };
    use steward_core::session::{Message, Role};
    use steward_core::store::{SqliteStore, TaskStatus};
    use steward_core::task::{DurableTaskExecutor, ExecutorSettings, TaskSupervisor};
    use steward_core::tools::database::QueryExecutor;
    use steward_core::tools::web::{SearchHit, SearchProvider};
    use steward_core::tools::{Tool, ToolError, ToolGateway, ToolRegistry};
    use steward_core::AgentLoop;
    use tower::ServiceExt;

    use super::*;
    use crate::{recover_runs, router};

    /// Answers every turn with the same text.
    struct CannedModel;

    #[async_trait]
    impl ModelProvider for CannedModel {
        async fn classify(&self, _prompt: &str, _schema: &Value) -> Result<Value, ProviderError> {
            Ok(json!({"isComplex": false, "reason": "greeting"}))
        }

        async fn converse(
            &self,
            _tier: ModelTier,
            _system_prompt: &str,
            _messages: &[ChatMessage],
            _tools: &[ToolSpec],
        ) -> Result<EventStream, ProviderError> {
            let events = vec![
                Ok(ModelEvent::TextDelta("Hello ".into())),
                Ok(ModelEvent::TextDelta("there".into())),
                Ok(ModelEvent::Done),
            ];
            Ok(futures::stream::iter(events).boxed())
        }

        async fn extract(&self, _prompt: &str, _schema: &Value) -> Result<Value, ProviderError> {
            Ok(json!({
                "journalists": [{"name": "Anna Nowak", "email": "anna@gazeta.pl"}],
                "nextQuery": "next"
            }))
        }
    }

    struct OneHit;

    #[async_trait]
    impl SearchProvider for OneHit {
        async fn search(&self, _query: &str, _max: u32) -> Result<Vec<SearchHit>, ToolError> {
            Ok(vec![SearchHit {
                title: "Desk".into(),
                url: "https://example.pl".into(),
                content: "anna@gazeta.pl".into(),
            }])
        }
    }

    #[derive(Deserialize, schemars::JsonSchema)]
    struct DeployArgs {
        target: String,
    }

    struct Deploy;

    #[async_trait]
    impl Tool for Deploy {
        type Args = DeployArgs;
        const NAME: &'static str = "deploy";
        const MUTATING: bool = true;

        fn description(&self) -> &str {
            "Deploy a target"
        }

        async fn execute(&self, args: DeployArgs) -> Result<Value, ToolError> {
            Ok(json!({ "deployed": args.target }))
        }
    }

    fn base_state() -> AppState {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut registry = ToolRegistry::new();
        registry.register(Deploy);
        AppState::new(store, Arc::new(ToolGateway::new(registry)), "owner")
    }

    fn with_agent(state: AppState) -> AppState {
        let dir = std::env::temp_dir();
        let store: Arc<dyn PersistenceStore> = state.store.clone();
        let retriever = Arc::new(MemoryRetriever::new(
            store.clone(),
            Arc::new(HashingEmbedder::new(32)),
            &Default::default(),
        ));
        let agent = AgentLoop::new(
            Arc::new(CannedModel),
            retriever,
            state.gateway.clone(),
            store,
            ContextBuilder::new(&dir, None),
        );
        state.with_agent(Arc::new(agent))
    }

    fn with_tasks(state: AppState, max_iterations: u64) -> AppState {
        let settings = ExecutorSettings {
            default_query: "default query".into(),
            fallback_query: "fallback query".into(),
            max_iterations,
            interval: Duration::from_millis(1),
            retry_interval: Duration::from_millis(1),
            max_duration: Duration::from_secs(3600),
            lease_ttl: Duration::from_secs(60),
            results_per_search: 5,
        };
        let executor = DurableTaskExecutor::new(
            state.store.clone(),
            Arc::new(OneHit),
            Arc::new(CannedModel),
            settings,
        );
        state.with_tasks(Arc::new(TaskSupervisor::new(Arc::new(executor))))
    }

    async fn wait_until_completed(store: &SqliteStore, id: &str) {
        for _ in 0..200 {
            let run = store.task_run(id).await.unwrap().unwrap();
            if run.status == TaskStatus::Completed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task run {id} did not complete");
    }

    async fn send(state: AppState, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router(state).oneshot(req).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn as_json(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn chat_streams_ndjson_and_persists() {
        let state = with_agent(base_state());
        let store = state.store.clone();

        let (status, body) = send(
            state,
            post_json("/api/chat", json!({"session_id": "s1", "message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let events: Vec<Value> = String::from_utf8(body)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events[0], json!({"type": "text", "delta": "Hello "}));
        assert_eq!(events[1], json!({"type": "text", "delta": "there"}));
        assert_eq!(events.last().unwrap()["type"], "done");
        assert_eq!(events.last().unwrap()["tier"], "light");

        let messages = store.session_messages("s1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].flat_text(), "Hello there");
    }

    #[tokio::test]
    async fn chat_without_model_is_500() {
        let (status, body) = send(
            base_state(),
            post_json("/api/chat", json!({"session_id": "s1", "message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(as_json(&body)["error"].as_str().unwrap().contains("model"));
    }

    #[tokio::test]
    async fn chat_setup_failure_is_500_before_streaming() {
        let state = with_agent(base_state());
        state
            .store
            .execute_raw("DROP TABLE messages", &[])
            .await
            .unwrap();

        let (status, body) = send(
            state,
            post_json("/api/chat", json!({"session_id": "s1", "message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(as_json(&body)["error"].is_string());
    }

    #[tokio::test]
    async fn chat_rejects_empty_message() {
        let state = with_agent(base_state());
        let (status, _) = send(
            state,
            post_json("/api/chat", json!({"session_id": "s1", "message": "  "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_persists_image_parts() {
        let state = with_agent(base_state());
        let (status, _) = send(
            state.clone(),
            post_json(
                "/api/chat",
                json!({
                    "session_id": "s1",
                    "parts": [
                        {"type": "text", "text": "what is in this photo?"},
                        {"type": "image", "url": "https://cdn.example.com/p.jpg"}
                    ]
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(state, get("/api/history?session_id=s1")).await;
        assert_eq!(status, StatusCode::OK);
        let user = &as_json(&body)[0];
        assert_eq!(user["role"], "user");
        assert_eq!(user["parts"][0], json!({"type": "text", "text": "what is in this photo?"}));
        assert_eq!(
            user["parts"][1],
            json!({"type": "image", "url": "https://cdn.example.com/p.jpg"})
        );
    }

    #[tokio::test]
    async fn chat_rejects_request_without_content() {
        let state = with_agent(base_state());
        let (status, _) = send(
            state,
            post_json("/api/chat", json!({"session_id": "s1", "parts": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn history_requires_session_id() {
        let state = base_state();
        state
            .store
            .append_message(&Message::text("s1", "owner", Role::User, "first"))
            .await
            .unwrap();
        state
            .store
            .append_message(&Message::text("s1", "owner", Role::Assistant, "second"))
            .await
            .unwrap();

        let (status, _) = send(state.clone(), get("/api/history")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(state, get("/api/history?session_id=s1")).await;
        assert_eq!(status, StatusCode::OK);
        let messages = as_json(&body);
        assert_eq!(messages.as_array().unwrap().len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["parts"][0]["text"], "second");
    }

    #[tokio::test]
    async fn approve_runs_pending_invocation() {
        let state = base_state();
        let pending = state.gateway.invoke("deploy", json!({"target": "prod"})).await;
        let invocation = pending.to_value()["invocationId"]
            .as_str()
            .unwrap()
            .to_string();

        let (status, body) = send(state.clone(), get("/api/tools/pending")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(as_json(&body).as_array().unwrap().len(), 1);

        let (status, body) = send(
            state.clone(),
            post_json(&format!("/api/tools/approve/{invocation}"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(as_json(&body), json!({"status": "success", "deployed": "prod"}));

        // Already consumed
        let (status, _) = send(
            state,
            post_json(&format!("/api/tools/approve/{invocation}"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reject_discards_pending_invocation() {
        let state = base_state();
        state.gateway.invoke("deploy", json!({"target": "prod"})).await;
        let id = state.gateway.pending()[0].id.clone();

        let (status, body) = send(
            state.clone(),
            post_json(&format!("/api/tools/reject/{id}"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(as_json(&body)["state"], "rejected");
        assert!(state.gateway.pending().is_empty());

        let (status, _) = send(state, post_json("/api/tools/reject/nope", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn task_stop_and_status() {
        let state = base_state();
        let run = task::start_run(state.store.as_ref(), "owner").await.unwrap();

        let (status, body) = send(state.clone(), get(&format!("/api/tasks/{}", run.id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(as_json(&body)["run"]["status"], "in_progress");

        let (status, _) = send(
            state.clone(),
            post_json(&format!("/api/tasks/{}/stop", run.id), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(state.clone(), get(&format!("/api/tasks/{}", run.id))).await;
        assert_eq!(as_json(&body)["run"]["status"], "stopped");

        let (status, _) = send(state.clone(), get("/api/tasks/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(state, post_json("/api/tasks/missing/stop", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_task_without_model_is_500() {
        let (status, _) = send(base_state(), post_json("/api/tasks", json!({}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn resume_restarts_stopped_run() {
        let state = with_tasks(base_state(), 2);
        let run = task::start_run(state.store.as_ref(), "owner").await.unwrap();
        task::stop_run(state.store.as_ref(), &run.id).await.unwrap();

        let (status, body) = send(
            state.clone(),
            post_json(&format!("/api/tasks/{}/resume", run.id), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(as_json(&body)["status"], "in_progress");

        wait_until_completed(&state.store, &run.id).await;
        assert_eq!(state.store.checkpoints(&run.id).await.unwrap().len(), 2);

        let (status, _) = send(
            state.clone(),
            post_json(&format!("/api/tasks/{}/resume", run.id), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = send(state, post_json("/api/tasks/missing/resume", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn startup_recovers_in_progress_runs() {
        let state = with_tasks(base_state(), 1);
        let orphan = task::start_run(state.store.as_ref(), "owner").await.unwrap();
        let stopped = task::start_run(state.store.as_ref(), "owner").await.unwrap();
        task::stop_run(state.store.as_ref(), &stopped.id).await.unwrap();

        assert_eq!(recover_runs(&state).await.unwrap(), 1);
        wait_until_completed(&state.store, &orphan.id).await;
        let stopped = state.store.task_run(&stopped.id).await.unwrap().unwrap();
        assert_eq!(stopped.status, TaskStatus::Stopped);

        assert_eq!(recover_runs(&base_state()).await.unwrap(), 0);
    }
}
