use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::validate::validate_params;
use super::{DynTool, ToolRegistry};
use crate::model::ToolSpec;
use crate::util;

/// Lifecycle of a single tool invocation.
///
/// ```text
/// pending_approval -> approved | rejected
/// approved         -> executed | failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    PendingApproval,
    Approved,
    Rejected,
    Executed,
    Failed,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Executed | Self::Failed)
    }

    fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::PendingApproval, Self::Approved)
                | (Self::PendingApproval, Self::Rejected)
                | (Self::Approved, Self::Executed)
                | (Self::Approved, Self::Failed)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no pending invocation with id '{0}'")]
    UnknownInvocation(String),
    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: InvocationState,
        to: InvocationState,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub id: String,
    pub tool: String,
    pub args: serde_json::Value,
    pub state: InvocationState,
    /// Every state this invocation has been in, oldest first.
    pub history: Vec<InvocationState>,
    pub created_at: DateTime<Utc>,
}

impl ToolInvocation {
    fn new(tool: &str, args: serde_json::Value, initial: InvocationState) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool: tool.to_string(),
            args,
            state: initial,
            history: vec![initial],
            created_at: Utc::now(),
        }
    }

    fn transition(&mut self, next: InvocationState) -> Result<(), GatewayError> {
        if !self.state.can_become(next) {
            return Err(GatewayError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// True when the invocation went through `approved` before executing.
    pub fn was_approved(&self) -> bool {
        self.history.contains(&InvocationState::Approved)
    }
}

/// Outcome of one gateway call, as fed back to the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Success(serde_json::Value),
    RequiresApproval {
        invocation_id: String,
        message: String,
        args: serde_json::Value,
    },
    Error(String),
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolResult::Error(_))
    }

    /// `{status: "success", ...payload}`, `{status: "requires_approval", args}`
    /// or `{error}`.
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            ToolResult::Success(payload) => {
                let mut obj = serde_json::Map::new();
                obj.insert("status".into(), "success".into());
                match payload {
                    serde_json::Value::Object(fields) => {
                        for (k, v) in fields {
                            if k != "status" {
                                obj.insert(k.clone(), v.clone());
                            }
                        }
                    }
                    serde_json::Value::Null => {}
                    other => {
                        obj.insert("result".into(), other.clone());
                    }
                }
                serde_json::Value::Object(obj)
            }
            ToolResult::RequiresApproval {
                invocation_id,
                message,
                args,
            } => serde_json::json!({
                "status": "requires_approval",
                "invocationId": invocation_id,
                "message": message,
                "args": args,
            }),
            ToolResult::Error(e) => serde_json::json!({ "error": e }),
        }
    }
}

/// Remove the gateway-level `confirm` flag from the arguments.
fn split_confirm(mut args: serde_json::Value) -> (serde_json::Value, bool) {
    let confirm = args
        .as_object_mut()
        .and_then(|obj| obj.remove("confirm"))
        .map(|v| v == serde_json::Value::Bool(true))
        .unwrap_or(false);
    (args, confirm)
}

fn preview(value: &serde_json::Value) -> String {
    util::preview(&value.to_string(), 200)
}

/// Finished invocations kept for inspection.
const JOURNAL_CAPACITY: usize = 1000;
/// Pending invocations nobody decided on within this window are dropped.
const PENDING_TTL: Duration = Duration::from_secs(24 * 3600);

/// Single point of tool execution with the approval gate.
///
/// Non-mutating tools run immediately. Mutating tools run only with
/// `confirm=true` or after [`ToolGateway::approve`].
pub struct ToolGateway {
    registry: ToolRegistry,
    pending: Mutex<HashMap<String, ToolInvocation>>,
    journal: Mutex<VecDeque<ToolInvocation>>,
    journal_capacity: usize,
    pending_ttl: Duration,
}

impl ToolGateway {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            pending: Mutex::new(HashMap::new()),
            journal: Mutex::new(VecDeque::new()),
            journal_capacity: JOURNAL_CAPACITY,
            pending_ttl: PENDING_TTL,
        }
    }

    pub fn with_limits(mut self, journal_capacity: usize, pending_ttl: Duration) -> Self {
        self.journal_capacity = journal_capacity.max(1);
        self.pending_ttl = pending_ttl;
        self
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.registry.specs()
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, ToolInvocation>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_journal(&self) -> MutexGuard<'_, VecDeque<ToolInvocation>> {
        self.journal.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reject pending invocations older than the TTL.
    fn expire_pending(&self) {
        let now = Utc::now();
        let expired: Vec<ToolInvocation> = {
            let mut pending = self.lock_pending();
            let stale: Vec<String> = pending
                .iter()
                .filter(|(_, inv)| {
                    (now - inv.created_at).to_std().unwrap_or_default() > self.pending_ttl
                })
                .map(|(id, _)| id.clone())
                .collect();
            stale.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for mut invocation in expired {
            if invocation.transition(InvocationState::Rejected).is_ok() {
                info!(
                    "Invocation {} ({}) expired without a decision",
                    invocation.id, invocation.tool
                );
                self.record(invocation);
            }
        }
    }

    /// Invoke `name` with model-supplied `args`. Never fails: errors are
    /// returned as [`ToolResult::Error`].
    pub async fn invoke(&self, name: &str, args: serde_json::Value) -> ToolResult {
        self.expire_pending();
        let Some(tool) = self.registry.get(name) else {
            warn!("Model called unknown tool '{name}'");
            return ToolResult::Error(format!("unknown tool: {name}"));
        };

        let (args, confirm) = split_confirm(args);
        let errors = validate_params(&args, &tool.parameters_schema());
        if !errors.is_empty() {
            return ToolResult::Error(format!(
                "Invalid parameters for tool '{name}': {}",
                errors.join("; ")
            ));
        }

        if !tool.mutating() {
            let invocation = ToolInvocation::new(name, args, InvocationState::Approved);
            return self.execute(tool, invocation).await;
        }

        if confirm {
            // A confirmed resubmission of a pending call progresses that call
            let resubmitted = {
                let mut pending = self.lock_pending();
                let id = pending
                    .iter()
                    .find(|(_, inv)| inv.tool == name && inv.args == args)
                    .map(|(id, _)| id.clone());
                id.and_then(|id| pending.remove(&id))
            };
            let invocation = match resubmitted {
                Some(mut inv) => match inv.transition(InvocationState::Approved) {
                    Ok(()) => inv,
                    Err(e) => return ToolResult::Error(e.to_string()),
                },
                None => ToolInvocation::new(name, args, InvocationState::Approved),
            };
            info!("Tool '{name}' confirmed, executing invocation {}", invocation.id);
            return self.execute(tool, invocation).await;
        }

        let invocation = ToolInvocation::new(name, args, InvocationState::PendingApproval);
        let result = ToolResult::RequiresApproval {
            invocation_id: invocation.id.clone(),
            message: format!(
                "'{name}' changes external state and needs explicit approval. \
                 Ask the user, then resubmit the same call with confirm=true."
            ),
            args: tool.preview(&invocation.args),
        };
        info!(
            "Tool '{name}' awaiting approval (invocation {})",
            invocation.id
        );
        self.lock_pending()
            .insert(invocation.id.clone(), invocation);
        result
    }

    /// Approve a pending invocation and execute it.
    pub async fn approve(&self, invocation_id: &str) -> Result<ToolResult, GatewayError> {
        self.expire_pending();
        let mut invocation = self
            .lock_pending()
            .remove(invocation_id)
            .ok_or_else(|| GatewayError::UnknownInvocation(invocation_id.to_string()))?;
        invocation.transition(InvocationState::Approved)?;

        let Some(tool) = self.registry.get(&invocation.tool) else {
            let message = format!("unknown tool: {}", invocation.tool);
            invocation.transition(InvocationState::Failed)?;
            self.record(invocation);
            return Ok(ToolResult::Error(message));
        };
        info!("Invocation {invocation_id} approved by operator");
        Ok(self.execute(tool, invocation).await)
    }

    /// Reject a pending invocation. Nothing is executed.
    pub fn reject(&self, invocation_id: &str) -> Result<ToolInvocation, GatewayError> {
        self.expire_pending();
        let mut invocation = self
            .lock_pending()
            .remove(invocation_id)
            .ok_or_else(|| GatewayError::UnknownInvocation(invocation_id.to_string()))?;
        invocation.transition(InvocationState::Rejected)?;
        info!("Invocation {invocation_id} ({}) rejected", invocation.tool);
        self.record(invocation.clone());
        Ok(invocation)
    }

    pub fn pending(&self) -> Vec<ToolInvocation> {
        self.expire_pending();
        let mut list: Vec<ToolInvocation> = self.lock_pending().values().cloned().collect();
        list.sort_by_key(|inv| inv.created_at);
        list
    }

    /// The most recent finished invocations, oldest first.
    pub fn journal(&self) -> Vec<ToolInvocation> {
        self.lock_journal().iter().cloned().collect()
    }

    fn record(&self, invocation: ToolInvocation) {
        let mut journal = self.lock_journal();
        journal.push_back(invocation);
        while journal.len() > self.journal_capacity {
            journal.pop_front();
        }
    }

    async fn execute(&self, tool: &dyn DynTool, mut invocation: ToolInvocation) -> ToolResult {
        let name = tool.name();
        info!("Tool call: {name}({})", preview(&tool.preview(&invocation.args)));

        let (next, result) = match tool.call(invocation.args.clone()).await {
            Ok(payload) => {
                debug!("Tool result [{name}]: {}", preview(&payload));
                (InvocationState::Executed, ToolResult::Success(payload))
            }
            Err(e) => {
                warn!("Tool '{name}' failed: {e}");
                (InvocationState::Failed, ToolResult::Error(e.to_string()))
            }
        };
        if let Err(e) = invocation.transition(next) {
            warn!("Invocation {} bookkeeping: {e}", invocation.id);
        }
        self.record(invocation);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Tool, ToolError};
    use async_trait::async_trait;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Deserialize, JsonSchema)]
    struct WriteArgs {
        key: String,
        #[serde(default)]
        secret: Option<String>,
    }

    /// Counts side effects.
    struct Write {
        effects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Write {
        type Args = WriteArgs;
        const NAME: &'static str = "write";
        const MUTATING: bool = true;

        fn description(&self) -> &str {
            "Write a key"
        }

        fn preview(&self, args: &serde_json::Value) -> serde_json::Value {
            let mut shown = args.clone();
            if let Some(obj) = shown.as_object_mut() {
                obj.remove("secret");
            }
            shown
        }

        async fn execute(&self, args: WriteArgs) -> Result<serde_json::Value, ToolError> {
            self.effects.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({ "written": args.key, "hadSecret": args.secret.is_some() }))
        }
    }

    #[derive(Deserialize, JsonSchema)]
    struct LookupArgs {
        key: String,
    }

    struct Lookup;

    #[async_trait]
    impl Tool for Lookup {
        type Args = LookupArgs;
        const NAME: &'static str = "lookup";
        const MUTATING: bool = false;

        fn description(&self) -> &str {
            "Look up a key"
        }

        async fn execute(&self, args: LookupArgs) -> Result<serde_json::Value, ToolError> {
            if args.key == "missing" {
                return Err(ToolError::MissingCredential("LOOKUP_TOKEN"));
            }
            Ok(serde_json::json!({ "value": 42 }))
        }
    }

    fn gateway() -> (ToolGateway, Arc<AtomicUsize>) {
        let effects = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Write {
            effects: effects.clone(),
        });
        registry.register(Lookup);
        (ToolGateway::new(registry), effects)
    }

    #[tokio::test]
    async fn mutating_without_confirm_requires_approval_and_has_no_effect() {
        let (gw, effects) = gateway();
        for args in [
            serde_json::json!({"key": "a"}),
            serde_json::json!({"key": "b", "confirm": false}),
            serde_json::json!({"key": "c", "confirm": "true"}),
        ] {
            let result = gw.invoke("write", args).await;
            let value = result.to_value();
            assert_eq!(value["status"], "requires_approval");
            assert!(value["args"].get("confirm").is_none());
        }
        assert_eq!(effects.load(Ordering::SeqCst), 0);
        assert_eq!(gw.pending().len(), 3);
        assert!(gw.journal().is_empty());
    }

    #[tokio::test]
    async fn mutating_with_confirm_skips_pending_state() {
        let (gw, effects) = gateway();
        let result = gw
            .invoke("write", serde_json::json!({"key": "a", "confirm": true}))
            .await;
        let value = result.to_value();
        assert_eq!(value["status"], "success");
        assert_eq!(value["written"], "a");
        assert_eq!(effects.load(Ordering::SeqCst), 1);

        let journal = gw.journal();
        assert_eq!(journal.len(), 1);
        assert_eq!(
            journal[0].history,
            vec![InvocationState::Approved, InvocationState::Executed]
        );
        assert!(gw.pending().is_empty());
    }

    #[tokio::test]
    async fn confirmed_resubmission_progresses_pending_call() {
        let (gw, effects) = gateway();
        gw.invoke("write", serde_json::json!({"key": "a"})).await;
        assert_eq!(gw.pending().len(), 1);

        gw.invoke("write", serde_json::json!({"key": "a", "confirm": true}))
            .await;
        assert!(gw.pending().is_empty());
        assert_eq!(effects.load(Ordering::SeqCst), 1);
        assert_eq!(
            gw.journal()[0].history,
            vec![
                InvocationState::PendingApproval,
                InvocationState::Approved,
                InvocationState::Executed
            ]
        );
    }

    #[tokio::test]
    async fn operator_approve_and_reject() {
        let (gw, effects) = gateway();
        let ToolResult::RequiresApproval { invocation_id, .. } =
            gw.invoke("write", serde_json::json!({"key": "a"})).await
        else {
            panic!("expected approval request");
        };
        let result = gw.approve(&invocation_id).await.unwrap();
        assert_eq!(result.to_value()["status"], "success");
        assert_eq!(effects.load(Ordering::SeqCst), 1);
        assert!(matches!(
            gw.approve(&invocation_id).await,
            Err(GatewayError::UnknownInvocation(_))
        ));

        let ToolResult::RequiresApproval { invocation_id, .. } =
            gw.invoke("write", serde_json::json!({"key": "b"})).await
        else {
            panic!("expected approval request");
        };
        let rejected = gw.reject(&invocation_id).unwrap();
        assert_eq!(rejected.state, InvocationState::Rejected);
        assert_eq!(effects.load(Ordering::SeqCst), 1);
        assert!(gw.reject(&invocation_id).is_err());
    }

    #[tokio::test]
    async fn every_executed_mutation_passed_through_approved() {
        let (gw, _) = gateway();
        gw.invoke("write", serde_json::json!({"key": "a", "confirm": true}))
            .await;
        let ToolResult::RequiresApproval { invocation_id, .. } =
            gw.invoke("write", serde_json::json!({"key": "b"})).await
        else {
            panic!("expected approval request");
        };
        gw.approve(&invocation_id).await.unwrap();

        for inv in gw.journal() {
            if inv.state == InvocationState::Executed {
                assert!(inv.was_approved());
            }
        }
    }

    #[tokio::test]
    async fn preview_hides_fields() {
        let (gw, _) = gateway();
        let value = gw
            .invoke("write", serde_json::json!({"key": "a", "secret": "hunter2"}))
            .await
            .to_value();
        assert!(value["args"].get("secret").is_none());
        assert_eq!(value["args"]["key"], "a");
    }

    #[tokio::test]
    async fn journal_keeps_only_the_newest_entries() {
        let (gw, _) = gateway();
        let gw = gw.with_limits(3, PENDING_TTL);
        for key in ["a", "b", "c", "d", "e"] {
            gw.invoke("write", serde_json::json!({"key": key, "confirm": true}))
                .await;
        }
        let keys: Vec<String> = gw
            .journal()
            .iter()
            .map(|inv| inv.args["key"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(keys, vec!["c", "d", "e"]);
    }

    #[tokio::test]
    async fn stale_pending_invocations_expire() {
        let (gw, effects) = gateway();
        let gw = gw.with_limits(10, Duration::from_millis(20));
        gw.invoke("write", serde_json::json!({"key": "old"})).await;
        let id = gw.pending()[0].id.clone();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(gw.pending().is_empty());
        assert!(matches!(
            gw.approve(&id).await,
            Err(GatewayError::UnknownInvocation(_))
        ));
        assert_eq!(effects.load(Ordering::SeqCst), 0);
        let journal = gw.journal();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].state, InvocationState::Rejected);
    }

    #[tokio::test]
    async fn non_mutating_runs_immediately() {
        let (gw, _) = gateway();
        let value = gw
            .invoke("lookup", serde_json::json!({"key": "x"}))
            .await
            .to_value();
        assert_eq!(value, serde_json::json!({"status": "success", "value": 42}));
    }

    #[tokio::test]
    async fn failures_become_error_results() {
        let (gw, _) = gateway();
        let value = gw
            .invoke("lookup", serde_json::json!({"key": "missing"}))
            .await
            .to_value();
        assert_eq!(value["error"], "LOOKUP_TOKEN is not configured");
        assert_eq!(gw.journal()[0].state, InvocationState::Failed);

        let value = gw.invoke("nope", serde_json::json!({})).await.to_value();
        assert!(value["error"].as_str().unwrap().contains("unknown tool"));

        let value = gw
            .invoke("lookup", serde_json::json!({"key": 7}))
            .await
            .to_value();
        assert!(value["error"]
            .as_str()
            .unwrap()
            .contains("Invalid parameters"));
    }

    #[test]
    fn illegal_transitions_are_refused() {
        let mut inv =
            ToolInvocation::new("write", serde_json::json!({}), InvocationState::PendingApproval);
        assert!(inv.transition(InvocationState::Executed).is_err());
        inv.transition(InvocationState::Rejected).unwrap();
        assert!(inv.state.is_terminal());
        assert!(inv.transition(InvocationState::Approved).is_err());
    }
}
