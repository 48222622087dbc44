//! `RunContext`: the capability set passed to a user step handler.
//!
//! Represented as a struct with already-bound methods rather than closures
//! capturing call-site variables, per the redesign note on `ctx.flow.emit` —
//! `runId`, `flowName`, `stepName` are propagated by value at construction.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use flowkit_core::config::{StateCleanupStrategy, StateScope};
use flowkit_storage::{Store, StoreError};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::event_manager::EventManager;

/// Mirrors the Flow Engine Facade surface `ctx.flow` can reach, implemented
/// by [`crate::facade::FlowEngineFacade`]. Kept as a trait so `RunContext`
/// doesn't need a direct dependency on the facade module (which itself
/// depends on the Runner, which builds `RunContext`s).
#[async_trait]
pub trait FlowHandle: Send + Sync {
    async fn start_flow(&self, flow_name: &str, input: Value) -> anyhow::Result<(Uuid, String)>;
    async fn cancel_flow(&self, flow_name: &str, run_id: Uuid) -> anyhow::Result<()>;
    async fn is_running(&self, flow_name: &str, run_id: Option<Uuid>) -> anyhow::Result<bool>;
    async fn get_running_flows(&self, flow_name: &str) -> anyhow::Result<Vec<Uuid>>;
}

pub struct Logger {
    events: Arc<EventManager>,
    run_id: Uuid,
    flow_name: String,
    step_name: Option<String>,
}

impl Logger {
    pub fn new(events: Arc<EventManager>, run_id: Uuid, flow_name: String, step_name: Option<String>) -> Self {
        Self { events, run_id, flow_name, step_name }
    }

    pub async fn log(&self, level: &str, message: &str, meta: Value) {
        self.events.log(self.run_id, &self.flow_name, self.step_name.as_deref(), level, message, meta).await;
    }
}

/// Scoped key-value state. Scoping policy from config: `always` prefixes
/// every key with `flow:{flowId}:`, `flow` only when a `flowId` is present,
/// `never` leaves keys raw.
pub struct StateHandle {
    store: Arc<dyn Store>,
    scope: StateScope,
    flow_id: Option<Uuid>,
}

impl StateHandle {
    pub fn new(store: Arc<dyn Store>, scope: StateScope, flow_id: Option<Uuid>) -> Self {
        Self { store, scope, flow_id }
    }

    fn scoped_key(&self, key: &str) -> String {
        match (self.scope, self.flow_id) {
            (StateScope::Always, Some(flow_id)) => format!("flow:{flow_id}:{key}"),
            (StateScope::Always, None) => format!("flow:_:{key}"),
            (StateScope::Flow, Some(flow_id)) => format!("flow:{flow_id}:{key}"),
            (StateScope::Flow, None) => key.to_string(),
            (StateScope::Never, _) => key.to_string(),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.store.kv_get(&self.scoped_key(key)).await
    }

    pub async fn set(&self, key: &str, value: Value, ttl_sec: Option<u64>) -> Result<(), StoreError> {
        self.store.kv_set(&self.scoped_key(key), value, ttl_sec).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.store.kv_delete(&self.scoped_key(key)).await
    }

    /// Invoked by the projection wiring on `flow.completed|failed` when the
    /// cleanup strategy is `on-complete` or `immediate`: clears every key
    /// scoped under this run's `flow:{flow_id}:*` namespace.
    pub async fn clear_on_complete(store: &dyn Store, strategy: StateCleanupStrategy, flow_id: Uuid) {
        if !matches!(strategy, StateCleanupStrategy::OnComplete | StateCleanupStrategy::Immediate) {
            return;
        }
        let pattern = format!("flow:{flow_id}:*");
        if let Err(err) = store.kv_clear(&pattern).await {
            warn!(error = %err, %flow_id, "failed to clear run-scoped state on completion");
        }
    }
}

pub type EmitFuture = Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send>>;

pub struct FlowCapability {
    events: Arc<EventManager>,
    facade: Arc<dyn FlowHandle>,
    run_id: Uuid,
    flow_name: String,
    step_name: String,
    step_id: String,
}

impl FlowCapability {
    pub fn new(events: Arc<EventManager>, facade: Arc<dyn FlowHandle>, run_id: Uuid, flow_name: String, step_name: String, step_id: String) -> Self {
        Self { events, facade, run_id, flow_name, step_name, step_id }
    }

    /// Publishes an `emit` event with the current run/flow/step auto-injected;
    /// the projection wiring turns this into dependent-step enqueueing.
    pub async fn emit(&self, event_name: &str, payload: Value) -> Result<(), StoreError> {
        let new_event = flowkit_core::event::NewEvent::new(flowkit_core::event::event_types::EMIT, self.run_id, &self.flow_name)
            .with_step(self.step_name.clone(), self.step_id.clone(), 0)
            .with_data(serde_json::json!({"name": event_name, "payload": payload}));
        self.events.publish(new_event).await.map(|_| ())
    }

    pub async fn start_flow(&self, flow_name: &str, input: Value) -> anyhow::Result<(Uuid, String)> {
        self.facade.start_flow(flow_name, input).await
    }

    pub async fn cancel_flow(&self, flow_name: &str, run_id: Uuid) -> anyhow::Result<()> {
        self.facade.cancel_flow(flow_name, run_id).await
    }

    pub async fn is_running(&self, flow_name: &str, run_id: Option<Uuid>) -> anyhow::Result<bool> {
        self.facade.is_running(flow_name, run_id).await
    }

    pub async fn get_running_flows(&self, flow_name: &str) -> anyhow::Result<Vec<Uuid>> {
        self.facade.get_running_flows(flow_name).await
    }
}

/// Passed by value to every step handler. `trigger` carries the resolved
/// await-before payload when the step was suspended; `await_config` carries
/// the spec the step itself declared, if any.
pub struct RunContext {
    pub logger: Logger,
    pub state: StateHandle,
    pub flow: FlowCapability,
    pub job_id: String,
    pub queue_name: String,
    pub flow_id: Uuid,
    pub flow_name: String,
    pub step_name: String,
    pub step_id: String,
    pub attempt: u32,
    pub trigger: Option<Value>,
    pub await_config: Option<Value>,
}
