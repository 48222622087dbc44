//! Flow Engine Facade: the user-visible operation set (§4.8), built on top
//! of the Event Manager, Queue, and Store. Also implements [`FlowHandle`] so
//! the Runner and Trigger Subsystem can start/cancel flows through the same
//! surface a caller would use directly.

use std::sync::Arc;

use async_trait::async_trait;
use flowkit_core::event::{event_types, NewEvent};
use flowkit_storage::{EnqueueRequest, IndexReadQuery, JobOptions, Queue, Store, StoreError, StreamReadOptions};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::context::FlowHandle;
use crate::event_manager::EventManager;
use crate::naming;
use crate::registry::FlowRegistry;

#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("unknown flow '{0}'")]
    UnknownFlow(String),
    #[error("run '{0}' has no recorded start event")]
    MissingStartEvent(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] flowkit_storage::QueueError),
}

/// Returned by [`FlowEngineFacade::start_flow_detailed`]; the `FlowHandle`
/// trait method only needs `(runId, entryStepName)`, but callers reaching
/// the facade directly want the queue name too.
#[derive(Debug, Clone)]
pub struct StartedFlow {
    pub run_id: Uuid,
    pub queue_name: String,
    pub entry_step_name: String,
}

#[derive(Debug, Clone)]
pub struct RestartedFlow {
    pub old_run_id: Uuid,
    pub new_run_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub flow_name: String,
    pub status: String,
    pub metadata: Value,
}

pub struct FlowEngineFacade {
    registry: Arc<FlowRegistry>,
    queue: Arc<dyn Queue>,
    store: Arc<dyn Store>,
    events: Arc<EventManager>,
    prefix: String,
}

impl FlowEngineFacade {
    pub fn new(registry: Arc<FlowRegistry>, queue: Arc<dyn Queue>, store: Arc<dyn Store>, events: Arc<EventManager>, prefix: impl Into<String>) -> Self {
        Self { registry, queue, store, events, prefix: prefix.into() }
    }

    fn run_index(&self, flow_name: &str) -> String {
        naming::flow_runs_index(&self.prefix, flow_name)
    }

    #[instrument(skip(self, input))]
    pub async fn start_flow_detailed(&self, flow_name: &str, input: Value) -> Result<StartedFlow, FacadeError> {
        let entry = self.registry.entry_step(flow_name).ok_or_else(|| FacadeError::UnknownFlow(flow_name.to_string()))?;
        let run_id = Uuid::new_v4();
        let job_id = format!("{run_id}__{}", entry.step_name);

        let opts = JobOptions {
            attempts: entry.job_defaults.attempts,
            backoff: entry.job_defaults.backoff.clone(),
            priority: entry.job_defaults.priority,
            timeout_ms: entry.job_defaults.timeout_ms,
            job_id: Some(job_id),
            ..JobOptions::default()
        };
        let req = EnqueueRequest::new(entry.step_name.clone(), json!({"flowId": run_id, "flowName": flow_name, "input": input})).with_opts(opts);
        self.queue.enqueue(&entry.queue_name, req).await?;

        let started = NewEvent::new(event_types::FLOW_START, run_id, flow_name).with_data(json!({"input": input}));
        self.events.publish(started).await?;

        Ok(StartedFlow { run_id, queue_name: entry.queue_name.clone(), entry_step_name: entry.step_name.clone() })
    }

    #[instrument(skip(self))]
    pub async fn cancel_flow_named(&self, flow_name: &str, run_id: Uuid) -> Result<(), FacadeError> {
        let previous_status = self
            .store
            .index_get(&self.run_index(flow_name), &run_id.to_string())
            .await?
            .and_then(|record| record.metadata.get("status").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());

        if matches!(previous_status.as_str(), "completed" | "failed" | "canceled" | "stalled") {
            return Ok(());
        }

        let cancel = NewEvent::new(event_types::FLOW_CANCEL, run_id, flow_name).with_data(json!({"previousStatus": previous_status}));
        self.events.publish(cancel).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn restart_flow(&self, flow_name: &str, run_id: Uuid) -> Result<RestartedFlow, FacadeError> {
        let subject = naming::run_stream(&self.prefix, run_id);
        let events = self.store.stream_read(&subject, StreamReadOptions { types: Some(vec![event_types::FLOW_START.to_string()]), limit: Some(1), ..Default::default() }).await?;
        let start_event = events.first().ok_or(FacadeError::MissingStartEvent(run_id))?;
        let input = start_event.data.as_ref().and_then(|d| d.get("input")).cloned().unwrap_or(Value::Null);

        self.cancel_flow_named(flow_name, run_id).await?;
        let started = self.start_flow_detailed(flow_name, input).await?;
        Ok(RestartedFlow { old_run_id: run_id, new_run_id: started.run_id })
    }

    async fn running_or_awaiting(&self, flow_name: &str, exclude_run_ids: &[Uuid]) -> Result<Vec<RunSummary>, FacadeError> {
        let filter = [("status".to_string(), json!(["running", "awaiting"]))].into_iter().collect();
        let records = self.store.index_read(&self.run_index(flow_name), IndexReadQuery { offset: 0, limit: usize::MAX, filter }).await?;
        let summaries = records
            .into_iter()
            .filter_map(|record| {
                let run_id: Uuid = record.id.parse().ok()?;
                if exclude_run_ids.contains(&run_id) {
                    return None;
                }
                let status = record.metadata.get("status").and_then(Value::as_str).unwrap_or("running").to_string();
                Some(RunSummary { run_id, flow_name: flow_name.to_string(), status, metadata: record.metadata })
            })
            .collect();
        Ok(summaries)
    }

    pub async fn is_running_named(&self, flow_name: &str, run_id: Option<Uuid>, exclude_run_ids: &[Uuid]) -> Result<bool, FacadeError> {
        let summaries = self.running_or_awaiting(flow_name, exclude_run_ids).await?;
        match run_id {
            Some(run_id) => Ok(summaries.iter().any(|s| s.run_id == run_id)),
            None => Ok(!summaries.is_empty()),
        }
    }

    pub async fn get_running_flows_named(&self, flow_name: &str) -> Result<Vec<RunSummary>, FacadeError> {
        self.running_or_awaiting(flow_name, &[]).await
    }

    #[instrument(skip(self, payload))]
    pub async fn emit(&self, run_id: Uuid, flow_name: &str, event_name: &str, payload: Value) -> Result<(), FacadeError> {
        let new_event = NewEvent::new(event_types::EMIT, run_id, flow_name).with_data(json!({"name": event_name, "payload": payload}));
        self.events.publish(new_event).await?;
        Ok(())
    }

    pub async fn list_flows(&self) -> Result<Vec<Value>, FacadeError> {
        let records = self.store.index_read(&naming::flows_index(&self.prefix), IndexReadQuery::default()).await?;
        Ok(records.into_iter().map(|r| json!({"flowName": r.id, "stats": r.metadata})).collect())
    }

    pub async fn list_triggers(&self) -> Result<Vec<Value>, FacadeError> {
        let records = self.store.index_read(&naming::triggers_index(&self.prefix), IndexReadQuery::default()).await?;
        Ok(records.into_iter().map(|r| r.metadata).collect())
    }

    pub async fn get_run(&self, flow_name: &str, run_id: Uuid) -> Result<Option<Value>, FacadeError> {
        Ok(self.store.index_get(&self.run_index(flow_name), &run_id.to_string()).await?.map(|r| r.metadata))
    }
}

#[async_trait]
impl FlowHandle for FlowEngineFacade {
    async fn start_flow(&self, flow_name: &str, input: Value) -> anyhow::Result<(Uuid, String)> {
        let started = self.start_flow_detailed(flow_name, input).await?;
        Ok((started.run_id, started.entry_step_name))
    }

    async fn cancel_flow(&self, flow_name: &str, run_id: Uuid) -> anyhow::Result<()> {
        self.cancel_flow_named(flow_name, run_id).await?;
        Ok(())
    }

    async fn is_running(&self, flow_name: &str, run_id: Option<Uuid>) -> anyhow::Result<bool> {
        Ok(self.is_running_named(flow_name, run_id, &[]).await?)
    }

    async fn get_running_flows(&self, flow_name: &str) -> anyhow::Result<Vec<Uuid>> {
        Ok(self.get_running_flows_named(flow_name).await?.into_iter().map(|s| s.run_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookRegistry;
    use crate::projection::ProjectionWiring;
    use flowkit_core::config::StateCleanupStrategy;
    use flowkit_core::flow::{FlowDef, StepDef};
    use flowkit_storage::{InMemoryQueue, InMemoryStore, InMemoryTopicBus};

    async fn build() -> (FlowEngineFacade, Arc<dyn Queue>) {
        let mut registry = FlowRegistry::new();
        let entry = StepDef::new("orders", "validate").emitting("order.validated");
        let ship = StepDef::new("orders", "ship").subscribing_to("order.validated");
        registry.register(FlowDef::new("orders", entry).with_step(ship)).unwrap();
        let registry = Arc::new(registry);

        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
        let bus: Arc<dyn flowkit_storage::TopicBus> = Arc::new(InMemoryTopicBus::new());
        let hooks = Arc::new(HookRegistry::new());
        let projection = Arc::new(ProjectionWiring::new(store.clone(), queue.clone(), registry.clone(), hooks, StateCleanupStrategy::OnComplete, "flowkit"));
        let events = Arc::new(EventManager::new(store.clone(), bus, "flowkit", projection));

        (FlowEngineFacade::new(registry, queue.clone(), store, events, "flowkit"), queue)
    }

    #[tokio::test]
    async fn start_flow_enqueues_the_entry_step_with_an_idempotent_job_id() {
        let (facade, queue) = build().await;
        let started = facade.start_flow_detailed("orders", json!({"orderId": 7})).await.unwrap();
        assert_eq!(started.entry_step_name, "validate");
        let job = queue.get_job(&started.queue_name, &format!("{}__validate", started.run_id)).await.unwrap();
        assert!(job.is_some());
    }

    #[tokio::test]
    async fn cancel_flow_is_idempotent_on_an_already_terminal_run() {
        let (facade, _queue) = build().await;
        let started = facade.start_flow_detailed("orders", json!({})).await.unwrap();
        facade.cancel_flow_named("orders", started.run_id).await.unwrap();
        let run = facade.get_run("orders", started.run_id).await.unwrap().unwrap();
        assert_eq!(run.get("status").and_then(Value::as_str), Some("canceled"));
        facade.cancel_flow_named("orders", started.run_id).await.unwrap();
        let run_again = facade.get_run("orders", started.run_id).await.unwrap().unwrap();
        assert_eq!(run_again.get("status").and_then(Value::as_str), Some("canceled"));
    }

    #[tokio::test]
    async fn is_running_reflects_the_run_index() {
        let (facade, _queue) = build().await;
        let started = facade.start_flow_detailed("orders", json!({})).await.unwrap();
        assert!(facade.is_running_named("orders", Some(started.run_id), &[]).await.unwrap());
        assert!(!facade.is_running_named("orders", Some(Uuid::new_v4()), &[]).await.unwrap());
    }

    #[tokio::test]
    async fn restart_flow_recovers_the_original_input() {
        let (facade, _queue) = build().await;
        let started = facade.start_flow_detailed("orders", json!({"orderId": 42})).await.unwrap();
        let restarted = facade.restart_flow("orders", started.run_id).await.unwrap();
        assert_eq!(restarted.old_run_id, started.run_id);
        assert_ne!(restarted.new_run_id, started.run_id);
    }
}
