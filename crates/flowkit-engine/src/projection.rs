//! Projection Wiring: turns the append-only event stream into run/flow index
//! state and downstream job enqueueing (§4.7's event-effect table).
//!
//! Runs synchronously inside `EventManager::publish`, after the durable
//! append and before the topic-bus fan-out; failures here are logged by the
//! caller, never allowed to fail the publish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use flowkit_core::config::StateCleanupStrategy;
use flowkit_core::event::{event_types, Event, NewEvent};
use flowkit_storage::{EnqueueRequest, IndexReadQuery, JobOptions, Queue, QueueError, Store, StoreError};
use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::StateHandle;
use crate::hooks::{HookContext, HookKind, HookRegistry};
use crate::naming;
use crate::registry::FlowRegistry;

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as i64
}

/// Same "every filter field must equal, or be `in`, the actual value" rule
/// `index.read`'s filter map uses; an absent or non-object filter matches
/// everything.
fn filter_matches(filter: Option<&Value>, payload: &Value) -> bool {
    let Some(filter_obj) = filter.and_then(Value::as_object) else { return true };
    filter_obj.iter().all(|(field, expected)| {
        let actual = payload.get(field);
        match expected {
            Value::Array(options) => actual.map(|a| options.contains(a)).unwrap_or(false),
            other => actual.map(|a| a == other).unwrap_or(false),
        }
    })
}

struct DeferredEnqueue {
    queue_name: String,
    request: EnqueueRequest,
}

pub struct ProjectionWiring {
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    registry: Arc<FlowRegistry>,
    hooks: Arc<HookRegistry>,
    cleanup_strategy: StateCleanupStrategy,
    prefix: String,
    deferred: Mutex<HashMap<(Uuid, String), Vec<DeferredEnqueue>>>,
}

impl ProjectionWiring {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn Queue>,
        registry: Arc<FlowRegistry>,
        hooks: Arc<HookRegistry>,
        cleanup_strategy: StateCleanupStrategy,
        prefix: impl Into<String>,
    ) -> Self {
        Self { store, queue, registry, hooks, cleanup_strategy, prefix: prefix.into(), deferred: Mutex::new(HashMap::new()) }
    }

    /// Returns any follow-on events the caller (`EventManager::publish`)
    /// should publish in turn — e.g. a `flow.completed` discovered once a
    /// run's last terminal step lands, or `await.resolved` for event-flavor
    /// awaits matched by this `emit`. Most event types produce none.
    pub async fn handle(&self, event: &Event) -> Result<Vec<NewEvent>, ProjectionError> {
        match event.event_type.as_str() {
            event_types::FLOW_START => self.on_flow_start(event).await.map(|_| vec![]),
            event_types::STEP_STARTED => self.on_step_started(event).await.map(|_| vec![]),
            event_types::STEP_COMPLETED => self.on_step_completed(event).await,
            event_types::STEP_FAILED => self.on_step_failed(event).await.map(|_| vec![]),
            event_types::AWAIT_REGISTERED => self.on_await_registered(event).await.map(|_| vec![]),
            event_types::AWAIT_RESOLVED => self.on_await_resolved(event).await.map(|_| vec![]),
            event_types::FLOW_COMPLETED => self.on_flow_completed(event).await.map(|_| vec![]),
            event_types::FLOW_FAILED => self.on_flow_failed(event).await.map(|_| vec![]),
            event_types::FLOW_CANCEL => self.on_flow_cancel(event).await.map(|_| vec![]),
            event_types::EMIT => self.on_emit(event).await,
            _ => Ok(vec![]),
        }
    }

    fn run_index(&self, flow_name: &str) -> String {
        naming::flow_runs_index(&self.prefix, flow_name)
    }

    fn flows_index(&self) -> String {
        naming::flows_index(&self.prefix)
    }

    async fn on_flow_start(&self, event: &Event) -> Result<(), ProjectionError> {
        let run_id = event.run_id.to_string();
        self.store
            .index_add(
                &self.run_index(&event.flow_name),
                &run_id,
                event.ts as f64,
                json!({"status": "running", "startedAt": event.ts, "lastActivityAt": event.ts, "completedSteps": 0, "awaitingSteps": {}}),
            )
            .await?;
        self.store.index_increment(&self.flows_index(), &event.flow_name, "stats.total", 1.0).await?;
        self.store.index_increment(&self.flows_index(), &event.flow_name, "stats.running", 1.0).await?;
        self.store
            .index_update_with_retry(&self.flows_index(), &event.flow_name, json!({"lastRunAt": event.ts}), 5)
            .await?;
        Ok(())
    }

    async fn on_step_started(&self, event: &Event) -> Result<(), ProjectionError> {
        self.store
            .index_update_with_retry(&self.run_index(&event.flow_name), &event.run_id.to_string(), json!({"lastActivityAt": event.ts}), 5)
            .await?;
        Ok(())
    }

    async fn on_step_completed(&self, event: &Event) -> Result<Vec<NewEvent>, ProjectionError> {
        self.store.index_increment(&self.run_index(&event.flow_name), &event.run_id.to_string(), "completedSteps", 1.0).await?;
        self.store
            .index_update_with_retry(&self.run_index(&event.flow_name), &event.run_id.to_string(), json!({"lastActivityAt": event.ts}), 5)
            .await?;

        self.maybe_complete_flow(event).await
    }

    /// A run is done once every step with no further downstream subscribers
    /// (`FlowDef::terminal_steps`) has completed and no await is pending.
    /// Tracked additively in `completedTerminalSteps` so concurrently
    /// completing terminal steps never clobber each other's bookkeeping; the
    /// last one to observe "all done" is the one that publishes
    /// `flow.completed` (mirrors `on_await_resolved`'s own
    /// read-after-write "anyone else still waiting?" check).
    async fn maybe_complete_flow(&self, event: &Event) -> Result<Vec<NewEvent>, ProjectionError> {
        let Some(step_name) = event.step_name.as_deref() else { return Ok(vec![]) };
        let Some(flow) = self.registry.get(&event.flow_name) else { return Ok(vec![]) };
        let terminal_steps = flow.terminal_steps();
        if !terminal_steps.contains(step_name) {
            return Ok(vec![]);
        }

        let run_id_str = event.run_id.to_string();
        self.store
            .index_update_with_retry(&self.run_index(&event.flow_name), &run_id_str, json!({"completedTerminalSteps": {step_name: true}}), 5)
            .await?;

        let Some(record) = self.store.index_get(&self.run_index(&event.flow_name), &run_id_str).await? else { return Ok(vec![]) };
        let status = record.metadata.get("status").and_then(Value::as_str).unwrap_or("running");
        if matches!(status, "completed" | "failed" | "canceled" | "stalled") {
            return Ok(vec![]);
        }
        let still_awaiting = record.metadata.get("awaitingSteps").and_then(Value::as_object).map(|o| !o.is_empty()).unwrap_or(false);
        if still_awaiting {
            return Ok(vec![]);
        }
        let completed_terminal = record.metadata.get("completedTerminalSteps").and_then(Value::as_object).cloned().unwrap_or_default();
        let all_terminal_done = terminal_steps.iter().all(|step| completed_terminal.contains_key(*step));
        if !all_terminal_done {
            return Ok(vec![]);
        }

        Ok(vec![NewEvent::new(event_types::FLOW_COMPLETED, event.run_id, &event.flow_name)])
    }

    /// `step.failed` is a per-attempt record only; it never changes run or
    /// flow state by itself. When a step exhausts its retries the Runner
    /// follows it with a top-level `flow.failed`, which is what actually
    /// transitions the run (mirrors how `flow.completed` is the terminal
    /// signal rather than the last `step.completed`).
    async fn on_step_failed(&self, event: &Event) -> Result<(), ProjectionError> {
        self.store
            .index_update_with_retry(&self.run_index(&event.flow_name), &event.run_id.to_string(), json!({"lastActivityAt": event.ts}), 5)
            .await?;
        Ok(())
    }

    async fn on_flow_failed(&self, event: &Event) -> Result<(), ProjectionError> {
        self.store
            .index_update_with_retry(
                &self.run_index(&event.flow_name),
                &event.run_id.to_string(),
                json!({"status": "failed", "completedAt": event.ts}),
                5,
            )
            .await?;
        self.store.index_increment(&self.flows_index(), &event.flow_name, "stats.failure", 1.0).await?;
        self.store.index_increment(&self.flows_index(), &event.flow_name, "stats.running", -1.0).await?;
        StateHandle::clear_on_complete(self.store.as_ref(), self.cleanup_strategy, event.run_id).await;
        Ok(())
    }

    async fn on_await_registered(&self, event: &Event) -> Result<(), ProjectionError> {
        let Some(step_name) = event.step_name.clone() else { return Ok(()) };
        let position = event.data.as_ref().and_then(|d| d.get("position")).and_then(Value::as_str).unwrap_or("before").to_string();
        let key = format!("{step_name}:await-{position}");
        self.store
            .index_update_with_retry(
                &self.run_index(&event.flow_name),
                &event.run_id.to_string(),
                json!({"status": "awaiting", "awaitingSteps": {key: event.data.clone().unwrap_or(Value::Null)}}),
                5,
            )
            .await?;
        self.store.index_increment(&self.flows_index(), &event.flow_name, "stats.awaiting", 1.0).await?;
        self.store.index_increment(&self.flows_index(), &event.flow_name, "stats.running", -1.0).await?;
        Ok(())
    }

    async fn on_await_resolved(&self, event: &Event) -> Result<(), ProjectionError> {
        let Some(step_name) = event.step_name.clone() else { return Ok(()) };
        let position = event.data.as_ref().and_then(|d| d.get("position")).and_then(Value::as_str).unwrap_or("before").to_string();
        let key = format!("{step_name}:await-{position}");

        let run_id_str = event.run_id.to_string();
        let no_other_awaits = match self.store.index_get(&self.run_index(&event.flow_name), &run_id_str).await? {
            Some(record) => {
                let mut awaiting = record.metadata.get("awaitingSteps").cloned().unwrap_or(json!({}));
                if let Some(obj) = awaiting.as_object_mut() {
                    obj.remove(&key);
                }
                let remaining = awaiting.as_object().map(|o| o.is_empty()).unwrap_or(true);
                self.store
                    .index_update_with_retry(
                        &self.run_index(&event.flow_name),
                        &run_id_str,
                        json!({"awaitingSteps": awaiting, "status": if remaining { "running" } else { "awaiting" }}),
                        5,
                    )
                    .await?;
                remaining
            }
            None => true,
        };

        self.store.index_increment(&self.flows_index(), &event.flow_name, "stats.awaiting", -1.0).await?;
        if no_other_awaits {
            self.store.index_increment(&self.flows_index(), &event.flow_name, "stats.running", 1.0).await?;
        }

        if position == "after" {
            self.flush_deferred(event.run_id, &step_name).await?;
        }
        Ok(())
    }

    async fn on_flow_completed(&self, event: &Event) -> Result<(), ProjectionError> {
        self.store
            .index_update_with_retry(
                &self.run_index(&event.flow_name),
                &event.run_id.to_string(),
                json!({"status": "completed", "completedAt": event.ts}),
                5,
            )
            .await?;
        self.store.index_increment(&self.flows_index(), &event.flow_name, "stats.success", 1.0).await?;
        self.store.index_increment(&self.flows_index(), &event.flow_name, "stats.running", -1.0).await?;
        StateHandle::clear_on_complete(self.store.as_ref(), self.cleanup_strategy, event.run_id).await;
        Ok(())
    }

    async fn on_flow_cancel(&self, event: &Event) -> Result<(), ProjectionError> {
        let previous_status = event.data.as_ref().and_then(|d| d.get("previousStatus")).and_then(Value::as_str).unwrap_or("running").to_string();
        self.store
            .index_update_with_retry(
                &self.run_index(&event.flow_name),
                &event.run_id.to_string(),
                json!({"status": "canceled", "completedAt": event.ts}),
                5,
            )
            .await?;
        let counter = match previous_status.as_str() {
            "awaiting" => "stats.awaiting",
            _ => "stats.running",
        };
        self.store.index_increment(&self.flows_index(), &event.flow_name, counter, -1.0).await?;
        self.store.index_increment(&self.flows_index(), &event.flow_name, "stats.cancel", 1.0).await?;
        Ok(())
    }

    async fn on_emit(&self, event: &Event) -> Result<Vec<NewEvent>, ProjectionError> {
        let Some(emitted_name) = event.emitted_name().map(str::to_string) else { return Ok(vec![]) };
        let payload = event.data.as_ref().and_then(|d| d.get("payload")).cloned().unwrap_or(Value::Null);

        let subscribers = self.registry.subscribers_of(&event.flow_name, &emitted_name);
        if !subscribers.is_empty() {
            let owner_awaits_after = event
                .step_name
                .as_deref()
                .and_then(|owner| self.registry.step(&event.flow_name, owner))
                .map(|step| step.await_after.is_some())
                .unwrap_or(false);

            for step in subscribers {
                let opts = JobOptions {
                    attempts: step.job_defaults.attempts,
                    backoff: step.job_defaults.backoff.clone(),
                    priority: step.job_defaults.priority,
                    timeout_ms: step.job_defaults.timeout_ms,
                    job_id: Some(format!("{}__{}", event.run_id, step.step_name)),
                    ..JobOptions::default()
                };
                let request = EnqueueRequest::new(
                    step.step_name.clone(),
                    json!({"flowId": event.run_id, "flowName": event.flow_name, "input": payload}),
                )
                .with_opts(opts);

                if owner_awaits_after {
                    if let Some(owner) = event.step_name.clone() {
                        self.deferred
                            .lock()
                            .entry((event.run_id, owner))
                            .or_default()
                            .push(DeferredEnqueue { queue_name: step.queue_name.clone(), request });
                        continue;
                    }
                }

                self.queue.enqueue(&step.queue_name, request).await?;
            }
        }

        self.resolve_matching_event_awaits(event, &emitted_name, &payload).await
    }

    /// Matches this `emit` against any `event`-flavor await pending on the
    /// same run (§4.4): an await registered with `{event: name, filter?}` is
    /// otherwise only resolvable by an explicit caller. `before`-position
    /// matches re-enqueue the suspended step directly (mirroring
    /// `AwaitSubsystem::resolve`'s own before-branch); either position
    /// returns an `await.resolved` follow-on event so `on_await_resolved`
    /// updates `awaitingSteps`/stats and releases any buffered after-emits.
    async fn resolve_matching_event_awaits(&self, event: &Event, emitted_name: &str, payload: &Value) -> Result<Vec<NewEvent>, ProjectionError> {
        let run_id_str = event.run_id.to_string();
        let Some(record) = self.store.index_get(&self.run_index(&event.flow_name), &run_id_str).await? else { return Ok(vec![]) };
        let Some(awaiting) = record.metadata.get("awaitingSteps").and_then(Value::as_object).cloned() else { return Ok(vec![]) };

        let mut follow_on = Vec::new();
        for (key, cfg) in awaiting {
            if cfg.get("awaitType").and_then(Value::as_str) != Some("event") {
                continue;
            }
            let await_config = cfg.get("awaitConfig");
            if await_config.and_then(|c| c.get("name")).and_then(Value::as_str) != Some(emitted_name) {
                continue;
            }
            if !filter_matches(await_config.and_then(|c| c.get("filter")), payload) {
                continue;
            }
            let Some((step_name, position)) = key.split_once(":await-") else { continue };

            if position == "before" {
                if let Some(step) = self.registry.step(&event.flow_name, step_name) {
                    let opts = JobOptions {
                        attempts: step.job_defaults.attempts,
                        backoff: step.job_defaults.backoff.clone(),
                        priority: step.job_defaults.priority,
                        timeout_ms: step.job_defaults.timeout_ms,
                        job_id: Some(format!("{}__{}", event.run_id, step_name)),
                        ..JobOptions::default()
                    };
                    let request = EnqueueRequest::new(
                        step_name,
                        json!({"flowId": event.run_id, "flowName": event.flow_name, "awaitResolved": true, "awaitData": payload}),
                    )
                    .with_opts(opts);
                    self.queue.enqueue(&step.queue_name, request).await?;
                }
            }

            self.hooks
                .invoke(
                    &event.flow_name,
                    step_name,
                    HookKind::OnAwaitResolve,
                    HookContext { run_id: event.run_id, flow_name: event.flow_name.clone(), step_name: step_name.to_string(), position: position.to_string(), payload: payload.clone() },
                )
                .await;

            follow_on.push(
                NewEvent::new(event_types::AWAIT_RESOLVED, event.run_id, &event.flow_name)
                    .with_step(step_name, format!("{}__{step_name}", event.run_id), 0)
                    .with_data(json!({"position": position, "triggerData": payload})),
            );
        }
        Ok(follow_on)
    }

    async fn flush_deferred(&self, run_id: Uuid, owner_step: &str) -> Result<(), ProjectionError> {
        let pending = self.deferred.lock().remove(&(run_id, owner_step.to_string())).unwrap_or_default();
        for item in pending {
            self.queue.enqueue(&item.queue_name, item.request).await?;
        }
        Ok(())
    }

    /// Scans active runs for every registered flow and emits `flow.stalled`
    /// for any whose `lastActivityAt` predates `threshold_ms` with no pending
    /// await. Intended to be spawned once as a background task.
    pub async fn run_stall_detector(self: Arc<Self>, events: Arc<crate::event_manager::EventManager>, interval_ms: u64, threshold_ms: i64) {
        let mut ticker = interval(Duration::from_millis(interval_ms));
        loop {
            ticker.tick().await;
            for flow_name in self.registry.flow_names() {
                let query = IndexReadQuery { offset: 0, limit: 0, filter: HashMap::from([("status".to_string(), json!(["running"]))]) };
                let records = match self.store.index_read(&self.run_index(flow_name), query).await {
                    Ok(records) => records,
                    Err(err) => {
                        error!(error = %err, flow_name, "stall detector failed to read run index");
                        continue;
                    }
                };
                let now = now_ms();
                for record in records {
                    let last_activity = record.metadata.get("lastActivityAt").and_then(Value::as_i64).unwrap_or(0);
                    if now - last_activity < threshold_ms {
                        continue;
                    }
                    let Ok(run_id) = record.id.parse::<Uuid>() else { continue };
                    info!(%run_id, flow_name, "run stalled, emitting flow.stalled");
                    let new_event = flowkit_core::event::NewEvent::new(event_types::FLOW_STALLED, run_id, flow_name)
                        .with_data(json!({"lastActivityAt": last_activity}));
                    if let Err(err) = events.publish(new_event).await {
                        warn!(error = %err, %run_id, "failed to publish flow.stalled");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkit_core::event::NewEvent;
    use flowkit_core::flow::{FlowDef, StepDef};
    use flowkit_storage::{InMemoryQueue, InMemoryStore};

    fn registry_with_emit_chain() -> FlowRegistry {
        let mut registry = FlowRegistry::new();
        let entry = StepDef::new("orders", "validate").emitting("order.validated");
        let next = StepDef::new("orders", "ship").subscribing_to("order.validated");
        registry.register(FlowDef::new("orders", entry).with_step(next)).unwrap();
        registry
    }

    fn wiring(store: Arc<dyn Store>, queue: Arc<dyn Queue>, registry: Arc<FlowRegistry>) -> ProjectionWiring {
        ProjectionWiring::new(store, queue, registry, Arc::new(HookRegistry::new()), StateCleanupStrategy::OnComplete, "flowkit")
    }

    #[tokio::test]
    async fn flow_start_creates_run_record_and_bumps_flow_stats() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
        let registry = Arc::new(registry_with_emit_chain());
        let wiring = wiring(store.clone(), queue, registry);

        let run_id = Uuid::new_v4();
        let new_event = NewEvent::new(event_types::FLOW_START, run_id, "orders").with_data(json!({"input": {}}));
        let event = Event::from_new(new_event, "00000000000000000001".into(), 1000);
        wiring.handle(&event).await.unwrap();

        let run_record = store.index_get(&naming::flow_runs_index("flowkit", "orders"), &run_id.to_string()).await.unwrap().unwrap();
        assert_eq!(run_record.metadata["status"], json!("running"));

        let flow_record = store.index_get(&naming::flows_index("flowkit"), "orders").await.unwrap().unwrap();
        assert_eq!(flow_record.metadata["stats"]["total"], json!(1.0));
        assert_eq!(flow_record.metadata["stats"]["running"], json!(1.0));
    }

    #[tokio::test]
    async fn emit_enqueues_subscribing_step_with_idempotent_job_id() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
        let registry = Arc::new(registry_with_emit_chain());
        let wiring = wiring(store, queue.clone(), registry);

        let run_id = Uuid::new_v4();
        let new_event = NewEvent::new(event_types::EMIT, run_id, "orders")
            .with_step("validate", "step-1", 1)
            .with_data(json!({"name": "order.validated", "payload": {"orderId": 42}}));
        let event = Event::from_new(new_event, "00000000000000000001".into(), 1000);
        wiring.handle(&event).await.unwrap();

        let job = queue.get_job("orders:ship", &format!("{run_id}__ship")).await.unwrap();
        assert!(job.is_some());
    }

    #[tokio::test]
    async fn emit_from_an_await_after_owner_is_buffered_until_resolved() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
        let mut registry = FlowRegistry::new();
        let entry = StepDef::new("orders", "validate")
            .emitting("order.validated")
            .with_await_after(flowkit_core::flow::AwaitSpec::Time { delay_ms: 1000 });
        let next = StepDef::new("orders", "ship").subscribing_to("order.validated");
        registry.register(FlowDef::new("orders", entry).with_step(next)).unwrap();
        let wiring = wiring(store, queue.clone(), Arc::new(registry));

        let run_id = Uuid::new_v4();
        let emit_event = NewEvent::new(event_types::EMIT, run_id, "orders")
            .with_step("validate", "step-1", 1)
            .with_data(json!({"name": "order.validated", "payload": {"orderId": 42}}));
        wiring.handle(&Event::from_new(emit_event, "00000000000000000001".into(), 1000)).await.unwrap();

        assert!(queue.get_job("orders:ship", &format!("{run_id}__ship")).await.unwrap().is_none());

        let resolved = NewEvent::new(event_types::AWAIT_RESOLVED, run_id, "orders")
            .with_step("validate", "step-1", 1)
            .with_data(json!({"position": "after", "triggerData": {}}));
        wiring.handle(&Event::from_new(resolved, "00000000000000000002".into(), 2000)).await.unwrap();

        assert!(queue.get_job("orders:ship", &format!("{run_id}__ship")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn last_terminal_step_completion_emits_flow_completed_follow_on() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
        let registry = Arc::new(registry_with_emit_chain());
        let wiring = wiring(store.clone(), queue, registry);

        let run_id = Uuid::new_v4();
        let start = NewEvent::new(event_types::FLOW_START, run_id, "orders").with_data(json!({"input": {}}));
        wiring.handle(&Event::from_new(start, "00000000000000000001".into(), 1000)).await.unwrap();

        let follow_on = wiring
            .handle(&Event::from_new(
                NewEvent::new(event_types::STEP_COMPLETED, run_id, "orders").with_step("ship", "step-2", 1).with_data(json!({})),
                "00000000000000000002".into(),
                2000,
            ))
            .await
            .unwrap();

        assert_eq!(follow_on.len(), 1);
        assert_eq!(follow_on[0].event_type, event_types::FLOW_COMPLETED);
    }

    #[tokio::test]
    async fn non_terminal_step_completion_produces_no_follow_on() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
        let registry = Arc::new(registry_with_emit_chain());
        let wiring = wiring(store.clone(), queue, registry);

        let run_id = Uuid::new_v4();
        let start = NewEvent::new(event_types::FLOW_START, run_id, "orders").with_data(json!({"input": {}}));
        wiring.handle(&Event::from_new(start, "00000000000000000001".into(), 1000)).await.unwrap();

        let follow_on = wiring
            .handle(&Event::from_new(
                NewEvent::new(event_types::STEP_COMPLETED, run_id, "orders").with_step("validate", "step-1", 1).with_data(json!({})),
                "00000000000000000002".into(),
                2000,
            ))
            .await
            .unwrap();

        assert!(follow_on.is_empty());
    }

    #[tokio::test]
    async fn emit_resolves_matching_event_await_and_enqueues_before_position_step() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
        let mut registry = FlowRegistry::new();
        let entry = StepDef::new("orders", "validate").emitting("order.validated");
        let next = StepDef::new("orders", "ship")
            .subscribing_to("order.validated")
            .with_await_before(flowkit_core::flow::AwaitSpec::Event {
                name: "payment.confirmed".into(),
                filter: None,
                timeout_ms: None,
            });
        registry.register(FlowDef::new("orders", entry).with_step(next)).unwrap();
        let wiring = wiring(store, queue.clone(), Arc::new(registry));

        let run_id = Uuid::new_v4();
        let emit_validated = NewEvent::new(event_types::EMIT, run_id, "orders")
            .with_step("validate", "step-1", 1)
            .with_data(json!({"name": "order.validated", "payload": {"orderId": 42}}));
        wiring.handle(&Event::from_new(emit_validated, "00000000000000000001".into(), 1000)).await.unwrap();

        let register_await = NewEvent::new(event_types::AWAIT_REGISTERED, run_id, "orders")
            .with_step("ship", "step-2", 1)
            .with_data(json!({"position": "before", "awaitType": "event", "awaitConfig": {"kind": "event", "name": "payment.confirmed"}}));
        wiring.handle(&Event::from_new(register_await, "00000000000000000002".into(), 2000)).await.unwrap();

        let emit_payment = NewEvent::new(event_types::EMIT, run_id, "orders")
            .with_step("validate", "step-1", 1)
            .with_data(json!({"name": "payment.confirmed", "payload": {"orderId": 42}}));
        let follow_on = wiring.handle(&Event::from_new(emit_payment, "00000000000000000003".into(), 3000)).await.unwrap();

        assert_eq!(follow_on.len(), 1);
        assert_eq!(follow_on[0].event_type, event_types::AWAIT_RESOLVED);
        assert!(queue.get_job("orders:ship", &format!("{run_id}__ship")).await.unwrap().is_some());
    }
}
