//! Await Subsystem: registers and resolves the four suspension flavors a
//! step can declare (`time`, `event`, `webhook`, `schedule`), per §4.4.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule as CronSchedule;
use flowkit_core::event::{event_types, NewEvent};
use flowkit_core::flow::AwaitSpec;
use flowkit_storage::{EnqueueRequest, JobOptions, Queue, QueueError, ScheduleWhen, Store, StoreError};
use rand::RngCore;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::event_manager::EventManager;
use crate::hooks::{HookContext, HookKind, HookRegistry};
use crate::naming;
use crate::registry::FlowRegistry;

#[derive(Debug, Error)]
pub enum AwaitError {
    #[error("no await entry for run {run_id} step {step_name} position {position}")]
    NotFound { run_id: Uuid, step_name: String, position: String },
    #[error("await token mismatch for run {run_id} step {step_name}")]
    TokenMismatch { run_id: Uuid, step_name: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

fn mint_token() -> String {
    use base64::Engine as _;
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub struct AwaitSubsystem {
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    events: Arc<EventManager>,
    hooks: Arc<HookRegistry>,
    registry: Arc<FlowRegistry>,
    prefix: String,
}

impl AwaitSubsystem {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn Queue>, events: Arc<EventManager>, hooks: Arc<HookRegistry>, registry: Arc<FlowRegistry>, prefix: impl Into<String>) -> Self {
        Self { store, queue, events, hooks, registry, prefix: prefix.into() }
    }

    #[instrument(skip(self, spec), fields(%run_id, flow_name, step_name, position))]
    pub async fn register(&self, run_id: Uuid, step_name: &str, flow_name: &str, spec: AwaitSpec, position: &str) -> Result<(), AwaitError> {
        let resolve_at = match &spec {
            AwaitSpec::Time { delay_ms } => Some(now_ms() + *delay_ms as i64),
            AwaitSpec::Schedule { cron, .. } => self.next_cron_occurrence(cron),
            _ => None,
        };

        let mut data = json!({
            "position": position,
            "awaitType": spec.kind_name(),
            "awaitConfig": spec.clone(),
        });
        if let Some(resolve_at) = resolve_at {
            data["resolveAt"] = json!(resolve_at);
        }

        if let AwaitSpec::Webhook { .. } = &spec {
            let token = mint_token();
            self.store.kv_set(&naming::await_token_key(run_id, step_name, position), json!(token), None).await?;
        }

        let new_event = NewEvent::new(event_types::AWAIT_REGISTERED, run_id, flow_name).with_step(step_name, format!("{run_id}__{step_name}"), 0).with_data(data);
        self.events.publish(new_event).await?;

        self.hooks
            .invoke(flow_name, step_name, HookKind::OnAwaitRegister, HookContext { run_id, flow_name: flow_name.into(), step_name: step_name.into(), position: position.into(), payload: Value::Null })
            .await;

        match spec {
            AwaitSpec::Time { delay_ms } => {
                self.schedule_resume(run_id, flow_name, step_name, position, ScheduleWhen::DelayMs(delay_ms), "time_resume").await?;
            }
            AwaitSpec::Schedule { ref cron, .. } => {
                if let Some(resolve_at) = resolve_at {
                    let delay_ms = (resolve_at - now_ms()).max(0) as u64;
                    self.schedule_resume(run_id, flow_name, step_name, position, ScheduleWhen::DelayMs(delay_ms), "schedule_resume").await?;
                } else {
                    warn!(cron, "cron expression yielded no upcoming occurrence");
                }
            }
            _ => {}
        }

        if let Some(timeout_ms) = spec.timeout_ms() {
            self.schedule_resume(run_id, flow_name, step_name, position, ScheduleWhen::DelayMs(timeout_ms), "timeout").await?;
        }

        Ok(())
    }

    async fn schedule_resume(&self, run_id: Uuid, flow_name: &str, step_name: &str, position: &str, when: ScheduleWhen, kind: &str) -> Result<(), AwaitError> {
        let request = EnqueueRequest::new(
            "await.resume",
            json!({"runId": run_id, "flowName": flow_name, "stepName": step_name, "position": position, "kind": kind}),
        )
        .with_opts(JobOptions { job_id: Some(format!("{run_id}__{step_name}__{position}__{kind}")), ..JobOptions::default() });
        self.queue.schedule(&naming::await_resume_queue(&self.prefix), request, when).await?;
        Ok(())
    }

    fn next_cron_occurrence(&self, expr: &str) -> Option<i64> {
        let schedule = CronSchedule::from_str(expr).ok()?;
        schedule.upcoming(Utc).next().map(|dt| dt.timestamp_millis())
    }

    /// Invoked by the Runner when it claims a job from the await-resume
    /// queue. Dispatches on the job's `kind` field.
    pub async fn handle_resume_job(&self, data: Value) -> Result<(), AwaitError> {
        let run_id: Uuid = data.get("runId").and_then(Value::as_str).and_then(|s| s.parse().ok()).unwrap_or_default();
        let flow_name = data.get("flowName").and_then(Value::as_str).unwrap_or_default().to_string();
        let step_name = data.get("stepName").and_then(Value::as_str).unwrap_or_default().to_string();
        let position = data.get("position").and_then(Value::as_str).unwrap_or("before").to_string();
        let kind = data.get("kind").and_then(Value::as_str).unwrap_or("").to_string();

        match kind.as_str() {
            "time_resume" => {
                self.resolve(run_id, &step_name, &flow_name, &position, json!({"delayMs": Value::Null})).await?;
            }
            "schedule_resume" => {
                self.resolve(run_id, &step_name, &flow_name, &position, json!({})).await?;
                if let Some(step) = self.registry.step(&flow_name, &step_name) {
                    let spec = if position == "after" { step.await_after.clone() } else { step.await_before.clone() };
                    if let Some(AwaitSpec::Schedule { cron, once: false }) = spec {
                        self.register(run_id, &step_name, &flow_name, AwaitSpec::Schedule { cron, once: false }, &position).await?;
                    }
                }
            }
            "timeout" => {
                self.timeout(run_id, &step_name, &flow_name, &position).await?;
            }
            other => warn!(kind = other, "unrecognized await resume job kind"),
        }
        Ok(())
    }

    #[instrument(skip(self, trigger_data), fields(%run_id, step_name, position))]
    pub async fn resolve(&self, run_id: Uuid, step_name: &str, flow_name: &str, position: &str, trigger_data: Value) -> Result<(), AwaitError> {
        let new_event = NewEvent::new(event_types::AWAIT_RESOLVED, run_id, flow_name)
            .with_step(step_name, format!("{run_id}__{step_name}"), 0)
            .with_data(json!({"position": position, "triggerData": trigger_data.clone()}));
        self.events.publish(new_event).await?;

        self.hooks
            .invoke(flow_name, step_name, HookKind::OnAwaitResolve, HookContext { run_id, flow_name: flow_name.into(), step_name: step_name.into(), position: position.into(), payload: trigger_data.clone() })
            .await;

        if position == "before" {
            if let Some(step) = self.registry.step(flow_name, step_name) {
                let opts = JobOptions {
                    attempts: step.job_defaults.attempts,
                    backoff: step.job_defaults.backoff.clone(),
                    priority: step.job_defaults.priority,
                    timeout_ms: step.job_defaults.timeout_ms,
                    job_id: Some(format!("{run_id}__{step_name}")),
                    ..JobOptions::default()
                };
                let request = EnqueueRequest::new(
                    step_name,
                    json!({"flowId": run_id, "flowName": flow_name, "awaitResolved": true, "awaitData": trigger_data}),
                )
                .with_opts(opts);
                self.queue.enqueue(&step.queue_name, request).await?;
            }
        }
        Ok(())
    }

    pub async fn resolve_webhook(&self, run_id: Uuid, step_name: &str, flow_name: &str, position: &str, token: &str, payload: Value) -> Result<(), AwaitError> {
        let expected = self.store.kv_get(&naming::await_token_key(run_id, step_name, position)).await?;
        match expected {
            Some(Value::String(expected_token)) if expected_token == token => {
                self.store.kv_delete(&naming::await_token_key(run_id, step_name, position)).await?;
                self.resolve(run_id, step_name, flow_name, position, payload).await
            }
            Some(_) => Err(AwaitError::TokenMismatch { run_id, step_name: step_name.to_string() }),
            None => Err(AwaitError::NotFound { run_id, step_name: step_name.to_string(), position: position.to_string() }),
        }
    }

    async fn timeout(&self, run_id: Uuid, step_name: &str, flow_name: &str, position: &str) -> Result<(), AwaitError> {
        let record = self.store.index_get(&naming::flow_runs_index(&self.prefix, flow_name), &run_id.to_string()).await?;
        let key = format!("{step_name}:await-{position}");
        let still_awaiting = record.map(|r| r.metadata.get("awaitingSteps").and_then(|a| a.get(&key)).is_some()).unwrap_or(false);
        if !still_awaiting {
            return Ok(());
        }

        let new_event = NewEvent::new(event_types::AWAIT_TIMEOUT, run_id, flow_name).with_step(step_name, format!("{run_id}__{step_name}"), 0).with_data(json!({"position": position}));
        self.events.publish(new_event).await?;

        self.hooks
            .invoke(flow_name, step_name, HookKind::OnAwaitTimeout, HookContext { run_id, flow_name: flow_name.into(), step_name: step_name.into(), position: position.into(), payload: Value::Null })
            .await;

        // Default action is `fail`; the resolve path still runs so the run
        // transitions out of `awaiting`, but downstream enqueueing for
        // `before` is skipped by publishing a terminal `step.failed` instead.
        let failed = NewEvent::new(event_types::STEP_FAILED, run_id, flow_name)
            .with_step(step_name, format!("{run_id}__{step_name}"), 0)
            .with_data(json!({"reason": "await_timeout", "position": position}));
        self.events.publish(failed).await?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).expect("system clock before epoch").as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkit_core::flow::{FlowDef, StepDef};
    use flowkit_storage::{InMemoryQueue, InMemoryStore, InMemoryTopicBus};

    fn build(registry: FlowRegistry) -> (AwaitSubsystem, Arc<dyn Queue>, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
        let bus: Arc<dyn flowkit_storage::TopicBus> = Arc::new(InMemoryTopicBus::new());
        let registry = Arc::new(registry);
        let hooks = Arc::new(HookRegistry::new());
        let projection = Arc::new(crate::projection::ProjectionWiring::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            hooks.clone(),
            flowkit_core::config::StateCleanupStrategy::OnComplete,
            "flowkit",
        ));
        let events = Arc::new(EventManager::new(store.clone(), bus, "flowkit", projection));
        (AwaitSubsystem::new(store.clone(), queue.clone(), events, hooks, registry, "flowkit"), queue, store)
    }

    fn simple_registry() -> FlowRegistry {
        let mut registry = FlowRegistry::new();
        let entry = StepDef::new("orders", "ship").with_await_before(AwaitSpec::Webhook { path: "/ship".into(), method: "POST".into() });
        registry.register(FlowDef::new("orders", entry)).unwrap();
        registry
    }

    #[tokio::test]
    async fn registers_webhook_await_and_mints_a_token() {
        let (subsystem, _queue, store) = build(simple_registry());
        let run_id = Uuid::new_v4();
        subsystem.register(run_id, "ship", "orders", AwaitSpec::Webhook { path: "/ship".into(), method: "POST".into() }, "before").await.unwrap();
        let token = store.kv_get(&naming::await_token_key(run_id, "ship", "before")).await.unwrap();
        assert!(token.is_some());
    }

    #[tokio::test]
    async fn resolve_webhook_rejects_wrong_token() {
        let (subsystem, _queue, _store) = build(simple_registry());
        let run_id = Uuid::new_v4();
        subsystem.register(run_id, "ship", "orders", AwaitSpec::Webhook { path: "/ship".into(), method: "POST".into() }, "before").await.unwrap();
        let result = subsystem.resolve_webhook(run_id, "ship", "orders", "before", "wrong-token", json!({})).await;
        assert!(matches!(result, Err(AwaitError::TokenMismatch { .. })));
    }

    #[tokio::test]
    async fn resolve_before_enqueues_the_step_with_resolved_flag() {
        let (subsystem, queue, _store) = build(simple_registry());
        let run_id = Uuid::new_v4();
        subsystem.resolve(run_id, "ship", "orders", "before", json!({"ok": true})).await.unwrap();
        let job = queue.get_job("orders:ship", &format!("{run_id}__ship")).await.unwrap().unwrap();
        assert_eq!(job.data["awaitResolved"], json!(true));
    }

    #[tokio::test]
    async fn time_await_schedules_a_resume_job() {
        let (subsystem, queue, _store) = build(simple_registry());
        let run_id = Uuid::new_v4();
        subsystem.register(run_id, "ship", "orders", AwaitSpec::Time { delay_ms: 500 }, "before").await.unwrap();
        let job = queue.get_job(&naming::await_resume_queue("flowkit"), &format!("{run_id}__ship__before__time_resume")).await.unwrap();
        assert!(job.is_some());
    }
}
