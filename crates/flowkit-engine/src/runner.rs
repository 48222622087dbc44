//! Runner: claims jobs off the queue and executes the matching step handler,
//! per the seven-step algorithm in §4.3. Built as a bounded-concurrency
//! worker pool, the same semaphore-and-shutdown-watch shape as the reference
//! worker pool this codebase already uses for activity execution.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use flowkit_core::config::{StateCleanupStrategy, StateScope};
use flowkit_core::event::{event_types, NewEvent};
use flowkit_storage::{Job, Queue, Store};
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::await_subsystem::AwaitSubsystem;
use crate::context::{FlowCapability, FlowHandle, Logger, RunContext, StateHandle};
use crate::error::RunnerError;
use crate::event_manager::EventManager;
use crate::hooks::HookRegistry;
use crate::naming;
use crate::registry::FlowRegistry;

pub type HandlerResult = Result<Value, anyhow::Error>;
pub type StepHandler = Arc<dyn Fn(Value, RunContext) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { concurrency: 10, poll_interval_ms: 250, shutdown_timeout_ms: 30_000 }
    }
}

pub struct Runner {
    registry: Arc<FlowRegistry>,
    queue: Arc<dyn Queue>,
    store: Arc<dyn Store>,
    events: Arc<EventManager>,
    awaits: Arc<AwaitSubsystem>,
    hooks: Arc<HookRegistry>,
    flows: Arc<dyn FlowHandle>,
    prefix: String,
    state_scope: StateScope,
    handlers: parking_lot::RwLock<HashMap<(String, String), StepHandler>>,
    config: RunnerConfig,
    semaphore: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: parking_lot::RwLock<RunnerStatus>,
    poll_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Runner {
    pub fn new(
        registry: Arc<FlowRegistry>,
        queue: Arc<dyn Queue>,
        store: Arc<dyn Store>,
        events: Arc<EventManager>,
        awaits: Arc<AwaitSubsystem>,
        hooks: Arc<HookRegistry>,
        flows: Arc<dyn FlowHandle>,
        prefix: impl Into<String>,
        state_scope: StateScope,
        config: RunnerConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            registry,
            queue,
            store,
            events,
            awaits,
            hooks,
            flows,
            prefix: prefix.into(),
            state_scope,
            handlers: parking_lot::RwLock::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            config,
            shutdown_tx,
            shutdown_rx,
            status: parking_lot::RwLock::new(RunnerStatus::Stopped),
            poll_handles: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn register_handler<F, Fut>(&self, flow_name: impl Into<String>, step_name: impl Into<String>, handler: F)
    where
        F: Fn(Value, RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: StepHandler = Arc::new(move |input, ctx| Box::pin(handler(input, ctx)));
        self.handlers.write().insert((flow_name.into(), step_name.into()), handler);
    }

    pub fn status(&self) -> RunnerStatus {
        *self.status.read()
    }

    /// Takes `self` by `Arc` (call as `runner.clone().start().await`) since
    /// each poll loop needs an owned, `'static` handle to spawn into tokio.
    #[instrument(skip(self))]
    pub async fn start(self: Arc<Self>) -> Result<(), RunnerError> {
        *self.status.write() = RunnerStatus::Starting;

        let mut queue_names: Vec<String> = self.registry.flows().flat_map(|flow| flow.steps.values().map(|s| s.queue_name.clone())).collect();
        queue_names.sort();
        queue_names.dedup();
        queue_names.push(naming::await_resume_queue(&self.prefix));

        for queue_name in &queue_names {
            self.queue.start_processing(queue_name).await?;
        }

        let mut handles = Vec::new();
        for queue_name in queue_names {
            let is_resume_queue = queue_name == naming::await_resume_queue(&self.prefix);
            let this = self.clone();
            handles.push(tokio::spawn(async move { this.poll_loop(queue_name, is_resume_queue).await }));
        }
        *self.poll_handles.lock().unwrap() = handles;
        *self.status.write() = RunnerStatus::Running;
        info!("runner started");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), RunnerError> {
        *self.status.write() = RunnerStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.shutdown_timeout_ms);
        loop {
            if self.semaphore.available_permits() == self.config.concurrency {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("runner shutdown timed out waiting for in-flight jobs");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for handle in self.poll_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
        *self.status.write() = RunnerStatus::Stopped;
        Ok(())
    }

    async fn poll_loop(self: Arc<Self>, queue_name: String, is_resume_queue: bool) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                debug!(queue_name, "poll loop exiting on shutdown");
                return;
            }

            let available = self.semaphore.available_permits();
            if available == 0 {
                tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
                continue;
            }

            let claimed = match self.queue.claim_jobs(&queue_name, &[], available).await {
                Ok(jobs) => jobs,
                Err(err) => {
                    error!(error = %err, queue_name, "failed to claim jobs");
                    tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
                    continue;
                }
            };

            if claimed.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)) => {},
                    _ = shutdown_rx.changed() => {},
                }
                continue;
            }

            for job in claimed {
                let permit = match self.semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let this = self.clone();
                let queue_name = queue_name.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let job_id = job.id.clone();
                    let result = if is_resume_queue {
                        this.process_resume_job(job).await
                    } else {
                        this.process_step_job(job).await
                    };
                    match result {
                        Ok(()) => {
                            if let Err(err) = this.queue.complete_job(&queue_name, &job_id).await {
                                error!(error = %err, job_id, "failed to mark job complete");
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, job_id, "job execution failed");
                            if let Err(err) = this.queue.fail_job(&queue_name, &job_id, &err.to_string()).await {
                                error!(error = %err, job_id, "failed to record job failure");
                            }
                        }
                    }
                });
            }
        }
    }

    async fn process_resume_job(&self, job: Job) -> Result<(), RunnerError> {
        self.awaits.handle_resume_job(job.data).await.map_err(|err| RunnerError::HandlerFailed(err.to_string()))
    }

    /// The seven-step job-processing algorithm.
    #[instrument(skip(self, job), fields(job_id = %job.id, job_name = %job.name))]
    async fn process_step_job(&self, job: Job) -> Result<(), RunnerError> {
        // Step 1: scheduled flow-start short-circuit.
        if job.data.get("__scheduledFlowStart").and_then(Value::as_bool).unwrap_or(false) {
            let flow_name = job.data.get("flowName").and_then(Value::as_str).unwrap_or_default();
            let input = job.data.get("input").cloned().unwrap_or(Value::Null);
            self.flows.start_flow(flow_name, input).await.map_err(|err| RunnerError::HandlerFailed(err.to_string()))?;
            return Ok(());
        }

        // Step 2: derive identity.
        let run_id: Uuid = job
            .data
            .get("flowId")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(Uuid::new_v4);
        let flow_name = job.data.get("flowName").and_then(Value::as_str).unwrap_or_default().to_string();
        let step_name = job.name.clone();
        let attempt = job.attempts_made + 1;
        let step_id = format!("{run_id}__{step_name}__attempt-{attempt}");

        let step = self
            .registry
            .step(&flow_name, &step_name)
            .ok_or_else(|| RunnerError::UnknownStep { flow_name: flow_name.clone(), step_name: step_name.clone() })?;

        // Step 3: awaitBefore short-circuit.
        let await_resolved = job.data.get("awaitResolved").and_then(Value::as_bool).unwrap_or(false);
        if let Some(spec) = step.await_before.clone() {
            if !await_resolved {
                self.awaits
                    .register(run_id, &step_name, &flow_name, spec, "before")
                    .await
                    .map_err(|err| RunnerError::HandlerFailed(err.to_string()))?;
                return Ok(());
            }
        }

        let await_after = step.await_after.clone();
        let max_attempts = step.job_defaults.attempts.max(1);

        // Step 4: build RunContext, emit step.started.
        let started = NewEvent::new(event_types::STEP_STARTED, run_id, &flow_name).with_step(step_name.clone(), step_id.clone(), attempt);
        self.events.publish(started).await.map_err(RunnerError::Store)?;

        let trigger = job.data.get("awaitData").cloned();
        let state = StateHandle::new(self.store.clone(), self.state_scope, Some(run_id));
        let logger = Logger::new(self.events.clone(), run_id, flow_name.clone(), Some(step_name.clone()));
        let flow_capability = FlowCapability::new(self.events.clone(), self.flows.clone(), run_id, flow_name.clone(), step_name.clone(), step_id.clone());
        let ctx = RunContext {
            logger,
            state,
            flow: flow_capability,
            job_id: job.id.clone(),
            queue_name: step.queue_name.clone(),
            flow_id: run_id,
            flow_name: flow_name.clone(),
            step_name: step_name.clone(),
            step_id: step_id.clone(),
            attempt,
            trigger,
            await_config: step.await_before.as_ref().and_then(|s| serde_json::to_value(s).ok()),
        };

        // Step 5: input = data.input ?? data (whole job payload, minus envelope noise).
        let input = job.data.get("input").cloned().unwrap_or_else(|| job.data.clone());

        let handler = self.handlers.read().get(&(flow_name.clone(), step_name.clone())).cloned();
        let Some(handler) = handler else {
            return Err(RunnerError::NoHandler { flow_name, step_name });
        };

        match handler(input, ctx).await {
            Err(err) => {
                // Step 6: failure path.
                let terminal = attempt >= max_attempts;
                let failed = NewEvent::new(event_types::STEP_FAILED, run_id, &flow_name)
                    .with_step(step_name.clone(), step_id.clone(), attempt)
                    .with_data(serde_json::json!({"error": err.to_string(), "terminal": terminal}));
                self.events.publish(failed).await.map_err(RunnerError::Store)?;

                if terminal {
                    let flow_failed = NewEvent::new(event_types::FLOW_FAILED, run_id, &flow_name).with_data(serde_json::json!({"stepName": step_name, "error": err.to_string()}));
                    self.events.publish(flow_failed).await.map_err(RunnerError::Store)?;
                    Err(RunnerError::HandlerFailed(err.to_string()))
                } else {
                    let retry = NewEvent::new(event_types::STEP_RETRY, run_id, &flow_name).with_step(step_name.clone(), step_id.clone(), attempt);
                    self.events.publish(retry).await.map_err(RunnerError::Store)?;
                    Err(RunnerError::HandlerFailed(err.to_string()))
                }
            }
            Ok(result) => {
                // Step 7: success path.
                let completed = NewEvent::new(event_types::STEP_COMPLETED, run_id, &flow_name)
                    .with_step(step_name.clone(), step_id.clone(), attempt)
                    .with_data(serde_json::json!({"result": result}));
                self.events.publish(completed).await.map_err(RunnerError::Store)?;

                if let Some(spec) = await_after {
                    self.awaits.register(run_id, &step_name, &flow_name, spec, "after").await.map_err(|err| RunnerError::HandlerFailed(err.to_string()))?;
                }
                Ok(())
            }
        }
    }
}
