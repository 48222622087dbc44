//! Orchestration layer on top of `flowkit-storage`: flow/step registry,
//! event manager, projection wiring, await and trigger subsystems, the job
//! runner, and the facade that ties them into one engine handle.

pub mod await_subsystem;
pub mod context;
pub mod error;
pub mod event_manager;
pub mod facade;
pub mod hooks;
pub mod naming;
pub mod projection;
pub mod registry;
pub mod runner;
pub mod trigger_subsystem;

use std::sync::Arc;

use flowkit_core::config::{EngineConfig, StateScope};
use flowkit_core::flow::{FlowDef, FlowDefError};
use flowkit_storage::{Queue, Store, TopicBus};

pub use await_subsystem::{AwaitError, AwaitSubsystem};
pub use context::{FlowCapability, FlowHandle, Logger, RunContext, StateHandle};
pub use error::{EngineError, RunnerError};
pub use event_manager::EventManager;
pub use facade::{FacadeError, FlowEngineFacade, RestartedFlow, RunSummary, StartedFlow};
pub use hooks::{Hook, HookContext, HookKind, HookRegistry};
pub use projection::{ProjectionError, ProjectionWiring};
pub use registry::FlowRegistry;
pub use runner::{HandlerResult, Runner, RunnerConfig, RunnerStatus, StepHandler};
pub use trigger_subsystem::{TriggerError, TriggerSubsystem};

/// Wires one engine instance together: a registry of flow definitions, the
/// shared storage triad, and the five components built on top of them
/// (Event Manager, Projection Wiring, Await/Trigger Subsystems, Runner,
/// Facade). Construct with [`EngineBuilder`].
pub struct Engine {
    pub registry: Arc<FlowRegistry>,
    pub events: Arc<EventManager>,
    pub projection: Arc<ProjectionWiring>,
    pub awaits: Arc<AwaitSubsystem>,
    pub triggers: Arc<TriggerSubsystem>,
    pub hooks: Arc<HookRegistry>,
    pub facade: Arc<FlowEngineFacade>,
    pub runner: Arc<Runner>,
}

pub struct EngineBuilder {
    flows: Vec<FlowDef>,
    queue: Arc<dyn Queue>,
    store: Arc<dyn Store>,
    bus: Arc<dyn TopicBus>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new(queue: Arc<dyn Queue>, store: Arc<dyn Store>, bus: Arc<dyn TopicBus>, config: EngineConfig) -> Self {
        Self { flows: Vec::new(), queue, store, bus, config }
    }

    pub fn with_flow(mut self, flow: FlowDef) -> Self {
        self.flows.push(flow);
        self
    }

    pub fn build(self) -> Result<Engine, FlowDefError> {
        let mut registry = FlowRegistry::new();
        for flow in self.flows {
            registry.register(flow)?;
        }
        let registry = Arc::new(registry);
        // The engine uses one shared subject/index prefix in practice even
        // though config exposes queue/store/stream prefixes separately for
        // independent adapter tuning; store_prefix is the one the run and
        // flow indices (read by the facade and projection wiring) key off.
        let prefix = self.config.store_prefix.clone();

        let hooks = Arc::new(HookRegistry::new());
        let projection = Arc::new(ProjectionWiring::new(
            self.store.clone(),
            self.queue.clone(),
            registry.clone(),
            hooks.clone(),
            self.config.store_state.cleanup_strategy,
            prefix.clone(),
        ));
        let events = Arc::new(EventManager::new(self.store.clone(), self.bus.clone(), prefix.clone(), projection.clone()));
        let facade = Arc::new(FlowEngineFacade::new(registry.clone(), self.queue.clone(), self.store.clone(), events.clone(), prefix.clone()));
        let flow_handle: Arc<dyn FlowHandle> = facade.clone();

        let awaits = Arc::new(AwaitSubsystem::new(self.store.clone(), self.queue.clone(), events.clone(), hooks.clone(), registry.clone(), prefix.clone()));
        let triggers = Arc::new(TriggerSubsystem::new(self.store.clone(), self.bus.clone(), flow_handle.clone(), prefix.clone()));

        let state_scope = self.config.store_state.auto_scope;
        let runner = Runner::new(
            registry.clone(),
            self.queue.clone(),
            self.store.clone(),
            events.clone(),
            awaits.clone(),
            hooks.clone(),
            flow_handle,
            prefix,
            state_scope,
            RunnerConfig::default(),
        );

        Ok(Engine { registry, events, projection, awaits, triggers, hooks, facade, runner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkit_core::flow::StepDef;
    use flowkit_storage::{InMemoryQueue, InMemoryStore, InMemoryTopicBus};

    #[tokio::test]
    async fn builder_wires_an_engine_end_to_end() {
        let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let bus: Arc<dyn TopicBus> = Arc::new(InMemoryTopicBus::new());

        let entry = StepDef::new("orders", "validate").emitting("order.validated");
        let ship = StepDef::new("orders", "ship").subscribing_to("order.validated");
        let flow = FlowDef::new("orders", entry).with_step(ship);

        let engine = EngineBuilder::new(queue, store, bus, EngineConfig::default()).with_flow(flow).build().unwrap();

        assert!(engine.registry.get("orders").is_some());
        let started = engine.facade.start_flow_detailed("orders", serde_json::json!({"orderId": 1})).await.unwrap();
        assert_eq!(started.entry_step_name, "validate");
    }
}
