//! End-to-end test of a two-step flow: entry step emits an event the second
//! step subscribes to, driven entirely through the runner's poll loop against
//! in-memory storage.

use std::sync::Arc;
use std::time::Duration;

use flowkit_core::config::EngineConfig;
use flowkit_core::event::event_types;
use flowkit_core::flow::{FlowDef, StepDef};
use flowkit_engine::{EngineBuilder, HandlerResult};
use flowkit_storage::{InMemoryQueue, InMemoryStore, InMemoryTopicBus, Queue, Store, TopicBus};
use serde_json::json;

#[tokio::test]
async fn order_flow_runs_validate_then_ship_to_completion() {
    let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let bus: Arc<dyn TopicBus> = Arc::new(InMemoryTopicBus::new());

    let entry = StepDef::new("orders", "validate").emitting("order.validated");
    let ship = StepDef::new("orders", "ship").subscribing_to("order.validated");
    let flow = FlowDef::new("orders", entry).with_step(ship);

    let engine = EngineBuilder::new(queue, store, bus, EngineConfig::default()).with_flow(flow).build().unwrap();

    engine.runner.register_handler("orders", "validate", move |input, ctx| async move {
        let order_id = input["input"]["orderId"].clone();
        ctx.flow.emit("order.validated", json!({"orderId": order_id})).await.ok();
        Ok(json!({"validated": true}))
    });
    engine.runner.register_handler("orders", "ship", |_input, _ctx| async move { Ok(json!({"shipped": true})) });

    engine.runner.clone().start().await.unwrap();

    let started = engine.facade.start_flow_detailed("orders", json!({"orderId": 42})).await.unwrap();

    let prefix = engine.events.prefix().to_string();
    let subject = flowkit_engine::naming::run_stream(&prefix, started.run_id);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let history = loop {
        let history = engine.events.store().stream_read(&subject, Default::default()).await.unwrap();
        if history.iter().any(|e| e.event_type == event_types::FLOW_COMPLETED) {
            break history;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("flow did not complete within timeout, events so far: {history:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    let types: Vec<&str> = history.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&event_types::FLOW_START));
    assert!(types.contains(&event_types::STEP_STARTED));
    assert!(types.contains(&event_types::STEP_COMPLETED));
    assert!(types.contains(&event_types::FLOW_COMPLETED));

    engine.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancel_flow_prevents_further_step_processing() {
    let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let bus: Arc<dyn TopicBus> = Arc::new(InMemoryTopicBus::new());

    let entry = StepDef::new("orders", "validate");
    let flow = FlowDef::new("orders", entry);
    let engine = EngineBuilder::new(queue, store, bus, EngineConfig::default()).with_flow(flow).build().unwrap();

    engine.runner.register_handler("orders", "validate", |_input, _ctx| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let result: HandlerResult = Ok(json!({}));
        result
    });

    let started = engine.facade.start_flow_detailed("orders", json!({})).await.unwrap();
    engine.facade.cancel_flow_named("orders", started.run_id).await.unwrap();

    let is_running = engine.facade.is_running_named("orders", Some(started.run_id), &[]).await.unwrap();
    assert!(!is_running);
}
