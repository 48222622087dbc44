//! Event Manager: the single ingress path for every event in the system.
//!
//! `publish` appends to the run's stream (durable, must succeed), then best-
//! effort notifies the projection wiring and the topic bus — failures there
//! are logged, never allowed to fail the call, matching the "steps 3-5 are
//! best-effort" rule.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use flowkit_core::event::{event_types, Event, NewEvent};
use flowkit_storage::{Store, StoreError, TopicBus};
use serde_json::json;
use tracing::{error, instrument};

use crate::naming;
use crate::projection::ProjectionWiring;

pub struct EventManager {
    store: Arc<dyn Store>,
    bus: Arc<dyn TopicBus>,
    prefix: String,
    projection: Arc<ProjectionWiring>,
}

impl EventManager {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn TopicBus>, prefix: impl Into<String>, projection: Arc<ProjectionWiring>) -> Self {
        Self { store, bus, prefix: prefix.into(), projection }
    }

    #[instrument(skip(self, event), fields(run_id = %event.run_id, flow_name = %event.flow_name, event_type = %event.event_type))]
    pub async fn publish(&self, event: NewEvent) -> Result<Event, StoreError> {
        let subject = naming::run_stream(&self.prefix, event.run_id);
        let record = self.store.stream_append(&subject, event).await?;

        match self.projection.handle(&record).await {
            Ok(follow_on) => {
                for next in follow_on {
                    let recurse: Pin<Box<dyn Future<Output = Result<Event, StoreError>> + Send + '_>> = Box::pin(self.publish(next));
                    if let Err(err) = recurse.await {
                        error!(error = %err, run_id = %record.run_id, "failed to publish follow-on event from projection wiring");
                    }
                }
            }
            Err(err) => error!(error = %err, run_id = %record.run_id, "projection wiring failed for event"),
        }

        let payload = serde_json::to_value(&record).unwrap_or(serde_json::Value::Null);

        let topic = naming::flow_events_topic(&self.prefix, record.run_id);
        if let Err(err) = self.bus.publish(&topic, payload.clone()).await {
            error!(error = %err, topic, "failed to publish event to topic bus");
        }

        if record.is_terminal_flow_event() {
            let stats_topic = naming::flow_stats_topic(&self.prefix);
            if let Err(err) = self.bus.publish(&stats_topic, payload).await {
                error!(error = %err, "failed to publish terminal event to flow:stats");
            }
        }

        Ok(record)
    }

    /// Exposed for callers outside this crate (the gateway's WebSocket
    /// bridge) that need to read run history or subscribe to live updates
    /// using the same store/bus/prefix the engine itself publishes through.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<dyn TopicBus> {
        &self.bus
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn log(&self, run_id: uuid::Uuid, flow_name: &str, step_name: Option<&str>, level: &str, message: &str, meta: serde_json::Value) {
        let mut new_event = NewEvent::new(event_types::LOG, run_id, flow_name).with_data(json!({
            "level": level,
            "message": message,
            "meta": meta,
        }));
        if let Some(step) = step_name {
            new_event.step_name = Some(step.to_string());
        }
        if let Err(err) = self.publish(new_event).await {
            error!(error = %err, "failed to persist log event");
        }
    }
}
