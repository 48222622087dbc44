//! Trigger Subsystem: named external signal sources that can auto-start
//! subscribed flows, per §4.5.

use std::sync::Arc;

use flowkit_core::event::{event_types, NewEvent};
use flowkit_core::trigger::{Subscription, SubscriptionMode, TriggerRecord, TriggerScope, TriggerType};
use flowkit_storage::{Store, StoreError, TopicBus, TopicBusError};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, instrument};
use uuid::Uuid;

use crate::context::FlowHandle;
use crate::naming;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("unknown trigger '{0}'")]
    UnknownTrigger(String),
    #[error("trigger '{0}' is retired")]
    Retired(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] TopicBusError),
}

pub struct TriggerSubsystem {
    store: Arc<dyn Store>,
    bus: Arc<dyn TopicBus>,
    flows: Arc<dyn FlowHandle>,
    prefix: String,
}

impl TriggerSubsystem {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn TopicBus>, flows: Arc<dyn FlowHandle>, prefix: impl Into<String>) -> Self {
        Self { store, bus, flows, prefix: prefix.into() }
    }

    fn index_key(&self) -> String {
        naming::triggers_index(&self.prefix)
    }

    #[instrument(skip(self, config))]
    pub async fn register_trigger(&self, name: &str, trigger_type: TriggerType, scope: TriggerScope, config: Value) -> Result<(), TriggerError> {
        let now = now_ms();
        let existing = self.store.index_get(&self.index_key(), name).await?;
        let event_type = if existing.is_some() { event_types::TRIGGER_UPDATED } else { event_types::TRIGGER_REGISTERED };

        if let Some(record) = existing {
            let mut trigger: TriggerRecord = serde_json::from_value(record.metadata).unwrap_or_else(|_| TriggerRecord::new(name, trigger_type, scope, config.clone(), now));
            trigger.config = config.clone();
            trigger.last_activity_at = now;
            let patch = serde_json::to_value(&trigger).map_err(StoreError::Serialization)?;
            self.store.index_update_with_retry(&self.index_key(), name, patch, 5).await?;
        } else {
            let trigger = TriggerRecord::new(name, trigger_type, scope, config.clone(), now);
            let metadata = serde_json::to_value(&trigger).map_err(StoreError::Serialization)?;
            self.store.index_add(&self.index_key(), name, now as f64, metadata).await?;
        }

        self.append_trigger_event(name, event_type, json!({"config": config})).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn subscribe_trigger(&self, name: &str, flow_name: &str, mode: SubscriptionMode) -> Result<(), TriggerError> {
        self.require_active(name).await?;
        let now = now_ms();
        self.store
            .index_update_with_retry(
                &self.index_key(),
                name,
                json!({"subscriptions": {flow_name: Subscription { mode, subscribed_at: now }}, "last_activity_at": now}),
                5,
            )
            .await?;
        self.store.index_increment(&self.index_key(), name, "stats.active_subscribers", 1.0).await?;
        self.append_trigger_event(name, event_types::SUBSCRIPTION_ADDED, json!({"flowName": flow_name, "mode": mode})).await?;
        Ok(())
    }

    #[instrument(skip(self, data))]
    pub async fn emit_trigger(&self, name: &str, data: Value) -> Result<Vec<String>, TriggerError> {
        let record = self.require_active(name).await?;

        self.store.index_increment(&self.index_key(), name, "stats.total_fires", 1.0).await?;
        let now = now_ms();
        self.store.index_update_with_retry(&self.index_key(), name, json!({"stats": {"last_fired_at": now}, "last_activity_at": now}), 5).await?;

        self.append_trigger_event(name, event_types::TRIGGER_FIRED, json!({"summary": summarize(&data)})).await?;

        let topic = naming::trigger_events_topic(&self.prefix, name);
        self.bus.publish(&topic, json!({"trigger": name, "data": data})).await?;

        let mut started = Vec::new();
        for flow_name in record.auto_subscribers() {
            match self.flows.start_flow(flow_name, data.clone()).await {
                Ok((run_id, _)) => {
                    started.push(flow_name.to_string());
                    tracing::info!(%run_id, flow_name, "trigger auto-started flow");
                }
                Err(err) => error!(error = %err, flow_name, trigger = name, "trigger-driven flow start failed, continuing with siblings"),
            }
        }
        Ok(started)
    }

    #[instrument(skip(self))]
    pub async fn retire_trigger(&self, name: &str) -> Result<(), TriggerError> {
        let record = self.require_active(name).await?;
        let now = now_ms();
        self.store.index_update_with_retry(&self.index_key(), name, json!({"status": "retired", "last_activity_at": now}), 5).await?;
        self.append_trigger_event(name, event_types::TRIGGER_RETIRED, json!({"finalStats": record.stats})).await?;
        Ok(())
    }

    pub async fn get_trigger(&self, name: &str) -> Result<Option<TriggerRecord>, TriggerError> {
        let Some(record) = self.store.index_get(&self.index_key(), name).await? else { return Ok(None) };
        let trigger: TriggerRecord = serde_json::from_value(record.metadata).map_err(StoreError::Serialization)?;
        Ok(Some(trigger))
    }

    async fn require_active(&self, name: &str) -> Result<TriggerRecord, TriggerError> {
        let record = self.store.index_get(&self.index_key(), name).await?.ok_or_else(|| TriggerError::UnknownTrigger(name.to_string()))?;
        let trigger: TriggerRecord = serde_json::from_value(record.metadata).map_err(StoreError::Serialization)?;
        if matches!(trigger.status, flowkit_core::trigger::TriggerStatus::Retired) {
            return Err(TriggerError::Retired(name.to_string()));
        }
        Ok(trigger)
    }

    /// Trigger events aren't scoped to a run; `Uuid::nil()` marks that.
    async fn append_trigger_event(&self, name: &str, event_type: &str, data: Value) -> Result<(), TriggerError> {
        let subject = naming::trigger_stream(&self.prefix, name);
        let new_event = NewEvent::new(event_type, Uuid::nil(), "").with_data(data);
        self.store.stream_append(&subject, new_event).await?;
        Ok(())
    }
}

fn summarize(data: &Value) -> Value {
    match data {
        Value::Object(map) => json!({"keys": map.keys().collect::<Vec<_>>()}),
        other => json!({"type": type_name(other)}),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).expect("system clock before epoch").as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowkit_storage::{InMemoryStore, InMemoryTopicBus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeFlows {
        starts: AtomicUsize,
    }

    #[async_trait]
    impl FlowHandle for FakeFlows {
        async fn start_flow(&self, _flow_name: &str, _input: Value) -> anyhow::Result<(Uuid, String)> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok((Uuid::new_v4(), "entry".to_string()))
        }
        async fn cancel_flow(&self, _flow_name: &str, _run_id: Uuid) -> anyhow::Result<()> {
            Ok(())
        }
        async fn is_running(&self, _flow_name: &str, _run_id: Option<Uuid>) -> anyhow::Result<bool> {
            Ok(false)
        }
        async fn get_running_flows(&self, _flow_name: &str) -> anyhow::Result<Vec<Uuid>> {
            Ok(vec![])
        }
    }

    fn build() -> (TriggerSubsystem, Arc<FakeFlows>) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let bus: Arc<dyn TopicBus> = Arc::new(InMemoryTopicBus::new());
        let flows = Arc::new(FakeFlows { starts: AtomicUsize::new(0) });
        (TriggerSubsystem::new(store, bus, flows.clone(), "flowkit"), flows)
    }

    #[tokio::test]
    async fn register_then_subscribe_keeps_the_invariant() {
        let (subsystem, _flows) = build();
        subsystem.register_trigger("orders.created", TriggerType::Webhook, TriggerScope::Flow, json!({})).await.unwrap();
        subsystem.subscribe_trigger("orders.created", "orders", SubscriptionMode::Auto).await.unwrap();
        let record = subsystem.require_active("orders.created").await.unwrap();
        assert!(record.invariant_holds());
    }

    #[tokio::test]
    async fn emit_starts_auto_subscribers_and_counts_fires() {
        let (subsystem, flows) = build();
        subsystem.register_trigger("orders.created", TriggerType::Webhook, TriggerScope::Flow, json!({})).await.unwrap();
        subsystem.subscribe_trigger("orders.created", "orders", SubscriptionMode::Auto).await.unwrap();
        let started = subsystem.emit_trigger("orders.created", json!({"orderId": 1})).await.unwrap();
        assert_eq!(started, vec!["orders".to_string()]);
        assert_eq!(flows.starts.load(Ordering::SeqCst), 1);
        let record = subsystem.require_active("orders.created").await.unwrap();
        assert_eq!(record.stats.total_fires, 1);
    }

    #[tokio::test]
    async fn retired_trigger_rejects_new_emissions() {
        let (subsystem, _flows) = build();
        subsystem.register_trigger("orders.created", TriggerType::Webhook, TriggerScope::Flow, json!({})).await.unwrap();
        subsystem.retire_trigger("orders.created").await.unwrap();
        let result = subsystem.emit_trigger("orders.created", json!({})).await;
        assert!(matches!(result, Err(TriggerError::Retired(_))));
    }
}
