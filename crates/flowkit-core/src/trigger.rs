//! Trigger records — named external signal sources that start flows.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Event,
    Webhook,
    Schedule,
    Manual,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerScope {
    Flow,
    Run,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Active,
    Inactive,
    Retired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub mode: SubscriptionMode,
    pub subscribed_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct TriggerStats {
    pub total_fires: u64,
    pub last_fired_at: Option<i64>,
    pub total_flows_started: u64,
    pub active_subscribers: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerRecord {
    pub trigger_name: String,
    pub trigger_type: TriggerType,
    pub scope: TriggerScope,
    pub status: TriggerStatus,
    pub registered_at: i64,
    pub last_activity_at: i64,
    pub config: Value,
    pub stats: TriggerStats,
    pub subscriptions: BTreeMap<String, Subscription>,
}

impl TriggerRecord {
    pub fn new(
        trigger_name: impl Into<String>,
        trigger_type: TriggerType,
        scope: TriggerScope,
        config: Value,
        registered_at: i64,
    ) -> Self {
        Self {
            trigger_name: trigger_name.into(),
            trigger_type,
            scope,
            status: TriggerStatus::Active,
            registered_at,
            last_activity_at: registered_at,
            config,
            stats: TriggerStats::default(),
            subscriptions: BTreeMap::new(),
        }
    }

    /// Invariant: `stats.activeSubscribers == |subscriptions|`.
    pub fn invariant_holds(&self) -> bool {
        self.stats.active_subscribers as usize == self.subscriptions.len()
    }

    pub fn auto_subscribers(&self) -> impl Iterator<Item = &str> {
        self.subscriptions
            .iter()
            .filter(|(_, sub)| sub.mode == SubscriptionMode::Auto)
            .map(|(flow, _)| flow.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_trigger_keeps_invariant() {
        let t = TriggerRecord::new("t1", TriggerType::Webhook, TriggerScope::Flow, Value::Null, 0);
        assert!(t.invariant_holds());
    }

    #[test]
    fn subscriber_count_drives_invariant() {
        let mut t = TriggerRecord::new("t1", TriggerType::Webhook, TriggerScope::Flow, Value::Null, 0);
        t.subscriptions.insert(
            "a".into(),
            Subscription { mode: SubscriptionMode::Auto, subscribed_at: 1 },
        );
        t.stats.active_subscribers = 1;
        assert!(t.invariant_holds());
    }
}
