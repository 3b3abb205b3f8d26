//! Core domain types for logship
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Log** | One structured record submitted by a producer (event, crash report, property update) |
//! | **Group** | A named destination with its own batching and retry configuration |
//! | **Pending log** | A persisted log that no batch has claimed yet |
//! | **Batch** | A [`LogContainer`]: logs claimed together for one delivery attempt |
//!
//! The payload schema of a log is owned by the producer. The channel only
//! relies on the envelope fields below and carries `data` opaquely.

use crate::ordered_map::OrderedMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

// ============================================
// Log
// ============================================

/// A structured log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    /// Type tag used by the collector to route the payload
    #[serde(rename = "type")]
    pub log_type: String,

    /// When the producer created the log
    pub timestamp: DateTime<Utc>,

    /// Session correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<Uuid>,

    /// Device correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// Destination tokens
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub targets: BTreeSet<String>,

    /// Custom properties, serialized in insertion order
    #[serde(default, skip_serializing_if = "OrderedMap::is_empty")]
    pub properties: OrderedMap<String, String>,

    /// Producer-owned payload
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl Log {
    /// Create a log of the given type stamped with the current time.
    pub fn new(log_type: impl Into<String>) -> Self {
        Self {
            log_type: log_type.into(),
            timestamp: Utc::now(),
            sid: None,
            device_id: None,
            targets: BTreeSet::new(),
            properties: OrderedMap::new(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_session(mut self, sid: Uuid) -> Self {
        self.sid = Some(sid);
        self
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_target(mut self, token: impl Into<String>) -> Self {
        self.targets.insert(token.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

// ============================================
// LogContainer
// ============================================

/// A batch of logs claimed together from the store.
///
/// The batch id is assigned once at claim time and never changes. Logs keep
/// the order in which they were enqueued.
#[derive(Debug, Clone)]
pub struct LogContainer {
    /// Unique batch identifier
    pub batch_id: String,
    /// Group the logs belong to
    pub group_id: String,
    /// Logs in insertion order
    pub logs: Vec<Log>,
    /// Store record ids backing `logs`, same order
    pub record_ids: Vec<i64>,
}

/// Wire body for one batch: `{"logs": [...]}`
#[derive(Serialize)]
struct LogPayload<'a> {
    logs: &'a [Log],
}

impl LogContainer {
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    /// Serialize the container into the request body.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&LogPayload { logs: &self.logs })
    }
}

// ============================================
// Priority
// ============================================

/// Delivery priority of a group.
///
/// - `Default`: stored logs are discarded when the group is disabled
/// - `High`: stored logs survive a disable and the retry budget is doubled
/// - `Backup`: logs are persisted but never sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Default,
    High,
    Backup,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Default => "default",
            Priority::High => "high",
            Priority::Backup => "backup",
        }
    }

    /// Whether disabling a group of this priority deletes its stored logs.
    pub fn discards_on_disable(&self) -> bool {
        matches!(self, Priority::Default)
    }

    /// Whether batches of this priority are ever handed to the sender.
    pub fn sends(&self) -> bool {
        !matches!(self, Priority::Backup)
    }

    /// Retry budget for a call given the global maximum.
    pub fn retry_budget(&self, max_retries: usize) -> usize {
        match self {
            Priority::High => max_retries.saturating_mul(2),
            _ => max_retries,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Priority::Default),
            "high" => Ok(Priority::High),
            "backup" => Ok(Priority::Backup),
            _ => Err(format!("unknown priority: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_serializes_type_tag_and_skips_empty_fields() {
        let log = Log::new("event").with_property("name", "launch");
        let value = serde_json::to_value(&log).unwrap();

        assert_eq!(value["type"], "event");
        assert_eq!(value["properties"]["name"], "launch");
        assert!(value.get("sid").is_none());
        assert!(value.get("targets").is_none());
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_log_roundtrip_preserves_property_order() {
        let log = Log::new("event")
            .with_property("z", "1")
            .with_property("a", "2")
            .with_target("token-1")
            .with_session(Uuid::new_v4())
            .with_data(serde_json::json!({"count": 3}));

        let json = serde_json::to_string(&log).unwrap();
        let parsed: Log = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, log);

        let keys: Vec<_> = parsed.properties.keys().cloned().collect();
        assert_eq!(keys, vec!["z".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_container_payload_shape() {
        let container = LogContainer {
            batch_id: "b1".to_string(),
            group_id: "analytics".to_string(),
            logs: vec![Log::new("event"), Log::new("page")],
            record_ids: vec![1, 2],
        };

        let body: serde_json::Value =
            serde_json::from_slice(&container.to_payload().unwrap()).unwrap();
        let logs = body["logs"].as_array().unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1]["type"], "page");
        assert!(body.get("batch_id").is_none());
    }

    #[test]
    fn test_priority_policies() {
        assert!(Priority::Default.discards_on_disable());
        assert!(!Priority::High.discards_on_disable());
        assert!(!Priority::Backup.sends());
        assert_eq!(Priority::High.retry_budget(4), 8);
        assert_eq!(Priority::Default.retry_budget(4), 4);
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }
}
