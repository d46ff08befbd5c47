use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::Result, snowflake::EventIdGenerator};

/// Kind of fact an event records about its aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
    Snapshot,
    Restore,
    #[serde(untagged)]
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
            EventType::Snapshot => "snapshot",
            EventType::Restore => "restore",
            EventType::Custom(name) => name.as_str(),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, versioned fact about one aggregate instance.
///
/// Versions are 1-based and strictly sequential per `aggregate_id`; the store
/// rejects anything else. `data` and `metadata` are opaque to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: u64,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Event {
    pub fn builder(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        event_type: EventType,
    ) -> EventBuilder {
        EventBuilder {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            event_type,
            version: 0,
            data: Value::Null,
            metadata: None,
            causation_id: None,
            correlation_id: None,
        }
    }

    /// Encoded size used for `max_event_size` enforcement and store size
    /// accounting.
    pub fn encoded_size(&self) -> Result<usize> {
        Ok(serde_json::to_vec(self)?.len())
    }
}

/// Builder that stamps id, timestamp, and node identity from an
/// [`EventIdGenerator`] so callers only supply domain fields.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    aggregate_id: String,
    aggregate_type: String,
    event_type: EventType,
    version: u64,
    data: Value,
    metadata: Option<Value>,
    causation_id: Option<String>,
    correlation_id: Option<String>,
}

impl EventBuilder {
    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn caused_by(mut self, event_id: impl Into<String>) -> Self {
        self.causation_id = Some(event_id.into());
        self
    }

    pub fn correlated_with(mut self, event_id: impl Into<String>) -> Self {
        self.correlation_id = Some(event_id.into());
        self
    }

    pub fn build(self, ids: &EventIdGenerator) -> Event {
        Event {
            id: ids.next_id().to_string(),
            event_type: self.event_type,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            version: self.version,
            data: self.data,
            metadata: self.metadata,
            timestamp: Utc::now(),
            node_id: ids.node_name(),
            causation_id: self.causation_id,
            correlation_id: self.correlation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_serde_round_trip() {
        for (event_type, expected) in [
            (EventType::Create, "\"create\""),
            (EventType::Snapshot, "\"snapshot\""),
            (EventType::Custom("order_shipped".into()), "\"order_shipped\""),
        ] {
            let encoded = serde_json::to_string(&event_type).unwrap();
            assert_eq!(encoded, expected);
            let decoded: EventType = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, event_type);
        }
    }

    #[test]
    fn builder_stamps_identity_fields() {
        let ids = EventIdGenerator::new(9);
        let event = Event::builder("order-1", "order", EventType::Create)
            .version(1)
            .data(json!({ "status": "created" }))
            .build(&ids);

        assert!(!event.id.is_empty());
        assert_eq!(event.node_id, ids.node_name());
        assert_eq!(event.version, 1);
        assert!(event.metadata.is_none());
    }

    #[test]
    fn causal_links_survive_serialization() {
        let ids = EventIdGenerator::new(9);
        let cause = Event::builder("order-1", "order", EventType::Create)
            .version(1)
            .build(&ids);
        let effect = Event::builder("order-1", "order", EventType::Update)
            .version(2)
            .caused_by(cause.id.clone())
            .correlated_with(cause.id.clone())
            .build(&ids);

        let value = serde_json::to_value(&effect).unwrap();
        assert_eq!(value["causation_id"], json!(cause.id));
        let decoded: Event = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.causation_id.as_deref(), Some(cause.id.as_str()));
    }
}
