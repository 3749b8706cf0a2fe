//! `flowbridge-types` – shared vocabulary of the bridge.
//!
//! Everything the transport and service crates pass across their seams lives
//! here: the description of a framework port, the connection policy that
//! configures one transport leg, the stable identity handed to every
//! publisher, and the error taxonomy.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Marker for every payload type that may travel through a channel leg.
///
/// Samples are cloned when the bus fans them out to several subscribers and
/// cross thread boundaries on the way, hence the bounds.
pub trait Message: Clone + Send + Sync + 'static {}

impl<T> Message for T where T: Clone + Send + Sync + 'static {}

// ─────────────────────────────────────────────────────────────────────────────
// Ports
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only description of a framework port, as handed to the factory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortInfo {
    /// Port name within its component (e.g. `"cmd_vel"`).
    pub name: String,
    /// Name of the owning component, if the port is attached to one.
    pub owner: Option<String>,
    /// Payload type carried by the port.
    pub type_name: String,
}

impl PortInfo {
    /// Describe an unowned port carrying `T`.
    pub fn new<T: Message>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: None,
            type_name: std::any::type_name::<T>().to_string(),
        }
    }

    /// Attach the port to the component named `owner`.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// `owner.port` when owned, plain `port` otherwise.
    pub fn qualified_name(&self) -> String {
        match &self.owner {
            Some(owner) => format!("{owner}.{}", self.name),
            None => self.name.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection policy
// ─────────────────────────────────────────────────────────────────────────────

/// Storage semantics of the buffer element sitting in a transport leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnKind {
    /// Keep only the most recent sample; a new write overwrites the old one.
    Data,
    /// Keep up to `buffer_capacity` samples in FIFO order; writes into a full
    /// buffer are rejected.
    #[default]
    Buffer,
}

/// Configuration of one connection between a port and a bus topic.
///
/// A `buffer_capacity` of zero is treated as one everywhere it is used.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnPolicy {
    /// Topic to publish on / subscribe to. Publishers derive a default name
    /// when this is absent or empty.
    pub topic: Option<String>,
    /// Requested buffer size and bus queue depth.
    pub buffer_capacity: usize,
    /// Deliver the last published value to late subscribers (latching).
    pub init: bool,
    /// Buffer semantics.
    pub kind: ConnKind,
}

impl ConnPolicy {
    /// A FIFO buffer connection holding up to `capacity` samples.
    pub fn buffer(capacity: usize) -> Self {
        Self {
            buffer_capacity: capacity,
            kind: ConnKind::Buffer,
            ..Self::default()
        }
    }

    /// A latest-value-only connection.
    pub fn data() -> Self {
        Self {
            buffer_capacity: 1,
            kind: ConnKind::Data,
            ..Self::default()
        }
    }

    /// Set the topic name.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Request latching of the last published value.
    pub fn with_init(mut self, init: bool) -> Self {
        self.init = init;
        self
    }

    /// The topic name, if one was supplied and is non-empty.
    pub fn topic_name(&self) -> Option<&str> {
        self.topic.as_deref().filter(|t| !t.is_empty())
    }

    /// Bus queue depth / buffer size with the floor of one applied.
    pub fn queue_depth(&self) -> usize {
        self.buffer_capacity.max(1)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Identities
// ─────────────────────────────────────────────────────────────────────────────

static NEXT_ELEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a channel element.
///
/// Ids come from a monotonically increasing counter and are never reused, so
/// a stale id left in a queue can never alias a newer element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(u64);

impl ElementId {
    /// Reserve the next id.
    pub fn next() -> Self {
        Self(NEXT_ELEMENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which end of a transport leg a chain implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Port data is published to the bus.
    Publish,
    /// Bus data is delivered into a port.
    Subscribe,
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failures reported by a bus implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("invalid topic name '{0}'")]
    InvalidTopic(String),

    #[error("topic '{topic}' carries {existing}, cannot register {requested}")]
    TypeMismatch {
        topic: String,
        existing: String,
        requested: String,
    },

    #[error("unknown bus handle {0}")]
    UnknownHandle(u64),

    #[error("bus resources exhausted: {0}")]
    Exhausted(String),

    #[error("bus is shut down")]
    Closed,

    #[error("service '{0}' is not advertised")]
    ServiceNotFound(String),

    #[error("service '{0}' is already advertised")]
    DuplicateService(String),

    #[error("service '{name}' failed: {reason}")]
    ServiceFailed { name: String, reason: String },
}

/// Errors surfaced by the bridge to its callers.
///
/// Only construction-time problems ever reach the framework; publish failures
/// stay on the worker thread and are logged there.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Configuration Error: {0}")]
    Configuration(String),

    #[error("Registration Error on '{topic}': {source}")]
    Registration {
        topic: String,
        #[source]
        source: BusError,
    },

    #[error("Publish Failure on '{topic}': {source}")]
    Publish {
        topic: String,
        #[source]
        source: BusError,
    },

    #[error("Config File Error: {0}")]
    Config(String),

    #[error("Service Error: {0}")]
    Service(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_has_depth_one() {
        assert_eq!(ConnPolicy::buffer(0).queue_depth(), 1);
        assert_eq!(ConnPolicy::buffer(16).queue_depth(), 16);
    }

    #[test]
    fn empty_topic_is_treated_as_absent() {
        let policy = ConnPolicy::buffer(4).with_topic("");
        assert_eq!(policy.topic_name(), None);
        let policy = ConnPolicy::buffer(4).with_topic("/odom");
        assert_eq!(policy.topic_name(), Some("/odom"));
    }

    #[test]
    fn element_ids_are_unique_and_increasing() {
        let a = ElementId::next();
        let b = ElementId::next();
        assert!(b > a);
        assert_ne!(a, b);
    }

    #[test]
    fn qualified_name_includes_owner_when_present() {
        let port = PortInfo::new::<f64>("out").with_owner("controller");
        assert_eq!(port.qualified_name(), "controller.out");
        assert_eq!(PortInfo::new::<f64>("out").qualified_name(), "out");
        assert_eq!(port.type_name, "f64");
    }

    #[test]
    fn conn_policy_deserializes_with_defaults() {
        let policy: ConnPolicy = serde_json::from_str(r#"{"topic":"/scan","kind":"data"}"#).unwrap();
        assert_eq!(policy.topic_name(), Some("/scan"));
        assert_eq!(policy.kind, ConnKind::Data);
        assert_eq!(policy.buffer_capacity, 0);
        assert!(!policy.init);
    }

    #[test]
    fn transport_error_display() {
        let err = TransportError::Registration {
            topic: "bad topic".to_string(),
            source: BusError::InvalidTopic("bad topic".to_string()),
        };
        assert!(err.to_string().contains("Registration Error"));
        assert!(err.to_string().contains("invalid topic name"));
    }
}
