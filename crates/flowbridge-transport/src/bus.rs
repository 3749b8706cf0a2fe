//! The bus contract.
//!
//! The bridge never speaks a wire protocol itself.  It drives whatever
//! publish/subscribe substrate it is given through the [`Bus`] trait, and
//! request/response style services through [`ServiceHost`].
//!
//! # Threading contract
//!
//! * [`Bus::publish`] is only ever called from the publish worker thread.
//! * Subscription callbacks run on threads owned by the bus implementation.
//! * After [`Bus::unsubscribe`] returns no *new* callback may start, but a
//!   callback that was already dispatched may still be running.  Subscribers
//!   account for that window themselves.

use std::sync::Arc;

use flowbridge_types::{BusError, Message};
use serde_json::Value;

/// Callback invoked by the bus for every message delivered to a subscription.
pub type Callback<T> = Box<dyn Fn(&T) + Send + Sync + 'static>;

/// Handler answering one request/response service.
pub type ServiceHandler = Arc<dyn Fn(Value) -> Result<Value, BusError> + Send + Sync + 'static>;

macro_rules! bus_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name {
            id: u64,
            name: String,
        }

        impl $name {
            /// Build a handle; only bus implementations should need this.
            pub fn new(id: u64, name: impl Into<String>) -> Self {
                Self { id, name: name.into() }
            }

            /// Bus-assigned identity.
            pub fn id(&self) -> u64 {
                self.id
            }

            /// Topic or service name the handle is bound to.
            pub fn name(&self) -> &str {
                &self.name
            }
        }
    };
}

bus_handle!(
    /// Registration of a producer on a topic, returned by [`Bus::advertise`].
    ProducerHandle
);
bus_handle!(
    /// Registration of a callback on a topic, returned by [`Bus::subscribe`].
    ConsumerHandle
);
bus_handle!(
    /// Registration of a service, returned by [`ServiceHost::advertise_service`].
    ServiceHandle
);

/// Publish/subscribe primitives the bridge consumes.
pub trait Bus: Send + Sync + 'static {
    /// Register a producer for payload type `T` on `topic`.
    ///
    /// `queue_depth` is at least one.  With `latch` set the bus keeps the last
    /// published value and hands it to subscribers that join later.
    fn advertise<T: Message>(
        &self,
        topic: &str,
        queue_depth: usize,
        latch: bool,
    ) -> Result<ProducerHandle, BusError>;

    /// Publish one sample through a producer registration.
    fn publish<T: Message>(&self, handle: &ProducerHandle, sample: &T) -> Result<(), BusError>;

    /// Release a producer registration.  Unknown handles are ignored.
    fn unadvertise(&self, handle: &ProducerHandle);

    /// Register `callback` for every `T` published on `topic`.
    fn subscribe<T: Message>(
        &self,
        topic: &str,
        queue_depth: usize,
        callback: Callback<T>,
    ) -> Result<ConsumerHandle, BusError>;

    /// Release a subscription.  Unknown handles are ignored.
    fn unsubscribe(&self, handle: &ConsumerHandle);
}

/// Request/response services on top of the bus.
pub trait ServiceHost: Send + Sync + 'static {
    /// Make `handler` reachable under `name`.
    fn advertise_service(&self, name: &str, handler: ServiceHandler) -> Result<ServiceHandle, BusError>;

    /// Invoke the service `name` with `request`.
    fn call_service(&self, name: &str, request: Value) -> Result<Value, BusError>;

    /// Withdraw a service.  Unknown handles are ignored.
    fn unadvertise_service(&self, handle: &ServiceHandle);
}

/// Check that `name` is usable as a topic or service name.
///
/// Accepted names are non-empty, contain only ASCII letters, digits and
/// `_ . / ~ -`, and never contain an empty `//` segment.
pub fn validate_name(name: &str) -> Result<(), BusError> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '~' | '-'));
    if name.is_empty() || !valid_chars || name.contains("//") {
        return Err(BusError::InvalidTopic(name.to_string()));
    }
    Ok(())
}
