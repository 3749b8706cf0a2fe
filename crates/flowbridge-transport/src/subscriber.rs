//! [`SubscriberChannelElement`] – read side of a transport leg.
//!
//! Registers a consumer on the bus and turns every delivered message into a
//! `write` + `signal` on the downstream [`BufferElement`].  Delivery happens on
//! the bus's callback threads; the component reads from the buffer on its own
//! schedule.
//!
//! Callbacks are admitted through a [`CallbackGate`].  Dropping the element
//! cancels the subscription first and then waits for admitted callbacks, so no
//! callback ever writes into a torn-down chain.
//!
//! [`BufferElement`]: crate::buffer::BufferElement

use std::sync::Arc;

use flowbridge_types::{ConnPolicy, Message, PortInfo, TransportError};
use tracing::{debug, trace};

use crate::bus::{Bus, ConsumerHandle};
use crate::element::ChannelElement;
use crate::gate::CallbackGate;

/// The part of the element the bus callback captures.
struct Inbox<T: Message> {
    topic: String,
    gate: CallbackGate,
    output: Arc<dyn ChannelElement<T>>,
}

impl<T: Message> Inbox<T> {
    fn deliver(&self, message: &T) -> bool {
        let Some(_permit) = self.gate.enter() else {
            trace!(topic = %self.topic, "late callback ignored");
            return false;
        };
        let status = self.output.write(message.clone());
        if !status.is_stored() {
            debug!(topic = %self.topic, ?status, "incoming sample not stored");
        }
        self.output.signal();
        true
    }
}

/// Channel element feeding bus messages into its downstream buffer.
///
/// May be dropped from inside its own delivery (a downstream `signal` that
/// tears the stream down): the drop then waits only for callbacks on other
/// threads.
pub struct SubscriberChannelElement<T: Message, B: Bus> {
    topic: String,
    bus: Arc<B>,
    handle: ConsumerHandle,
    inbox: Arc<Inbox<T>>,
}

impl<T: Message, B: Bus> SubscriberChannelElement<T, B> {
    /// Subscribe to `policy`'s topic, delivering into `output`.
    ///
    /// # Errors
    ///
    /// * [`TransportError::Configuration`] when the policy has no topic.
    /// * [`TransportError::Registration`] when the bus refuses the consumer.
    pub fn new(
        port: &PortInfo,
        policy: &ConnPolicy,
        bus: Arc<B>,
        output: Arc<dyn ChannelElement<T>>,
    ) -> Result<Self, TransportError> {
        let topic = policy
            .topic_name()
            .ok_or_else(|| {
                TransportError::Configuration(format!(
                    "subscriber for port {} needs a topic name",
                    port.qualified_name()
                ))
            })?
            .to_string();

        let inbox = Arc::new(Inbox {
            topic: topic.clone(),
            gate: CallbackGate::new(),
            output,
        });
        let callback_inbox = Arc::clone(&inbox);
        let handle = bus
            .subscribe::<T>(
                &topic,
                policy.queue_depth(),
                Box::new(move |message: &T| {
                    callback_inbox.deliver(message);
                }),
            )
            .map_err(|source| TransportError::Registration {
                topic: topic.clone(),
                source,
            })?;

        debug!(port = %port.qualified_name(), topic = %topic, "created subscriber");
        Ok(Self {
            topic,
            bus,
            handle,
            inbox,
        })
    }

    /// Hand one message to the downstream buffer.
    ///
    /// Returns `false` once the element is shutting down.
    pub fn on_message(&self, message: &T) -> bool {
        self.inbox.deliver(message)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Callbacks currently running.
    pub fn in_flight(&self) -> usize {
        self.inbox.gate.active()
    }
}

impl<T: Message, B: Bus> ChannelElement<T> for SubscriberChannelElement<T, B> {
    fn input_ready(&self) -> bool {
        self.inbox.output.input_ready()
    }

    fn signal(&self) -> bool {
        self.inbox.output.signal()
    }
}

impl<T: Message, B: Bus> Drop for SubscriberChannelElement<T, B> {
    fn drop(&mut self) {
        debug!(topic = %self.topic, "destroying subscriber");
        self.bus.unsubscribe(&self.handle);
        self.inbox.gate.close_and_wait();
    }
}
