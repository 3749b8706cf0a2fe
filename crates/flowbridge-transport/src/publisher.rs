//! [`PublisherChannelElement`] – write side of a transport leg.
//!
//! Sits downstream of a [`BufferElement`].  When the buffer signals new data
//! the publisher files a drain request with the [`PublishWorker`] and returns
//! at once; the samples reach the bus later, from the worker thread.
//!
//! # Ownership
//!
//! ```text
//! framework ──owns──► BufferElement ──owns──► PublisherChannelElement
//!                          ▲                           │
//!                          └────────── weak ───────────┘
//! ```
//!
//! The worker holds the publisher's drain state (not the element itself)
//! until the element deregisters.
//!
//! # Failure policy
//!
//! A sample the bus refuses is dropped and logged.  Nothing is reported back
//! to the producing thread; there is no path to it.
//!
//! [`BufferElement`]: crate::buffer::BufferElement

use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock, Weak};

use flowbridge_types::{ConnPolicy, ElementId, Message, PortInfo, TransportError};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::{debug, warn};

use crate::bus::{Bus, ProducerHandle};
use crate::element::ChannelElement;
use crate::worker::{Drain, DrainReport, PublishTicket, PublishWorker};

/// State shared between the element and the worker.
struct PublisherCore<T: Message, B: Bus> {
    id: ElementId,
    topic: String,
    bus: Arc<B>,
    handle: ProducerHandle,
    input: OnceLock<Weak<dyn ChannelElement<T>>>,
    failure_log: DefaultDirectRateLimiter,
}

impl<T: Message, B: Bus> Drain for PublisherCore<T, B> {
    fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let Some(input) = self.input.get().and_then(Weak::upgrade) else {
            return report;
        };
        while let Some(sample) = input.read() {
            match self.bus.publish(&self.handle, &sample) {
                Ok(()) => report.published += 1,
                Err(source) => {
                    report.failed += 1;
                    if self.failure_log.check().is_ok() {
                        let err = TransportError::Publish {
                            topic: self.topic.clone(),
                            source,
                        };
                        warn!(element = %self.id, error = %err, "sample dropped");
                    }
                }
            }
        }
        report
    }
}

impl<T: Message, B: Bus> Drop for PublisherCore<T, B> {
    fn drop(&mut self) {
        self.bus.unadvertise(&self.handle);
    }
}

/// Channel element publishing everything its input buffer receives.
pub struct PublisherChannelElement<T: Message, B: Bus> {
    core: Arc<PublisherCore<T, B>>,
    ticket: PublishTicket,
    worker: Arc<PublishWorker>,
}

impl<T: Message, B: Bus> PublisherChannelElement<T, B> {
    /// Advertise `policy`'s topic on `bus` and register with `worker` under
    /// `id`.
    ///
    /// The topic must already be resolved; the factory fills in a default
    /// name before calling this.  `failure_log_per_sec` bounds how often a
    /// failing topic is reported.
    ///
    /// # Errors
    ///
    /// * [`TransportError::Configuration`] when the policy carries no topic.
    /// * [`TransportError::Registration`] when the bus refuses the producer;
    ///   nothing is registered with the worker in that case.
    pub fn new(
        port: &PortInfo,
        policy: &ConnPolicy,
        id: ElementId,
        bus: Arc<B>,
        worker: Arc<PublishWorker>,
        failure_log_per_sec: NonZeroU32,
    ) -> Result<Self, TransportError> {
        let topic = policy
            .topic_name()
            .ok_or_else(|| {
                TransportError::Configuration(format!(
                    "publisher for port {} has no topic name",
                    port.qualified_name()
                ))
            })?
            .to_string();

        debug!(port = %port.qualified_name(), topic = %topic, element = %id, "creating publisher");
        let handle = bus
            .advertise::<T>(&topic, policy.queue_depth(), policy.init)
            .map_err(|source| TransportError::Registration {
                topic: topic.clone(),
                source,
            })?;

        let core = Arc::new(PublisherCore {
            id,
            topic,
            bus,
            handle,
            input: OnceLock::new(),
            failure_log: RateLimiter::direct(Quota::per_second(failure_log_per_sec)),
        });
        let ticket = worker.add_publisher(id, core.clone());

        Ok(Self {
            core,
            ticket,
            worker,
        })
    }

    /// Connect the upstream buffer.  Returns `false` if already connected.
    pub fn set_input(&self, input: Weak<dyn ChannelElement<T>>) -> bool {
        self.core.input.set(input).is_ok()
    }

    pub fn topic(&self) -> &str {
        &self.core.topic
    }

    pub fn id(&self) -> ElementId {
        self.core.id
    }

    /// Whether a drain request is queued and not yet served.
    pub fn is_pending(&self) -> bool {
        self.ticket.is_pending()
    }
}

impl<T: Message, B: Bus> ChannelElement<T> for PublisherChannelElement<T, B> {
    fn signal(&self) -> bool {
        self.worker.request_publish(&self.ticket)
    }
}

impl<T: Message, B: Bus> Drop for PublisherChannelElement<T, B> {
    fn drop(&mut self) {
        debug!(topic = %self.core.topic, element = %self.core.id, "destroying publisher");
        // The producer handle goes with the core, after the worker let go.
        self.worker.remove_publisher(self.core.id);
    }
}
