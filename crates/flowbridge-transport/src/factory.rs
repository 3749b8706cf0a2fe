//! [`TransportFactory`] – builds one transport leg per port connection.
//!
//! | Direction   | Chain                                       | Framework side     |
//! |-------------|---------------------------------------------|--------------------|
//! | `Publish`   | `BufferElement` → `PublisherChannelElement`   | writes into head   |
//! | `Subscribe` | `SubscriberChannelElement` → `BufferElement`  | reads from buffer  |
//!
//! On the publish side the policy's capacity is the bus queue depth.  The
//! buffer in front of the publisher holds at least
//! [`DEFAULT_PUBLISH_BUFFER`] samples (or the configured
//! `publish_buffer_capacity`), so a burst written between two drain passes
//! is not cut down to the queue depth.
//!
//! The factory never blocks except inside the bus registration call, and it
//! leaves nothing registered when it fails.

use std::num::NonZeroU32;
use std::sync::Arc;

use flowbridge_types::{ConnKind, ConnPolicy, Direction, ElementId, Message, PortInfo, TransportError};
use tracing::info;

use crate::buffer::BufferElement;
use crate::bus::Bus;
use crate::config::TransportConfig;
use crate::element::ChannelElement;
use crate::naming::TopicNamer;
use crate::publisher::PublisherChannelElement;
use crate::subscriber::SubscriberChannelElement;
use crate::worker::PublishWorker;

/// Default minimum size of a publish-side buffer.
pub const DEFAULT_PUBLISH_BUFFER: usize = 64;

/// A connected transport leg.  Dropping it tears the leg down.
pub struct ChannelStream<T: Message> {
    head: Arc<dyn ChannelElement<T>>,
    buffer: Arc<BufferElement<T>>,
    topic: String,
    direction: Direction,
}

impl<T: Message> ChannelStream<T> {
    /// First element of the chain.  On the publish side that is the buffer
    /// the port writes into.
    pub fn head(&self) -> &Arc<dyn ChannelElement<T>> {
        &self.head
    }

    /// The chain's buffer: written by the port when publishing, read by the
    /// port when subscribing.
    pub fn buffer(&self) -> &Arc<BufferElement<T>> {
        &self.buffer
    }

    /// Resolved topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Write one sample and notify the chain.  Publish side only; safe to
    /// call from a real-time thread.
    pub fn push(&self, sample: T) -> bool {
        let stored = self.buffer.write(sample).is_stored();
        self.buffer.signal();
        stored
    }

    /// Take the oldest received sample, if any.
    pub fn pop(&self) -> Option<T> {
        self.buffer.read()
    }
}

/// Builds transport legs on top of one bus.
pub struct TransportFactory<B: Bus> {
    bus: Arc<B>,
    worker: Arc<PublishWorker>,
    namer: TopicNamer,
    failure_log_per_sec: NonZeroU32,
    publish_buffer: usize,
}

impl<B: Bus> TransportFactory<B> {
    pub fn new(bus: Arc<B>, worker: Arc<PublishWorker>, namer: TopicNamer) -> Self {
        Self {
            bus,
            worker,
            namer,
            failure_log_per_sec: NonZeroU32::MIN,
            publish_buffer: DEFAULT_PUBLISH_BUFFER,
        }
    }

    /// Factory using the process-wide worker and the settings of `config`.
    pub fn from_config(bus: Arc<B>, config: &TransportConfig) -> Result<Self, TransportError> {
        let worker = PublishWorker::instance_named(&config.worker_thread)?;
        Ok(Self::new(bus, worker, config.namer())
            .with_failure_log_rate(config.failure_log_rate())
            .with_publish_buffer(config.publish_buffer_capacity))
    }

    pub fn with_failure_log_rate(mut self, per_second: NonZeroU32) -> Self {
        self.failure_log_per_sec = per_second;
        self
    }

    /// Minimum size of publish-side buffers (at least one).
    pub fn with_publish_buffer(mut self, capacity: usize) -> Self {
        self.publish_buffer = capacity.max(1);
        self
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    pub fn worker(&self) -> &Arc<PublishWorker> {
        &self.worker
    }

    pub fn namer(&self) -> &TopicNamer {
        &self.namer
    }

    /// Build the chain for one connection of `port`.
    ///
    /// A sender without a topic gets a default name; a receiver must be
    /// given one.
    ///
    /// # Errors
    ///
    /// * [`TransportError::Configuration`] for a receiver without topic.
    /// * [`TransportError::Registration`] when the bus refuses the topic.
    pub fn create_stream<T: Message>(
        &self,
        port: &PortInfo,
        policy: &ConnPolicy,
        is_sender: bool,
    ) -> Result<ChannelStream<T>, TransportError> {
        if is_sender {
            self.create_publish_stream(port, policy)
        } else {
            self.create_subscribe_stream(port, policy)
        }
    }

    fn create_publish_stream<T: Message>(
        &self,
        port: &PortInfo,
        policy: &ConnPolicy,
    ) -> Result<ChannelStream<T>, TransportError> {
        let id = ElementId::next();
        let topic = match policy.topic_name() {
            Some(topic) => topic.to_string(),
            None => self.namer.name_for(port, id),
        };
        let resolved = policy.clone().with_topic(topic.clone());

        let publisher = Arc::new(PublisherChannelElement::<T, B>::new(
            port,
            &resolved,
            id,
            Arc::clone(&self.bus),
            Arc::clone(&self.worker),
            self.failure_log_per_sec,
        )?);
        let capacity = match resolved.kind {
            ConnKind::Data => 1,
            ConnKind::Buffer => resolved.queue_depth().max(self.publish_buffer),
        };
        let buffer = Arc::new(BufferElement::<T>::with_capacity(capacity, resolved.kind));
        let input: Arc<dyn ChannelElement<T>> = buffer.clone();
        publisher.set_input(Arc::downgrade(&input));
        buffer.set_output(publisher);

        info!(port = %port.qualified_name(), topic = %topic, "publish stream created");
        Ok(ChannelStream {
            head: input,
            buffer,
            topic,
            direction: Direction::Publish,
        })
    }

    fn create_subscribe_stream<T: Message>(
        &self,
        port: &PortInfo,
        policy: &ConnPolicy,
    ) -> Result<ChannelStream<T>, TransportError> {
        let buffer = Arc::new(BufferElement::<T>::new(policy));
        let subscriber = SubscriberChannelElement::<T, B>::new(
            port,
            policy,
            Arc::clone(&self.bus),
            buffer.clone(),
        )?;
        let topic = subscriber.topic().to_string();

        info!(port = %port.qualified_name(), topic = %topic, "subscribe stream created");
        Ok(ChannelStream {
            head: Arc::new(subscriber),
            buffer,
            topic,
            direction: Direction::Subscribe,
        })
    }
}
