//! [`BufferElement`] – the timing decoupling point of a transport leg.
//!
//! A real-time writer pushes samples in without taking a lock; the publish
//! worker (or the consuming component, on the subscribe side) pops them out
//! from another thread.  Storage is a fixed-size
//! [`crossbeam_queue::ArrayQueue`] allocated once at construction.

use std::sync::{Arc, OnceLock};

use crossbeam_queue::ArrayQueue;
use flowbridge_types::{ConnKind, ConnPolicy, Message};

use crate::element::{ChannelElement, WriteStatus};

/// Bounded, lock-free FIFO between two channel elements.
///
/// The buffer owns its downstream element: on the publish side that is the
/// publisher adapter, which only keeps a weak back-link to the buffer.
pub struct BufferElement<T: Message> {
    queue: ArrayQueue<T>,
    kind: ConnKind,
    output: OnceLock<Arc<dyn ChannelElement<T>>>,
}

impl<T: Message> BufferElement<T> {
    /// Size the buffer from a connection policy.
    ///
    /// [`ConnKind::Data`] always holds a single sample; [`ConnKind::Buffer`]
    /// holds `policy.queue_depth()` samples.
    pub fn new(policy: &ConnPolicy) -> Self {
        let capacity = match policy.kind {
            ConnKind::Data => 1,
            ConnKind::Buffer => policy.queue_depth(),
        };
        Self::with_capacity(capacity, policy.kind)
    }

    /// Build a buffer of `capacity` samples (minimum one).
    pub fn with_capacity(capacity: usize, kind: ConnKind) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            kind,
            output: OnceLock::new(),
        }
    }

    /// Connect the downstream element.  Returns `false` if one is already set.
    pub fn set_output(&self, output: Arc<dyn ChannelElement<T>>) -> bool {
        self.output.set(output).is_ok()
    }

    /// The downstream element, if connected.
    pub fn output(&self) -> Option<&Arc<dyn ChannelElement<T>>> {
        self.output.get()
    }

    /// Number of samples currently stored.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }
}

impl<T: Message> ChannelElement<T> for BufferElement<T> {
    fn input_ready(&self) -> bool {
        self.output().is_none_or(|output| output.input_ready())
    }

    fn data_sample(&self, sample: &T) -> bool {
        self.output().is_none_or(|output| output.data_sample(sample))
    }

    fn signal(&self) -> bool {
        self.output().is_none_or(|output| output.signal())
    }

    fn write(&self, sample: T) -> WriteStatus {
        match self.kind {
            ConnKind::Data => match self.queue.force_push(sample) {
                Some(_) => WriteStatus::Overwritten,
                None => WriteStatus::Written,
            },
            ConnKind::Buffer => match self.queue.push(sample) {
                Ok(()) => WriteStatus::Written,
                Err(_) => WriteStatus::Rejected,
            },
        }
    }

    fn read(&self) -> Option<T> {
        self.queue.pop()
    }
}
