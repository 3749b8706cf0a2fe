//! The channel element capability.
//!
//! A transport leg is a chain of exactly two elements: a [`BufferElement`]
//! and a bus adapter.  Data flows from the upstream element to the
//! downstream one; `signal` travels the same way and tells the downstream
//! element that there is something to pick up.
//!
//! [`BufferElement`]: crate::buffer::BufferElement

use flowbridge_types::Message;

/// Outcome of [`ChannelElement::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The sample was stored.
    Written,
    /// The sample was stored and an older, unread sample was discarded.
    Overwritten,
    /// The element is full; the sample was dropped.
    Rejected,
    /// The element does not store samples.
    NotConnected,
}

impl WriteStatus {
    /// Whether the written sample is now available to readers.
    pub fn is_stored(self) -> bool {
        matches!(self, WriteStatus::Written | WriteStatus::Overwritten)
    }
}

/// Every link of a transport chain implements this trait.
///
/// # Contract
///
/// * `signal` may be called from a real-time thread and must return without
///   blocking, allocating without bound, or doing I/O.
/// * `write` and `read` are non-blocking; elements that do not store data keep
///   the defaults.
pub trait ChannelElement<T: Message>: Send + Sync {
    /// Whether the element can accept data right now.
    fn input_ready(&self) -> bool {
        true
    }

    /// Offer a representative sample ahead of the first write so the element
    /// can size its storage.
    fn data_sample(&self, _sample: &T) -> bool {
        true
    }

    /// Notification that new data is available upstream.
    fn signal(&self) -> bool;

    /// Store one sample.
    fn write(&self, _sample: T) -> WriteStatus {
        WriteStatus::NotConnected
    }

    /// Take the oldest stored sample, if any.
    fn read(&self) -> Option<T> {
        None
    }
}
