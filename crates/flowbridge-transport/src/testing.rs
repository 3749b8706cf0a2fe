//! Scriptable [`Bus`] used by the unit tests of this crate.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use flowbridge_types::{BusError, Message};
use parking_lot::Mutex;

use crate::bus::{Bus, Callback, ConsumerHandle, ProducerHandle};

const HOLD_TIMEOUT: Duration = Duration::from_secs(2);

type FailPredicate = Box<dyn Fn(&dyn Any) -> bool + Send>;

#[derive(Default)]
struct RecordingState {
    published: Vec<(String, Box<dyn Any + Send>)>,
    producers: HashMap<u64, String>,
    subscriptions: HashMap<u64, (String, Arc<dyn Any + Send + Sync>)>,
    advertised: Vec<(String, usize, bool)>,
    subscribed: Vec<(String, usize)>,
    rejected_topics: HashSet<String>,
    fail_when: Option<FailPredicate>,
}

/// Records every bus interaction and lets tests deliver messages by hand.
#[derive(Default)]
pub(crate) struct RecordingBus {
    state: Mutex<RecordingState>,
    hold: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    next: AtomicU64,
}

impl RecordingBus {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make advertise/subscribe on `topic` fail.
    pub(crate) fn reject_topic(&self, topic: &str) {
        self.state.lock().rejected_topics.insert(topic.to_string());
    }

    /// Make publishing fail for every sample matching `predicate`.
    pub(crate) fn fail_when<T: Message>(&self, predicate: impl Fn(&T) -> bool + Send + 'static) {
        self.state.lock().fail_when = Some(Box::new(move |sample: &dyn Any| {
            sample.downcast_ref::<T>().is_some_and(&predicate)
        }));
    }

    /// Block every publish call until the test releases it.
    ///
    /// Returns a receiver signalled when a publish starts and a sender that
    /// lets one publish proceed per message.
    pub(crate) fn hold_publishes(&self) -> (Receiver<()>, Sender<()>) {
        let (started_tx, started_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        *self.hold.lock() = Some((started_tx, release_rx));
        (started_rx, release_tx)
    }

    /// Samples successfully published on `topic`, in publish order.
    pub(crate) fn published<T: Message>(&self, topic: &str) -> Vec<T> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, sample)| sample.downcast_ref::<T>().cloned())
            .collect()
    }

    pub(crate) fn producer_count(&self) -> usize {
        self.state.lock().producers.len()
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub(crate) fn last_advertise(&self) -> Option<(String, usize, bool)> {
        self.state.lock().advertised.last().cloned()
    }

    pub(crate) fn last_subscribe(&self) -> Option<(String, usize)> {
        self.state.lock().subscribed.last().cloned()
    }

    /// The callback currently registered on `topic`, if any.
    pub(crate) fn callback<T: Message>(&self, topic: &str) -> Option<Arc<Callback<T>>> {
        self.state
            .lock()
            .subscriptions
            .values()
            .find(|(t, _)| t == topic)
            .and_then(|(_, callback)| Arc::clone(callback).downcast::<Callback<T>>().ok())
    }

    /// Invoke every callback registered on `topic`, the way a bus runtime
    /// thread would.  Returns the number of callbacks invoked.
    pub(crate) fn deliver<T: Message>(&self, topic: &str, message: &T) -> usize {
        let callbacks: Vec<_> = self
            .state
            .lock()
            .subscriptions
            .values()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, callback)| Arc::clone(callback).downcast::<Callback<T>>().ok())
            .collect();
        for callback in &callbacks {
            callback(message);
        }
        callbacks.len()
    }

    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Bus for RecordingBus {
    fn advertise<T: Message>(
        &self,
        topic: &str,
        queue_depth: usize,
        latch: bool,
    ) -> Result<ProducerHandle, BusError> {
        let mut state = self.state.lock();
        if state.rejected_topics.contains(topic) {
            return Err(BusError::InvalidTopic(topic.to_string()));
        }
        let id = self.next_id();
        state.producers.insert(id, topic.to_string());
        state.advertised.push((topic.to_string(), queue_depth, latch));
        Ok(ProducerHandle::new(id, topic))
    }

    fn publish<T: Message>(&self, handle: &ProducerHandle, sample: &T) -> Result<(), BusError> {
        let hold = self.hold.lock().clone();
        if let Some((started, release)) = hold {
            let _ = started.send(());
            let _ = release.recv_timeout(HOLD_TIMEOUT);
        }

        let mut state = self.state.lock();
        if !state.producers.contains_key(&handle.id()) {
            return Err(BusError::UnknownHandle(handle.id()));
        }
        if state.fail_when.as_ref().is_some_and(|fail| fail(sample as &dyn Any)) {
            return Err(BusError::Exhausted("rejected by recording bus".to_string()));
        }
        state
            .published
            .push((handle.name().to_string(), Box::new(sample.clone())));
        Ok(())
    }

    fn unadvertise(&self, handle: &ProducerHandle) {
        self.state.lock().producers.remove(&handle.id());
    }

    fn subscribe<T: Message>(
        &self,
        topic: &str,
        queue_depth: usize,
        callback: Callback<T>,
    ) -> Result<ConsumerHandle, BusError> {
        let mut state = self.state.lock();
        if state.rejected_topics.contains(topic) {
            return Err(BusError::InvalidTopic(topic.to_string()));
        }
        let id = self.next_id();
        let callback: Arc<dyn Any + Send + Sync> = Arc::new(callback);
        state.subscriptions.insert(id, (topic.to_string(), callback));
        state.subscribed.push((topic.to_string(), queue_depth));
        Ok(ConsumerHandle::new(id, topic))
    }

    fn unsubscribe(&self, handle: &ConsumerHandle) {
        self.state.lock().subscriptions.remove(&handle.id());
    }
}
