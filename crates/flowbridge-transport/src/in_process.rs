//! Loopback publish/subscribe bus.
//!
//! [`InProcessBus`] implements [`Bus`] and [`ServiceHost`] entirely inside
//! the current process.  Every topic is a [`tokio::sync::broadcast`] channel,
//! so one slow subscription never blocks the others; each subscription is
//! served by its own task on a small, bus-owned Tokio runtime.  Those runtime
//! threads are the "bus callback threads" the subscriber adapter has to
//! tolerate.
//!
//! # Features
//!
//! | Feature | Behaviour |
//! |---|---|
//! | Type safety | A topic is bound to the payload type of its first registrant; registering another type fails with [`BusError::TypeMismatch`] |
//! | Latching | A producer advertised with `latch` keeps the last sample and late subscribers receive it first |
//! | Lag | A subscription that falls more than the queue depth behind skips ahead and logs a warning |
//! | Services | JSON request/response handlers, called synchronously on the caller's thread |

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use flowbridge_types::{BusError, Message};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{
    Bus, Callback, ConsumerHandle, ProducerHandle, ServiceHandle, ServiceHandler, ServiceHost,
    validate_name,
};

/// Number of dispatch threads used by [`InProcessBus::new`].
const DEFAULT_DISPATCH_THREADS: usize = 2;

/// Upper bound on a topic's broadcast capacity.
const MAX_QUEUE_DEPTH: usize = 1 << 16;

type Sample = Arc<dyn Any + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Internal bookkeeping
// ─────────────────────────────────────────────────────────────────────────────

struct TopicEntry {
    type_id: TypeId,
    type_name: &'static str,
    sender: broadcast::Sender<Sample>,
    latched: Option<Sample>,
    producers: usize,
    consumers: usize,
}

struct ProducerEntry {
    topic: String,
    latch: bool,
}

struct ConsumerEntry {
    topic: String,
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, TopicEntry>,
    producers: HashMap<u64, ProducerEntry>,
    consumers: HashMap<u64, ConsumerEntry>,
    services: HashMap<String, (u64, ServiceHandler)>,
}

impl BusState {
    /// Look up `topic`, creating it for `T` when absent.
    fn topic_for<T: Message>(
        &mut self,
        topic: &str,
        queue_depth: usize,
    ) -> Result<&mut TopicEntry, BusError> {
        let entry = self.topics.entry(topic.to_string()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(queue_depth.clamp(1, MAX_QUEUE_DEPTH));
            TopicEntry {
                type_id: TypeId::of::<T>(),
                type_name: std::any::type_name::<T>(),
                sender,
                latched: None,
                producers: 0,
                consumers: 0,
            }
        });
        if entry.type_id != TypeId::of::<T>() {
            return Err(BusError::TypeMismatch {
                topic: topic.to_string(),
                existing: entry.type_name.to_string(),
                requested: std::any::type_name::<T>().to_string(),
            });
        }
        Ok(entry)
    }

    /// Forget `topic` once nobody produces or consumes it any more.
    fn collect(&mut self, topic: &str) {
        let unused = self
            .topics
            .get(topic)
            .is_some_and(|entry| entry.producers == 0 && entry.consumers == 0);
        if unused {
            self.topics.remove(topic);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// InProcessBus
// ─────────────────────────────────────────────────────────────────────────────

/// In-process bus backed by Tokio broadcast channels.
///
/// Share it behind an [`Arc`]; every adapter keeps a reference for as long as
/// it holds a registration.
pub struct InProcessBus {
    state: Mutex<BusState>,
    next_handle: AtomicU64,
    runtime: Option<Runtime>,
}

impl InProcessBus {
    /// Create a bus with the default number of dispatch threads.
    pub fn new() -> Result<Self, BusError> {
        Self::with_dispatch_threads(DEFAULT_DISPATCH_THREADS)
    }

    /// Create a bus whose callbacks run on `threads` dispatch threads.
    pub fn with_dispatch_threads(threads: usize) -> Result<Self, BusError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("flowbridge-bus")
            .enable_all()
            .build()
            .map_err(|e| BusError::Exhausted(format!("bus dispatch runtime: {e}")))?;
        Ok(Self {
            state: Mutex::new(BusState::default()),
            next_handle: AtomicU64::new(1),
            runtime: Some(runtime),
        })
    }

    /// Whether `topic` currently has any producer or consumer.
    pub fn has_topic(&self, topic: &str) -> bool {
        self.state.lock().topics.contains_key(topic)
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map_or(0, |entry| entry.consumers)
    }

    /// Number of live producer registrations on `topic`.
    pub fn producer_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map_or(0, |entry| entry.producers)
    }

    fn next_id(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl Bus for InProcessBus {
    fn advertise<T: Message>(
        &self,
        topic: &str,
        queue_depth: usize,
        latch: bool,
    ) -> Result<ProducerHandle, BusError> {
        validate_name(topic)?;
        let mut state = self.state.lock();
        state.topic_for::<T>(topic, queue_depth)?.producers += 1;

        let id = self.next_id();
        state.producers.insert(
            id,
            ProducerEntry {
                topic: topic.to_string(),
                latch,
            },
        );
        debug!(topic, handle = id, latch, "producer advertised");
        Ok(ProducerHandle::new(id, topic))
    }

    fn publish<T: Message>(&self, handle: &ProducerHandle, sample: &T) -> Result<(), BusError> {
        let mut state = self.state.lock();
        let latch = state
            .producers
            .get(&handle.id())
            .map(|producer| producer.latch)
            .ok_or(BusError::UnknownHandle(handle.id()))?;
        let entry = state
            .topics
            .get_mut(handle.name())
            .ok_or(BusError::UnknownHandle(handle.id()))?;
        if entry.type_id != TypeId::of::<T>() {
            return Err(BusError::TypeMismatch {
                topic: handle.name().to_string(),
                existing: entry.type_name.to_string(),
                requested: std::any::type_name::<T>().to_string(),
            });
        }

        let sample: Sample = Arc::new(sample.clone());
        if latch {
            entry.latched = Some(Arc::clone(&sample));
        }
        // Nobody listening is a normal condition on a pub/sub bus.
        let _ = entry.sender.send(sample);
        Ok(())
    }

    fn unadvertise(&self, handle: &ProducerHandle) {
        let mut state = self.state.lock();
        let Some(producer) = state.producers.remove(&handle.id()) else {
            return;
        };
        if let Some(entry) = state.topics.get_mut(&producer.topic) {
            entry.producers = entry.producers.saturating_sub(1);
        }
        state.collect(&producer.topic);
        debug!(topic = %producer.topic, handle = handle.id(), "producer released");
    }

    fn subscribe<T: Message>(
        &self,
        topic: &str,
        queue_depth: usize,
        callback: Callback<T>,
    ) -> Result<ConsumerHandle, BusError> {
        validate_name(topic)?;
        let runtime = self.runtime.as_ref().ok_or(BusError::Closed)?;
        let mut state = self.state.lock();
        let entry = state.topic_for::<T>(topic, queue_depth)?;
        let receiver = entry.sender.subscribe();
        let latched = entry.latched.clone();
        entry.consumers += 1;

        let id = self.next_id();
        let cancelled = Arc::new(AtomicBool::new(false));
        let task = runtime.spawn(dispatch(
            topic.to_string(),
            receiver,
            latched,
            Arc::clone(&cancelled),
            callback,
        ));
        state.consumers.insert(
            id,
            ConsumerEntry {
                topic: topic.to_string(),
                cancelled,
                task,
            },
        );
        debug!(topic, handle = id, "subscription registered");
        Ok(ConsumerHandle::new(id, topic))
    }

    fn unsubscribe(&self, handle: &ConsumerHandle) {
        let mut state = self.state.lock();
        let Some(consumer) = state.consumers.remove(&handle.id()) else {
            return;
        };
        // `abort` only lands at the task's next await, and `recv` does not
        // yield while samples are queued.  The flag stops delivery at once.
        consumer.cancelled.store(true, Ordering::Release);
        consumer.task.abort();
        if let Some(entry) = state.topics.get_mut(&consumer.topic) {
            entry.consumers = entry.consumers.saturating_sub(1);
        }
        state.collect(&consumer.topic);
        debug!(topic = %consumer.topic, handle = handle.id(), "subscription released");
    }
}

impl ServiceHost for InProcessBus {
    fn advertise_service(&self, name: &str, handler: ServiceHandler) -> Result<ServiceHandle, BusError> {
        validate_name(name)?;
        let mut state = self.state.lock();
        if state.services.contains_key(name) {
            return Err(BusError::DuplicateService(name.to_string()));
        }
        let id = self.next_id();
        state.services.insert(name.to_string(), (id, handler));
        debug!(service = name, handle = id, "service advertised");
        Ok(ServiceHandle::new(id, name))
    }

    fn call_service(&self, name: &str, request: Value) -> Result<Value, BusError> {
        let handler = self
            .state
            .lock()
            .services
            .get(name)
            .map(|(_, handler)| Arc::clone(handler))
            .ok_or_else(|| BusError::ServiceNotFound(name.to_string()))?;
        handler(request)
    }

    fn unadvertise_service(&self, handle: &ServiceHandle) {
        let mut state = self.state.lock();
        let owned = state
            .services
            .get(handle.name())
            .is_some_and(|(id, _)| *id == handle.id());
        if owned {
            state.services.remove(handle.name());
        }
    }
}

impl Drop for InProcessBus {
    fn drop(&mut self) {
        for (_, consumer) in self.state.get_mut().consumers.drain() {
            consumer.cancelled.store(true, Ordering::Release);
            consumer.task.abort();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────────────────

async fn dispatch<T: Message>(
    topic: String,
    mut receiver: broadcast::Receiver<Sample>,
    latched: Option<Sample>,
    cancelled: Arc<AtomicBool>,
    callback: Callback<T>,
) {
    let live = || !cancelled.load(Ordering::Acquire);
    if let Some(sample) = latched
        && live()
    {
        deliver(&callback, &sample);
    }
    loop {
        match receiver.recv().await {
            Ok(_) if !live() => break,
            Ok(sample) => deliver(&callback, &sample),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(topic = %topic, lagged_by = n, "subscription lagged, messages skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn deliver<T: Message>(callback: &Callback<T>, sample: &Sample) {
    if let Some(message) = (**sample).downcast_ref::<T>() {
        callback(message);
    }
}
