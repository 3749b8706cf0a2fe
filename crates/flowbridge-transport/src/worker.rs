//! [`PublishWorker`] – the one thread that talks to the bus on behalf of all
//! publishers.
//!
//! Real-time producers must never call into the bus.  Instead a publisher's
//! `signal()` files a drain request here and returns immediately; the worker
//! thread later drains that publisher's buffer and performs the publish calls.
//!
//! # Request queue
//!
//! ```text
//! signal() ──► pending flag (AtomicBool) ──first set──► request channel ──► worker thread
//!                    ▲                                                           │
//!                    └──────────── cleared just before the drain starts ◄────────┘
//! ```
//!
//! * A publisher has at most one queued request; further signals coalesce
//!   until the worker picks it up.
//! * Requests are served in the order they were first queued.
//! * The flag is cleared *before* draining, so a sample written while a drain
//!   is running is covered by the next pass instead of being lost.
//!
//! # Registration
//!
//! Publishers are keyed by [`ElementId`].  [`PublishWorker::remove_publisher`]
//! synchronises with the worker so that removal happens strictly before or
//! strictly after any drain of the same publisher, never during one.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender};
use flowbridge_types::{ElementId, TransportError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

/// Thread name used by [`PublishWorker::instance`].
pub const DEFAULT_THREAD_NAME: &str = "flowbridge-publish";

type InstanceSlot = Mutex<Weak<PublishWorker>>;

static INSTANCE: InstanceSlot = parking_lot::const_mutex(Weak::new());

// ─────────────────────────────────────────────────────────────────────────────
// Public types
// ─────────────────────────────────────────────────────────────────────────────

/// Something the worker can drain.  Implemented by the publisher adapter.
pub trait Drain: Send + Sync {
    /// Publish everything currently buffered.  Only ever called on the worker
    /// thread, and never twice concurrently for the same element.
    fn drain(&self) -> DrainReport;
}

/// Result of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Samples handed to the bus successfully.
    pub published: u64,
    /// Samples the bus refused; they are dropped.
    pub failed: u64,
}

/// Cumulative counters of a worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub drain_passes: u64,
    pub published: u64,
    pub failed: u64,
}

/// Proof of registration handed to a publisher by
/// [`PublishWorker::add_publisher`].
///
/// Carries the publisher's pending flag so that requesting a drain needs no
/// lock.
#[derive(Debug, Clone)]
pub struct PublishTicket {
    id: ElementId,
    pending: Arc<AtomicBool>,
}

impl PublishTicket {
    pub fn id(&self) -> ElementId {
        self.id
    }

    /// Whether a drain request is queued and not yet picked up.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal state
// ─────────────────────────────────────────────────────────────────────────────

enum Request {
    Drain(ElementId),
    Flush(Sender<()>),
    Shutdown,
}

struct Entry {
    drain: Arc<dyn Drain>,
    pending: Arc<AtomicBool>,
}

#[derive(Default)]
struct WorkerState {
    publishers: HashMap<ElementId, Entry>,
    draining: Option<ElementId>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<WorkerState>,
    drained: Condvar,
    drain_passes: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    fn serve(&self, id: ElementId) {
        let (drain, pending) = {
            let mut state = self.state.lock();
            let Some(entry) = state.publishers.get(&id) else {
                trace!(element = %id, "skipping request of a deregistered publisher");
                return;
            };
            let claimed = (Arc::clone(&entry.drain), Arc::clone(&entry.pending));
            state.draining = Some(id);
            claimed
        };

        pending.store(false, Ordering::Release);
        match panic::catch_unwind(AssertUnwindSafe(|| drain.drain())) {
            Ok(report) => {
                self.drain_passes.fetch_add(1, Ordering::Relaxed);
                self.published.fetch_add(report.published, Ordering::Relaxed);
                self.failed.fetch_add(report.failed, Ordering::Relaxed);
                trace!(element = %id, published = report.published, failed = report.failed, "drain pass done");
            }
            Err(_) => error!(element = %id, "publisher drain panicked"),
        }
        // Released outside the lock: the last reference may release bus state.
        drop(drain);

        self.state.lock().draining = None;
        self.drained.notify_all();
    }
}

fn run(shared: Arc<Shared>, requests: Receiver<Request>) {
    for request in requests.iter() {
        match request {
            Request::Drain(id) => shared.serve(id),
            Request::Flush(done) => {
                let _ = done.send(());
            }
            Request::Shutdown => break,
        }
    }
    debug!("publish worker stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// PublishWorker
// ─────────────────────────────────────────────────────────────────────────────

/// Background thread serialising every publish call of the process.
///
/// Shared by all publishers through an [`Arc`]; the thread stops when the last
/// handle is dropped.
pub struct PublishWorker {
    shared: Arc<Shared>,
    requests: Sender<Request>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
    slot: Option<&'static InstanceSlot>,
}

impl PublishWorker {
    /// The process-wide worker, started on first use.
    ///
    /// Returns the running instance while any handle to it is alive, and
    /// starts a fresh one otherwise.
    pub fn instance() -> Result<Arc<Self>, TransportError> {
        Self::instance_named(DEFAULT_THREAD_NAME)
    }

    /// Like [`PublishWorker::instance`]; `thread_name` is only used if a new
    /// worker has to be started.
    ///
    /// While the previous instance is shutting down this blocks until its
    /// thread has stopped.
    pub fn instance_named(thread_name: &str) -> Result<Arc<Self>, TransportError> {
        Self::instance_in(&INSTANCE, thread_name)
    }

    fn instance_in(slot: &'static InstanceSlot, thread_name: &str) -> Result<Arc<Self>, TransportError> {
        let mut current = slot.lock();
        if let Some(worker) = current.upgrade() {
            return Ok(worker);
        }
        let worker = Self::start(thread_name, Some(slot))?;
        *current = Arc::downgrade(&worker);
        Ok(worker)
    }

    /// Start a private worker, independent of the process-wide instance.
    pub fn spawn(thread_name: &str) -> Result<Arc<Self>, TransportError> {
        Self::start(thread_name, None)
    }

    fn start(thread_name: &str, slot: Option<&'static InstanceSlot>) -> Result<Arc<Self>, TransportError> {
        let (requests, receiver) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || run(worker_shared, receiver))
            .map_err(|e| {
                TransportError::Configuration(format!("cannot start publish worker: {e}"))
            })?;
        let thread_id = thread.thread().id();
        debug!(thread = thread_name, "publish worker started");

        Ok(Arc::new(Self {
            shared,
            requests,
            thread: Some(thread),
            thread_id,
            slot,
        }))
    }

    /// Register a publisher.
    ///
    /// Registering an id that is already known changes nothing and returns a
    /// ticket sharing the existing registration.
    pub fn add_publisher(&self, id: ElementId, drain: Arc<dyn Drain>) -> PublishTicket {
        let mut state = self.shared.state.lock();
        let pending = match state.publishers.get(&id) {
            Some(entry) => {
                debug!(element = %id, "publisher already registered");
                Arc::clone(&entry.pending)
            }
            None => {
                let pending = Arc::new(AtomicBool::new(false));
                state.publishers.insert(
                    id,
                    Entry {
                        drain,
                        pending: Arc::clone(&pending),
                    },
                );
                pending
            }
        };
        PublishTicket { id, pending }
    }

    /// Deregister a publisher.
    ///
    /// Blocks while a drain of `id` is in progress.  Queued requests for `id`
    /// are discarded when the worker reaches them.  Called from inside a drain
    /// on the worker thread it does not wait, since the drain in progress is
    /// the caller's own.
    pub fn remove_publisher(&self, id: ElementId) -> bool {
        let mut state = self.shared.state.lock();
        let entry = state.publishers.remove(&id);
        if !self.is_worker_thread() {
            while state.draining == Some(id) {
                self.shared.drained.wait(&mut state);
            }
        }
        drop(state);
        entry.is_some()
    }

    /// Ask for a drain of the ticket's publisher.  Never blocks.
    ///
    /// Returns `false` only if the worker has already stopped.
    pub fn request_publish(&self, ticket: &PublishTicket) -> bool {
        if ticket.pending.swap(true, Ordering::AcqRel) {
            return true;
        }
        if self.requests.send(Request::Drain(ticket.id)).is_err() {
            ticket.pending.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Wait until every request queued before this call has been served.
    ///
    /// Returns immediately when called on the worker thread.
    pub fn flush(&self) {
        if self.is_worker_thread() {
            return;
        }
        let (done, wait) = crossbeam_channel::bounded(1);
        if self.requests.send(Request::Flush(done)).is_ok() {
            let _ = wait.recv();
        }
    }

    pub fn contains(&self, id: ElementId) -> bool {
        self.shared.state.lock().publishers.contains_key(&id)
    }

    pub fn publisher_count(&self) -> usize {
        self.shared.state.lock().publishers.len()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            drain_passes: self.shared.drain_passes.load(Ordering::Relaxed),
            published: self.shared.published.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Whether the calling thread is this worker's thread.
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for PublishWorker {
    fn drop(&mut self) {
        // The slot stays locked until the thread has stopped, so no second
        // instance runs alongside this one.
        let this: *const Self = self;
        let _slot = self.slot.map(|slot| {
            let mut current = slot.lock();
            if std::ptr::eq(current.as_ptr(), this) {
                *current = Weak::new();
            }
            current
        });
        let _ = self.requests.send(Request::Shutdown);
        let Some(thread) = self.thread.take() else {
            return;
        };
        // Dropped from inside a drain: the loop stops by itself once the
        // drain returns.
        if self.is_worker_thread() {
            return;
        }
        if thread.join().is_err() {
            error!("publish worker thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct CountingDrain {
        passes: AtomicUsize,
    }

    impl Drain for CountingDrain {
        fn drain(&self) -> DrainReport {
            self.passes.fetch_add(1, Ordering::SeqCst);
            DrainReport::default()
        }
    }

    /// Blocks inside `drain` until released, keeping the worker busy.
    struct BlockingDrain {
        started: Sender<()>,
        release: Receiver<()>,
    }

    impl Drain for BlockingDrain {
        fn drain(&self) -> DrainReport {
            let _ = self.started.send(());
            let _ = self.release.recv_timeout(TIMEOUT);
            DrainReport::default()
        }
    }

    struct OrderDrain {
        id: u32,
        log: Arc<Mutex<Vec<u32>>>,
    }

    impl Drain for OrderDrain {
        fn drain(&self) -> DrainReport {
            self.log.lock().push(self.id);
            DrainReport::default()
        }
    }

    /// Register a blocking drain and return (ticket, started, release).
    fn blocker(worker: &PublishWorker) -> (PublishTicket, Receiver<()>, Sender<()>) {
        let (started_tx, started_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let ticket = worker.add_publisher(
            ElementId::next(),
            Arc::new(BlockingDrain {
                started: started_tx,
                release: release_rx,
            }),
        );
        (ticket, started_rx, release_tx)
    }

    #[test]
    fn registering_twice_keeps_one_entry() -> Result<(), Box<dyn std::error::Error>> {
        let worker = PublishWorker::spawn("test-publish")?;
        let id = ElementId::next();
        let drain = Arc::new(CountingDrain::default());

        let first = worker.add_publisher(id, drain.clone());
        let second = worker.add_publisher(id, drain.clone());

        assert_eq!(worker.publisher_count(), 1);
        assert!(worker.contains(id));
        assert!(
            Arc::ptr_eq(&first.pending, &second.pending),
            "both tickets share one registration"
        );
        Ok(())
    }

    #[test]
    fn repeated_signals_coalesce_into_one_pass() -> Result<(), Box<dyn std::error::Error>> {
        let worker = PublishWorker::spawn("test-publish")?;
        let (busy, started, release) = blocker(&worker);
        let counting = Arc::new(CountingDrain::default());
        let ticket = worker.add_publisher(ElementId::next(), counting.clone());

        worker.request_publish(&busy);
        started.recv_timeout(TIMEOUT)?;

        for _ in 0..6 {
            assert!(worker.request_publish(&ticket));
        }
        assert!(ticket.is_pending());

        release.send(())?;
        worker.flush();

        assert_eq!(counting.passes.load(Ordering::SeqCst), 1);
        assert!(!ticket.is_pending());
        assert_eq!(worker.stats().drain_passes, 2);
        Ok(())
    }

    #[test]
    fn requests_are_served_in_first_enqueue_order() -> Result<(), Box<dyn std::error::Error>> {
        let worker = PublishWorker::spawn("test-publish")?;
        let (busy, started, release) = blocker(&worker);
        let log = Arc::new(Mutex::new(Vec::new()));
        let tickets: Vec<_> = (1..=3)
            .map(|id| {
                worker.add_publisher(
                    ElementId::next(),
                    Arc::new(OrderDrain {
                        id,
                        log: Arc::clone(&log),
                    }),
                )
            })
            .collect();

        worker.request_publish(&busy);
        started.recv_timeout(TIMEOUT)?;
        worker.request_publish(&tickets[1]);
        worker.request_publish(&tickets[0]);
        worker.request_publish(&tickets[1]);
        worker.request_publish(&tickets[2]);

        release.send(())?;
        worker.flush();
        assert_eq!(*log.lock(), vec![2, 1, 3]);
        Ok(())
    }

    #[test]
    fn removal_waits_for_running_drain() -> Result<(), Box<dyn std::error::Error>> {
        let worker = PublishWorker::spawn("test-publish")?;
        let (busy, started, release) = blocker(&worker);

        worker.request_publish(&busy);
        started.recv_timeout(TIMEOUT)?;

        let removed = Arc::new(AtomicBool::new(false));
        let remover = {
            let worker = Arc::clone(&worker);
            let removed = Arc::clone(&removed);
            let id = busy.id();
            thread::spawn(move || {
                worker.remove_publisher(id);
                removed.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!removed.load(Ordering::SeqCst), "removal must wait for the drain");

        release.send(())?;
        remover.join().map_err(|_| "remover panicked")?;
        assert!(removed.load(Ordering::SeqCst));
        assert!(!worker.contains(busy.id()));
        Ok(())
    }

    #[test]
    fn removed_publisher_is_never_drained() -> Result<(), Box<dyn std::error::Error>> {
        let worker = PublishWorker::spawn("test-publish")?;
        let (busy, started, release) = blocker(&worker);
        let counting = Arc::new(CountingDrain::default());
        let ticket = worker.add_publisher(ElementId::next(), counting.clone());

        worker.request_publish(&busy);
        started.recv_timeout(TIMEOUT)?;
        worker.request_publish(&ticket);
        assert!(worker.remove_publisher(ticket.id()));
        assert!(!worker.remove_publisher(ticket.id()), "second removal is a no-op");

        release.send(())?;
        worker.flush();
        assert_eq!(counting.passes.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn next_instance_waits_for_the_previous_to_stop() -> Result<(), Box<dyn std::error::Error>> {
        static SLOT: InstanceSlot = parking_lot::const_mutex(Weak::new());
        let first = PublishWorker::instance_in(&SLOT, "test-instance")?;
        let (busy, started, release) = blocker(&first);
        first.request_publish(&busy);
        started.recv_timeout(TIMEOUT)?;

        let dropper = thread::spawn(move || drop(first));
        let deadline = std::time::Instant::now() + TIMEOUT;
        while SLOT.try_lock().is_some() {
            assert!(std::time::Instant::now() < deadline, "drop never took the slot");
            thread::sleep(Duration::from_millis(1));
        }

        let second_ready = Arc::new(AtomicBool::new(false));
        let second = {
            let second_ready = Arc::clone(&second_ready);
            thread::spawn(move || {
                let worker = PublishWorker::instance_in(&SLOT, "test-instance");
                second_ready.store(true, Ordering::SeqCst);
                worker
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!second_ready.load(Ordering::SeqCst), "old worker is still draining");

        release.send(())?;
        dropper.join().map_err(|_| "dropper panicked")?;
        let second = second.join().map_err(|_| "second caller panicked")??;
        assert_eq!(second.publisher_count(), 0);
        Ok(())
    }

    #[test]
    fn instance_is_shared_while_alive() -> Result<(), Box<dyn std::error::Error>> {
        let a = PublishWorker::instance()?;
        let b = PublishWorker::instance()?;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!a.is_worker_thread());
        Ok(())
    }
}
