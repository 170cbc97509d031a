//! The gatherer: many producers, one lazily started drain worker, one callback.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_queue::SegQueue;
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram};
use tokio::sync::Notify;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::spawn::{Job, Spawn, ThreadSpawner, TokioSpawner};
use super::state::{Claim, Lifecycle, Retire, WorkerState};
use crate::config::{GathererConfig, SpawnMode};
use crate::error::{CallbackError, Error, Result};
use crate::observer::{Failure, FailureObserver, LogObserver};
use crate::telemetry::gather::{record_batch, record_drain_totals, start_drain_span};
use crate::telemetry::metrics;

type Callback<T> = Box<dyn Fn(T) -> anyhow::Result<()> + Send + Sync>;

struct Ticketed<T> {
    ticket: u64,
    item: T,
}

/// Point-in-time counters for one gatherer.
///
/// Read while producers are active, the fields may be mutually inconsistent.
/// Once the gatherer is idle and producers have stopped,
/// `processed == enqueued`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub enqueued: u64,
    /// Items passed to the callback, including the ones that failed.
    pub processed: u64,
    pub failed: u64,
    /// Worker activations started through the spawner.
    pub workers_spawned: u64,
    /// Activations drained outside a worker because the spawner rejected or
    /// dropped them.
    pub inline_drains: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    workers_spawned: AtomicU64,
    inline_drains: AtomicU64,
}

struct Instruments {
    enqueued: Counter<u64>,
    processed: Counter<u64>,
    failures: Counter<u64>,
    spawned: Counter<u64>,
    batch_size: Histogram<u64>,
    labels: Vec<KeyValue>,
}

impl Instruments {
    fn new(gatherer: &str) -> Self {
        Self {
            enqueued: metrics::items_enqueued(),
            processed: metrics::items_processed(),
            failures: metrics::callback_failures(),
            spawned: metrics::workers_spawned(),
            batch_size: metrics::drain_batch_size(),
            labels: vec![KeyValue::new("gatherer", gatherer.to_string())],
        }
    }

    fn labels_with(&self, key: &'static str, value: &'static str) -> Vec<KeyValue> {
        let mut labels = self.labels.clone();
        labels.push(KeyValue::new(key, value));
        labels
    }
}

struct Shared<T> {
    name: String,
    queue: SegQueue<Ticketed<T>>,
    state: WorkerState,
    next_ticket: AtomicU64,
    callback: Callback<T>,
    observer: Arc<dyn FailureObserver>,
    spawner: Arc<dyn Spawn>,
    counters: Counters,
    instruments: Instruments,
    idle: IdleSignal,
}

/// Wakes `wait_idle` callers when a worker retires to idle.
#[derive(Default)]
struct IdleSignal {
    lock: Mutex<()>,
    cond: Condvar,
    notify: Notify,
}

impl IdleSignal {
    fn raise(&self) {
        // Taken after the retire so a waiter that saw `Running` under the
        // lock is already parked on the condvar.
        drop(self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        self.cond.notify_all();
        self.notify.notify_waiters();
    }
}

/// A claimed worker activation handed to the spawner.
///
/// If the spawner drops it without running it (a shut-down tokio runtime, a
/// failed thread spawn), the claim is drained on the dropping thread.
struct Activation<T: Send + 'static> {
    shared: Option<Arc<Shared<T>>>,
    worker_id: Uuid,
}

impl<T: Send + 'static> Activation<T> {
    fn run(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.drain(self.worker_id);
        }
    }
}

impl<T: Send + 'static> Drop for Activation<T> {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        shared.counters.workers_spawned.fetch_sub(1, Ordering::Relaxed);
        shared.counters.inline_drains.fetch_add(1, Ordering::Relaxed);
        shared
            .instruments
            .spawned
            .add(1, &shared.instruments.labels_with("mode", "inline"));
        warn!(
            gatherer = %shared.name,
            worker_id = %self.worker_id,
            "worker dropped before it ran, draining on this thread"
        );
        shared.drain(self.worker_id);
    }
}

/// Runs one callback over items enqueued from any number of threads.
///
/// Items are delivered exactly once, in enqueue order, and never two at a
/// time. A worker is started on the first enqueue after the gatherer went
/// idle and exits once nothing is pending. Clones share the same queue,
/// worker and callback.
///
/// There is no shutdown. A worker that is already running keeps the
/// internals alive until it has drained everything it was counted for.
pub struct Gatherer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Gatherer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Gatherer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gatherer")
            .field("name", &self.shared.name)
            .field("lifecycle", &self.shared.state.lifecycle())
            .field("pending", &self.shared.state.pending())
            .field("spawn", &self.shared.spawner.mode())
            .finish()
    }
}

impl<T: Send + 'static> Gatherer<T> {
    /// Gatherer with an infallible callback, OS-thread workers and failures
    /// logged through [`LogObserver`]. Panics in the callback are contained.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::assemble(
            GathererConfig::default().name,
            Arc::new(ThreadSpawner::default()),
            Arc::new(LogObserver),
            infallible(callback),
        )
    }

    /// Gatherer whose callback reports failures as `Err`.
    pub fn fallible<F>(callback: F) -> Self
    where
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::assemble(
            GathererConfig::default().name,
            Arc::new(ThreadSpawner::default()),
            Arc::new(LogObserver),
            Box::new(callback),
        )
    }

    pub fn builder() -> GathererBuilder<T> {
        GathererBuilder::new()
    }

    fn assemble(
        name: String,
        spawner: Arc<dyn Spawn>,
        observer: Arc<dyn FailureObserver>,
        callback: Callback<T>,
    ) -> Self {
        let instruments = Instruments::new(&name);
        Self {
            shared: Arc::new(Shared {
                name,
                queue: SegQueue::new(),
                state: WorkerState::new(),
                next_ticket: AtomicU64::new(0),
                callback,
                observer,
                spawner,
                counters: Counters::default(),
                instruments,
                idle: IdleSignal::default(),
            }),
        }
    }

    /// Append `item` and make sure a worker will deliver it.
    ///
    /// Never waits for callbacks. Only blocks when the spawner rejects or drops
    /// the worker on this thread, in which case this thread drains the queue
    /// itself.
    pub fn enqueue(&self, item: T) {
        let shared = &self.shared;
        let ticket = shared.next_ticket.fetch_add(1, Ordering::Relaxed);
        shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        shared.queue.push(Ticketed { ticket, item });
        shared
            .instruments
            .enqueued
            .add(1, &shared.instruments.labels);

        if shared.state.claim() == Claim::Claimed {
            shared.start_worker();
        }
    }

    /// Enqueue every item of `items`, in iteration order.
    pub fn enqueue_all<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        for item in items {
            self.enqueue(item);
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn spawn_mode(&self) -> SpawnMode {
        self.shared.spawner.mode()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.state.lifecycle()
    }

    pub fn is_idle(&self) -> bool {
        self.lifecycle() == Lifecycle::Idle
    }

    /// Items enqueued but not yet handed back by the worker.
    pub fn pending(&self) -> usize {
        self.shared.state.pending()
    }

    pub fn stats(&self) -> Stats {
        let c = &self.shared.counters;
        Stats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            workers_spawned: c.workers_spawned.load(Ordering::Relaxed),
            inline_drains: c.inline_drains.load(Ordering::Relaxed),
        }
    }

    /// Block until the gatherer is idle or `timeout` elapses. Returns whether
    /// it went idle. `Duration::MAX` waits without a deadline.
    ///
    /// Producers still enqueueing can keep it busy indefinitely. Called from
    /// inside the callback it never sees the gatherer idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let signal = &self.shared.idle;
        let mut guard = signal
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if self.is_idle() {
                return true;
            }
            guard = match deadline {
                None => signal
                    .cond
                    .wait(guard)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    signal
                        .cond
                        .wait_timeout(guard, remaining)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }

    /// Async variant of [`wait_idle`](Self::wait_idle).
    pub async fn wait_idle_async(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            let notified = self.shared.idle.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return true;
            }
            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.is_idle();
                    }
                }
            }
        }
    }
}

impl<T: Send + 'static> Shared<T> {
    fn start_worker(self: &Arc<Self>) {
        let worker_id = Uuid::new_v4();
        let mode = self.spawner.mode();
        let activation = Activation {
            shared: Some(Arc::clone(self)),
            worker_id,
        };
        let job: Job = Box::new(move || activation.run());

        self.counters.workers_spawned.fetch_add(1, Ordering::Relaxed);
        match self.spawner.spawn(&self.name, job) {
            Ok(()) => {
                self.instruments
                    .spawned
                    .add(1, &self.instruments.labels_with("mode", mode.as_str()));
                debug!(gatherer = %self.name, %worker_id, %mode, "worker claimed");
            }
            // The rejected job's activation drains when the spawner drops it.
            Err(e) => warn!(
                gatherer = %self.name,
                %worker_id,
                error = %e,
                "could not spawn worker"
            ),
        }
    }

    /// Worker body. Runs only while this activation owns the claim.
    fn drain(&self, worker_id: Uuid) {
        let span = start_drain_span(&self.name, &worker_id);
        let _enter = span.enter();

        let mut items = 0u64;
        let mut batches = 0u64;
        loop {
            let batch = self.state.pending();
            let mut done = 0;
            while done < batch {
                match self.queue.pop() {
                    Some(entry) => {
                        self.process(entry);
                        done += 1;
                    }
                    // Counted items are always pushed before they are counted.
                    None => std::hint::spin_loop(),
                }
            }

            items += batch as u64;
            batches += 1;
            record_batch(&span, batch);
            self.instruments
                .batch_size
                .record(batch as u64, &self.instruments.labels);

            if self.state.retire(batch) == Retire::Idle {
                self.idle.raise();
                break;
            }
        }

        record_drain_totals(&span, items, batches);
        debug!(items, batches, "worker idle");
    }

    fn process(&self, entry: Ticketed<T>) {
        let Ticketed { ticket, item } = entry;
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| (self.callback)(item))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CallbackError::Failed(e)),
            Err(payload) => Err(CallbackError::from_panic(payload)),
        };

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        self.instruments
            .processed
            .add(1, &self.instruments.labels);

        if let Err(error) = outcome {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.instruments
                .failures
                .add(1, &self.instruments.labels_with("kind", error.as_label()));

            let failure = Failure {
                gatherer: self.name.clone(),
                ticket,
                error,
                at: Utc::now(),
            };
            if panic::catch_unwind(AssertUnwindSafe(|| self.observer.on_failure(&failure)))
                .is_err()
            {
                warn!(gatherer = %self.name, ticket, "failure observer panicked");
            }
        }
    }
}

fn infallible<T, F>(callback: F) -> Callback<T>
where
    F: Fn(T) + Send + Sync + 'static,
{
    Box::new(move |item| {
        callback(item);
        Ok(())
    })
}

/// Builder for [`Gatherer`] with a name, spawner and failure observer.
pub struct GathererBuilder<T> {
    name: String,
    spawn_mode: SpawnMode,
    spawner: Option<Arc<dyn Spawn>>,
    observer: Option<Arc<dyn FailureObserver>>,
    callback: Option<Callback<T>>,
}

impl<T: Send + 'static> Default for GathererBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> GathererBuilder<T> {
    pub fn new() -> Self {
        let defaults = GathererConfig::default();
        Self {
            name: defaults.name,
            spawn_mode: defaults.spawn,
            spawner: None,
            observer: None,
            callback: None,
        }
    }

    /// Take name and spawn mode from `config`.
    pub fn from_config(mut self, config: &GathererConfig) -> Self {
        self.name = config.name.clone();
        self.spawn_mode = config.spawn;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Pick one of the built-in spawners. Ignored when [`spawner`](Self::spawner) is set.
    pub fn spawn_mode(mut self, mode: SpawnMode) -> Self {
        self.spawn_mode = mode;
        self
    }

    /// Use a custom spawner.
    pub fn spawner(mut self, spawner: impl Spawn) -> Self {
        self.spawner = Some(Arc::new(spawner));
        self
    }

    pub fn observer(mut self, observer: impl FailureObserver) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.callback = Some(infallible(callback));
        self
    }

    pub fn fallible_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// # Errors
    ///
    /// `Error::Config` when no callback was given, the name is empty, or
    /// [`SpawnMode::Tokio`] is requested outside a tokio runtime.
    pub fn build(self) -> Result<Gatherer<T>> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("gatherer name must not be empty".to_string()));
        }
        let Some(callback) = self.callback else {
            return Err(Error::Config(format!(
                "gatherer {} has no callback",
                self.name
            )));
        };
        let spawner: Arc<dyn Spawn> = match self.spawner {
            Some(spawner) => spawner,
            None => match self.spawn_mode {
                SpawnMode::Thread => Arc::new(ThreadSpawner::default()),
                SpawnMode::Tokio => Arc::new(TokioSpawner::current()?),
            },
        };
        let observer = self.observer.unwrap_or_else(|| Arc::new(LogObserver));

        Ok(Gatherer::assemble(self.name, spawner, observer, callback))
    }
}
