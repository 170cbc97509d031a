//! Integration tests for the gatherer.

use fifo_gatherer::config::SpawnMode;
use fifo_gatherer::gatherer::{Gatherer, Job, Lifecycle, Spawn, ThreadSpawner};
use fifo_gatherer::scenario::record::Recorder;
use fifo_gatherer::{CallbackError, Error, Failure};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const DRAIN: Duration = Duration::from_secs(10);

fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

fn collecting<T: Send + 'static>() -> (Gatherer<T>, Arc<Mutex<Vec<T>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let gatherer = Gatherer::new(move |item| sink.lock().unwrap().push(item));
    (gatherer, seen)
}

/// Counts spawns, then hands the job to a real thread.
#[derive(Clone, Default)]
struct CountingSpawner {
    spawned: Arc<AtomicUsize>,
    inner: ThreadSpawner,
}

impl Spawn for CountingSpawner {
    fn spawn(&self, gatherer: &str, job: Job) -> std::io::Result<()> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        self.inner.spawn(gatherer, job)
    }

    fn mode(&self) -> SpawnMode {
        SpawnMode::Thread
    }
}

/// Parks jobs until the test runs them by hand.
#[derive(Clone, Default)]
struct ManualSpawner {
    jobs: Arc<Mutex<Vec<Job>>>,
}

impl ManualSpawner {
    fn queued(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    fn run_next(&self) {
        let job = self.jobs.lock().unwrap().remove(0);
        job();
    }

    /// Drop every parked job without running it.
    fn discard_all(&self) {
        let jobs = std::mem::take(&mut *self.jobs.lock().unwrap());
        drop(jobs);
    }
}

impl Spawn for ManualSpawner {
    fn spawn(&self, _gatherer: &str, job: Job) -> std::io::Result<()> {
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }

    fn mode(&self) -> SpawnMode {
        SpawnMode::Thread
    }
}

/// Refuses to start anything.
struct BrokenSpawner;

impl Spawn for BrokenSpawner {
    fn spawn(&self, _gatherer: &str, _job: Job) -> std::io::Result<()> {
        Err(std::io::Error::other("no threads left"))
    }

    fn mode(&self) -> SpawnMode {
        SpawnMode::Thread
    }
}

/// Accepts jobs, then throws them away.
struct DroppingSpawner;

impl Spawn for DroppingSpawner {
    fn spawn(&self, _gatherer: &str, job: Job) -> std::io::Result<()> {
        drop(job);
        Ok(())
    }

    fn mode(&self) -> SpawnMode {
        SpawnMode::Thread
    }
}

// ---------------------------------------------------------------------------
// Ordering and exactly-once
// ---------------------------------------------------------------------------

#[test]
fn single_producer_order_is_enqueue_order() {
    let (gatherer, seen) = collecting::<u32>();

    for i in 0..5_000 {
        gatherer.enqueue(i);
    }

    assert!(gatherer.wait_idle(DRAIN));
    let seen = seen.lock().unwrap();
    assert_eq!(*seen, (0..5_000).collect::<Vec<_>>());
}

#[test]
fn enqueue_all_keeps_iteration_order() {
    let (gatherer, seen) = collecting::<char>();

    gatherer.enqueue_all("gatherer".chars());

    assert!(gatherer.wait_idle(DRAIN));
    assert_eq!(seen.lock().unwrap().iter().collect::<String>(), "gatherer");
}

#[test]
fn concurrent_producers_keep_their_own_order() {
    let recorder = Recorder::new();
    let rec = recorder.clone();
    let gatherer = Gatherer::new(move |(p, seq): (usize, usize)| rec.record(p, seq, || ()));

    let producers = 8;
    let per_producer = 2_000;
    std::thread::scope(|s| {
        for p in 0..producers {
            let g = gatherer.clone();
            s.spawn(move || {
                for seq in 0..per_producer {
                    g.enqueue((p, seq));
                }
            });
        }
    });

    assert!(gatherer.wait_idle(DRAIN));
    let verdict = recorder.verify(&vec![per_producer; producers]);
    assert!(verdict.is_clean(), "{verdict:?}");

    let stats = gatherer.stats();
    assert_eq!(stats.enqueued, (producers * per_producer) as u64);
    assert_eq!(stats.processed, stats.enqueued);
    assert_eq!(stats.failed, 0);
}

#[test]
fn three_producer_example() {
    let (gatherer, seen) = collecting::<&'static str>();
    let plans: [&[&'static str]; 3] = [&["A1", "A2", "A3"], &["B1", "B2"], &["C1"]];

    std::thread::scope(|s| {
        for plan in plans {
            let g = gatherer.clone();
            s.spawn(move || {
                for item in plan {
                    g.enqueue(*item);
                }
            });
        }
    });

    assert!(gatherer.wait_idle(DRAIN));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 6);
    let pos = |x: &str| seen.iter().position(|s| *s == x).unwrap();
    assert!(pos("A1") < pos("A2"));
    assert!(pos("A2") < pos("A3"));
    assert!(pos("B1") < pos("B2"));
    assert!(seen.contains(&"C1"));
}

// ---------------------------------------------------------------------------
// Single worker
// ---------------------------------------------------------------------------

#[test]
fn callbacks_never_overlap() {
    let recorder = Recorder::new();
    let rec = recorder.clone();
    let gatherer = Gatherer::new(move |(p, seq): (usize, usize)| {
        rec.record(p, seq, || std::thread::sleep(Duration::from_micros(200)))
    });

    std::thread::scope(|s| {
        for p in 0..4 {
            let g = gatherer.clone();
            s.spawn(move || {
                for seq in 0..50 {
                    g.enqueue((p, seq));
                    if seq % 7 == 0 {
                        std::thread::sleep(Duration::from_micros(300));
                    }
                }
            });
        }
    });

    assert!(gatherer.wait_idle(DRAIN));
    let deliveries = recorder.deliveries();
    assert_eq!(deliveries.len(), 200);
    for pair in deliveries.windows(2) {
        assert!(pair[1].started >= pair[0].finished);
    }
    let verdict = recorder.verify(&[50; 4]);
    assert_eq!(verdict.overlaps, 0);
    assert!(verdict.is_clean(), "{verdict:?}");
}

#[test]
fn concurrent_callback_count_never_exceeds_one() {
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let gatherer = {
        let active = Arc::clone(&active);
        let max_seen = Arc::clone(&max_seen);
        Gatherer::new(move |_: u64| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            std::thread::yield_now();
            active.fetch_sub(1, Ordering::SeqCst);
        })
    };

    std::thread::scope(|s| {
        for _ in 0..6 {
            let g = gatherer.clone();
            s.spawn(move || {
                for i in 0..3_000 {
                    g.enqueue(i);
                }
            });
        }
    });

    assert!(gatherer.wait_idle(DRAIN));
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Exit race and restart
// ---------------------------------------------------------------------------

#[test]
fn item_enqueued_as_worker_exits_is_never_stranded() {
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    let gatherer = Gatherer::new(move |_: usize| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // With an instant callback the worker is almost always exiting when the
    // next item lands.
    for round in 0..1_000 {
        gatherer.enqueue(round);
        assert!(
            wait_for(Duration::from_secs(5), || {
                delivered.load(Ordering::SeqCst) == round + 1
            }),
            "item {round} stranded"
        );
    }
}

#[test]
fn bursts_from_many_threads_are_never_stranded() {
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    let gatherer = Gatherer::new(move |_: (usize, usize)| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut expected = 0;
    for round in 0..300 {
        std::thread::scope(|s| {
            for p in 0..4 {
                let g = gatherer.clone();
                s.spawn(move || g.enqueue((round, p)));
            }
        });
        expected += 4;
        assert!(
            wait_for(Duration::from_secs(5), || {
                delivered.load(Ordering::SeqCst) == expected
            }),
            "round {round} stranded items"
        );
    }
    assert!(gatherer.wait_idle(DRAIN));
}

#[test]
fn idle_gatherer_restarts_exactly_one_worker() {
    let spawner = CountingSpawner::default();
    let spawned = Arc::clone(&spawner.spawned);
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    let gatherer = Gatherer::builder()
        .name("restart")
        .spawner(spawner)
        .callback(move |_: u8| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    assert_eq!(gatherer.lifecycle(), Lifecycle::Idle);

    gatherer.enqueue(1);
    assert!(gatherer.wait_idle(DRAIN));
    assert_eq!(spawned.load(Ordering::SeqCst), 1);

    gatherer.enqueue(2);
    assert!(gatherer.wait_idle(DRAIN));
    assert_eq!(spawned.load(Ordering::SeqCst), 2);
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    assert_eq!(gatherer.stats().workers_spawned, 2);
}

#[test]
fn claim_is_decoupled_from_scheduling() {
    let spawner = ManualSpawner::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let gatherer = Gatherer::builder()
        .name("manual")
        .spawner(spawner.clone())
        .callback(move |i: u32| sink.lock().unwrap().push(i))
        .build()
        .unwrap();

    gatherer.enqueue(1);
    gatherer.enqueue(2);
    gatherer.enqueue(3);

    // One claim, nothing delivered until the worker actually runs.
    assert_eq!(spawner.queued(), 1);
    assert_eq!(gatherer.lifecycle(), Lifecycle::Running);
    assert_eq!(gatherer.pending(), 3);
    assert!(seen.lock().unwrap().is_empty());

    spawner.run_next();
    assert!(gatherer.is_idle());
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);

    gatherer.enqueue(4);
    assert_eq!(spawner.queued(), 1);
    spawner.run_next();
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn enqueue_during_drain_is_picked_up_by_the_same_worker() {
    let spawner = ManualSpawner::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handle: Arc<Mutex<Option<Gatherer<u32>>>> = Arc::new(Mutex::new(None));

    let gatherer = {
        let seen = Arc::clone(&seen);
        let handle = Arc::clone(&handle);
        Gatherer::builder()
            .spawner(spawner.clone())
            .callback(move |i: u32| {
                seen.lock().unwrap().push(i);
                if i < 5 {
                    let g = handle.lock().unwrap().clone();
                    if let Some(g) = g {
                        g.enqueue(i + 1);
                    }
                }
            })
            .build()
            .unwrap()
    };
    *handle.lock().unwrap() = Some(gatherer.clone());

    gatherer.enqueue(0);
    spawner.run_next();

    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(spawner.queued(), 0, "no second worker may be claimed");
    assert!(gatherer.is_idle());
    assert_eq!(gatherer.stats().workers_spawned, 1);

    // Break the gatherer -> callback -> gatherer cycle.
    handle.lock().unwrap().take();
}

#[test]
fn spawn_failure_drains_on_the_producer_thread() {
    let caller = std::thread::current().id();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let gatherer = {
        let seen = Arc::clone(&seen);
        Gatherer::builder()
            .spawner(BrokenSpawner)
            .callback(move |i: u32| {
                seen.lock().unwrap().push((i, std::thread::current().id()));
            })
            .build()
            .unwrap()
    };

    gatherer.enqueue(7);
    gatherer.enqueue(8);

    // Inline drains finish before enqueue returns.
    assert!(gatherer.is_idle());
    assert_eq!(*seen.lock().unwrap(), vec![(7, caller), (8, caller)]);

    let stats = gatherer.stats();
    assert_eq!(stats.inline_drains, 2);
    assert_eq!(stats.workers_spawned, 0);
}

#[test]
fn accepted_but_dropped_job_drains_where_it_is_dropped() {
    let caller = std::thread::current().id();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let gatherer = {
        let seen = Arc::clone(&seen);
        Gatherer::builder()
            .spawner(DroppingSpawner)
            .callback(move |i: u32| {
                seen.lock().unwrap().push((i, std::thread::current().id()));
            })
            .build()
            .unwrap()
    };

    gatherer.enqueue(1);
    assert!(gatherer.is_idle());
    gatherer.enqueue(2);
    assert!(gatherer.is_idle());

    assert_eq!(*seen.lock().unwrap(), vec![(1, caller), (2, caller)]);
    let stats = gatherer.stats();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.inline_drains, 2);
    assert_eq!(stats.workers_spawned, 0);
}

#[test]
fn job_discarded_later_still_delivers() {
    let spawner = ManualSpawner::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let gatherer = {
        let seen = Arc::clone(&seen);
        Gatherer::builder()
            .spawner(spawner.clone())
            .callback(move |i: u32| {
                seen.lock().unwrap().push((i, std::thread::current().id()));
            })
            .build()
            .unwrap()
    };

    gatherer.enqueue_all([1, 2, 3]);
    assert_eq!(spawner.queued(), 1);
    assert_eq!(gatherer.lifecycle(), Lifecycle::Running);

    let dropper = {
        let spawner = spawner.clone();
        std::thread::spawn(move || {
            spawner.discard_all();
            std::thread::current().id()
        })
    };
    let dropper_id = dropper.join().unwrap();

    assert!(gatherer.wait_idle(DRAIN));
    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![(1, dropper_id), (2, dropper_id), (3, dropper_id)]
    );
    assert_eq!(gatherer.stats().inline_drains, 1);

    // Still usable afterwards.
    drop(seen);
    gatherer.enqueue(4);
    assert_eq!(spawner.queued(), 1);
    spawner.run_next();
    assert!(gatherer.wait_idle(DRAIN));
    assert_eq!(gatherer.stats().processed, 4);
}

#[test]
fn tokio_spawner_on_a_shut_down_runtime_still_delivers() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let handle = runtime.handle().clone();
    drop(runtime);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let gatherer = Gatherer::builder()
        .name("orphaned")
        .spawner(fifo_gatherer::gatherer::TokioSpawner::new(handle))
        .callback(move |i: u32| sink.lock().unwrap().push(i))
        .build()
        .unwrap();

    gatherer.enqueue(1);
    assert!(gatherer.wait_idle(DRAIN));
    gatherer.enqueue(2);
    assert!(gatherer.wait_idle(DRAIN));

    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    assert_eq!(gatherer.pending(), 0);
    assert_eq!(gatherer.stats().processed, 2);
}

// ---------------------------------------------------------------------------
// Failure isolation
// ---------------------------------------------------------------------------

#[test]
fn panicking_callback_only_loses_that_item() {
    let failures: Arc<Mutex<Vec<(u64, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let gatherer = {
        let failures = Arc::clone(&failures);
        let seen = Arc::clone(&seen);
        Gatherer::builder()
            .name("panicky")
            .callback(move |i: u32| {
                if i == 2 {
                    panic!("bad item {i}");
                }
                seen.lock().unwrap().push(i);
            })
            .observer(move |f: &Failure| {
                failures
                    .lock()
                    .unwrap()
                    .push((f.ticket, f.error.to_string()));
            })
            .build()
            .unwrap()
    };

    for i in 0..5 {
        gatherer.enqueue(i);
    }

    assert!(gatherer.wait_idle(DRAIN));
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 3, 4]);

    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, 2);
    assert!(failures[0].1.contains("bad item 2"), "{}", failures[0].1);

    let stats = gatherer.stats();
    assert_eq!(stats.processed, 5);
    assert_eq!(stats.failed, 1);
}

#[test]
fn fallible_callback_errors_are_reported_and_skipped() {
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let gatherer = {
        let kinds = Arc::clone(&kinds);
        Gatherer::builder()
            .name("fallible")
            .fallible_callback(|i: i32| {
                if i < 0 {
                    anyhow::bail!("negative input {i}");
                }
                Ok(())
            })
            .observer(move |f: &Failure| {
                assert_eq!(f.gatherer, "fallible");
                let failed = matches!(f.error, CallbackError::Failed(_));
                kinds.lock().unwrap().push((f.error.as_label(), failed));
            })
            .build()
            .unwrap()
    };

    gatherer.enqueue_all([1, -1, 2, -2, 3]);

    assert!(gatherer.wait_idle(DRAIN));
    assert_eq!(
        *kinds.lock().unwrap(),
        vec![("failed", true), ("failed", true)]
    );
    assert_eq!(gatherer.stats().failed, 2);
    assert_eq!(gatherer.stats().processed, 5);
}

#[test]
fn panicking_observer_does_not_stop_the_worker() {
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    let gatherer = Gatherer::builder()
        .callback(move |i: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            if i % 2 == 0 {
                panic!("even");
            }
        })
        .observer(|f: &Failure| {
            if f.ticket % 2 == 0 {
                panic!("observer is broken too");
            }
        })
        .build()
        .unwrap();

    gatherer.enqueue_all(0..10);

    assert!(gatherer.wait_idle(DRAIN));
    assert_eq!(delivered.load(Ordering::SeqCst), 10);
    assert_eq!(gatherer.stats().failed, 5);
}

// ---------------------------------------------------------------------------
// Waiting for idle
// ---------------------------------------------------------------------------

#[test]
fn wait_idle_without_deadline() {
    let gatherer = Gatherer::new(|_: u32| std::thread::sleep(Duration::from_millis(20)));
    gatherer.enqueue_all(0..5);
    assert!(gatherer.wait_idle(Duration::MAX));
    assert_eq!(gatherer.stats().processed, 5);
}

#[test]
fn wait_idle_times_out_while_busy() {
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let gatherer = Gatherer::new(move |_: u32| {
        release_rx.lock().unwrap().recv().unwrap();
    });
    gatherer.enqueue(0);

    assert!(!gatherer.wait_idle(Duration::from_millis(20)));
    release_tx.send(()).unwrap();
    assert!(gatherer.wait_idle(DRAIN));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_idle_async_without_deadline() {
    let gatherer = Gatherer::builder()
        .spawn_mode(SpawnMode::Tokio)
        .callback(|_: u32| std::thread::sleep(Duration::from_millis(20)))
        .build()
        .unwrap();
    gatherer.enqueue_all(0..5);
    assert!(gatherer.wait_idle_async(Duration::MAX).await);
    assert_eq!(gatherer.stats().processed, 5);
}

// ---------------------------------------------------------------------------
// Spawners and builder
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tokio_spawner_delivers_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let gatherer = Gatherer::builder()
        .name("tokio")
        .spawn_mode(SpawnMode::Tokio)
        .callback(move |i: u32| sink.lock().unwrap().push(i))
        .build()
        .unwrap();
    assert_eq!(gatherer.spawn_mode(), SpawnMode::Tokio);

    let producers: Vec<_> = (0..4u32)
        .map(|p| {
            let g = gatherer.clone();
            tokio::spawn(async move {
                for i in 0..250 {
                    g.enqueue(p * 1_000 + i);
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for p in producers {
        p.await.unwrap();
    }

    assert!(gatherer.wait_idle_async(DRAIN).await);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1_000);
    for p in 0..4u32 {
        let mine: Vec<u32> = seen.iter().copied().filter(|v| v / 1_000 == p).collect();
        assert_eq!(mine, (0..250).map(|i| p * 1_000 + i).collect::<Vec<_>>());
    }
}

#[test]
fn tokio_mode_outside_runtime_is_a_config_error() {
    let result = Gatherer::builder()
        .spawn_mode(SpawnMode::Tokio)
        .callback(|_: ()| {})
        .build();
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn builder_requires_a_callback() {
    let result = Gatherer::<u8>::builder().name("empty").build();
    match result {
        Err(Error::Config(msg)) => assert!(msg.contains("empty"), "{msg}"),
        other => panic!("expected config error, got {other:?}"),
    }
}

#[test]
fn builder_rejects_blank_name() {
    let result = Gatherer::builder().name("  ").callback(|_: u8| {}).build();
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn from_config_sets_name() {
    let config = fifo_gatherer::config::GathererConfig {
        name: "from-config".to_string(),
        spawn: SpawnMode::Thread,
    };
    let gatherer = Gatherer::builder()
        .from_config(&config)
        .callback(|_: u8| {})
        .build()
        .unwrap();
    assert_eq!(gatherer.name(), "from-config");
    assert_eq!(gatherer.spawn_mode(), SpawnMode::Thread);
}
