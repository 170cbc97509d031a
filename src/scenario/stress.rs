//! Many producers hammering one gatherer.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

use super::record::{Recorder, Verdict};
use crate::config::SpawnMode;
use crate::error::{Error, Result};
use crate::gatherer::{Gatherer, Stats};
use crate::observer::Failure;

#[derive(Debug, Clone)]
pub struct StressOptions {
    pub producers: usize,
    pub items_per_producer: usize,
    /// Busy-work per callback. Zero makes the worker exit as often as possible.
    pub work: Duration,
    /// Panic in the callback for every k-th item of each producer.
    pub panic_every: Option<usize>,
    pub spawn: SpawnMode,
    pub drain_timeout: Duration,
}

impl Default for StressOptions {
    fn default() -> Self {
        Self {
            producers: 4,
            items_per_producer: 1_000,
            work: Duration::ZERO,
            panic_every: None,
            spawn: SpawnMode::Thread,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub producers: usize,
    pub items_per_producer: usize,
    pub spawn: SpawnMode,
    pub verdict: Verdict,
    pub stats: Stats,
    /// Failures the observer saw. Equals `stats.failed` on a clean run.
    pub observed_failures: u64,
    pub elapsed_ms: u64,
}

impl StressReport {
    pub fn is_clean(&self, options: &StressOptions) -> bool {
        let expected_failures = options
            .panic_every
            .filter(|&k| k > 0)
            .map(|k| (options.items_per_producer / k) * options.producers)
            .unwrap_or(0) as u64;
        self.verdict.is_clean()
            && self.stats.enqueued == self.stats.processed
            && self.stats.failed == expected_failures
            && self.observed_failures == expected_failures
    }
}

/// Run producers on OS threads against a fresh gatherer and check the result.
///
/// # Errors
///
/// `Error::Scenario` if the gatherer does not drain within the timeout.
pub fn run(options: &StressOptions) -> Result<StressReport> {
    let recorder = Recorder::new();
    let observed = Arc::new(AtomicU64::new(0));
    let work = options.work;
    let panic_every = options.panic_every.filter(|&k| k > 0);

    let gatherer = {
        let recorder = recorder.clone();
        let observed = Arc::clone(&observed);
        Gatherer::builder()
            .name("stress")
            .spawn_mode(options.spawn)
            .callback(move |(producer, seq): (usize, usize)| {
                recorder.record(producer, seq, || spin_for(work));
                if let Some(k) = panic_every {
                    if (seq + 1) % k == 0 {
                        panic!("injected failure at producer {producer} item {seq}");
                    }
                }
            })
            .observer(move |_: &Failure| {
                observed.fetch_add(1, Ordering::Relaxed);
            })
            .build()?
    };

    info!(
        producers = options.producers,
        items = options.items_per_producer,
        spawn = %options.spawn,
        "stress run starting"
    );
    let start = Instant::now();

    std::thread::scope(|s| {
        for producer in 0..options.producers {
            let g = gatherer.clone();
            let items = options.items_per_producer;
            s.spawn(move || {
                for seq in 0..items {
                    g.enqueue((producer, seq));
                    if seq % 64 == 0 {
                        std::thread::yield_now();
                    }
                }
            });
        }
    });

    if !gatherer.wait_idle(options.drain_timeout) {
        return Err(Error::Scenario(format!(
            "gatherer still busy after {:?}: {} items pending",
            options.drain_timeout,
            gatherer.pending()
        )));
    }

    let expected = vec![options.items_per_producer; options.producers];
    Ok(StressReport {
        producers: options.producers,
        items_per_producer: options.items_per_producer,
        spawn: options.spawn,
        verdict: recorder.verify(&expected),
        stats: gatherer.stats(),
        observed_failures: observed.load(Ordering::Relaxed),
        elapsed_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}

fn spin_for(work: Duration) {
    if work.is_zero() {
        return;
    }
    let Some(until) = Instant::now().checked_add(work) else {
        return;
    };
    while Instant::now() < until {
        std::hint::spin_loop();
    }
}
