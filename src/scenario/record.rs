//! Delivery recording and property checks.
//!
//! A [`Recorder`] is called from inside a gatherer callback and keeps, for
//! every delivery, which producer sent the item, its position in that
//! producer's sequence, and when the callback started and finished.
//! [`Recorder::verify`] turns that log into a [`Verdict`].

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// One callback invocation.
#[derive(Debug, Clone, Copy)]
pub struct Delivery {
    pub producer: usize,
    /// Position in the producer's own enqueue order.
    pub seq: usize,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct Recorder {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

/// Property check results over a recorded run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub expected: usize,
    pub delivered: usize,
    /// Items delivered more than once.
    pub duplicates: usize,
    /// Items never delivered.
    pub missing: usize,
    /// Deliveries that came before an earlier item of the same producer.
    pub order_violations: usize,
    /// Callback invocations that started before the previous one finished.
    pub overlaps: usize,
}

impl Verdict {
    pub fn is_clean(&self) -> bool {
        self.delivered == self.expected
            && self.duplicates == 0
            && self.missing == 0
            && self.order_violations == 0
            && self.overlaps == 0
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time `work` and log it as the delivery of `producer`'s item `seq`.
    ///
    /// The entry is written after `work` returns; a panicking `work` leaves
    /// no trace.
    pub fn record<R>(&self, producer: usize, seq: usize, work: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let out = work();
        let finished = Instant::now();
        self.lock().push(Delivery {
            producer,
            seq,
            started,
            finished,
        });
        out
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check the log against `expected[p]` items sent by producer `p`.
    pub fn verify(&self, expected: &[usize]) -> Verdict {
        let log = self.lock();
        let mut seen: Vec<Vec<u32>> = expected.iter().map(|&n| vec![0; n]).collect();
        let mut next: Vec<usize> = vec![0; expected.len()];
        let mut verdict = Verdict {
            expected: expected.iter().sum(),
            delivered: log.len(),
            ..Verdict::default()
        };

        let mut last_finished: Option<Instant> = None;
        for d in log.iter() {
            if let Some(prev) = last_finished {
                if d.started < prev {
                    verdict.overlaps += 1;
                }
            }
            last_finished = Some(d.finished);

            let Some(slot) = seen.get_mut(d.producer).and_then(|s| s.get_mut(d.seq)) else {
                // Not an item anyone enqueued: counts against exactly-once.
                verdict.duplicates += 1;
                continue;
            };
            *slot += 1;
            if *slot > 1 {
                verdict.duplicates += 1;
            }
            if d.seq < next[d.producer] {
                verdict.order_violations += 1;
            }
            next[d.producer] = next[d.producer].max(d.seq + 1);
        }

        verdict.missing = seen
            .iter()
            .flat_map(|s| s.iter())
            .filter(|&&count| count == 0)
            .count();
        verdict
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Delivery>> {
        // A poisoned log is still a valid log.
        self.deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
