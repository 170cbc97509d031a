//! Failure reporting for callbacks.
//!
//! A failing item never stops the worker. The failure is handed to a
//! [`FailureObserver`] and the drain loop moves on to the next item.

use chrono::{DateTime, Utc};
use tracing::error;

use crate::error::CallbackError;

/// One item whose callback failed.
#[derive(Debug)]
pub struct Failure {
    /// Name of the gatherer that ran the callback.
    pub gatherer: String,
    /// Ticket assigned to the item when it was enqueued.
    pub ticket: u64,
    pub error: CallbackError,
    pub at: DateTime<Utc>,
}

/// Receives per-item callback failures.
///
/// Runs on the worker, between two callbacks, so it must be quick. A panic in
/// the observer is caught and logged.
pub trait FailureObserver: Send + Sync + 'static {
    fn on_failure(&self, failure: &Failure);
}

impl<F> FailureObserver for F
where
    F: Fn(&Failure) + Send + Sync + 'static,
{
    fn on_failure(&self, failure: &Failure) {
        self(failure)
    }
}

/// Default observer: logs the failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl FailureObserver for LogObserver {
    fn on_failure(&self, failure: &Failure) {
        error!(
            gatherer = %failure.gatherer,
            ticket = failure.ticket,
            kind = failure.error.as_label(),
            error = %failure.error,
            "item callback failed"
        );
    }
}
