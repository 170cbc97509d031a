//! # fifo-gatherer
//!
//! A multi-producer FIFO gatherer. Any number of threads enqueue items; a
//! single lazily started worker passes each item to one callback, exactly
//! once, in enqueue order, never two callbacks at a time.
//!
//! ```no_run
//! use fifo_gatherer::Gatherer;
//!
//! let gatherer = Gatherer::new(|line: String| println!("{line}"));
//! gatherer.enqueue("hello".to_string());
//! gatherer.enqueue("world".to_string());
//! ```

pub mod config;
pub mod error;
pub mod gatherer;
pub mod observer;
pub mod scenario;
pub mod telemetry;

pub use error::{CallbackError, Error, Result};
pub use gatherer::{Gatherer, GathererBuilder, Lifecycle, Stats};
pub use observer::{Failure, FailureObserver, LogObserver};
