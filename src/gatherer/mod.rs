//! FIFO gatherer: queue, worker lifecycle and spawning.

pub mod core;
pub mod spawn;
pub mod state;

pub use self::core::{Gatherer, GathererBuilder, Stats};
pub use spawn::{Job, Spawn, ThreadSpawner, TokioSpawner};
pub use state::{Claim, Lifecycle, Retire, WorkerState};
