//! Where worker activations run.
//!
//! Deciding *that* a worker must start is [`WorkerState::claim`]'s job; this
//! module only decides *where* it runs.
//!
//! [`WorkerState::claim`]: super::state::WorkerState::claim

use crate::config::SpawnMode;
use crate::error::{Error, Result};
use tokio::runtime::Handle;

/// A worker activation: runs the drain loop to completion.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Starts worker activations on some background execution context.
pub trait Spawn: Send + Sync + 'static {
    /// Start `job` in the background.
    ///
    /// A job dropped without running, whether rejected with `Err` or
    /// discarded later, drains the gatherer on the thread that drops it.
    fn spawn(&self, gatherer: &str, job: Job) -> std::io::Result<()>;

    /// Short label for logs and metrics.
    fn mode(&self) -> SpawnMode;
}

/// One named OS thread per worker activation.
#[derive(Debug, Clone, Default)]
pub struct ThreadSpawner {
    /// Optional stack size for worker threads. `None` uses the platform default.
    pub stack_size: Option<usize>,
}

impl Spawn for ThreadSpawner {
    fn spawn(&self, gatherer: &str, job: Job) -> std::io::Result<()> {
        let mut builder = std::thread::Builder::new().name(format!("{gatherer}-drain"));
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        builder.spawn(job).map(|_| ())
    }

    fn mode(&self) -> SpawnMode {
        SpawnMode::Thread
    }
}

/// Runs worker activations on tokio's blocking pool.
///
/// Callbacks are synchronous and may run for a long time, so they never go on
/// the async worker threads. Once the runtime has shut down, tokio drops new
/// jobs on the spawning thread, which then drains in place.
#[derive(Debug, Clone)]
pub struct TokioSpawner {
    handle: Handle,
}

impl TokioSpawner {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Bind to the runtime of the calling context.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Config(format!("tokio spawner needs a runtime: {e}")))?;
        Ok(Self::new(handle))
    }
}

impl Spawn for TokioSpawner {
    fn spawn(&self, _gatherer: &str, job: Job) -> std::io::Result<()> {
        self.handle.spawn_blocking(job);
        Ok(())
    }

    fn mode(&self) -> SpawnMode {
        SpawnMode::Tokio
    }
}
