//! Single-threaded task scheduler for dependency runs.

use std::future::Future;
use std::rc::Rc;

use smol::LocalExecutor;

/// Cheap-to-clone handle to a `LocalExecutor`.
///
/// The host event loop (or a test) drives it with `run_until_stalled` or
/// `block_on`. All graphs sharing a scheduler run on the same thread.
#[derive(Clone)]
pub struct Scheduler {
    executor: Rc<LocalExecutor<'static>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            executor: Rc::new(LocalExecutor::new()),
        }
    }

    /// Spawn a fire-and-forget task.
    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) {
        self.executor.spawn(fut).detach();
    }

    /// Run ready tasks until none can make progress. Returns true if at least
    /// one task was polled.
    pub fn run_until_stalled(&self) -> bool {
        let mut progressed = false;
        while self.executor.try_tick() {
            progressed = true;
        }
        progressed
    }

    /// Drive `fut` to completion while also running spawned tasks.
    pub fn block_on<T>(&self, fut: impl Future<Output = T>) -> T {
        smol::block_on(self.executor.run(fut))
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("idle", &self.executor.is_empty())
            .finish()
    }
}
