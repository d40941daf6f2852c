//! Where subjects run their work.
//!
//! A [`SchedulerFactory`] hands out the runtime on which a subject spawns its processing loop and
//! grace-period timer. Each activation of a subject creates a fresh [`Scope`], which is torn down
//! (cancelling everything spawned on it) when the subject goes idle again.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Creates the runtime handles subjects schedule their work on.
pub trait SchedulerFactory: Send + Sync + fmt::Debug + 'static {
    /// Returns the runtime the next [`Scope`] spawns its tasks on.
    fn create(&self) -> Handle;
}

/// Schedules work on the ambient Tokio runtime.
///
/// # Panics
///
/// [`create`](SchedulerFactory::create) panics when called outside of a Tokio runtime, just like
/// [`tokio::spawn`] does.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentRuntime;

impl SchedulerFactory for CurrentRuntime {
    fn create(&self) -> Handle {
        Handle::current()
    }
}

/// Schedules work on an explicitly provided runtime.
#[derive(Debug, Clone)]
pub struct RuntimeHandle(pub Handle);

impl SchedulerFactory for RuntimeHandle {
    fn create(&self) -> Handle {
        self.0.clone()
    }
}

pub type SharedScheduler = Arc<dyn SchedulerFactory>;

/// The default scheduler, used when nothing else was configured.
pub fn default_scheduler() -> SharedScheduler {
    Arc::new(CurrentRuntime)
}

/// A cancellable group of tasks.
///
/// Dropping the scope cancels it.
#[derive(Debug)]
pub(crate) struct Scope {
    handle: Handle,
    token: CancellationToken,
}

impl Scope {
    pub fn new(scheduler: &dyn SchedulerFactory) -> Self {
        Self {
            handle: scheduler.create(),
            token: CancellationToken::new(),
        }
    }

    /// A token that is cancelled together with this scope.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Spawns a future that is aborted once the scope is cancelled.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.child_token();
        self.handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = future => {}
            }
        })
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
