//! Units of work run by a task manager.
//!
//! A task is either an instant assignment of a [`LoadResult`], or a driven load: a [`Loader`]
//! that pushes zero or more values through an [`Emitter`] and then returns.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::error::LoadError;
use crate::result::{LoadResult, RetryAction, Source};
use crate::signal::LoadSignal;
use crate::utils::defer::defer;

/// Why a load is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// The first load of a subject, or a load explicitly started with a new loader.
    Load,
    /// A reload of the previous loader, for example through a retry action.
    Reload,
    /// The subject's cached value was evicted and a new consumer arrived.
    ///
    /// Loaders can use this to prefer a cheaper local source over a full refresh.
    CacheExpired,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Load => "load",
            Trigger::Reload => "reload",
            Trigger::CacheExpired => "cache-expired",
        }
    }
}

/// Produces the values of a subject.
///
/// Loaders push values through the [`Emitter`] and finish by returning. A loader that returns
/// `Ok` without having emitted anything is treated as a failure ([`LoadError::EmptyLoad`]).
///
/// This is implemented for all `Fn(Emitter<T>) -> impl Future<Output = anyhow::Result<()>>`.
pub trait Loader<T>: Send + Sync + 'static {
    fn load(&self, emitter: Emitter<T>) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<T, F, Fut> Loader<T> for F
where
    F: Fn(Emitter<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn load(&self, emitter: Emitter<T>) -> BoxFuture<'static, anyhow::Result<()>> {
        self(emitter).boxed()
    }
}

pub(crate) type SharedLoader<T> = Arc<dyn Loader<T>>;

/// Receives the results of a running task.
pub(crate) trait ResultSink<T>: Send + Sync + 'static {
    /// The name of the subject, for logs and metrics.
    fn name(&self) -> &str;

    /// Publishes `result` if `generation` is still the current one.
    ///
    /// Returns `false` if the task that produced the result was superseded.
    fn publish(&self, generation: u64, result: LoadResult<T>) -> bool;
}

/// The emission port handed to a [`Loader`].
///
/// Every emitted value becomes the subject's current [`LoadResult::Success`]. Values emitted after
/// the load was superseded are silently dropped.
pub struct Emitter<T> {
    inner: Arc<EmitterInner<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("generation", &self.inner.generation)
            .field("trigger", &self.inner.trigger)
            .field("emitted", &self.emitted())
            .finish()
    }
}

struct EmitterInner<T> {
    sink: Arc<dyn ResultSink<T>>,
    generation: u64,
    trigger: Trigger,
    retry: RetryAction,
    signal: Option<Arc<LoadSignal<T>>>,
    emitted: AtomicUsize,
    /// The last emission, used to clear the background flag once the loader returns.
    last: Mutex<Option<(T, Source, bool)>>,
}

impl<T> Emitter<T> {
    /// Why this load is running.
    pub fn trigger(&self) -> Trigger {
        self.inner.trigger
    }

    /// The number of values emitted so far.
    pub fn emitted(&self) -> usize {
        self.inner.emitted.load(Ordering::Acquire)
    }
}

impl<T: Clone + Send + Sync + 'static> Emitter<T> {
    fn new(
        sink: Arc<dyn ResultSink<T>>,
        generation: u64,
        trigger: Trigger,
        retry: RetryAction,
        signal: Option<Arc<LoadSignal<T>>>,
    ) -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                sink,
                generation,
                trigger,
                retry,
                signal,
                emitted: AtomicUsize::new(0),
                last: Mutex::new(None),
            }),
        }
    }

    /// Emits an intermediate value. The loader is expected to keep working.
    pub fn emit(&self, value: T) {
        self.emit_with(value, Source::Unknown, false)
    }

    /// Emits the final value of this load.
    pub fn emit_last(&self, value: T) {
        self.emit_with(value, Source::Unknown, true)
    }

    /// Emits a value tagged with its source.
    ///
    /// Unless `is_last_value` is set, the published result is flagged as still loading in the
    /// background.
    pub fn emit_with(&self, value: T, source: Source, is_last_value: bool) {
        let inner = &*self.inner;
        inner.emitted.fetch_add(1, Ordering::AcqRel);

        let result = LoadResult::Success {
            value: value.clone(),
            source,
            loading_in_background: !is_last_value,
            retry: inner.retry.clone(),
        };
        if !inner.sink.publish(inner.generation, result) {
            tracing::trace!(
                subject = inner.sink.name(),
                "Dropped emission of superseded load"
            );
            return;
        }

        if let Some(signal) = &inner.signal {
            signal.push(value.clone());
        }
        *inner.last.lock() = Some((value, source, is_last_value));
    }

    /// Re-publishes the last value without the background flag, if it still carries it.
    fn finish(&self) {
        let inner = &*self.inner;
        let last = inner.last.lock().take();
        if let Some((value, source, false)) = last {
            inner.sink.publish(
                inner.generation,
                LoadResult::Success {
                    value,
                    source,
                    loading_in_background: false,
                    retry: inner.retry.clone(),
                },
            );
        }
    }
}

/// Resolves immediately to a fixed result.
pub(crate) struct InstantTask<T> {
    pub result: LoadResult<T>,
    /// The most recent driven loader, so that a reload still knows what to run.
    pub last_loader: Option<SharedLoader<T>>,
    /// Whether `result` was already published for the current activation.
    pub applied: AtomicBool,
}

/// Runs a [`Loader`].
pub(crate) struct LoadTask<T> {
    pub loader: SharedLoader<T>,
    trigger: Mutex<Trigger>,
    silent: bool,
    signal: Option<Arc<LoadSignal<T>>>,
}

pub(crate) enum Task<T> {
    Instant(InstantTask<T>),
    Load(LoadTask<T>),
}

impl<T: Clone + Send + Sync + 'static> Task<T> {
    pub fn instant(result: LoadResult<T>, last_loader: Option<SharedLoader<T>>) -> Self {
        Task::Instant(InstantTask {
            result,
            last_loader,
            applied: AtomicBool::new(false),
        })
    }

    pub fn load(
        loader: SharedLoader<T>,
        trigger: Trigger,
        silent: bool,
        signal: Option<LoadSignal<T>>,
    ) -> Self {
        Task::Load(LoadTask {
            loader,
            trigger: Mutex::new(trigger),
            silent,
            signal: signal.map(Arc::new),
        })
    }

    /// The loader a reload of this task would run.
    pub fn loader(&self) -> Option<&SharedLoader<T>> {
        match self {
            Task::Instant(task) => task.last_loader.as_ref(),
            Task::Load(task) => Some(&task.loader),
        }
    }

    /// Cancels this task.
    ///
    /// This only closes the per-load signal, the manager takes care of stopping the execution.
    /// It is safe to call on a task that never started, or one that already finished.
    pub fn cancel(&self) {
        if let Task::Load(LoadTask {
            signal: Some(signal),
            ..
        }) = self
        {
            signal.fail(LoadError::Cancelled);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> LoadTask<T> {
    pub fn trigger(&self) -> Trigger {
        *self.trigger.lock()
    }

    pub fn retag(&self, trigger: Trigger) {
        *self.trigger.lock() = trigger;
    }

    /// Runs the loader, publishing its results to `sink`.
    ///
    /// Failures are published as [`LoadResult::Error`]. If this future is dropped before the
    /// loader finished, nothing is published and the per-load signal is closed as cancelled.
    pub async fn execute(&self, sink: Arc<dyn ResultSink<T>>, generation: u64, retry: RetryAction) {
        let name = sink.name().to_owned();
        let trigger = self.trigger();
        tracing::debug!(subject = %name, trigger = trigger.as_str(), silent = self.silent, "Starting load");
        metric!(counter("lazy.load.started") += 1, "subject" => &name, "trigger" => trigger.as_str());

        if !self.silent {
            sink.publish(generation, LoadResult::Pending);
        }

        let cancel_guard = defer(|| {
            if let Some(signal) = &self.signal {
                if signal.fail(LoadError::Cancelled) {
                    metric!(counter("lazy.load.cancelled") += 1, "subject" => &name);
                }
            }
        });

        let emitter = Emitter::new(
            Arc::clone(&sink),
            generation,
            trigger,
            retry.clone(),
            self.signal.clone(),
        );
        let loader = Arc::clone(&self.loader);
        let load = {
            let emitter = emitter.clone();
            async move { loader.load(emitter).await }
        };

        let outcome = match AssertUnwindSafe(load).catch_unwind().await {
            Ok(Ok(())) if emitter.emitted() == 0 => Err(LoadError::EmptyLoad),
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(LoadError::from(err)),
            Err(panic) => Err(LoadError::from_panic(panic)),
        };
        cancel_guard.cancel();

        match outcome {
            Ok(()) => {
                emitter.finish();
                if let Some(signal) = &self.signal {
                    signal.complete();
                }
                tracing::trace!(subject = %name, emitted = emitter.emitted(), "Load finished");
            }
            Err(error) => {
                let kind = match error {
                    LoadError::EmptyLoad => "lazy.load.empty",
                    _ => "lazy.load.failed",
                };
                metric!(counter(kind) += 1, "subject" => &name);
                tracing::error!(
                    subject = %name,
                    error = &error as &dyn std::error::Error,
                    "Load failed"
                );

                sink.publish(
                    generation,
                    LoadResult::Error {
                        error: error.clone(),
                        source: Source::Unknown,
                        loading_in_background: false,
                        retry,
                    },
                );
                if let Some(signal) = &self.signal {
                    signal.fail(error);
                }
            }
        }
    }
}
