//! Runs the tasks of one subject, one at a time.
//!
//! The manager owns the *current* task. Submitting a new task cancels the previous one, and the
//! processing loop drops the running execution in favor of the new one. Every submission bumps a
//! generation counter, and results are only published if they carry the current generation. This
//! is what keeps a superseded load from overwriting the results of its successor, even if it
//! still manages to emit something while being torn down.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::result::{LoadResult, RetryAction};
use crate::scheduler::Scope;
use crate::signal::{LoadOutcome, LoadSignal};
use crate::subject::UpdatePolicy;
use crate::task::{InstantTask, ResultSink, SharedLoader, Task, Trigger};
use crate::utils::defer::defer;

struct ManagerState<T> {
    /// Bumped on every submission and on teardown.
    generation: u64,
    current: Option<Arc<Task<T>>>,
    /// The most recent driven loader, used by `reload`.
    last_loader: Option<SharedLoader<T>>,
    /// Set while the processing loop runs.
    processing: Option<CancellationToken>,
    /// A load was submitted while nothing was processing.
    queued: bool,
}

struct ManagerInner<T> {
    name: Arc<str>,
    state: Mutex<ManagerState<T>>,
    published: watch::Sender<LoadResult<T>>,
    in_progress: watch::Sender<usize>,
    /// Wakes up the processing loop on every submission.
    generations: watch::Sender<u64>,
    policy: UpdatePolicy<T>,
}

/// Owns and runs the tasks of one subject.
pub(crate) struct TaskManager<T> {
    inner: Arc<ManagerInner<T>>,
}

impl<T> Clone for TaskManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> TaskManager<T> {
    pub fn new(name: Arc<str>, loader: Option<SharedLoader<T>>, policy: UpdatePolicy<T>) -> Self {
        let current = loader
            .clone()
            .map(|loader| Arc::new(Task::load(loader, Trigger::Load, false, None)));
        let state = ManagerState {
            generation: 0,
            current,
            last_loader: loader,
            processing: None,
            queued: false,
        };

        Self {
            inner: Arc::new(ManagerInner {
                name,
                state: Mutex::new(state),
                published: watch::Sender::new(LoadResult::Pending),
                in_progress: watch::Sender::new(0),
                generations: watch::Sender::new(0),
                policy,
            }),
        }
    }

    /// Makes `task` the current task, cancelling the one it replaces.
    ///
    /// Instant tasks are published right away, so their result is visible through [`get`](Self::get)
    /// even while nobody is listening.
    pub fn submit(&self, task: Task<T>) {
        let inner = &*self.inner;
        let task = Arc::new(task);

        let mut state = inner.state.lock();
        if let Some(previous) = state.current.replace(Arc::clone(&task)) {
            previous.cancel();
        }
        state.generation += 1;
        if let Some(loader) = task.loader() {
            state.last_loader = Some(Arc::clone(loader));
        }
        if state.processing.is_none() && matches!(*task, Task::Load(_)) {
            state.queued = true;
        }
        tracing::debug!(
            subject = %inner.name,
            generation = state.generation,
            instant = matches!(*task, Task::Instant(_)),
            "Submitted task"
        );

        if let Task::Instant(instant) = &*task {
            inner.apply_instant(instant);
        }
        inner.generations.send_replace(state.generation);
    }

    /// Starts a new load with `loader`, returning the outcome of that load alone.
    pub fn new_load(&self, loader: SharedLoader<T>, trigger: Trigger, silent: bool) -> LoadOutcome<T> {
        let (signal, outcome) = LoadSignal::new();
        self.submit(Task::load(loader, trigger, silent, Some(signal)));
        outcome
    }

    /// Re-runs the most recent loader. Returns `None` if there never was one.
    pub fn reload(&self, silent: bool) -> Option<LoadOutcome<T>> {
        let loader = self.inner.state.lock().last_loader.clone()?;
        Some(self.new_load(loader, Trigger::Reload, silent))
    }

    /// Replaces the current result, cancelling any running load.
    pub fn update_with(&self, result: LoadResult<T>) {
        let last_loader = self.inner.state.lock().last_loader.clone();
        self.submit(Task::instant(result, last_loader));
    }

    /// Starts the processing loop on `scope`. Does nothing if it is already running.
    pub fn start_processing(&self, scope: &Scope) {
        let mut state = self.inner.state.lock();
        if state
            .processing
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
        {
            return;
        }

        let token = scope.child_token();
        state.processing = Some(token.clone());
        state.queued = false;
        let generations = self.inner.generations.subscribe();
        drop(state);

        tracing::trace!(subject = %self.inner.name, "Starting task processing");
        let inner = Arc::clone(&self.inner);
        scope.spawn(inner.process(token, generations));
    }

    /// Stops the processing loop and evicts the published result.
    ///
    /// The current task is cancelled and kept around, tagged as [`Trigger::CacheExpired`], so
    /// that the next activation resumes with the same loader.
    pub fn stop_processing(&self) {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        if let Some(token) = state.processing.take() {
            token.cancel();
        }
        // invalidates every emitter of the torn down execution
        state.generation += 1;
        inner.published.send_replace(LoadResult::Pending);

        if let Some(current) = state.current.clone() {
            current.cancel();
            match &*current {
                Task::Load(task) => task.retag(Trigger::CacheExpired),
                Task::Instant(InstantTask {
                    last_loader: Some(loader),
                    ..
                }) => {
                    let task = Task::load(Arc::clone(loader), Trigger::CacheExpired, false, None);
                    state.current = Some(Arc::new(task));
                }
                Task::Instant(instant) => instant.applied.store(false, Ordering::Release),
            }
        }
        inner.generations.send_replace(state.generation);
        tracing::trace!(subject = %inner.name, "Stopped task processing");
    }

    /// The most recently published result.
    pub fn get(&self) -> LoadResult<T> {
        self.inner.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadResult<T>> {
        self.inner.published.subscribe()
    }

    /// Whether nothing waits for this manager: no load is queued and nobody watches the busy state.
    pub fn is_quiescent(&self) -> bool {
        let state = self.inner.state.lock();
        !state.queued && self.inner.in_progress.receiver_count() == 0
    }

    pub fn is_busy_now(&self) -> bool {
        *self.inner.in_progress.borrow() != 0
    }

    /// A stream of the busy state, starting with the current one.
    pub fn is_busy(&self) -> BoxStream<'static, bool> {
        let receiver = self.inner.in_progress.subscribe();
        stream::unfold(
            (receiver, None),
            |(mut receiver, last): (watch::Receiver<usize>, Option<bool>)| async move {
                loop {
                    if last.is_some() {
                        receiver.changed().await.ok()?;
                    }
                    let busy = *receiver.borrow_and_update() != 0;
                    if last != Some(busy) {
                        return Some((busy, (receiver, Some(busy))));
                    }
                }
            },
        )
        .boxed()
    }
}

impl<T: Clone + Send + Sync + 'static> ManagerInner<T> {
    /// Runs the current task, restarting whenever a new one is submitted.
    async fn process(
        self: Arc<Self>,
        token: CancellationToken,
        mut generations: watch::Receiver<u64>,
    ) {
        loop {
            let next = {
                let state = self.state.lock();
                generations.borrow_and_update();
                state
                    .current
                    .clone()
                    .map(|task| (state.generation, task))
            };

            if let Some((generation, task)) = next {
                let execution = self.execute(generation, task);
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    changed = generations.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        // the running execution is dropped, which cancels it
                        continue;
                    }
                    _ = execution => {}
                }
            }

            tokio::select! {
                _ = token.cancelled() => return,
                changed = generations.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn execute(self: &Arc<Self>, generation: u64, task: Arc<Task<T>>) {
        match &*task {
            Task::Instant(instant) => {
                let state = self.state.lock();
                if state.generation == generation {
                    self.apply_instant(instant);
                }
            }
            Task::Load(load) => {
                self.in_progress.send_modify(|count| *count += 1);
                let _done = defer(|| self.in_progress.send_modify(|count| *count -= 1));

                let retry = self.retry_action(Arc::clone(&load.loader));
                let sink: Arc<dyn ResultSink<T>> = self.clone();
                load.execute(sink, generation, retry).await;
            }
        }
    }

    /// Publishes the result of an instant task, once per activation.
    ///
    /// Must be called with the state locked.
    fn apply_instant(&self, instant: &InstantTask<T>) {
        if instant.applied.swap(true, Ordering::AcqRel) {
            return;
        }
        let skip = self
            .policy
            .should_skip(&self.published.borrow(), &instant.result);
        if skip {
            tracing::trace!(subject = %self.name, "Skipped update with an equal result");
            return;
        }
        self.published.send_replace(instant.result.clone());
    }

    /// A retry action that reloads `loader` on this manager.
    fn retry_action(self: &Arc<Self>, loader: SharedLoader<T>) -> RetryAction {
        let weak: Weak<Self> = Arc::downgrade(self);
        RetryAction::new(move |silent| {
            if let Some(inner) = weak.upgrade() {
                let manager = TaskManager { inner };
                manager.submit(Task::load(Arc::clone(&loader), Trigger::Reload, silent, None));
            }
        })
    }
}

impl<T: Clone + Send + Sync + 'static> ResultSink<T> for ManagerInner<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, generation: u64, result: LoadResult<T>) -> bool {
        let state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        if result.is_pending() && self.published.borrow().is_pending() {
            return true;
        }
        self.published.send_replace(result);
        true
    }
}
