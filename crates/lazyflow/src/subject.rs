//! The single-key primitive: a lazily started, reference-counted subject.
//!
//! A [`LazySubject`] moves between three states:
//!
//! ```text
//!            first listener                 last listener leaves
//!   Idle ─────────────────────▶ Active ─────────────────────────▶ GracePeriod
//!    ▲                            ▲                                  │  │
//!    │                            └──────── new listener ────────────┘  │
//!    └──────────────────────── cache timeout elapsed ───────────────────┘
//! ```
//!
//! Work is only scheduled while the subject is `Active` or in its `GracePeriod`. Going back to
//! `Idle` cancels the running load and evicts the cached result.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::config::LazyConfig;
use crate::manager::TaskManager;
use crate::result::LoadResult;
use crate::scheduler::{Scope, SharedScheduler, default_scheduler};
use crate::signal::LoadOutcome;
use crate::task::{Loader, SharedLoader, Trigger};

type SkipFn<T> = dyn Fn(&LoadResult<T>, &LoadResult<T>) -> bool + Send + Sync;

/// Decides whether [`LazySubject::update_with`] publishes a result equal to the current one.
///
/// The default for values implementing `PartialEq` is [`skip_equal_values`](Self::skip_equal_values).
/// Use [`publish_always`](Self::publish_always) to opt out.
pub struct UpdatePolicy<T> {
    skip: Option<Arc<SkipFn<T>>>,
}

impl<T> UpdatePolicy<T> {
    /// Every update is published.
    pub fn publish_always() -> Self {
        Self { skip: None }
    }

    /// Skips an update if `skip(current, update)` returns `true`.
    pub fn custom<F>(skip: F) -> Self
    where
        F: Fn(&LoadResult<T>, &LoadResult<T>) -> bool + Send + Sync + 'static,
    {
        Self {
            skip: Some(Arc::new(skip)),
        }
    }

    pub(crate) fn should_skip(&self, current: &LoadResult<T>, update: &LoadResult<T>) -> bool {
        self.skip.as_ref().is_some_and(|skip| skip(current, update))
    }
}

impl<T: PartialEq + 'static> UpdatePolicy<T> {
    /// Skips updates that carry the same value (or error) as the current result.
    ///
    /// Metadata such as the source or the background flag is ignored.
    pub fn skip_equal_values() -> Self {
        Self::custom(|current, update| match (current, update) {
            (LoadResult::Pending, LoadResult::Pending) => true,
            (LoadResult::Success { value: a, .. }, LoadResult::Success { value: b, .. }) => a == b,
            (LoadResult::Error { error: a, .. }, LoadResult::Error { error: b, .. }) => a == b,
            _ => false,
        })
    }

    /// Skips updates that are equal to the current result in value, source and background flag.
    ///
    /// Retry actions are not compared.
    pub fn skip_equal_results() -> Self {
        Self::custom(|current, update| {
            let same_value = match (current, update) {
                (LoadResult::Pending, LoadResult::Pending) => return true,
                (LoadResult::Success { value: a, .. }, LoadResult::Success { value: b, .. }) => {
                    a == b
                }
                (LoadResult::Error { error: a, .. }, LoadResult::Error { error: b, .. }) => a == b,
                _ => false,
            };
            same_value
                && current.source() == update.source()
                && current.is_loading_in_background() == update.is_loading_in_background()
        })
    }
}

impl<T> Clone for UpdatePolicy<T> {
    fn clone(&self) -> Self {
        Self {
            skip: self.skip.clone(),
        }
    }
}

impl<T: PartialEq + 'static> Default for UpdatePolicy<T> {
    fn default() -> Self {
        Self::skip_equal_values()
    }
}

impl<T> fmt::Debug for UpdatePolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let policy = if self.skip.is_some() {
            "skip-equal"
        } else {
            "publish-always"
        };
        f.write_str(policy)
    }
}

/// The lifecycle state of a [`LazySubject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectState {
    /// Nobody listens and nothing is cached.
    Idle,
    /// At least one consumer listens.
    Active,
    /// The last consumer left; the cached result is kept until the cache timeout elapses.
    GracePeriod,
}

enum Phase {
    Idle,
    Active(Scope),
    GracePeriod { scope: Scope, timer: AbortHandle },
}

struct Lifecycle {
    consumers: usize,
    phase: Phase,
    /// Identifies the most recently armed grace-period timer.
    timer_epoch: u64,
}

struct SubjectInner<T> {
    name: Arc<str>,
    manager: TaskManager<T>,
    cache_timeout: Duration,
    scheduler: SharedScheduler,
    lifecycle: Mutex<Lifecycle>,
}

impl<T: Clone + Send + Sync + 'static> SubjectInner<T> {
    fn subscribe(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.consumers += 1;
        metric!(gauge("lazy.subject.consumers") = lifecycle.consumers as u64, "subject" => &self.name);

        lifecycle.phase = match std::mem::replace(&mut lifecycle.phase, Phase::Idle) {
            Phase::Idle => {
                tracing::debug!(subject = %self.name, "Activating subject");
                metric!(counter("lazy.subject.started") += 1, "subject" => &self.name);
                let scope = Scope::new(&*self.scheduler);
                self.manager.start_processing(&scope);
                Phase::Active(scope)
            }
            Phase::GracePeriod { scope, timer } => {
                tracing::trace!(subject = %self.name, "Consumer returned within the grace period");
                timer.abort();
                Phase::Active(scope)
            }
            active => active,
        };
    }

    fn unsubscribe(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock();
        debug_assert!(lifecycle.consumers > 0, "unbalanced unsubscribe");
        lifecycle.consumers = lifecycle.consumers.saturating_sub(1);
        metric!(gauge("lazy.subject.consumers") = lifecycle.consumers as u64, "subject" => &self.name);
        if lifecycle.consumers > 0 {
            return;
        }

        lifecycle.phase = match std::mem::replace(&mut lifecycle.phase, Phase::Idle) {
            Phase::Active(scope) => {
                lifecycle.timer_epoch += 1;
                let epoch = lifecycle.timer_epoch;
                let timeout = self.cache_timeout;
                let subject: Weak<Self> = Arc::downgrade(self);
                tracing::trace!(subject = %self.name, ?timeout, "Last consumer left");

                let timer = scope.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(subject) = subject.upgrade() {
                        subject.expire(epoch);
                    }
                });
                Phase::GracePeriod {
                    scope,
                    timer: timer.abort_handle(),
                }
            }
            other => other,
        };
    }

    fn expire(&self, epoch: u64) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.timer_epoch != epoch || !matches!(lifecycle.phase, Phase::GracePeriod { .. }) {
            return;
        }

        tracing::debug!(subject = %self.name, "Evicting cached result");
        metric!(counter("lazy.subject.expired") += 1, "subject" => &self.name);
        self.manager.stop_processing();
        // dropping the scope cancels everything that still runs on it
        lifecycle.phase = Phase::Idle;
    }

    fn state(&self) -> SubjectState {
        match self.lifecycle.lock().phase {
            Phase::Idle => SubjectState::Idle,
            Phase::Active(_) => SubjectState::Active,
            Phase::GracePeriod { .. } => SubjectState::GracePeriod,
        }
    }
}

/// Keeps a subject active for as long as it lives.
struct ConsumerGuard<T: Clone + Send + Sync + 'static> {
    subject: Arc<SubjectInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Drop for ConsumerGuard<T> {
    fn drop(&mut self) {
        self.subject.unsubscribe();
    }
}

/// The results of a subject, as returned by [`LazySubject::listen`].
///
/// This stream never ends on its own. The subject counts it as a consumer until it is dropped.
/// Consecutive intermediate results may be conflated, the latest result is always delivered.
pub struct ResultStream<T: Clone + Send + Sync + 'static> {
    results: BoxStream<'static, LoadResult<T>>,
    _guard: ConsumerGuard<T>,
}

impl<T: Clone + Send + Sync + 'static> ResultStream<T> {
    fn new(receiver: watch::Receiver<LoadResult<T>>, guard: ConsumerGuard<T>) -> Self {
        let results = stream::unfold((receiver, true), |(mut receiver, first)| async move {
            if !first {
                receiver.changed().await.ok()?;
            }
            let result = receiver.borrow_and_update().clone();
            Some((result, (receiver, false)))
        })
        .boxed();

        Self {
            results,
            _guard: guard,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Stream for ResultStream<T> {
    type Item = LoadResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.results.poll_next_unpin(cx)
    }
}

impl<T: Clone + Send + Sync + 'static> fmt::Debug for ResultStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStream")
            .field("subject", &self._guard.subject.name)
            .finish()
    }
}

/// A lazily started, shared loading pipeline for a single value.
///
/// Cloning a subject is cheap and yields a handle to the same subject.
pub struct LazySubject<T: Clone + Send + Sync + 'static> {
    inner: Arc<SubjectInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for LazySubject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> fmt::Debug for LazySubject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazySubject")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("consumers", &self.active_consumers())
            .finish()
    }
}

impl<T: Clone + Send + Sync + PartialEq + 'static> LazySubject<T> {
    /// A builder that skips updates equal to the cached value.
    pub fn builder() -> SubjectBuilder<T> {
        SubjectBuilder::default()
    }
}

impl<T: Clone + Send + Sync + 'static> LazySubject<T> {
    /// A builder for values that cannot be compared, or that need a custom [`UpdatePolicy`].
    pub fn builder_with_policy(policy: UpdatePolicy<T>) -> SubjectBuilder<T> {
        SubjectBuilder::new(policy)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Listens to the results of this subject.
    ///
    /// The returned stream starts with the currently cached result. The subject becomes active
    /// right away and stays active until the stream is dropped (plus the cache timeout).
    pub fn listen(&self) -> ResultStream<T> {
        self.inner.subscribe();
        let guard = ConsumerGuard {
            subject: Arc::clone(&self.inner),
        };
        ResultStream::new(self.inner.manager.subscribe(), guard)
    }

    /// Starts a new load, cancelling the running one.
    ///
    /// The returned outcome only reflects this specific load. The load does not run before the
    /// subject has a consumer.
    pub fn new_load<L>(&self, silent: bool, loader: L) -> LoadOutcome<T>
    where
        L: Loader<T>,
    {
        let loader: SharedLoader<T> = Arc::new(loader);
        self.inner.manager.new_load(loader, Trigger::Load, silent)
    }

    /// Re-runs the most recent loader. Returns `None` if this subject never had one.
    pub fn reload(&self, silent: bool) -> Option<LoadOutcome<T>> {
        self.inner.manager.reload(silent)
    }

    /// Overrides the cached result, cancelling any running load.
    pub fn update_with(&self, result: LoadResult<T>) {
        self.inner.manager.update_with(result)
    }

    /// The currently cached result. `Pending` while the subject is idle.
    pub fn get(&self) -> LoadResult<T> {
        self.inner.manager.get()
    }

    /// A stream telling whether a load is running, starting with the current state.
    pub fn is_busy(&self) -> BoxStream<'static, bool> {
        self.inner.manager.is_busy()
    }

    /// Whether a load is running right now.
    pub fn is_busy_now(&self) -> bool {
        self.inner.manager.is_busy_now()
    }

    pub fn active_consumers(&self) -> usize {
        self.inner.lifecycle.lock().consumers
    }

    pub fn state(&self) -> SubjectState {
        self.inner.state()
    }

    /// Whether this subject can be dropped without anybody noticing.
    ///
    /// It must be idle, hold no value, have no queued load and no busy-state listeners.
    pub(crate) fn is_prunable(&self) -> bool {
        let lifecycle = self.inner.lifecycle.lock();
        matches!(lifecycle.phase, Phase::Idle)
            && self.get().is_pending()
            && self.inner.manager.is_quiescent()
    }
}

/// Configures and creates a [`LazySubject`].
pub struct SubjectBuilder<T> {
    name: Option<Arc<str>>,
    cache_timeout: Duration,
    scheduler: Option<SharedScheduler>,
    loader: Option<SharedLoader<T>>,
    policy: UpdatePolicy<T>,
}

impl<T> SubjectBuilder<T> {
    pub fn new(policy: UpdatePolicy<T>) -> Self {
        Self {
            name: None,
            cache_timeout: LazyConfig::default().cache_timeout,
            scheduler: None,
            loader: None,
            policy,
        }
    }
}

impl<T: PartialEq + 'static> Default for SubjectBuilder<T> {
    fn default() -> Self {
        Self::new(UpdatePolicy::default())
    }
}

impl<T: Clone + Send + Sync + 'static> SubjectBuilder<T> {
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// How long the cached result survives after the last consumer left.
    pub fn cache_timeout(mut self, timeout: Duration) -> Self {
        self.cache_timeout = timeout;
        self
    }

    /// Applies the settings of a [`LazyConfig`].
    pub fn config(self, config: &LazyConfig) -> Self {
        self.cache_timeout(config.cache_timeout)
    }

    pub fn scheduler(mut self, scheduler: SharedScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// The loader that runs on first activation.
    pub fn loader<L>(mut self, loader: L) -> Self
    where
        L: Loader<T>,
    {
        self.loader = Some(Arc::new(loader));
        self
    }

    pub(crate) fn shared_loader(mut self, loader: SharedLoader<T>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn update_policy(mut self, policy: UpdatePolicy<T>) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> LazySubject<T> {
        let name = self.name.unwrap_or_else(|| Arc::from("lazy-subject"));
        let manager = TaskManager::new(Arc::clone(&name), self.loader, self.policy);
        LazySubject {
            inner: Arc::new(SubjectInner {
                name,
                manager,
                cache_timeout: self.cache_timeout,
                scheduler: self.scheduler.unwrap_or_else(default_scheduler),
                lifecycle: Mutex::new(Lifecycle {
                    consumers: 0,
                    phase: Phase::Idle,
                    timer_epoch: 0,
                }),
            }),
        }
    }
}
