//! A keyed map of independent [`LazySubject`]s.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use parking_lot::Mutex;

use crate::config::LazyConfig;
use crate::result::LoadResult;
use crate::scheduler::{SharedScheduler, default_scheduler};
use crate::signal::LoadOutcome;
use crate::subject::{LazySubject, ResultStream, SubjectState, UpdatePolicy};
use crate::task::{Emitter, Loader};

/// Produces the values of one entry of a [`LazyCache`].
///
/// This is implemented for all `Fn(K, Emitter<T>) -> impl Future<Output = anyhow::Result<()>>`.
pub trait KeyedLoader<K, T>: Send + Sync + 'static {
    fn load(&self, key: K, emitter: Emitter<T>) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<K, T, F, Fut> KeyedLoader<K, T> for F
where
    F: Fn(K, Emitter<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn load(&self, key: K, emitter: Emitter<T>) -> BoxFuture<'static, anyhow::Result<()>> {
        self(key, emitter).boxed()
    }
}

/// A keyed loader bound to one key.
struct BoundLoader<K, T> {
    key: K,
    loader: Arc<dyn KeyedLoader<K, T>>,
}

impl<K, T> Loader<T> for BoundLoader<K, T>
where
    K: Clone + Send + Sync + 'static,
    T: 'static,
{
    fn load(&self, emitter: Emitter<T>) -> BoxFuture<'static, anyhow::Result<()>> {
        self.loader.load(self.key.clone(), emitter)
    }
}

struct CacheInner<K, T: Clone + Send + Sync + 'static> {
    name: Arc<str>,
    loader: Arc<dyn KeyedLoader<K, T>>,
    config: LazyConfig,
    scheduler: SharedScheduler,
    policy: UpdatePolicy<T>,
    entries: Mutex<HashMap<K, LazySubject<T>>>,
}

/// A map from keys to lazily loaded values.
///
/// Every key gets its own [`LazySubject`], created on first use. Entries are reference-counted
/// and evicted independently of each other. The map slot of an evicted entry stays around until
/// it is pruned, see [`prune_idle`](Self::prune_idle).
pub struct LazyCache<K, T: Clone + Send + Sync + 'static> {
    inner: Arc<CacheInner<K, T>>,
}

impl<K, T: Clone + Send + Sync + 'static> Clone for LazyCache<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, T: Clone + Send + Sync + 'static> fmt::Debug for LazyCache<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyCache")
            .field("name", &self.inner.name)
            .field("entries", &self.inner.entries.lock().len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl<K, T> LazyCache<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// A builder whose entries skip updates equal to their cached value.
    pub fn builder<L>(loader: L) -> CacheBuilder<K, T>
    where
        L: KeyedLoader<K, T>,
        T: PartialEq,
    {
        Self::builder_with_policy(loader, UpdatePolicy::default())
    }

    pub fn builder_with_policy<L>(loader: L, policy: UpdatePolicy<T>) -> CacheBuilder<K, T>
    where
        L: KeyedLoader<K, T>,
    {
        CacheBuilder {
            name: None,
            loader: Arc::new(loader),
            config: LazyConfig::default(),
            scheduler: None,
            policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Listens to the results for `key`, creating its entry if needed.
    pub fn listen(&self, key: K) -> ResultStream<T> {
        let mut entries = self.inner.entries.lock();
        // subscribing under the map lock keeps the entry from being pruned in between
        self.entry(&mut entries, key).listen()
    }

    /// The cached result for `key`. `Pending` if the entry does not exist.
    pub fn get(&self, key: &K) -> LoadResult<T> {
        self.existing(key)
            .map(|subject| subject.get())
            .unwrap_or(LoadResult::Pending)
    }

    /// A stream telling whether a load is running for `key`, creating its entry if needed.
    pub fn is_value_loading(&self, key: K) -> BoxStream<'static, bool> {
        let mut entries = self.inner.entries.lock();
        self.entry(&mut entries, key).is_busy()
    }

    pub fn active_consumers(&self, key: &K) -> usize {
        self.existing(key)
            .map(|subject| subject.active_consumers())
            .unwrap_or(0)
    }

    /// The lifecycle state of the entry for `key`. `Idle` if the entry does not exist.
    pub fn state(&self, key: &K) -> SubjectState {
        self.existing(key)
            .map(|subject| subject.state())
            .unwrap_or(SubjectState::Idle)
    }

    /// Reloads the entry for `key`.
    ///
    /// Returns `None` without doing anything if nobody ever used `key`.
    pub fn reload(&self, key: &K, silent: bool) -> Option<LoadOutcome<T>> {
        self.existing(key)?.reload(silent)
    }

    /// Overrides the cached result for `key`.
    ///
    /// Returns `false` without doing anything if nobody ever used `key`.
    pub fn update_with(&self, key: &K, result: LoadResult<T>) -> bool {
        match self.existing(key) {
            Some(subject) => {
                subject.update_with(result);
                true
            }
            None => false,
        }
    }

    /// Removes all idle entries that hold no value.
    ///
    /// Entries with a queued load or a live [`is_value_loading`](Self::is_value_loading) stream
    /// are kept.
    ///
    /// Returns the number of removed entries.
    pub fn prune_idle(&self) -> usize {
        let mut entries = self.inner.entries.lock();
        self.prune_locked(&mut entries)
    }

    /// The number of entries, including idle ones.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn existing(&self, key: &K) -> Option<LazySubject<T>> {
        self.inner.entries.lock().get(key).cloned()
    }

    fn entry<'a>(
        &self,
        entries: &'a mut HashMap<K, LazySubject<T>>,
        key: K,
    ) -> &'a LazySubject<T> {
        if !entries.contains_key(&key) {
            if let Some(max_idle) = self.inner.config.max_idle_entries {
                let idle = entries.values().filter(|subject| subject.is_prunable()).count();
                if idle >= max_idle {
                    self.prune_locked(entries);
                }
            }
            metric!(counter("lazy.cache.entry_created") += 1, "cache" => &self.inner.name);
        }

        entries
            .entry(key)
            .or_insert_with_key(|key| self.create_subject(key))
    }

    fn create_subject(&self, key: &K) -> LazySubject<T> {
        let inner = &*self.inner;
        tracing::trace!(cache = %inner.name, ?key, "Creating cache entry");
        let loader = BoundLoader {
            key: key.clone(),
            loader: Arc::clone(&inner.loader),
        };

        LazySubject::builder_with_policy(inner.policy.clone())
            .name(format!("{}[{key:?}]", inner.name))
            .config(&inner.config)
            .scheduler(Arc::clone(&inner.scheduler))
            .shared_loader(Arc::new(loader))
            .build()
    }

    fn prune_locked(&self, entries: &mut HashMap<K, LazySubject<T>>) -> usize {
        let before = entries.len();
        entries.retain(|_, subject| !subject.is_prunable());
        let pruned = before - entries.len();
        if pruned > 0 {
            tracing::debug!(cache = %self.inner.name, pruned, "Pruned idle cache entries");
            metric!(counter("lazy.cache.entry_pruned") += pruned as i64, "cache" => &self.inner.name);
        }
        pruned
    }
}

/// Configures and creates a [`LazyCache`].
pub struct CacheBuilder<K, T> {
    name: Option<Arc<str>>,
    loader: Arc<dyn KeyedLoader<K, T>>,
    config: LazyConfig,
    scheduler: Option<SharedScheduler>,
    policy: UpdatePolicy<T>,
}

impl<K, T> CacheBuilder<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn config(mut self, config: LazyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn scheduler(mut self, scheduler: SharedScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn update_policy(mut self, policy: UpdatePolicy<T>) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> LazyCache<K, T> {
        LazyCache {
            inner: Arc::new(CacheInner {
                name: self.name.unwrap_or_else(|| Arc::from("lazy-cache")),
                loader: self.loader,
                config: self.config,
                scheduler: self.scheduler.unwrap_or_else(default_scheduler),
                policy: self.policy,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }
}
