use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::cache::{CacheBuilder, KeyedLoader, LazyCache};
use crate::config::{Config, LazyConfig};
use crate::scheduler::{SchedulerFactory, SharedScheduler, default_scheduler};
use crate::subject::{LazySubject, SubjectBuilder, UpdatePolicy};
use crate::task::Loader;

/// Creates subjects and caches that share one configuration and scheduler.
///
/// Construct one of these at the composition root of the application and pass it to whatever
/// needs to create subjects. There is no global default instance.
#[derive(Debug, Clone)]
pub struct LazyFactory {
    config: LazyConfig,
    scheduler: SharedScheduler,
}

impl Default for LazyFactory {
    fn default() -> Self {
        Self::new(LazyConfig::default())
    }
}

impl LazyFactory {
    pub fn new(config: LazyConfig) -> Self {
        Self {
            config,
            scheduler: default_scheduler(),
        }
    }

    /// Creates a factory from the `lazy` section of a configuration file.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.lazy)
    }

    /// Schedules the work of everything created by this factory on `scheduler`.
    pub fn with_scheduler<S: SchedulerFactory>(mut self, scheduler: S) -> Self {
        self.scheduler = Arc::new(scheduler);
        self
    }

    pub fn config(&self) -> &LazyConfig {
        &self.config
    }

    /// A subject without a loader. Its values are set with
    /// [`update_with`](LazySubject::update_with) and [`new_load`](LazySubject::new_load).
    ///
    /// Updates equal to the cached value are skipped.
    pub fn subject<T>(&self, name: &str) -> LazySubject<T>
    where
        T: Clone + Send + Sync + PartialEq + 'static,
    {
        self.subject_builder(name, UpdatePolicy::default()).build()
    }

    /// A subject that runs `loader` once it is first listened to.
    pub fn subject_with_loader<T, L>(&self, name: &str, loader: L) -> LazySubject<T>
    where
        T: Clone + Send + Sync + PartialEq + 'static,
        L: Loader<T>,
    {
        self.subject_builder(name, UpdatePolicy::default())
            .loader(loader)
            .build()
    }

    /// A subject builder carrying the configuration and scheduler of this factory.
    pub fn subject_builder<T>(&self, name: &str, policy: UpdatePolicy<T>) -> SubjectBuilder<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        LazySubject::builder_with_policy(policy)
            .name(name)
            .config(&self.config)
            .scheduler(Arc::clone(&self.scheduler))
    }

    pub fn cache<K, T, L>(&self, name: &str, loader: L) -> LazyCache<K, T>
    where
        K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
        T: Clone + Send + Sync + PartialEq + 'static,
        L: KeyedLoader<K, T>,
    {
        self.cache_builder(name, loader, UpdatePolicy::default())
            .build()
    }

    /// A cache builder carrying the configuration and scheduler of this factory.
    pub fn cache_builder<K, T, L>(
        &self,
        name: &str,
        loader: L,
        policy: UpdatePolicy<T>,
    ) -> CacheBuilder<K, T>
    where
        K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
        L: KeyedLoader<K, T>,
    {
        LazyCache::builder_with_policy(loader, policy)
            .name(name)
            .config(self.config)
            .scheduler(Arc::clone(&self.scheduler))
    }
}
