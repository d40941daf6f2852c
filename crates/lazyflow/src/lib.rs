//! Reference-counted, lazily started loading pipelines.
//!
//! A [`LazySubject`] owns one unit of work: a loader that produces a value (or a sequence of
//! values) which is cached and shared by every consumer currently listening. Work only runs while
//! somebody listens, newer loads cancel older ones, and the cached value is evicted after a grace
//! period once the last consumer is gone.
//!
//! A [`LazyCache`] generalizes this to a map of independent subjects, one per argument.
//!
//! Results flow through the tri-state [`LoadResult`] algebra.

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod config;
pub mod error;
pub mod factory;
pub mod logging;
pub mod result;
pub mod scheduler;
pub mod signal;
pub mod subject;
pub mod utils;

mod manager;
mod task;

pub use cache::{CacheBuilder, KeyedLoader, LazyCache};
pub use config::LazyConfig;
pub use error::LoadError;
pub use factory::LazyFactory;
pub use result::{LoadResult, RetryAction, Source, combine};
pub use scheduler::{CurrentRuntime, RuntimeHandle, SchedulerFactory};
pub use signal::LoadOutcome;
pub use subject::{LazySubject, ResultStream, SubjectBuilder, SubjectState, UpdatePolicy};
pub use task::{Emitter, Loader, Trigger};
