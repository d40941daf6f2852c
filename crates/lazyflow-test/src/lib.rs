//! Helpers for testing subjects and caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Run tests with paused time (`#[tokio::test(start_paused = true)]`). The loaders in this
//!    module sleep for simulated seconds, which then complete instantly and deterministically.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use lazyflow::{Emitter, LoadResult};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `lazyflow` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("lazyflow=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Parses a human readable duration like `4s` or `999ms`.
pub fn duration(s: &str) -> Duration {
    humantime::parse_duration(s).unwrap()
}

/// Counts how often a loader was invoked.
#[derive(Debug, Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Records a call, returning the number of calls before this one.
    pub fn record(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// A loader for caches that emits `loaded-<key>` after `delay`.
pub fn delayed_loader<K>(
    calls: Calls,
    delay: Duration,
) -> impl Fn(K, Emitter<String>) -> futures::future::BoxFuture<'static, anyhow::Result<()>>
+ Send
+ Sync
+ 'static
where
    K: Display + Send + 'static,
{
    move |key: K, emitter: Emitter<String>| {
        calls.record();
        async move {
            tokio::time::sleep(delay).await;
            emitter.emit_last(format!("loaded-{key}"));
            anyhow::Ok(())
        }
        .boxed()
    }
}

/// A loader for subjects that emits `loaded-<n>` after `delay`, where `n` counts the calls.
pub fn counting_loader(
    calls: Calls,
    delay: Duration,
) -> impl Fn(Emitter<String>) -> futures::future::BoxFuture<'static, anyhow::Result<()>>
+ Send
+ Sync
+ 'static {
    move |emitter: Emitter<String>| {
        let call = calls.record();
        async move {
            tokio::time::sleep(delay).await;
            emitter.emit_last(format!("loaded-{call}"));
            anyhow::Ok(())
        }
        .boxed()
    }
}

/// Polls `results` until it yields a completed result.
pub async fn next_completed<T, S>(results: &mut S) -> LoadResult<T>
where
    S: Stream<Item = LoadResult<T>> + Unpin,
{
    loop {
        let result = results.next().await.expect("result streams never end");
        if result.is_completed() {
            return result;
        }
    }
}

/// Collects every result `results` yields until `deadline` passes.
pub async fn collect_until<T, S>(results: &mut S, deadline: Duration) -> Vec<LoadResult<T>>
where
    S: Stream<Item = LoadResult<T>> + Unpin,
{
    let mut collected = Vec::new();
    let sleep = tokio::time::sleep(deadline);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return collected,
            result = results.next() => match result {
                Some(result) => collected.push(result),
                None => return collected,
            },
        }
    }
}
