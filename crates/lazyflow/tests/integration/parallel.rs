//! Concurrent use of subjects and caches on a multi-threaded runtime, with real time.

use std::sync::Arc;

use tokio::sync::Barrier;

use lazyflow::{Emitter, LoadError};

use crate::{Calls, counting_loader, delayed_loader, duration, next_completed, setup_factory};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_listeners_share_one_load() {
    let factory = setup_factory("1s");
    let calls = Calls::default();
    let subject = factory.subject_with_loader("parallel", counting_loader(calls.clone(), duration("50ms")));
    let barrier = Arc::new(Barrier::new(16));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let subject = subject.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                let mut results = subject.listen();
                let loaded = next_completed(&mut results).await;
                // keep listening until every task is done, so the subject never goes idle
                (loaded, results)
            })
        })
        .collect();

    let mut streams = Vec::new();
    for task in tasks {
        let (loaded, results) = task.await.unwrap();
        assert_eq!(loaded.value().map(String::as_str), Some("loaded-0"));
        streams.push(results);
    }
    assert_eq!(calls.get(), 1);
    assert_eq!(subject.active_consumers(), 16);

    drop(streams);
    assert_eq!(subject.active_consumers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_keys() {
    let factory = setup_factory("1s");
    let calls = Calls::default();
    let cache = factory.cache("parallel", delayed_loader::<u32>(calls.clone(), duration("20ms")));
    let barrier = Arc::new(Barrier::new(32 * 4));

    let tasks: Vec<_> = (0..32 * 4)
        .map(|i| {
            let key = i % 32;
            let cache = cache.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                let mut results = cache.listen(key);
                let loaded = next_completed(&mut results).await;
                (key, loaded, results)
            })
        })
        .collect();

    let mut streams = Vec::new();
    for task in tasks {
        let (key, loaded, results) = task.await.unwrap();
        let expected = format!("loaded-{key}");
        assert_eq!(loaded.value(), Some(&expected));
        streams.push(results);
    }
    assert_eq!(calls.get(), 32);
    assert_eq!(cache.len(), 32);
    for key in 0..32 {
        assert_eq!(cache.active_consumers(&key), 4);
    }

    drop(streams);
    for key in 0..32 {
        assert_eq!(cache.active_consumers(&key), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_new_loads() {
    let factory = setup_factory("1s");
    let subject = factory.subject::<String>("racing");
    let _results = subject.listen();
    let barrier = Arc::new(Barrier::new(8));

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let subject = subject.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                let outcome = subject.new_load(false, move |emitter: Emitter<String>| async move {
                    tokio::time::sleep(duration("10ms")).await;
                    emitter.emit_last(format!("load-{i}"));
                    anyhow::Ok(())
                });
                outcome.finished().await
            })
        })
        .collect();

    let mut loaded = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Ok(Some(value)) => loaded.push(value),
            Ok(None) => panic!("a successful load always emits"),
            Err(error) => assert_eq!(error, LoadError::Cancelled),
        }
    }

    // the last submission is never superseded
    assert!(!loaded.is_empty());
    let current = subject.get();
    let current = current.value().unwrap();
    assert!(loaded.contains(current), "{current} not in {loaded:?}");
}
