use futures::StreamExt;

use lazyflow::{Emitter, LoadError, LoadResult, Source};

use crate::{Calls, collect_until, counting_loader, duration, next_completed, setup_factory};

#[tokio::test(start_paused = true)]
async fn test_replaced_load_is_cancelled() {
    let factory = setup_factory("1s");
    let subject = factory.subject::<String>("replaced");
    let mut results = subject.listen();

    let slow = subject.new_load(false, counting_loader(Calls::default(), duration("10s")));
    tokio::time::sleep(duration("1s")).await;
    let fast = subject.new_load(false, |emitter: Emitter<String>| async move {
        tokio::time::sleep(duration("1s")).await;
        emitter.emit_last("fast".to_owned());
        anyhow::Ok(())
    });

    assert_eq!(slow.clone().finished().await, Err(LoadError::Cancelled));
    assert_eq!(fast.finished().await, Ok(Some("fast".to_owned())));
    assert_eq!(slow.last_value(), None);

    // the slow loader would have been done by now
    let seen = collect_until(&mut results, duration("20s")).await;
    assert!(
        seen.iter().all(|result| result.value().map(String::as_str) != Some("loaded-0")),
        "{seen:?}"
    );
    assert_eq!(subject.get().value().map(String::as_str), Some("fast"));
}

#[tokio::test(start_paused = true)]
async fn test_late_emissions_are_dropped() {
    let factory = setup_factory("1s");
    let subject = factory.subject::<u32>("late");
    let mut results = subject.listen();

    // this loader ignores cancellation of its future by emitting from a detached task
    let first = subject.new_load(false, |emitter: Emitter<u32>| async move {
        tokio::spawn(async move {
            tokio::time::sleep(duration("5s")).await;
            emitter.emit_last(1);
        });
        std::future::pending::<()>().await;
        anyhow::Ok(())
    });
    tokio::time::sleep(duration("1s")).await;

    let second = subject.new_load(false, |emitter: Emitter<u32>| async move {
        emitter.emit_last(2);
        anyhow::Ok(())
    });
    assert_eq!(second.finished().await, Ok(Some(2)));
    assert_eq!(first.finished().await, Err(LoadError::Cancelled));

    let seen = collect_until(&mut results, duration("10s")).await;
    assert!(seen.iter().all(|result| result.value() != Some(&1)), "{seen:?}");
    assert_eq!(subject.get().value(), Some(&2));
}

#[tokio::test(start_paused = true)]
async fn test_empty_load_is_an_error() {
    let factory = setup_factory("1s");
    let subject = factory.subject_with_loader("empty", |_emitter: Emitter<String>| async move {
        anyhow::Ok(())
    });

    let mut results = subject.listen();
    let result = next_completed(&mut results).await;
    assert_eq!(result.error_ref(), Some(&LoadError::EmptyLoad));

    let outcome = subject.reload(false).unwrap();
    assert_eq!(outcome.finished().await, Err(LoadError::EmptyLoad));
}

#[tokio::test(start_paused = true)]
async fn test_retry_clears_error() {
    let factory = setup_factory("1s");
    let calls = Calls::default();
    let subject = factory.subject_with_loader("flaky", {
        let calls = calls.clone();
        move |emitter: Emitter<String>| {
            let call = calls.record();
            async move {
                tokio::time::sleep(duration("1s")).await;
                if call == 0 {
                    anyhow::bail!("network unreachable");
                }
                emitter.emit_with(format!("attempt-{call}"), Source::Network, true);
                Ok(())
            }
        }
    });

    let mut results = subject.listen();
    let failed = next_completed(&mut results).await;
    let error = failed.error_ref().unwrap();
    assert!(matches!(error, LoadError::Failed(_)));
    assert!(error.to_string().contains("network unreachable"));

    failed.retry(false);
    assert!(results.next().await.unwrap().is_pending());
    let recovered = next_completed(&mut results).await;
    assert_eq!(recovered.value().map(String::as_str), Some("attempt-1"));
    assert_eq!(recovered.source(), Some(Source::Network));
    assert_eq!(calls.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_loader_is_contained() {
    let factory = setup_factory("1s");
    let calls = Calls::default();
    let subject = factory.subject_with_loader("panicky", {
        let calls = calls.clone();
        move |emitter: Emitter<u32>| {
            let call = calls.record();
            async move {
                if call == 0 {
                    panic!("loader bug");
                }
                emitter.emit_last(7);
                anyhow::Ok(())
            }
        }
    });

    let mut results = subject.listen();
    let result = next_completed(&mut results).await;
    assert_eq!(
        result.error_ref(),
        Some(&LoadError::Panicked("loader bug".to_owned()))
    );

    let outcome = subject.reload(false).unwrap();
    assert_eq!(outcome.finished().await, Ok(Some(7)));
}

#[tokio::test(start_paused = true)]
async fn test_outcome_stream() {
    let factory = setup_factory("1s");
    let subject = factory.subject::<u32>("counter");
    let _results = subject.listen();

    let outcome = subject.new_load(false, |emitter: Emitter<u32>| async move {
        for i in 1..=3 {
            tokio::time::sleep(duration("1s")).await;
            emitter.emit(i);
        }
        anyhow::Ok(())
    });

    let values: Vec<_> = outcome.into_stream().collect().await;
    assert_eq!(values, [Ok(1), Ok(2), Ok(3)]);
    assert!(!subject.get().is_loading_in_background());
}

#[tokio::test(start_paused = true)]
async fn test_teardown_cancels_outcome() {
    let factory = setup_factory("1s");
    let subject = factory.subject::<u32>("teardown");
    let results = subject.listen();

    let outcome = subject.new_load(false, |emitter: Emitter<u32>| async move {
        tokio::time::sleep(duration("1h")).await;
        emitter.emit_last(1);
        anyhow::Ok(())
    });
    tokio::time::sleep(duration("1s")).await;
    drop(results);

    assert_eq!(outcome.finished().await, Err(LoadError::Cancelled));
    assert!(subject.get().is_pending());

    let mut busy = subject.is_busy();
    while busy.next().await == Some(true) {}
    assert!(!subject.is_busy_now());
}

#[tokio::test(start_paused = true)]
async fn test_update_with_error() {
    let factory = setup_factory("1s");
    let subject = factory.subject::<u32>("manual");
    let mut results = subject.listen();
    assert!(results.next().await.unwrap().is_pending());

    subject.update_with(LoadResult::error(anyhow::anyhow!("offline")));
    let result = results.next().await.unwrap();
    assert!(result.is_error());
    assert!(subject.reload(false).is_none());
}
