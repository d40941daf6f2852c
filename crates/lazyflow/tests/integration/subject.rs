use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::time::Instant;

use lazyflow::{Emitter, LoadResult, SubjectState, Trigger, UpdatePolicy};

use crate::{Calls, collect_until, counting_loader, duration, next_completed, setup_factory};

fn value(result: &LoadResult<String>) -> Option<&str> {
    result.value().map(String::as_str)
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_within_timeout() {
    let factory = setup_factory("1s");
    let calls = Calls::default();
    let subject = factory.subject_with_loader("scenario", counting_loader(calls.clone(), duration("4s")));
    let start = Instant::now();

    let mut results = subject.listen();
    assert!(results.next().await.unwrap().is_pending());
    let loaded = results.next().await.unwrap();
    assert_eq!(value(&loaded), Some("loaded-0"));
    assert_eq!(start.elapsed(), duration("4s"));
    drop(results);

    tokio::time::sleep(duration("999ms")).await;
    assert_eq!(subject.state(), SubjectState::GracePeriod);

    let mut results = subject.listen();
    let cached = results.next().await.unwrap();
    assert_eq!(value(&cached), Some("loaded-0"));

    let later = collect_until(&mut results, duration("10s")).await;
    assert!(later.is_empty(), "{later:?}");
    assert_eq!(calls.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_after_timeout() {
    let factory = setup_factory("1s");
    let calls = Calls::default();
    let subject = factory.subject_with_loader("scenario", counting_loader(calls.clone(), duration("4s")));
    let start = Instant::now();

    let mut results = subject.listen();
    let loaded = next_completed(&mut results).await;
    assert_eq!(value(&loaded), Some("loaded-0"));
    drop(results);

    tokio::time::sleep(duration("1001ms")).await;
    assert_eq!(subject.state(), SubjectState::Idle);
    assert!(subject.get().is_pending());

    let mut results = subject.listen();
    assert!(results.next().await.unwrap().is_pending());
    let reloaded = results.next().await.unwrap();
    assert_eq!(value(&reloaded), Some("loaded-1"));
    assert_eq!(start.elapsed(), duration("9001ms"));
    assert_eq!(calls.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_single_flight() {
    let factory = setup_factory("1s");
    let calls = Calls::default();
    let subject = factory.subject_with_loader("shared", counting_loader(calls.clone(), duration("1s")));

    let mut streams: Vec<_> = (0..5).map(|_| subject.listen()).collect();
    assert_eq!(subject.active_consumers(), 5);

    for results in &mut streams {
        let loaded = next_completed(results).await;
        assert_eq!(value(&loaded), Some("loaded-0"));
    }
    assert_eq!(calls.get(), 1);

    drop(streams);
    assert_eq!(subject.active_consumers(), 0);
    assert_eq!(subject.state(), SubjectState::GracePeriod);
}

#[tokio::test(start_paused = true)]
async fn test_update_with_cancels_running_load() {
    let factory = setup_factory("1s");
    let calls = Calls::default();
    let subject = factory.subject_with_loader("updated", counting_loader(calls.clone(), duration("4s")));

    let mut results = subject.listen();
    assert!(results.next().await.unwrap().is_pending());
    tokio::time::sleep(duration("1s")).await;
    assert!(subject.is_busy_now());

    subject.update_with(LoadResult::success("x".to_owned()));
    assert_eq!(value(&subject.get()), Some("x"));

    let seen = collect_until(&mut results, duration("10s")).await;
    let values: Vec<_> = seen.iter().map(value).collect();
    assert_eq!(values, [Some("x")]);
    assert_eq!(value(&subject.get()), Some("x"));
    assert!(!subject.is_busy_now());
    assert_eq!(calls.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reload_after_update_reuses_loader() {
    let factory = setup_factory("1s");
    let calls = Calls::default();
    let subject = factory.subject_with_loader("reloaded", counting_loader(calls.clone(), duration("1s")));

    let mut results = subject.listen();
    next_completed(&mut results).await;
    subject.update_with(LoadResult::success("x".to_owned()));

    let outcome = subject.reload(false).unwrap();
    assert_eq!(outcome.finished().await, Ok(Some("loaded-1".to_owned())));
    assert_eq!(value(&subject.get()), Some("loaded-1"));
}

#[tokio::test(start_paused = true)]
async fn test_silent_reload() {
    let factory = setup_factory("1s");
    let calls = Calls::default();
    let subject = factory.subject_with_loader("silent", counting_loader(calls.clone(), duration("1s")));

    let mut results = subject.listen();
    next_completed(&mut results).await;

    subject.reload(true).unwrap();
    let seen = collect_until(&mut results, duration("5s")).await;
    let values: Vec<_> = seen.iter().map(value).collect();
    assert_eq!(values, [Some("loaded-1")]);

    subject.reload(false).unwrap();
    let seen = collect_until(&mut results, duration("5s")).await;
    assert!(seen[0].is_pending());
    assert_eq!(value(seen.last().unwrap()), Some("loaded-2"));
}

#[tokio::test(start_paused = true)]
async fn test_triggers() {
    let factory = setup_factory("1s");
    let triggers = Arc::new(Mutex::new(Vec::new()));
    let subject = factory.subject_with_loader("triggers", {
        let triggers = Arc::clone(&triggers);
        move |emitter: Emitter<String>| {
            triggers.lock().push(emitter.trigger());
            async move {
                emitter.emit_last(emitter.trigger().as_str().to_owned());
                anyhow::Ok(())
            }
        }
    });

    let mut results = subject.listen();
    assert_eq!(value(&next_completed(&mut results).await), Some("load"));
    drop(results);
    tokio::time::sleep(duration("2s")).await;

    let mut results = subject.listen();
    assert_eq!(value(&next_completed(&mut results).await), Some("cache-expired"));

    subject.reload(false).unwrap().finished().await.unwrap();
    assert_eq!(
        *triggers.lock(),
        [Trigger::Load, Trigger::CacheExpired, Trigger::Reload]
    );
}

#[tokio::test(start_paused = true)]
async fn test_background_flag_is_cleared() {
    let factory = setup_factory("1s");
    let subject = factory.subject_with_loader("progressive", |emitter: Emitter<String>| async move {
        emitter.emit("partial".to_owned());
        tokio::time::sleep(duration("1s")).await;
        emitter.emit("full".to_owned());
        anyhow::Ok(())
    });

    let mut results = subject.listen();
    let partial = next_completed(&mut results).await;
    assert_eq!(value(&partial), Some("partial"));
    assert!(partial.is_loading_in_background());

    let seen = collect_until(&mut results, duration("5s")).await;
    let last = seen.last().unwrap();
    assert_eq!(value(last), Some("full"));
    assert!(!last.is_loading_in_background());
    assert!(!subject.get().is_loading_in_background());
}

#[tokio::test(start_paused = true)]
async fn test_is_busy_follows_loads() {
    let factory = setup_factory("1s");
    let calls = Calls::default();
    let subject = factory.subject_with_loader("busy", counting_loader(calls, duration("2s")));
    let mut busy = subject.is_busy();
    assert_eq!(busy.next().await, Some(false));

    let _results = subject.listen();
    assert_eq!(busy.next().await, Some(true));
    assert_eq!(busy.next().await, Some(false));

    subject.reload(true).unwrap();
    assert_eq!(busy.next().await, Some(true));
    assert_eq!(busy.next().await, Some(false));
}

#[tokio::test(start_paused = true)]
async fn test_work_waits_for_consumers() {
    let factory = setup_factory("1s");
    let calls = Calls::default();
    let subject = factory.subject::<String>("deferred");

    let outcome = subject.new_load(false, counting_loader(calls.clone(), duration("1s")));
    tokio::time::sleep(duration("10s")).await;
    assert_eq!(calls.get(), 0);
    assert!(outcome.try_outcome().is_none());

    let _results = subject.listen();
    assert_eq!(outcome.finished().await, Ok(Some("loaded-0".to_owned())));
    assert_eq!(calls.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_equal_update_is_not_republished() {
    let factory = setup_factory("1s");
    let subject = factory.subject::<String>("deduplicated");
    let mut results = subject.listen();
    assert!(results.next().await.unwrap().is_pending());

    subject.update_with(LoadResult::success("x".to_owned()));
    let first = collect_until(&mut results, duration("1s")).await;
    assert_eq!(first.iter().map(value).collect::<Vec<_>>(), [Some("x")]);

    subject.update_with(LoadResult::success("x".to_owned()));
    let second = collect_until(&mut results, duration("1s")).await;
    assert!(second.is_empty(), "{second:?}");

    subject.update_with(LoadResult::success("y".to_owned()));
    let third = collect_until(&mut results, duration("1s")).await;
    assert_eq!(third.iter().map(value).collect::<Vec<_>>(), [Some("y")]);
}

#[tokio::test(start_paused = true)]
async fn test_publish_always_republishes() {
    let factory = setup_factory("1s");
    let subject = factory
        .subject_builder::<String>("republished", UpdatePolicy::publish_always())
        .build();
    let mut results = subject.listen();
    assert!(results.next().await.unwrap().is_pending());

    for _ in 0..2 {
        subject.update_with(LoadResult::success("x".to_owned()));
        let seen = collect_until(&mut results, duration("1s")).await;
        assert_eq!(seen.iter().map(value).collect::<Vec<_>>(), [Some("x")]);
    }
}
