//! End-to-end scenarios over the public engine API.

use proptest::prelude::*;
use ripple_core::{Monitor, TransactionOptions, TransactionStatus};
use ripple_testkit::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn setup() -> (Engine, ObjectHandle) {
    init_tracing();
    let engine = Engine::new();
    let demo = create_demo(&engine, &demo_type(), "Demo").unwrap();
    (engine, demo)
}

// Atomicity

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn failed_transaction_leaves_no_trace(value in value_strategy()) {
        let (engine, demo) = setup();
        let before_title = engine.get(&demo, "title").unwrap();
        let before_users = engine.get(&demo, "users").unwrap();
        let applied = engine.applied();

        let err = engine
            .transaction("doomed", |ctx| {
                ctx.set(&demo, "title", value.clone())?;
                ctx.set(&demo, "users", value.clone())?;
                Err::<(), _>(CoreError::failed("abort"))
            })
            .unwrap_err();

        prop_assert_eq!(err, CoreError::failed("abort"));
        prop_assert_eq!(engine.get(&demo, "title").unwrap(), before_title);
        prop_assert_eq!(engine.get(&demo, "users").unwrap(), before_users);
        prop_assert_eq!(engine.applied(), applied);
    }
}

#[test]
fn failing_nested_operation_rolls_back_outer_writes() {
    let (engine, demo) = setup();
    engine.call(&demo, "render", &[]).unwrap();

    let err = engine
        .transaction("outer", |ctx| {
            ctx.set(&demo, "title", "Half done")?;
            ctx.call(&demo, "add_user", &[Value::from("ada")])?;
            ctx.call(&demo, "rename", &[])
        })
        .unwrap_err();

    assert_eq!(err, CoreError::failed("rename expects a title"));
    assert_eq!(engine.get(&demo, "title").unwrap(), Value::from("Demo"));
    assert_eq!(engine.get(&demo, "users").unwrap(), Value::list(Vec::new()));
    assert!(!engine.cache(&demo, "render").unwrap().is_invalid());
}

// Snapshot isolation

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn open_transaction_never_sees_later_commits(titles in title_sequence_strategy()) {
        let (engine, demo) = setup();
        let reader = engine.begin(TransactionOptions::new("reader"));
        let ctx = reader.context();
        prop_assert_eq!(ctx.get(&demo, "title").unwrap(), Value::from("Demo"));

        for title in &titles {
            engine.call(&demo, "rename", &[Value::from(title.as_str())]).unwrap();
            prop_assert_eq!(ctx.get(&demo, "title").unwrap(), Value::from("Demo"));
        }

        let last = titles.last().cloned().unwrap_or_default();
        prop_assert_eq!(engine.get(&demo, "title").unwrap(), Value::from(last));

        reader.seal();
        prop_assert_eq!(reader.status(), TransactionStatus::Applied);
    }
}

#[test]
fn transaction_sees_its_own_writes_only() {
    let (engine, demo) = setup();
    let writer = engine.begin(TransactionOptions::new("writer"));
    {
        let _worker = writer.enter().unwrap();
        writer.context().set(&demo, "title", "Mine").unwrap();
    }
    assert_eq!(writer.context().get(&demo, "title").unwrap(), Value::from("Mine"));
    assert_eq!(engine.get(&demo, "title").unwrap(), Value::from("Demo"));

    writer.seal();
    assert_eq!(writer.outcome(), Some(Ok(())));
    assert_eq!(engine.get(&demo, "title").unwrap(), Value::from("Mine"));
}

// Conflict detection

#[test]
fn later_writer_of_same_field_conflicts() {
    let (engine, demo) = setup();
    let slow = engine.begin(TransactionOptions::new("slow"));
    {
        let _worker = slow.enter().unwrap();
        slow.context().set(&demo, "title", "Slow").unwrap();
    }

    engine.call(&demo, "rename", &[Value::from("Fast")]).unwrap();
    slow.seal();

    let err = slow.outcome().unwrap().unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(slow.status(), TransactionStatus::Discarded);
    assert_eq!(engine.get(&demo, "title").unwrap(), Value::from("Fast"));
}

#[test]
fn side_by_side_writer_overwrites() {
    let (engine, demo) = setup();
    let slow = engine.begin(TransactionOptions::new("slow").side_by_side(true));
    {
        let _worker = slow.enter().unwrap();
        slow.context().set(&demo, "title", "Slow").unwrap();
    }

    engine.call(&demo, "rename", &[Value::from("Fast")]).unwrap();
    slow.seal();

    assert_eq!(slow.outcome(), Some(Ok(())));
    assert_eq!(engine.get(&demo, "title").unwrap(), Value::from("Slow"));
    // Counted, then ignored.
    assert_eq!(engine.stats().conflicts(), 1);
}

#[test]
fn concurrent_increments_all_land() {
    init_tracing();
    let config = StressConfig {
        operations: 40,
        threads: 4,
        objects: 1,
    };
    let engine = Engine::new();
    let counters = create_counters(&engine, config.objects).unwrap();
    let result = stress_concurrent_increments(&engine, &counters, &config);

    assert_eq!(result.failed, 0);
    assert_eq!(counter_total(&engine, &counters).unwrap(), 160);
}

// Cache idempotence

#[test]
fn repeated_render_returns_the_same_result() {
    let (engine, demo) = setup();
    let first = engine.call(&demo, "render", &[]).unwrap();
    let evaluations = engine.stats().cache_evaluations();
    let hits = engine.stats().cache_hits();

    let second = engine.call(&demo, "render", &[]).unwrap();
    let third = engine.call(&demo, "render", &[]).unwrap();

    assert!(first.is_identical(&second));
    assert!(first.is_identical(&third));
    assert_eq!(engine.stats().cache_evaluations(), evaluations);
    assert_eq!(engine.stats().cache_hits(), hits + 2);
}

// Invalidation completeness

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn render_is_invalidated_by_every_title_change(titles in title_sequence_strategy()) {
        let (engine, demo) = setup();
        let render = engine.cache(&demo, "render").unwrap();
        let mut current = "Demo".to_string();

        for title in titles {
            engine.call(&demo, "render", &[]).unwrap();
            prop_assert!(!render.is_invalid());

            engine.call(&demo, "rename", &[Value::from(title.as_str())]).unwrap();
            prop_assert_eq!(render.is_invalid(), title != current);

            let html = engine.call(&demo, "render", &[]).unwrap();
            prop_assert!(html.to_string().contains(&title));
            current = title;
        }
    }
}

#[test]
fn adding_a_user_invalidates_render() {
    let (engine, demo) = setup();
    let render = engine.cache(&demo, "render").unwrap();
    engine.call(&demo, "render", &[]).unwrap();

    engine.call(&demo, "add_user", &[Value::from("ada")]).unwrap();
    assert!(render.is_invalid());
    assert_eq!(
        engine.call(&demo, "render", &[]).unwrap(),
        Value::from("<h1>Demo</h1><p>1 users</p>")
    );
}

// Reentrance policies

fn load_setup(policy: Reentrance) -> (Engine, ObjectHandle, Arc<Monitor>) {
    init_tracing();
    let monitor = Monitor::new("loading");
    let engine = Engine::new();
    let ty = async_demo_type(policy, Some(Arc::clone(&monitor)));
    let demo = create_async_demo(&engine, &ty).unwrap();
    (engine, demo, monitor)
}

#[tokio::test]
async fn cancel_previous_keeps_only_the_last_load() {
    let (engine, demo, monitor) = load_setup(Reentrance::CancelPrevious);

    let (a, b, c) = tokio::join!(
        engine.call_async(&demo, "load", load_args("a", 300)),
        engine.call_async(&demo, "load", load_args("b", 200)),
        engine.call_async(&demo, "load", load_args("c", 500)),
    );

    assert!(a.unwrap_err().is_canceled());
    assert!(b.unwrap_err().is_canceled());
    assert_eq!(c.unwrap(), Value::from("c"));
    assert_eq!(engine.get(&demo, "url").unwrap(), Value::from("c"));
    assert_eq!(load_log(&engine, &demo).unwrap(), vec!["c/500".to_string()]);
    assert!(!monitor.is_active());
}

#[tokio::test]
async fn prevent_with_error_rejects_overlapping_loads_immediately() {
    let (engine, demo, monitor) = load_setup(Reentrance::PreventWithError);

    let mut first = engine.call_async(&demo, "load", load_args("a", 300));
    assert!(tokio::time::timeout(Duration::from_millis(20), &mut first)
        .await
        .is_err());
    assert_eq!(monitor.count(), 1);

    let started = Instant::now();
    let second = engine.call_async(&demo, "load", load_args("b", 200)).await;
    let third = engine.call_async(&demo, "load", load_args("c", 500)).await;
    assert!(second.unwrap_err().is_reentrance());
    assert!(third.unwrap_err().is_reentrance());
    assert!(started.elapsed() < Duration::from_millis(150));

    assert_eq!(first.await.unwrap(), Value::from("a"));
    assert_eq!(engine.get(&demo, "url").unwrap(), Value::from("a"));
    assert_eq!(load_log(&engine, &demo).unwrap(), vec!["a/300".to_string()]);
    assert_eq!(engine.stats().reentrance_rejections(), 2);
    assert_eq!(monitor.count(), 0);
}

#[tokio::test]
async fn wait_and_restart_runs_loads_in_turn() {
    let (engine, demo, _monitor) = load_setup(Reentrance::WaitAndRestart);

    let (a, b) = tokio::join!(
        engine.call_async(&demo, "load", load_args("a", 300)),
        engine.call_async(&demo, "load", load_args("b", 200)),
    );

    assert_eq!(a.unwrap(), Value::from("a"));
    assert_eq!(b.unwrap(), Value::from("b"));
    assert_eq!(
        load_log(&engine, &demo).unwrap(),
        vec!["a/300".to_string(), "b/200".to_string()]
    );
}

#[tokio::test]
async fn cancel_and_wait_starts_after_the_canceled_load_ends() {
    let (engine, demo, _monitor) = load_setup(Reentrance::CancelAndWaitPrevious);

    let started = Instant::now();
    let (a, b) = tokio::join!(
        engine.call_async(&demo, "load", load_args("a", 300)),
        engine.call_async(&demo, "load", load_args("b", 200)),
    );

    assert!(a.unwrap_err().is_canceled());
    assert_eq!(b.unwrap(), Value::from("b"));
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(load_log(&engine, &demo).unwrap(), vec!["b/200".to_string()]);
}

#[tokio::test]
async fn overwrite_previous_lets_the_later_commit_win() {
    let (engine, demo, _monitor) = load_setup(Reentrance::OverwritePrevious);

    let (a, b) = tokio::join!(
        engine.call_async(&demo, "load", load_args("a", 300)),
        engine.call_async(&demo, "load", load_args("b", 200)),
    );

    assert_eq!(a.unwrap(), Value::from("a"));
    assert_eq!(b.unwrap(), Value::from("b"));
    assert_eq!(engine.get(&demo, "url").unwrap(), Value::from("a"));
    assert_eq!(load_log(&engine, &demo).unwrap(), vec!["a/300".to_string()]);
}

#[tokio::test]
async fn run_side_by_side_lets_both_loads_apply() {
    let (engine, demo, _monitor) = load_setup(Reentrance::RunSideBySide);

    let (a, b) = tokio::join!(
        engine.call_async(&demo, "load", load_args("a", 300)),
        engine.call_async(&demo, "load", load_args("b", 200)),
    );

    // The earlier invocation commits last and is not rejected either.
    assert_eq!(a.unwrap(), Value::from("a"));
    assert_eq!(b.unwrap(), Value::from("b"));
    assert_eq!(engine.get(&demo, "url").unwrap(), Value::from("a"));
    assert_eq!(load_log(&engine, &demo).unwrap(), vec!["a/300".to_string()]);
    assert_eq!(engine.stats().conflicts(), 1);
}

#[test]
fn synchronous_call_of_async_load_is_rejected() {
    let (engine, demo, _monitor) = load_setup(Reentrance::CancelPrevious);
    let err = engine.call(&demo, "load", &load_args("a", 0)).unwrap_err();
    assert!(matches!(err, CoreError::InvalidOperation { .. }));
}

// Demo end to end

#[test]
fn demo_render_follows_title() {
    init_tracing();
    let engine = Engine::new();
    let demo = create_demo(&engine, &demo_type(), "Demo").unwrap();
    let view = create_demo_view(&engine, &demo_view_type(), &demo).unwrap();
    let events = engine.journal().subscribe();

    assert!(engine.call(&demo, "render", &[]).unwrap().to_string().contains("Demo"));
    assert!(engine.call(&view, "render", &[]).unwrap().to_string().contains("Demo"));
    let render = engine.cache(&demo, "render").unwrap();
    let view_render = engine.cache(&view, "render").unwrap();
    assert!(!render.is_invalid());

    engine
        .transaction("update title", |ctx| ctx.set(&demo, "title", "Updated"))
        .unwrap();
    assert!(render.is_invalid());
    assert!(view_render.is_invalid());

    let html = engine.call(&demo, "render", &[]).unwrap();
    assert!(html.to_string().contains("Updated"));
    assert!(!render.is_invalid());
    assert!(engine.call(&view, "render", &[]).unwrap().to_string().contains("Updated"));

    let event = events.try_recv().unwrap();
    assert_eq!(event.hint, "update title");
    let change = event.change(demo.id(), "title").unwrap();
    assert_eq!(change.old, Some(Value::from("Demo")));
    assert_eq!(change.new, Value::from("Updated"));
}

// Trigger ordering

#[test]
fn higher_priority_trigger_runs_first() {
    init_tracing();
    let log = TriggerLog::default();
    let engine = Engine::new();
    let watched = create_watched(&engine, &watched_type(&log), 1).unwrap();
    log.lock().clear();

    engine
        .transaction("bump", |ctx| ctx.set(&watched, "value", 2i64))
        .unwrap();

    assert_eq!(*log.lock(), vec!["high:2".to_string(), "low:2".to_string()]);
    assert!(!engine.cache(&watched, "high").unwrap().is_invalid());
    assert!(!engine.cache(&watched, "low").unwrap().is_invalid());
}

#[test]
fn unchanged_value_does_not_rerun_triggers() {
    init_tracing();
    let log = TriggerLog::default();
    let engine = Engine::new();
    let watched = create_watched(&engine, &watched_type(&log), 1).unwrap();
    log.lock().clear();

    engine
        .transaction("same", |ctx| ctx.set(&watched, "value", 1i64))
        .unwrap();
    assert!(log.lock().is_empty());
}

// Uninitialized fields

#[test]
fn reading_unassigned_field_fails() {
    init_tracing();
    let engine = Engine::new();
    let ty = demo_type();
    let demo = engine
        .transaction("partial", |ctx| ctx.create(&ty, [("users", Value::list(Vec::new()))]))
        .unwrap();

    let expected = CoreError::uninitialized_field("Demo", "title");
    assert_eq!(engine.get(&demo, "title").unwrap_err(), expected);
    assert_eq!(engine.call(&demo, "render", &[]).unwrap_err(), expected);

    engine.call(&demo, "rename", &[Value::from("Late")]).unwrap();
    assert_eq!(
        engine.call(&demo, "render", &[]).unwrap(),
        Value::from("<h1>Late</h1><p>0 users</p>")
    );
}
