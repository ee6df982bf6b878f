//! Integration tests for launched work and the launch pool.

mod common;

use std::sync::{Arc, Weak};

use testkit_coro::actor::{MainProxy, Payload};
use testkit_coro::prelude::*;

/// A call made by launched work is offered like any other call.
#[test]
fn test_interior_call_routed_to_parent() {
    common::init_test_logging();
    let engine = Engine::new();
    let fetch = Arc::new(MockFn::new(&engine, "fetch", |_: &u32| 0_u32));

    let body_fetch = Arc::clone(&fetch);
    let test = engine.spawn_test("parent", move |ctx| {
        body_fetch.watch(ctx);

        let work_fetch = Arc::clone(&body_fetch);
        let handle = ctx.launch(move || work_fetch.call(7) + 1, "fetch plus one");

        let call = ctx.wait_for_call_from(&handle);
        assert!(call.is_call_to(body_fetch.entity()));
        assert!(!call.is_from_main());
        assert!(call.is_from(&handle));
        assert_eq!(call.args::<u32>(), Some(&7));
        call.return_value(41_u32);

        let result = ctx.wait_for_result();
        assert_eq!(result.description(), "fetch plus one");
        assert_eq!(result.take_result(&handle), 42);
    });

    assert!(test.is_exited());
    let record = fetch.last_call().unwrap();
    assert_eq!(record.handled_by, Some(test.procedure().id()));
    assert!(!record.fell_back);
    test.finish();
}

/// Another test body can answer a call made by launched work.
#[test]
fn test_interior_call_answered_by_sibling() {
    common::init_test_logging();
    let engine = Engine::new();
    let fetch = Arc::new(MockFn::new(&engine, "fetch", |_: &()| 0_i32));

    let entity = fetch.entity().clone();
    let server = engine.spawn_test("server", move |ctx| {
        let call = ctx.wait_for_call(&entity);
        assert!(!call.is_from_main());
        call.return_value(5_i32);
    });
    fetch.watch(&server);

    let work_fetch = Arc::clone(&fetch);
    let client = engine.spawn_test("client", move |ctx| {
        let handle = ctx.launch(move || work_fetch.call(()) + 1, "client work");
        let result = ctx.wait_for_result();
        assert_eq!(result.take_result(&handle), 6);
    });

    assert!(client.is_exited());
    assert_eq!(fetch.last_call().unwrap().handled_by, Some(server.procedure().id()));
    assert_eq!(engine.synchroniser_stats().notices_sent, 2);
    client.finish();
    server.finish();
}

/// Launched work sees itself as the active source.
#[test]
fn test_active_source_inside_launch() {
    common::init_test_logging();
    let engine = Engine::new();
    assert!(engine.find_active_source().unwrap().is_main());

    let test = engine.spawn_test("inspector", |ctx| {
        let engine = ctx.engine().clone();
        let handle = ctx.launch(
            move || engine.find_active_source().map(|source| !source.is_main()),
            "source check",
        );
        let event = ctx.next_event();
        assert!(event.take_result(&handle).unwrap());
    });
    test.finish();
}

/// A call event keeps naming the launch that made it after its procedure is
/// reused for other work.
#[test]
fn test_call_origin_survives_procedure_reuse() {
    common::init_test_logging();
    let engine = Engine::new();
    let fetch = Arc::new(MockFn::new(&engine, "fetch", |_: &()| 0_u8));

    let body_fetch = Arc::clone(&fetch);
    let test = engine.spawn_test("reuser", move |ctx| {
        body_fetch.watch(ctx);

        let work_fetch = Arc::clone(&body_fetch);
        let first = ctx.launch(move || work_fetch.call(()), "first");
        let call = ctx.wait_for_call_from(&first);
        call.return_value(1_u8);
        let result = ctx.wait_for_result();
        assert_eq!(result.take_result(&first), 1);
        assert!(call.is_from(&first));
        drop(result);
        drop(first);

        let second = ctx.launch(|| 2_u8, "second");
        let event = ctx.next_event();
        assert_eq!(event.take_result(&second), 2);
        assert!(!call.is_from(&second));
    });
    test.finish();

    assert_eq!(engine.pool_len(), 1);
    assert_eq!(fetch.call_count(), 1);
}

/// Waiting for a result confirms the launch; so does matching any result.
#[test]
fn test_collecting_result_confirms_launch() {
    common::init_test_logging();
    let engine = Engine::new();

    let test = engine.spawn_test("confirmer", |ctx| {
        let waited = ctx.launch(|| 3_u8, "waited");
        let result = ctx.wait_for_result();
        assert!(waited.is_complete());
        assert_eq!(result.take_result(&waited), 3);

        let matched = ctx.launch(|| (), "matched");
        let event = ctx.next_event();
        assert!(!matched.is_complete());
        assert!(event.is_launch_result());
        assert!(matched.is_complete());
    });
    test.finish();
}

/// Idle launch procedures are reused and removed by cleanup.
#[test]
fn test_pool_reuse_and_cleanup() {
    common::init_test_logging();
    let engine = Engine::new();

    let test = engine.spawn_test("sequential", |ctx| {
        for i in 0..3_u32 {
            let handle = ctx.launch(move || i, &format!("step {i}"));
            let event = ctx.next_event();
            assert_eq!(event.take_result(&handle), i);
        }
    });
    test.finish();

    assert_eq!(engine.pool_len(), 1);
    assert_eq!(engine.cleanup(), 1);
    assert_eq!(engine.cleanup(), 0);
    assert_eq!(engine.pool_len(), 0);
}

/// A launch with a confirmed but still referenced session is not idle.
#[test]
fn test_cleanup_keeps_referenced_sessions() {
    common::init_test_logging();
    let engine = Engine::new();
    let kept = Arc::new(parking_lot::Mutex::new(None));

    let body_kept = Arc::clone(&kept);
    let test = engine.spawn_test("keeper", move |ctx| {
        let handle = ctx.launch(|| (), "kept");
        assert!(ctx.next_event().is_launch_result_of(&handle));
        *body_kept.lock() = Some(handle);
    });
    test.finish();

    assert_eq!(engine.cleanup(), 0);
    assert_eq!(engine.pool_len(), 1);

    kept.lock().take();
    assert_eq!(engine.cleanup(), 1);
}

/// Launching while an event is waiting to be collected is rejected.
#[test]
#[should_panic(expected = "cannot launch before collecting the pending event")]
fn test_launch_with_pending_event_is_fatal() {
    common::init_test_logging();
    let engine = Engine::new();

    let _test = engine.spawn_test("hasty", |ctx| {
        let _first = ctx.launch(|| 1, "first");
        let _second = ctx.launch(|| 2, "second");
    });
}

/// Launch results cannot be dropped like calls.
#[test]
#[should_panic(expected = "cannot drop the result of launch \"work\"")]
fn test_dropping_launch_result_is_fatal() {
    common::init_test_logging();
    let engine = Engine::new();

    let _test = engine.spawn_test("dropper", |ctx| {
        let _handle = ctx.launch(|| (), "work");
        ctx.next_event().drop_call();
    });
}

/// A body that returns with an unconfirmed launch handle fails.
#[test]
#[should_panic(expected = "destroyed before its result was confirmed")]
fn test_body_returning_unconfirmed_launch_is_fatal() {
    common::init_test_logging();
    let engine = Engine::new();

    let _test = engine.spawn_test("careless", |ctx| {
        let _handle = ctx.launch(|| (), "ignored");
    });
}

/// Launch results cannot be accepted like calls.
#[test]
#[should_panic(expected = "cannot accept the result of launch \"work\"")]
fn test_accepting_launch_result_is_fatal() {
    common::init_test_logging();
    let engine = Engine::new();

    let _test = engine.spawn_test("acceptor", |ctx| {
        let _handle = ctx.launch(|| (), "work");
        ctx.next_event().accept();
    });
}

/// Launch results cannot be answered with a value.
#[test]
#[should_panic(expected = "cannot return from the result of launch \"work\"")]
fn test_returning_from_launch_result_is_fatal() {
    common::init_test_logging();
    let engine = Engine::new();

    let _test = engine.spawn_test("returner", |ctx| {
        let _handle = ctx.launch(|| (), "work");
        ctx.next_event().return_value(1_u8);
    });
}

/// A body cannot run the trampoline itself.
#[test]
#[should_panic(expected = "trampoline entered from inside")]
fn test_trampoline_from_body_is_fatal() {
    common::init_test_logging();
    let engine = Engine::new();

    let _test = engine.spawn_test("nested", |ctx| {
        let delivered = ctx.engine().deliver_from_main(
            Arc::new(MainProxy),
            Payload::ResumeMainRequested {
                originator: Weak::new(),
            },
        );
        if let Err(err) = delivered {
            panic!("{err}");
        }
    });
}

/// Launch procedures cannot be cleaned up from a body.
#[test]
#[should_panic(expected = "cannot clean up launch procedures from inside")]
fn test_cleanup_from_body_is_fatal() {
    common::init_test_logging();
    let engine = Engine::new();

    let _test = engine.spawn_test("tidy", |ctx| {
        ctx.engine().cleanup();
    });
}
