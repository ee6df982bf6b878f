//! Example: Launching work from a test body
//!
//! This example shows a test body starting a unit of work that makes its own
//! mock calls, answering those calls, and collecting the work's result.

use std::sync::Arc;

use testkit_coro::prelude::*;

fn main() {
    println!("🧰 testkit-coro - Launched Work\n");

    example_collect_result();
    example_answer_launched_calls();
    example_pool_lifecycle();

    println!("\n✅ All launch examples completed!");
}

/// Launch work and wait for its result
fn example_collect_result() {
    println!("📌 Example 1: Collecting a Result");
    println!("   The body blocks in next_event() until the work finishes\n");

    let engine = Engine::new();
    let test = engine.spawn_test("summer", |ctx| {
        let handle = ctx.launch(|| (1..=10).sum::<u32>(), "sum 1..=10");
        let event = ctx.next_event();
        assert!(event.is_launch_result_of(&handle));
        println!("   Body: {} = {}", handle.description(), event.take_result(&handle));
    });
    test.finish();
    println!();
}

/// The body answers the calls its launched work makes
fn example_answer_launched_calls() {
    println!("📌 Example 2: Answering Calls from Launched Work");
    println!("   A client function runs in a launch; the body plays the server\n");

    let engine = Engine::new();
    let request = Arc::new(MockFn::new(&engine, "request", |_: &String| 500_u16));

    let body_request = Arc::clone(&request);
    let test = engine.spawn_test("server", move |ctx| {
        body_request.watch(ctx);

        let client = Arc::clone(&body_request);
        let handle = ctx.launch(
            move || {
                let login = client.call("POST /login".to_string());
                let profile = client.call("GET /profile".to_string());
                (login, profile)
            },
            "client session",
        );

        for status in [200_u16, 404] {
            let call = ctx.wait_for_call_from(&handle);
            println!(
                "   Body: {} -> {status}",
                call.args::<String>().map_or("?", String::as_str)
            );
            call.return_value(status);
        }

        let result = ctx.wait_for_result();
        let (login, profile) = result.take_result(&handle);
        println!("   Body: client saw login={login} profile={profile}");
    });

    println!("   Calls recorded: {}", request.call_count());
    test.finish();
    println!();
}

/// Launch procedures are pooled and reused
fn example_pool_lifecycle() {
    println!("📌 Example 3: Launch Pool");
    println!("   Finished launches leave idle procedures behind for reuse\n");

    let engine = Engine::new();
    let test = engine.spawn_test("batch", |ctx| {
        for i in 1..=3_u64 {
            let handle = ctx.launch(move || i * i, &format!("square {i}"));
            let event = ctx.next_event();
            println!("   Body: square {i} = {}", event.take_result(&handle));
        }
    });
    test.finish();

    println!("   Pool size after the test: {}", engine.pool_len());
    println!("   Removed by cleanup: {}", engine.cleanup());
    println!("   Pool size now: {}", engine.pool_len());
    println!();
}
