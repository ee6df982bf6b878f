//! Example: Watching mock calls from test bodies
//!
//! This example shows test bodies written as straight-line code that waits
//! for calls to a mocked function and decides how each one is answered.

use testkit_coro::prelude::*;

fn main() {
    println!("🧰 testkit-coro - Watching Mock Calls\n");

    example_answer_a_call();
    example_answer_in_order();
    example_priority_and_drop();
    example_matchers();

    println!("\n✅ All watch examples completed!");
}

/// One body answers one call
fn example_answer_a_call() {
    println!("📌 Example 1: Answering a Call");
    println!("   The body inspects the arguments and returns a value\n");

    let engine = Engine::new();
    let lookup = MockFn::new(&engine, "lookup", |_: &String| None::<u32>);

    let entity = lookup.entity().clone();
    let test = engine.spawn_test("directory", move |ctx| {
        let call = ctx.wait_for_call(&entity);
        let name = call.args::<String>().cloned().unwrap_or_default();
        println!("   Body: lookup({name}) was called");
        call.return_value(Some(7_u32));
    });
    lookup.watch(&test);

    let answer = lookup.call("alice".to_string());
    println!("   Caller: got {answer:?}");
    assert_eq!(answer, Some(7));
    test.finish();
    println!();
}

/// A body scripts a sequence of replies
fn example_answer_in_order() {
    println!("📌 Example 2: Scripted Sequence");
    println!("   Each call is answered by the next step of the body\n");

    let engine = Engine::new();
    let read = MockFn::new(&engine, "read", |_: &usize| Vec::<u8>::new());

    let entity = read.entity().clone();
    let test = engine.spawn_test("reader", move |ctx| {
        for chunk in [b"he".to_vec(), b"llo".to_vec()] {
            let call = ctx.wait_for_call(&entity);
            call.return_value(chunk);
        }
        // End of stream: let the mock fall back to an empty read.
        ctx.wait_for_call(&entity).return_empty();
    });
    read.watch(&test);

    let mut received = Vec::new();
    loop {
        let chunk = read.call(16);
        if chunk.is_empty() {
            break;
        }
        received.extend(chunk);
    }
    println!("   Caller: read {:?}", String::from_utf8_lossy(&received));
    println!("   Calls made: {}", read.call_count());
    test.finish();
    println!();
}

/// Later watches see calls first; dropping passes them on
fn example_priority_and_drop() {
    println!("📌 Example 3: Priority and Drop");
    println!("   The newest watcher drops the call, the older one answers\n");

    let engine = Engine::new();
    let send = MockFn::new(&engine, "send", |_: &&'static str| false);

    let entity = send.entity().clone();
    let fallback = engine.spawn_test("fallback", move |ctx| loop {
        let call = ctx.wait_for_call(&entity);
        println!("   Fallback body: accepting");
        call.return_value(true);
    });
    let picky = engine.spawn_test("picky", |ctx| loop {
        let event = ctx.next_event();
        if event.args::<&'static str>() == Some(&"urgent") {
            println!("   Picky body: taking the urgent message");
            event.return_value(true);
        } else {
            println!("   Picky body: dropping");
            event.drop_call();
        }
    });
    send.watch(&fallback);
    send.watch(&picky);

    send.call("hello");
    send.call("urgent");
    for record in send.calls() {
        println!("   {:?} handled by {:?}", record.args, record.handled_by);
    }
    picky.finish();
    fallback.finish();
    println!();
}

/// Watches can filter by argument
fn example_matchers() {
    println!("📌 Example 4: Matchers");
    println!("   Only calls that match reach the body\n");

    let engine = Engine::new();
    let charge = MockFn::new(&engine, "charge", |_: &u64| "approved");

    let entity = charge.entity().clone();
    let test = engine.spawn_test("fraud check", move |ctx| {
        let call = ctx.wait_for_call(&entity);
        println!("   Body: declining a charge of {:?}", call.args::<u64>());
        call.return_value("declined");
    });
    charge.watch_matching(&test, satisfies(|amount: &u64| *amount > 1_000, "over 1000"));

    for amount in [20, 5_000, 30] {
        println!("   charge({amount}) -> {}", charge.call(amount));
    }
    test.finish();
    println!();
}
