//! A minimal mocking layer driving the engine end to end.
//!
//! - [`MockFn`] - a mocked function whose calls are offered to test bodies
//! - [`matcher`] - argument filters for watches
//!
//! # Watching calls
//!
//! ```rust
//! use testkit_coro::prelude::*;
//!
//! let engine = Engine::new();
//! let send = MockFn::new(&engine, "send", |_: &String| false);
//!
//! let entity = send.entity().clone();
//! let test = engine.spawn_test("sender", move |ctx| {
//!     let event = ctx.next_event();
//!     assert!(event.is_call_to(&entity));
//!     assert_eq!(event.args::<String>().map(String::as_str), Some("hello"));
//!     event.return_value(true);
//! });
//! send.watch(&test);
//!
//! assert!(send.call("hello".to_string()));
//! test.finish();
//! ```

mod function;
pub mod matcher;

pub use function::{CallRecord, MockFn, WatchTarget};
pub use matcher::Matcher;
