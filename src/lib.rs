//! # testkit-coro
//!
//! > Sequential test bodies for asynchronous interleavings
//!
//! **testkit-coro** lets a test describe the expected interleaving of
//! intercepted calls and asynchronous work as ordinary sequential code. Each
//! test body runs as a resumable procedure; launched work runs in launch
//! procedures; exactly one of them executes at any instant, and every
//! intercepted call is routed to exactly one body for acceptance, inspection
//! and response.
//!
//! ## Quick Start
//!
//! ```rust
//! use testkit_coro::prelude::*;
//!
//! let engine = Engine::new();
//! let fetch = MockFn::new(&engine, "fetch", |_: &u32| String::new());
//!
//! let f = fetch.entity().clone();
//! let test = engine.spawn_test("fetcher", move |ctx| {
//!     let call = ctx.wait_for_call(&f);
//!     assert_eq!(call.args::<u32>(), Some(&7));
//!     call.return_value("seven".to_string());
//! });
//! fetch.watch(&test);
//!
//! assert_eq!(fetch.call(7), "seven");
//! test.finish();
//! ```
//!
//! ## Features
//!
//! - **Test procedures** - test bodies that wait for events
//! - **Launches** - run work that makes mock calls, collect its result later
//! - **Pre-call synchronisation** - every body is parked before a call is shown
//! - **Call routing** - drop, accept and return calls from inside a body

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod actor;
pub mod config;
mod engine;
pub mod error;
pub mod fiber;
pub mod mock;
pub mod procedure;
pub mod session;
pub mod sync;

/// Prelude for convenient imports
///
/// ```rust
/// use testkit_coro::prelude::*;
/// ```
pub mod prelude {
    pub use crate::actor::EntityId;
    pub use crate::config::EngineConfig;
    pub use crate::engine::Engine;
    pub use crate::error::{Error, Result};
    pub use crate::mock::matcher::{all_of, any_of, anything, eq, not, satisfies};
    pub use crate::mock::{Matcher, MockFn};
    pub use crate::procedure::{LaunchHandle, TestContext, TestHandle};
    pub use crate::session::{Event, LaunchResultEvent, MockCallEvent};
}

// Re-exports
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, Result};
pub use procedure::{LaunchHandle, TestContext, TestHandle};
pub use session::{Event, LaunchResultEvent, MockCallEvent};
