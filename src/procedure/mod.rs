//! Procedures: test bodies and the launch procedures that run their
//! asynchronous work.

mod launch;
mod pool;

pub use launch::{LaunchHandle, LaunchProcedure, LaunchSession};
pub use pool::{ActiveSource, LaunchPool};
pub use test::{TestContext, TestHandle, TestProcedure};
