//! The actor contract and the main-proxy sentinel.
//!
//! Every participant in the engine (test procedures, launch procedures, the
//! launch pool, the pre-call synchroniser) is an [`Actor`]: it receives one
//! [`Payload`] and answers with a [`Reply`] naming the next destination. The
//! trampoline in [`Engine`](crate::Engine) keeps redelivering until a reply is
//! addressed to the [`MainProxy`].

pub mod payload;

use std::fmt;
use std::sync::Arc;

pub use payload::{ArgsRef, EntityId, Payload, PayloadKind, ReturnValue, UnitOfWork};

use crate::engine::Engine;
use crate::error::{Error, Result};

/// A participant that receives payloads and routes replies.
pub trait Actor: Send + Sync {
    /// Handles `payload` and returns the reply plus where it goes next.
    fn receive(&self, engine: &Engine, payload: Payload) -> Result<Reply>;

    /// Short description for diagnostics.
    fn describe(&self) -> String;

    /// Returns true only for the main proxy.
    fn is_main(&self) -> bool {
        false
    }
}

impl fmt::Debug for dyn Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// A payload and its destination.
pub struct Reply {
    /// The message to deliver.
    pub payload: Payload,
    /// The actor that receives it. `None` is a protocol violation.
    pub destination: Option<Arc<dyn Actor>>,
}

impl Reply {
    /// A reply addressed to `destination`.
    #[must_use]
    pub fn to(destination: Arc<dyn Actor>, payload: Payload) -> Self {
        Self {
            payload,
            destination: Some(destination),
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("payload", &self.payload)
            .field(
                "destination",
                &self.destination.as_ref().map(|actor| actor.describe()),
            )
            .finish()
    }
}

/// Sentinel standing for the non-procedure driver. Reaching it ends a
/// trampoline run.
#[derive(Debug, Default)]
pub struct MainProxy;

impl Actor for MainProxy {
    fn receive(&self, _engine: &Engine, payload: Payload) -> Result<Reply> {
        Err(Error::protocol(format!(
            "main proxy cannot receive {payload}"
        )))
    }

    fn describe(&self) -> String {
        "MainProxy".to_string()
    }

    fn is_main(&self) -> bool {
        true
    }
}
