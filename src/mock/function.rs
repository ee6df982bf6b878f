// Call-record accessors are often used only for their side effect in examples
#![allow(clippy::must_use_candidate)]

//! Mocked functions whose calls are routed to test procedures.
//!
//! A [`MockFn`] is one interception point. Every call runs the pre-call
//! broadcast, is offered to the watching test procedures (newest watch
//! first), and falls back to the function's default action when nobody takes
//! it or the claimant returns without a value.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::actor::{ArgsRef, EntityId};
use crate::engine::Engine;
use crate::error::{fatal, Error, Result};
use crate::fiber::FiberId;
use crate::procedure::{TestContext, TestHandle, TestProcedure};

use super::matcher::{anything, Matcher};

/// A record of a single call.
#[derive(Debug, Clone)]
pub struct CallRecord<A> {
    /// The arguments passed to the call.
    pub args: A,
    /// The test procedure that returned the call, if any.
    pub handled_by: Option<FiberId>,
    /// Whether the default action produced the result.
    pub fell_back: bool,
}

/// Something that identifies a test procedure to watch from.
pub trait WatchTarget {
    /// The procedure to register.
    fn watching_procedure(&self) -> Weak<TestProcedure>;
}

impl WatchTarget for TestHandle {
    fn watching_procedure(&self) -> Weak<TestProcedure> {
        Arc::downgrade(self.procedure())
    }
}

impl WatchTarget for TestContext {
    fn watching_procedure(&self) -> Weak<TestProcedure> {
        Arc::downgrade(self.procedure())
    }
}

struct Watch<A> {
    procedure: Weak<TestProcedure>,
    matcher: Arc<dyn Matcher<A>>,
}

impl<A> Clone for Watch<A> {
    fn clone(&self) -> Self {
        Self {
            procedure: self.procedure.clone(),
            matcher: Arc::clone(&self.matcher),
        }
    }
}

/// A mocked function taking `A` and returning `R`.
///
/// `A` is usually a tuple of the real function's arguments.
pub struct MockFn<A, R> {
    entity: EntityId,
    engine: Engine,
    fallback: Box<dyn Fn(&A) -> R + Send + Sync>,
    watches: Mutex<Vec<Watch<A>>>,
    exclusion: Mutex<()>,
    calls: Mutex<Vec<CallRecord<A>>>,
}

impl<A, R> MockFn<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    /// Creates a mocked function named `name`. Calls nobody returns a value
    /// for are answered by `fallback`.
    pub fn new<F>(engine: &Engine, name: &str, fallback: F) -> Self
    where
        F: Fn(&A) -> R + Send + Sync + 'static,
    {
        Self {
            entity: EntityId::new(name),
            engine: engine.clone(),
            fallback: Box::new(fallback),
            watches: Mutex::new(Vec::new()),
            exclusion: Mutex::new(()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// The identity used in events for calls to this function.
    #[must_use]
    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    /// Offers every call to `target`'s procedure. Later watches take
    /// priority over earlier ones.
    pub fn watch(&self, target: &impl WatchTarget) {
        self.watch_matching(target, anything());
    }

    /// Offers calls whose arguments match `matcher` to `target`'s procedure.
    pub fn watch_matching<M>(&self, target: &impl WatchTarget, matcher: M)
    where
        M: Matcher<A> + 'static,
    {
        let procedure = target.watching_procedure();
        let mut watches = self.watches.lock();
        watches.retain(|watch| watch.procedure.strong_count() > 0);
        watches.insert(
            0,
            Watch {
                procedure,
                matcher: Arc::new(matcher),
            },
        );
        debug!(entity = %self.entity, watches = watches.len(), "registered watch");
    }

    /// Calls the function.
    ///
    /// # Panics
    ///
    /// Panics when called from inside a test body, or on any protocol
    /// violation while routing the call.
    pub fn call(&self, args: A) -> R {
        self.try_call(args).unwrap_or_else(|err| fatal(err))
    }

    fn try_call(&self, args: A) -> Result<R> {
        let bundle: ArgsRef = Arc::new(args.clone());
        let session = self.engine.on_intercepted_call(self.entity.clone(), bundle)?;

        let claimant = {
            let _exclusion = self.exclusion.lock();
            let watches = self.watches.lock().clone();
            let mut claimant = None;
            for watch in watches {
                let Some(procedure) = watch.procedure.upgrade() else {
                    continue;
                };
                if !watch.matcher.matches(&args) {
                    trace!(
                        entity = %self.entity,
                        expected = %watch.matcher.describe(),
                        "watch does not match"
                    );
                    continue;
                }
                if session.observe_call_locked(&procedure)? {
                    claimant = Some(procedure.id());
                    break;
                }
            }
            claimant
        };

        let returned = match claimant {
            Some(_) => session.perform_and_return_unlocked()?,
            None => None,
        };

        let (result, fell_back) = match returned {
            Some(value) => match value.downcast::<R>() {
                Ok(value) => (*value, false),
                Err(_) => {
                    return Err(Error::usage(format!(
                        "value returned from {} has the wrong type",
                        self.entity
                    )))
                }
            },
            None => ((self.fallback)(&args), true),
        };

        self.calls.lock().push(CallRecord {
            args,
            handled_by: claimant,
            fell_back,
        });
        Ok(result)
    }

    /// Get all recorded calls.
    pub fn calls(&self) -> Vec<CallRecord<A>> {
        self.calls.lock().clone()
    }

    /// Get the number of times the function was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Check if the function was called at least once.
    #[must_use]
    pub fn was_called(&self) -> bool {
        self.call_count() > 0
    }

    /// Get the most recent call record.
    pub fn last_call(&self) -> Option<CallRecord<A>> {
        self.calls.lock().last().cloned()
    }

    /// Reset the call history. Watches stay registered.
    pub fn reset(&self) {
        self.calls.lock().clear();
    }
}

impl<A, R> fmt::Debug for MockFn<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockFn")
            .field("entity", &self.entity)
            .field("watches", &self.watches.lock().len())
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}
