//! Events handed to a test body by [`TestContext::next_event`].
//!
//! [`TestContext::next_event`]: crate::TestContext::next_event

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;

use crate::actor::{ArgsRef, EntityId, ReturnValue};
use crate::error::{fatal, Error, Result};
use crate::procedure::{LaunchHandle, LaunchSession, TestProcedure};

use super::RoutingSession;

/// Something a test body waited for.
#[derive(Debug)]
pub enum Event {
    /// A mock call offered to this body.
    Call(MockCallEvent),
    /// A launch started by this body finished.
    LaunchResult(LaunchResultEvent),
}

impl Event {
    /// Returns true for a mock call.
    #[must_use]
    pub fn is_mock_call(&self) -> bool {
        matches!(self, Event::Call(_))
    }

    /// Returns true for any launch result, confirming its launch session.
    pub fn is_launch_result(&self) -> bool {
        match self {
            Event::Call(_) => false,
            Event::LaunchResult(result) => result.is_launch_result(),
        }
    }

    /// Returns true if this is the result of `handle`'s launch, confirming
    /// it.
    pub fn is_launch_result_of<R>(&self, handle: &LaunchHandle<R>) -> bool {
        match self {
            Event::Call(_) => false,
            Event::LaunchResult(result) => result.is_launch_result_of(handle),
        }
    }

    /// Returns true for a call to `entity`.
    #[must_use]
    pub fn is_call_to(&self, entity: &EntityId) -> bool {
        self.as_call().is_some_and(|call| call.is_call_to(entity))
    }

    /// Returns true for a call made while main was active.
    #[must_use]
    pub fn is_from_main(&self) -> bool {
        self.as_call().is_some_and(MockCallEvent::is_from_main)
    }

    /// Returns true for a call made from inside `handle`'s launch.
    #[must_use]
    pub fn is_from<R>(&self, handle: &LaunchHandle<R>) -> bool {
        self.as_call().is_some_and(|call| call.is_from(handle))
    }

    /// The call's arguments, if this is a call with arguments of type `A`.
    #[must_use]
    pub fn args<A: Any>(&self) -> Option<&A> {
        self.as_call().and_then(MockCallEvent::args::<A>)
    }

    /// Declines the call.
    ///
    /// # Panics
    ///
    /// Panics on a launch result: dropping one is never allowed.
    pub fn drop_call(&self) {
        self.expect_call("drop").drop_call();
    }

    /// Accepts the call.
    ///
    /// # Panics
    ///
    /// Panics on a launch result.
    pub fn accept(&self) {
        self.expect_call("accept").accept();
    }

    /// Returns `value` from the call, accepting it first if needed.
    ///
    /// # Panics
    ///
    /// Panics on a launch result.
    pub fn return_value<T: Any + Send>(&self, value: T) {
        self.expect_call("return from").return_value(value);
    }

    /// Returns from the call without a value, accepting it first if needed.
    ///
    /// # Panics
    ///
    /// Panics on a launch result.
    pub fn return_empty(&self) {
        self.expect_call("return from").return_empty();
    }

    /// Takes the result of `handle`'s launch.
    ///
    /// # Panics
    ///
    /// Panics unless this is the result of that launch.
    pub fn take_result<R: 'static>(&self, handle: &LaunchHandle<R>) -> R {
        match self {
            Event::Call(call) => fatal(Error::usage(format!(
                "call to {} is not a launch result",
                call.entity()
            ))),
            Event::LaunchResult(result) => result.take_result(handle),
        }
    }

    /// The call, if this is one.
    #[must_use]
    pub fn as_call(&self) -> Option<&MockCallEvent> {
        match self {
            Event::Call(call) => Some(call),
            Event::LaunchResult(_) => None,
        }
    }

    /// The launch result, if this is one.
    #[must_use]
    pub fn as_launch_result(&self) -> Option<&LaunchResultEvent> {
        match self {
            Event::Call(_) => None,
            Event::LaunchResult(result) => Some(result),
        }
    }

    fn expect_call(&self, operation: &str) -> &MockCallEvent {
        match self {
            Event::Call(call) => call,
            Event::LaunchResult(result) => fatal(Error::usage(format!(
                "cannot {operation} the result of launch \"{}\"",
                result.description()
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CallState {
    Seen,
    Dropped,
    Accepted,
    Returned,
}

/// A mock call offered to a test body.
///
/// Dropping the event while the call is still only seen declines it; dropping
/// it after accepting returns without a value.
pub struct MockCallEvent {
    procedure: Arc<TestProcedure>,
    session: Arc<RoutingSession>,
    args: ArgsRef,
    state: Mutex<CallState>,
}

impl MockCallEvent {
    pub(crate) fn new(
        procedure: Arc<TestProcedure>,
        session: Arc<RoutingSession>,
        args: ArgsRef,
    ) -> Self {
        Self {
            procedure,
            session,
            args,
            state: Mutex::new(CallState::Seen),
        }
    }

    /// The mocked entity being called.
    #[must_use]
    pub fn entity(&self) -> &EntityId {
        self.session.entity()
    }

    /// Returns true for a call to `entity`.
    #[must_use]
    pub fn is_call_to(&self, entity: &EntityId) -> bool {
        self.session.entity() == entity
    }

    /// The arguments, if they are of type `A`.
    #[must_use]
    pub fn args<A: Any>(&self) -> Option<&A> {
        self.args.downcast_ref::<A>()
    }

    /// Returns true if the call was made while main was active.
    #[must_use]
    pub fn is_from_main(&self) -> bool {
        self.session.is_from_main()
    }

    /// Returns true if the call was made from inside `handle`'s launch.
    #[must_use]
    pub fn is_from<R>(&self, handle: &LaunchHandle<R>) -> bool {
        self.session
            .launch_session()
            .is_some_and(|session| Arc::ptr_eq(&session, handle.session()))
    }

    /// The routing session behind this call.
    #[must_use]
    pub fn session(&self) -> &Arc<RoutingSession> {
        &self.session
    }

    fn originator(&self) -> Weak<RoutingSession> {
        Arc::downgrade(&self.session)
    }

    fn transition(&self, from: CallState, to: CallState, operation: &str) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(Error::usage(format!(
                "cannot {operation} call to {} in state {:?}",
                self.entity(),
                *state
            )));
        }
        *state = to;
        Ok(())
    }

    fn try_drop_call(&self) -> Result<()> {
        self.transition(CallState::Seen, CallState::Dropped, "drop")?;
        self.procedure.drop_call(self.originator())
    }

    fn try_accept(&self) -> Result<()> {
        self.transition(CallState::Seen, CallState::Accepted, "accept")?;
        self.procedure.accept_call(self.originator())
    }

    fn try_return(&self, result: Option<ReturnValue>) -> Result<()> {
        if *self.state.lock() == CallState::Seen {
            self.try_accept()?;
        }
        self.transition(CallState::Accepted, CallState::Returned, "return from")?;
        self.procedure.return_call(self.originator(), result)
    }

    /// Declines the call. Lower-priority watchers may still take it.
    ///
    /// # Panics
    ///
    /// Panics unless the call was only seen so far.
    pub fn drop_call(&self) {
        self.try_drop_call().unwrap_or_else(|err| fatal(err));
    }

    /// Takes the call. It must be returned before waiting for another event.
    ///
    /// # Panics
    ///
    /// Panics unless the call was only seen so far.
    pub fn accept(&self) {
        self.try_accept().unwrap_or_else(|err| fatal(err));
    }

    /// Returns `value` to the caller, accepting first if needed.
    ///
    /// # Panics
    ///
    /// Panics if the call was dropped or already returned.
    pub fn return_value<T: Any + Send>(&self, value: T) {
        self.try_return(Some(Box::new(value)))
            .unwrap_or_else(|err| fatal(err));
    }

    /// Returns without a value; the mock falls back to its default action.
    ///
    /// # Panics
    ///
    /// Panics if the call was dropped or already returned.
    pub fn return_empty(&self) {
        self.try_return(None).unwrap_or_else(|err| fatal(err));
    }
}

impl Drop for MockCallEvent {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        let state = *self.state.lock();
        let outcome = match state {
            CallState::Seen => self.try_drop_call(),
            CallState::Accepted => self.try_return(None),
            CallState::Dropped | CallState::Returned => Ok(()),
        };
        if let Err(err) = outcome {
            fatal(err);
        }
    }
}

impl fmt::Debug for MockCallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockCallEvent")
            .field("entity", self.entity())
            .field("from_main", &self.is_from_main())
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

/// The result of a finished launch.
pub struct LaunchResultEvent {
    originator: Weak<LaunchSession>,
    description: String,
    result: Mutex<Option<ReturnValue>>,
}

impl LaunchResultEvent {
    pub(crate) fn new(originator: Weak<LaunchSession>, result: ReturnValue) -> Self {
        let description = originator
            .upgrade()
            .map(|session| session.description().to_string())
            .unwrap_or_default();
        Self {
            originator,
            description,
            result: Mutex::new(Some(result)),
        }
    }

    /// The description given at launch.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Always true; confirms the launch session if it is still alive.
    pub fn is_launch_result(&self) -> bool {
        self.confirm();
        true
    }

    /// Marks the launch session complete if it is still alive.
    pub(crate) fn confirm(&self) {
        if let Some(session) = self.originator.upgrade() {
            session.mark_complete();
        }
    }

    /// Returns true if this is the result of `handle`'s launch, confirming
    /// it. A different or expired session yields false.
    pub fn is_launch_result_of<R>(&self, handle: &LaunchHandle<R>) -> bool {
        match self.originator.upgrade() {
            Some(session) if Arc::ptr_eq(&session, handle.session()) => {
                session.mark_complete();
                true
            }
            _ => false,
        }
    }

    /// Takes the result of `handle`'s launch.
    ///
    /// # Panics
    ///
    /// Panics if this is the result of a different launch, or the result was
    /// already taken.
    pub fn take_result<R: 'static>(&self, handle: &LaunchHandle<R>) -> R {
        if !self.is_launch_result_of(handle) {
            fatal(Error::usage(format!(
                "event is the result of \"{}\", not \"{}\"",
                self.description,
                handle.description()
            )));
        }
        let Some(result) = self.result.lock().take() else {
            fatal(Error::usage(format!(
                "result of \"{}\" already taken",
                self.description
            )));
        };
        match result.downcast::<R>() {
            Ok(value) => *value,
            Err(_) => fatal(Error::protocol(format!(
                "result of \"{}\" has an unexpected type",
                self.description
            ))),
        }
    }
}

impl fmt::Debug for LaunchResultEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchResultEvent")
            .field("description", &self.description)
            .field("taken", &self.result.lock().is_none())
            .finish()
    }
}
