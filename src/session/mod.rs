//! Per-call routing sessions.
//!
//! A [`RoutingSession`] is created when a mocked entity is called. It drives
//! the call through the pre-call broadcast, offers it to candidate test
//! procedures, and collects the claimant's result. Calls made while main is
//! active (exterior) and calls made inside a launch procedure (interior) share
//! one state machine; they differ only in the [`Route`] used to hand payloads
//! onward.

pub mod event;

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::actor::{Actor, ArgsRef, EntityId, Payload, ReturnValue};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::fiber::FiberId;
use crate::procedure::{LaunchProcedure, LaunchSession, TestProcedure};

pub use event::{Event, LaunchResultEvent, MockCallEvent};

/// States of a routed call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallPhase {
    /// Created; the broadcast may not have finished yet.
    PreNotice,
    /// A claimant is looking at the arguments.
    Seen,
    /// The last claimant declined.
    Dropped,
    /// A claimant took the call and has not returned yet.
    Accepted,
    /// The claimant returned. Terminal.
    Returned,
}

impl CallPhase {
    /// Whether moving from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition_to(self, next: CallPhase) -> bool {
        matches!(
            (self, next),
            (CallPhase::PreNotice | CallPhase::Dropped, CallPhase::Seen)
                | (CallPhase::Seen, CallPhase::Dropped | CallPhase::Accepted)
                | (CallPhase::Accepted, CallPhase::Returned)
        )
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Where an intercepted call was made from.
#[derive(Clone)]
pub enum CallSource {
    /// The driving thread.
    Main,
    /// Inside a launch procedure's unit of work.
    Launch(Weak<LaunchProcedure>),
}

impl fmt::Debug for CallSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallSource::Main => write!(f, "Main"),
            CallSource::Launch(procedure) => match procedure.upgrade() {
                Some(procedure) => write!(f, "Launch({})", procedure.describe()),
                None => write!(f, "Launch(<expired>)"),
            },
        }
    }
}

type ToSynchroniser = fn(&RoutingSession, Payload) -> Result<Payload>;
type ToHandler = fn(&RoutingSession, &Arc<TestProcedure>, Payload) -> Result<Payload>;

/// How a session hands payloads onward and waits for the answer.
#[derive(Clone, Copy)]
pub struct Route {
    to_synchroniser: ToSynchroniser,
    to_handler: ToHandler,
}

impl Route {
    /// Delivers through the trampoline from the driving thread.
    fn exterior() -> Self {
        Self {
            to_synchroniser: |session, payload| {
                let sync = session.engine.synchroniser();
                session.engine.deliver_from_main(sync, payload)
            },
            to_handler: |session, handler, payload| {
                session
                    .engine
                    .deliver_from_main(Arc::clone(handler) as Arc<dyn Actor>, payload)
            },
        }
    }

    /// Suspends the calling launch procedure; its own routing takes it from
    /// there.
    fn interior() -> Self {
        Self {
            to_synchroniser: |session, payload| session.suspend_source(payload),
            to_handler: |session, _handler, payload| session.suspend_source(payload),
        }
    }
}

struct SessionState {
    phase: CallPhase,
    acknowledged: bool,
    handler: Option<Arc<TestProcedure>>,
    declined: HashSet<FiberId>,
    responder: Option<FiberId>,
}

/// Coordinator for one intercepted call.
pub struct RoutingSession {
    this: Weak<RoutingSession>,
    engine: Engine,
    entity: EntityId,
    args: ArgsRef,
    source: CallSource,
    via_launch: Weak<LaunchSession>,
    route: Route,
    state: Mutex<SessionState>,
}

impl RoutingSession {
    pub(crate) fn new(
        engine: &Engine,
        entity: EntityId,
        args: ArgsRef,
        source: CallSource,
    ) -> Arc<Self> {
        let (route, via_launch) = match &source {
            CallSource::Main => (Route::exterior(), Weak::new()),
            CallSource::Launch(procedure) => (
                Route::interior(),
                procedure
                    .upgrade()
                    .and_then(|procedure| procedure.current_session())
                    .as_ref()
                    .map(Arc::downgrade)
                    .unwrap_or_default(),
            ),
        };
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            engine: engine.clone(),
            entity,
            args,
            source,
            via_launch,
            route,
            state: Mutex::new(SessionState {
                phase: CallPhase::PreNotice,
                acknowledged: false,
                handler: None,
                declined: HashSet::new(),
                responder: None,
            }),
        })
    }

    /// The mocked entity being called.
    #[must_use]
    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    /// The call's argument bundle.
    #[must_use]
    pub fn args(&self) -> &ArgsRef {
        &self.args
    }

    /// Where the call was made from.
    #[must_use]
    pub fn source(&self) -> &CallSource {
        &self.source
    }

    /// Returns true if the call was made while main was active.
    #[must_use]
    pub fn is_from_main(&self) -> bool {
        matches!(self.source, CallSource::Main)
    }

    /// The launch procedure the call was made from, if it still exists.
    #[must_use]
    pub fn launch_source(&self) -> Option<Arc<LaunchProcedure>> {
        match &self.source {
            CallSource::Main => None,
            CallSource::Launch(procedure) => procedure.upgrade(),
        }
    }

    /// The launch session whose work made the call, fixed when the call was
    /// intercepted. `None` for calls from main or once that session is gone.
    #[must_use]
    pub fn launch_session(&self) -> Option<Arc<LaunchSession>> {
        self.via_launch.upgrade()
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> CallPhase {
        self.state.lock().phase
    }

    /// The test procedure currently holding the call.
    #[must_use]
    pub fn handler(&self) -> Option<Arc<TestProcedure>> {
        self.state.lock().handler.clone()
    }

    /// Returns true if the procedure `id` declined this call.
    #[must_use]
    pub fn was_declined_by(&self, id: FiberId) -> bool {
        self.state.lock().declined.contains(&id)
    }

    /// The actor that answers meant for the caller are delivered to.
    pub fn reply_destination(&self, engine: &Engine) -> Result<Arc<dyn Actor>> {
        match &self.source {
            CallSource::Main => Ok(engine.main_proxy()),
            CallSource::Launch(procedure) => match procedure.upgrade() {
                Some(procedure) => Ok(procedure),
                None => Err(Error::protocol(format!(
                    "launch procedure calling {} no longer exists",
                    self.entity
                ))),
            },
        }
    }

    fn weak(&self) -> Weak<RoutingSession> {
        self.this.clone()
    }

    fn is_mine(&self, originator: &Weak<RoutingSession>) -> bool {
        originator.ptr_eq(&self.this)
    }

    fn suspend_source(&self, payload: Payload) -> Result<Payload> {
        let Some(procedure) = self.launch_source() else {
            return Err(Error::protocol(format!(
                "launch procedure calling {} no longer exists",
                self.entity
            )));
        };
        procedure
            .suspender()
            .suspend(payload)
            .ok_or_else(|| Error::protocol("launch procedure resumed without a payload"))
    }

    fn set_phase(state: &mut SessionState, next: CallPhase) -> Result<()> {
        if !state.phase.can_transition_to(next) {
            return Err(Error::usage(format!(
                "call cannot move from {} to {next}",
                state.phase
            )));
        }
        state.phase = next;
        Ok(())
    }

    /// Runs the pre-call broadcast. Returns once every live test procedure
    /// has acknowledged.
    pub fn notify_imminent(&self) -> Result<()> {
        {
            let state = self.state.lock();
            if state.acknowledged || state.phase != CallPhase::PreNotice {
                return Err(Error::usage(format!(
                    "broadcast for {} already ran",
                    self.entity
                )));
            }
        }

        debug!(entity = %self.entity, source = ?self.source, "call imminent");
        let reply = (self.route.to_synchroniser)(
            self,
            Payload::CallImminent {
                originator: self.weak(),
                entity: self.entity.clone(),
            },
        )?;

        match reply {
            Payload::AcknowledgeCallImminent { ref originator } if self.is_mine(originator) => {
                self.state.lock().acknowledged = true;
                Ok(())
            }
            other => Err(Error::protocol(format!(
                "expected acknowledgement for {}, got {other}",
                self.entity
            ))),
        }
    }

    /// Offers the call to `handler`. Returns true if it accepted.
    ///
    /// Returns false without contacting the handler if it already declined
    /// this call or has exited.
    pub fn observe_call_locked(&self, handler: &Arc<TestProcedure>) -> Result<bool> {
        {
            let mut state = self.state.lock();
            if !state.acknowledged {
                return Err(Error::usage(format!(
                    "{} offered before its broadcast completed",
                    self.entity
                )));
            }
            if state.declined.contains(&handler.id()) || handler.is_exited() {
                return Ok(false);
            }
            Self::set_phase(&mut state, CallPhase::Seen)?;
            state.handler = Some(Arc::clone(handler));
        }

        debug!(entity = %self.entity, handler = %handler.describe(), "offering call");
        let reply = (self.route.to_handler)(
            self,
            handler,
            Payload::CallObserved {
                originator: self.weak(),
                entity: self.entity.clone(),
                args: Arc::clone(&self.args),
            },
        )?;

        let mut state = self.state.lock();
        match reply {
            Payload::DropCall {
                ref originator,
                responder,
            } if self.is_mine(originator) => {
                Self::set_phase(&mut state, CallPhase::Dropped)?;
                state.declined.insert(responder);
                state.handler = None;
                Ok(false)
            }
            Payload::AcceptCall {
                ref originator,
                responder,
            } if self.is_mine(originator) => {
                Self::set_phase(&mut state, CallPhase::Accepted)?;
                state.responder = Some(responder);
                Ok(true)
            }
            other => Err(Error::protocol(format!(
                "expected drop or accept for {}, got {other}",
                self.entity
            ))),
        }
    }

    /// Lets the claimant perform its actions and collects its result.
    ///
    /// Only legal once, after the call was accepted.
    pub fn perform_and_return_unlocked(&self) -> Result<Option<ReturnValue>> {
        let handler = {
            let state = self.state.lock();
            if state.phase != CallPhase::Accepted {
                return Err(Error::usage(format!(
                    "cannot return {} in phase {}",
                    self.entity, state.phase
                )));
            }
            state
                .handler
                .clone()
                .ok_or_else(|| Error::protocol("accepted call has no handler"))?
        };

        let reply = (self.route.to_handler)(
            self,
            &handler,
            Payload::PerformAction {
                originator: self.weak(),
            },
        )?;

        let mut state = self.state.lock();
        match reply {
            Payload::ReturnResult {
                ref originator,
                responder,
                result,
            } if self.is_mine(originator) => {
                if state.responder != Some(responder) {
                    return Err(Error::protocol(format!(
                        "{responder} returned a call accepted by someone else"
                    )));
                }
                Self::set_phase(&mut state, CallPhase::Returned)?;
                state.handler = None;
                debug!(entity = %self.entity, has_value = result.is_some(), "call returned");
                Ok(result)
            }
            other => Err(Error::protocol(format!(
                "expected a return for {}, got {other}",
                self.entity
            ))),
        }
    }
}

impl fmt::Debug for RoutingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingSession")
            .field("entity", &self.entity)
            .field("source", &self.source)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}
