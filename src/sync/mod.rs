//! Pre-call synchroniser.
//!
//! Before an intercepted call is offered to anyone, every live test procedure
//! is told that a call is imminent and must acknowledge it. This guarantees
//! that each procedure is parked in a known place (waiting for its next event)
//! when the call is shown to it.
//!
//! The synchroniser is an [`Actor`] driven entirely by the trampoline. At rest
//! it is either [`SyncState::Idle`] or [`SyncState::WaitingForAck`]; the other
//! states are passed through within a single `receive`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::actor::{Actor, EntityId, Payload, Reply};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::procedure::TestProcedure;
use crate::session::RoutingSession;

/// States of the broadcast/acknowledge cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// No call in flight.
    Idle,
    /// A call-imminent notice arrived; about to snapshot procedures.
    Start,
    /// Choosing the next procedure to notify.
    Working,
    /// One notice is out; waiting for its acknowledgement.
    WaitingForAck,
    /// Every procedure acknowledged; about to answer the caller.
    Complete,
    /// Forwarding a status message from a procedure to main.
    PassToMain,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One recorded state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// State before.
    pub from: SyncState,
    /// State after.
    pub to: SyncState,
}

/// Counters accumulated over the synchroniser's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SynchroniserStats {
    /// Broadcast cycles started.
    pub cycles: u64,
    /// Call-imminent notices sent to procedures.
    pub notices_sent: u64,
    /// Notices answered by "nothing to do" or "exited" instead of an
    /// acknowledgement.
    pub implicit_acks: u64,
}

struct OpenCall {
    session: Weak<RoutingSession>,
    entity: EntityId,
}

struct Inner {
    state: SyncState,
    open: Option<OpenCall>,
    queue: VecDeque<Weak<TestProcedure>>,
    in_flight: Option<Weak<TestProcedure>>,
    stats: SynchroniserStats,
    transitions: VecDeque<Transition>,
    capacity: usize,
}

impl Inner {
    fn transition(&mut self, to: SyncState) {
        trace!(from = %self.state, %to, "synchroniser transition");
        if self.capacity > 0 {
            if self.transitions.len() == self.capacity {
                self.transitions.pop_front();
            }
            self.transitions.push_back(Transition {
                from: self.state,
                to,
            });
        }
        self.state = to;
    }

    fn next_live(&mut self) -> Option<Arc<TestProcedure>> {
        while let Some(weak) = self.queue.pop_front() {
            match weak.upgrade() {
                Some(procedure) if !procedure.is_exited() => return Some(procedure),
                _ => {}
            }
        }
        None
    }
}

/// Broadcasts call-imminent notices and collects acknowledgements.
pub struct Synchroniser {
    inner: Mutex<Inner>,
    strict: bool,
}

impl Synchroniser {
    /// Creates an idle synchroniser.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SyncState::Idle,
                open: None,
                queue: VecDeque::new(),
                in_flight: None,
                stats: SynchroniserStats::default(),
                transitions: VecDeque::new(),
                capacity: config.transition_log_capacity,
            }),
            strict: config.strict_acknowledgement,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SyncState {
        self.inner.lock().state
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> SynchroniserStats {
        self.inner.lock().stats
    }

    /// The most recent transitions, oldest first.
    #[must_use]
    pub fn transitions(&self) -> Vec<Transition> {
        self.inner.lock().transitions.iter().copied().collect()
    }

    /// Sends the next notice, or completes the cycle if nobody is left.
    fn step(&self, engine: &Engine, inner: &mut Inner) -> Result<Reply> {
        let Some(open) = inner.open.as_ref() else {
            return Err(Error::protocol("synchroniser cycle has no open call"));
        };
        let session = open.session.clone();
        let entity = open.entity.clone();

        if let Some(procedure) = inner.next_live() {
            if inner.state == SyncState::Start {
                inner.transition(SyncState::Working);
            }
            inner.transition(SyncState::WaitingForAck);
            inner.in_flight = Some(Arc::downgrade(&procedure));
            inner.stats.notices_sent += 1;
            debug!(procedure = %procedure.describe(), %entity, "sending call-imminent notice");
            return Ok(Reply::to(
                procedure,
                Payload::CallImminent {
                    originator: session,
                    entity,
                },
            ));
        }

        inner.transition(SyncState::Complete);
        inner.open = None;
        inner.transition(SyncState::Idle);

        let Some(live) = session.upgrade() else {
            return Err(Error::protocol(format!(
                "call to {entity} ended before its broadcast completed"
            )));
        };
        let destination = live.reply_destination(engine)?;
        Ok(Reply::to(
            destination,
            Payload::AcknowledgeCallImminent {
                originator: session,
            },
        ))
    }
}

impl Actor for Synchroniser {
    fn receive(&self, engine: &Engine, payload: Payload) -> Result<Reply> {
        let mut inner = self.inner.lock();
        match payload {
            Payload::CallImminent { originator, entity } => {
                if inner.state != SyncState::Idle {
                    return Err(Error::protocol(format!(
                        "call to {entity} became imminent while another broadcast is open"
                    )));
                }
                inner.open = Some(OpenCall {
                    session: originator,
                    entity,
                });
                inner.transition(SyncState::Start);
                inner.queue = engine
                    .live_test_procedures()
                    .iter()
                    .map(Arc::downgrade)
                    .collect();
                inner.stats.cycles += 1;
                self.step(engine, &mut inner)
            }

            Payload::AcknowledgeCallImminent { originator } => {
                if inner.state != SyncState::WaitingForAck {
                    return Err(Error::protocol(format!(
                        "acknowledgement received in state {}",
                        inner.state
                    )));
                }
                let matches = inner
                    .open
                    .as_ref()
                    .is_some_and(|open| open.session.ptr_eq(&originator));
                if !matches {
                    return Err(Error::protocol(
                        "acknowledgement does not match the open call",
                    ));
                }
                inner.in_flight = None;
                inner.transition(SyncState::Working);
                self.step(engine, &mut inner)
            }

            Payload::ResumeMainRequested { ref originator }
            | Payload::ProcedureExited { ref originator } => {
                if inner.state == SyncState::WaitingForAck {
                    let from_in_flight = inner
                        .in_flight
                        .as_ref()
                        .is_some_and(|in_flight| in_flight.ptr_eq(originator));
                    if !from_in_flight {
                        return Err(Error::protocol(format!(
                            "{payload} from a procedure that was not notified"
                        )));
                    }
                    if self.strict && matches!(payload, Payload::ResumeMainRequested { .. }) {
                        return Err(Error::protocol(
                            "procedure asked to resume main instead of acknowledging a call",
                        ));
                    }
                    warn!(%payload, "treating reply as implicit acknowledgement");
                    inner.stats.implicit_acks += 1;
                    inner.in_flight = None;
                    inner.transition(SyncState::Working);
                    return self.step(engine, &mut inner);
                }

                inner.transition(SyncState::PassToMain);
                inner.transition(SyncState::Idle);
                Ok(Reply::to(engine.main_proxy(), payload))
            }

            other => Err(Error::protocol(format!(
                "synchroniser cannot handle {other}"
            ))),
        }
    }

    fn describe(&self) -> String {
        format!("Synchroniser({})", self.state())
    }
}
