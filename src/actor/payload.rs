//! Messages exchanged between actors.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::fiber::FiberId;
use crate::procedure::{LaunchSession, TestProcedure};
use crate::session::RoutingSession;

/// Type-erased argument bundle of an intercepted call.
pub type ArgsRef = Arc<dyn Any + Send + Sync>;

/// Type-erased value returned by a claimant or a unit of work.
pub type ReturnValue = Box<dyn Any + Send>;

/// A unit of asynchronous work run inside a launch procedure.
pub type UnitOfWork = Box<dyn FnOnce() -> ReturnValue + Send>;

/// Identity of a mocked entity (one interception point).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntityId {
    name: Arc<str>,
    instance: u64,
}

impl EntityId {
    /// Creates a new identity. Two identities created with the same name are
    /// still distinct.
    #[must_use]
    pub fn new(name: &str) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self {
            name: Arc::from(name),
            instance: COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.instance)
    }
}

/// Discriminant of a [`Payload`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// A call is about to be offered to test procedures.
    CallImminent,
    /// A test procedure is ready for the imminent call.
    AcknowledgeCallImminent,
    /// The argument bundle is shown to a candidate claimant.
    CallObserved,
    /// The claimant declined the call.
    DropCall,
    /// The claimant accepted the call.
    AcceptCall,
    /// The claimant may run the call's side effects.
    PerformAction,
    /// The claimant finished the call.
    ReturnResult,
    /// Start a unit of work in a launch procedure.
    StartLaunch,
    /// A unit of work finished.
    LaunchFinished,
    /// A test procedure has nothing to do until main acts.
    ResumeMainRequested,
    /// A test procedure's body returned.
    ProcedureExited,
    /// A test procedure is being torn down.
    ProcedureDestructing,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A message between actors. Exactly one kind; only that kind's data exists.
pub enum Payload {
    /// See [`PayloadKind::CallImminent`].
    CallImminent {
        /// The routing session for the call.
        originator: Weak<RoutingSession>,
        /// The mocked entity being called.
        entity: EntityId,
    },
    /// See [`PayloadKind::AcknowledgeCallImminent`].
    AcknowledgeCallImminent {
        /// The routing session being acknowledged.
        originator: Weak<RoutingSession>,
    },
    /// See [`PayloadKind::CallObserved`].
    CallObserved {
        /// The routing session for the call.
        originator: Weak<RoutingSession>,
        /// The mocked entity being called.
        entity: EntityId,
        /// The call's arguments.
        args: ArgsRef,
    },
    /// See [`PayloadKind::DropCall`].
    DropCall {
        /// The routing session for the call.
        originator: Weak<RoutingSession>,
        /// The test procedure that declined.
        responder: FiberId,
    },
    /// See [`PayloadKind::AcceptCall`].
    AcceptCall {
        /// The routing session for the call.
        originator: Weak<RoutingSession>,
        /// The test procedure that accepted.
        responder: FiberId,
    },
    /// See [`PayloadKind::PerformAction`].
    PerformAction {
        /// The routing session for the call.
        originator: Weak<RoutingSession>,
    },
    /// See [`PayloadKind::ReturnResult`].
    ReturnResult {
        /// The routing session for the call.
        originator: Weak<RoutingSession>,
        /// The test procedure that returned.
        responder: FiberId,
        /// The value, if the claimant supplied one.
        result: Option<ReturnValue>,
    },
    /// See [`PayloadKind::StartLaunch`].
    StartLaunch {
        /// The launch session owned by the starting test procedure.
        originator: Weak<LaunchSession>,
        /// The work to run.
        work: UnitOfWork,
        /// Description used to name the launch procedure.
        description: String,
    },
    /// See [`PayloadKind::LaunchFinished`].
    LaunchFinished {
        /// The launch session the work belonged to.
        originator: Weak<LaunchSession>,
        /// The launch procedure that ran it.
        responder: FiberId,
        /// What the work returned.
        result: ReturnValue,
    },
    /// See [`PayloadKind::ResumeMainRequested`].
    ResumeMainRequested {
        /// The idle test procedure.
        originator: Weak<TestProcedure>,
    },
    /// See [`PayloadKind::ProcedureExited`].
    ProcedureExited {
        /// The exited test procedure.
        originator: Weak<TestProcedure>,
    },
    /// See [`PayloadKind::ProcedureDestructing`].
    ProcedureDestructing {
        /// The test procedure being torn down.
        originator: Weak<TestProcedure>,
    },
}

impl Payload {
    /// Returns the kind of this payload.
    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::CallImminent { .. } => PayloadKind::CallImminent,
            Self::AcknowledgeCallImminent { .. } => PayloadKind::AcknowledgeCallImminent,
            Self::CallObserved { .. } => PayloadKind::CallObserved,
            Self::DropCall { .. } => PayloadKind::DropCall,
            Self::AcceptCall { .. } => PayloadKind::AcceptCall,
            Self::PerformAction { .. } => PayloadKind::PerformAction,
            Self::ReturnResult { .. } => PayloadKind::ReturnResult,
            Self::StartLaunch { .. } => PayloadKind::StartLaunch,
            Self::LaunchFinished { .. } => PayloadKind::LaunchFinished,
            Self::ResumeMainRequested { .. } => PayloadKind::ResumeMainRequested,
            Self::ProcedureExited { .. } => PayloadKind::ProcedureExited,
            Self::ProcedureDestructing { .. } => PayloadKind::ProcedureDestructing,
        }
    }

    /// The routing session a call-related payload belongs to.
    #[must_use]
    pub fn call_originator(&self) -> Option<&Weak<RoutingSession>> {
        match self {
            Self::CallImminent { originator, .. }
            | Self::AcknowledgeCallImminent { originator }
            | Self::CallObserved { originator, .. }
            | Self::DropCall { originator, .. }
            | Self::AcceptCall { originator, .. }
            | Self::PerformAction { originator }
            | Self::ReturnResult { originator, .. } => Some(originator),
            _ => None,
        }
    }

    /// The launch session a launch-related payload belongs to.
    #[must_use]
    pub fn launch_originator(&self) -> Option<&Weak<LaunchSession>> {
        match self {
            Self::StartLaunch { originator, .. } | Self::LaunchFinished { originator, .. } => {
                Some(originator)
            }
            _ => None,
        }
    }

    /// The test procedure a procedure-status payload came from.
    #[must_use]
    pub fn procedure_originator(&self) -> Option<&Weak<TestProcedure>> {
        match self {
            Self::ResumeMainRequested { originator }
            | Self::ProcedureExited { originator }
            | Self::ProcedureDestructing { originator } => Some(originator),
            _ => None,
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind())?;
        if let Some(originator) = self.call_originator() {
            write!(f, "o={:p}", originator.as_ptr())?;
        } else if let Some(originator) = self.launch_originator() {
            write!(f, "o={:p}", originator.as_ptr())?;
        } else if let Some(originator) = self.procedure_originator() {
            write!(f, "o={:p}", originator.as_ptr())?;
        }
        match self {
            Self::CallImminent { entity, .. } | Self::CallObserved { entity, .. } => {
                write!(f, ", \"{entity}\"")?;
            }
            Self::DropCall { responder, .. }
            | Self::AcceptCall { responder, .. }
            | Self::LaunchFinished { responder, .. } => write!(f, ", r={responder}")?,
            Self::ReturnResult {
                responder, result, ..
            } => write!(f, ", r={responder}, has_value={}", result.is_some())?,
            Self::StartLaunch { description, .. } => write!(f, ", \"{description}\"")?,
            _ => {}
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
