//! Launch procedures and the sessions that track them.
//!
//! A launch procedure runs one unit of asynchronous work at a time on behalf
//! of a test procedure. Mock calls made by the work are routed like any other
//! call, with the launch procedure suspending while the call is broadcast and
//! offered. When the work finishes, its result goes back to the test procedure
//! that started it as a [`LaunchFinished`](crate::actor::Payload::LaunchFinished)
//! payload.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::actor::{Actor, Payload, PayloadKind, Reply};
use crate::engine::Engine;
use crate::error::{fatal, Error, Result};
use crate::fiber::{Fiber, FiberId, Suspender};

use super::test::TestProcedure;

/// One launched unit of work, owned by the test body through its
/// [`LaunchHandle`].
///
/// Destroying a session before its result was confirmed (by matching a
/// launch-result event against it) is a lifecycle violation.
pub struct LaunchSession {
    parent: Weak<TestProcedure>,
    description: String,
    completed: AtomicBool,
}

impl LaunchSession {
    pub(crate) fn new(parent: Weak<TestProcedure>, description: &str) -> Self {
        Self {
            parent,
            description: description.to_string(),
            completed: AtomicBool::new(false),
        }
    }

    /// The test procedure that started the work.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<TestProcedure>> {
        self.parent.upgrade()
    }

    /// The description given at launch.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns true once a launch-result event was matched against this
    /// session.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_complete(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }
}

impl Drop for LaunchSession {
    fn drop(&mut self) {
        if self.is_complete() {
            return;
        }
        if thread::panicking() {
            warn!(description = %self.description, "launch session dropped during unwind");
            return;
        }
        fatal(Error::lifecycle(format!(
            "launch session \"{}\" destroyed before its result was confirmed",
            self.description
        )));
    }
}

impl fmt::Debug for LaunchSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchSession")
            .field("description", &self.description)
            .field("completed", &self.is_complete())
            .finish_non_exhaustive()
    }
}

/// Typed handle to a launched unit of work returning `R`.
pub struct LaunchHandle<R> {
    session: Arc<LaunchSession>,
    _result: PhantomData<fn() -> R>,
}

impl<R> LaunchHandle<R> {
    pub(crate) fn new(session: Arc<LaunchSession>) -> Self {
        Self {
            session,
            _result: PhantomData,
        }
    }

    pub(crate) fn session(&self) -> &Arc<LaunchSession> {
        &self.session
    }

    /// The description given at launch.
    #[must_use]
    pub fn description(&self) -> &str {
        self.session.description()
    }

    /// Returns true once the result was confirmed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.session.is_complete()
    }
}

impl<R> Clone for LaunchHandle<R> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.session))
    }
}

impl<R> fmt::Debug for LaunchHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LaunchHandle").field(&self.session).finish()
    }
}

/// A procedure that runs launched units of work. Lives in the
/// [`LaunchPool`](super::LaunchPool) and is reused once idle.
pub struct LaunchProcedure {
    fiber: Fiber,
    current_session: Mutex<Weak<LaunchSession>>,
    busy: AtomicBool,
}

impl LaunchProcedure {
    pub(crate) fn spawn(engine: &Engine, description: &str) -> Result<Self> {
        let fiber = Fiber::spawn(
            engine.substrate(),
            description,
            engine.config(),
            |suspender: Suspender, first: Option<Payload>| {
                let mut input = first;
                loop {
                    let (originator, work, description) = match input {
                        Some(Payload::StartLaunch {
                            originator,
                            work,
                            description,
                        }) => (originator, work, description),
                        other => fatal(Error::protocol(format!(
                            "launch procedure expected a unit of work, got {other:?}"
                        ))),
                    };

                    debug!(%description, "running unit of work");
                    let result = work();
                    debug!(%description, "unit of work finished");
                    input = suspender.suspend(Payload::LaunchFinished {
                        originator,
                        responder: suspender.id(),
                        result,
                    });
                }
            },
        )?;

        Ok(Self {
            fiber,
            current_session: Mutex::new(Weak::new()),
            busy: AtomicBool::new(false),
        })
    }

    /// The procedure's fiber ID.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.fiber.id()
    }

    /// The procedure's current name (the description of its latest launch).
    #[must_use]
    pub fn name(&self) -> String {
        self.fiber.name()
    }

    pub(crate) fn rename(&self, description: &str) {
        self.fiber.rename(description);
    }

    pub(crate) fn suspender(&self) -> Suspender {
        self.fiber.suspender()
    }

    /// The launch session whose work this procedure is running or last ran,
    /// if it is still alive.
    #[must_use]
    pub fn current_session(&self) -> Option<Arc<LaunchSession>> {
        self.current_session.lock().upgrade()
    }

    /// Returns true if the procedure can take a new unit of work.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.busy.load(Ordering::SeqCst) && self.current_session().is_none()
    }

    fn iterate(&self, engine: &Engine, payload: Payload) -> Result<Reply> {
        if let Payload::StartLaunch { originator, .. } = &payload {
            if self.busy.swap(true, Ordering::SeqCst) {
                return Err(Error::protocol(format!(
                    "{} given new work while busy",
                    self.describe()
                )));
            }
            *self.current_session.lock() = originator.clone();
        }

        let Some(output) = self.fiber.advance(Some(payload))? else {
            return Err(Error::protocol(format!(
                "{} exited unexpectedly",
                self.describe()
            )));
        };

        match output.kind() {
            PayloadKind::CallImminent => Ok(Reply::to(engine.synchroniser(), output)),
            PayloadKind::CallObserved | PayloadKind::PerformAction => {
                let handler = output
                    .call_originator()
                    .and_then(Weak::upgrade)
                    .and_then(|session| session.handler())
                    .ok_or_else(|| Error::protocol(format!("{output} has no handler")))?;
                Ok(Reply::to(handler, output))
            }
            PayloadKind::LaunchFinished => {
                self.busy.store(false, Ordering::SeqCst);
                let parent = output
                    .launch_originator()
                    .and_then(Weak::upgrade)
                    .and_then(|session| session.parent())
                    .ok_or_else(|| {
                        Error::protocol(format!("{output} has no test procedure to go to"))
                    })?;
                Ok(Reply::to(parent, output))
            }
            _ => Err(Error::protocol(format!(
                "launch procedure cannot send {output}"
            ))),
        }
    }
}

impl Actor for LaunchProcedure {
    fn receive(&self, engine: &Engine, payload: Payload) -> Result<Reply> {
        self.iterate(engine, payload)
    }

    fn describe(&self) -> String {
        format!("LaunchProcedure({}, \"{}\")", self.id(), self.name())
    }
}

impl fmt::Debug for LaunchProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchProcedure")
            .field("fiber", &self.fiber)
            .field("busy", &self.busy.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Drop for LaunchProcedure {
    fn drop(&mut self) {
        self.fiber.cancel();
    }
}
