//! Thread-backed resumable execution contexts.
//!
//! A [`Fiber`] runs its body on a dedicated OS thread, but only while the
//! driving side is blocked in [`Fiber::advance`]. The body hands control back
//! with [`Suspender::suspend`]. Exactly one side of every fiber is runnable at
//! any instant, and the shared [`FiberSubstrate`] records which fiber (if any)
//! currently holds control.
//!
//! # Example
//!
//! ```rust,ignore
//! let substrate = Arc::new(FiberSubstrate::new());
//! let fiber = Fiber::spawn(&substrate, "echo", &EngineConfig::default(), |suspender, first| {
//!     let mut input = first;
//!     while let Some(payload) = input {
//!         input = suspender.suspend(payload);
//!     }
//! })?;
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, debug_span, warn};

use crate::actor::Payload;
use crate::config::EngineConfig;
use crate::error::{fatal, Error, Result};

/// Unique identifier for a fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(u64);

impl FiberId {
    /// Creates a new unique fiber ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

/// Lifecycle of a fiber as seen from the driving side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberPhase {
    /// Created, never advanced.
    NotStarted,
    /// Parked in [`Suspender::suspend`] between iterations.
    Suspended,
    /// Holding control.
    Running,
    /// The body returned, panicked or was cancelled.
    Exited,
}

impl fmt::Display for FiberPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberPhase::NotStarted => write!(f, "NotStarted"),
            FiberPhase::Suspended => write!(f, "Suspended"),
            FiberPhase::Running => write!(f, "Running"),
            FiberPhase::Exited => write!(f, "Exited"),
        }
    }
}

/// Records which fiber holds control. Shared by every fiber of one engine.
#[derive(Debug, Default)]
pub struct FiberSubstrate {
    active: Mutex<Option<FiberId>>,
}

impl FiberSubstrate {
    /// Creates a substrate with no active fiber.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The fiber currently holding control, or `None` when the driver does.
    #[must_use]
    pub fn active(&self) -> Option<FiberId> {
        *self.active.lock()
    }

    fn enter(&self, id: FiberId) -> Result<()> {
        let mut active = self.active.lock();
        if let Some(current) = *active {
            return Err(Error::protocol(format!(
                "cannot advance {id} while {current} is active"
            )));
        }
        *active = Some(id);
        Ok(())
    }

    fn leave(&self, id: FiberId) {
        let mut active = self.active.lock();
        debug_assert_eq!(*active, Some(id));
        *active = None;
    }
}

/// Unwind token used to tear down a suspended body.
struct Cancelled;

enum Resume {
    Input(Option<Payload>),
    Cancel,
}

struct Handoff {
    phase: FiberPhase,
    resume: Option<Resume>,
    output: Option<Payload>,
    panic: Option<Box<dyn Any + Send>>,
}

struct Channel {
    state: Mutex<Handoff>,
    cond: Condvar,
}

impl Channel {
    fn new() -> Self {
        Self {
            state: Mutex::new(Handoff {
                phase: FiberPhase::NotStarted,
                resume: None,
                output: None,
                panic: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn wait_resume(&self) -> Resume {
        let mut state = self.state.lock();
        loop {
            if let Some(resume) = state.resume.take() {
                return resume;
            }
            self.cond.wait(&mut state);
        }
    }

    fn finish(&self, panic: Option<Box<dyn Any + Send>>) {
        let mut state = self.state.lock();
        state.phase = FiberPhase::Exited;
        state.output = None;
        state.panic = panic;
        self.cond.notify_all();
    }

    /// Hands `resume` to the body and blocks until it suspends or exits.
    fn hand_over(&self, resume: Resume) -> (Option<Payload>, Option<Box<dyn Any + Send>>) {
        let mut state = self.state.lock();
        state.phase = FiberPhase::Running;
        state.resume = Some(resume);
        self.cond.notify_all();
        while state.phase == FiberPhase::Running {
            self.cond.wait(&mut state);
        }
        (state.output.take(), state.panic.take())
    }
}

/// Body-side handle used to yield a payload back to the driver.
#[derive(Clone)]
pub struct Suspender {
    id: FiberId,
    channel: Arc<Channel>,
}

impl Suspender {
    /// The fiber this handle suspends.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Hands `payload` to the last caller of [`Fiber::advance`] and blocks
    /// until the fiber is advanced again, returning that input.
    ///
    /// When the fiber is cancelled instead, this unwinds the body.
    pub fn suspend(&self, payload: Payload) -> Option<Payload> {
        let mut state = self.channel.state.lock();
        state.output = Some(payload);
        state.phase = FiberPhase::Suspended;
        self.channel.cond.notify_all();
        loop {
            match state.resume.take() {
                Some(Resume::Input(input)) => return input,
                Some(Resume::Cancel) => {
                    drop(state);
                    panic::resume_unwind(Box::new(Cancelled));
                }
                None => self.channel.cond.wait(&mut state),
            }
        }
    }
}

impl fmt::Debug for Suspender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspender").field("id", &self.id).finish()
    }
}

/// One resumable execution context.
pub struct Fiber {
    id: FiberId,
    name: Mutex<String>,
    substrate: Arc<FiberSubstrate>,
    channel: Arc<Channel>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Fiber {
    /// Spawns the fiber's thread. The body does not run until the first
    /// [`advance`](Self::advance), whose input it receives as `first`.
    pub fn spawn<F>(
        substrate: &Arc<FiberSubstrate>,
        name: &str,
        config: &EngineConfig,
        body: F,
    ) -> Result<Self>
    where
        F: FnOnce(Suspender, Option<Payload>) + Send + 'static,
    {
        let id = FiberId::new();
        let channel = Arc::new(Channel::new());
        let suspender = Suspender {
            id,
            channel: Arc::clone(&channel),
        };

        let mut builder = thread::Builder::new().name(config.thread_name(name));
        if let Some(bytes) = config.stack_size {
            builder = builder.stack_size(bytes);
        }

        let span_name = name.to_string();
        let thread_channel = Arc::clone(&channel);
        let handle = builder.spawn(move || {
            let span = debug_span!("procedure", name = %span_name, fiber = %id);
            let _entered = span.enter();

            let first = match thread_channel.wait_resume() {
                Resume::Input(input) => input,
                Resume::Cancel => {
                    thread_channel.finish(None);
                    return;
                }
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(move || body(suspender, first)));
            let panic = match outcome {
                Ok(()) => None,
                Err(payload) if payload.is::<Cancelled>() => None,
                Err(payload) => Some(payload),
            };
            thread_channel.finish(panic);
        })?;

        debug!(fiber = %id, name, "spawned procedure thread");
        let thread_id = handle.thread().id();
        Ok(Self {
            id,
            name: Mutex::new(name.to_string()),
            substrate: Arc::clone(substrate),
            channel,
            thread: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    /// The fiber's ID.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// The fiber's current name.
    #[must_use]
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Renames the fiber. The OS thread keeps its original name.
    pub fn rename(&self, name: &str) {
        *self.name.lock() = name.to_string();
    }

    /// A handle the body side can use to suspend this fiber.
    #[must_use]
    pub fn suspender(&self) -> Suspender {
        Suspender {
            id: self.id,
            channel: Arc::clone(&self.channel),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> FiberPhase {
        self.channel.state.lock().phase
    }

    /// Returns true once the body can no longer run.
    #[must_use]
    pub fn is_exited(&self) -> bool {
        self.phase() == FiberPhase::Exited
    }

    /// Resumes the body with `input` and blocks until it yields (returning
    /// the yielded payload) or exits (returning `None`).
    ///
    /// A panic inside the body is re-raised here.
    pub fn advance(&self, input: Option<Payload>) -> Result<Option<Payload>> {
        match self.phase() {
            FiberPhase::Exited => {
                return Err(Error::lifecycle(format!(
                    "{} advanced after it exited",
                    self.describe()
                )))
            }
            FiberPhase::Running => {
                return Err(Error::protocol(format!(
                    "{} advanced while already running",
                    self.describe()
                )))
            }
            FiberPhase::NotStarted | FiberPhase::Suspended => {}
        }

        self.substrate.enter(self.id)?;
        let (output, panic) = self.channel.hand_over(Resume::Input(input));
        self.substrate.leave(self.id);

        if let Some(payload) = panic {
            panic::resume_unwind(payload);
        }
        Ok(output)
    }

    /// Force-unwinds a body that has not exited. Does nothing otherwise.
    pub fn cancel(&self) {
        match self.phase() {
            FiberPhase::Exited => return,
            FiberPhase::Running => {
                warn!(fiber = %self.id, "cannot cancel a running procedure");
                return;
            }
            FiberPhase::NotStarted | FiberPhase::Suspended => {}
        }

        debug!(fiber = %self.id, name = %self.name(), "cancelling procedure");
        let (_, panic) = self.channel.hand_over(Resume::Cancel);
        if panic.is_some() {
            warn!(fiber = %self.id, "procedure panicked while unwinding");
        }
    }

    fn describe(&self) -> String {
        format!("{} \"{}\"", self.id, self.name())
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("phase", &self.phase())
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if thread::current().id() == self.thread_id {
            // Dropped from inside its own body; the thread exits on its own.
            return;
        }

        match self.phase() {
            FiberPhase::Exited => {}
            FiberPhase::Running => return,
            FiberPhase::NotStarted => self.cancel(),
            FiberPhase::Suspended => {
                self.cancel();
                if !thread::panicking() {
                    fatal(Error::lifecycle(format!(
                        "{} destroyed before it exited",
                        self.describe()
                    )));
                }
            }
        }

        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    fn resume_main() -> Payload {
        Payload::ResumeMainRequested {
            originator: Weak::new(),
        }
    }

    fn exited() -> Payload {
        Payload::ProcedureExited {
            originator: Weak::new(),
        }
    }

    fn spawn<F>(substrate: &Arc<FiberSubstrate>, body: F) -> Fiber
    where
        F: FnOnce(Suspender, Option<Payload>) + Send + 'static,
    {
        Fiber::spawn(substrate, "test", &EngineConfig::default(), body).unwrap()
    }

    #[test]
    fn test_fiber_ids_are_unique() {
        let a = FiberId::new();
        let b = FiberId::new();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
        assert_eq!(a.to_string(), format!("Fiber({})", a.as_u64()));
    }

    #[test]
    fn test_advance_runs_until_suspend() {
        let substrate = Arc::new(FiberSubstrate::new());
        let fiber = spawn(&substrate, |suspender, first| {
            assert!(first.is_none());
            let input = suspender.suspend(resume_main());
            assert!(matches!(input, Some(Payload::ProcedureExited { .. })));
        });

        assert_eq!(fiber.phase(), FiberPhase::NotStarted);
        let out = fiber.advance(None).unwrap();
        assert!(matches!(out, Some(Payload::ResumeMainRequested { .. })));
        assert_eq!(fiber.phase(), FiberPhase::Suspended);

        let out = fiber.advance(Some(exited())).unwrap();
        assert!(out.is_none());
        assert!(fiber.is_exited());
    }

    #[test]
    fn test_substrate_tracks_active_fiber() {
        let substrate = Arc::new(FiberSubstrate::new());
        let seen = Arc::new(Mutex::new(None));
        let body_substrate = Arc::clone(&substrate);
        let body_seen = Arc::clone(&seen);
        let fiber = spawn(&substrate, move |_, _| {
            *body_seen.lock() = body_substrate.active();
        });

        assert!(substrate.active().is_none());
        fiber.advance(None).unwrap();
        assert_eq!(*seen.lock(), Some(fiber.id()));
        assert!(substrate.active().is_none());
    }

    #[test]
    fn test_advance_after_exit_is_lifecycle_error() {
        let substrate = Arc::new(FiberSubstrate::new());
        let fiber = spawn(&substrate, |_, _| {});
        fiber.advance(None).unwrap();
        let err = fiber.advance(None).unwrap_err();
        assert!(err.is_lifecycle());
    }

    #[test]
    fn test_nested_advance_is_protocol_error() {
        let substrate = Arc::new(FiberSubstrate::new());
        let inner = Arc::new(spawn(&substrate, |_, _| {}));
        let result = Arc::new(Mutex::new(None));

        let body_inner = Arc::clone(&inner);
        let body_result = Arc::clone(&result);
        let outer = spawn(&substrate, move |_, _| {
            *body_result.lock() = Some(body_inner.advance(None).map(|_| ()));
        });
        outer.advance(None).unwrap();

        let err = result.lock().take().unwrap().unwrap_err();
        assert!(err.is_protocol());
        inner.advance(None).unwrap();
    }

    #[test]
    fn test_cancel_unwinds_suspended_body() {
        struct Flag(Arc<Mutex<bool>>);
        impl Drop for Flag {
            fn drop(&mut self) {
                *self.0.lock() = true;
            }
        }

        let substrate = Arc::new(FiberSubstrate::new());
        let dropped = Arc::new(Mutex::new(false));
        let body_dropped = Arc::clone(&dropped);
        let fiber = spawn(&substrate, move |suspender, _| {
            let _flag = Flag(body_dropped);
            suspender.suspend(resume_main());
            unreachable!("cancelled bodies never resume");
        });

        fiber.advance(None).unwrap();
        fiber.cancel();
        assert!(fiber.is_exited());
        assert!(*dropped.lock());
    }

    #[test]
    fn test_cancel_before_start() {
        let substrate = Arc::new(FiberSubstrate::new());
        let fiber = spawn(&substrate, |_, _| unreachable!("never advanced"));
        fiber.cancel();
        assert!(fiber.is_exited());
    }

    #[test]
    #[should_panic(expected = "body failed")]
    fn test_body_panic_reraised_on_driver() {
        let substrate = Arc::new(FiberSubstrate::new());
        let fiber = spawn(&substrate, |_, _| panic!("body failed"));
        let _ = fiber.advance(None);
    }

    #[test]
    #[should_panic(expected = "destroyed before it exited")]
    fn test_drop_while_suspended_is_fatal() {
        let substrate = Arc::new(FiberSubstrate::new());
        let fiber = spawn(&substrate, |suspender, _| {
            suspender.suspend(resume_main());
        });
        fiber.advance(None).unwrap();
        drop(fiber);
    }

    #[test]
    fn test_rename() {
        let substrate = Arc::new(FiberSubstrate::new());
        let fiber = spawn(&substrate, |_, _| {});
        assert_eq!(fiber.name(), "test");
        fiber.rename("worker");
        assert_eq!(fiber.name(), "worker");
        fiber.advance(None).unwrap();
    }
}
