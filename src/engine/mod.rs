//! The engine: shared context for one test's procedures.
//!
//! The engine owns the fiber substrate, the pre-call synchroniser, the launch
//! pool and the main proxy, and keeps a registry of the test procedures it
//! spawned. It also runs the trampoline that carries payloads between actors
//! until one is addressed back to main.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::actor::{Actor, ArgsRef, EntityId, MainProxy, Payload, Reply};
use crate::config::EngineConfig;
use crate::error::{fatal, Error, Result};
use crate::fiber::FiberSubstrate;
use crate::procedure::{ActiveSource, LaunchPool, TestContext, TestHandle, TestProcedure};
use crate::session::{CallSource, RoutingSession};
use crate::sync::{Synchroniser, SynchroniserStats, Transition};

struct EngineInner {
    config: EngineConfig,
    substrate: Arc<FiberSubstrate>,
    synchroniser: Arc<Synchroniser>,
    pool: Arc<LaunchPool>,
    main: Arc<MainProxy>,
    tests: Mutex<Vec<Weak<TestProcedure>>>,
}

/// Shared context for procedures, mocks and the driving test.
///
/// Cloning is cheap; every clone refers to the same engine.
///
/// # Example
///
/// ```rust
/// use testkit_coro::prelude::*;
///
/// let engine = Engine::new();
/// let read = MockFn::new(&engine, "read", |_: &u32| 0_u32);
///
/// let entity = read.entity().clone();
/// let test = engine.spawn_test("reader", move |ctx| {
///     let call = ctx.wait_for_call(&entity);
///     call.return_value(42_u32);
/// });
/// read.watch(&test);
///
/// assert_eq!(read.call(7), 42);
/// test.finish();
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Creates an engine with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Creates an engine with a custom configuration.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        let synchroniser = Arc::new(Synchroniser::new(&config));
        Self {
            inner: Arc::new(EngineInner {
                config,
                substrate: Arc::new(FiberSubstrate::new()),
                synchroniser,
                pool: Arc::new(LaunchPool::new()),
                main: Arc::new(MainProxy),
                tests: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn substrate(&self) -> &Arc<FiberSubstrate> {
        &self.inner.substrate
    }

    pub(crate) fn synchroniser(&self) -> Arc<dyn Actor> {
        Arc::clone(&self.inner.synchroniser) as Arc<dyn Actor>
    }

    pub(crate) fn pool(&self) -> Arc<dyn Actor> {
        Arc::clone(&self.inner.pool) as Arc<dyn Actor>
    }

    pub(crate) fn main_proxy(&self) -> Arc<dyn Actor> {
        Arc::clone(&self.inner.main) as Arc<dyn Actor>
    }

    /// Spawns a test body and runs it until it first waits for an event or
    /// returns.
    ///
    /// # Panics
    ///
    /// Panics if the procedure thread cannot be created, or on any protocol
    /// violation while running the body.
    pub fn spawn_test<F>(&self, name: &str, body: F) -> TestHandle
    where
        F: FnOnce(&TestContext) + Send + 'static,
    {
        self.try_spawn_test(name, body).unwrap_or_else(|err| fatal(err))
    }

    /// Fallible form of [`spawn_test`](Self::spawn_test).
    pub fn try_spawn_test<F>(&self, name: &str, body: F) -> Result<TestHandle>
    where
        F: FnOnce(&TestContext) + Send + 'static,
    {
        if let Some(active) = self.inner.substrate.active() {
            return Err(Error::usage(format!(
                "cannot spawn a test procedure from inside {active}"
            )));
        }

        let procedure = TestProcedure::spawn(self, name, body)?;
        {
            let mut tests = self.inner.tests.lock();
            tests.retain(|weak| weak.strong_count() > 0);
            tests.push(Arc::downgrade(&procedure));
        }
        debug!(procedure = %procedure.describe(), "spawned test procedure");

        let handle = TestHandle::new(Arc::clone(&procedure), self.clone());
        let reply = procedure.start(self)?;
        self.run_from_main(reply)?;
        Ok(handle)
    }

    /// Test procedures that are registered and have not exited, in spawn
    /// order.
    #[must_use]
    pub fn live_test_procedures(&self) -> Vec<Arc<TestProcedure>> {
        self.inner
            .tests
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|procedure| !procedure.is_exited())
            .collect()
    }

    /// Number of live test procedures.
    #[must_use]
    pub fn live_test_count(&self) -> usize {
        self.live_test_procedures().len()
    }

    /// Delivers `payload` to `destination` from main and keeps redelivering
    /// replies until one is addressed to main. Returns that reply.
    pub fn deliver_from_main(
        &self,
        destination: Arc<dyn Actor>,
        payload: Payload,
    ) -> Result<Payload> {
        self.run_from_main(Reply::to(destination, payload))
    }

    pub(crate) fn run_from_main(&self, mut reply: Reply) -> Result<Payload> {
        if let Some(active) = self.inner.substrate.active() {
            return Err(Error::protocol(format!(
                "trampoline entered from inside {active}"
            )));
        }

        loop {
            let Some(destination) = reply.destination.take() else {
                return Err(Error::protocol(format!(
                    "{} has no destination",
                    reply.payload
                )));
            };
            trace!(payload = %reply.payload, to = %destination.describe(), "deliver");
            if destination.is_main() {
                return Ok(reply.payload);
            }
            reply = destination.receive(self, reply.payload)?;
        }
    }

    /// Reports which source is making a call right now.
    pub fn find_active_source(&self) -> Result<ActiveSource> {
        self.inner.pool.find_active_source(&self.inner.substrate)
    }

    /// Creates the routing session for an intercepted call and runs the
    /// pre-call broadcast.
    pub fn on_intercepted_call(
        &self,
        entity: EntityId,
        args: ArgsRef,
    ) -> Result<Arc<RoutingSession>> {
        let source = match self.find_active_source()? {
            ActiveSource::Main => CallSource::Main,
            ActiveSource::Launch(procedure) => CallSource::Launch(Arc::downgrade(&procedure)),
        };
        let session = RoutingSession::new(self, entity, args, source);
        session.notify_imminent()?;
        Ok(session)
    }

    /// Removes idle launch procedures. Returns how many were removed.
    ///
    /// # Panics
    ///
    /// Panics when called from inside a procedure.
    pub fn cleanup(&self) -> usize {
        self.inner
            .pool
            .cleanup(&self.inner.substrate)
            .unwrap_or_else(|err| fatal(err))
    }

    /// Number of launch procedures in the pool.
    #[must_use]
    pub fn pool_len(&self) -> usize {
        self.inner.pool.len()
    }

    /// Synchroniser counters.
    #[must_use]
    pub fn synchroniser_stats(&self) -> SynchroniserStats {
        self.inner.synchroniser.stats()
    }

    /// The synchroniser's most recent state transitions.
    #[must_use]
    pub fn synchroniser_transitions(&self) -> Vec<Transition> {
        self.inner.synchroniser.transitions()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("live_tests", &self.live_test_count())
            .field("pool", &self.inner.pool)
            .field("synchroniser", &self.inner.synchroniser.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncState;
    use std::sync::Weak;

    #[test]
    fn test_new_engine_is_empty() {
        let engine = Engine::new();
        assert_eq!(engine.live_test_count(), 0);
        assert_eq!(engine.pool_len(), 0);
        assert_eq!(engine.cleanup(), 0);
        assert!(engine.find_active_source().unwrap().is_main());
    }

    #[test]
    fn test_trampoline_stops_at_main() {
        let engine = Engine::new();
        let payload = engine
            .deliver_from_main(
                engine.main_proxy(),
                Payload::ResumeMainRequested {
                    originator: Weak::new(),
                },
            )
            .unwrap();
        assert_eq!(payload.kind(), crate::actor::PayloadKind::ResumeMainRequested);
    }

    #[test]
    fn test_missing_destination_is_protocol_error() {
        let engine = Engine::new();
        let err = engine
            .run_from_main(Reply {
                payload: Payload::ProcedureExited {
                    originator: Weak::new(),
                },
                destination: None,
            })
            .unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_call_with_no_procedures() {
        let engine = Engine::new();
        let session = engine
            .on_intercepted_call(EntityId::new("read"), Arc::new(1_i32))
            .unwrap();
        assert!(session.is_from_main());

        let stats = engine.synchroniser_stats();
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.notices_sent, 0);

        let states: Vec<(SyncState, SyncState)> = engine
            .synchroniser_transitions()
            .iter()
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            states,
            vec![
                (SyncState::Idle, SyncState::Start),
                (SyncState::Start, SyncState::Complete),
                (SyncState::Complete, SyncState::Idle),
            ]
        );
    }

    #[test]
    fn test_trampoline_rejected_inside_procedure() {
        let engine = Engine::new();
        let seen = Arc::new(Mutex::new(None));

        let body_seen = Arc::clone(&seen);
        let test = engine.spawn_test("nested", move |ctx| {
            let engine = ctx.engine();
            *body_seen.lock() = engine
                .deliver_from_main(
                    engine.main_proxy(),
                    Payload::ResumeMainRequested {
                        originator: Weak::new(),
                    },
                )
                .err();
        });
        test.finish();

        let err = seen.lock().take().unwrap();
        assert!(err.is_protocol());
        assert!(err.to_string().contains("trampoline entered from inside"));
    }

    #[test]
    fn test_cleanup_rejected_inside_procedure() {
        let engine = Engine::new();
        let seen = Arc::new(Mutex::new(None));

        let body_seen = Arc::clone(&seen);
        let test = engine.spawn_test("tidy", move |ctx| {
            let engine = ctx.engine();
            *body_seen.lock() = engine.inner.pool.cleanup(engine.substrate()).err();
        });
        test.finish();

        let err = seen.lock().take().unwrap();
        assert!(err.is_usage());
        assert_eq!(engine.pool_len(), 0);
    }

    #[test]
    fn test_spawn_and_finish() {
        let engine = Engine::new();
        let test = engine.spawn_test("empty", |_| {});
        assert!(test.is_exited());
        assert_eq!(engine.live_test_count(), 0);
        test.finish();
    }
}
