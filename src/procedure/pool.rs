//! Pool of launch procedures.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::actor::{Actor, Payload, Reply};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::fiber::{FiberId, FiberSubstrate};

use super::launch::LaunchProcedure;

/// Where an intercepted call is being made from.
#[derive(Clone)]
pub enum ActiveSource {
    /// The driving thread.
    Main,
    /// A launch procedure's unit of work.
    Launch(Arc<LaunchProcedure>),
}

impl ActiveSource {
    /// Returns true for [`ActiveSource::Main`].
    #[must_use]
    pub fn is_main(&self) -> bool {
        matches!(self, ActiveSource::Main)
    }
}

impl fmt::Debug for ActiveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveSource::Main => write!(f, "Main"),
            ActiveSource::Launch(procedure) => write!(f, "Launch({})", procedure.describe()),
        }
    }
}

/// Launch procedures keyed by fiber ID. Grows on demand; idle entries are
/// reused and removed by [`cleanup`](Self::cleanup).
#[derive(Default)]
pub struct LaunchPool {
    entries: Mutex<BTreeMap<FiberId, Arc<LaunchProcedure>>>,
}

impl LaunchPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of launch procedures, idle or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the pool holds no procedures.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn try_get_idle(&self) -> Option<Arc<LaunchProcedure>> {
        self.entries
            .lock()
            .values()
            .find(|procedure| procedure.is_idle())
            .cloned()
    }

    /// Returns an idle procedure renamed to `description`, or creates one.
    pub fn allocate(&self, engine: &Engine, description: &str) -> Result<Arc<LaunchProcedure>> {
        if let Some(procedure) = self.try_get_idle() {
            procedure.rename(description);
            debug!(procedure = %procedure.describe(), "reusing launch procedure");
            return Ok(procedure);
        }

        let procedure = Arc::new(LaunchProcedure::spawn(engine, description)?);
        let mut entries = self.entries.lock();
        entries.insert(procedure.id(), Arc::clone(&procedure));
        debug!(
            procedure = %procedure.describe(),
            pool_size = entries.len(),
            "allocated launch procedure"
        );
        Ok(procedure)
    }

    /// Removes every idle procedure and returns how many were removed.
    ///
    /// Only allowed while no procedure is active.
    pub fn cleanup(&self, substrate: &FiberSubstrate) -> Result<usize> {
        if let Some(active) = substrate.active() {
            return Err(Error::usage(format!(
                "cannot clean up launch procedures from inside {active}"
            )));
        }

        let removed: Vec<Arc<LaunchProcedure>> = {
            let mut entries = self.entries.lock();
            let idle: Vec<FiberId> = entries
                .iter()
                .filter(|(_, procedure)| procedure.is_idle())
                .map(|(id, _)| *id)
                .collect();
            idle.iter().filter_map(|id| entries.remove(id)).collect()
        };

        if !removed.is_empty() {
            debug!(removed = removed.len(), remaining = self.len(), "cleaned up launch pool");
        }
        Ok(removed.len())
    }

    /// Which source is active: main, or one of this pool's procedures.
    ///
    /// A test procedure being active is a usage error: mock functions may not
    /// be called from inside test bodies.
    pub fn find_active_source(&self, substrate: &FiberSubstrate) -> Result<ActiveSource> {
        let Some(active) = substrate.active() else {
            return Ok(ActiveSource::Main);
        };
        match self.entries.lock().get(&active) {
            Some(procedure) => Ok(ActiveSource::Launch(Arc::clone(procedure))),
            None => Err(Error::usage(
                "mock functions cannot be called from inside a test procedure",
            )),
        }
    }
}

impl Actor for LaunchPool {
    fn receive(&self, engine: &Engine, payload: Payload) -> Result<Reply> {
        let Payload::StartLaunch { description, .. } = &payload else {
            return Err(Error::protocol(format!("launch pool cannot handle {payload}")));
        };
        let procedure = self.allocate(engine, description)?;
        Ok(Reply::to(procedure, payload))
    }

    fn describe(&self) -> String {
        format!("LaunchPool(size={})", self.len())
    }
}

impl fmt::Debug for LaunchPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchPool")
            .field("size", &self.len())
            .finish()
    }
}
