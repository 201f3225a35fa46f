//! Units of work executed by workers.
//!
//! A [`Runnable`] is opaque to the distribution layer: it has a name, a
//! readable [`Progress`] and a blocking `run`. Runnables that are full
//! simulations also expose their storage attachment through
//! [`Simulation`] so a worker can swap in a capturing store.

mod builtin;
mod registry;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub use builtin::{ClockSimulation, FailingJob, NoopJob};
pub use registry::{Factory, Registry};

use crate::error::{Error, Result};
use crate::storage::DataStore;

/// Handle for cooperative cancellation of a running job.
///
/// `CancelSignal` can be cloned and shared across threads; any clone can
/// trigger the cancel, and all other clones observe it.
///
/// # Example
///
/// ```
/// use simpool_core::runnable::CancelSignal;
///
/// let signal = CancelSignal::new();
/// let clone = signal.clone();
/// assert!(!signal.is_cancelled());
/// clone.cancel();
/// assert!(signal.is_cancelled());
/// ```
#[derive(Clone, Default)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if cancellation has been requested.
    ///
    /// Runnables should poll this during long loops and return early.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Clear a previous request before reuse.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Relaxed);
    }
}

/// Shared fraction-complete cell, readable while `run` holds the runnable.
#[derive(Clone, Default)]
pub struct Progress {
    bits: Arc<AtomicU64>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current fraction in `0..=1`.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Set the fraction, clamped to `0..=1`.
    pub fn set(&self, fraction: f64) {
        let clamped = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        self.bits.store(clamped.to_bits(), Ordering::Relaxed);
    }
}

/// An executable unit of work.
pub trait Runnable: Send {
    /// Identity; also the simulation name rows are tagged with.
    fn name(&self) -> &str;

    /// Handle to this runnable's progress.
    fn progress(&self) -> Progress;

    /// Apply a parameter replacement before running.
    fn apply_override(&mut self, path: &str, _value: &str) -> Result<()> {
        Err(Error::Override {
            path: path.to_string(),
            message: format!("{} has no such parameter", self.name()),
        })
    }

    /// Storage view, if this runnable is a full simulation.
    fn as_simulation(&mut self) -> Option<&mut dyn Simulation> {
        None
    }

    /// Execute to completion, polling `cancel` cooperatively.
    fn run(&mut self, cancel: &CancelSignal) -> anyhow::Result<()>;

    /// Post-run checks, executed when a run command asks for tests.
    fn run_tests(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Storage attachment of a full simulation.
pub trait Simulation {
    /// Remove and return the attached store.
    fn detach_storage(&mut self) -> Option<Arc<dyn DataStore>>;

    /// Attach a store in place of the previous one.
    fn attach_storage(&mut self, storage: Arc<dyn DataStore>);

    /// Re-establish links from child components to the attached store, as
    /// if the simulation had just been built.
    fn relink(&mut self);
}

/// Swap a simulation's store for `storage`, returning the old one.
pub fn redirect_storage(
    runnable: &mut dyn Runnable,
    storage: Arc<dyn DataStore>,
) -> Option<Option<Arc<dyn DataStore>>> {
    let simulation = runnable.as_simulation()?;
    let previous = simulation.detach_storage();
    simulation.attach_storage(storage);
    simulation.relink();
    Some(previous)
}
