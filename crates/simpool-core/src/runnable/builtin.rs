//! Runnables every worker registers by default.
//!
//! `clock` is a small daily model used to exercise storage redirection and
//! overrides end to end; `noop` and `fail` cover the trivial outcomes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::NaiveDate;

use crate::error::{Error, Result};
use crate::ipc::{Value, pack_date};
use crate::storage::DataStore;

use super::{CancelSignal, Progress, Runnable, Simulation};

/// Does nothing and succeeds.
pub struct NoopJob {
    name: String,
    progress: Progress,
}

impl NoopJob {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            progress: Progress::new(),
        }
    }
}

impl Runnable for NoopJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn progress(&self) -> Progress {
        self.progress.clone()
    }

    fn run(&mut self, _cancel: &CancelSignal) -> anyhow::Result<()> {
        self.progress.set(1.0);
        Ok(())
    }
}

/// Always fails, either with an error or a panic.
pub struct FailingJob {
    name: String,
    message: String,
    panic: bool,
    progress: Progress,
}

impl FailingJob {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            message: format!("{} failed", name),
            name,
            panic: false,
            progress: Progress::new(),
        }
    }
}

impl Runnable for FailingJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn progress(&self) -> Progress {
        self.progress.clone()
    }

    fn apply_override(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "[Fail].Message" => self.message = value.to_string(),
            "[Fail].Panic" => self.panic = parse_override(path, value)?,
            _ => {
                return Err(Error::Override {
                    path: path.to_string(),
                    message: format!("{} has no such parameter", self.name),
                });
            }
        }
        Ok(())
    }

    fn run(&mut self, _cancel: &CancelSignal) -> anyhow::Result<()> {
        if self.panic {
            panic!("{}", self.message);
        }
        bail!("{}", self.message)
    }
}

/// Clock component: the simulated date range.
struct Clock {
    start: NaiveDate,
    end: NaiveDate,
    /// Wall-clock pause per simulated day.
    step_delay: Duration,
}

/// Crop component: accumulates yield at a fixed daily rate.
struct Crop {
    growth_rate: f64,
    yield_kg: f64,
}

/// Report component: writes one row per day to its table.
struct Report {
    table_name: String,
    storage: Option<Arc<dyn DataStore>>,
    rows_written: usize,
}

impl Report {
    fn write(&mut self, simulation: &str, date: NaiveDate, yield_kg: f64) -> anyhow::Result<()> {
        let storage = self
            .storage
            .as_ref()
            .context("report is not linked to a data store")?;
        storage.write_row(
            simulation,
            &self.table_name,
            &["Date".to_string(), "Yield".to_string()],
            &[None, Some("kg/ha".to_string())],
            &[Value::from_date(date)?, Value::Double(yield_kg)],
        )?;
        self.rows_written += 1;
        Ok(())
    }
}

/// Daily model writing `Date` and `Yield` to a `Report` table.
///
/// Parameters: `[Clock].StartDate`, `[Clock].EndDate` (`yyyy-mm-dd`),
/// `[Clock].StepDelay` (milliseconds per day), `[Crop].GrowthRate`
/// (kg/ha per day) and `[Report].TableName`.
pub struct ClockSimulation {
    name: String,
    clock: Clock,
    crop: Crop,
    report: Report,
    storage: Option<Arc<dyn DataStore>>,
    progress: Progress,
}

impl ClockSimulation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clock: Clock {
                start: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default(),
                end: NaiveDate::from_ymd_opt(2000, 1, 10).unwrap_or_default(),
                step_delay: Duration::ZERO,
            },
            crop: Crop {
                growth_rate: 10.0,
                yield_kg: 0.0,
            },
            report: Report {
                table_name: "Report".to_string(),
                storage: None,
                rows_written: 0,
            },
            storage: None,
            progress: Progress::new(),
        }
    }

    /// Number of days between start and end, inclusive.
    fn total_days(&self) -> i64 {
        (self.clock.end - self.clock.start).num_days() + 1
    }
}

impl Runnable for ClockSimulation {
    fn name(&self) -> &str {
        &self.name
    }

    fn progress(&self) -> Progress {
        self.progress.clone()
    }

    fn apply_override(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "[Clock].StartDate" => self.clock.start = parse_date(path, value)?,
            "[Clock].EndDate" => self.clock.end = parse_date(path, value)?,
            "[Clock].StepDelay" => {
                self.clock.step_delay = Duration::from_millis(parse_override(path, value)?)
            }
            "[Crop].GrowthRate" => self.crop.growth_rate = parse_override(path, value)?,
            "[Report].TableName" => self.report.table_name = value.to_string(),
            _ => {
                return Err(Error::Override {
                    path: path.to_string(),
                    message: format!("{} has no such parameter", self.name),
                });
            }
        }
        Ok(())
    }

    fn as_simulation(&mut self) -> Option<&mut dyn Simulation> {
        Some(self)
    }

    fn run(&mut self, cancel: &CancelSignal) -> anyhow::Result<()> {
        let total = self.total_days();
        if total < 1 {
            bail!(
                "{}: EndDate {} precedes StartDate {}",
                self.name,
                self.clock.end,
                self.clock.start
            );
        }

        self.crop.yield_kg = 0.0;
        self.report.rows_written = 0;
        for (day, date) in self.clock.start.iter_days().take(total as usize).enumerate() {
            if cancel.is_cancelled() {
                bail!("{}: cancelled on {}", self.name, date);
            }
            self.crop.yield_kg += self.crop.growth_rate;
            self.report
                .write(&self.name, date, self.crop.yield_kg)
                .with_context(|| format!("{}: writing report for {}", self.name, date))?;
            self.progress.set((day + 1) as f64 / total as f64);
            if !self.clock.step_delay.is_zero() {
                std::thread::sleep(self.clock.step_delay);
            }
        }
        Ok(())
    }

    fn run_tests(&mut self) -> anyhow::Result<()> {
        let expected = self.total_days().max(0) as usize;
        if self.report.rows_written != expected {
            bail!(
                "{}: expected {} report rows, found {}",
                self.name,
                expected,
                self.report.rows_written
            );
        }
        if self.crop.yield_kg < 0.0 {
            bail!("{}: negative final yield {}", self.name, self.crop.yield_kg);
        }
        Ok(())
    }
}

impl Simulation for ClockSimulation {
    fn detach_storage(&mut self) -> Option<Arc<dyn DataStore>> {
        self.report.storage = None;
        self.storage.take()
    }

    fn attach_storage(&mut self, storage: Arc<dyn DataStore>) {
        self.storage = Some(storage);
    }

    fn relink(&mut self) {
        self.report.storage = self.storage.clone();
    }
}

fn parse_override<T: std::str::FromStr>(path: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| Error::Override {
        path: path.to_string(),
        message: format!("cannot parse {:?}: {}", value, e),
    })
}

fn parse_date(path: &str, value: &str) -> Result<NaiveDate> {
    let date = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|e| Error::Override {
        path: path.to_string(),
        message: format!("cannot parse date {:?}: {}", value, e),
    })?;
    pack_date(date).map_err(|e| Error::Override {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    Ok(date)
}
