//! Session commands: run catalog simulations in-worker, then read results.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ipc::{JobSpec, ReadCommand, RunCommand, Table};
use crate::runnable::{CancelSignal, Registry, redirect_storage};
use crate::storage::{DataStore, MemoryStore};

use super::run_guarded;

/// Load a JSON array of job specs.
pub fn load_catalog(path: &Path) -> Result<Vec<JobSpec>> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| Error::Config(format!("invalid catalog {}: {}", path.display(), e)))
}

/// Threads for one session run: the requested count, bounded by the
/// number of simulations and the host's parallelism.
fn session_threads(requested: i32, simulations: usize) -> usize {
    let host = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    usize::try_from(requested)
        .unwrap_or(1)
        .clamp(1, simulations.max(1).min(host))
}

/// Simulations a worker can run on request, plus the store they write to.
pub struct Session {
    registry: Arc<Registry>,
    catalog: Vec<JobSpec>,
    store: Arc<MemoryStore>,
}

impl Session {
    pub fn new(registry: Arc<Registry>, catalog: Vec<JobSpec>) -> Self {
        Self {
            registry,
            catalog,
            store: Arc::new(MemoryStore::new()),
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Names of the simulations in the catalog, in catalog order.
    pub fn simulation_names(&self) -> Vec<&str> {
        self.catalog.iter().map(|spec| spec.name.as_str()).collect()
    }

    fn select(&self, names: &[String]) -> anyhow::Result<Vec<&JobSpec>> {
        if names.is_empty() {
            return Ok(self.catalog.iter().collect());
        }
        names
            .iter()
            .map(|name| {
                self.catalog
                    .iter()
                    .find(|spec| &spec.name == name)
                    .ok_or_else(|| anyhow!("no simulation named {}", name))
            })
            .collect()
    }

    /// Run the selected simulations, replacing any earlier data they wrote.
    ///
    /// Every simulation runs even when another fails; all failures are
    /// reported together.
    pub fn run(&self, command: &RunCommand, cancel: &CancelSignal) -> anyhow::Result<()> {
        let specs: Vec<JobSpec> = self
            .select(&command.simulation_names)?
            .into_iter()
            .map(|spec| {
                let mut spec = spec.clone();
                spec.overrides.extend(command.overrides.iter().cloned());
                spec
            })
            .collect();

        for spec in &specs {
            self.store.remove_simulation(&spec.name)?;
        }

        let threads = session_threads(command.max_parallelism, specs.len());
        info!(simulations = specs.len(), threads, "session run");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .context("building simulation thread pool")?;

        let failures: Vec<String> = pool.install(|| {
            specs
                .par_iter()
                .filter_map(|spec| self.run_one(spec, command, cancel).err())
                .map(|e| format!("{:#}", e))
                .collect()
        });

        if failures.is_empty() {
            Ok(())
        } else {
            bail!("{}", failures.join("\n"))
        }
    }

    fn run_one(&self, spec: &JobSpec, command: &RunCommand, cancel: &CancelSignal) -> anyhow::Result<()> {
        let mut runnable = self.registry.build(spec)?;
        let store: Arc<dyn DataStore> = self.store.clone();
        redirect_storage(runnable.as_mut(), store);

        if command.verbose {
            info!(simulation = %spec.name, "running");
        } else {
            debug!(simulation = %spec.name, "running");
        }
        run_guarded(runnable.as_mut(), cancel).map_err(|message| anyhow!(message))?;
        if command.run_tests {
            runnable
                .run_tests()
                .with_context(|| format!("tests failed for {}", spec.name))?;
        }
        Ok(())
    }

    /// Project a session table onto the requested fields.
    pub fn read(&self, command: &ReadCommand) -> Result<Table> {
        self.store.read_table(&command.table_name, &command.field_names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Override, Value};

    fn session() -> Session {
        Session::new(Arc::new(Registry::with_builtins()), vec![
            JobSpec::new("clock", "Sim1"),
            JobSpec::new("clock", "Sim2").with_override("[Clock].EndDate", "2000-01-05"),
            JobSpec::new("fail", "Broken"),
        ])
    }

    #[test]
    fn test_run_named_then_read() {
        let session = session();
        let command = RunCommand {
            max_parallelism: 2,
            simulation_names: vec!["Sim1".into(), "Sim2".into()],
            ..Default::default()
        };
        session.run(&command, &CancelSignal::new()).unwrap();

        let table = session
            .read(&ReadCommand {
                table_name: "Report".into(),
                field_names: vec!["Date".into(), "Yield".into()],
            })
            .unwrap();
        assert_eq!(table.column_names(), vec!["Date", "Yield"]);
        assert_eq!(table.rows.len(), 15);

        // Re-running replaces rather than appends.
        session.run(&command, &CancelSignal::new()).unwrap();
        assert_eq!(session.store().row_count("Report"), 15);
    }

    #[test]
    fn test_run_applies_command_overrides() {
        let session = session();
        let command = RunCommand {
            overrides: vec![Override::new("[Clock].StartDate", "2000-01-09")],
            simulation_names: vec!["Sim1".into()],
            run_tests: true,
            ..Default::default()
        };
        session.run(&command, &CancelSignal::new()).unwrap();
        let table = session
            .read(&ReadCommand {
                table_name: "Report".into(),
                field_names: vec!["Date".into()],
            })
            .unwrap();
        assert_eq!(table.rows, vec![vec![Value::Date(20000109)], vec![Value::Date(20000110)]]);
    }

    #[test]
    fn test_failures_reported_together() {
        let session = session();
        let err = session.run(&RunCommand::default(), &CancelSignal::new()).unwrap_err();
        assert!(err.to_string().contains("Broken failed"));
        // The healthy simulations still ran.
        assert_eq!(session.store().row_count("Report"), 15);
    }

    #[test]
    fn test_session_threads_bounded() {
        assert_eq!(session_threads(3000, 1), 1);
        assert_eq!(session_threads(i32::MAX, 0), 1);
        assert_eq!(session_threads(0, 4), 1);
        assert_eq!(session_threads(-5, 4), 1);
        let host = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        assert!(session_threads(3000, 1000) <= host);
    }

    #[test]
    fn test_huge_parallelism_request_runs() {
        let session = session();
        let command = RunCommand {
            max_parallelism: i32::MAX,
            simulation_names: vec!["Sim2".into()],
            ..Default::default()
        };
        session.run(&command, &CancelSignal::new()).unwrap();
        assert_eq!(session.store().row_count("Report"), 5);
    }

    #[test]
    fn test_unknown_simulation_rejected() {
        let session = session();
        let command = RunCommand {
            simulation_names: vec!["Nope".into()],
            ..Default::default()
        };
        assert!(session.run(&command, &CancelSignal::new()).is_err());
    }

    #[test]
    fn test_load_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"[{"kind": "clock", "name": "Sim", "overrides": [{"path": "[Crop].GrowthRate", "value": "2"}]}]"#,
        )
        .unwrap();
        let catalog = load_catalog(&path).unwrap();
        assert_eq!(catalog[0].name, "Sim");
        assert!(!catalog[0].id.is_empty());
    }
}
