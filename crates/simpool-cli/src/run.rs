//! Run command implementation for simpool CLI.
//!
//! Drives the orchestrator over a manifest's jobs, prints progress and
//! results, and optionally writes the merged tables as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use simpool_core::orchestrator::{JobCallback, JobResult, Orchestrator};
use simpool_core::{DataStore, JobSpec, MemoryStore, PoolConfig};

use crate::colors;
use crate::manifest::Manifest;

pub struct RunOptions {
    pub manifest: PathBuf,
    pub workers: Option<usize>,
    pub output: Option<PathBuf>,
    pub worker_bin: Option<PathBuf>,
    pub heartbeat_ms: Option<u64>,
    pub max_frame_mib: Option<usize>,
    pub verbose: bool,
}

/// Prints one line per job lifecycle event.
struct ConsoleCallback {
    verbose: bool,
}

impl JobCallback for ConsoleCallback {
    fn on_job_started(&self, job: &JobSpec, slot: usize) {
        if self.verbose {
            println!("{}[slot {}]{} started {}", colors::DIM, slot, colors::RESET, job.name);
        }
    }

    fn on_job_progress(&self, job: &JobSpec, fraction: f64) {
        if self.verbose {
            println!("{}  {} {:>5.1}%{}", colors::DIM, job.name, fraction * 100.0, colors::RESET);
        }
    }

    fn on_job_completed(&self, result: &JobResult) {
        match result.error_message() {
            None => println!(
                "{}✓{} {} ({} rows, {:.2}s)",
                colors::GREEN,
                colors::RESET,
                result.job.name,
                result.rows_merged,
                result.elapsed.as_secs_f64()
            ),
            Some(message) => println!(
                "{}✗{} {}: {}",
                colors::RED,
                colors::RESET,
                result.job.name,
                message
            ),
        }
    }
}

fn build_config(options: &RunOptions, manifest: &Manifest) -> anyhow::Result<PoolConfig> {
    let mut config = PoolConfig::from_env()?.with_verbose_workers(options.verbose);
    if let Some(workers) = options.workers.or(manifest.workers) {
        config = config.with_workers(workers);
    }
    if let Some(path) = &options.worker_bin {
        config = config.with_worker_path(path);
    }
    if let Some(ms) = options.heartbeat_ms {
        config = config.with_heartbeat_interval(Duration::from_millis(ms));
    }
    if let Some(mib) = options.max_frame_mib {
        config = config.with_max_frame_len(mib.saturating_mul(1024 * 1024));
    }
    config.validate()?;
    Ok(config)
}

/// Execute a manifest.
pub async fn execute(options: RunOptions) -> anyhow::Result<()> {
    let manifest = Manifest::load(&options.manifest)?;
    if manifest.jobs.is_empty() {
        println!("{}No jobs in manifest.{}", colors::YELLOW, colors::RESET);
        return Ok(());
    }

    let config = build_config(&options, &manifest)?;
    println!(
        "{}Running{} {} jobs on {} workers",
        colors::BOLD,
        colors::RESET,
        manifest.jobs.len(),
        config.workers.min(manifest.jobs.len())
    );

    let store = Arc::new(MemoryStore::new());
    let shared: Arc<dyn DataStore> = store.clone();
    let mut orchestrator = Orchestrator::new(config, shared)?;
    orchestrator.set_callback(ConsoleCallback {
        verbose: options.verbose,
    });
    let cancel = orchestrator.cancel_signal();

    let jobs = manifest.jobs;
    let mut run = tokio::task::spawn_blocking(move || orchestrator.run(jobs));
    let summary = tokio::select! {
        result = &mut run => result??,
        _ = tokio::signal::ctrl_c() => {
            println!(
                "\n{}Interrupted:{} waiting for running jobs, no new jobs will start",
                colors::YELLOW,
                colors::RESET
            );
            cancel.cancel();
            run.await??
        }
    };

    if let Some(path) = &options.output {
        let tables = store.snapshot()?;
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &tables)?;
        println!("Wrote {} tables to {}", tables.len(), path.display());
    }

    println!("\n{}", "─".repeat(50));
    let color = if summary.all_passed() { colors::GREEN } else { colors::RED };
    println!(
        "{}Completed{} {} jobs in {:.2}s: {} passed, {} failed, {} rows merged",
        color,
        colors::RESET,
        summary.total(),
        summary.elapsed.as_secs_f64(),
        summary.passed(),
        summary.failed(),
        summary.rows_merged()
    );

    if !summary.all_passed() {
        for (job, message) in summary.failures() {
            eprintln!("  {} ({}): {}", job.name, job.id, message);
        }
        anyhow::bail!("{} of {} jobs failed", summary.failed(), summary.total());
    }
    Ok(())
}
