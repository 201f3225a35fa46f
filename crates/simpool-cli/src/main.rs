//! simpool CLI - run simulation jobs across worker processes.

mod colors;
mod manifest;
mod run;
mod serve;
mod submit;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "simpool")]
#[command(about = "Run simulation jobs across isolated worker processes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every job in a manifest and merge their output
    Run {
        /// Path to the job manifest (.json)
        manifest: PathBuf,

        /// Number of worker processes (default: CPU count)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Write merged tables to this JSON file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Worker binary to launch
        #[arg(long)]
        worker_bin: Option<PathBuf>,

        /// Progress heartbeat interval in milliseconds
        #[arg(long)]
        heartbeat_ms: Option<u64>,

        /// Largest frame accepted from a worker, in MiB
        #[arg(long)]
        max_frame_mib: Option<usize>,
    },

    /// Accept remote submissions and run a command for each
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:27746")]
        listen: String,

        /// Command run in each submission's scratch directory
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Send files to a remote server and collect the results
    Submit {
        /// Server address
        addr: String,

        /// Input files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Directory for returned files
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Helper to format simpool-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<simpool_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Run {
            manifest,
            workers,
            output,
            worker_bin,
            heartbeat_ms,
            max_frame_mib,
        } => {
            let options = run::RunOptions {
                manifest,
                workers,
                output,
                worker_bin,
                heartbeat_ms,
                max_frame_mib,
                verbose: cli.verbose,
            };
            run::execute(options).await.map_err(format_error)?;
        }

        Commands::Serve { listen, command } => {
            serve::execute(&listen, command).await.map_err(format_error)?;
        }

        Commands::Submit { addr, files, out_dir } => {
            submit::execute(&addr, &files, &out_dir).map_err(format_error)?;
        }
    }

    Ok(())
}
