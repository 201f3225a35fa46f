//! simpool worker process.
//!
//! Speaks to its orchestrator (or a native client) over two one-directional
//! endpoints given on the command line, e.g.
//!
//! ```text
//! simpool-worker fd:5 fd:4 --protocol object
//! simpool-worker - - --protocol native --catalog sims.json
//! ```
//!
//! Logging goes to stderr only; stdout may be the outbound channel.

use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use simpool_core::ipc::{Channel, DEFAULT_MAX_FRAME_LEN, Endpoint, NativeChannel};
use simpool_core::worker::{NativeServer, Session, WorkerClient, load_catalog};
use simpool_core::{Registry, WireProtocol};

#[derive(Parser)]
#[command(name = "simpool-worker")]
#[command(about = "Executes simpool jobs received over a channel pair")]
#[command(version)]
struct Args {
    /// Endpoint this worker writes to (`fd:<N>` or `-` for stdout)
    outbound: Endpoint,

    /// Endpoint this worker reads from (`fd:<N>` or `-` for stdin)
    inbound: Endpoint,

    /// Wire protocol: object or native
    #[arg(long, default_value = "object")]
    protocol: WireProtocol,

    /// JSON list of simulations addressable by run commands
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Progress heartbeat interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    heartbeat_ms: u64,

    /// Largest frame accepted, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    max_frame_len: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let registry = Arc::new(Registry::with_builtins());
    let catalog = match &args.catalog {
        Some(path) => load_catalog(path).map_err(|e| anyhow::anyhow!("{}", e.with_hint()))?,
        None => Vec::new(),
    };

    let reader = BufReader::new(args.inbound.open_inbound()?);
    let writer = BufWriter::new(args.outbound.open_outbound()?);
    tracing::debug!(
        inbound = %args.inbound,
        outbound = %args.outbound,
        protocol = %args.protocol,
        "worker starting"
    );

    match args.protocol {
        WireProtocol::Object => {
            let channel = Channel::new(reader, writer).with_max_frame_len(args.max_frame_len);
            let stats = WorkerClient::new(channel, registry)
                .with_catalog(catalog)
                .with_heartbeat_interval(Duration::from_millis(args.heartbeat_ms.max(1)))
                .serve()
                .map_err(|e| anyhow::anyhow!("{}", e.with_hint()))?;
            tracing::info!(
                jobs = stats.jobs,
                failed = stats.failed_jobs,
                runs = stats.runs,
                reads = stats.reads,
                "worker finished"
            );
        }
        WireProtocol::Native => {
            let channel = NativeChannel::new(reader, writer).with_max_frame_len(args.max_frame_len);
            NativeServer::new(channel, Session::new(registry, catalog))
                .serve()
                .map_err(|e| anyhow::anyhow!("{}", e.with_hint()))?;
        }
    }

    Ok(())
}
