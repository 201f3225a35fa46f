//! Core engine for simpool, a multi-process simulation job runner.
//!
//! This crate provides:
//! - Framing plus native and object codecs for worker channels
//! - The worker-side job loop with progress heartbeats
//! - Storage redirection so worker output flows back to one store
//! - The orchestrator that fans jobs out over worker processes
//! - The legacy remote file-transfer protocol

pub mod config;
pub mod error;
pub mod ipc;
pub mod orchestrator;
pub mod remote;
pub mod runnable;
pub mod storage;
pub mod worker;

pub use config::{PoolConfig, WireProtocol, find_worker_binary};
pub use error::{Error, Result};
pub use ipc::{JobOutput, JobSpec, Override, ReadCommand, Request, Response, RunCommand, Table, Value};
pub use orchestrator::{
    InProcessLauncher, JobCallback, JobResult, Orchestrator, ProcessLauncher, RunSummary, WorkerLauncher,
};
pub use runnable::{CancelSignal, Progress, Registry, Runnable, Simulation};
pub use storage::{DataStore, MemoryStore, StorageRedirect};
pub use worker::{NativeServer, Session, WorkerClient};
