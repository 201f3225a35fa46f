//! Inter-process communication for simpool worker processes.
//!
//! This module provides the framing, both payload codecs and the
//! command/acknowledgement handshake used between the orchestrator and
//! its workers.

mod channel;
pub mod frame;
pub mod native;
pub mod protocol;

pub use channel::{Channel, Endpoint, SharedWriter, lock_writer};
pub use frame::{DEFAULT_MAX_FRAME_LEN, read_frame, read_frame_with_limit, write_frame};
pub use native::NativeChannel;
pub use protocol::{
    Column, Field, JobOutput, JobSpec, Override, ProgressReport, ReadCommand, Request, Response, Row,
    RunCommand, SCHEMA_VERSION, Table, Value, WireMessage, pack_date, read_message, write_message,
};
