//! IPC protocol messages for simpool worker processes.
//!
//! Uses length-prefixed rkyv messages over a pipe pair.
//! Format: 4-byte length (u32 LE) + 4-byte schema version (u32 LE) +
//! rkyv-encoded message. The enum discriminator inside the archive tells
//! the reader which variant it holds.

use std::fmt;
use std::io::{Read, Write};

use chrono::{Datelike, NaiveDate};
use rkyv::Archive;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Error, Result};

use super::frame::{read_frame_with_limit, write_frame};

/// Version of the message schema below. Bump on any layout change.
pub const SCHEMA_VERSION: u32 = 1;

/// A single cell value written by a simulation.
#[derive(Debug, Clone, PartialEq, Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum Value {
    /// Column absent from this row.
    Null,
    Int(i32),
    Double(f64),
    Bool(bool),
    Text(String),
    /// Calendar date packed as `yyyymmdd`.
    Date(i32),
}

/// Pack a calendar date as `yyyymmdd`.
///
/// Only years 0 through 9999 have a packed form.
pub fn pack_date(date: NaiveDate) -> Result<i32> {
    if !(0..=9999).contains(&date.year()) {
        return Err(Error::Protocol(format!("date {} has no yyyymmdd form", date)));
    }
    Ok(date.year() * 10000 + date.month() as i32 * 100 + date.day() as i32)
}

impl Value {
    /// Pack a calendar date.
    pub fn from_date(date: NaiveDate) -> Result<Self> {
        pack_date(date).map(Value::Date)
    }

    /// Unpack a date value, if this is one and it names a real day.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match *self {
            Value::Date(packed) => {
                NaiveDate::from_ymd_opt(packed / 10000, ((packed % 10000) / 100) as u32, (packed % 100) as u32)
            }
            _ => None,
        }
    }

    /// Numeric view of the value, for ints and doubles.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int(i) => Some(i as f64),
            Value::Double(d) => Some(d),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Text(s) => f.write_str(s),
            Value::Date(_) => match self.as_date() {
                Some(date) => write!(f, "{}", date.format("%Y-%m-%d")),
                None => f.write_str("invalid-date"),
            },
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Int(i) => serializer.serialize_i32(*i),
            Value::Double(d) => serializer.serialize_f64(*d),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Date(_) => serializer.collect_str(self),
        }
    }
}

/// A parameter replacement applied to a runnable before it runs.
#[derive(
    Debug, Clone, PartialEq, Eq, Archive, rkyv::Serialize, rkyv::Deserialize, Serialize, Deserialize,
)]
pub struct Override {
    /// Model path, e.g. `[Clock].StartDate`.
    pub path: String,
    /// Replacement value in its textual form.
    pub value: String,
}

impl Override {
    pub fn new(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
        }
    }
}

/// Wire form of a runnable: everything a worker needs to materialize it.
#[derive(
    Debug, Clone, PartialEq, Eq, Archive, rkyv::Serialize, rkyv::Deserialize, Serialize, Deserialize,
)]
pub struct JobSpec {
    /// Unique job identifier, generated when omitted from a manifest.
    #[serde(default = "new_job_id")]
    pub id: String,
    /// Registry key used by the worker to build the runnable.
    pub kind: String,
    /// Simulation name; rows it writes are tagged with it.
    pub name: String,
    /// Replacements applied before running.
    #[serde(default)]
    pub overrides: Vec<Override>,
}

fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl JobSpec {
    /// Create a job with a fresh id.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: new_job_id(),
            kind: kind.into(),
            name: name.into(),
            overrides: Vec::new(),
        }
    }

    /// Add a replacement.
    pub fn with_override(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push(Override::new(path, value));
        self
    }
}

/// Run registered simulations inside the worker's session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct RunCommand {
    pub verbose: bool,
    pub run_tests: bool,
    /// Upper bound on simulations run at once; values below 1 mean one.
    pub max_parallelism: i32,
    pub overrides: Vec<Override>,
    /// Simulations to run; empty runs every registered one.
    pub simulation_names: Vec<String>,
}

/// Read columns of a table from the worker's session store.
#[derive(Debug, Clone, PartialEq, Eq, Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ReadCommand {
    pub table_name: String,
    pub field_names: Vec<String>,
}

/// Request sent from orchestrator to worker process.
#[derive(Debug, Clone, PartialEq, Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum Request {
    /// Execute one runnable and answer with `Output`.
    Job(JobSpec),
    /// Run session simulations and answer with `Finished`.
    Run(RunCommand),
    /// Read a session table and answer with `Table`.
    Read(ReadCommand),
}

impl Request {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Request::Job(_) => "job",
            Request::Run(_) => "run",
            Request::Read(_) => "read",
        }
    }
}

/// Periodic progress snapshot for the active job.
#[derive(Debug, Clone, PartialEq, Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ProgressReport {
    pub job_id: String,
    /// Fraction complete in `0..=1`.
    pub fraction: f64,
}

/// Column header: name plus optional unit.
#[derive(Debug, Clone, PartialEq, Eq, Archive, rkyv::Serialize, rkyv::Deserialize, Serialize)]
pub struct Column {
    pub name: String,
    pub unit: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, unit: Option<String>) -> Self {
        Self {
            name: name.into(),
            unit,
        }
    }
}

/// One (column, unit, value) triple of a row.
#[derive(Debug, Clone, PartialEq, Archive, rkyv::Serialize, rkyv::Deserialize, Serialize)]
pub struct Field {
    pub name: String,
    pub unit: Option<String>,
    pub value: Value,
}

/// A single captured `write_row` call.
#[derive(Debug, Clone, PartialEq, Archive, rkyv::Serialize, rkyv::Deserialize, Serialize)]
pub struct Row {
    pub simulation_name: String,
    pub table_name: String,
    pub fields: Vec<Field>,
}

/// A whole table, column headers plus rows of values in column order.
#[derive(Debug, Clone, PartialEq, Archive, rkyv::Serialize, rkyv::Deserialize, Serialize)]
pub struct Table {
    /// Owning simulation; `None` for tables spanning simulations.
    pub simulation_name: Option<String>,
    pub table_name: String,
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(table_name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            simulation_name: None,
            table_name: table_name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Terminal result of one job.
#[derive(Debug, Clone, PartialEq, Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct JobOutput {
    pub job_id: String,
    /// Present iff the job failed; original error text.
    pub error_message: Option<String>,
    pub report_rows: Vec<Row>,
    pub data_tables: Vec<Table>,
}

impl JobOutput {
    /// Output for a job that failed before or outside its own run.
    pub fn failed(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            error_message: Some(message.into()),
            report_rows: Vec::new(),
            data_tables: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error_message.is_none()
    }

    /// No error and something was captured.
    pub fn is_clean_success(&self) -> bool {
        self.succeeded() && (!self.report_rows.is_empty() || self.data_tables.iter().any(|t| !t.is_empty()))
    }
}

/// Response sent from worker to orchestrator.
#[derive(Debug, Clone, PartialEq, Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum Response {
    /// Request decoded; the worker owns it now.
    Ack,
    /// A `Run` request completed.
    Finished,
    /// A `Run` or `Read` request could not be carried out.
    Failed { message: String },
    /// Heartbeat while a job runs.
    Progress(ProgressReport),
    /// Terminal result of a `Job` request.
    Output(JobOutput),
    /// Result of a `Read` request.
    Table(Table),
}

impl Response {
    /// Short label for logging and protocol errors.
    pub fn label(&self) -> &'static str {
        match self {
            Response::Ack => "ack",
            Response::Finished => "finished",
            Response::Failed { .. } => "failed",
            Response::Progress(_) => "progress",
            Response::Output(_) => "output",
            Response::Table(_) => "table",
        }
    }
}

/// A message with a versioned rkyv encoding.
pub trait WireMessage: Sized {
    fn encode(&self) -> Result<Vec<u8>>;
    fn decode(bytes: &[u8]) -> Result<Self>;
}

macro_rules! wire_message {
    ($ty:ty) => {
        impl WireMessage for $ty {
            fn encode(&self) -> Result<Vec<u8>> {
                let archived = rkyv::to_bytes::<rkyv::rancor::Error>(self).map_err(|e| {
                    Error::Serialization(format!("Failed to encode {}: {}", stringify!($ty), e))
                })?;
                let mut bytes = Vec::with_capacity(4 + archived.len());
                bytes.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
                bytes.extend_from_slice(&archived);
                Ok(bytes)
            }

            fn decode(bytes: &[u8]) -> Result<Self> {
                let body = check_version(bytes)?;
                // The archive must sit at an aligned address.
                let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(body.len());
                aligned.extend_from_slice(body);
                rkyv::from_bytes::<$ty, rkyv::rancor::Error>(&aligned).map_err(|e| {
                    Error::Serialization(format!("Failed to decode {}: {}", stringify!($ty), e))
                })
            }
        }
    };
}

wire_message!(Request);
wire_message!(Response);

fn check_version(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < 4 {
        return Err(Error::Serialization(format!(
            "message too short for schema header: {} bytes",
            bytes.len()
        )));
    }
    let (header, body) = bytes.split_at(4);
    let version = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if version != SCHEMA_VERSION {
        return Err(Error::Serialization(format!(
            "schema version mismatch: peer sent {}, expected {}",
            version, SCHEMA_VERSION
        )));
    }
    Ok(body)
}

/// Write a message to a writer as one frame.
pub fn write_message<W: Write + ?Sized, M: WireMessage>(writer: &mut W, message: &M) -> Result<()> {
    let bytes = message.encode()?;
    write_frame(writer, &bytes)
}

/// Read one framed message from a reader.
pub fn read_message<R: Read + ?Sized, M: WireMessage>(reader: &mut R, max_frame_len: usize) -> Result<M> {
    let bytes = read_frame_with_limit(reader, max_frame_len)?;
    M::decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::frame::DEFAULT_MAX_FRAME_LEN;
    use std::io::Cursor;

    #[test]
    fn test_command_roundtrip() {
        let cmd = Request::Run(RunCommand {
            verbose: true,
            run_tests: false,
            max_parallelism: 4,
            overrides: vec![Override::new("[Clock].StartDate", "2020-01-01")],
            simulation_names: vec!["Sim1".to_string(), "Sim2".to_string()],
        });

        let mut buf = Vec::new();
        write_message(&mut buf, &cmd).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: Request = read_message(&mut cursor, DEFAULT_MAX_FRAME_LEN).unwrap();

        match decoded {
            Request::Run(run) => {
                assert!(run.verbose);
                assert_eq!(run.max_parallelism, 4);
                assert_eq!(run.overrides[0].path, "[Clock].StartDate");
                assert_eq!(run.simulation_names, vec!["Sim1", "Sim2"]);
            }
            other => panic!("Wrong request type: {:?}", other),
        }
    }

    #[test]
    fn test_output_roundtrip() {
        let resp = Response::Output(JobOutput {
            job_id: "j1".to_string(),
            error_message: None,
            report_rows: vec![Row {
                simulation_name: "Sim".to_string(),
                table_name: "Report".to_string(),
                fields: vec![
                    Field {
                        name: "Yield".to_string(),
                        unit: Some("kg/ha".to_string()),
                        value: Value::Double(1234.5),
                    },
                    Field {
                        name: "Date".to_string(),
                        unit: None,
                        value: Value::Date(20200101),
                    },
                ],
            }],
            data_tables: vec![],
        });

        let mut buf = Vec::new();
        write_message(&mut buf, &resp).unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded: Response = read_message(&mut cursor, DEFAULT_MAX_FRAME_LEN).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut bytes = Response::Ack.encode().unwrap();
        bytes[..4].copy_from_slice(&(SCHEMA_VERSION + 1).to_le_bytes());
        assert!(matches!(Response::decode(&bytes), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_garbage_is_serialization_fault() {
        let mut bytes = SCHEMA_VERSION.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xff; 3]);
        assert!(matches!(Request::decode(&bytes), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_date_packing() {
        let date = NaiveDate::from_ymd_opt(2022, 3, 15).unwrap();
        let value = Value::from_date(date).unwrap();
        assert_eq!(value, Value::Date(20220315));
        assert_eq!(value.as_date(), Some(date));
        assert_eq!(value.to_string(), "2022-03-15");
    }

    #[test]
    fn test_date_outside_packed_range_rejected() {
        let far = NaiveDate::from_ymd_opt(250_000, 1, 1).unwrap();
        assert!(matches!(Value::from_date(far), Err(Error::Protocol(_))));
        let before = NaiveDate::from_ymd_opt(-1, 12, 31).unwrap();
        assert!(pack_date(before).is_err());
        assert_eq!(pack_date(NaiveDate::from_ymd_opt(9999, 12, 31).unwrap()).unwrap(), 99991231);
    }

    #[test]
    fn test_value_json() {
        let row = vec![Value::Null, Value::Int(3), Value::Date(20200101), Value::Text("x".into())];
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"[null,3,"2020-01-01","x"]"#
        );
    }

    #[test]
    fn test_clean_success_requires_data() {
        let mut output = JobOutput::failed("j", "boom");
        assert!(!output.succeeded());
        output.error_message = None;
        assert!(output.succeeded());
        assert!(!output.is_clean_success());
    }
}
