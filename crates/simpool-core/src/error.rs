//! Error types for simpool-core.

use thiserror::Error;

/// Result type for simpool-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in simpool-core.
///
/// Job-execution failures are deliberately absent: they travel as data in
/// [`JobOutput::error_message`](crate::ipc::JobOutput) and never surface here.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error on a channel or file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the channel cleanly between frames.
    #[error("channel closed by peer")]
    ChannelClosed,

    /// A frame exceeded the configured size limit.
    #[error("frame too large: {len} bytes (limit {limit})")]
    FrameTooLarge { len: usize, limit: usize },

    /// The peer sent something the protocol does not allow at this point.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A write did not match the structural shape of a row.
    #[error("row arity mismatch for table {table}: {names} names, {units} units, {values} values")]
    Arity {
        table: String,
        names: usize,
        units: usize,
        values: usize,
    },

    /// Requested table does not exist in the store.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// Requested column does not exist in a table.
    #[error("column {column} not found in table {table}")]
    ColumnNotFound { table: String, column: String },

    /// No runnable kind registered under this name.
    #[error("unknown runnable kind: {0}")]
    UnknownKind(String),

    /// An override path or value was rejected by a runnable.
    #[error("invalid override {path}: {message}")]
    Override { path: String, message: String },

    /// Worker process could not be launched or located.
    #[error("worker launch failed: {0}")]
    Launch(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Known gap in the native codec.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl Error {
    /// Whether this error means the channel is unusable.
    ///
    /// Transport faults end the slot's current cycle; the orchestrator must
    /// relaunch the worker before dispatching again.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::ChannelClosed | Error::Io(_))
    }

    /// Add a recovery hint for errors surfaced to CLI users.
    pub fn with_hint(&self) -> String {
        match self {
            Error::Launch(_) => format!(
                "{}\n  hint: build the worker with `cargo build -p simpool-worker` or set SIMPOOL_WORKER_PATH",
                self
            ),
            Error::UnknownKind(_) => format!(
                "{}\n  hint: the worker registers `noop`, `clock` and `fail` by default",
                self
            ),
            Error::FrameTooLarge { .. } => format!(
                "{}\n  hint: raise the limit with --max-frame-mib",
                self
            ),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        assert!(Error::ChannelClosed.is_disconnect());
        assert!(Error::Io(std::io::ErrorKind::BrokenPipe.into()).is_disconnect());
        assert!(!Error::Protocol("unexpected Ack".into()).is_disconnect());
    }

    #[test]
    fn test_hint_mentions_worker_path() {
        let hint = Error::Launch("not found".into()).with_hint();
        assert!(hint.contains("SIMPOOL_WORKER_PATH"));
    }
}
