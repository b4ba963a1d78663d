//! Error taxonomy for the agent.
//!
//! Handle and decode errors indicate programming defects and are surfaced
//! loudly. Everything else is contained at the smallest boundary (one table,
//! one collection unit, one cycle) and reported through logs and counters.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure to resolve a native handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("native handle {0} was never registered")]
    Unknown(u64),

    #[error("native handle {0} has been invalidated")]
    Invalidated(u64),
}

/// Phase of the program lifecycle that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Open,
    Load,
    Attach,
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadPhase::Open => "open",
            LoadPhase::Load => "load",
            LoadPhase::Attach => "attach",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ProgramLoadError {
    #[error("program {program}: object file not found at {}", path.display())]
    NotFound { program: String, path: PathBuf },

    #[error("program {program}: {phase} failed: {reason}")]
    Phase {
        program: String,
        phase: LoadPhase,
        reason: String,
    },

    #[error("program {program}: {source}")]
    Handle {
        program: String,
        #[source]
        source: HandleError,
    },
}

impl ProgramLoadError {
    /// The lifecycle phase that failed, if the failure happened inside one.
    pub fn phase(&self) -> Option<LoadPhase> {
        match self {
            ProgramLoadError::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("program {0} is not loaded")]
    ProgramNotLoaded(String),

    #[error("program {program} does not declare table {table}")]
    UnknownTable { program: String, table: String },

    #[error("table {0}: batch lookup-and-delete is not supported")]
    BatchUnsupported(String),

    #[error("table {table}: expected {expected}-byte {what}, got {actual}")]
    Size {
        table: String,
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("table {table}: {op} failed: {reason}")]
    Io {
        table: String,
        op: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Handle(#[from] HandleError),
}

/// A kernel record did not match its compiled layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{record} record is {actual} bytes, expected {expected}")]
    SizeMismatch {
        record: &'static str,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to read pod list {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse pod list: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("pod discovery unavailable: {0}")]
    Unavailable(String),
}

/// Failure of one collection unit inside a cycle.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("metric registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("collector panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
#[error("collection cycle exceeded {timeout:?} with {completed} of {scheduled} units finished")]
pub struct CycleTimeoutError {
    pub timeout: Duration,
    pub completed: usize,
    pub scheduled: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_reports_phase() {
        let err = ProgramLoadError::Phase {
            program: "cpu_sched".into(),
            phase: LoadPhase::Attach,
            reason: "no such tracepoint".into(),
        };
        assert_eq!(err.phase(), Some(LoadPhase::Attach));
        assert_eq!(
            err.to_string(),
            "program cpu_sched: attach failed: no such tracepoint"
        );
    }

    #[test]
    fn test_decode_error_message() {
        let err = DecodeError::SizeMismatch {
            record: "histogram",
            expected: 232,
            actual: 224,
        };
        assert_eq!(err.to_string(), "histogram record is 224 bytes, expected 232");
    }
}
