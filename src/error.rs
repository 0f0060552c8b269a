//! The error taxonomy described in the design: usage errors, safety refusals,
//! syscall failures and lock contention are distinguished so that callers
//! (chiefly `main`) can choose the right exit code and message.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("{0}")]
    Usage(String),

    #[error("{path}: refused to use unsafe {kind} ({reason})")]
    SafetyRefusal {
        path: PathBuf,
        kind: &'static str,
        reason: String,
    },

    #[error("{context}: {source}")]
    Syscall {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{pidfile}: already running as pid {pid}")]
    LockContention { pidfile: PathBuf, pid: i32 },
}

impl DaemonError {
    pub fn syscall(context: impl Into<String>, source: io::Error) -> Self {
        DaemonError::Syscall {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
