use std::path::PathBuf;
use thiserror::Error;

use crate::store::Partition;

/// Errors raised by the store, triage engine and export assembler.
///
/// Every variant carries the identifier (and where relevant the operation)
/// so an operator can act on the failure by hand.
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("candidate '{id}' is missing artifact {}", .path.display())]
    MissingArtifact { id: String, path: PathBuf },

    #[error("candidate '{id}' has malformed geometry: {reason}")]
    MalformedGeometry { id: String, reason: String },

    #[error("cannot {op} '{id}': {} already exists", .path.display())]
    DuplicateTarget {
        id: String,
        op: &'static str,
        path: PathBuf,
    },

    #[error("cannot {op} '{id}': already triaged into {partition}")]
    AlreadyTriaged {
        id: String,
        op: &'static str,
        partition: Partition,
    },

    #[error("failed to {op} '{id}' while moving {}: {source}{}", .path.display(), rollback_note(.stranded))]
    RelocationFailed {
        id: String,
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
        /// Files rollback could not return to the pending location.
        stranded: Vec<PathBuf>,
    },

    #[error("nothing to export: the keep partition is empty")]
    EmptyBatch,

    #[error("cannot write {format} change file: {message}")]
    Serialize {
        format: &'static str,
        message: String,
    },

    #[error("unknown candidate '{0}'")]
    UnknownCandidate(String),

    #[error("an inference run is already in progress{} (lock file {})", owner_note(.owner), .lock.display())]
    InferenceInFlight { lock: PathBuf, owner: Option<u32> },

    #[error("invalid tag '{tag}': {reason}")]
    InvalidTag { tag: String, reason: &'static str },

    #[error("invalid detection manifest {}: {reason}", .path.display())]
    Manifest { path: PathBuf, reason: String },

    #[error("detector '{name}' failed: {message}")]
    Detector { name: String, message: String },

    #[error("failed to fetch model {what}: {message}")]
    ModelFetch { what: String, message: String },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn rollback_note(stranded: &[PathBuf]) -> String {
    if stranded.is_empty() {
        return String::new();
    }
    let names: Vec<String> = stranded.iter().map(|p| p.display().to_string()).collect();
    format!(" (rollback incomplete, left at: {})", names.join(", "))
}

fn owner_note(owner: &Option<u32>) -> String {
    owner.map(|pid| format!(" in process {pid}")).unwrap_or_default()
}

impl ReviewError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReviewError>;
