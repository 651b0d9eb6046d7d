//! Stable error taxonomy for the snapshotter subsystem.
//!
//! Callers generally travel through [`anyhow`] chains; these variants are
//! inserted where the displayed form is part of the contract with tests
//! and calling tools.

use camino::Utf8PathBuf;

#[derive(thiserror::Error, Debug)]
pub(crate) enum SnapshotterError {
    #[error("invalid snapshotter type: {0}")]
    InvalidType(String),
    #[error("uninitialized snapshotter")]
    Uninitialized,
    #[error("cannot determine snapshots, initiate snapshotter first")]
    SnapshotsUnavailable,
    #[error("given snapshot is not in progress")]
    NotInProgress,
    #[error("cannot delete a snapshot that is currently in use")]
    InUse,
    #[error("snapshot path does not exist: {0}")]
    #[allow(dead_code)]
    MissingSnapshotPath(Utf8PathBuf),
    #[error("{tool} failed: {output}")]
    Backend { tool: String, output: String },
    #[error("inconsistent snapshot state: {0}")]
    InvariantViolation(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
