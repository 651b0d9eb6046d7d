//! Core data model for root filesystem snapshots.

use std::fmt::Display;

use anyhow::{anyhow, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// Identifier of a snapshot. Ids are strictly monotonic per state
/// partition and never reused.
pub(crate) type SnapshotId = u64;

/// Sentinel id meaning "no snapshot" (e.g. a system booted from installer
/// media or recovery is not running from any snapshot).
pub(crate) const NO_SNAPSHOT: SnapshotId = 0;

/// Directory on the state partition holding all snapshots.
pub(crate) const SNAPSHOTS_DIR: &str = ".snapshots";

/// A committed or in-progress root filesystem revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub(crate) id: SnapshotId,
    /// Where the committed contents live; read-only once committed.
    pub(crate) path: Utf8PathBuf,
    /// Writable tree used while the transaction is open. Equals `path`
    /// only for the very first snapshot on btrfs.
    pub(crate) work_dir: Utf8PathBuf,
    /// Bind mount of `work_dir` during the transaction.
    pub(crate) mount_point: Utf8PathBuf,
    /// Filesystem label to stamp on the snapshot image (loop device only).
    pub(crate) label: Option<String>,
    pub(crate) in_progress: bool,
}

/// The snapshot inventory of one state partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SnapshotsList {
    /// All snapshot ids, ascending.
    pub(crate) ids: Vec<SnapshotId>,
    /// Default next-boot snapshot.
    pub(crate) active_id: SnapshotId,
    /// Snapshot the running system booted from, or [`NO_SNAPSHOT`].
    pub(crate) current_id: SnapshotId,
}

impl SnapshotsList {
    pub(crate) fn contains(&self, id: SnapshotId) -> bool {
        self.ids.contains(&id)
    }
}

/// Result of probing a state device. Filesystem probes reliably report
/// only one mountpoint per block device even if several subvolumes are
/// mounted, so the probe resolves them explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BackendStat {
    pub(crate) active_id: SnapshotId,
    pub(crate) current_id: SnapshotId,
    /// Root under which `.snapshots/` is addressed; unset when the
    /// partition carries no recognized layout yet.
    pub(crate) root_dir: Option<Utf8PathBuf>,
    /// Where the state partition itself is mounted.
    pub(crate) state_mount: Option<Utf8PathBuf>,
}

/// Descriptor of the partition hosting all snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Partition {
    pub(crate) name: String,
    pub(crate) device: Utf8PathBuf,
    pub(crate) mount_point: Utf8PathBuf,
    pub(crate) filesystem: String,
    #[serde(default)]
    pub(crate) flags: Vec<String>,
}

/// Source material for populating or rebuilding a system image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ImageSource {
    /// A plain directory tree.
    Dir(Utf8PathBuf),
    /// A raw filesystem image file.
    File(Utf8PathBuf),
}

impl ImageSource {
    /// Parse the CLI form `dir:<path>` or `file:<path>`.
    pub(crate) fn parse(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some(("dir", p)) if !p.is_empty() => Ok(Self::Dir(p.into())),
            Some(("file", p)) if !p.is_empty() => Ok(Self::File(p.into())),
            _ => Err(anyhow!("invalid image source: {s}")),
        }
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        match self {
            Self::Dir(p) | Self::File(p) => p,
        }
    }
}

impl Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dir(p) => write!(f, "dir:{p}"),
            Self::File(p) => write!(f, "file:{p}"),
        }
    }
}
