//! Engine configuration.
//!
//! Only the snapshotter section is interpreted here; the rest of the
//! config file belongs to other tooling and passes through untouched.

use anyhow::{Context, Result};
use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::SnapshotterError;
use crate::vfs::Filesystem;

fn default_max_snaps() -> u32 {
    4
}

fn default_loop_fs() -> String {
    "ext4".to_string()
}

/// Snapshotter selection and tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct SnapshotterConfig {
    /// Upper bound on kept snapshots. The currently booted snapshot is
    /// never evicted even when that exceeds the cap.
    #[serde(default = "default_max_snaps")]
    pub(crate) max_snaps: u32,
    #[serde(flatten)]
    pub(crate) backend: BackendConfig,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            max_snaps: default_max_snaps(),
            backend: BackendConfig::LoopDevice(LoopDeviceConfig::default()),
        }
    }
}

/// Per-layout configuration payload, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub(crate) enum BackendConfig {
    LoopDevice(LoopDeviceConfig),
    Btrfs(BtrfsConfig),
}

impl BackendConfig {
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            BackendConfig::LoopDevice(_) => "loop-device",
            BackendConfig::Btrfs(_) => "btrfs",
        }
    }
}

/// Map a type name from the command line onto a default-configured
/// backend payload.
pub(crate) fn backend_for_type(name: &str) -> Result<BackendConfig> {
    match name {
        "loop-device" => Ok(BackendConfig::LoopDevice(LoopDeviceConfig::default())),
        "btrfs" => Ok(BackendConfig::Btrfs(BtrfsConfig::default())),
        other => Err(SnapshotterError::InvalidType(other.to_string()).into()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct LoopDeviceConfig {
    /// Filesystem stamped on new snapshot images.
    #[serde(default = "default_loop_fs")]
    pub(crate) fs: String,
    /// Image size in MiB; 0 derives the size from the populated tree.
    #[serde(default)]
    pub(crate) size: u64,
}

impl Default for LoopDeviceConfig {
    fn default() -> Self {
        Self {
            fs: default_loop_fs(),
            size: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct BtrfsConfig {
    /// Drive snapshots through snapper once the target system is
    /// bootstrapped, falling back to plain btrfs before that.
    #[serde(default)]
    pub(crate) snapper: bool,
}

/// Top level of the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct EngineConfig {
    #[serde(default)]
    pub(crate) snapshotter: SnapshotterConfig,
}

pub(crate) fn load_config(fs: &dyn Filesystem, path: &Utf8Path) -> Result<EngineConfig> {
    let buf = fs
        .read_to_string(path)
        .with_context(|| format!("Reading {path}"))?;
    serde_yaml::from_str(&buf).with_context(|| format!("Parsing {path}"))
}
