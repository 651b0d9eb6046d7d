//! Pluggable low-level drivers for the btrfs engine.
//!
//! A backend owns the on-disk subvolume operations; the snapshotter above
//! it owns mounts, transactions and the bootloader coupling. Two
//! implementations exist: plain `btrfs` CLI, and `snapper` for targets
//! that are already bootstrapped.

use std::sync::OnceLock;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::snapshot::{BackendStat, Snapshot, SnapshotId, SnapshotsList, SNAPSHOTS_DIR};

mod btrfs;
mod snapper;

pub(crate) use btrfs::BtrfsBackend;
pub(crate) use snapper::SnapperBackend;

/// Subvolume id of the top subvolume `@`. Fixed for compatibility with
/// snapper's expectations about partition shape.
pub(crate) const TOP_SUBVOL_ID: u64 = 257;

/// Subvolume id of `@/.snapshots`.
pub(crate) const SNAPSHOTS_SUBVOL_ID: u64 = 258;

/// Name of the top subvolume.
pub(crate) const TOP_SUBVOL: &str = "@";

/// On-disk btrfs operations shared by all backends.
pub(crate) trait SubvolumeBackend: std::fmt::Debug {
    /// Probe `device`, expected mounted at `mountpoint`. A partition
    /// carrying no recognized layout yields a default stat (no root);
    /// a reshaped partition is an error.
    fn probe(&mut self, device: &Utf8Path, mountpoint: &Utf8Path) -> Result<BackendStat>;

    /// Lay out a pristine partition: quota, top subvolume, snapshots
    /// subvolume, quota group.
    fn init_partition(&mut self, root_dir: &Utf8Path) -> Result<()>;

    /// Create a new writable snapshot. `base_id == 0` creates the very
    /// first snapshot of the partition.
    fn create_new_snapshot(&mut self, root_dir: &Utf8Path, base_id: SnapshotId)
        -> Result<Snapshot>;

    /// Mark the snapshot read-only and make it the default.
    fn commit_snapshot(&mut self, root_dir: &Utf8Path, snapshot: &Snapshot) -> Result<()>;

    fn list_snapshots(&self, root_dir: &Utf8Path) -> Result<SnapshotsList>;

    /// Refuses the sentinel id and the currently booted snapshot.
    fn delete_snapshot(&mut self, root_dir: &Utf8Path, id: SnapshotId) -> Result<()>;

    /// Evict oldest snapshots until at most `max_snapshots` remain,
    /// stopping quietly if the next victim is in use.
    fn cleanup(&mut self, root_dir: &Utf8Path, max_snapshots: usize) -> Result<()>;
}

/// One row of `btrfs subvolume list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SubvolEntry {
    pub(crate) id: u64,
    pub(crate) path: String,
}

fn subvol_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^ID (\d+) gen \d+ top level \d+ path (.+)$").unwrap()
    })
}

fn snapshot_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\.snapshots/(\d+)/snapshot/?$").unwrap())
}

/// Parse `btrfs subvolume list` output.
pub(crate) fn parse_subvolume_list(out: &str) -> Vec<SubvolEntry> {
    subvol_line_re()
        .captures_iter(out)
        .filter_map(|c| {
            Some(SubvolEntry {
                id: c[1].parse().ok()?,
                path: c[2].trim().to_string(),
            })
        })
        .collect()
}

/// Parse `btrfs subvolume get-default` output. The blank filesystem tree
/// (`ID 5 (FS_TREE)`) yields `None`.
pub(crate) fn parse_default_subvolume(out: &str) -> Option<SubvolEntry> {
    parse_subvolume_list(out).into_iter().next()
}

/// Extract the snapshot id from a subvolume or mount path like
/// `@/.snapshots/12/snapshot`.
pub(crate) fn snapshot_id_from_path(path: &str) -> Option<SnapshotId> {
    snapshot_path_re()
        .captures(path)
        .and_then(|c| c[1].parse().ok())
}

/// `<root>/.snapshots/<id>`
pub(crate) fn snapshot_dir(root_dir: &Utf8Path, id: SnapshotId) -> Utf8PathBuf {
    root_dir.join(SNAPSHOTS_DIR).join(id.to_string())
}

/// `<root>/.snapshots/<id>/snapshot`
pub(crate) fn snapshot_path(root_dir: &Utf8Path, id: SnapshotId) -> Utf8PathBuf {
    snapshot_dir(root_dir, id).join("snapshot")
}

/// `<root>/.snapshots/<id>/snapshot.workDir`
pub(crate) fn snapshot_work_dir(root_dir: &Utf8Path, id: SnapshotId) -> Utf8PathBuf {
    snapshot_dir(root_dir, id).join("snapshot.workDir")
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_parse_subvolume_list() {
        let out = indoc! {"
            ID 257 gen 12 top level 5 path @
            ID 258 gen 14 top level 257 path @/.snapshots
            ID 259 gen 14 top level 258 path @/.snapshots/1/snapshot
            ID 262 gen 18 top level 258 path @/.snapshots/2/snapshot
        "};
        let entries = parse_subvolume_list(out);
        assert_eq!(entries.len(), 4);
        assert_eq!(
            entries[0],
            SubvolEntry {
                id: 257,
                path: "@".into()
            }
        );
        assert_eq!(entries[3].id, 262);
        let ids: Vec<_> = entries
            .iter()
            .filter_map(|e| snapshot_id_from_path(&e.path))
            .collect();
        assert_eq!(ids, [1, 2]);
    }

    #[test]
    fn test_parse_default_subvolume() {
        let def =
            parse_default_subvolume("ID 259 gen 14 top level 258 path @/.snapshots/1/snapshot\n")
                .unwrap();
        assert_eq!(def.id, 259);
        assert_eq!(snapshot_id_from_path(&def.path), Some(1));
        assert_eq!(parse_default_subvolume("ID 5 (FS_TREE)\n"), None);
    }

    #[test]
    fn test_snapshot_id_from_path() {
        assert_eq!(snapshot_id_from_path("@/.snapshots/31/snapshot"), Some(31));
        assert_eq!(snapshot_id_from_path("/@/.snapshots/2/snapshot"), Some(2));
        assert_eq!(snapshot_id_from_path("@/.snapshots/2/snapshot.workDir"), None);
        assert_eq!(snapshot_id_from_path("@/.snapshots"), None);
        assert_eq!(snapshot_id_from_path("@"), None);
    }

    #[test]
    fn test_layout_paths() {
        let root = Utf8Path::new("/some/root");
        assert_eq!(snapshot_dir(root, 4), "/some/root/.snapshots/4");
        assert_eq!(snapshot_path(root, 4), "/some/root/.snapshots/4/snapshot");
        assert_eq!(
            snapshot_work_dir(root, 4),
            "/some/root/.snapshots/4/snapshot.workDir"
        );
    }
}
