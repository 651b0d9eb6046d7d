//! Transactional snapshot lifecycle over the two on-disk layouts.
//!
//! A snapshotter mediates between the orchestrator above (install,
//! upgrade, reset) and the state partition below. The lifecycle is
//! Init -> StartTransaction -> populate -> CloseTransaction, with
//! CloseTransactionOnError as the abort path. After a successful close
//! the previously active snapshot becomes passive and the boot menu
//! environment is rewritten.

use std::sync::Arc;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::config::{BackendConfig, SnapshotterConfig};
use crate::mode::Mode;
use crate::mount::Mounter;
use crate::runner::CommandRunner;
use crate::snapshot::{ImageSource, Partition, Snapshot, SnapshotId};
use crate::vfs::Filesystem;

mod btrfs;
mod loopdevice;

pub(crate) use btrfs::BtrfsSnapshotter;
pub(crate) use loopdevice::LoopDeviceSnapshotter;

/// Name of the fixed working-image directory under the runtime dir; the
/// open transaction's work tree is bind mounted here.
pub(crate) const WORKING_TREE_DIR: &str = "workingtree";

/// Shared collaborators handed to every snapshotter.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotterContext {
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) mounter: Arc<dyn Mounter>,
    pub(crate) fs: Arc<dyn Filesystem>,
    pub(crate) mode: Mode,
    /// Runtime directory (mode markers, working tree mountpoint).
    pub(crate) run_dir: Utf8PathBuf,
}

impl SnapshotterContext {
    pub(crate) fn working_tree_dir(&self) -> Utf8PathBuf {
        self.run_dir.join(WORKING_TREE_DIR)
    }
}

/// Transactional lifecycle of root filesystem snapshots.
pub(crate) trait Snapshotter: std::fmt::Debug {
    /// Probe and prepare the state partition. Must run before anything
    /// else; migration from legacy layouts happens here.
    fn init(&mut self) -> Result<()>;

    /// Open a transaction: create the next snapshot and bind mount its
    /// writable tree at the working-image directory.
    fn start_transaction(&mut self) -> Result<Snapshot>;

    /// Commit: seal the populated tree, switch the default boot target,
    /// then run cleanup and the bootloader update (best effort).
    fn close_transaction(&mut self, snapshot: &Snapshot) -> Result<()>;

    /// Abort: tear down mounts and delete the in-progress snapshot.
    fn close_transaction_on_error(&mut self, snapshot: &Snapshot) -> Result<()>;

    fn get_snapshots(&self) -> Result<Vec<SnapshotId>>;

    /// No-op for ids that do not exist; refuses the snapshot the running
    /// system booted from.
    fn delete_snapshot(&mut self, id: SnapshotId) -> Result<()>;

    /// Describe a committed snapshot as image source material (e.g. for
    /// building recovery media).
    #[allow(dead_code)]
    fn snapshot_to_image_source(&self, snapshot: &Snapshot) -> Result<ImageSource>;
}

/// Construct the snapshotter selected by configuration.
pub(crate) fn new_snapshotter(
    ctx: &SnapshotterContext,
    cfg: &SnapshotterConfig,
    state: &Partition,
    efi_dir: &Utf8Path,
) -> Result<Box<dyn Snapshotter>> {
    let max_snaps = cfg.max_snaps as usize;
    match &cfg.backend {
        BackendConfig::LoopDevice(loop_cfg) => Ok(Box::new(LoopDeviceSnapshotter::new(
            ctx.clone(),
            loop_cfg.clone(),
            max_snaps,
            state.clone(),
            efi_dir.to_owned(),
        ))),
        BackendConfig::Btrfs(btrfs_cfg) => Ok(Box::new(BtrfsSnapshotter::new(
            ctx.clone(),
            btrfs_cfg,
            max_snaps,
            state.clone(),
            efi_dir.to_owned(),
        ))),
    }
}

/// Unmounts its target when dropped. Returned by operations that mount
/// the snapshots subvolume temporarily, so the unmount runs on every
/// exit path.
pub(crate) struct ScopedMount {
    mounter: Arc<dyn Mounter>,
    target: Option<Utf8PathBuf>,
}

impl std::fmt::Debug for ScopedMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedMount")
            .field("target", &self.target)
            .finish()
    }
}

impl ScopedMount {
    pub(crate) fn new(mounter: Arc<dyn Mounter>, target: Utf8PathBuf) -> Self {
        Self {
            mounter,
            target: Some(target),
        }
    }
}

impl Drop for ScopedMount {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            if let Err(e) = self.mounter.unmount(&target) {
                tracing::warn!("Failed to unmount {target}: {e:#}");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::scripted_context;
    use super::*;
    use crate::config::{BtrfsConfig, LoopDeviceConfig};
    use camino::Utf8PathBuf;

    fn state_partition(root: &Utf8Path) -> Partition {
        Partition {
            name: "COS_STATE".to_string(),
            device: "/dev/sda2".into(),
            mount_point: root.join("state"),
            filesystem: "ext4".to_string(),
            flags: Vec::new(),
        }
    }

    #[test]
    fn test_factory_selects_backend() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        let (_runner, _mounter, ctx) = scripted_context(&root, Mode::Installer);
        let state = state_partition(&root);
        let cfg = SnapshotterConfig {
            max_snaps: 4,
            backend: BackendConfig::LoopDevice(LoopDeviceConfig::default()),
        };
        let s = new_snapshotter(&ctx, &cfg, &state, &root.join("efi")).unwrap();
        assert!(format!("{s:?}").contains("LoopDeviceSnapshotter"));
        let cfg = SnapshotterConfig {
            max_snaps: 4,
            backend: BackendConfig::Btrfs(BtrfsConfig { snapper: false }),
        };
        let s = new_snapshotter(&ctx, &cfg, &state, &root.join("efi")).unwrap();
        assert!(format!("{s:?}").contains("BtrfsSnapshotter"));
    }

    #[test]
    fn test_scoped_mount_unmounts_on_drop() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        let (_runner, mounter, ctx) = scripted_context(&root, Mode::Installer);
        let target = root.join("mnt");
        ctx.mounter.mount("/dev/sda2", &target, "", &[]).unwrap();
        assert!(mounter.is_mounted(&target));
        {
            let _guard = ScopedMount::new(ctx.mounter.clone(), target.clone());
        }
        assert!(!mounter.is_mounted(&target));
    }
}
