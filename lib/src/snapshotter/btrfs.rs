//! Snapshotter over btrfs subvolumes.
//!
//! The state partition carries a fixed shape: top subvolume `@`,
//! snapshots under `@/.snapshots/<id>/snapshot`, and the default
//! subvolume marks the next boot target. The heavy lifting on disk is
//! delegated to a [`SubvolumeBackend`].

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use super::{ScopedMount, Snapshotter, SnapshotterContext};
use crate::backend::{BtrfsBackend, SnapperBackend, SubvolumeBackend};
use crate::bootloader;
use crate::config::BtrfsConfig;
use crate::error::SnapshotterError;
use crate::selinux;
use crate::snapshot::{
    ImageSource, Partition, Snapshot, SnapshotId, NO_SNAPSHOT, SNAPSHOTS_DIR,
};
use crate::sync::sync_tree;

const TOP_SUBVOL_OPT: &str = "subvol=@";
const SNAPSHOTS_SUBVOL_OPT: &str = "subvol=@/.snapshots";

#[derive(Debug)]
pub(crate) struct BtrfsSnapshotter {
    ctx: SnapshotterContext,
    max_snaps: usize,
    state: Partition,
    efi_dir: Utf8PathBuf,
    backend: Box<dyn SubvolumeBackend>,
    /// Root under which `.snapshots/` is addressed; set by init.
    root_dir: Option<Utf8PathBuf>,
    active_id: SnapshotId,
    current_id: SnapshotId,
    /// Where init mounted the snapshots subvolume, if it did; unmounted
    /// again when the transaction closes.
    snapshots_mount: Option<Utf8PathBuf>,
    in_progress: Option<SnapshotId>,
}

impl BtrfsSnapshotter {
    pub(crate) fn new(
        ctx: SnapshotterContext,
        cfg: &BtrfsConfig,
        max_snaps: usize,
        state: Partition,
        efi_dir: Utf8PathBuf,
    ) -> Self {
        let backend: Box<dyn SubvolumeBackend> = if cfg.snapper {
            Box::new(SnapperBackend::new(
                ctx.runner.clone(),
                ctx.fs.clone(),
                ctx.mode,
            ))
        } else {
            Box::new(BtrfsBackend::new(
                ctx.runner.clone(),
                ctx.fs.clone(),
                ctx.mode,
            ))
        };
        Self {
            ctx,
            max_snaps,
            state,
            efi_dir,
            backend,
            root_dir: None,
            active_id: 0,
            current_id: 0,
            snapshots_mount: None,
            in_progress: None,
        }
    }

    fn root_dir(&self) -> Result<&Utf8Path> {
        self.root_dir
            .as_deref()
            .ok_or_else(|| SnapshotterError::Uninitialized.into())
    }

    /// Steps of CloseTransaction that may still be rolled back by
    /// deleting the new snapshot.
    fn commit_inner(&mut self, root: &Utf8Path, snapshot: &Snapshot) -> Result<()> {
        // The mountpoint of the snapshots subvolume must survive inside
        // the committed image.
        let snaps_stub = snapshot.work_dir.join(SNAPSHOTS_DIR);
        self.ctx
            .fs
            .create_dir_all(&snaps_stub)
            .with_context(|| format!("Creating {snaps_stub}"))?;
        self.ctx.mounter.unmount(&snapshot.mount_point)?;
        if snapshot.id > 1 {
            // The first snapshot is populated in place; later ones are
            // mirrored from their work tree into the subvolume.
            sync_tree(self.ctx.runner.as_ref(), &snapshot.work_dir, &snapshot.path)?;
            self.ctx
                .fs
                .remove_dir_all(&snapshot.work_dir)
                .with_context(|| format!("Removing {}", snapshot.work_dir))?;
        }
        selinux::relabel_tree(
            self.ctx.runner.as_ref(),
            self.ctx.mounter.as_ref(),
            self.ctx.fs.as_ref(),
            &snapshot.path,
            &root.join(SNAPSHOTS_DIR),
        )?;
        self.backend.commit_snapshot(root, snapshot)?;
        Ok(())
    }

    #[context("Updating boot environment")]
    fn update_bootloader(&self, root: &Utf8Path) -> Result<()> {
        let list = self.backend.list_snapshots(root)?;
        let mut passives: Vec<SnapshotId> = list
            .ids
            .iter()
            .copied()
            .filter(|id| *id != list.active_id)
            .collect();
        passives.sort_unstable_by(|a, b| b.cmp(a));
        let passive_snaps = passives
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let fallback_entries = (0..=passives.len() + 1)
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let mut vars = BTreeMap::new();
        vars.insert(bootloader::PASSIVE_SNAPS_KEY.to_string(), passive_snaps);
        vars.insert(bootloader::FALLBACK_ENTRIES_KEY.to_string(), fallback_entries);
        vars.insert("snapshotter".to_string(), "btrfs".to_string());
        bootloader::set_persistent_variables(
            self.ctx.fs.as_ref(),
            &self.efi_dir.join(bootloader::GRUB_ENV_FILE),
            &vars,
        )
    }

    /// Run the deferred unmount of the snapshots subvolume, if init
    /// mounted it.
    fn unmount_snapshots(&mut self) {
        if let Some(target) = self.snapshots_mount.take() {
            if let Err(e) = self.ctx.mounter.unmount(&target) {
                tracing::warn!("Failed to unmount {target}: {e:#}");
            }
        }
    }
}

impl Snapshotter for BtrfsSnapshotter {
    #[context("Initializing btrfs snapshotter")]
    fn init(&mut self) -> Result<()> {
        let mut stat = self
            .backend
            .probe(&self.state.device, &self.state.mount_point)?;
        if stat.root_dir.is_none() {
            self.backend.init_partition(&self.state.mount_point)?;
            // Freshly laid out, so nothing is active yet
            stat = Default::default();
        }
        if self.ctx.mode.is_booted_from_snapshot() {
            // The probe resolved the real mountpoints already
            let root = stat
                .root_dir
                .ok_or(SnapshotterError::Uninitialized)
                .context("Probe returned no root")?;
            self.root_dir = Some(root);
        } else {
            // Installer or recovery: take over the state mount so the
            // snapshot tree appears the way it will at runtime.
            let mount_point = self.state.mount_point.clone();
            self.ctx.mounter.unmount(&mount_point)?;
            self.ctx.mounter.mount(
                self.state.device.as_str(),
                &mount_point,
                &self.state.filesystem,
                &[TOP_SUBVOL_OPT],
            )?;
            if stat.active_id > 0 {
                let root = mount_point
                    .join(SNAPSHOTS_DIR)
                    .join(stat.active_id.to_string())
                    .join("snapshot");
                let snaps = root.join(SNAPSHOTS_DIR);
                self.ctx.mounter.mount(
                    self.state.device.as_str(),
                    &snaps,
                    &self.state.filesystem,
                    &[SNAPSHOTS_SUBVOL_OPT],
                )?;
                self.snapshots_mount = Some(snaps);
                self.root_dir = Some(root);
            } else {
                self.root_dir = Some(mount_point);
            }
        }
        self.active_id = stat.active_id;
        self.current_id = stat.current_id;
        Ok(())
    }

    #[context("Starting transaction")]
    fn start_transaction(&mut self) -> Result<Snapshot> {
        let root = self.root_dir()?.to_owned();
        if self.in_progress.is_some() {
            return Err(anyhow!("a transaction is already in progress"));
        }
        let mut snapshot = self.backend.create_new_snapshot(&root, self.active_id)?;
        let target = self.ctx.working_tree_dir();
        let r = self
            .ctx
            .fs
            .create_dir_all(&target)
            .map_err(anyhow::Error::from)
            .and_then(|()| {
                self.ctx
                    .mounter
                    .mount(snapshot.work_dir.as_str(), &target, "", &["bind"])
            });
        if let Err(e) = r {
            if let Err(del) = self.backend.delete_snapshot(&root, snapshot.id) {
                tracing::warn!("Failed to delete aborted snapshot {}: {del:#}", snapshot.id);
            }
            return Err(e);
        }
        snapshot.mount_point = target;
        snapshot.in_progress = true;
        self.in_progress = Some(snapshot.id);
        Ok(snapshot)
    }

    fn close_transaction(&mut self, snapshot: &Snapshot) -> Result<()> {
        if !snapshot.in_progress || self.in_progress != Some(snapshot.id) {
            return Err(SnapshotterError::NotInProgress.into());
        }
        let root = self.root_dir()?.to_owned();
        let r = self.commit_inner(&root, snapshot);
        let r = match r {
            Err(e) => {
                if let Err(del) = self.backend.delete_snapshot(&root, snapshot.id) {
                    tracing::warn!("Failed to delete aborted snapshot {}: {del:#}", snapshot.id);
                }
                self.in_progress = None;
                Err(e)
            }
            Ok(()) => {
                self.active_id = snapshot.id;
                self.in_progress = None;
                // The switch happened; nothing below may fail the
                // transaction anymore.
                if let Err(e) = self.update_bootloader(&root) {
                    tracing::warn!("Failed to update boot environment: {e:#}");
                }
                if let Err(e) = self.backend.cleanup(&root, self.max_snaps) {
                    tracing::warn!("Failed to clean up old snapshots: {e:#}");
                }
                Ok(())
            }
        };
        self.unmount_snapshots();
        r
    }

    fn close_transaction_on_error(&mut self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.in_progress && self.in_progress == Some(snapshot.id) {
            if let Err(e) = self.ctx.mounter.unmount(&snapshot.mount_point) {
                tracing::warn!("Failed to unmount {}: {e:#}", snapshot.mount_point);
            }
            let root = self.root_dir()?.to_owned();
            if let Err(e) = self.backend.delete_snapshot(&root, snapshot.id) {
                tracing::warn!("Failed to delete aborted snapshot {}: {e:#}", snapshot.id);
            }
            self.in_progress = None;
        }
        self.unmount_snapshots();
        Ok(())
    }

    fn get_snapshots(&self) -> Result<Vec<SnapshotId>> {
        let root = self
            .root_dir
            .as_deref()
            .ok_or(SnapshotterError::SnapshotsUnavailable)?;
        let snaps_dir = root.join(SNAPSHOTS_DIR);
        let needs_mount = self.active_id > 0
            && self
                .ctx
                .mounter
                .is_likely_not_mountpoint(&snaps_dir)
                .unwrap_or(true);
        let _guard = if needs_mount {
            self.ctx.mounter.mount(
                self.state.device.as_str(),
                &snaps_dir,
                &self.state.filesystem,
                &[SNAPSHOTS_SUBVOL_OPT],
            )?;
            Some(ScopedMount::new(self.ctx.mounter.clone(), snaps_dir))
        } else {
            None
        };
        Ok(self.backend.list_snapshots(root)?.ids)
    }

    #[context("Deleting snapshot {id}")]
    fn delete_snapshot(&mut self, id: SnapshotId) -> Result<()> {
        if id == self.current_id && id != NO_SNAPSHOT {
            return Err(SnapshotterError::InUse.into());
        }
        let root = self.root_dir()?.to_owned();
        if !self.backend.list_snapshots(&root)?.contains(id) {
            tracing::debug!("Snapshot {id} not found, nothing to delete");
            return Ok(());
        }
        self.backend.delete_snapshot(&root, id)
    }

    fn snapshot_to_image_source(&self, snapshot: &Snapshot) -> Result<ImageSource> {
        if !self.ctx.fs.is_dir(&snapshot.path) {
            return Err(SnapshotterError::MissingSnapshotPath(snapshot.path.clone()).into());
        }
        Ok(ImageSource::Dir(snapshot.path.clone()))
    }
}
