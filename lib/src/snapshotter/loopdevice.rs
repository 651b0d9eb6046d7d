//! Snapshotter over loop mounted image files.
//!
//! Layout on the state partition:
//!
//! ```text
//! <root>/.snapshots/
//!    active                   -> <id>/snapshot.img
//!    passives/
//!      passive_<id>           -> ../<id>/snapshot.img
//!    <id>/snapshot.img
//!    <id>/snapshot.workDir    (only while a transaction is open)
//! ```
//!
//! The `active` symlink is the boot target; swinging it is the
//! linearization point of a transaction. Pre-snapshot installations keep
//! their root images under `cOS/` and are migrated in place through a
//! hard link, so the running system stays valid throughout.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;

use super::{Snapshotter, SnapshotterContext};
use crate::bootloader;
use crate::config::LoopDeviceConfig;
use crate::error::SnapshotterError;
use crate::image::create_image_from_tree;
use crate::loopdev;
use crate::mode::Mode;
use crate::mount::inspect_filesystem;
use crate::snapshot::{ImageSource, Partition, Snapshot, SnapshotId, NO_SNAPSHOT, SNAPSHOTS_DIR};

const ACTIVE_LINK: &str = "active";
const PASSIVES_DIR: &str = "passives";
const SNAPSHOT_IMG: &str = "snapshot.img";
const SNAPSHOT_WORK_DIR: &str = "snapshot.workDir";
const LEGACY_DIR: &str = "cOS";
const LEGACY_ACTIVE_IMG: &str = "active.img";
const LEGACY_PASSIVE_IMG: &str = "passive.img";
const LABEL_PREFIX: &str = "EL_SNAP";

/// Symlink hops tolerated when resolving `active`; more means a cycle.
const MAX_LINK_DEPTH: usize = 4;

fn link_target_id(target: &str) -> Option<SnapshotId> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^(\d+)/snapshot\.img$").unwrap());
    re.captures(target).and_then(|c| c[1].parse().ok())
}

fn passive_link_id(name: &str) -> Option<SnapshotId> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^passive_(\d+)$").unwrap());
    re.captures(name).and_then(|c| c[1].parse().ok())
}

fn backing_file_id(path: &str) -> Option<SnapshotId> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\.snapshots/(\d+)/snapshot\.img$").unwrap());
    re.captures(path).and_then(|c| c[1].parse().ok())
}

#[derive(Debug)]
pub(crate) struct LoopDeviceSnapshotter {
    ctx: SnapshotterContext,
    cfg: LoopDeviceConfig,
    max_snaps: usize,
    state: Partition,
    efi_dir: Utf8PathBuf,
    initialized: bool,
    /// A legacy layout was found during init and wants cleaning after the
    /// next committed transaction.
    legacy_clean: bool,
    active_id: SnapshotId,
    current_id: SnapshotId,
    in_progress: Option<SnapshotId>,
}

impl LoopDeviceSnapshotter {
    pub(crate) fn new(
        ctx: SnapshotterContext,
        cfg: LoopDeviceConfig,
        max_snaps: usize,
        state: Partition,
        efi_dir: Utf8PathBuf,
    ) -> Self {
        Self {
            ctx,
            cfg,
            max_snaps,
            state,
            efi_dir,
            initialized: false,
            legacy_clean: false,
            active_id: 0,
            current_id: 0,
            in_progress: None,
        }
    }

    fn snapshots_root(&self) -> Utf8PathBuf {
        self.state.mount_point.join(SNAPSHOTS_DIR)
    }

    fn snapshot_dir(&self, id: SnapshotId) -> Utf8PathBuf {
        self.snapshots_root().join(id.to_string())
    }

    fn image_path(&self, id: SnapshotId) -> Utf8PathBuf {
        self.snapshot_dir(id).join(SNAPSHOT_IMG)
    }

    fn read_ids(&self) -> Result<Vec<SnapshotId>> {
        let root = self.snapshots_root();
        let mut ids: Vec<SnapshotId> = self
            .ctx
            .fs
            .read_dir_names(&root)
            .with_context(|| format!("Reading {root}"))?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Snapshot ids backing an attached loop device right now.
    fn in_use_ids(&self) -> Result<Vec<SnapshotId>> {
        Ok(loopdev::backing_files(self.ctx.runner.as_ref())?
            .iter()
            .filter_map(|f| backing_file_id(f))
            .collect())
    }

    /// Resolve the `active` symlink chain to a snapshot id. A missing or
    /// unreadable link is simply "no active snapshot"; a chain deeper
    /// than [`MAX_LINK_DEPTH`] is a cycle and an error.
    fn active_from_link(&self) -> Result<SnapshotId> {
        let root = self.snapshots_root();
        let mut link = root.join(ACTIVE_LINK);
        for _ in 0..MAX_LINK_DEPTH {
            let target = match self.ctx.fs.read_link(&link) {
                Ok(t) => t,
                Err(_) => return Ok(0),
            };
            if let Some(id) = link_target_id(target.as_str()) {
                return Ok(id);
            }
            link = root.join(target);
        }
        Err(SnapshotterError::InvariantViolation(format!(
            "active symlink chain exceeds {MAX_LINK_DEPTH} hops"
        ))
        .into())
    }

    fn refresh_state(&mut self) -> Result<()> {
        let in_use = self.in_use_ids()?;
        self.current_id = in_use.iter().max().copied().unwrap_or(0);
        let linked = self.active_from_link()?;
        self.active_id = if linked != 0 { linked } else { self.current_id };
        Ok(())
    }

    #[context("Migrating legacy layout")]
    fn migrate_legacy(&mut self) -> Result<()> {
        if !self.read_ids()?.is_empty() {
            tracing::debug!("Snapshots already present, skipping migration");
            return Ok(());
        }
        let legacy = self.state.mount_point.join(LEGACY_DIR);
        let source = if self.ctx.mode == Mode::Passive {
            legacy.join(LEGACY_PASSIVE_IMG)
        } else {
            legacy.join(LEGACY_ACTIVE_IMG)
        };
        if !self.ctx.fs.exists(&source) {
            return Err(anyhow!("legacy image {source} not found"));
        }
        let dir = self.snapshot_dir(1);
        self.ctx.fs.create_dir_all(&dir)?;
        // A hard link preserves the inode, so the boot entry still
        // pointing at the legacy path stays valid until the next commit.
        self.ctx
            .fs
            .hard_link(&source, &self.image_path(1))
            .with_context(|| format!("Linking {source}"))?;
        self.set_active_link(1)?;
        Ok(())
    }

    fn set_active_link(&self, id: SnapshotId) -> Result<()> {
        let link = self.snapshots_root().join(ACTIVE_LINK);
        if self.ctx.fs.exists(&link) {
            self.ctx.fs.remove_file(&link)?;
        }
        self.ctx
            .fs
            .symlink(Utf8Path::new(&format!("{id}/{SNAPSHOT_IMG}")), &link)
            .with_context(|| format!("Linking {link}"))?;
        Ok(())
    }

    /// The part of CloseTransaction that can still fail the transaction.
    fn commit_inner(&self, snapshot: &Snapshot, previous_active: SnapshotId) -> Result<()> {
        self.ctx.mounter.unmount(&snapshot.mount_point)?;
        create_image_from_tree(
            self.ctx.runner.as_ref(),
            self.ctx.mounter.as_ref(),
            self.ctx.fs.as_ref(),
            &snapshot.path,
            &snapshot.work_dir,
            &self.cfg.fs,
            snapshot.label.as_deref().unwrap_or_default(),
            self.cfg.size,
        )?;
        self.ctx
            .fs
            .remove_dir_all(&snapshot.work_dir)
            .with_context(|| format!("Removing {}", snapshot.work_dir))?;
        // Linearization point: swing the boot target
        if let Err(e) = self.set_active_link(snapshot.id) {
            if previous_active > 0 {
                if let Err(restore) = self.set_active_link(previous_active) {
                    tracing::warn!("Failed to restore active link: {restore:#}");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn remove_snapshot_files(&self, id: SnapshotId) -> Result<()> {
        let link = self
            .snapshots_root()
            .join(PASSIVES_DIR)
            .join(format!("passive_{id}"));
        if self.ctx.fs.exists(&link) {
            self.ctx.fs.remove_file(&link)?;
        }
        let dir = self.snapshot_dir(id);
        self.ctx
            .fs
            .remove_dir_all(&dir)
            .with_context(|| format!("Removing {dir}"))?;
        Ok(())
    }

    /// Evict the oldest passives while the snapshot count exceeds the
    /// cap (which counts the active image as one slot). Stops quietly
    /// when the next victim is the snapshot we are running from.
    #[context("Cleaning up old snapshots")]
    fn cleanup_snapshots(&self) -> Result<()> {
        let mut passives: Vec<SnapshotId> = self
            .read_ids()?
            .into_iter()
            .filter(|id| *id != self.active_id)
            .collect();
        while passives.len() > self.max_snaps.saturating_sub(1) {
            let victim = passives[0];
            if victim == self.current_id {
                break;
            }
            self.remove_snapshot_files(victim)?;
            passives.remove(0);
        }
        Ok(())
    }

    /// Recreate the `passives/` link farm for the current id set.
    #[context("Refreshing passive links")]
    fn refresh_passive_links(&self) -> Result<()> {
        let pdir = self.snapshots_root().join(PASSIVES_DIR);
        self.ctx.fs.create_dir_all(&pdir)?;
        let ids = self.read_ids()?;
        for name in self.ctx.fs.read_dir_names(&pdir)? {
            if let Some(id) = passive_link_id(&name) {
                if id == self.active_id || !ids.contains(&id) {
                    self.ctx.fs.remove_file(&pdir.join(&name))?;
                }
            }
        }
        for id in ids.iter().filter(|id| **id != self.active_id) {
            let link = pdir.join(format!("passive_{id}"));
            if !self.ctx.fs.exists(&link) {
                self.ctx
                    .fs
                    .symlink(Utf8Path::new(&format!("../{id}/{SNAPSHOT_IMG}")), &link)?;
            }
        }
        Ok(())
    }

    /// Passive ids as the boot menu should list them: newest first, only
    /// entries whose image actually exists.
    fn passive_ids_newest_first(&self) -> Result<Vec<SnapshotId>> {
        let pdir = self.snapshots_root().join(PASSIVES_DIR);
        let mut ids: Vec<SnapshotId> = self
            .ctx
            .fs
            .read_dir_names(&pdir)?
            .iter()
            .filter_map(|name| passive_link_id(name))
            .filter(|id| self.ctx.fs.exists(&self.image_path(*id)))
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    #[context("Updating boot environment")]
    fn update_bootloader(&self) -> Result<()> {
        let passives = self.passive_ids_newest_first()?;
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
        bootloader::set_persistent_variables(
            self.ctx.fs.as_ref(),
            &self.efi_dir.join(bootloader::GRUB_ENV_FILE),
            &vars,
        )
    }

    /// After a committed transaction on a migrated system, retire the
    /// legacy images we no longer boot from. The image the running
    /// system still executes from is kept.
    #[context("Cleaning up legacy layout")]
    fn cleanup_legacy(&mut self) -> Result<()> {
        let legacy = self.state.mount_point.join(LEGACY_DIR);
        if !self.ctx.fs.exists(&legacy) {
            self.legacy_clean = false;
            return Ok(());
        }
        let obsolete = if self.ctx.mode == Mode::Passive {
            legacy.join(LEGACY_ACTIVE_IMG)
        } else {
            legacy.join(LEGACY_PASSIVE_IMG)
        };
        if self.ctx.fs.exists(&obsolete) {
            self.ctx.fs.remove_file(&obsolete)?;
        }
        if self.current_id > 0 || self.ctx.mode == Mode::Recovery {
            self.ctx.fs.remove_dir_all(&legacy)?;
        }
        self.legacy_clean = false;
        Ok(())
    }
}

impl Snapshotter for LoopDeviceSnapshotter {
    #[context("Initializing loop device snapshotter")]
    fn init(&mut self) -> Result<()> {
        let state_mount = self.state.mount_point.clone();
        let legacy = state_mount.join(LEGACY_DIR);
        self.legacy_clean = self.ctx.fs.exists(&legacy.join(LEGACY_ACTIVE_IMG))
            || self.ctx.fs.exists(&legacy.join(LEGACY_PASSIVE_IMG));
        match inspect_filesystem(self.ctx.runner.as_ref(), &state_mount) {
            Ok(m) if m.is_read_only() => {
                tracing::debug!("Remounting {} ({}) read-write", m.source, m.fstype);
                self.ctx.mounter.mount(
                    self.state.device.as_str(),
                    &state_mount,
                    "",
                    &["remount,rw"],
                )?;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Could not inspect {state_mount}: {e:#}"),
        }
        let root = self.snapshots_root();
        self.ctx
            .fs
            .create_dir_all(&root)
            .with_context(|| format!("Creating {root}"))?;
        self.ctx.fs.create_dir_all(&root.join(PASSIVES_DIR))?;
        if self.legacy_clean {
            self.migrate_legacy()?;
        }
        self.initialized = true;
        self.refresh_state()?;
        Ok(())
    }

    #[context("Starting transaction")]
    fn start_transaction(&mut self) -> Result<Snapshot> {
        if !self.initialized {
            return Err(SnapshotterError::Uninitialized.into());
        }
        if self.in_progress.is_some() {
            return Err(anyhow!("a transaction is already in progress"));
        }
        self.refresh_state()?;
        let next = self.read_ids()?.last().copied().unwrap_or(0) + 1;
        let dir = self.snapshot_dir(next);
        let work_dir = dir.join(SNAPSHOT_WORK_DIR);
        let target = self.ctx.working_tree_dir();
        let r = (|| -> Result<()> {
            self.ctx.fs.create_dir_all(&work_dir)?;
            self.ctx.fs.create_dir_all(&target)?;
            self.ctx
                .mounter
                .mount(work_dir.as_str(), &target, "", &["bind"])?;
            Ok(())
        })();
        if let Err(e) = r {
            // Leave no artifacts behind
            let _ = self.ctx.fs.remove_dir_all(&dir);
            return Err(e);
        }
        let snapshot = Snapshot {
            id: next,
            path: self.image_path(next),
            work_dir,
            mount_point: target,
            label: Some(format!("{LABEL_PREFIX}{next}")),
            in_progress: true,
        };
        self.in_progress = Some(next);
        Ok(snapshot)
    }

    fn close_transaction(&mut self, snapshot: &Snapshot) -> Result<()> {
        if !snapshot.in_progress || self.in_progress != Some(snapshot.id) {
            return Err(SnapshotterError::NotInProgress.into());
        }
        if let Err(e) = self.commit_inner(snapshot, self.active_id) {
            if let Err(abort) = self.close_transaction_on_error(snapshot) {
                tracing::warn!("Failed to abort transaction: {abort:#}");
            }
            return Err(e);
        }
        self.active_id = snapshot.id;
        self.in_progress = None;
        // The boot target switched; from here on failures only warn.
        if let Err(e) = self.cleanup_snapshots() {
            tracing::warn!("Failed to clean up old snapshots: {e:#}");
        }
        if let Err(e) = self.refresh_passive_links() {
            tracing::warn!("Failed to refresh passive links: {e:#}");
        }
        if let Err(e) = self.update_bootloader() {
            tracing::warn!("Failed to update boot environment: {e:#}");
        }
        if self.legacy_clean {
            if let Err(e) = self.cleanup_legacy() {
                tracing::warn!("Failed to clean up legacy layout: {e:#}");
            }
        }
        Ok(())
    }

    fn close_transaction_on_error(&mut self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.in_progress && self.in_progress == Some(snapshot.id) {
            if let Err(e) = self.ctx.mounter.unmount(&snapshot.mount_point) {
                tracing::warn!("Failed to unmount {}: {e:#}", snapshot.mount_point);
            }
            let dir = self.snapshot_dir(snapshot.id);
            if self.ctx.fs.exists(&dir) {
                self.ctx
                    .fs
                    .remove_dir_all(&dir)
                    .with_context(|| format!("Removing {dir}"))?;
            }
            self.in_progress = None;
        }
        Ok(())
    }

    fn get_snapshots(&self) -> Result<Vec<SnapshotId>> {
        if !self.initialized {
            return Err(SnapshotterError::SnapshotsUnavailable.into());
        }
        self.read_ids()
    }

    #[context("Deleting snapshot {id}")]
    fn delete_snapshot(&mut self, id: SnapshotId) -> Result<()> {
        if !self.initialized {
            return Err(SnapshotterError::Uninitialized.into());
        }
        if id != NO_SNAPSHOT && (id == self.current_id || self.in_use_ids()?.contains(&id)) {
            return Err(SnapshotterError::InUse.into());
        }
        if !self.read_ids()?.contains(&id) {
            tracing::debug!("Snapshot {id} not found, nothing to delete");
            return Ok(());
        }
        self.remove_snapshot_files(id)
    }

    fn snapshot_to_image_source(&self, snapshot: &Snapshot) -> Result<ImageSource> {
        if !self.ctx.fs.exists(&snapshot.path) {
            return Err(SnapshotterError::MissingSnapshotPath(snapshot.path.clone()).into());
        }
        Ok(ImageSource::File(snapshot.path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::testing::scripted_context;
    use super::*;
    use crate::bootloader::read_persistent_variables;
    use crate::mount::testing::FakeMounter;
    use crate::runner::testing::ScriptedRunner;
    use crate::vfs::{Filesystem, HostFs};

    struct Harness {
        _td: tempfile::TempDir,
        root: Utf8PathBuf,
        state_mount: Utf8PathBuf,
        runner: Arc<ScriptedRunner>,
        mounter: Arc<FakeMounter>,
        snapshotter: LoopDeviceSnapshotter,
    }

    fn harness(mode: Mode, max_snaps: usize) -> Harness {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        let (runner, mounter, ctx) = scripted_context(&root, mode);
        // losetup reports nothing unless a test scripts otherwise
        runner.on("losetup -ln --output BACK-FILE", "");
        runner.on(
            "findmnt -J",
            r#"{"filesystems": [{"source": "/dev/sda2", "fstype": "ext4", "options": "rw,relatime"}]}"#,
        );
        let state_mount = root.join("state");
        std::fs::create_dir_all(&state_mount).unwrap();
        std::fs::create_dir_all(root.join("efi")).unwrap();
        let state = Partition {
            name: "COS_STATE".to_string(),
            device: "/dev/sda2".into(),
            mount_point: state_mount.clone(),
            filesystem: "ext4".to_string(),
            flags: Vec::new(),
        };
        let snapshotter = LoopDeviceSnapshotter::new(
            ctx,
            LoopDeviceConfig::default(),
            max_snaps,
            state.clone(),
            root.join("efi"),
        );
        Harness {
            _td: td,
            root,
            state_mount,
            runner,
            mounter,
            snapshotter,
        }
    }

    fn read_env(h: &Harness) -> std::collections::BTreeMap<String, String> {
        read_persistent_variables(&HostFs, &h.root.join("efi").join("grub_oem_env")).unwrap()
    }

    /// Seed a committed snapshot: numbered dir with an image file.
    fn seed_snapshot(h: &Harness, id: SnapshotId) {
        let dir = h.state_mount.join(format!(".snapshots/{id}"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("snapshot.img"), b"image").unwrap();
    }

    #[test]
    fn test_fresh_install() {
        let mut h = harness(Mode::Installer, 4);
        h.runner.on("du -sm", "100\t/tree\n");
        h.runner.on("losetup --show -f", "/dev/loop0\n");
        h.snapshotter.init().unwrap();
        assert_eq!(h.snapshotter.get_snapshots().unwrap(), Vec::<u64>::new());

        let snap = h.snapshotter.start_transaction().unwrap();
        assert_eq!(snap.id, 1);
        assert_eq!(snap.label.as_deref(), Some("EL_SNAP1"));
        assert_eq!(snap.path, h.state_mount.join(".snapshots/1/snapshot.img"));
        assert!(snap.work_dir.is_dir());
        assert!(h.mounter.is_mounted(&snap.mount_point));

        h.snapshotter.close_transaction(&snap).unwrap();
        assert!(snap.path.is_file());
        assert!(!snap.work_dir.exists());
        let fs = HostFs;
        assert_eq!(
            fs.read_link(&h.state_mount.join(".snapshots/active"))
                .unwrap(),
            Utf8Path::new("1/snapshot.img")
        );
        assert!(h
            .runner
            .calls()
            .iter()
            .any(|c| c.starts_with(&format!("mkfs.ext4 -F -L EL_SNAP1 {}", snap.path))));
        let env = read_env(&h);
        assert_eq!(env["passive_snaps"], "");
        assert_eq!(env["fallback_entries"], "0 1");
        assert_eq!(h.snapshotter.get_snapshots().unwrap(), vec![1]);
    }

    #[test]
    fn test_upgrade_evicts_down_to_cap() {
        let mut h = harness(Mode::Active, 2);
        for id in 1..=5 {
            seed_snapshot(&h, id);
        }
        let fs = HostFs;
        fs.symlink(
            "5/snapshot.img".into(),
            &h.state_mount.join(".snapshots/active"),
        )
        .unwrap();
        // Booted from snapshot 5
        h.runner.on(
            "losetup -ln --output BACK-FILE",
            &format!("{}/.snapshots/5/snapshot.img\n", h.state_mount),
        );
        h.runner.on("du -sm", "100\t/tree\n");
        h.runner.on("losetup --show -f", "/dev/loop0\n");
        h.snapshotter.init().unwrap();
        assert_eq!(h.snapshotter.active_id, 5);
        assert_eq!(h.snapshotter.current_id, 5);

        let snap = h.snapshotter.start_transaction().unwrap();
        assert_eq!(snap.id, 6);
        h.snapshotter.close_transaction(&snap).unwrap();

        // Only the booted snapshot survives next to the new active
        assert_eq!(h.snapshotter.get_snapshots().unwrap(), vec![5, 6]);
        assert_eq!(
            fs.read_link(&h.state_mount.join(".snapshots/active"))
                .unwrap(),
            Utf8Path::new("6/snapshot.img")
        );
        assert_eq!(
            fs.read_link(&h.state_mount.join(".snapshots/passives/passive_5"))
                .unwrap(),
            Utf8Path::new("../5/snapshot.img")
        );
        let env = read_env(&h);
        assert_eq!(env["passive_snaps"], "5");
        assert_eq!(env["fallback_entries"], "0 1 2");
    }

    #[test]
    fn test_legacy_migration_active_mode() {
        let mut h = harness(Mode::Active, 4);
        let legacy = h.state_mount.join("cOS");
        std::fs::create_dir_all(&legacy).unwrap();
        std::fs::write(legacy.join("active.img"), b"legacy active").unwrap();
        std::fs::write(legacy.join("passive.img"), b"legacy passive").unwrap();
        h.runner.on("du -sm", "100\t/tree\n");
        h.runner.on("losetup --show -f", "/dev/loop0\n");

        h.snapshotter.init().unwrap();
        let migrated = h.state_mount.join(".snapshots/1/snapshot.img");
        assert!(migrated.is_file());
        // Hard link: same inode as the image the system still runs from
        let ino = |p: &Utf8Path| {
            use std::os::unix::fs::MetadataExt;
            std::fs::metadata(p).unwrap().ino()
        };
        assert_eq!(ino(&migrated), ino(&legacy.join("active.img")));
        assert_eq!(h.snapshotter.active_id, 1);

        // Re-running init performs no second migration
        h.snapshotter.init().unwrap();
        assert_eq!(h.snapshotter.get_snapshots().unwrap(), vec![1]);

        let snap = h.snapshotter.start_transaction().unwrap();
        assert_eq!(snap.id, 2);
        h.snapshotter.close_transaction(&snap).unwrap();

        // Active mode retires the passive legacy image, but the image we
        // are executing from stays until the directory is collected
        assert!(!legacy.join("passive.img").exists());
        assert!(legacy.join("active.img").exists());
        assert_eq!(h.snapshotter.get_snapshots().unwrap(), vec![1, 2]);
        let env = read_env(&h);
        assert_eq!(env["passive_snaps"], "1");
        assert_eq!(env["fallback_entries"], "0 1 2");
    }

    #[test]
    fn test_legacy_directory_collected_when_booted_from_snapshot() {
        let mut h = harness(Mode::Active, 4);
        let legacy = h.state_mount.join("cOS");
        std::fs::create_dir_all(&legacy).unwrap();
        std::fs::write(legacy.join("active.img"), b"legacy").unwrap();
        seed_snapshot(&h, 1);
        let fs = HostFs;
        fs.symlink(
            "1/snapshot.img".into(),
            &h.state_mount.join(".snapshots/active"),
        )
        .unwrap();
        // Already booted from snapshot 1, so nothing references cOS/
        h.runner.on(
            "losetup -ln --output BACK-FILE",
            &format!("{}/.snapshots/1/snapshot.img\n", h.state_mount),
        );
        h.runner.on("du -sm", "100\t/tree\n");
        h.runner.on("losetup --show -f", "/dev/loop0\n");
        h.snapshotter.init().unwrap();
        let snap = h.snapshotter.start_transaction().unwrap();
        h.snapshotter.close_transaction(&snap).unwrap();
        assert!(!legacy.exists());
    }

    #[test]
    fn test_close_on_error_restores_previous_state() {
        let mut h = harness(Mode::Installer, 4);
        seed_snapshot(&h, 3);
        let fs = HostFs;
        fs.symlink(
            "3/snapshot.img".into(),
            &h.state_mount.join(".snapshots/active"),
        )
        .unwrap();
        h.snapshotter.init().unwrap();
        let snap = h.snapshotter.start_transaction().unwrap();
        assert_eq!(snap.id, 4);
        h.snapshotter.close_transaction_on_error(&snap).unwrap();
        assert_eq!(h.snapshotter.get_snapshots().unwrap(), vec![3]);
        assert_eq!(h.snapshotter.active_id, 3);
        assert!(!h.mounter.is_mounted(&snap.mount_point));
        assert!(h.snapshotter.in_progress.is_none());
    }

    #[test]
    fn test_failed_image_build_aborts_cleanly() {
        let mut h = harness(Mode::Installer, 4);
        h.runner.on("du -sm", "100\t/tree\n");
        h.runner.on("losetup --show -f", "/dev/loop0\n");
        h.runner.on_code("mkfs.ext4", "mkfs.ext4: No space left", 1);
        h.snapshotter.init().unwrap();
        let snap = h.snapshotter.start_transaction().unwrap();
        let err = h.snapshotter.close_transaction(&snap).unwrap_err();
        assert!(format!("{err:#}").contains("mkfs.ext4 failed"));
        // No half-built snapshot and no active link
        assert_eq!(h.snapshotter.get_snapshots().unwrap(), Vec::<u64>::new());
        assert!(!HostFs.exists(&h.state_mount.join(".snapshots/active")));
    }

    #[test]
    fn test_delete_snapshot_idempotent_and_guarded() {
        let mut h = harness(Mode::Active, 4);
        seed_snapshot(&h, 2);
        seed_snapshot(&h, 5);
        h.runner.on(
            "losetup -ln --output BACK-FILE",
            &format!("{}/.snapshots/5/snapshot.img\n", h.state_mount),
        );
        h.snapshotter.init().unwrap();
        // Deleting a non-existent id succeeds without touching anything
        h.snapshotter.delete_snapshot(42).unwrap();
        h.snapshotter.delete_snapshot(42).unwrap();
        // The booted snapshot is protected
        let err = h.snapshotter.delete_snapshot(5).unwrap_err();
        assert_eq!(
            err.root_cause().to_string(),
            "cannot delete a snapshot that is currently in use"
        );
        h.snapshotter.delete_snapshot(2).unwrap();
        assert_eq!(h.snapshotter.get_snapshots().unwrap(), vec![5]);
    }

    #[test]
    fn test_active_link_cycle_detected() {
        let mut h = harness(Mode::Installer, 4);
        h.snapshotter.init().unwrap();
        let fs = HostFs;
        let root = h.state_mount.join(".snapshots");
        fs.symlink("loop_b".into(), &root.join("active")).unwrap();
        fs.symlink("loop_a".into(), &root.join("loop_b")).unwrap();
        fs.symlink("loop_b".into(), &root.join("loop_a")).unwrap();
        let err = h.snapshotter.start_transaction().unwrap_err();
        assert!(format!("{err:#}").contains("symlink chain"));
    }

    #[test]
    fn test_snapshot_to_image_source_is_file() {
        let mut h = harness(Mode::Installer, 4);
        seed_snapshot(&h, 1);
        h.snapshotter.init().unwrap();
        let snap = Snapshot {
            id: 1,
            path: h.state_mount.join(".snapshots/1/snapshot.img"),
            work_dir: h.state_mount.join(".snapshots/1/snapshot.workDir"),
            mount_point: Default::default(),
            label: Some("EL_SNAP1".to_string()),
            in_progress: false,
        };
        assert_eq!(
            h.snapshotter.snapshot_to_image_source(&snap).unwrap(),
            ImageSource::File(snap.path.clone())
        );
    }
}
