//! Raw btrfs backend, driving the `btrfs` CLI directly.
//!
//! Every snapshot carries a snapper-compatible `info.xml` sidecar so a
//! later switch to the snapper backend finds a coherent history.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use super::{
    parse_default_subvolume, parse_subvolume_list, snapshot_dir, snapshot_id_from_path,
    snapshot_path, snapshot_work_dir, SubvolEntry, SubvolumeBackend, SNAPSHOTS_SUBVOL_ID,
    TOP_SUBVOL, TOP_SUBVOL_ID,
};
use crate::error::SnapshotterError;
use crate::mode::Mode;
use crate::mount::{device_mounts, source_subvolume};
use crate::runner::{run_checked, CommandRunner};
use crate::snapshot::{BackendStat, Snapshot, SnapshotId, SnapshotsList, SNAPSHOTS_DIR};
use crate::vfs::Filesystem;

/// Userdata key stamped while the first snapshot is being populated.
pub(crate) const INSTALL_IN_PROGRESS: &str = "install-in-progress";

/// Userdata key stamped while an upgrade snapshot is being populated.
pub(crate) const UPDATE_IN_PROGRESS: &str = "update-in-progress";

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// snapper-compatible snapshot metadata sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "snapshot")]
pub(crate) struct SnapshotInfo {
    #[serde(rename = "type")]
    pub(crate) kind: String,
    pub(crate) num: SnapshotId,
    pub(crate) date: String,
    pub(crate) description: String,
    pub(crate) cleanup: String,
    #[serde(rename = "userdata", default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) userdata: Vec<UserdataEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct UserdataEntry {
    pub(crate) key: String,
    pub(crate) value: String,
}

impl SnapshotInfo {
    fn new(num: SnapshotId, description: String, in_progress_key: &str) -> Self {
        Self {
            kind: "single".to_string(),
            num,
            date: chrono::Local::now().format(DATE_FORMAT).to_string(),
            description,
            cleanup: "number".to_string(),
            userdata: vec![UserdataEntry {
                key: in_progress_key.to_string(),
                value: "yes".to_string(),
            }],
        }
    }

    pub(crate) fn to_xml(&self) -> Result<String> {
        let body = quick_xml::se::to_string(self).context("Serializing snapshot info")?;
        Ok(format!("<?xml version=\"1.0\"?>\n{body}\n"))
    }

    pub(crate) fn from_xml(xml: &str) -> Result<Self> {
        quick_xml::de::from_str(xml).context("Parsing snapshot info")
    }
}

/// Drives subvolume operations with the `btrfs` CLI.
#[derive(Debug)]
pub(crate) struct BtrfsBackend {
    runner: Arc<dyn CommandRunner>,
    fs: Arc<dyn Filesystem>,
    mode: Mode,
    stat: BackendStat,
}

impl BtrfsBackend {
    pub(crate) fn new(
        runner: Arc<dyn CommandRunner>,
        fs: Arc<dyn Filesystem>,
        mode: Mode,
    ) -> Self {
        Self {
            runner,
            fs,
            mode,
            stat: BackendStat::default(),
        }
    }

    pub(super) fn stat(&self) -> &BackendStat {
        &self.stat
    }

    fn subvolume_list(&self, dir: &Utf8Path) -> Result<Vec<SubvolEntry>> {
        let out = run_checked(
            self.runner.as_ref(),
            "btrfs",
            &["subvolume", "list", "--sort=path", dir.as_str()],
        )?;
        Ok(parse_subvolume_list(&out))
    }

    fn get_default(&self, dir: &Utf8Path) -> Result<SnapshotId> {
        let out = run_checked(
            self.runner.as_ref(),
            "btrfs",
            &["subvolume", "get-default", dir.as_str()],
        )?;
        Ok(parse_default_subvolume(&out)
            .and_then(|e| snapshot_id_from_path(&e.path))
            .unwrap_or(0))
    }

    fn info_path(root_dir: &Utf8Path, id: SnapshotId) -> camino::Utf8PathBuf {
        snapshot_dir(root_dir, id).join("info.xml")
    }

    fn write_info(&self, root_dir: &Utf8Path, info: &SnapshotInfo) -> Result<()> {
        let path = Self::info_path(root_dir, info.num);
        self.fs
            .write(&path, info.to_xml()?.as_bytes())
            .with_context(|| format!("Writing {path}"))?;
        Ok(())
    }

    /// Drop the in-progress userdata markers from the sidecar.
    fn clear_in_progress(&self, root_dir: &Utf8Path, id: SnapshotId) -> Result<()> {
        let path = Self::info_path(root_dir, id);
        let mut info = SnapshotInfo::from_xml(
            &self
                .fs
                .read_to_string(&path)
                .with_context(|| format!("Reading {path}"))?,
        )?;
        info.userdata
            .retain(|u| u.key != INSTALL_IN_PROGRESS && u.key != UPDATE_IN_PROGRESS);
        self.fs.write(&path, info.to_xml()?.as_bytes())?;
        Ok(())
    }
}

impl SubvolumeBackend for BtrfsBackend {
    #[context("Probing {device}")]
    fn probe(&mut self, device: &Utf8Path, mountpoint: &Utf8Path) -> Result<BackendStat> {
        let entries = self.subvolume_list(mountpoint)?;
        let top = entries.iter().find(|e| e.path == TOP_SUBVOL);
        let snaps = entries
            .iter()
            .find(|e| e.path == format!("{TOP_SUBVOL}/{SNAPSHOTS_DIR}"));
        let mut stat = BackendStat::default();
        match (top, snaps) {
            (None, _) => {
                // Bare partition, nothing to probe yet
                self.stat = stat.clone();
                return Ok(stat);
            }
            (Some(top), Some(snaps)) => {
                if top.id != TOP_SUBVOL_ID || snaps.id != SNAPSHOTS_SUBVOL_ID {
                    return Err(SnapshotterError::InvariantViolation(format!(
                        "unexpected subvolume ids {}/{} for {TOP_SUBVOL} and {SNAPSHOTS_DIR}",
                        top.id, snaps.id
                    ))
                    .into());
                }
            }
            (Some(_), None) => {
                return Err(SnapshotterError::InvariantViolation(format!(
                    "top subvolume exists but {SNAPSHOTS_DIR} is missing"
                ))
                .into())
            }
        }
        stat.active_id = self.get_default(mountpoint)?;
        stat.root_dir = Some(mountpoint.to_owned());
        stat.state_mount = Some(mountpoint.to_owned());
        if self.mode.is_booted_from_snapshot() {
            // Only one mountpoint per device shows up in a plain probe, so
            // resolve the snapshot mount and the state mount explicitly.
            for (source, target) in device_mounts(self.runner.as_ref(), device)? {
                let Some(subvol) = source_subvolume(&source) else {
                    continue;
                };
                if let Some(id) = snapshot_id_from_path(subvol) {
                    stat.current_id = id;
                    stat.root_dir = Some(target);
                } else if subvol.trim_end_matches('/') == format!("/{TOP_SUBVOL}") {
                    stat.state_mount = Some(target);
                }
            }
            if stat.current_id == 0 {
                return Err(SnapshotterError::InvariantViolation(
                    "booted from a snapshot but no snapshot mount was found".to_string(),
                )
                .into());
            }
        }
        self.stat = stat.clone();
        Ok(stat)
    }

    #[context("Initializing btrfs partition at {root_dir}")]
    fn init_partition(&mut self, root_dir: &Utf8Path) -> Result<()> {
        let runner = self.runner.as_ref();
        run_checked(runner, "btrfs", &["quota", "enable", root_dir.as_str()])?;
        let top = root_dir.join(TOP_SUBVOL);
        run_checked(runner, "btrfs", &["subvolume", "create", top.as_str()])?;
        let snaps = top.join(SNAPSHOTS_DIR);
        run_checked(runner, "btrfs", &["subvolume", "create", snaps.as_str()])?;
        run_checked(runner, "btrfs", &["qgroup", "create", "1/0", root_dir.as_str()])?;
        Ok(())
    }

    #[context("Creating snapshot from base {base_id}")]
    fn create_new_snapshot(
        &mut self,
        root_dir: &Utf8Path,
        base_id: SnapshotId,
    ) -> Result<Snapshot> {
        let id = if base_id == 0 {
            1
        } else {
            self.list_snapshots(root_dir)?
                .ids
                .iter()
                .max()
                .copied()
                .unwrap_or(0)
                + 1
        };
        let dir = snapshot_dir(root_dir, id);
        self.fs
            .create_dir_all(&dir)
            .with_context(|| format!("Creating {dir}"))?;
        let path = snapshot_path(root_dir, id);
        let r = (|| {
            if base_id == 0 {
                run_checked(
                    self.runner.as_ref(),
                    "btrfs",
                    &["subvolume", "create", path.as_str()],
                )?;
                self.write_info(
                    root_dir,
                    &SnapshotInfo::new(id, "first root filesystem".to_string(), INSTALL_IN_PROGRESS),
                )?;
                Ok(Snapshot {
                    id,
                    path: path.clone(),
                    work_dir: path.clone(),
                    mount_point: Default::default(),
                    label: None,
                    in_progress: false,
                })
            } else {
                let base = snapshot_path(root_dir, base_id);
                run_checked(
                    self.runner.as_ref(),
                    "btrfs",
                    &["subvolume", "snapshot", base.as_str(), path.as_str()],
                )?;
                let work_dir = snapshot_work_dir(root_dir, id);
                self.fs.create_dir_all(&work_dir)?;
                self.write_info(
                    root_dir,
                    &SnapshotInfo::new(
                        id,
                        format!("Update for snapshot {base_id}"),
                        UPDATE_IN_PROGRESS,
                    ),
                )?;
                Ok(Snapshot {
                    id,
                    path: path.clone(),
                    work_dir,
                    mount_point: Default::default(),
                    label: None,
                    in_progress: false,
                })
            }
        })();
        if r.is_err() {
            let _ = self.fs.remove_dir_all(&dir);
        }
        r
    }

    #[context("Committing snapshot {}", snapshot.id)]
    fn commit_snapshot(&mut self, root_dir: &Utf8Path, snapshot: &Snapshot) -> Result<()> {
        self.clear_in_progress(root_dir, snapshot.id)?;
        run_checked(
            self.runner.as_ref(),
            "btrfs",
            &["property", "set", snapshot.path.as_str(), "ro", "true"],
        )?;
        let suffix = format!("{SNAPSHOTS_DIR}/{}/snapshot", snapshot.id);
        let subvol = self
            .subvolume_list(root_dir)?
            .into_iter()
            .find(|e| e.path.ends_with(&suffix))
            .ok_or_else(|| {
                SnapshotterError::InvariantViolation(format!(
                    "committed snapshot {} has no subvolume",
                    snapshot.id
                ))
            })?;
        run_checked(
            self.runner.as_ref(),
            "btrfs",
            &[
                "subvolume",
                "set-default",
                &subvol.id.to_string(),
                root_dir.as_str(),
            ],
        )?;
        Ok(())
    }

    fn list_snapshots(&self, root_dir: &Utf8Path) -> Result<SnapshotsList> {
        let mut ids: Vec<SnapshotId> = self
            .subvolume_list(root_dir)?
            .into_iter()
            .filter_map(|e| snapshot_id_from_path(&e.path))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(SnapshotsList {
            ids,
            active_id: self.get_default(root_dir)?,
            current_id: self.stat.current_id,
        })
    }

    #[context("Deleting snapshot {id}")]
    fn delete_snapshot(&mut self, root_dir: &Utf8Path, id: SnapshotId) -> Result<()> {
        if id == 0 {
            return Err(anyhow!("there is no snapshot 0 to delete"));
        }
        if id == self.stat.current_id {
            return Err(SnapshotterError::InUse.into());
        }
        let path = snapshot_path(root_dir, id);
        run_checked(
            self.runner.as_ref(),
            "btrfs",
            &["subvolume", "delete", path.as_str()],
        )?;
        let dir = snapshot_dir(root_dir, id);
        self.fs
            .remove_dir_all(&dir)
            .with_context(|| format!("Removing {dir}"))?;
        Ok(())
    }

    #[context("Cleaning up old snapshots")]
    fn cleanup(&mut self, root_dir: &Utf8Path, max_snapshots: usize) -> Result<()> {
        let list = self.list_snapshots(root_dir)?;
        let mut ids = list.ids;
        while ids.len() > max_snapshots {
            let victim = ids[0];
            if victim == list.current_id || victim == list.active_id {
                break;
            }
            self.delete_snapshot(root_dir, victim)?;
            ids.remove(0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use crate::vfs::HostFs;
    use camino::Utf8PathBuf;
    use indoc::indoc;

    fn harness() -> (Arc<ScriptedRunner>, BtrfsBackend, tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let backend = BtrfsBackend::new(runner.clone(), Arc::new(HostFs), Mode::Installer);
        (runner, backend, td, root)
    }

    #[test]
    fn test_info_xml_roundtrip() {
        let info = SnapshotInfo {
            kind: "single".into(),
            num: 2,
            date: "2006-01-02 15:04:05".into(),
            description: "Update for snapshot 1".into(),
            cleanup: "number".into(),
            userdata: vec![UserdataEntry {
                key: UPDATE_IN_PROGRESS.into(),
                value: "yes".into(),
            }],
        };
        let xml = info.to_xml().unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\"?>"));
        assert!(xml.contains("<type>single</type>"));
        assert!(xml.contains("<date>2006-01-02 15:04:05</date>"));
        assert!(xml.contains("<key>update-in-progress</key>"));
        let back = SnapshotInfo::from_xml(&xml).unwrap();
        similar_asserts::assert_eq!(info, back);
    }

    #[test]
    fn test_probe_bare_partition() {
        let (runner, mut backend, _td, root) = harness();
        runner.on("btrfs subvolume list", "");
        let stat = backend.probe("/dev/sda2".into(), &root).unwrap();
        assert_eq!(stat, BackendStat::default());
    }

    #[test]
    fn test_probe_initialized_installer() {
        let (runner, mut backend, _td, root) = harness();
        runner.on(
            "btrfs subvolume list",
            indoc! {"
                ID 257 gen 10 top level 5 path @
                ID 258 gen 10 top level 257 path @/.snapshots
                ID 259 gen 12 top level 258 path @/.snapshots/1/snapshot
            "},
        );
        runner.on(
            "btrfs subvolume get-default",
            "ID 259 gen 12 top level 258 path @/.snapshots/1/snapshot\n",
        );
        let stat = backend.probe("/dev/sda2".into(), &root).unwrap();
        assert_eq!(stat.active_id, 1);
        assert_eq!(stat.current_id, 0);
        assert_eq!(stat.root_dir.as_deref(), Some(root.as_path()));
    }

    #[test]
    fn test_probe_reshaped_partition_fails() {
        let (runner, mut backend, _td, root) = harness();
        runner.on(
            "btrfs subvolume list",
            indoc! {"
                ID 300 gen 10 top level 5 path @
                ID 301 gen 10 top level 300 path @/.snapshots
            "},
        );
        let err = backend.probe("/dev/sda2".into(), &root).unwrap_err();
        assert!(err
            .root_cause()
            .to_string()
            .contains("unexpected subvolume ids"));
    }

    #[test]
    fn test_probe_active_mode_resolves_mounts() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let mut backend = BtrfsBackend::new(runner.clone(), Arc::new(HostFs), Mode::Active);
        runner.on(
            "btrfs subvolume list",
            indoc! {"
                ID 257 gen 10 top level 5 path @
                ID 258 gen 10 top level 257 path @/.snapshots
                ID 259 gen 12 top level 258 path @/.snapshots/2/snapshot
                ID 263 gen 19 top level 258 path @/.snapshots/3/snapshot
            "},
        );
        runner.on(
            "btrfs subvolume get-default",
            "ID 263 gen 19 top level 258 path @/.snapshots/3/snapshot\n",
        );
        runner.on(
            "findmnt -lno SOURCE,TARGET /dev/sda",
            "/dev/sda[/@/.snapshots/2/snapshot] /some/root\n/dev/sda[/@] /some/root/run/initramfs/elemental-state\n",
        );
        let stat = backend.probe("/dev/sda".into(), &root).unwrap();
        assert_eq!(stat.active_id, 3);
        assert_eq!(stat.current_id, 2);
        assert_eq!(stat.root_dir.as_deref(), Some(Utf8Path::new("/some/root")));
        assert_eq!(
            stat.state_mount.as_deref(),
            Some(Utf8Path::new("/some/root/run/initramfs/elemental-state"))
        );
    }

    #[test]
    fn test_init_partition_command_sequence() {
        let (runner, mut backend, _td, root) = harness();
        backend.init_partition(&root).unwrap();
        let calls = runner.calls();
        assert_eq!(calls[0], format!("btrfs quota enable {root}"));
        assert_eq!(calls[1], format!("btrfs subvolume create {root}/@"));
        assert_eq!(
            calls[2],
            format!("btrfs subvolume create {root}/@/.snapshots")
        );
        assert_eq!(calls[3], format!("btrfs qgroup create 1/0 {root}"));
    }

    #[test]
    fn test_create_first_snapshot() {
        let (runner, mut backend, _td, root) = harness();
        let snap = backend.create_new_snapshot(&root, 0).unwrap();
        assert_eq!(snap.id, 1);
        assert_eq!(snap.path, root.join(".snapshots/1/snapshot"));
        assert_eq!(snap.work_dir, snap.path);
        assert_eq!(
            runner.calls()[0],
            format!("btrfs subvolume create {root}/.snapshots/1/snapshot")
        );
        let info = SnapshotInfo::from_xml(
            &std::fs::read_to_string(root.join(".snapshots/1/info.xml")).unwrap(),
        )
        .unwrap();
        assert_eq!(info.num, 1);
        assert_eq!(info.userdata[0].key, INSTALL_IN_PROGRESS);
    }

    #[test]
    fn test_create_incremental_snapshot() {
        let (runner, mut backend, _td, root) = harness();
        runner.on(
            "btrfs subvolume list",
            indoc! {"
                ID 257 gen 10 top level 5 path @
                ID 258 gen 10 top level 257 path @/.snapshots
                ID 259 gen 12 top level 258 path @/.snapshots/1/snapshot
            "},
        );
        runner.on(
            "btrfs subvolume get-default",
            "ID 259 gen 12 top level 258 path @/.snapshots/1/snapshot\n",
        );
        let snap = backend.create_new_snapshot(&root, 1).unwrap();
        assert_eq!(snap.id, 2);
        assert_eq!(snap.work_dir, root.join(".snapshots/2/snapshot.workDir"));
        assert!(snap.work_dir.is_dir());
        assert!(runner.calls().iter().any(|c| c
            == &format!(
                "btrfs subvolume snapshot {root}/.snapshots/1/snapshot {root}/.snapshots/2/snapshot"
            )));
        let info = SnapshotInfo::from_xml(
            &std::fs::read_to_string(root.join(".snapshots/2/info.xml")).unwrap(),
        )
        .unwrap();
        assert_eq!(info.userdata[0].key, UPDATE_IN_PROGRESS);
        assert_eq!(info.description, "Update for snapshot 1");
    }

    #[test]
    fn test_commit_snapshot_sequence() {
        let (runner, mut backend, _td, root) = harness();
        let snap = backend.create_new_snapshot(&root, 0).unwrap();
        runner.on(
            "btrfs subvolume list",
            indoc! {"
                ID 257 gen 10 top level 5 path @
                ID 258 gen 10 top level 257 path @/.snapshots
                ID 259 gen 12 top level 258 path @/.snapshots/1/snapshot
            "},
        );
        backend.commit_snapshot(&root, &snap).unwrap();
        let calls = runner.calls();
        assert!(calls
            .iter()
            .any(|c| c == &format!("btrfs property set {} ro true", snap.path)));
        assert!(calls
            .iter()
            .any(|c| c == &format!("btrfs subvolume set-default 259 {root}")));
        // The in-progress marker is gone from the sidecar
        let info = SnapshotInfo::from_xml(
            &std::fs::read_to_string(root.join(".snapshots/1/info.xml")).unwrap(),
        )
        .unwrap();
        assert!(info.userdata.is_empty());
    }

    #[test]
    fn test_delete_refuses_current() {
        let (_runner, mut backend, _td, root) = harness();
        backend.stat.current_id = 3;
        let err = backend.delete_snapshot(&root, 3).unwrap_err();
        assert_eq!(
            err.root_cause().to_string(),
            "cannot delete a snapshot that is currently in use"
        );
        assert!(backend.delete_snapshot(&root, 0).is_err());
    }

    #[test]
    fn test_cleanup_stops_at_current() {
        let (runner, mut backend, _td, root) = harness();
        // Snapshots 1..=5, active 5, currently booted from 2
        runner.on(
            "btrfs subvolume list",
            indoc! {"
                ID 257 gen 10 top level 5 path @
                ID 258 gen 10 top level 257 path @/.snapshots
                ID 259 gen 12 top level 258 path @/.snapshots/1/snapshot
                ID 260 gen 13 top level 258 path @/.snapshots/2/snapshot
                ID 261 gen 14 top level 258 path @/.snapshots/3/snapshot
                ID 262 gen 15 top level 258 path @/.snapshots/4/snapshot
                ID 263 gen 16 top level 258 path @/.snapshots/5/snapshot
            "},
        );
        runner.on(
            "btrfs subvolume get-default",
            "ID 263 gen 16 top level 258 path @/.snapshots/5/snapshot\n",
        );
        backend.stat.current_id = 2;
        for id in 1..=5 {
            std::fs::create_dir_all(root.join(format!(".snapshots/{id}"))).unwrap();
        }
        backend.cleanup(&root, 2).unwrap();
        // 1 deleted, then 2 is the booted snapshot: stop without error
        assert_eq!(
            runner.call_count(&format!(
                "btrfs subvolume delete {root}/.snapshots/1/snapshot"
            )),
            1
        );
        assert_eq!(runner.call_count("btrfs subvolume delete"), 1);
    }
}
