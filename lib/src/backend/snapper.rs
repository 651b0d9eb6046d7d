//! Snapper backend.
//!
//! Uses the `snapper` CLI once a target system is bootstrapped. Before
//! that (no active snapshot yet, e.g. from installer media) snapper has
//! no configuration to work with, so those operations fall back to the
//! raw btrfs backend.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use super::{snapshot_dir, snapshot_path, snapshot_work_dir, BtrfsBackend, SubvolumeBackend};
use crate::error::SnapshotterError;
use crate::mode::Mode;
use crate::runner::{run_tolerating, CommandRunner, SoftFailure};
use crate::snapshot::{BackendStat, Snapshot, SnapshotId, SnapshotsList, SNAPSHOTS_DIR};
use crate::vfs::Filesystem;

const CSV_HEADER: &str = "number,default,active";

#[derive(Debug)]
pub(crate) struct SnapperBackend {
    runner: Arc<dyn CommandRunner>,
    fs: Arc<dyn Filesystem>,
    raw: BtrfsBackend,
}

impl SnapperBackend {
    pub(crate) fn new(
        runner: Arc<dyn CommandRunner>,
        fs: Arc<dyn Filesystem>,
        mode: Mode,
    ) -> Self {
        let raw = BtrfsBackend::new(runner.clone(), fs.clone(), mode);
        Self { runner, fs, raw }
    }

    fn bootstrapped(&self) -> bool {
        self.raw.stat().active_id != 0
    }

    /// Run snapper against `root`. SELinux fsetfilecon noise on the
    /// snapshots directory is tolerated.
    fn run_snapper(&self, root: &Utf8Path, args: &[&str]) -> Result<String> {
        let mut argv: Vec<&str> = Vec::new();
        if root != "/" {
            argv.extend(["--no-dbus", "--root", root.as_str()]);
        }
        argv.extend(args);
        run_tolerating(
            self.runner.as_ref(),
            "snapper",
            &argv,
            &[SoftFailure::SelinuxFileContext],
        )
    }
}

/// Parse `snapper --csvout list --columns number,default,active` output.
/// Leading noise lines before the CSV header are skipped; snapshot 0 (the
/// live filesystem placeholder) is ignored.
fn parse_csv_list(out: &str) -> Result<SnapshotsList> {
    let mut list = SnapshotsList::default();
    let mut seen_header = false;
    for line in out.lines() {
        let line = line.trim();
        if !seen_header {
            seen_header = line == CSV_HEADER;
            continue;
        }
        if line.is_empty() {
            continue;
        }
        let mut cols = line.split(',');
        let (Some(num), Some(default), Some(active)) = (cols.next(), cols.next(), cols.next())
        else {
            continue;
        };
        let id: SnapshotId = num
            .parse()
            .with_context(|| format!("Parsing snapper row {line:?}"))?;
        if id == 0 {
            continue;
        }
        list.ids.push(id);
        if default == "yes" {
            list.active_id = id;
        }
        if active == "yes" {
            list.current_id = id;
        }
    }
    if !seen_header {
        return Err(anyhow!("snapper list output carried no header"));
    }
    list.ids.sort_unstable();
    Ok(list)
}

impl SubvolumeBackend for SnapperBackend {
    fn probe(&mut self, device: &Utf8Path, mountpoint: &Utf8Path) -> Result<BackendStat> {
        // Probing works without a snapper config, so it is shared.
        self.raw.probe(device, mountpoint)
    }

    fn init_partition(&mut self, root_dir: &Utf8Path) -> Result<()> {
        self.raw.init_partition(root_dir)
    }

    #[context("Creating snapper snapshot from base {base_id}")]
    fn create_new_snapshot(
        &mut self,
        root_dir: &Utf8Path,
        base_id: SnapshotId,
    ) -> Result<Snapshot> {
        if base_id == 0 {
            return self.raw.create_new_snapshot(root_dir, base_id);
        }
        let base = base_id.to_string();
        let description = format!("Update for snapshot {base_id}");
        let out = self.run_snapper(
            root_dir,
            &[
                "create",
                "--from",
                &base,
                "--read-write",
                "--print-number",
                "--description",
                &description,
                "-c",
                "number",
                "--userdata",
                "update-in-progress=yes",
            ],
        )?;
        let id: SnapshotId = out
            .lines()
            .map(str::trim)
            .find_map(|l| l.parse().ok())
            .ok_or_else(|| anyhow!("snapper did not print the new snapshot number: {out:?}"))?;
        let work_dir = snapshot_work_dir(root_dir, id);
        self.fs
            .create_dir_all(&work_dir)
            .with_context(|| format!("Creating {work_dir}"))?;
        Ok(Snapshot {
            id,
            path: snapshot_path(root_dir, id),
            work_dir,
            mount_point: Default::default(),
            label: None,
            in_progress: false,
        })
    }

    #[context("Committing snapper snapshot {}", snapshot.id)]
    fn commit_snapshot(&mut self, root_dir: &Utf8Path, snapshot: &Snapshot) -> Result<()> {
        if !self.bootstrapped() {
            return self.raw.commit_snapshot(root_dir, snapshot);
        }
        self.run_snapper(
            root_dir,
            &[
                "modify",
                "--read-only",
                "--default",
                "--userdata",
                "install-in-progress=,update-in-progress=",
                &snapshot.id.to_string(),
            ],
        )?;
        Ok(())
    }

    fn list_snapshots(&self, root_dir: &Utf8Path) -> Result<SnapshotsList> {
        if !self.bootstrapped() {
            return self.raw.list_snapshots(root_dir);
        }
        let out = self.run_snapper(
            root_dir,
            &["--csvout", "list", "--columns", "number,default,active"],
        )?;
        parse_csv_list(&out)
    }

    #[context("Deleting snapper snapshot {id}")]
    fn delete_snapshot(&mut self, root_dir: &Utf8Path, id: SnapshotId) -> Result<()> {
        if !self.bootstrapped() {
            return self.raw.delete_snapshot(root_dir, id);
        }
        if id == 0 {
            return Err(anyhow!("there is no snapshot 0 to delete"));
        }
        if id == self.raw.stat().current_id {
            return Err(SnapshotterError::InUse.into());
        }
        self.run_snapper(root_dir, &["delete", "--sync", &id.to_string()])?;
        // snapper leaves the numbered directory behind when the subvolume
        // was populated externally
        let dir = snapshot_dir(root_dir, id);
        if self.fs.exists(&dir) {
            let _ = self.fs.remove_dir_all(&dir);
        }
        Ok(())
    }

    #[context("Cleaning up snapper snapshots")]
    fn cleanup(&mut self, root_dir: &Utf8Path, max_snapshots: usize) -> Result<()> {
        if !self.bootstrapped() {
            return self.raw.cleanup(root_dir, max_snapshots);
        }
        let path = root_dir.join(SNAPSHOTS_DIR);
        self.run_snapper(root_dir, &["cleanup", "--path", path.as_str(), "number"])?;
        Ok(())
    }
}
