//! Helpers for interacting with mountpoints

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use crate::runner::{run_checked, CommandRunner};

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Filesystem {
    // Note if you add an entry to this list, you need to change the --output invocation below too
    pub(crate) source: String,
    pub(crate) fstype: String,
    pub(crate) options: String,
}

#[derive(Deserialize, Debug)]
pub(crate) struct Findmnt {
    pub(crate) filesystems: Vec<Filesystem>,
}

#[context("Inspecting filesystem {path}")]
pub(crate) fn inspect_filesystem(runner: &dyn CommandRunner, path: &Utf8Path) -> Result<Filesystem> {
    let o = run_checked(
        runner,
        "findmnt",
        &[
            "-J",
            "-v",
            // If you change this you probably also want to change the Filesystem struct above
            "--output=SOURCE,FSTYPE,OPTIONS",
            path.as_str(),
        ],
    )?;
    let o: Findmnt = serde_json::from_str(&o).context("Parsing findmnt output")?;
    o.filesystems
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("findmnt returned no data for {path}"))
}

impl Filesystem {
    pub(crate) fn is_read_only(&self) -> bool {
        self.options.split(',').any(|o| o == "ro")
    }
}

/// Every mount of `device`, as (source, target) pairs. The source carries
/// the subvolume in brackets for btrfs (`/dev/sda[/@]`). A device with no
/// mounts yields an empty list rather than an error.
#[context("Listing mounts of {device}")]
pub(crate) fn device_mounts(
    runner: &dyn CommandRunner,
    device: &Utf8Path,
) -> Result<Vec<(String, Utf8PathBuf)>> {
    let out = runner.run("findmnt", &["-lno", "SOURCE,TARGET", device.as_str()])?;
    if !out.success() {
        return Ok(Vec::new());
    }
    let mut mounts = Vec::new();
    for line in out.text().lines() {
        let mut fields = line.split_whitespace();
        if let (Some(source), Some(target)) = (fields.next(), fields.next()) {
            mounts.push((source.to_string(), Utf8PathBuf::from(target)));
        }
    }
    Ok(mounts)
}

/// Extract the bracketed subvolume path of a findmnt btrfs source, e.g.
/// `/dev/sda[/@/.snapshots/2/snapshot]` yields `/@/.snapshots/2/snapshot`.
pub(crate) fn source_subvolume(source: &str) -> Option<&str> {
    let start = source.find('[')?;
    let end = source.rfind(']')?;
    (start < end).then(|| &source[start + 1..end])
}

/// Mount/unmount port. Production goes through the `mount`/`umount`
/// tools; tests swap in a recorder.
pub(crate) trait Mounter: Debug {
    fn mount(&self, source: &str, target: &Utf8Path, fstype: &str, options: &[&str])
        -> Result<()>;
    fn unmount(&self, target: &Utf8Path) -> Result<()>;
    /// Advisory check only: bind mounts are not reliably detected, so
    /// callers may use this to skip no-op work but never for correctness.
    fn is_likely_not_mountpoint(&self, target: &Utf8Path) -> Result<bool>;
}

/// The real thing.
#[derive(Debug)]
pub(crate) struct HostMounter {
    runner: Arc<dyn CommandRunner>,
}

impl HostMounter {
    pub(crate) fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl Mounter for HostMounter {
    #[context("Mounting {source} at {target}")]
    fn mount(
        &self,
        source: &str,
        target: &Utf8Path,
        fstype: &str,
        options: &[&str],
    ) -> Result<()> {
        let mut args = Vec::new();
        if !fstype.is_empty() {
            args.extend(["-t", fstype]);
        }
        let opts = options.join(",");
        if !opts.is_empty() {
            args.extend(["-o", opts.as_str()]);
        }
        args.extend([source, target.as_str()]);
        run_checked(self.runner.as_ref(), "mount", &args).map(|_| ())
    }

    #[context("Unmounting {target}")]
    fn unmount(&self, target: &Utf8Path) -> Result<()> {
        run_checked(self.runner.as_ref(), "umount", &[target.as_str()]).map(|_| ())
    }

    fn is_likely_not_mountpoint(&self, target: &Utf8Path) -> Result<bool> {
        let st = rustix::fs::stat(target.as_std_path())
            .with_context(|| format!("stat {target}"))?;
        let parent = target
            .parent()
            .ok_or_else(|| anyhow!("no parent for {target}"))?;
        let pst = rustix::fs::stat(parent.as_std_path())
            .with_context(|| format!("stat {parent}"))?;
        Ok(st.st_dev == pst.st_dev)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;

    #[test]
    fn test_inspect_filesystem() {
        let r = ScriptedRunner::new();
        r.on(
            "findmnt -J",
            r#"{"filesystems": [{"source": "/dev/sda2", "fstype": "ext4", "options": "ro,relatime"}]}"#,
        );
        let fs = inspect_filesystem(&r, "/run/initramfs/elemental-state".into()).unwrap();
        assert_eq!(fs.source, "/dev/sda2");
        assert_eq!(fs.fstype, "ext4");
        assert!(fs.is_read_only());
    }

    #[test]
    fn test_device_mounts() {
        let r = ScriptedRunner::new();
        r.on(
            "findmnt -lno SOURCE,TARGET /dev/sda",
            "/dev/sda[/@/.snapshots/2/snapshot] /some/root\n/dev/sda[/@] /some/root/run/initramfs/elemental-state\n",
        );
        let mounts = device_mounts(&r, "/dev/sda".into()).unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(
            source_subvolume(&mounts[0].0),
            Some("/@/.snapshots/2/snapshot")
        );
        assert_eq!(mounts[1].1, "/some/root/run/initramfs/elemental-state");
    }

    #[test]
    fn test_device_mounts_unmounted_device() {
        let r = ScriptedRunner::new();
        r.on_code("findmnt -lno SOURCE,TARGET /dev/sdz", "", 1);
        assert!(device_mounts(&r, "/dev/sdz".into()).unwrap().is_empty());
    }

    #[test]
    fn test_host_mounter_argv() {
        let r = std::sync::Arc::new(ScriptedRunner::new());
        let m = HostMounter::new(r.clone());
        m.mount("/dev/sda2", "/run/state".into(), "btrfs", &["subvol=@"])
            .unwrap();
        m.mount("/some/work", "/run/work".into(), "", &["bind"])
            .unwrap();
        m.unmount("/run/work".into()).unwrap();
        let calls = r.calls();
        assert_eq!(calls[0], "mount -t btrfs -o subvol=@ /dev/sda2 /run/state");
        assert_eq!(calls[1], "mount -o bind /some/work /run/work");
        assert_eq!(calls[2], "umount /run/work");
    }
}
