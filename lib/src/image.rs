//! Build a filesystem image file from a populated directory tree.
//!
//! This is the only place loop devices are acquired; they are released
//! as soon as the image is built.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::loopdev::LoopDeviceGuard;
use crate::mount::Mounter;
use crate::runner::{run_checked, CommandRunner};
use crate::sync::sync_tree;
use crate::vfs::Filesystem;

/// Headroom added on top of the measured tree size.
const IMAGE_SLACK_MIB: u64 = 100;

/// Measure `tree` in MiB, rounded up.
fn tree_size_mib(runner: &dyn CommandRunner, tree: &Utf8Path) -> Result<u64> {
    let out = run_checked(runner, "du", &["-sm", tree.as_str()])?;
    let size = out
        .split_whitespace()
        .next()
        .and_then(|t| t.parse::<u64>().ok())
        .with_context(|| format!("Parsing du output: {out:?}"))?;
    Ok(size)
}

/// Create a filesystem image at `img` holding a mirror of `tree`.
/// `size_mib == 0` derives the size from the tree plus headroom.
#[context("Building image {img}")]
pub(crate) fn create_image_from_tree(
    runner: &dyn CommandRunner,
    mounter: &dyn Mounter,
    fs: &dyn Filesystem,
    img: &Utf8Path,
    tree: &Utf8Path,
    fstype: &str,
    label: &str,
    size_mib: u64,
) -> Result<()> {
    let size = if size_mib > 0 {
        size_mib
    } else {
        tree_size_mib(runner, tree)? + IMAGE_SLACK_MIB
    };
    fs.set_len(img, size * 1024 * 1024)
        .with_context(|| format!("Allocating {img}"))?;
    let mkfs = format!("mkfs.{fstype}");
    let mut args: Vec<&str> = Vec::new();
    if fstype.starts_with("ext") {
        args.push("-F");
    }
    args.extend(["-L", label, img.as_str()]);
    run_checked(runner, &mkfs, &args)?;

    let loopdev = LoopDeviceGuard::attach(runner, img)?;
    let mnt = tempfile::tempdir().context("Creating scratch mountpoint")?;
    let mnt_path = Utf8PathBuf::from_path_buf(mnt.path().to_owned())
        .map_err(|p| anyhow::anyhow!("non UTF-8 tempdir: {p:?}"))?;
    mounter.mount(loopdev.device(), &mnt_path, fstype, &[])?;
    let r = sync_tree(runner, tree, &mnt_path);
    if let Err(e) = mounter.unmount(&mnt_path) {
        tracing::warn!("Failed to unmount {mnt_path}: {e:#}");
    }
    r?;
    loopdev.release()
}
