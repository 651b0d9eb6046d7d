//! SELinux relabeling of committed snapshot trees.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::mount::Mounter;
use crate::runner::{run_checked, CommandRunner};
use crate::snapshot::SNAPSHOTS_DIR;
use crate::vfs::Filesystem;

#[context("Querying selinux availability")]
pub(crate) fn selinux_enabled() -> Result<bool> {
    std::path::Path::new("/proc/1/root/sys/fs/selinux/enforce")
        .try_exists()
        .map_err(Into::into)
}

/// Locate the file_contexts database shipped inside the snapshot tree.
fn find_file_contexts(fs: &dyn Filesystem, root: &Utf8Path) -> Option<Utf8PathBuf> {
    let selinux_dir = root.join("etc/selinux");
    for name in fs.read_dir_names(&selinux_dir).ok()? {
        let candidate = selinux_dir.join(&name).join("contexts/files/file_contexts");
        if fs.exists(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Relabel `root` (a committed snapshot tree) using the policy shipped in
/// the tree itself. `snapshots_dir` is bound at `<root>/.snapshots` for
/// the duration so the labeler resolves the same absolute paths the
/// booted system will see. Hosts without SELinux tooling are skipped.
#[context("Relabeling {root}")]
pub(crate) fn relabel_tree(
    runner: &dyn CommandRunner,
    mounter: &dyn Mounter,
    fs: &dyn Filesystem,
    root: &Utf8Path,
    snapshots_dir: &Utf8Path,
) -> Result<()> {
    if !selinux_enabled().unwrap_or(false) {
        tracing::debug!("SELinux not enabled; skipping relabel");
        return Ok(());
    }
    if !runner.command_exists("setfiles") {
        tracing::debug!("setfiles not found; skipping relabel");
        return Ok(());
    }
    let Some(contexts) = find_file_contexts(fs, root) else {
        tracing::debug!("No file_contexts in {root}; skipping relabel");
        return Ok(());
    };
    let bind_target = root.join(SNAPSHOTS_DIR);
    fs.create_dir_all(&bind_target)
        .with_context(|| format!("Creating {bind_target}"))?;
    mounter.mount(snapshots_dir.as_str(), &bind_target, "", &["bind"])?;
    let r = run_checked(
        runner,
        "setfiles",
        &["-F", "-r", root.as_str(), contexts.as_str(), root.as_str()],
    );
    if let Err(e) = mounter.unmount(&bind_target) {
        tracing::warn!("Failed to unmount {bind_target}: {e:#}");
    }
    r.map(|_| ())
}
