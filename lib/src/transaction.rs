//! Drives a snapshotter through a full lifecycle transaction.
//!
//! The orchestrator reconciles the host partition state, selects and
//! initializes a snapshotter, opens a transaction, hands the writable
//! mount to a populate callback (image extraction happens out there),
//! and commits. Every failure path aborts the transaction so the
//! previously active snapshot stays bootable.

use std::fmt::Display;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::config::SnapshotterConfig;
use crate::loopdev::LoopDeviceGuard;
use crate::mode::Mode;
use crate::snapshot::{ImageSource, Partition, Snapshot};
use crate::snapshotter::{new_snapshotter, Snapshotter, SnapshotterContext};
use crate::sync::sync_tree;

/// The lifecycle operation being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Install,
    Upgrade,
    Reset,
}

impl Action {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Action::Install => "install",
            Action::Upgrade => "upgrade",
            Action::Reset => "reset",
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub(crate) struct Orchestrator {
    ctx: SnapshotterContext,
    cfg: SnapshotterConfig,
    state: Partition,
    efi_dir: Utf8PathBuf,
}

impl Orchestrator {
    pub(crate) fn new(
        ctx: SnapshotterContext,
        cfg: SnapshotterConfig,
        state: Partition,
        efi_dir: Utf8PathBuf,
    ) -> Self {
        Self {
            ctx,
            cfg,
            state,
            efi_dir,
        }
    }

    /// Make sure the state partition is mounted where the snapshotter
    /// expects it. On a booted system the initramfs already did this.
    #[context("Reconciling state partition mount")]
    fn ensure_state_mounted(&self) -> Result<()> {
        let target = &self.state.mount_point;
        self.ctx
            .fs
            .create_dir_all(target)
            .with_context(|| format!("Creating {target}"))?;
        if self
            .ctx
            .mounter
            .is_likely_not_mountpoint(target)
            .unwrap_or(true)
        {
            self.ctx.mounter.mount(
                self.state.device.as_str(),
                target,
                &self.state.filesystem,
                &[],
            )?;
        }
        Ok(())
    }

    fn check_mode(&self, action: Action) -> Result<()> {
        match (action, self.ctx.mode) {
            (Action::Install, Mode::Installer) => Ok(()),
            (Action::Install, mode) => {
                Err(anyhow!("cannot install from the {mode} system"))
            }
            (Action::Reset, Mode::Active | Mode::Passive) => {
                Err(anyhow!("cannot reset the system we are running from"))
            }
            _ => Ok(()),
        }
    }

    /// Run `action` end to end with a freshly constructed snapshotter.
    pub(crate) fn run<F>(&self, action: Action, populate: F) -> Result<Snapshot>
    where
        F: FnOnce(&Snapshot) -> Result<()>,
    {
        self.check_mode(action)?;
        self.ensure_state_mounted()?;
        self.ctx
            .fs
            .create_dir_all(&self.efi_dir)
            .with_context(|| format!("Creating {}", self.efi_dir))?;
        let mut snapshotter = new_snapshotter(&self.ctx, &self.cfg, &self.state, &self.efi_dir)?;
        self.run_with(snapshotter.as_mut(), action, populate)
    }

    /// The transaction protocol proper, over any snapshotter.
    pub(crate) fn run_with<F>(
        &self,
        snapshotter: &mut dyn Snapshotter,
        action: Action,
        populate: F,
    ) -> Result<Snapshot>
    where
        F: FnOnce(&Snapshot) -> Result<()>,
    {
        snapshotter.init()?;
        let snapshot = snapshotter.start_transaction()?;
        tracing::debug!("Populating snapshot {} for {action}", snapshot.id);
        if let Err(e) = populate(&snapshot) {
            if let Err(abort) = snapshotter.close_transaction_on_error(&snapshot) {
                tracing::warn!("Failed to abort transaction: {abort:#}");
            }
            return Err(e).context("Populating snapshot");
        }
        snapshotter.close_transaction(&snapshot)?;
        println!("Queued snapshot {} for next boot", snapshot.id);
        Ok(snapshot)
    }
}

/// Mirror prepared image material into the open transaction. Directory
/// sources are mirrored directly; image files are loop mounted read-only
/// and mirrored from there.
#[context("Applying image source {source}")]
pub(crate) fn populate_from_source(
    ctx: &SnapshotterContext,
    source: &ImageSource,
    snapshot: &Snapshot,
) -> Result<()> {
    match source {
        ImageSource::Dir(dir) => {
            tracing::debug!(
                "Mirroring {} into the open transaction",
                elemental_utils::PathQuotedDisplay::new(dir)
            );
            sync_tree(ctx.runner.as_ref(), dir, &snapshot.mount_point)
        }
        ImageSource::File(img) => {
            let loopdev = LoopDeviceGuard::attach(ctx.runner.as_ref(), img)?;
            let mnt = tempfile::tempdir().context("Creating scratch mountpoint")?;
            let mnt_path = Utf8Path::from_path(mnt.path())
                .ok_or_else(|| anyhow!("non UTF-8 tempdir"))?
                .to_owned();
            ctx.mounter
                .mount(loopdev.device(), &mnt_path, "", &["ro"])?;
            let r = sync_tree(ctx.runner.as_ref(), &mnt_path, &snapshot.mount_point);
            if let Err(e) = ctx.mounter.unmount(&mnt_path) {
                tracing::warn!("Failed to unmount {mnt_path}: {e:#}");
            }
            r?;
            loopdev.release()
        }
    }
}
