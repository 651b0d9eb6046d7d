//! Loop device plumbing via losetup.
//!
//! Loop devices are acquired only while building an image and released
//! immediately afterwards; a long-held loop device is a bug, hence the
//! drop guard.

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;

use crate::runner::{run_checked, CommandRunner};

/// Attach `img` to the first free loop device, returning the device path.
#[context("Attaching {img}")]
pub(crate) fn attach(runner: &dyn CommandRunner, img: &Utf8Path) -> Result<String> {
    let out = run_checked(runner, "losetup", &["--show", "-f", img.as_str()])?;
    Ok(out.trim().to_string())
}

#[context("Detaching {device}")]
pub(crate) fn detach(runner: &dyn CommandRunner, device: &str) -> Result<()> {
    run_checked(runner, "losetup", &["-d", device]).map(|_| ())
}

/// Backing files of every attached loop device, one per line of
/// `losetup -ln --output BACK-FILE`.
pub(crate) fn backing_files(runner: &dyn CommandRunner) -> Result<Vec<String>> {
    let out = run_checked(runner, "losetup", &["-ln", "--output", "BACK-FILE"])?;
    Ok(out
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Holds an attached loop device and detaches it when dropped, unless
/// released through the orderly path first.
pub(crate) struct LoopDeviceGuard<'a> {
    runner: &'a dyn CommandRunner,
    device: Option<String>,
}

impl std::fmt::Debug for LoopDeviceGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopDeviceGuard")
            .field("device", &self.device)
            .finish()
    }
}

impl<'a> LoopDeviceGuard<'a> {
    pub(crate) fn attach(runner: &'a dyn CommandRunner, img: &Utf8Path) -> Result<Self> {
        let device = attach(runner, img)?;
        Ok(Self {
            runner,
            device: Some(device),
        })
    }

    pub(crate) fn device(&self) -> &str {
        self.device.as_deref().unwrap_or_default()
    }

    /// Detach now, reporting errors.
    pub(crate) fn release(mut self) -> Result<()> {
        if let Some(device) = self.device.take() {
            detach(self.runner, &device)?;
        }
        Ok(())
    }
}

impl Drop for LoopDeviceGuard<'_> {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            if let Err(e) = detach(self.runner, &device) {
                tracing::warn!("Failed to detach {device}: {e:#}");
            }
        }
    }
}
