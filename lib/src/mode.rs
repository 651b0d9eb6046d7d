//! Runtime classification of the executing system.
//!
//! The init layer drops a marker file into the runtime directory early in
//! boot; its presence tells us whether we run from installer media, the
//! active snapshot, a passive snapshot, or the recovery system. The mode
//! is detected once and passed into constructors.

use std::fmt::Display;

use camino::Utf8Path;

use crate::vfs::Filesystem;

/// Default runtime directory carrying the mode markers.
pub(crate) const DEFAULT_RUN_DIR: &str = "/run/elemental";

const ACTIVE_MODE_FILE: &str = "active_mode";
const PASSIVE_MODE_FILE: &str = "passive_mode";
const RECOVERY_MODE_FILE: &str = "recovery_mode";

/// Mutually exclusive runtime classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// No marker present: we run from installer (or live) media.
    Installer,
    Active,
    Passive,
    Recovery,
}

impl Mode {
    /// Detect the mode from marker files under `run_dir`.
    pub(crate) fn detect(fs: &dyn Filesystem, run_dir: &Utf8Path) -> Mode {
        if fs.exists(&run_dir.join(ACTIVE_MODE_FILE)) {
            Mode::Active
        } else if fs.exists(&run_dir.join(PASSIVE_MODE_FILE)) {
            Mode::Passive
        } else if fs.exists(&run_dir.join(RECOVERY_MODE_FILE)) {
            Mode::Recovery
        } else {
            Mode::Installer
        }
    }

    /// True when the running root is one of the snapshots on the state
    /// partition (so its mounts are already in place).
    pub(crate) fn is_booted_from_snapshot(&self) -> bool {
        matches!(self, Mode::Active | Mode::Passive)
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Mode::Installer => "installer",
            Mode::Active => "active",
            Mode::Passive => "passive",
            Mode::Recovery => "recovery",
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
