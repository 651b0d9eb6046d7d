//! Execution port for the external tool fleet (`btrfs`, `snapper`,
//! `losetup`, `findmnt`, `rsync`, `mkfs.*`).
//!
//! Commands capture stdout and stderr interleaved through one unlinked
//! temp file, so a failing tool's diagnostics travel with the error and
//! callers can classify known-benign failures by substring.

use std::borrow::Cow;
use std::fmt::Debug;
use std::io::{Read, Seek};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

use crate::error::SnapshotterError;

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub(crate) struct ToolOutput {
    /// Interleaved stdout and stderr, in production order.
    pub(crate) output: Vec<u8>,
    /// Exit code; signal deaths map to -1.
    pub(crate) code: i32,
}

impl ToolOutput {
    pub(crate) fn success(&self) -> bool {
        self.code == 0
    }

    pub(crate) fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }
}

/// Runs external tools and reports whether they are installed at all.
pub(crate) trait CommandRunner: Debug {
    /// Run `cmd` with `args`, capturing combined output. An `Err` here
    /// means the process could not be spawned; a nonzero exit is a
    /// successful call with `code != 0`.
    fn run(&self, cmd: &str, args: &[&str]) -> Result<ToolOutput>;

    fn command_exists(&self, cmd: &str) -> bool;
}

/// Run and fail on nonzero exit, attaching the captured output.
pub(crate) fn run_checked(runner: &dyn CommandRunner, cmd: &str, args: &[&str]) -> Result<String> {
    let out = runner.run(cmd, args)?;
    if !out.success() {
        return Err(SnapshotterError::Backend {
            tool: cmd.to_string(),
            output: out.text().trim().to_string(),
        }
        .into());
    }
    Ok(out.text().into_owned())
}

/// Known benign failure modes of the tool fleet, recognized from the
/// captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SoftFailure {
    /// A qgroup or subvolume that is already gone.
    MissingReference,
    /// snapper noise when SELinux denies fsetfilecon over `.snapshots`.
    SelinuxFileContext,
}

pub(crate) fn classify(output: &str) -> Option<SoftFailure> {
    if output.trim_start().starts_with("fsetfilecon on") {
        return Some(SoftFailure::SelinuxFileContext);
    }
    if output.contains("reference does not exist") {
        return Some(SoftFailure::MissingReference);
    }
    None
}

/// Like [`run_checked`], but failures classified as one of `benign` are
/// demoted to a successful (possibly noisy) result.
pub(crate) fn run_tolerating(
    runner: &dyn CommandRunner,
    cmd: &str,
    args: &[&str],
    benign: &[SoftFailure],
) -> Result<String> {
    let out = runner.run(cmd, args)?;
    let text = out.text().into_owned();
    if !out.success() {
        match classify(&text) {
            Some(kind) if benign.contains(&kind) => {
                tracing::debug!("Ignoring benign {cmd} failure: {kind:?}");
            }
            _ => {
                return Err(SnapshotterError::Backend {
                    tool: cmd.to_string(),
                    output: text.trim().to_string(),
                }
                .into())
            }
        }
    }
    Ok(text)
}

/// The real thing: spawns processes on the host.
#[derive(Debug, Default, Clone)]
pub(crate) struct HostRunner;

impl CommandRunner for HostRunner {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<ToolOutput> {
        let mut c = Command::new(cmd);
        c.args(args);
        // Default to noninteractive
        c.stdin(Stdio::null());
        let mut tmpf = tempfile::tempfile()?;
        c.stdout(Stdio::from(tmpf.try_clone()?));
        c.stderr(Stdio::from(tmpf.try_clone()?));
        tracing::debug!("exec: {c:?}");
        let st = c.status().with_context(|| format!("Spawning {cmd}"))?;
        tmpf.seek(std::io::SeekFrom::Start(0))?;
        let mut output = Vec::new();
        tmpf.read_to_end(&mut output)?;
        Ok(ToolOutput {
            output,
            code: st.code().unwrap_or(-1),
        })
    }

    fn command_exists(&self, cmd: &str) -> bool {
        if cmd.contains('/') {
            return std::path::Path::new(cmd).exists();
        }
        let Some(path) = std::env::var_os("PATH") else {
            return false;
        };
        std::env::split_paths(&path).any(|d| d.join(cmd).exists())
    }
}
