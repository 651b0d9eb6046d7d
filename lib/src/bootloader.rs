//! Boot menu environment file handling.
//!
//! The boot menu reads a small grubenv-like `key=value` file from the EFI
//! directory; the snapshotters rewrite it after every committed
//! transaction so the menu can offer every passive snapshot plus recovery
//! as fallback entries.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::vfs::Filesystem;

/// File name of the boot environment, relative to the EFI directory.
pub(crate) const GRUB_ENV_FILE: &str = "grub_oem_env";

/// Key listing passive snapshot ids, newest first, space separated.
pub(crate) const PASSIVE_SNAPS_KEY: &str = "passive_snaps";

/// Key listing the menu fallback index sequence `0 1 ... n+1`.
pub(crate) const FALLBACK_ENTRIES_KEY: &str = "fallback_entries";

/// Parse the boot environment back into a map. A missing file is an
/// empty environment.
pub(crate) fn read_persistent_variables(
    fs: &dyn Filesystem,
    path: &Utf8Path,
) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    if !fs.exists(path) {
        return Ok(vars);
    }
    let buf = fs
        .read_to_string(path)
        .with_context(|| format!("Reading {path}"))?;
    for line in buf.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            vars.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    Ok(vars)
}

/// Merge `vars` into the boot environment at `path`. The file is
/// replaced atomically (write to a sibling, then rename) so a concurrent
/// reader sees either the old or the new contents.
#[context("Writing boot environment {path}")]
pub(crate) fn set_persistent_variables(
    fs: &dyn Filesystem,
    path: &Utf8Path,
    vars: &BTreeMap<String, String>,
) -> Result<()> {
    let mut merged = read_persistent_variables(fs, path)?;
    merged.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
    let mut buf = String::new();
    for (k, v) in &merged {
        writeln!(buf, "{k}={v}")?;
    }
    let tmp = path.with_file_name(format!(
        "{}.new",
        path.file_name().unwrap_or(GRUB_ENV_FILE)
    ));
    fs.write(&tmp, buf.as_bytes())?;
    fs.rename(&tmp, path)?;
    Ok(())
}
