//! Mirror one directory tree onto another.

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;

use crate::runner::{run_checked, CommandRunner};

/// Mirror `src` onto `dst`, preserving ACLs and xattrs and deleting
/// entries that vanished from the source. The trailing slashes make
/// rsync copy contents rather than nesting `src` inside `dst`.
#[context("Mirroring {src} to {dst}")]
pub(crate) fn sync_tree(runner: &dyn CommandRunner, src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    run_checked(
        runner,
        "rsync",
        &["-aAX", "--delete", &format!("{src}/"), &format!("{dst}/")],
    )
    .map(|_| ())
}
