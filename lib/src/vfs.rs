//! Virtualized file I/O.
//!
//! The engine never touches `std::fs` directly: everything goes through
//! the [`Filesystem`] port so tests can run against a scratch directory
//! and recovery-mode safeguards can interpose a read-only decorator.

use std::fmt::Debug;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};

/// POSIX-shaped file operations used by the snapshotters.
pub(crate) trait Filesystem: Debug {
    fn read_to_string(&self, path: &Utf8Path) -> io::Result<String>;
    fn write(&self, path: &Utf8Path, contents: &[u8]) -> io::Result<()>;
    fn create_dir_all(&self, path: &Utf8Path) -> io::Result<()>;
    fn remove_file(&self, path: &Utf8Path) -> io::Result<()>;
    fn remove_dir_all(&self, path: &Utf8Path) -> io::Result<()>;
    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()>;
    /// Create a symbolic link at `link` pointing to `target`.
    fn symlink(&self, target: &Utf8Path, link: &Utf8Path) -> io::Result<()>;
    fn read_link(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf>;
    /// Create a hard link at `link` sharing the inode of `original`.
    fn hard_link(&self, original: &Utf8Path, link: &Utf8Path) -> io::Result<()>;
    /// Entry names (not full paths) of a directory, sorted.
    fn read_dir_names(&self, path: &Utf8Path) -> io::Result<Vec<String>>;
    /// Grow or shrink a regular file, creating it if missing.
    fn set_len(&self, path: &Utf8Path, len: u64) -> io::Result<()>;
    fn exists(&self, path: &Utf8Path) -> bool;
    fn is_dir(&self, path: &Utf8Path) -> bool;
}

fn non_utf8(path: &std::path::Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("non UTF-8 path: {:?}", path),
    )
}

/// The real thing.
#[derive(Debug, Default, Clone)]
pub(crate) struct HostFs;

impl Filesystem for HostFs {
    fn read_to_string(&self, path: &Utf8Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write(&self, path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn create_dir_all(&self, path: &Utf8Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn remove_file(&self, path: &Utf8Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn remove_dir_all(&self, path: &Utf8Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn symlink(&self, target: &Utf8Path, link: &Utf8Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    fn read_link(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
        let target = std::fs::read_link(path)?;
        Utf8PathBuf::from_path_buf(target).map_err(|p| non_utf8(&p))
    }

    fn hard_link(&self, original: &Utf8Path, link: &Utf8Path) -> io::Result<()> {
        std::fs::hard_link(original, link)
    }

    fn read_dir_names(&self, path: &Utf8Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for ent in std::fs::read_dir(path)? {
            let name = ent?.file_name();
            let name = name.into_string().map_err(|n| non_utf8(n.as_ref()))?;
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn set_len(&self, path: &Utf8Path, len: u64) -> io::Result<()> {
        let f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        f.set_len(len)
    }

    fn exists(&self, path: &Utf8Path) -> bool {
        // Does not traverse a trailing symlink: a dangling `active` link
        // still counts as present.
        path.symlink_metadata().is_ok()
    }

    fn is_dir(&self, path: &Utf8Path) -> bool {
        path.is_dir()
    }
}

fn read_only_error() -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "read-only filesystem")
}

/// Decorator that refuses every mutation. Reads pass through.
#[derive(Debug, Clone)]
pub(crate) struct ReadOnlyFs<F: Filesystem>(pub(crate) F);

impl<F: Filesystem> Filesystem for ReadOnlyFs<F> {
    fn read_to_string(&self, path: &Utf8Path) -> io::Result<String> {
        self.0.read_to_string(path)
    }

    fn write(&self, _path: &Utf8Path, _contents: &[u8]) -> io::Result<()> {
        Err(read_only_error())
    }

    fn create_dir_all(&self, _path: &Utf8Path) -> io::Result<()> {
        Err(read_only_error())
    }

    fn remove_file(&self, _path: &Utf8Path) -> io::Result<()> {
        Err(read_only_error())
    }

    fn remove_dir_all(&self, _path: &Utf8Path) -> io::Result<()> {
        Err(read_only_error())
    }

    fn rename(&self, _from: &Utf8Path, _to: &Utf8Path) -> io::Result<()> {
        Err(read_only_error())
    }

    fn symlink(&self, _target: &Utf8Path, _link: &Utf8Path) -> io::Result<()> {
        Err(read_only_error())
    }

    fn read_link(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
        self.0.read_link(path)
    }

    fn hard_link(&self, _original: &Utf8Path, _link: &Utf8Path) -> io::Result<()> {
        Err(read_only_error())
    }

    fn read_dir_names(&self, path: &Utf8Path) -> io::Result<Vec<String>> {
        self.0.read_dir_names(path)
    }

    fn set_len(&self, _path: &Utf8Path, _len: u64) -> io::Result<()> {
        Err(read_only_error())
    }

    fn exists(&self, path: &Utf8Path) -> bool {
        self.0.exists(path)
    }

    fn is_dir(&self, path: &Utf8Path) -> bool {
        self.0.is_dir(path)
    }
}
