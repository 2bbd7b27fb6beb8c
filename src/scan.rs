//! Listing the immediate children of a directory.

use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A directory entry found by [`scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Child {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Calls `visit` once for every entry directly inside `dir`, in the order the filesystem returns
/// them.
///
/// Stops at the first error, whether it comes from listing `dir` or from `visit`. Symbolic links
/// are reported as themselves and never followed.
pub(crate) fn scan<F, E>(dir: &Path, mut visit: F) -> Result<(), E>
where
    F: FnMut(Child) -> Result<(), E>,
    E: From<io::Error>,
{
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
    {
        let entry = entry.map_err(map_walkdir_error)?;
        let is_dir = entry.file_type().is_dir();
        visit(Child {
            path: entry.into_path(),
            is_dir,
        })?;
    }
    Ok(())
}

fn map_walkdir_error(e: walkdir::Error) -> io::Error {
    let message = e.to_string();
    e.into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, message))
}
