//! Filesystem helpers for the store regions.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

/// Recreate each of `ephemeral` empty and make sure each of `durable` exists
/// without touching its contents.
pub fn init_directories(ephemeral: &[&Path], durable: &[&Path]) -> io::Result<()> {
    for dir in ephemeral {
        match fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::create_dir_all(dir)?;
    }
    for dir in durable {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Point `link` at `source`. A link already pointing at `source` is left
/// alone. A link pointing elsewhere is replaced by renaming a fresh link over
/// it, so `link` never goes missing. The old target is not touched.
pub fn create_or_update_symlink(source: &Path, link: &Path) -> io::Result<()> {
    match fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            if fs::read_link(link)? == source {
                return Ok(());
            }
        }
        Ok(_) => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a symlink", link.display()),
            ))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let tmp = temp_link_path(link)?;
    match fs::remove_file(&tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    symlink(source, &tmp)?;
    if let Err(e) = fs::rename(&tmp, link) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Sibling path used while swapping a link.
pub fn temp_link_path(link: &Path) -> io::Result<PathBuf> {
    let name = link.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", link.display()),
        )
    })?;
    let mut tmp = std::ffi::OsString::from(".");
    tmp.push(name);
    tmp.push(".tmp");
    Ok(link.with_file_name(tmp))
}

/// Apply `action` to every non-empty directory exactly `depth` levels below
/// `root` (`root` itself at depth 0). Errors from the filesystem and from
/// `action` are returned as-is. Nothing is locked, so the view may be stale
/// by the time `action` runs.
pub fn walk_directory(
    root: &Path,
    depth: usize,
    action: &mut dyn FnMut(&Path) -> io::Result<()>,
) -> io::Result<()> {
    if depth == 0 {
        if !is_empty_dir(root)? {
            action(root)?;
        }
        return Ok(());
    }
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            walk_directory(&entry.path(), depth - 1, action)?;
        }
    }
    Ok(())
}

pub fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}
