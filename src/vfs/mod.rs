//! Virtual File System
//!
//! There is no real filesystem underneath the bridge. Paths resolve, in
//! order, against:
//!
//! 1. The symlink map (followed until a non-link, failing on a cycle)
//! 2. Temp files: anything under the temp directory is an in-memory buffer,
//!    created on first open
//! 3. Synthetic paths (`/etc/localtime`, random devices)
//!
//! Anything else does not exist. Directories are only tracked under the
//! temp directory; directory operations elsewhere are not implemented.
//!
//! When both are needed, `dirs` is locked before `temp_files`.

pub mod synthetic;

pub use synthetic::SyntheticTable;

use crate::kernel::error::{SyscallError, SyscallResult};
use crate::kernel::fd::OpenFlags;
use crate::kernel::file::{File, FileKind, FileStat, GrowableBuffer, SharedBuffer};
use crate::lock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Strip a trailing slash
fn normalize_path(path: &str) -> &str {
    if path.len() > 1 && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

/// Is `path` strictly inside directory `dir`?
fn is_under(path: &str, dir: &str) -> bool {
    let dir = normalize_path(dir);
    if dir == "/" {
        return path.len() > 1 && path.starts_with('/');
    }
    path.strip_prefix(dir)
        .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1)
}

pub struct Overlay {
    symlinks: Mutex<HashMap<String, String>>,
    temp_files: Mutex<HashMap<String, Arc<SharedBuffer>>>,
    dirs: Mutex<BTreeSet<String>>,
    synthetic: SyntheticTable,
}

impl Overlay {
    pub fn new(known_dirs: &[String], seed: u64) -> Self {
        Self {
            symlinks: Mutex::new(HashMap::new()),
            temp_files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(
                known_dirs
                    .iter()
                    .map(|d| normalize_path(d).to_string())
                    .collect(),
            ),
            synthetic: SyntheticTable::new(seed),
        }
    }

    /// Follow symlinks from `path` to a non-link path
    pub fn resolve(&self, path: &str) -> SyscallResult<String> {
        let links = lock(&self.symlinks);
        let mut seen = HashSet::new();
        let mut current = normalize_path(path).to_string();
        loop {
            if !seen.insert(current.clone()) {
                return Err(SyscallError::SymlinkCycle(path.to_string()));
            }
            match links.get(&current) {
                Some(next) => current = next.clone(),
                None => return Ok(current),
            }
        }
    }

    /// Open `path`. Temp files are created on first open whatever the flags.
    pub fn open(&self, path: &str, flags: OpenFlags, tmp_dir: &str) -> SyscallResult<File> {
        let resolved = self.resolve(path)?;
        trace!(path, resolved = %resolved, ?flags, "open");

        if is_under(&resolved, tmp_dir) {
            let shared = {
                let dirs = lock(&self.dirs);
                if dirs.contains(&resolved) {
                    return Err(SyscallError::Unsupported { op: "open directory" });
                }
                let mut files = lock(&self.temp_files);
                Arc::clone(files.entry(resolved.clone()).or_insert_with(|| {
                    debug!(path = %resolved, "new temp file");
                    Arc::new(SharedBuffer::new(resolved.clone()))
                }))
            };
            if flags.truncate && flags.write {
                shared.truncate();
            }
            return Ok(File::Buffer(GrowableBuffer::new(shared, flags)));
        }

        self.synthetic
            .open(&resolved)
            .ok_or_else(|| SyscallError::NotFound(path.to_string()))
    }

    /// Make `newpath` a link to `oldpath`, replacing any previous link
    pub fn symlink(&self, oldpath: &str, newpath: &str) {
        lock(&self.symlinks).insert(
            normalize_path(newpath).to_string(),
            normalize_path(oldpath).to_string(),
        );
    }

    /// Remove a symlink. Regular and temp files cannot be unlinked.
    pub fn unlink(&self, path: &str) -> SyscallResult<()> {
        match lock(&self.symlinks).remove(normalize_path(path)) {
            Some(_) => Ok(()),
            None => Err(SyscallError::NotSymlink(path.to_string())),
        }
    }

    pub fn readlink(&self, path: &str) -> SyscallResult<String> {
        lock(&self.symlinks)
            .get(normalize_path(path))
            .cloned()
            .ok_or_else(|| SyscallError::NotSymlink(path.to_string()))
    }

    pub fn mkdir(&self, path: &str, tmp_dir: &str) -> SyscallResult<()> {
        let path = normalize_path(path);
        if path == normalize_path(tmp_dir) {
            return Err(SyscallError::AlreadyExists(path.to_string()));
        }
        let mut dirs = lock(&self.dirs);
        if !is_under(path, tmp_dir) && !dirs.contains(path) {
            return Err(SyscallError::Unimplemented { op: "mkdir" });
        }
        let files = lock(&self.temp_files);
        if files.contains_key(path) || !dirs.insert(path.to_string()) {
            return Err(SyscallError::AlreadyExists(path.to_string()));
        }
        Ok(())
    }

    pub fn rmdir(&self, path: &str, tmp_dir: &str) -> SyscallResult<()> {
        let path = self.resolve(path)?;
        if path == normalize_path(tmp_dir) {
            return Err(SyscallError::InvalidState("cannot remove the temp directory"));
        }
        if lock(&self.dirs).remove(&path) {
            return Ok(());
        }
        if is_under(&path, tmp_dir) {
            return Err(SyscallError::NotFound(path));
        }
        Err(SyscallError::Unimplemented { op: "rmdir" })
    }

    pub fn stat(&self, path: &str, tmp_dir: &str) -> SyscallResult<FileStat> {
        let path = self.resolve(path)?;
        if path == normalize_path(tmp_dir) || lock(&self.dirs).contains(&path) {
            return Ok(FileStat::new(FileKind::Directory, 0));
        }
        if let Some(shared) = lock(&self.temp_files).get(&path) {
            return Ok(FileStat::new(FileKind::Regular, shared.len() as u64));
        }
        if let Some(stat) = self.synthetic.stat(&path) {
            return Ok(stat);
        }
        if is_under(&path, tmp_dir) {
            return Err(SyscallError::NotFound(path));
        }
        Err(SyscallError::Unimplemented { op: "stat" })
    }
}
