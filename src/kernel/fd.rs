//! Descriptor table
//!
//! Maps small integers to open files. Like Unix, allocation always takes the
//! lowest free slot, so a closed descriptor number is handed out again by
//! the very next open.
//!
//! A slot holds a shared descriptor record with a reference count. `dup`
//! and `dup2` put the same record in several slots; the file is closed only
//! when the last slot referring to it is released. Closing happens after the
//! table lock is dropped, since closing a socket can wait on the host.

use super::error::{SyscallError, SyscallResult};
use super::file::File;
use crate::lock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Highest descriptor number `dup2` will create
pub const MAX_FDS: u32 = 1024;

pub const O_RDONLY: i32 = 0o0;
pub const O_WRONLY: i32 = 0o1;
pub const O_RDWR: i32 = 0o2;
pub const O_CREAT: i32 = 0o100;
pub const O_TRUNC: i32 = 0o1000;
pub const O_APPEND: i32 = 0o2000;

/// File descriptor - an index into the descriptor table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fd(pub u32);

impl Fd {
    pub const STDIN: Fd = Fd(0);
    pub const STDOUT: Fd = Fd(1);
    pub const STDERR: Fd = Fd(2);
}

impl std::fmt::Display for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Flags for opening files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags {
        read: true,
        write: false,
        create: false,
        truncate: false,
        append: false,
    };

    pub const WRITE: OpenFlags = OpenFlags {
        read: false,
        write: true,
        create: true,
        truncate: true,
        append: false,
    };

    pub const RDWR: OpenFlags = OpenFlags {
        read: true,
        write: true,
        create: false,
        truncate: false,
        append: false,
    };

    pub const APPEND: OpenFlags = OpenFlags {
        read: false,
        write: true,
        create: true,
        truncate: false,
        append: true,
    };

    /// Decode `O_*` bits
    pub fn from_posix(flags: i32) -> Self {
        let access = flags & 0o3;
        OpenFlags {
            read: access == O_RDONLY || access == O_RDWR,
            write: access == O_WRONLY || access == O_RDWR,
            create: flags & O_CREAT != 0,
            truncate: flags & O_TRUNC != 0,
            append: flags & O_APPEND != 0,
        }
    }
}

struct Descriptor {
    file: Arc<File>,
    /// Number of slots holding this record; only changed under the table lock
    refs: AtomicUsize,
}

/// Process-wide descriptor table
pub struct DescriptorTable {
    slots: Mutex<Vec<Option<Arc<Descriptor>>>>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    fn place(slots: &mut Vec<Option<Arc<Descriptor>>>, desc: Arc<Descriptor>) -> Fd {
        if let Some(index) = slots.iter().position(Option::is_none) {
            slots[index] = Some(desc);
            return Fd(index as u32);
        }
        slots.push(Some(desc));
        Fd((slots.len() - 1) as u32)
    }

    fn get(slots: &[Option<Arc<Descriptor>>], fd: Fd) -> SyscallResult<&Arc<Descriptor>> {
        slots
            .get(fd.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(SyscallError::BadFd(fd.0))
    }

    /// Install a file in the lowest free slot
    pub fn allocate(&self, file: File) -> Fd {
        let desc = Arc::new(Descriptor {
            file: Arc::new(file),
            refs: AtomicUsize::new(1),
        });
        Self::place(&mut lock(&self.slots), desc)
    }

    pub fn lookup(&self, fd: Fd) -> SyscallResult<Arc<File>> {
        let slots = lock(&self.slots);
        Self::get(&slots, fd).map(|desc| Arc::clone(&desc.file))
    }

    /// Empty the slot; close the file if this was its last slot
    pub fn release(&self, fd: Fd) -> SyscallResult<()> {
        let last = {
            let mut slots = lock(&self.slots);
            Self::get(&slots, fd)?;
            let desc = slots[fd.0 as usize].take();
            desc.filter(|d| d.refs.fetch_sub(1, Ordering::AcqRel) == 1)
        };
        match last {
            Some(desc) => desc.file.close(),
            None => Ok(()),
        }
    }

    /// Refer to the same file from the lowest free slot
    pub fn dup(&self, fd: Fd) -> SyscallResult<Fd> {
        let mut slots = lock(&self.slots);
        let desc = Arc::clone(Self::get(&slots, fd)?);
        desc.refs.fetch_add(1, Ordering::AcqRel);
        Ok(Self::place(&mut slots, desc))
    }

    /// Make `newfd` refer to the same file as `fd`, releasing whatever
    /// `newfd` held before
    pub fn dup2(&self, fd: Fd, newfd: Fd) -> SyscallResult<Fd> {
        if newfd.0 >= MAX_FDS {
            return Err(SyscallError::BadFd(newfd.0));
        }
        let replaced = {
            let mut slots = lock(&self.slots);
            let desc = Arc::clone(Self::get(&slots, fd)?);
            if fd == newfd {
                return Ok(newfd);
            }
            let index = newfd.0 as usize;
            if slots.len() <= index {
                slots.resize(index + 1, None);
            }
            desc.refs.fetch_add(1, Ordering::AcqRel);
            let old = slots[index].replace(desc);
            old.filter(|d| d.refs.fetch_sub(1, Ordering::AcqRel) == 1)
        };
        if let Some(old) = replaced {
            old.file.close()?;
        }
        Ok(newfd)
    }

    /// Number of slots referring to the same file as `fd`
    pub fn refcount(&self, fd: Fd) -> usize {
        let slots = lock(&self.slots);
        Self::get(&slots, fd)
            .map(|desc| desc.refs.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        lock(&self.slots).iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}
