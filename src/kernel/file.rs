//! Open file implementations
//!
//! Everything a descriptor can point at is a `File`. The set of backing
//! kinds is fixed, so dispatch is a match rather than a trait object:
//!
//! - `Console`: writes go to the host console, one message per line chunk
//! - `Random`: reads produce pseudo-random bytes
//! - `Static`: read-only bytes with a shared cursor
//! - `Buffer`: a handle onto a growable in-memory temp file
//! - `Socket`: a network socket (see `net`)
//! - `Unsupported`: every operation fails
//!
//! All operations take `&self`; each variant locks its own state so one
//! descriptor can be used from several threads.

use super::error::{SyscallError, SyscallResult};
use super::fd::OpenFlags;
use super::net::NetSocket;
use crate::lock;
use crate::platform::{Host, LogLevel};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use std::io::SeekFrom;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Source location a console write is attributed to
pub type CallSite = &'static Location<'static>;

/// Largest size a temp file may grow to
pub const MAX_FILE_SIZE: usize = 1 << 30;

/// Offset for a read. Anything past the addressable range is past the end.
fn read_offset(offset: u64) -> usize {
    usize::try_from(offset).unwrap_or(usize::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    CharDevice,
    Regular,
    Directory,
    Socket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    pub size: u64,
}

impl FileStat {
    pub fn new(kind: FileKind, size: u64) -> Self {
        Self { kind, size }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// An open file
pub enum File {
    Console(ConsoleSink),
    Random(RandomSource),
    Static(StaticBuffer),
    Buffer(GrowableBuffer),
    Socket(NetSocket),
    Unsupported,
}

fn unsupported<T>(op: &'static str) -> SyscallResult<T> {
    Err(SyscallError::Unsupported { op })
}

impl File {
    pub fn type_name(&self) -> &'static str {
        match self {
            File::Console(_) => "console",
            File::Random(_) => "random",
            File::Static(_) => "static",
            File::Buffer(_) => "buffer",
            File::Socket(_) => "socket",
            File::Unsupported => "unsupported",
        }
    }

    pub fn as_socket(&self) -> Option<&NetSocket> {
        match self {
            File::Socket(s) => Some(s),
            _ => None,
        }
    }

    pub fn stat(&self) -> SyscallResult<FileStat> {
        match self {
            File::Console(_) | File::Random(_) => Ok(FileStat::new(FileKind::CharDevice, 0)),
            File::Static(s) => Ok(FileStat::new(FileKind::Regular, s.data.len() as u64)),
            File::Buffer(b) => b.stat(),
            File::Socket(_) => Ok(FileStat::new(FileKind::Socket, 0)),
            File::Unsupported => unsupported("stat"),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> SyscallResult<usize> {
        match self {
            File::Random(r) => Ok(r.fill(buf)),
            File::Static(s) => Ok(s.read(buf)),
            File::Buffer(b) => b.read(buf),
            File::Socket(s) => s.read(buf),
            File::Console(_) | File::Unsupported => unsupported("read"),
        }
    }

    pub fn write(&self, buf: &[u8], site: CallSite) -> SyscallResult<usize> {
        match self {
            File::Console(c) => Ok(c.write(buf, site)),
            File::Buffer(b) => b.write(buf),
            File::Socket(s) => s.write(buf),
            File::Random(_) | File::Static(_) | File::Unsupported => unsupported("write"),
        }
    }

    pub fn seek(&self, pos: SeekFrom) -> SyscallResult<u64> {
        match self {
            File::Static(s) => s.seek(pos),
            File::Buffer(b) => b.seek(pos),
            _ => unsupported("seek"),
        }
    }

    /// Read at `offset` without moving the cursor
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> SyscallResult<usize> {
        match self {
            File::Random(r) => Ok(r.fill(buf)),
            File::Static(s) => Ok(s.pread(buf, offset)),
            File::Buffer(b) => b.pread(buf, offset),
            _ => unsupported("pread"),
        }
    }

    /// Write at `offset` without moving the cursor
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> SyscallResult<usize> {
        match self {
            File::Buffer(b) => b.pwrite(buf, offset),
            _ => unsupported("pwrite"),
        }
    }

    /// Called once, when the last descriptor referring to this file goes away
    pub fn close(&self) -> SyscallResult<()> {
        match self {
            File::Buffer(b) => {
                b.close();
                Ok(())
            }
            File::Socket(s) => s.close(),
            _ => Ok(()),
        }
    }
}

/// Resolve a seek request against a cursor and a length
fn seek_target(pos: SeekFrom, cursor: usize, len: usize) -> SyscallResult<usize> {
    let target = match pos {
        SeekFrom::Start(n) => i128::from(n),
        SeekFrom::Current(n) => cursor as i128 + i128::from(n),
        SeekFrom::End(n) => len as i128 + i128::from(n),
    };
    usize::try_from(target).map_err(|_| SyscallError::InvalidArgument("seek before start of file"))
}

/// Host console sink
pub struct ConsoleSink {
    host: Arc<dyn Host>,
    level: LogLevel,
    chunk_size: usize,
}

impl ConsoleSink {
    pub fn new(host: Arc<dyn Host>, level: LogLevel, chunk_size: usize) -> Self {
        Self {
            host,
            level,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Log `buf` one line at a time, splitting long lines into host-sized
    /// messages. Empty lines produce no message. Always consumes all of `buf`.
    pub fn write(&self, buf: &[u8], site: CallSite) -> usize {
        let source = format!("{}:{}", site.file(), site.line());
        for line in buf.split(|b| *b == b'\n') {
            for chunk in line.chunks(self.chunk_size) {
                self.host
                    .log(self.level, &source, &String::from_utf8_lossy(chunk));
            }
        }
        buf.len()
    }
}

/// Non-cryptographic random device
pub struct RandomSource {
    rng: Mutex<SmallRng>,
}

impl RandomSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    pub fn fill(&self, buf: &mut [u8]) -> usize {
        lock(&self.rng).fill_bytes(buf);
        buf.len()
    }
}

/// Read-only bytes with a cursor
pub struct StaticBuffer {
    data: Arc<[u8]>,
    cursor: Mutex<usize>,
}

impl StaticBuffer {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            data: data.into(),
            cursor: Mutex::new(0),
        }
    }

    /// Returns 0 once the cursor reaches the end
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut cursor = lock(&self.cursor);
        let n = self.pread(buf, *cursor as u64);
        *cursor += n;
        n
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64) -> usize {
        let start = read_offset(offset).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        n
    }

    pub fn seek(&self, pos: SeekFrom) -> SyscallResult<u64> {
        let mut cursor = lock(&self.cursor);
        *cursor = seek_target(pos, *cursor, self.data.len())?;
        Ok(*cursor as u64)
    }
}

/// Backing store of a temp file, shared by every handle opened on its path
pub struct SharedBuffer {
    path: String,
    bytes: Mutex<Vec<u8>>,
}

impl SharedBuffer {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            bytes: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn len(&self) -> usize {
        lock(&self.bytes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn truncate(&self) {
        lock(&self.bytes).clear();
    }

    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let bytes = lock(&self.bytes);
        let start = offset.min(bytes.len());
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        n
    }

    /// Copy `buf` in at `offset`, growing the store to fit. The store
    /// never grows past `MAX_FILE_SIZE`.
    fn write_at(&self, buf: &[u8], offset: usize) -> SyscallResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or(SyscallError::InvalidArgument("write past maximum file size"))?;
        let mut bytes = lock(&self.bytes);
        if end > bytes.len() {
            bytes.resize(end, 0);
            debug!(path = %self.path, len = end, "temp file grew");
        }
        bytes[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}

/// One open handle on a temp file
pub struct GrowableBuffer {
    data: Arc<SharedBuffer>,
    cursor: Mutex<usize>,
    readable: bool,
    writable: bool,
    append: bool,
    closed: AtomicBool,
}

impl GrowableBuffer {
    /// A handle with the access mode of `flags`
    pub fn new(data: Arc<SharedBuffer>, flags: OpenFlags) -> Self {
        Self {
            data,
            cursor: Mutex::new(0),
            readable: flags.read,
            writable: flags.write,
            append: flags.append,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> SyscallResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyscallError::InvalidState("file is closed"));
        }
        Ok(())
    }

    fn check_readable(&self) -> SyscallResult<()> {
        self.check_open()?;
        if !self.readable {
            return Err(SyscallError::NotOpenFor("reading"));
        }
        Ok(())
    }

    fn check_writable(&self) -> SyscallResult<()> {
        self.check_open()?;
        if !self.writable {
            return Err(SyscallError::NotOpenFor("writing"));
        }
        Ok(())
    }

    pub fn stat(&self) -> SyscallResult<FileStat> {
        self.check_open()?;
        Ok(FileStat::new(FileKind::Regular, self.data.len() as u64))
    }

    pub fn read(&self, buf: &mut [u8]) -> SyscallResult<usize> {
        self.check_readable()?;
        let mut cursor = lock(&self.cursor);
        let n = self.data.read_at(buf, *cursor);
        *cursor += n;
        Ok(n)
    }

    pub fn write(&self, buf: &[u8]) -> SyscallResult<usize> {
        self.check_writable()?;
        let mut cursor = lock(&self.cursor);
        if self.append {
            *cursor = self.data.len();
        }
        let n = self.data.write_at(buf, *cursor)?;
        *cursor += n;
        Ok(n)
    }

    pub fn seek(&self, pos: SeekFrom) -> SyscallResult<u64> {
        self.check_open()?;
        let mut cursor = lock(&self.cursor);
        *cursor = seek_target(pos, *cursor, self.data.len())?;
        Ok(*cursor as u64)
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64) -> SyscallResult<usize> {
        self.check_readable()?;
        Ok(self.data.read_at(buf, read_offset(offset)))
    }

    pub fn pwrite(&self, buf: &[u8], offset: u64) -> SyscallResult<usize> {
        self.check_writable()?;
        let offset = usize::try_from(offset)
            .map_err(|_| SyscallError::InvalidArgument("write past maximum file size"))?;
        self.data.write_at(buf, offset)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
