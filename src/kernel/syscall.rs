//! System call interface
//!
//! This is the boundary between application code and the bridge:
//! - `Syscalls` is the full POSIX-style surface. Every method has a default
//!   body that fails with `Unimplemented`, so a test double only overrides
//!   what it needs.
//! - `BridgeSyscalls` is the real implementation over the descriptor table,
//!   the virtual filesystem, the environment and the host.
//! - `Dispatch` forwards each call to whichever implementation is
//!   installed. Calls made before installation fail with `NotInstalled`;
//!   `wait_ready` blocks until something is installed.

use super::env::Environment;
use super::error::{SyscallError, SyscallResult};
use super::fd::{DescriptorTable, Fd, OpenFlags};
use super::file::{CallSite, ConsoleSink, File, FileStat};
use super::net::{self, NetSocket, SOCK_DGRAM, SOCK_STREAM, SockAddr};
use crate::config::BridgeConfig;
use crate::lock;
use crate::platform::{Host, Protocol};
use crate::vfs::Overlay;
use std::io::SeekFrom;
use std::panic::Location;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// There is exactly one process
pub const PID: u32 = 1234;

fn unimplemented<T>(op: &'static str) -> SyscallResult<T> {
    Err(SyscallError::Unimplemented { op })
}

/// The syscall surface
pub trait Syscalls: Send + Sync {
    // ========== FILES ==========

    fn open(&self, _path: &str, _flags: OpenFlags) -> SyscallResult<Fd> {
        unimplemented("open")
    }

    fn close(&self, _fd: Fd) -> SyscallResult<()> {
        unimplemented("close")
    }

    fn read(&self, _fd: Fd, _buf: &mut [u8]) -> SyscallResult<usize> {
        unimplemented("read")
    }

    fn write(&self, _fd: Fd, _buf: &[u8], _site: CallSite) -> SyscallResult<usize> {
        unimplemented("write")
    }

    fn seek(&self, _fd: Fd, _pos: SeekFrom) -> SyscallResult<u64> {
        unimplemented("seek")
    }

    fn pread(&self, _fd: Fd, _buf: &mut [u8], _offset: u64) -> SyscallResult<usize> {
        unimplemented("pread")
    }

    fn pwrite(&self, _fd: Fd, _buf: &[u8], _offset: u64) -> SyscallResult<usize> {
        unimplemented("pwrite")
    }

    fn fstat(&self, _fd: Fd) -> SyscallResult<FileStat> {
        unimplemented("fstat")
    }

    fn fsync(&self, _fd: Fd) -> SyscallResult<()> {
        unimplemented("fsync")
    }

    fn dup(&self, _fd: Fd) -> SyscallResult<Fd> {
        unimplemented("dup")
    }

    fn dup2(&self, _fd: Fd, _newfd: Fd) -> SyscallResult<Fd> {
        unimplemented("dup2")
    }

    // ========== PATHS ==========

    fn stat(&self, _path: &str) -> SyscallResult<FileStat> {
        unimplemented("stat")
    }

    fn mkdir(&self, _path: &str) -> SyscallResult<()> {
        unimplemented("mkdir")
    }

    fn rmdir(&self, _path: &str) -> SyscallResult<()> {
        unimplemented("rmdir")
    }

    fn symlink(&self, _oldpath: &str, _newpath: &str) -> SyscallResult<()> {
        unimplemented("symlink")
    }

    fn unlink(&self, _path: &str) -> SyscallResult<()> {
        unimplemented("unlink")
    }

    fn readlink(&self, _path: &str) -> SyscallResult<String> {
        unimplemented("readlink")
    }

    fn chdir(&self, _path: &str) -> SyscallResult<()> {
        unimplemented("chdir")
    }

    fn getcwd(&self) -> SyscallResult<String> {
        unimplemented("getcwd")
    }

    fn chmod(&self, _path: &str, _mode: u32) -> SyscallResult<()> {
        unimplemented("chmod")
    }

    fn chown(&self, _path: &str, _uid: u32, _gid: u32) -> SyscallResult<()> {
        unimplemented("chown")
    }

    fn rename(&self, _from: &str, _to: &str) -> SyscallResult<()> {
        unimplemented("rename")
    }

    fn link(&self, _oldpath: &str, _newpath: &str) -> SyscallResult<()> {
        unimplemented("link")
    }

    fn truncate(&self, _path: &str, _len: u64) -> SyscallResult<()> {
        unimplemented("truncate")
    }

    fn pipe(&self) -> SyscallResult<(Fd, Fd)> {
        unimplemented("pipe")
    }

    // ========== PROCESS ==========

    fn getenv(&self, _key: &str) -> SyscallResult<Option<String>> {
        unimplemented("getenv")
    }

    fn setenv(&self, _key: &str, _value: &str) -> SyscallResult<()> {
        unimplemented("setenv")
    }

    fn unsetenv(&self, _key: &str) -> SyscallResult<()> {
        unimplemented("unsetenv")
    }

    fn environ(&self) -> SyscallResult<Vec<String>> {
        unimplemented("environ")
    }

    fn getpid(&self) -> SyscallResult<u32> {
        unimplemented("getpid")
    }

    fn kill(&self, _pid: u32, _signal: i32) -> SyscallResult<()> {
        unimplemented("kill")
    }

    // ========== SOCKETS ==========

    fn socket(&self, _domain: i32, _ty: i32, _proto: i32) -> SyscallResult<Fd> {
        unimplemented("socket")
    }

    fn bind(&self, _fd: Fd, _addr: &SockAddr) -> SyscallResult<()> {
        unimplemented("bind")
    }

    fn listen(&self, _fd: Fd, _backlog: i32) -> SyscallResult<()> {
        unimplemented("listen")
    }

    fn accept(&self, _fd: Fd) -> SyscallResult<(Fd, SockAddr)> {
        unimplemented("accept")
    }

    fn connect(&self, _fd: Fd, _addr: &SockAddr) -> SyscallResult<()> {
        unimplemented("connect")
    }

    fn getsockname(&self, _fd: Fd) -> SyscallResult<SockAddr> {
        unimplemented("getsockname")
    }

    fn getpeername(&self, _fd: Fd) -> SyscallResult<SockAddr> {
        unimplemented("getpeername")
    }

    fn set_deadline(&self, _fd: Fd, _deadline: Option<Instant>) -> SyscallResult<()> {
        unimplemented("set_deadline")
    }

    fn set_read_deadline(&self, _fd: Fd, _deadline: Option<Instant>) -> SyscallResult<()> {
        unimplemented("set_read_deadline")
    }

    fn set_write_deadline(&self, _fd: Fd, _deadline: Option<Instant>) -> SyscallResult<()> {
        unimplemented("set_write_deadline")
    }

    fn stop_io(&self, _fd: Fd) -> SyscallResult<()> {
        unimplemented("stop_io")
    }

    fn sendto(&self, _fd: Fd, _buf: &[u8], _addr: &SockAddr) -> SyscallResult<usize> {
        unimplemented("sendto")
    }

    fn recvfrom(&self, _fd: Fd, _buf: &mut [u8]) -> SyscallResult<(usize, SockAddr)> {
        unimplemented("recvfrom")
    }

    /// `host:port` for a network such as `tcp` or `udp6`
    fn resolve(&self, _network: &str, _address: &str) -> SyscallResult<SockAddr> {
        unimplemented("resolve")
    }

    /// Resolve, then open a socket connected to the first address
    fn dial(&self, _network: &str, _address: &str) -> SyscallResult<Fd> {
        unimplemented("dial")
    }
}

/// The real syscall implementation
pub struct BridgeSyscalls {
    host: Arc<dyn Host>,
    config: BridgeConfig,
    files: DescriptorTable,
    fs: Overlay,
    env: Environment,
}

impl BridgeSyscalls {
    /// Build the implementation with stdin, stdout and stderr installed
    pub fn new(host: Arc<dyn Host>, config: BridgeConfig) -> Self {
        let files = DescriptorTable::new();
        files.allocate(File::Unsupported);
        files.allocate(File::Console(ConsoleSink::new(
            Arc::clone(&host),
            config.stdout_level,
            config.log_chunk_size,
        )));
        files.allocate(File::Console(ConsoleSink::new(
            Arc::clone(&host),
            config.stderr_level,
            config.log_chunk_size,
        )));

        Self {
            fs: Overlay::new(&config.known_dirs, config.seed()),
            env: Environment::new(&config.tmp_dir, &config.tolerated_env_keys),
            host,
            config,
            files,
        }
    }

    pub fn files(&self) -> &DescriptorTable {
        &self.files
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Temp-file prefix: `TMPDIR`, or the configured directory if unset
    fn tmp_dir(&self) -> String {
        self.env
            .tmp_dir()
            .unwrap_or_else(|| self.config.tmp_dir.clone())
    }

    fn with_socket<T>(
        &self,
        fd: Fd,
        f: impl FnOnce(&NetSocket) -> SyscallResult<T>,
    ) -> SyscallResult<T> {
        let file = self.files.lookup(fd)?;
        let socket = file.as_socket().ok_or(SyscallError::NotSocket(fd.0))?;
        f(socket)
    }
}

impl Syscalls for BridgeSyscalls {
    fn open(&self, path: &str, flags: OpenFlags) -> SyscallResult<Fd> {
        let file = self.fs.open(path, flags, &self.tmp_dir())?;
        Ok(self.files.allocate(file))
    }

    fn close(&self, fd: Fd) -> SyscallResult<()> {
        self.files.release(fd)
    }

    fn read(&self, fd: Fd, buf: &mut [u8]) -> SyscallResult<usize> {
        self.files.lookup(fd)?.read(buf)
    }

    fn write(&self, fd: Fd, buf: &[u8], site: CallSite) -> SyscallResult<usize> {
        self.files.lookup(fd)?.write(buf, site)
    }

    fn seek(&self, fd: Fd, pos: SeekFrom) -> SyscallResult<u64> {
        self.files.lookup(fd)?.seek(pos)
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> SyscallResult<usize> {
        self.files.lookup(fd)?.pread(buf, offset)
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64) -> SyscallResult<usize> {
        self.files.lookup(fd)?.pwrite(buf, offset)
    }

    fn fstat(&self, fd: Fd) -> SyscallResult<FileStat> {
        self.files.lookup(fd)?.stat()
    }

    /// Everything lives in memory
    fn fsync(&self, fd: Fd) -> SyscallResult<()> {
        self.files.lookup(fd).map(|_| ())
    }

    fn dup(&self, fd: Fd) -> SyscallResult<Fd> {
        self.files.dup(fd)
    }

    fn dup2(&self, fd: Fd, newfd: Fd) -> SyscallResult<Fd> {
        self.files.dup2(fd, newfd)
    }

    fn stat(&self, path: &str) -> SyscallResult<FileStat> {
        self.fs.stat(path, &self.tmp_dir())
    }

    fn mkdir(&self, path: &str) -> SyscallResult<()> {
        self.fs.mkdir(path, &self.tmp_dir())
    }

    fn rmdir(&self, path: &str) -> SyscallResult<()> {
        self.fs.rmdir(path, &self.tmp_dir())
    }

    fn symlink(&self, oldpath: &str, newpath: &str) -> SyscallResult<()> {
        self.fs.symlink(oldpath, newpath);
        Ok(())
    }

    fn unlink(&self, path: &str) -> SyscallResult<()> {
        self.fs.unlink(path)
    }

    fn readlink(&self, path: &str) -> SyscallResult<String> {
        self.fs.readlink(path)
    }

    fn getenv(&self, key: &str) -> SyscallResult<Option<String>> {
        Ok(self.env.getenv(key))
    }

    fn setenv(&self, key: &str, value: &str) -> SyscallResult<()> {
        if key.is_empty() || key.contains('=') {
            return Err(SyscallError::InvalidArgument("environment key"));
        }
        self.env.setenv(key, value);
        Ok(())
    }

    fn unsetenv(&self, key: &str) -> SyscallResult<()> {
        self.env.unsetenv(key);
        Ok(())
    }

    fn environ(&self) -> SyscallResult<Vec<String>> {
        Ok(self.env.environ())
    }

    fn getpid(&self) -> SyscallResult<u32> {
        Ok(PID)
    }

    fn socket(&self, domain: i32, ty: i32, proto: i32) -> SyscallResult<Fd> {
        let socket = NetSocket::new(Arc::clone(&self.host), domain, ty, proto)?;
        Ok(self.files.allocate(File::Socket(socket)))
    }

    fn bind(&self, fd: Fd, addr: &SockAddr) -> SyscallResult<()> {
        self.with_socket(fd, |s| s.bind(addr))
    }

    fn listen(&self, fd: Fd, backlog: i32) -> SyscallResult<()> {
        self.with_socket(fd, |s| s.listen(backlog))
    }

    fn accept(&self, fd: Fd) -> SyscallResult<(Fd, SockAddr)> {
        let (socket, peer) = self.with_socket(fd, |s| s.accept())?;
        Ok((self.files.allocate(File::Socket(socket)), peer))
    }

    fn connect(&self, fd: Fd, addr: &SockAddr) -> SyscallResult<()> {
        self.with_socket(fd, |s| s.connect(addr))
    }

    fn getsockname(&self, fd: Fd) -> SyscallResult<SockAddr> {
        self.with_socket(fd, |s| s.getsockname())
    }

    fn getpeername(&self, fd: Fd) -> SyscallResult<SockAddr> {
        self.with_socket(fd, |s| s.getpeername())
    }

    fn set_deadline(&self, fd: Fd, deadline: Option<Instant>) -> SyscallResult<()> {
        self.with_socket(fd, |s| s.set_deadline(deadline))
    }

    fn set_read_deadline(&self, fd: Fd, deadline: Option<Instant>) -> SyscallResult<()> {
        self.with_socket(fd, |s| s.set_read_deadline(deadline))
    }

    fn set_write_deadline(&self, fd: Fd, deadline: Option<Instant>) -> SyscallResult<()> {
        self.with_socket(fd, |s| s.set_write_deadline(deadline))
    }

    fn stop_io(&self, fd: Fd) -> SyscallResult<()> {
        self.with_socket(fd, |s| {
            s.stop_io();
            Ok(())
        })
    }

    fn sendto(&self, fd: Fd, buf: &[u8], addr: &SockAddr) -> SyscallResult<usize> {
        self.with_socket(fd, |s| s.sendto(buf, addr))
    }

    fn recvfrom(&self, fd: Fd, buf: &mut [u8]) -> SyscallResult<(usize, SockAddr)> {
        self.with_socket(fd, |s| s.recvfrom(buf))
    }

    fn resolve(&self, network: &str, address: &str) -> SyscallResult<SockAddr> {
        net::resolve(&*self.host, network, address)
    }

    fn dial(&self, network: &str, address: &str) -> SyscallResult<Fd> {
        let (protocol, _) = net::parse_network(network)?;
        let addr = self.resolve(network, address)?;
        let ty = match protocol {
            Protocol::Tcp => SOCK_STREAM,
            Protocol::Udp => SOCK_DGRAM,
        };
        let fd = self.socket(addr.family(), ty, 0)?;
        if let Err(err) = self.with_socket(fd, |s| s.connect(&addr)) {
            let _ = self.files.release(fd);
            return Err(err);
        }
        debug!(network, address, %fd, "dial");
        Ok(fd)
    }
}

/// Forwards every call to the installed implementation
pub struct Dispatch {
    current: Mutex<Option<Arc<dyn Syscalls>>>,
    ready: Condvar,
    abort_on_fatal: bool,
}

impl Dispatch {
    pub fn new(abort_on_fatal: bool) -> Self {
        Self {
            current: Mutex::new(None),
            ready: Condvar::new(),
            abort_on_fatal,
        }
    }

    /// Install `imp` and wake everyone in `wait_ready`
    pub fn install(&self, imp: Arc<dyn Syscalls>) {
        let mut current = lock(&self.current);
        if current.is_some() {
            debug!("replacing installed syscall implementation");
        }
        *current = Some(imp);
        self.ready.notify_all();
    }

    pub fn is_installed(&self) -> bool {
        lock(&self.current).is_some()
    }

    /// The installed implementation, without blocking
    pub fn try_current(&self) -> SyscallResult<Arc<dyn Syscalls>> {
        lock(&self.current).clone().ok_or(SyscallError::NotInstalled)
    }

    /// Block until an implementation is installed
    pub fn wait_ready(&self) -> Arc<dyn Syscalls> {
        let mut current = lock(&self.current);
        loop {
            if let Some(imp) = current.as_ref() {
                return Arc::clone(imp);
            }
            current = self
                .ready
                .wait(current)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Like `wait_ready`, giving up with `NotInstalled` after `timeout`
    pub fn wait_ready_timeout(&self, timeout: Duration) -> SyscallResult<Arc<dyn Syscalls>> {
        let current = lock(&self.current);
        let (current, _) = self
            .ready
            .wait_timeout_while(current, timeout, |c| c.is_none())
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        current.clone().ok_or(SyscallError::NotInstalled)
    }

    fn check<T>(&self, result: SyscallResult<T>) -> SyscallResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                error!(%err, "fatal syscall error");
                if self.abort_on_fatal {
                    panic!("fatal syscall error: {}", err);
                }
            }
        }
        result
    }

    pub fn open(&self, path: &str, flags: OpenFlags) -> SyscallResult<Fd> {
        self.check(self.try_current()?.open(path, flags))
    }

    pub fn close(&self, fd: Fd) -> SyscallResult<()> {
        self.check(self.try_current()?.close(fd))
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> SyscallResult<usize> {
        self.check(self.try_current()?.read(fd, buf))
    }

    /// Console writes are attributed to the caller's source location
    #[track_caller]
    pub fn write(&self, fd: Fd, buf: &[u8]) -> SyscallResult<usize> {
        let site = Location::caller();
        self.check(self.try_current()?.write(fd, buf, site))
    }

    pub fn seek(&self, fd: Fd, pos: SeekFrom) -> SyscallResult<u64> {
        self.check(self.try_current()?.seek(fd, pos))
    }

    pub fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> SyscallResult<usize> {
        self.check(self.try_current()?.pread(fd, buf, offset))
    }

    pub fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64) -> SyscallResult<usize> {
        self.check(self.try_current()?.pwrite(fd, buf, offset))
    }

    pub fn fstat(&self, fd: Fd) -> SyscallResult<FileStat> {
        self.check(self.try_current()?.fstat(fd))
    }

    pub fn fsync(&self, fd: Fd) -> SyscallResult<()> {
        self.check(self.try_current()?.fsync(fd))
    }

    pub fn dup(&self, fd: Fd) -> SyscallResult<Fd> {
        self.check(self.try_current()?.dup(fd))
    }

    pub fn dup2(&self, fd: Fd, newfd: Fd) -> SyscallResult<Fd> {
        self.check(self.try_current()?.dup2(fd, newfd))
    }

    pub fn stat(&self, path: &str) -> SyscallResult<FileStat> {
        self.check(self.try_current()?.stat(path))
    }

    pub fn mkdir(&self, path: &str) -> SyscallResult<()> {
        self.check(self.try_current()?.mkdir(path))
    }

    pub fn rmdir(&self, path: &str) -> SyscallResult<()> {
        self.check(self.try_current()?.rmdir(path))
    }

    pub fn symlink(&self, oldpath: &str, newpath: &str) -> SyscallResult<()> {
        self.check(self.try_current()?.symlink(oldpath, newpath))
    }

    pub fn unlink(&self, path: &str) -> SyscallResult<()> {
        self.check(self.try_current()?.unlink(path))
    }

    pub fn readlink(&self, path: &str) -> SyscallResult<String> {
        self.check(self.try_current()?.readlink(path))
    }

    pub fn chdir(&self, path: &str) -> SyscallResult<()> {
        self.check(self.try_current()?.chdir(path))
    }

    pub fn getcwd(&self) -> SyscallResult<String> {
        self.check(self.try_current()?.getcwd())
    }

    pub fn chmod(&self, path: &str, mode: u32) -> SyscallResult<()> {
        self.check(self.try_current()?.chmod(path, mode))
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> SyscallResult<()> {
        self.check(self.try_current()?.chown(path, uid, gid))
    }

    pub fn rename(&self, from: &str, to: &str) -> SyscallResult<()> {
        self.check(self.try_current()?.rename(from, to))
    }

    pub fn link(&self, oldpath: &str, newpath: &str) -> SyscallResult<()> {
        self.check(self.try_current()?.link(oldpath, newpath))
    }

    pub fn truncate(&self, path: &str, len: u64) -> SyscallResult<()> {
        self.check(self.try_current()?.truncate(path, len))
    }

    pub fn pipe(&self) -> SyscallResult<(Fd, Fd)> {
        self.check(self.try_current()?.pipe())
    }

    pub fn getenv(&self, key: &str) -> SyscallResult<Option<String>> {
        self.check(self.try_current()?.getenv(key))
    }

    pub fn setenv(&self, key: &str, value: &str) -> SyscallResult<()> {
        self.check(self.try_current()?.setenv(key, value))
    }

    pub fn unsetenv(&self, key: &str) -> SyscallResult<()> {
        self.check(self.try_current()?.unsetenv(key))
    }

    pub fn environ(&self) -> SyscallResult<Vec<String>> {
        self.check(self.try_current()?.environ())
    }

    pub fn getpid(&self) -> SyscallResult<u32> {
        self.check(self.try_current()?.getpid())
    }

    pub fn kill(&self, pid: u32, signal: i32) -> SyscallResult<()> {
        self.check(self.try_current()?.kill(pid, signal))
    }

    pub fn socket(&self, domain: i32, ty: i32, proto: i32) -> SyscallResult<Fd> {
        self.check(self.try_current()?.socket(domain, ty, proto))
    }

    pub fn bind(&self, fd: Fd, addr: &SockAddr) -> SyscallResult<()> {
        self.check(self.try_current()?.bind(fd, addr))
    }

    pub fn listen(&self, fd: Fd, backlog: i32) -> SyscallResult<()> {
        self.check(self.try_current()?.listen(fd, backlog))
    }

    pub fn accept(&self, fd: Fd) -> SyscallResult<(Fd, SockAddr)> {
        self.check(self.try_current()?.accept(fd))
    }

    pub fn connect(&self, fd: Fd, addr: &SockAddr) -> SyscallResult<()> {
        self.check(self.try_current()?.connect(fd, addr))
    }

    pub fn getsockname(&self, fd: Fd) -> SyscallResult<SockAddr> {
        self.check(self.try_current()?.getsockname(fd))
    }

    pub fn getpeername(&self, fd: Fd) -> SyscallResult<SockAddr> {
        self.check(self.try_current()?.getpeername(fd))
    }

    pub fn set_deadline(&self, fd: Fd, deadline: Option<Instant>) -> SyscallResult<()> {
        self.check(self.try_current()?.set_deadline(fd, deadline))
    }

    pub fn set_read_deadline(&self, fd: Fd, deadline: Option<Instant>) -> SyscallResult<()> {
        self.check(self.try_current()?.set_read_deadline(fd, deadline))
    }

    pub fn set_write_deadline(&self, fd: Fd, deadline: Option<Instant>) -> SyscallResult<()> {
        self.check(self.try_current()?.set_write_deadline(fd, deadline))
    }

    pub fn stop_io(&self, fd: Fd) -> SyscallResult<()> {
        self.check(self.try_current()?.stop_io(fd))
    }

    pub fn sendto(&self, fd: Fd, buf: &[u8], addr: &SockAddr) -> SyscallResult<usize> {
        self.check(self.try_current()?.sendto(fd, buf, addr))
    }

    pub fn recvfrom(&self, fd: Fd, buf: &mut [u8]) -> SyscallResult<(usize, SockAddr)> {
        self.check(self.try_current()?.recvfrom(fd, buf))
    }

    pub fn resolve(&self, network: &str, address: &str) -> SyscallResult<SockAddr> {
        self.check(self.try_current()?.resolve(network, address))
    }

    pub fn dial(&self, network: &str, address: &str) -> SyscallResult<Fd> {
        self.check(self.try_current()?.dial(network, address))
    }
}

impl Default for Dispatch {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::error::ErrorKind;
    use crate::platform::LoopbackHost;
    use std::thread;

    fn bridge() -> (LoopbackHost, BridgeSyscalls) {
        let host = LoopbackHost::new();
        let config = BridgeConfig {
            random_seed: Some(1),
            ..BridgeConfig::default()
        };
        let imp = BridgeSyscalls::new(Arc::new(host.clone()), config);
        (host, imp)
    }

    /// Only knows its pid
    struct FakeSyscalls;

    impl Syscalls for FakeSyscalls {
        fn getpid(&self) -> SyscallResult<u32> {
            Ok(42)
        }
    }

    #[test]
    fn test_stdio_installed() {
        let (_host, imp) = bridge();
        assert_eq!(imp.files().len(), 3);
        assert!(imp.read(Fd::STDIN, &mut [0u8; 4]).is_err());
        assert_eq!(imp.open("/dev/urandom", OpenFlags::READ).unwrap(), Fd(3));
    }

    #[test]
    fn test_stdout_and_stderr_levels() {
        let (host, imp) = bridge();
        let site = Location::caller();
        imp.write(Fd::STDOUT, b"out\n", site).unwrap();
        imp.write(Fd::STDERR, b"err\n", site).unwrap();
        let logs = host.take_logs();
        assert_eq!(logs[0].level, crate::platform::LogLevel::Log);
        assert_eq!(logs[1].level, crate::platform::LogLevel::Warning);
    }

    #[test]
    fn test_tmpdir_follows_environment() {
        let (_host, imp) = bridge();
        imp.setenv("tmpdir", "/scratch").unwrap();
        assert!(imp.open("/scratch/a", OpenFlags::WRITE).is_ok());
        assert!(imp.open("/tmp/a", OpenFlags::WRITE).is_err());
        assert_eq!(imp.getenv("TMPDIR").unwrap().as_deref(), Some("/scratch"));
    }

    #[test]
    fn test_fsync_and_fstat() {
        let (_host, imp) = bridge();
        let fd = imp.open("/tmp/f", OpenFlags::WRITE).unwrap();
        imp.write(fd, b"12345", Location::caller()).unwrap();
        imp.fsync(fd).unwrap();
        assert_eq!(imp.fstat(fd).unwrap().size, 5);
        imp.close(fd).unwrap();
        assert_eq!(imp.fsync(fd), Err(SyscallError::BadFd(fd.0)));
    }

    #[test]
    fn test_socket_ops_on_plain_file() {
        let (_host, imp) = bridge();
        let fd = imp.open("/tmp/f", OpenFlags::WRITE).unwrap();
        assert_eq!(imp.listen(fd, 1), Err(SyscallError::NotSocket(fd.0)));
    }

    #[test]
    fn test_unimplemented_defaults() {
        let (_host, imp) = bridge();
        let err = imp.chdir("/").unwrap_err();
        assert_eq!(err, SyscallError::Unimplemented { op: "chdir" });
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(imp.pipe().is_err());
        assert_eq!(imp.getpid().unwrap(), PID);
    }

    #[test]
    fn test_setenv_rejects_bad_key() {
        let (_host, imp) = bridge();
        assert!(imp.setenv("A=B", "c").is_err());
        assert!(imp.setenv("", "c").is_err());
    }

    #[test]
    fn test_dispatch_not_installed() {
        let dispatch = Dispatch::default();
        assert!(!dispatch.is_installed());
        assert_eq!(dispatch.getpid(), Err(SyscallError::NotInstalled));
        assert!(dispatch.wait_ready_timeout(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_dispatch_swaps_implementation() {
        let dispatch = Dispatch::default();
        dispatch.install(Arc::new(FakeSyscalls));
        assert_eq!(dispatch.getpid().unwrap(), 42);
        assert_eq!(
            dispatch.open("/tmp/x", OpenFlags::READ),
            Err(SyscallError::Unimplemented { op: "open" })
        );

        let (_host, imp) = bridge();
        dispatch.install(Arc::new(imp));
        assert_eq!(dispatch.getpid().unwrap(), PID);
    }

    #[test]
    fn test_wait_ready_blocks_until_install() {
        let dispatch = Arc::new(Dispatch::default());
        let waiter = Arc::clone(&dispatch);
        let handle = thread::spawn(move || waiter.wait_ready().getpid());

        thread::sleep(Duration::from_millis(20));
        dispatch.install(Arc::new(FakeSyscalls));
        assert_eq!(handle.join().unwrap(), Ok(42));
    }

    #[test]
    #[should_panic(expected = "chmod() not implemented")]
    fn test_abort_on_fatal() {
        let dispatch = Dispatch::new(true);
        dispatch.install(Arc::new(FakeSyscalls));
        let _ = dispatch.chmod("/x", 0o644);
    }

    #[test]
    fn test_dial_by_name() {
        let (host, imp) = bridge();
        host.add_host("service.test", "127.0.0.1".parse().unwrap());
        let server = imp.socket(net::AF_INET, SOCK_STREAM, 0).unwrap();
        imp.bind(server, &SockAddr::inet4([127, 0, 0, 1], 7000)).unwrap();
        imp.listen(server, 1).unwrap();

        let client = imp.dial("tcp4", "service.test:7000").unwrap();
        assert_eq!(
            imp.getpeername(client).unwrap(),
            SockAddr::inet4([127, 0, 0, 1], 7000)
        );
        let (accepted, _) = imp.accept(server).unwrap();
        imp.write(client, b"hi", Location::caller()).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(imp.read(accepted, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn test_failed_dial_releases_descriptor() {
        let (_host, imp) = bridge();
        let before = imp.files().len();
        assert_eq!(
            imp.dial("tcp", "127.0.0.1:7001"),
            Err(SyscallError::Host(crate::platform::HostError::ConnectionRefused))
        );
        assert_eq!(imp.files().len(), before);
        assert!(matches!(
            imp.dial("sctp", "127.0.0.1:7001"),
            Err(SyscallError::MalformedAddress(_))
        ));
    }

    #[test]
    fn test_datagram_syscalls() {
        let (_host, imp) = bridge();
        let a = imp.socket(net::AF_INET, SOCK_DGRAM, 0).unwrap();
        let b = imp.socket(net::AF_INET, SOCK_DGRAM, 0).unwrap();
        let a_addr = imp.resolve("udp", "127.0.0.1:5300").unwrap();
        imp.bind(a, &a_addr).unwrap();
        imp.bind(b, &SockAddr::inet4([127, 0, 0, 1], 5301)).unwrap();

        // Claim a's port before anything is sent to it
        imp.sendto(a, b"", &SockAddr::inet4([127, 0, 0, 1], 9)).unwrap();
        imp.sendto(b, b"query", &a_addr).unwrap();
        let mut buf = [0u8; 8];
        let (n, from) = imp.recvfrom(a, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"query");
        assert_eq!(from, SockAddr::inet4([127, 0, 0, 1], 5301));

        let file = imp.open("/tmp/f", OpenFlags::WRITE).unwrap();
        assert_eq!(imp.recvfrom(file, &mut buf), Err(SyscallError::NotSocket(file.0)));
    }

    #[test]
    fn test_dispatch_write_records_call_site() {
        let (host, imp) = bridge();
        let dispatch = Dispatch::default();
        dispatch.install(Arc::new(imp));
        dispatch.write(Fd::STDOUT, b"hi").unwrap();
        let logs = host.take_logs();
        assert!(logs[0].source.contains("syscall.rs:"));
    }
}
