//! Syscall errors
//!
//! Every bridge operation returns `SyscallResult`. Errors fall into a small
//! set of kinds so callers can tell recoverable failures from usage
//! violations without matching on every variant:
//!
//! - `NotFound`, `AlreadyExists`, `InvalidState`, `Unsupported`,
//!   `MalformedInput`: caller mistakes or missing entries
//! - `Host`: a failure code reported by the host runtime
//! - `EndOfStream`: graceful closure of a connection or listener
//! - `Fatal`: calls that are deliberately not implemented, symlink cycles,
//!   a second instance

use crate::platform::HostError;
use std::io;

/// Result type for syscalls
pub type SyscallResult<T> = Result<T, SyscallError>;

/// Linux errno values reported by `SyscallError::errno`
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EBADF: i32 = 9;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
    pub const ENOSYS: i32 = 38;
    pub const ELOOP: i32 = 40;
    pub const ENOTSOCK: i32 = 88;
    pub const EMSGSIZE: i32 = 90;
    pub const EPROTONOSUPPORT: i32 = 93;
    pub const ESOCKTNOSUPPORT: i32 = 94;
    pub const EOPNOTSUPP: i32 = 95;
    pub const EADDRINUSE: i32 = 98;
    pub const EADDRNOTAVAIL: i32 = 99;
    pub const ENETDOWN: i32 = 100;
    pub const ECONNABORTED: i32 = 103;
    pub const ECONNRESET: i32 = 104;
    pub const ENOTCONN: i32 = 107;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECONNREFUSED: i32 = 111;
    pub const EHOSTUNREACH: i32 = 113;
}

/// Broad classification of a `SyscallError`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidState,
    Unsupported,
    MalformedInput,
    Host,
    EndOfStream,
    Fatal,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SyscallError {
    #[error("bad file descriptor {0}")]
    BadFd(u32),

    #[error("{0}: no such file or directory")]
    NotFound(String),

    #[error("{0}: file exists")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("{op}: operation not supported")]
    Unsupported { op: &'static str },

    #[error("deadlines not supported")]
    DeadlineUnsupported,

    #[error("protocol not supported")]
    ProtocolNotSupported,

    #[error("socket type not supported")]
    SocketTypeNotSupported,

    #[error("descriptor not open for {0}")]
    NotOpenFor(&'static str),

    #[error("descriptor {0} is not a socket")]
    NotSocket(u32),

    #[error("{0} is not a symlink")]
    NotSymlink(String),

    #[error("malformed address: {0}")]
    MalformedAddress(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("end of stream")]
    EndOfStream,

    #[error("host error: {0}")]
    Host(HostError),

    #[error("no syscall implementation installed")]
    NotInstalled,

    #[error("{op}() not implemented")]
    Unimplemented { op: &'static str },

    #[error("infinite loop in symlink {0}")]
    SymlinkCycle(String),

    #[error("only one instance may be created")]
    DuplicateInstance,
}

impl SyscallError {
    pub fn kind(&self) -> ErrorKind {
        use SyscallError::*;
        match self {
            BadFd(_) | NotFound(_) => ErrorKind::NotFound,
            AlreadyExists(_) => ErrorKind::AlreadyExists,
            InvalidState(_) | NotOpenFor(_) | NotSocket(_) | NotSymlink(_) | NotInstalled => {
                ErrorKind::InvalidState
            }
            Unsupported { .. }
            | DeadlineUnsupported
            | ProtocolNotSupported
            | SocketTypeNotSupported => ErrorKind::Unsupported,
            MalformedAddress(_) | InvalidArgument(_) | Config(_) => ErrorKind::MalformedInput,
            EndOfStream => ErrorKind::EndOfStream,
            Host(_) => ErrorKind::Host,
            Unimplemented { .. } | SymlinkCycle(_) | DuplicateInstance => ErrorKind::Fatal,
        }
    }

    /// Usage violations that are not meant to be recovered from
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// The errno a C caller would see
    pub fn errno(&self) -> i32 {
        use SyscallError::*;
        match self {
            BadFd(_) | NotOpenFor(_) => errno::EBADF,
            NotFound(_) => errno::ENOENT,
            AlreadyExists(_) => errno::EEXIST,
            InvalidState(_) => errno::EINVAL,
            Unsupported { .. } | Unimplemented { .. } => errno::ENOSYS,
            DeadlineUnsupported => errno::EOPNOTSUPP,
            ProtocolNotSupported => errno::EPROTONOSUPPORT,
            SocketTypeNotSupported => errno::ESOCKTNOSUPPORT,
            NotSocket(_) => errno::ENOTSOCK,
            NotSymlink(_) | MalformedAddress(_) | InvalidArgument(_) | Config(_) => errno::EINVAL,
            EndOfStream => errno::ECONNABORTED,
            NotInstalled => errno::EAGAIN,
            SymlinkCycle(_) => errno::ELOOP,
            DuplicateInstance => errno::EINVAL,
            Host(err) => host_errno(*err),
        }
    }
}

fn host_errno(err: HostError) -> i32 {
    match err {
        HostError::BadArgument => errno::EINVAL,
        HostError::NoAccess => errno::EACCES,
        HostError::NoMemory => errno::ENOMEM,
        HostError::NotSupported | HostError::NoInterface => errno::EOPNOTSUPP,
        HostError::FileNotFound => errno::ENOENT,
        HostError::FileExists => errno::EEXIST,
        HostError::TimedOut | HostError::ConnectionTimedOut => errno::ETIMEDOUT,
        HostError::ConnectionReset => errno::ECONNRESET,
        HostError::ConnectionRefused => errno::ECONNREFUSED,
        HostError::ConnectionAborted => errno::ECONNABORTED,
        HostError::ConnectionFailed => errno::ENOTCONN,
        HostError::AddressInvalid => errno::EADDRNOTAVAIL,
        HostError::AddressUnreachable => errno::EHOSTUNREACH,
        HostError::AddressInUse => errno::EADDRINUSE,
        HostError::MessageTooBig => errno::EMSGSIZE,
        HostError::SocketsUnavailable => errno::ENETDOWN,
        _ => errno::EIO,
    }
}

impl From<HostError> for SyscallError {
    fn from(err: HostError) -> Self {
        if err.is_end_of_stream() {
            SyscallError::EndOfStream
        } else {
            SyscallError::Host(err)
        }
    }
}

impl From<SyscallError> for io::Error {
    fn from(err: SyscallError) -> Self {
        let kind = match err.kind() {
            ErrorKind::NotFound => io::ErrorKind::NotFound,
            ErrorKind::AlreadyExists => io::ErrorKind::AlreadyExists,
            ErrorKind::InvalidState | ErrorKind::MalformedInput => io::ErrorKind::InvalidInput,
            ErrorKind::Unsupported => io::ErrorKind::Unsupported,
            ErrorKind::EndOfStream => io::ErrorKind::UnexpectedEof,
            ErrorKind::Host | ErrorKind::Fatal => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
