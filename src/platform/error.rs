//! Host result codes
//!
//! The host reports completion of every asynchronous operation as a signed
//! integer. Zero and positive values are success (positive values usually
//! carry a byte count); negative values are one of the fixed failure codes
//! below.

/// Result type for host operations
pub type HostResult<T> = Result<T, HostError>;

/// A decoded host failure code
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    #[error("generic failure")]
    Failed,
    #[error("aborted")]
    Aborted,
    #[error("bad argument")]
    BadArgument,
    #[error("bad resource")]
    BadResource,
    #[error("no interface")]
    NoInterface,
    #[error("no access")]
    NoAccess,
    #[error("no memory")]
    NoMemory,
    #[error("no space")]
    NoSpace,
    #[error("no quota")]
    NoQuota,
    #[error("in progress")]
    InProgress,
    #[error("not supported")]
    NotSupported,
    #[error("blocks main thread")]
    BlocksMainThread,
    #[error("file not found")]
    FileNotFound,
    #[error("file exists")]
    FileExists,
    #[error("file too big")]
    FileTooBig,
    #[error("file changed")]
    FileChanged,
    #[error("not a file")]
    NotAFile,
    #[error("timed out")]
    TimedOut,
    #[error("user cancel")]
    UserCancel,
    #[error("no user gesture")]
    NoUserGesture,
    #[error("context lost")]
    ContextLost,
    #[error("no message loop")]
    NoMessageLoop,
    #[error("wrong thread")]
    WrongThread,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection reset")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("connection timed out")]
    ConnectionTimedOut,
    #[error("address invalid")]
    AddressInvalid,
    #[error("address unreachable")]
    AddressUnreachable,
    #[error("address in use")]
    AddressInUse,
    #[error("message too big")]
    MessageTooBig,
    #[error("name not resolved")]
    NameNotResolved,
    #[error("unknown ppapi error {0}")]
    Unknown(i32),
    /// The host has no socket interface at all (a plain web page)
    #[error("host provides no socket access")]
    SocketsUnavailable,
}

/// (code, error) pairs for every known failure
const CODES: &[(i32, HostError)] = &[
    (-2, HostError::Failed),
    (-3, HostError::Aborted),
    (-4, HostError::BadArgument),
    (-5, HostError::BadResource),
    (-6, HostError::NoInterface),
    (-7, HostError::NoAccess),
    (-8, HostError::NoMemory),
    (-9, HostError::NoSpace),
    (-10, HostError::NoQuota),
    (-11, HostError::InProgress),
    (-12, HostError::NotSupported),
    (-13, HostError::BlocksMainThread),
    (-20, HostError::FileNotFound),
    (-21, HostError::FileExists),
    (-22, HostError::FileTooBig),
    (-23, HostError::FileChanged),
    (-24, HostError::NotAFile),
    (-30, HostError::TimedOut),
    (-40, HostError::UserCancel),
    (-41, HostError::NoUserGesture),
    (-50, HostError::ContextLost),
    (-51, HostError::NoMessageLoop),
    (-52, HostError::WrongThread),
    (-100, HostError::ConnectionClosed),
    (-101, HostError::ConnectionReset),
    (-102, HostError::ConnectionRefused),
    (-103, HostError::ConnectionAborted),
    (-104, HostError::ConnectionFailed),
    (-105, HostError::ConnectionTimedOut),
    (-106, HostError::AddressInvalid),
    (-107, HostError::AddressUnreachable),
    (-108, HostError::AddressInUse),
    (-109, HostError::MessageTooBig),
    (-110, HostError::NameNotResolved),
];

/// Completion code for success
pub const OK: i32 = 0;

impl HostError {
    /// Decode a failure code. Returns `None` for success codes.
    pub fn from_code(code: i32) -> Option<Self> {
        if code >= OK {
            return None;
        }
        Some(
            CODES
                .iter()
                .find(|(c, _)| *c == code)
                .map(|(_, e)| *e)
                .unwrap_or(HostError::Unknown(code)),
        )
    }

    /// The wire code for this error
    pub fn code(self) -> i32 {
        match self {
            HostError::Unknown(code) => code,
            HostError::SocketsUnavailable => HostError::NotSupported.code(),
            other => CODES
                .iter()
                .find(|(_, e)| *e == other)
                .map(|(c, _)| *c)
                .unwrap_or(-2),
        }
    }

    /// Interpret a completion code as a byte count or an error
    pub fn check(code: i32) -> HostResult<usize> {
        match Self::from_code(code) {
            Some(err) => Err(err),
            None => Ok(code as usize),
        }
    }

    /// Does this error mean the other side went away cleanly?
    pub fn is_end_of_stream(self) -> bool {
        matches!(self, HostError::Aborted | HostError::ConnectionClosed)
    }
}
