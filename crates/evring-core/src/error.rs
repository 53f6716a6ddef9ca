//! Error types for the evring reactor

use core::fmt;

/// Result type for reactor operations
pub type NetResult<T> = Result<T, NetError>;

/// Which multiplexer control operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOp {
    Add,
    Modify,
    Delete,
}

impl PollOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollOp::Add => "EPOLL_CTL_ADD",
            PollOp::Modify => "EPOLL_CTL_MOD",
            PollOp::Delete => "EPOLL_CTL_DEL",
        }
    }
}

/// Errors that can occur in reactor operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// A system call failed with the given errno
    Os { op: &'static str, errno: i32 },

    /// Registering interest with the multiplexer failed
    Register { op: PollOp, fd: i32, errno: i32 },

    /// Caller passed a value outside the accepted range
    InvalidArgument(&'static str),

    /// Signal number cannot be handled (out of range, SIGKILL, SIGSTOP)
    InvalidSignal(i32),

    /// Handle used after its event loop was dropped
    LoopClosed,

    /// A signal handler was requested on a loop with no signal service attached
    NoSignalService,
}

impl NetError {
    /// Capture `errno` from the last failed system call.
    pub fn last_os(op: &'static str) -> Self {
        NetError::Os { op, errno: last_errno() }
    }

    /// Raw OS error code, when there is one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            NetError::Os { errno, .. } | NetError::Register { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

/// `errno` of the calling thread.
#[inline]
pub fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Os { op, errno } => write!(
                f,
                "{} failed: errno={} ({})",
                op,
                errno,
                std::io::Error::from_raw_os_error(*errno)
            ),
            NetError::Register { op, fd, errno } => write!(
                f,
                "{} on fd {} failed: errno={} ({})",
                op.as_str(),
                fd,
                errno,
                std::io::Error::from_raw_os_error(*errno)
            ),
            NetError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            NetError::InvalidSignal(sig) => write!(f, "signal {} cannot be handled", sig),
            NetError::LoopClosed => write!(f, "event loop closed"),
            NetError::NoSignalService => write!(f, "no signal service attached to loop"),
        }
    }
}

impl std::error::Error for NetError {}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        NetError::Os { op: "io", errno: e.raw_os_error().unwrap_or(0) }
    }
}
