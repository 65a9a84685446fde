use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for every fallible operation in the runtime.
///
/// `WouldBlock` and `Interrupted` are transient and handled inside the
/// driver loops; the rest surface on operation callbacks or as `Error`
/// events on the session.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Error {
    #[error("operation would block")]
    WouldBlock,
    #[error("operation interrupted")]
    Interrupted,
    #[error("operation canceled")]
    Canceled,
    #[error("operation timed out")]
    Timeout,
    #[error("end of stream")]
    Eof,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset")]
    ConnectionReset,
    #[error("address in use")]
    AddressInUse,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("socket not open")]
    NotOpen,
    #[error("invalid argument")]
    Invalid,
    #[error("not implemented")]
    NotImplemented,
    #[error("os error {0}")]
    Unknown(i32),
}

impl Error {
    pub fn from_errno(code: i32) -> Self {
        match code {
            libc::EAGAIN => Error::WouldBlock,
            #[allow(unreachable_patterns)] // EWOULDBLOCK == EAGAIN on most targets
            libc::EWOULDBLOCK | libc::EINPROGRESS => Error::WouldBlock,
            libc::EINTR => Error::Interrupted,
            libc::ECANCELED => Error::Canceled,
            libc::ETIMEDOUT => Error::Timeout,
            libc::ECONNREFUSED => Error::ConnectionRefused,
            libc::ECONNRESET | libc::EPIPE | libc::ECONNABORTED => Error::ConnectionReset,
            libc::EADDRINUSE => Error::AddressInUse,
            libc::EHOSTUNREACH | libc::EHOSTDOWN => Error::HostUnreachable,
            libc::ENETUNREACH | libc::ENETDOWN | libc::ENETRESET => Error::NetworkUnreachable,
            libc::EBADF | libc::ENOTSOCK | libc::ENOTCONN => Error::NotOpen,
            libc::EINVAL | libc::EFAULT | libc::EAFNOSUPPORT | libc::EMSGSIZE => Error::Invalid,
            libc::ENOSYS | libc::EOPNOTSUPP => Error::NotImplemented,
            other => Error::Unknown(other),
        }
    }

    /// Classification of the most recent syscall failure on this thread.
    pub fn last_os_error() -> Self {
        match io::Error::last_os_error().raw_os_error() {
            Some(code) => Self::from_errno(code),
            None => Error::Unknown(0),
        }
    }

    /// True for conditions the driver loop absorbs rather than surfaces.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WouldBlock | Error::Interrupted)
    }

    /// True for conditions that poison the socket: all queued operations are
    /// failed and shutdown is initiated with origin `Destination`.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionRefused |
                Error::ConnectionReset |
                Error::HostUnreachable |
                Error::NetworkUnreachable |
                Error::Unknown(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            return Self::from_errno(code);
        }
        match err.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::Interrupted => Error::Interrupted,
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::UnexpectedEof => Error::Eof,
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => Error::ConnectionReset,
            io::ErrorKind::AddrInUse => Error::AddressInUse,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Error::Invalid,
            io::ErrorKind::Unsupported => Error::NotImplemented,
            _ => Error::Unknown(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::from_errno(libc::EAGAIN), Error::WouldBlock);
        assert_eq!(Error::from_errno(libc::EINPROGRESS), Error::WouldBlock);
        assert_eq!(Error::from_errno(libc::ECONNRESET), Error::ConnectionReset);
        assert_eq!(Error::from_errno(libc::EPIPE), Error::ConnectionReset);
        assert_eq!(Error::from_errno(libc::ENETDOWN), Error::NetworkUnreachable);
        assert_eq!(Error::from_errno(9999), Error::Unknown(9999));
    }

    #[test]
    fn transient_vs_fatal() {
        assert!(Error::WouldBlock.is_transient());
        assert!(Error::Interrupted.is_transient());
        assert!(!Error::Timeout.is_transient());
        assert!(Error::ConnectionReset.is_fatal());
        assert!(!Error::Canceled.is_fatal());
    }
}
