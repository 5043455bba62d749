//! Broker error taxonomy
//!
//! Every pipeline-level failure ends up as a POSIX-style error code in a
//! response message, so each variant knows its `errno` value.

use crate::daemon::registry::SocketState;
use thiserror::Error;

/// Errors raised by the socket broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RsktError {
    /// Socket number already bound, listening or connected
    #[error("socket number {0} already in use")]
    AddressInUse(u16),

    /// Dynamic socket number range exhausted
    #[error("no free dynamic socket number")]
    AddressNotAvailable,

    /// Socket is not listening, or an accept is already outstanding
    #[error("connection refused on socket {0}")]
    ConnectionRefused(u16),

    /// Socket number is not open (or not owned by the caller)
    #[error("socket number {0} is not open")]
    BadSocket(u16),

    /// Operation not valid for the socket's current state
    #[error("socket {sn} is {state:?}, operation not permitted")]
    InvalidState { sn: u16, state: SocketState },

    /// Malformed request (socket number 0, zero backlog, ...)
    #[error("invalid argument")]
    InvalidArgument,

    /// No free memory space for the data path
    #[error("no free memory space")]
    NoMemorySpace,

    /// No worker peer to the destination component tag
    #[error("component tag {0:#x} is unreachable")]
    NetworkUnreachable(u32),

    /// Peer or application went away while the request was in flight
    #[error("connection reset")]
    ConnectionReset,
}

impl RsktError {
    /// POSIX error code reported on the wire
    pub fn errno(&self) -> i32 {
        match self {
            RsktError::AddressInUse(_) => libc::EADDRINUSE,
            RsktError::AddressNotAvailable => libc::EADDRNOTAVAIL,
            RsktError::ConnectionRefused(_) => libc::ECONNREFUSED,
            RsktError::BadSocket(_) => libc::EBADF,
            RsktError::InvalidState { .. } => libc::EINVAL,
            RsktError::InvalidArgument => libc::EINVAL,
            RsktError::NoMemorySpace => libc::ENOMEM,
            RsktError::NetworkUnreachable(_) => libc::ENETUNREACH,
            RsktError::ConnectionReset => libc::ECONNRESET,
        }
    }
}

/// Collapse a unit result into the error code carried by responses
pub fn errno_of(result: Result<(), RsktError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(RsktError::AddressInUse(10).errno(), libc::EADDRINUSE);
        assert_eq!(RsktError::ConnectionRefused(10).errno(), libc::ECONNREFUSED);
        assert_eq!(RsktError::NoMemorySpace.errno(), libc::ENOMEM);
        assert_eq!(RsktError::NetworkUnreachable(0x20).errno(), libc::ENETUNREACH);
        assert_eq!(errno_of(Ok(())), 0);
        assert_eq!(errno_of(Err(RsktError::ConnectionReset)), libc::ECONNRESET);
    }

    #[test]
    fn test_error_display() {
        let err = RsktError::InvalidState { sn: 7, state: SocketState::Connected };
        assert!(err.to_string().contains("socket 7"));
        assert!(RsktError::NetworkUnreachable(0x20).to_string().contains("0x20"));
    }
}
