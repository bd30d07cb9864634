use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("bad descriptor")]
    ErrBadDescriptor,
    #[error("invalid argument")]
    ErrInvalidArgument,
    #[error("address string is not parseable")]
    ErrAddressParse,
    #[error("address family not supported")]
    ErrFamilyUnsupported,
    #[error("path name too long")]
    ErrNameTooLong,
    #[error("too many addresses")]
    ErrTooManyAddresses,

    #[error("resource temporarily unavailable")]
    ErrAgain,
    #[error("operation now in progress")]
    ErrInProgress,
    #[error("out of memory")]
    ErrOutOfMemory,
    #[error("descriptor table is full")]
    ErrTableFull,

    #[error("socket is not connected")]
    ErrNotConnected,
    #[error("socket is already connected")]
    ErrIsConnected,
    #[error("destination address required")]
    ErrDestinationRequired,
    #[error("connection aborted by peer")]
    ErrConnectionAborted,
    #[error("association has been shut down")]
    ErrShutdown,
    #[error("broken pipe")]
    ErrBrokenPipe,
    #[error("operation not supported on this socket")]
    ErrOpNotSupported,

    #[error("address already in use")]
    ErrAddressInUse,
    #[error("address not available")]
    ErrAddressNotAvailable,
    #[error("permission denied")]
    ErrPermissionDenied,
    #[error("SCTP engine is not available")]
    ErrEngineUnavailable,
    #[error("protocol not supported")]
    ErrProtocolUnavailable,

    #[error("input/output error")]
    ErrIo,

    #[error("raw is too small for a common packet header")]
    ErrPacketHeaderTooSmall,
    #[error("packet checksum mismatch")]
    ErrChecksumMismatch,
    #[error("chunk has invalid length")]
    ErrChunkInvalidLength,
    #[error("unknown chunk type")]
    ErrUnknownChunkType,

    #[error("os error {0}")]
    Os(i32),
}

impl Error {
    /// Positive errno value for the BSD-style API surface. Callers that
    /// need the C convention return `-1` and store this in `errno`.
    pub fn errno(&self) -> i32 {
        match self {
            Error::ErrBadDescriptor => libc::EBADF,
            Error::ErrInvalidArgument
            | Error::ErrAddressParse
            | Error::ErrFamilyUnsupported
            | Error::ErrTooManyAddresses => libc::EINVAL,
            Error::ErrNameTooLong => libc::ENAMETOOLONG,
            Error::ErrAgain => libc::EAGAIN,
            Error::ErrInProgress => libc::EINPROGRESS,
            Error::ErrOutOfMemory | Error::ErrTableFull => libc::ENOMEM,
            Error::ErrNotConnected => libc::ENOTCONN,
            Error::ErrIsConnected => libc::EISCONN,
            Error::ErrDestinationRequired => libc::EDESTADDRREQ,
            Error::ErrConnectionAborted => libc::ECONNABORTED,
            Error::ErrShutdown => libc::ESHUTDOWN,
            Error::ErrBrokenPipe => libc::EPIPE,
            Error::ErrOpNotSupported => libc::EOPNOTSUPP,
            Error::ErrAddressInUse => libc::EADDRINUSE,
            Error::ErrAddressNotAvailable => libc::EADDRNOTAVAIL,
            Error::ErrPermissionDenied => libc::EACCES,
            Error::ErrEngineUnavailable => libc::ENXIO,
            Error::ErrProtocolUnavailable => libc::EPROTONOSUPPORT,
            Error::ErrIo
            | Error::ErrPacketHeaderTooSmall
            | Error::ErrChecksumMismatch
            | Error::ErrChunkInvalidLength
            | Error::ErrUnknownChunkType => libc::EIO,
            Error::Os(errno) => *errno,
        }
    }

    /// Maps a positive errno back onto the matching error kind. Used when a
    /// System descriptor call is delegated one-to-one to the host OS.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EBADF => Error::ErrBadDescriptor,
            libc::EINVAL => Error::ErrInvalidArgument,
            libc::EAGAIN => Error::ErrAgain,
            libc::EINPROGRESS => Error::ErrInProgress,
            libc::ENOMEM => Error::ErrOutOfMemory,
            libc::ENOTCONN => Error::ErrNotConnected,
            libc::EISCONN => Error::ErrIsConnected,
            libc::ECONNABORTED => Error::ErrConnectionAborted,
            libc::ESHUTDOWN => Error::ErrShutdown,
            libc::EPIPE => Error::ErrBrokenPipe,
            libc::EOPNOTSUPP => Error::ErrOpNotSupported,
            libc::EADDRINUSE => Error::ErrAddressInUse,
            libc::EADDRNOTAVAIL => Error::ErrAddressNotAvailable,
            libc::EACCES => Error::ErrPermissionDenied,
            other => Error::Os(other),
        }
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            e @ Error::ErrShutdown => io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string()),
            e @ Error::ErrConnectionAborted => {
                io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string())
            }
            e @ Error::ErrAgain => io::Error::new(io::ErrorKind::WouldBlock, e.to_string()),
            e => io::Error::new(io::ErrorKind::Other, e.to_string()),
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        match error.raw_os_error() {
            Some(errno) => Error::from_errno(errno),
            None => Error::ErrIo,
        }
    }
}
