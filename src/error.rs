//! Error types for the transport protocol.
//!
//! This module defines the stable, textual error kinds used throughout the
//! crate. Numeric encoding is not part of the contract — callers match on
//! the enum variant, never on an integer value.

use std::fmt;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error kinds for the transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An argument was invalid, or the call was made on a destroyed or
    /// uninitialized object.
    InvalidParam,
    /// A pool or slab could not satisfy an allocation request.
    NoMemory,
    /// An I/O operation failed for a reason other than would-block.
    IoFailed,
    /// The requested item (frame, queue entry, ...) was not found.
    NotFound,
    /// The operation is not supported in the current configuration.
    NotSupported,
    /// A blocking operation exceeded its deadline.
    Timeout,
    /// The resource is temporarily busy (would-block at the send surface).
    Busy,
    /// A value exceeded its bound (fragment offset past buffer capacity, etc).
    Overflow,
    /// Data failed a structural or checksum check.
    Corrupted,
    /// The object was used before being initialized.
    Uninitialized,
    /// `init` was called a second time.
    AlreadyInit,
    /// The object exists but isn't ready for this operation yet.
    NotReady,
    /// CRC verification failed.
    Checksum,
    /// The session has ended.
    Disconnected,
    /// A generic network-layer failure.
    Network,
    /// Socket creation failed.
    SocketCreate,
    /// Socket bind failed.
    SocketBind,
    /// Socket send failed.
    SocketSend,
    /// Socket receive failed.
    SocketRecv,
    /// A provided address was invalid.
    AddrInvalid,
    /// The packet failed structural validation.
    PacketInvalid,
    /// The packet exceeds the configured MTU.
    PacketTooLarge,
    /// The frame failed structural validation.
    FrameInvalid,
    /// The frame is missing fragments.
    FrameIncomplete,
    /// A sequence number was out of the expected range.
    Sequence,
}

impl Error {
    /// Returns a human-readable description of the error.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Error::InvalidParam => "invalid parameter",
            Error::NoMemory => "out of memory",
            Error::IoFailed => "I/O operation failed",
            Error::NotFound => "not found",
            Error::NotSupported => "not supported",
            Error::Timeout => "operation timed out",
            Error::Busy => "resource busy",
            Error::Overflow => "overflow",
            Error::Corrupted => "data corrupted",
            Error::Uninitialized => "uninitialized",
            Error::AlreadyInit => "already initialized",
            Error::NotReady => "not ready",
            Error::Checksum => "checksum mismatch",
            Error::Disconnected => "disconnected",
            Error::Network => "network error",
            Error::SocketCreate => "socket creation failed",
            Error::SocketBind => "socket bind failed",
            Error::SocketSend => "socket send failed",
            Error::SocketRecv => "socket receive failed",
            Error::AddrInvalid => "invalid address",
            Error::PacketInvalid => "invalid packet",
            Error::PacketTooLarge => "packet too large",
            Error::FrameInvalid => "invalid frame",
            Error::FrameIncomplete => "incomplete frame",
            Error::Sequence => "sequence number out of range",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock => Error::Busy,
            std::io::ErrorKind::AddrNotAvailable | std::io::ErrorKind::InvalidInput => {
                Error::AddrInvalid
            }
            _ => Error::IoFailed,
        }
    }
}
