//! Error taxonomy for the SSH engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A call arrived while the controller was `Uninitialized`.
    #[error("controller is not initialized")]
    NotInitialized,

    /// A call arrived while the controller was `Suspended`.
    #[error("controller is suspended")]
    NotPermitted,

    /// Request payload too large, or an `rqid` outside the event range where
    /// one was required.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Allocation failure during probe or event ingest.
    #[error("out of memory")]
    OutOfMemory,

    /// Invalid SYN, CRC, TAIL, or frame type. Recoverable at the assembler;
    /// never surfaced past it.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Write failure, or a read timeout after the final retry.
    #[error("I/O failed: {0}")]
    IoFailed(#[from] std::io::Error),

    /// Response buffer capacity smaller than the received payload.
    #[error("response buffer too small: need {needed}, have {capacity}")]
    InvalidLength { needed: usize, capacity: usize },

    /// Non-zero one-byte status from an admin command. Logged as a warning;
    /// by convention the call itself still reports success to the caller.
    #[error("controller reported non-zero status 0x{0:02x}")]
    ControllerReportedError(u8),
}

pub type Result<T> = std::result::Result<T, Error>;
