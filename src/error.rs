use std::fmt::{self, Debug, Display};
use std::io;

/// A malformed or short frame on the wire.
#[derive(Debug)]
pub enum FrameError {
    /// The underlying transport returned fewer bytes than the frame header promised.
    ShortRead { expected: usize, got: usize },
    /// A write-class opcode returned an empty acknowledgement.
    EmptyAck,
}

impl Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::ShortRead { expected, got } => {
                write!(f, "short read: expected {} bytes, got {}", expected, got)
            }
            FrameError::EmptyAck => f.write_str("empty acknowledgement"),
        }
    }
}

/// The error type used by this crate.
///
/// Mirrors the device's own error model: no retries are ever attempted here,
/// the caller (a job plan) decides what to do with a failure.
pub enum ChisError {
    /// A frame could not be built or parsed.
    Frame(FrameError),

    /// A write-class opcode returned an acknowledgement other than the one
    /// it was required to return (only `programRom`'s `0xAA` is checked;
    /// see `protocol::ack`).
    Protocol { expected: u8, got: u8 },

    /// A read-back during verification didn't match what was written.
    Verify {
        offset: u64,
        expected: u8,
        got: u8,
    },

    /// A mapping of length != 8 was passed where the protocol requires
    /// exactly 8 bank entries. This is a programmer error, not a device
    /// fault.
    InvalidMapping(usize),

    /// The underlying serial transport failed (most likely a disconnect).
    Io(io::Error),
}

impl From<io::Error> for ChisError {
    fn from(e: io::Error) -> Self {
        ChisError::Io(e)
    }
}

impl From<FrameError> for ChisError {
    fn from(e: FrameError) -> Self {
        ChisError::Frame(e)
    }
}

impl Debug for ChisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChisError::Frame(e) => write!(f, "ChisError::Frame({:?})", e),
            ChisError::Protocol { expected, got } => write!(
                f,
                "ChisError::Protocol {{ expected: {:#04x}, got: {:#04x} }}",
                expected, got
            ),
            ChisError::Verify {
                offset,
                expected,
                got,
            } => write!(
                f,
                "ChisError::Verify {{ offset: {:#010x}, expected: {:#04x}, got: {:#04x} }}",
                offset, expected, got
            ),
            ChisError::InvalidMapping(len) => write!(f, "ChisError::InvalidMapping({})", len),
            ChisError::Io(e) => write!(f, "ChisError::Io({:?})", e),
        }
    }
}

impl Display for ChisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChisError::Frame(e) => write!(f, "frame error: {}", e),
            ChisError::Protocol { expected, got } => write!(
                f,
                "unexpected acknowledgement: expected {:#04x}, got {:#04x}",
                expected, got
            ),
            ChisError::Verify {
                offset,
                expected,
                got,
            } => write!(
                f,
                "verify mismatch at offset {:#010x}: expected {:#04x}, got {:#04x}",
                offset, expected, got
            ),
            ChisError::InvalidMapping(len) => {
                write!(f, "flash mapping must have 8 entries, got {}", len)
            }
            ChisError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ChisError {}

pub type Result<T> = std::result::Result<T, ChisError>;
