use std::io;

use thiserror::Error;

/// Errors raised while reading raw media.
///
/// Variants fall in four classes: transient I/O (`Io`, left undecorated so the
/// caller can apply its own retry policy), structural corruption attached to the
/// entity being decoded, operator configuration mistakes, and an unreachable
/// snapshot service.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("read of {length} bytes at {offset:#x} is outside the device ({device_len:#x} bytes)")]
    OutOfBounds {
        offset: u64,
        length: usize,
        device_len: u64,
    },

    #[error("{entity}: {reason}")]
    Corrupt { entity: &'static str, reason: String },

    #[error("fixup mismatch in sector {sector}: expected {expected:#06x}, found {found:#06x}")]
    FixupMismatch { sector: usize, expected: u16, found: u16 },

    #[error("compression unit at vcn {vcn:#x} decoded to {actual} bytes, expected {expected}")]
    UnitSizeMismatch { vcn: u64, expected: usize, actual: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("shadow copy service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("scan cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ForgeError>;

// ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION, ERROR_BUSY
const WINDOWS_TRANSIENT_CODES: [i32; 3] = [32, 33, 170];

impl ForgeError {
    pub fn corrupt(entity: &'static str, reason: impl Into<String>) -> Self {
        ForgeError::Corrupt {
            entity,
            reason: reason.into(),
        }
    }

    /// True for I/O failures a caller may reasonably retry.
    pub fn is_transient(&self) -> bool {
        match self {
            ForgeError::Io(e) => {
                matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) || (cfg!(windows)
                    && e
                        .raw_os_error()
                        .map_or(false, |code| WINDOWS_TRANSIENT_CODES.contains(&code)))
            }
            _ => false,
        }
    }

    /// True for damage found in on-disk structures, as opposed to I/O or operator errors.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ForgeError::Corrupt { .. }
                | ForgeError::FixupMismatch { .. }
                | ForgeError::UnitSizeMismatch { .. }
                | ForgeError::OutOfBounds { .. }
        )
    }
}
