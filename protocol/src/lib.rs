//! Fixed-layout big-endian framing for the service VM layer protocol
//!
//! Every message starts with a 16 byte [Header]. Disk-targeted commands
//! follow it with an 8 byte [ScsiAddress], and any other payload bytes are
//! opaque to this crate (tar streams or virtual disk contents).

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;


mod messages;
mod types;

pub use messages::*;
pub use types::*;

use core::fmt;

/// Size of the primary header on the wire
pub const HEADER_SIZE: usize = 16;

/// Size of the SCSI address sub-header on the wire
pub const SCSI_HEADER_SIZE: usize = 8;

/// Version tag written by this implementation. Not negotiated.
pub const PROTOCOL_VERSION: u32 = 1;

/// Number of SCSI controllers a service VM exposes
pub const SCSI_CONTROLLERS: u32 = 4;

/// Number of slots on each SCSI controller
pub const SCSI_SLOTS_PER_CONTROLLER: u32 = 64;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// Fewer bytes were available than the fixed layout requires
    UnexpectedEnd { needed: usize, available: usize },
    /// Command field holds a value outside the known set
    InvalidCommand(u32),
    /// PayloadSize field is negative
    NegativePayloadSize(i64),
}

impl Error {
    /// True when the input was cut short, as opposed to carrying an invalid
    /// value. A short header is a transport problem, not a protocol one.
    pub fn is_truncated(&self) -> bool {
        matches!(self, Error::UnexpectedEnd { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::UnexpectedEnd { needed, available } => write!(
                f,
                "truncated header, needed {} bytes but only {} available",
                needed, available
            ),
            Error::InvalidCommand(value) => write!(f, "invalid command value {}", value),
            Error::NegativePayloadSize(size) => write!(f, "negative payload size {}", size),
        }
    }
}

impl core::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
