use crate::{
    Command, Error, Result, HEADER_SIZE, PROTOCOL_VERSION, SCSI_CONTROLLERS,
    SCSI_HEADER_SIZE, SCSI_SLOTS_PER_CONTROLLER,
};
use core::{convert::TryFrom, fmt};

/// Primary message header
///
/// ```text
/// offset 0: u32 command
/// offset 4: u32 version
/// offset 8: i64 payload size
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    pub command: Command,
    pub version: u32,
    pub payload_size: i64,
}

impl Header {
    pub fn new(command: Command, payload_size: i64) -> Self {
        Header {
            command,
            version: PROTOCOL_VERSION,
            payload_size,
        }
    }

    /// Header with no payload, used for Terminate and empty responses
    pub fn empty(command: Command) -> Self {
        Header::new(command, 0)
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.command.as_u32().to_be_bytes());
        bytes[4..8].copy_from_slice(&self.version.to_be_bytes());
        bytes[8..16].copy_from_slice(&self.payload_size.to_be_bytes());
        bytes
    }

    /// Decode a header from the front of `bytes`, ignoring anything after it
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bytes = front::<HEADER_SIZE>(bytes)?;
        let command = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let version = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut size = [0u8; 8];
        size.copy_from_slice(&bytes[8..16]);
        Ok(Header {
            command: Command::try_from(command)?,
            version,
            payload_size: i64::from_be_bytes(size),
        })
    }

    /// Payload size as an unsigned byte count
    pub fn payload_len(&self) -> Result<u64> {
        if self.payload_size < 0 {
            Err(Error::NegativePayloadSize(self.payload_size))
        } else {
            Ok(self.payload_size as u64)
        }
    }
}

/// Location of a hot-plugged disk on the service VM's SCSI bus
///
/// Also the 8 byte sub-header sent after disk-targeted commands.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ScsiAddress {
    pub controller: u32,
    pub location: u32,
}

impl ScsiAddress {
    pub fn new(controller: u32, location: u32) -> Self {
        ScsiAddress {
            controller,
            location,
        }
    }

    /// Whether this address names one of the bus slots a service VM has
    pub fn is_valid_slot(&self) -> bool {
        self.controller < SCSI_CONTROLLERS && self.location < SCSI_SLOTS_PER_CONTROLLER
    }

    pub fn encode(&self) -> [u8; SCSI_HEADER_SIZE] {
        let mut bytes = [0u8; SCSI_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.controller.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.location.to_be_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bytes = front::<SCSI_HEADER_SIZE>(bytes)?;
        Ok(ScsiAddress {
            controller: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            location: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

impl fmt::Display for ScsiAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SCSI {} {}", self.controller, self.location)
    }
}

fn front<const N: usize>(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < N {
        Err(Error::UnexpectedEnd {
            needed: N,
            available: bytes.len(),
        })
    } else {
        Ok(&bytes[..N])
    }
}
