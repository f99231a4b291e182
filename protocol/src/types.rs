use crate::{Error, Result};
use core::{convert::TryFrom, fmt};

/// Operation code carried in the first word of every [crate::Header]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum Command {
    Import = 0,
    Export = 1,
    CreateSandbox = 2,
    ExportSandbox = 3,
    Terminate = 4,
    ResponseOK = 5,
    ResponseFail = 6,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::Import,
        Command::Export,
        Command::CreateSandbox,
        Command::ExportSandbox,
        Command::Terminate,
        Command::ResponseOK,
        Command::ResponseFail,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Commands which are immediately followed by a [crate::ScsiAddress]
    pub fn has_scsi_header(self) -> bool {
        matches!(self, Command::CreateSandbox | Command::ExportSandbox)
    }

    /// Commands sent by the service VM rather than the host
    pub fn is_response(self) -> bool {
        matches!(self, Command::ResponseOK | Command::ResponseFail)
    }
}

impl TryFrom<u32> for Command {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Command::ALL
            .iter()
            .copied()
            .find(|cmd| cmd.as_u32() == value)
            .ok_or(Error::InvalidCommand(value))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Command::Import => "import",
            Command::Export => "export",
            Command::CreateSandbox => "create-sandbox",
            Command::ExportSandbox => "export-sandbox",
            Command::Terminate => "terminate",
            Command::ResponseOK => "response-ok",
            Command::ResponseFail => "response-fail",
        };
        f.write_str(name)
    }
}
