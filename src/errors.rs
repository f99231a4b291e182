//! Error types you might see while driving a service VM

use crate::protocol::{self, Command, ScsiAddress};
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the service VM registry and handle lifecycle
///
/// These are [Clone] so that one terminal start or stop result can be
/// observed by every task waiting on it.
#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum VMError {
    /// no service VM with this identifier is registered
    #[error("no service VM registered as {0:?}")]
    UnknownVM(String),

    /// service VM can't be removed while references are outstanding
    #[error("service VM {id:?} is still referenced ({refs} references)")]
    StillReferenced { id: String, refs: usize },

    /// the last reference was dropped and the VM is shutting down
    #[error("service VM {0:?} is terminating")]
    Terminating(String),

    /// reference released more times than it was acquired
    #[error("reference count underflow on service VM {0:?}")]
    RefCountUnderflow(String),

    /// the launcher failed to start this VM
    #[error("service VM failed to start: {0}")]
    StartFailed(String),

    /// the launcher failed to stop this VM
    #[error("service VM failed to stop: {0}")]
    StopFailed(String),

    /// union mount was released more times than it was added
    #[error("union mount {0:?} is not mounted")]
    NotMounted(String),

    /// completion signal was torn down before it fired
    #[error("service VM lifecycle signal dropped")]
    SignalDropped,
}

/// Errors from hot-plugging virtual disks
#[derive(Error, Debug)]
pub enum DiskError {
    /// the platform disk primitive reported an error
    #[error("disk platform error: {0}")]
    Platform(#[from] std::io::Error),

    /// attach description did not contain a bus address
    #[error("can't find a SCSI address in attach result {0:?}")]
    UnparsableAddress(String),

    /// attach description named a slot the bus doesn't have
    #[error("attach result names a slot outside the bus, {0}")]
    AddressOutOfRange(ScsiAddress),

    /// detach requested for a disk with no attach record
    #[error("disk is not attached: {0:?}")]
    NotAttached(PathBuf),

    /// service VM lifecycle error while waiting to hot-plug
    #[error("service VM error: {0}")]
    VM(#[from] VMError),
}

/// Errors from the byte stream connecting us to a service VM
#[derive(Error, Debug)]
pub enum TransportError {
    /// dial did not complete within the connect timeout
    #[error("timed out connecting to service VM {0:?}")]
    DialTimeout(String),

    /// a read or write did not complete within the i/o timeout
    #[error("timed out waiting for service VM i/o")]
    IOTimeout,

    /// connection closed partway through a header or payload
    #[error("connection closed after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },

    /// io error
    #[error("transport io error: {0}")]
    IO(#[from] std::io::Error),

    /// dial task failed to run to completion
    #[error("dial task failed: {0}")]
    DialTask(#[from] tokio::task::JoinError),
}

/// Errors from import, export and sandbox operations
#[derive(Error, Debug)]
pub enum LayerError {
    /// transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// malformed header from the service VM
    #[error("protocol error: {0}")]
    Protocol(protocol::Error),

    /// service VM answered with ResponseFail
    #[error("service VM operation failed: {0}")]
    OperationFailed(Command),

    /// service VM answered with something other than a response
    #[error("unexpected {0} message in response")]
    UnexpectedResponse(Command),

    /// request payload doesn't fit in the header's signed size field
    #[error("payload too large for protocol header: {0} bytes")]
    PayloadTooLarge(u64),

    /// service VM lifecycle error
    #[error("service VM error: {0}")]
    VM(#[from] VMError),

    /// disk attachment error
    #[error("disk attachment error: {0}")]
    Disk(#[from] DiskError),

    /// local storage io error
    #[error("storage io error: {0}")]
    Storage(#[from] std::io::Error),

    /// background streaming task failed
    #[error("asynchronous task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// a required collaborator wasn't provided to the builder
    #[error("service builder is missing a {0}")]
    MissingCollaborator(&'static str),

    /// can't determine where to keep cached and temporary files
    #[error("can't determine where to cache sandbox files")]
    NoDefaultCacheDir,

    /// no service VM identifier was configured
    #[error("no service VM identifier configured")]
    NoServiceVM,

    /// the service VM identifier resolver failed
    #[error("failed to resolve service VM identifier: {0}")]
    ServiceVMResolve(String),
}

impl LayerError {
    /// True for failures of the connection itself, rather than a refusal or
    /// malformed answer from the service VM
    pub fn is_transport(&self) -> bool {
        matches!(self, LayerError::Transport(_))
    }
}

/// A buffer cut short is a truncated read; anything else is malformed
impl From<protocol::Error> for LayerError {
    fn from(err: protocol::Error) -> Self {
        match err {
            protocol::Error::UnexpectedEnd { needed, available } => {
                LayerError::Transport(TransportError::Truncated {
                    expected: needed as u64,
                    received: available as u64,
                })
            }
            other => LayerError::Protocol(other),
        }
    }
}
