//! Point-to-point byte streams to a service VM
//!
//! A [Dialer] opens the raw stream; [connect()] bounds it with a timeout and
//! wraps the result in a [Connection] that knows how to close cleanly.

mod tcp;
mod unix;

pub use tcp::TcpDialer;
pub use unix::UnixDialer;

use crate::{
    codec::{self, Remote},
    errors::{LayerError, TransportError},
    protocol::{Command, Header, ScsiAddress},
};
use futures_util::future::BoxFuture;
use std::{fmt, io, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    time,
};

/// Any bidirectional byte stream usable as a service VM connection
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

pub type BoxStream = Box<dyn ByteStream>;

/// Opens a stream to the service endpoint `service_id` inside VM `vm_id`
///
/// The returned future must not borrow from the dialer; it may be left
/// running in the background after the connect timeout fires.
pub trait Dialer: Send + Sync {
    fn dial(&self, vm_id: &str, service_id: &str) -> BoxFuture<'static, io::Result<BoxStream>>;
}

/// Dial with a bounded wait.
///
/// Dialing is not assumed to be cancellable, so the dial runs as its own
/// task. If the timer wins, that task is detached rather than awaited; a
/// stream it produces later is simply dropped.
pub async fn connect(
    dialer: &dyn Dialer,
    vm_id: &str,
    service_id: &str,
    connect_timeout: Duration,
    io_timeout: Duration,
) -> Result<Connection, TransportError> {
    log::trace!("dialing {:?} service {}", vm_id, service_id);
    let dial = tokio::spawn(dialer.dial(vm_id, service_id));
    match time::timeout(connect_timeout, dial).await {
        Err(_) => {
            log::warn!(
                "dial to service VM {:?} timed out after {:?}, abandoning it",
                vm_id,
                connect_timeout
            );
            Err(TransportError::DialTimeout(vm_id.to_string()))
        }
        Ok(joined) => {
            let stream = joined??;
            log::debug!("connected to service VM {:?}", vm_id);
            Ok(Connection {
                stream,
                vm_id: vm_id.to_string(),
                io_timeout,
            })
        }
    }
}

/// An open connection to one service VM
///
/// Close it with [Connection::close()] so the remote end sees a Terminate
/// message; dropping it only closes the underlying stream.
pub struct Connection {
    stream: BoxStream,
    vm_id: String,
    io_timeout: Duration,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("vm_id", &self.vm_id)
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}

impl Connection {
    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    pub async fn send_header(&mut self, header: &Header) -> Result<(), TransportError> {
        codec::write_header(&mut self.stream, header, self.io_timeout).await
    }

    pub async fn send_scsi_address(&mut self, address: &ScsiAddress) -> Result<(), TransportError> {
        codec::write_scsi_address(&mut self.stream, address, self.io_timeout).await
    }

    /// Send a request header for `command` followed by exactly `len` bytes
    /// from `payload`
    pub async fn send_request<R: AsyncRead + Unpin>(
        &mut self,
        command: Command,
        payload: &mut R,
        len: u64,
        chunk_size: usize,
    ) -> Result<u64, LayerError> {
        let size = payload_size(len)?;
        self.send_header(&Header::new(command, size)).await?;
        codec::copy_exact(
            payload,
            &mut self.stream,
            len,
            chunk_size,
            self.io_timeout,
            Remote::Destination,
        )
        .await
    }

    /// Send a disk-targeted request: header plus the SCSI sub-header as its
    /// payload
    pub async fn send_disk_request(
        &mut self,
        command: Command,
        address: &ScsiAddress,
    ) -> Result<(), LayerError> {
        let size = crate::protocol::SCSI_HEADER_SIZE as i64;
        self.send_header(&Header::new(command, size)).await?;
        self.send_scsi_address(address).await?;
        codec::flush(&mut self.stream, self.io_timeout).await?;
        Ok(())
    }

    pub async fn read_header(&mut self) -> Result<Header, LayerError> {
        codec::read_header(&mut self.stream, self.io_timeout).await
    }

    /// Wait for the answer to `request`, returning the size of the result
    /// payload that follows a ResponseOK.
    ///
    /// A ResponseFail carries no detail beyond the failure itself; whatever
    /// payload it has is drained, logged, and discarded.
    pub async fn expect_ok(&mut self, request: Command) -> Result<u64, LayerError> {
        let header = self.read_header().await?;
        match header.command {
            Command::ResponseOK => Ok(header.payload_len()?),
            Command::ResponseFail => {
                let len = header.payload_len()?.min(FAILURE_DETAIL_LIMIT);
                let mut detail = Vec::new();
                if len > 0 {
                    self.recv_payload(&mut detail, len, len as usize).await?;
                }
                log::warn!(
                    "service VM {:?} failed {} request, detail {:?}",
                    self.vm_id,
                    request,
                    String::from_utf8_lossy(&detail)
                );
                Err(LayerError::OperationFailed(request))
            }
            other => Err(LayerError::UnexpectedResponse(other)),
        }
    }

    /// Copy exactly `len` bytes of response payload into `dst`
    ///
    /// A failure to write `dst` is a storage error, not a transport one.
    pub async fn recv_payload<W: AsyncWrite + Unpin>(
        &mut self,
        dst: &mut W,
        len: u64,
        chunk_size: usize,
    ) -> Result<u64, LayerError> {
        codec::copy_exact(
            &mut self.stream,
            dst,
            len,
            chunk_size,
            self.io_timeout,
            Remote::Source,
        )
        .await
    }

    /// Send Terminate and shut the stream down
    pub async fn close(mut self) -> Result<(), TransportError> {
        log::trace!("closing connection to service VM {:?}", self.vm_id);
        self.send_header(&Header::empty(Command::Terminate)).await?;
        match time::timeout(self.io_timeout, self.stream.shutdown()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::IOTimeout),
        }
    }
}

/// Most bytes of ResponseFail payload kept for the log
const FAILURE_DETAIL_LIMIT: u64 = 4096;

fn payload_size(len: u64) -> Result<i64, LayerError> {
    if len > i64::MAX as u64 {
        Err(LayerError::PayloadTooLarge(len))
    } else {
        Ok(len as i64)
    }
}
