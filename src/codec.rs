//! Async framing on top of the fixed-layout protocol headers
//!
//! Every read and write is individually bounded by the i/o timeout, and
//! payloads move in chunks so a large layer never needs to fit in memory.

use crate::{
    errors::{LayerError, TransportError},
    protocol::{Header, ScsiAddress, HEADER_SIZE},
};
use std::{future::Future, io, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time,
};

async fn bounded<F, T>(limit: Duration, op: F) -> Result<T, TransportError>
where
    F: Future<Output = io::Result<T>>,
{
    match time::timeout(limit, op).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TransportError::IOTimeout),
    }
}

pub async fn write_header<W: AsyncWrite + Unpin>(
    stream: &mut W,
    header: &Header,
    limit: Duration,
) -> Result<(), TransportError> {
    log::trace!("<{:?}", header);
    bounded(limit, stream.write_all(&header.encode())).await
}

pub async fn write_scsi_address<W: AsyncWrite + Unpin>(
    stream: &mut W,
    address: &ScsiAddress,
    limit: Duration,
) -> Result<(), TransportError> {
    log::trace!("<{}", address);
    bounded(limit, stream.write_all(&address.encode())).await
}

pub async fn flush<W: AsyncWrite + Unpin>(
    stream: &mut W,
    limit: Duration,
) -> Result<(), TransportError> {
    bounded(limit, stream.flush()).await
}

/// Read one header.
///
/// A connection that ends partway through is a [TransportError], while a
/// complete header with an unknown command is a protocol error.
pub async fn read_header<R: AsyncRead + Unpin>(
    stream: &mut R,
    limit: Duration,
) -> Result<Header, LayerError> {
    let mut bytes = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < bytes.len() {
        match bounded(limit, stream.read(&mut bytes[filled..])).await? {
            0 => {
                return Err(TransportError::Truncated {
                    expected: HEADER_SIZE as u64,
                    received: filled as u64,
                }
                .into())
            }
            len => filled += len,
        }
    }
    let header = Header::decode(&bytes)?;
    log::trace!(">{:?}", header);
    Ok(header)
}

/// Which end of a payload copy is the service VM connection
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Remote {
    Source,
    Destination,
}

/// Copy exactly `len` bytes from `src` to `dst` in chunks of at most
/// `chunk_size`, returning the number of bytes copied.
///
/// Only the connection side is bounded by the i/o timeout, and only its
/// failures are [TransportError]s. Failures of the local side are storage
/// errors.
pub async fn copy_exact<R, W>(
    src: &mut R,
    dst: &mut W,
    len: u64,
    chunk_size: usize,
    limit: Duration,
    remote: Remote,
) -> Result<u64, LayerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut copied = 0u64;
    while copied < len {
        let want = (len - copied).min(buffer.len() as u64) as usize;
        let got = match remote {
            Remote::Source => bounded(limit, src.read(&mut buffer[..want])).await?,
            Remote::Destination => src.read(&mut buffer[..want]).await?,
        };
        if got == 0 {
            return Err(match remote {
                Remote::Source => TransportError::Truncated {
                    expected: len,
                    received: copied,
                }
                .into(),
                Remote::Destination => io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("local payload ended after {} of {} bytes", copied, len),
                )
                .into(),
            });
        }
        match remote {
            Remote::Source => dst.write_all(&buffer[..got]).await?,
            Remote::Destination => bounded(limit, dst.write_all(&buffer[..got])).await?,
        }
        copied += got as u64;
    }
    match remote {
        Remote::Source => dst.flush().await?,
        Remote::Destination => bounded(limit, dst.flush()).await?,
    }
    Ok(copied)
}
