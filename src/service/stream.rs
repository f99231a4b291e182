use crate::errors::{LayerError, TransportError};
use pin_project::pin_project;
use std::{
    future::Future,
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};
use tokio::{
    io::{AsyncRead, DuplexStream, ReadBuf},
    task::JoinHandle,
};

/// A tar stream arriving from a service VM
///
/// Bytes are copied off the connection by a background task through a
/// bounded pipe, so the layer is never held in memory all at once. That
/// task also closes the connection and releases the VM and any attached
/// disk once the payload is done.
///
/// End of stream is only reported after that task has finished. If the
/// transfer failed, the read fails instead, so a reader can't mistake a
/// cut-short archive for a complete one. [LayerStream::finish()] reports
/// the same outcome along with the byte count.
#[pin_project]
#[derive(Debug)]
pub struct LayerStream {
    #[pin]
    reader: DuplexStream,
    transfer: Transfer,
}

#[derive(Debug)]
enum Transfer {
    Running(JoinHandle<Result<u64, LayerError>>),
    Done(Result<u64, LayerError>),
}

impl LayerStream {
    pub(crate) fn spawn<F, Fut>(capacity: usize, body: F) -> Self
    where
        F: FnOnce(DuplexStream) -> Fut,
        Fut: Future<Output = Result<u64, LayerError>> + Send + 'static,
    {
        let (reader, writer) = tokio::io::duplex(capacity.max(1));
        LayerStream {
            reader,
            transfer: Transfer::Running(tokio::spawn(body(writer))),
        }
    }

    /// Stop reading and wait for the transfer and its cleanup to finish
    ///
    /// Returns the number of payload bytes the service VM delivered. If the
    /// stream wasn't read to the end, the transfer is cut short and this
    /// reports the resulting error.
    pub async fn finish(self) -> Result<u64, LayerError> {
        let LayerStream { reader, transfer } = self;
        drop(reader);
        match transfer {
            Transfer::Running(task) => task.await?,
            Transfer::Done(result) => result,
        }
    }
}

fn read_error(err: &LayerError) -> io::Error {
    let kind = match err {
        LayerError::Transport(TransportError::Truncated { .. }) => io::ErrorKind::UnexpectedEof,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err.to_string())
}

impl AsyncRead for LayerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.reader.poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // pipe closed; the end of stream is only as good as the transfer
        if let Transfer::Running(task) = this.transfer {
            let joined = ready!(Pin::new(task).poll(cx));
            *this.transfer = Transfer::Done(joined.map_err(LayerError::from).and_then(|r| r));
        }
        match this.transfer {
            Transfer::Done(Err(err)) => Poll::Ready(Err(read_error(err))),
            _ => Poll::Ready(Ok(())),
        }
    }
}
