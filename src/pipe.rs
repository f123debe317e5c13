//! Streaming bridge between protocol sessions and storage backends.
//!
//! Backends without native random-access I/O run each transfer as a
//! background task connected to the caller through a bounded in-memory pipe:
//! downloads pump the backend stream into the pipe while the caller reads,
//! uploads pump the pipe into the backend while the caller writes, with the
//! commit deferred until the caller finishes. Every transfer carries a
//! cancellation token; cancelling is idempotent, stops the in-flight backend
//! operation and unblocks the opposite pipe end with an error instead of
//! letting it hang.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, SimplexStream, WriteHalf,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{FsError, Result};

/// Buffer size of the pipe between a transfer task and its caller.
pub(crate) const PIPE_CAPACITY: usize = 256 * 1024;

/// Deferred commit action run by [`TransferWriter::finish`] on unbridged
/// writers (the local temp-file rename).
pub(crate) type CommitFuture = BoxFuture<'static, Result<()>>;

/// Error carried across pipe ends. `io::Error` is not `Clone`, so the slot
/// stores kind + message and rebuilds the error per observer.
type FaultSlot = Arc<Mutex<Option<(io::ErrorKind, String)>>>;

fn take_fault(slot: &FaultSlot) -> Option<io::Error> {
    slot.lock()
        .unwrap()
        .as_ref()
        .map(|(kind, msg)| io::Error::new(*kind, msg.clone()))
}

fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "transfer cancelled")
}

/// Create a bounded pipe whose halves share a fault slot.
pub(crate) fn pipe(capacity: usize) -> (PipeReader, PipeWriter) {
    let (read_half, write_half) = tokio::io::simplex(capacity);
    let fault: FaultSlot = Arc::new(Mutex::new(None));
    (
        PipeReader {
            inner: read_half,
            fault: Arc::clone(&fault),
        },
        PipeWriter {
            inner: write_half,
            fault,
        },
    )
}

/// Read end of the transfer pipe.
pub(crate) struct PipeReader {
    inner: ReadHalf<SimplexStream>,
    fault: FaultSlot,
}

impl PipeReader {
    /// Record an error for the writing end; its next write fails with it.
    pub(crate) fn close_with_error(&mut self, err: io::Error) {
        *self.fault.lock().unwrap() = Some((err.kind(), err.to_string()));
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(err) = take_fault(&self.fault) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Write end of the transfer pipe.
pub(crate) struct PipeWriter {
    inner: WriteHalf<SimplexStream>,
    fault: FaultSlot,
}

impl PipeWriter {
    /// Record an error for the reading end; its next read fails with it.
    pub(crate) fn close_with_error(&mut self, err: io::Error) {
        *self.fault.lock().unwrap() = Some((err.kind(), err.to_string()));
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(err) = take_fault(&self.fault) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Readable side of a transfer, returned by [`crate::Fs::open`].
///
/// Implements [`AsyncRead`]. Dropping the reader cancels the transfer.
pub struct TransferReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    token: CancellationToken,
}

impl TransferReader {
    /// Wrap a backend stream that needs no bridging task.
    pub(crate) fn direct(inner: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            inner,
            token: CancellationToken::new(),
        }
    }

    fn piped(reader: PipeReader, token: CancellationToken) -> Self {
        Self {
            inner: Box::new(reader),
            token,
        }
    }

    /// Cancel the transfer. Idempotent; the pump task stops and any blocked
    /// read fails with an interrupted error.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl AsyncRead for TransferReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.token.is_cancelled() {
            return Poll::Ready(Err(cancelled_error()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for TransferReader {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Writable side of a transfer, returned by [`crate::Fs::create`].
///
/// Implements [`AsyncWrite`]. The upload is only committed by
/// [`TransferWriter::finish`]; dropping an unfinished writer cancels the
/// transfer instead of committing a truncated object.
pub struct TransferWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
    token: CancellationToken,
    outcome: Option<oneshot::Receiver<io::Result<u64>>>,
    commit: Option<CommitFuture>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
    written: u64,
    finished: bool,
}

impl TransferWriter {
    /// Wrap a backend writer that needs no bridging task.
    ///
    /// `commit` runs on finish after the stream is flushed; `cleanup` runs
    /// on cancellation or abandonment (e.g. removing a temp file).
    pub(crate) fn direct(
        inner: Box<dyn AsyncWrite + Send + Unpin>,
        commit: Option<CommitFuture>,
        cleanup: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            inner,
            token: CancellationToken::new(),
            outcome: None,
            commit,
            cleanup,
            written: 0,
            finished: false,
        }
    }

    fn piped(
        writer: PipeWriter,
        token: CancellationToken,
        outcome: oneshot::Receiver<io::Result<u64>>,
    ) -> Self {
        Self {
            inner: Box::new(writer),
            token,
            outcome: Some(outcome),
            commit: None,
            cleanup: None,
            written: 0,
            finished: false,
        }
    }

    /// Cancel the transfer. Idempotent; the pump task aborts without
    /// committing and any blocked write fails with an interrupted error.
    pub fn cancel(&mut self) {
        self.token.cancel();
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }

    /// Bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush, commit and close the upload, returning the committed byte
    /// count. For bridged transfers this waits for the backend task to
    /// finish its deferred commit.
    pub async fn finish(mut self) -> Result<u64> {
        self.finished = true;
        let shutdown_res = self.inner.shutdown().await;
        if let Some(rx) = self.outcome.take() {
            let committed = rx
                .await
                .map_err(|_| FsError::backend("transfer task ended unexpectedly"))?;
            return Ok(committed?);
        }
        if let Err(err) = shutdown_res {
            if let Some(cleanup) = self.cleanup.take() {
                cleanup();
            }
            return Err(err.into());
        }
        if let Some(commit) = self.commit.take() {
            if let Err(err) = commit.await {
                if let Some(cleanup) = self.cleanup.take() {
                    cleanup();
                }
                return Err(err);
            }
        }
        Ok(self.written)
    }
}

impl AsyncWrite for TransferWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.token.is_cancelled() {
            return Poll::Ready(Err(cancelled_error()));
        }
        let n = std::task::ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
        self.written += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Drop for TransferWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.token.cancel();
            if let Some(cleanup) = self.cleanup.take() {
                cleanup();
            }
        }
    }
}

/// Spawn a download pump and hand the read end to the caller.
///
/// The pump owns the pipe writer and must return it alongside its result so
/// a pump failure can be recorded in the fault slot before the pipe closes;
/// the cancellation arm wins ties, so an aborted pump never looks like a
/// clean end of stream.
pub(crate) fn piped_download<F, Fut>(capacity: usize, label: String, pump: F) -> TransferReader
where
    F: FnOnce(PipeWriter) -> Fut,
    Fut: Future<Output = (PipeWriter, io::Result<u64>)> + Send + 'static,
{
    let (reader, writer) = pipe(capacity);
    let token = CancellationToken::new();
    let task_token = token.clone();
    let fut = pump(writer);
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = task_token.cancelled() => {
                log::debug!("download cancelled: {label}");
            }
            (mut writer, res) = fut => match res {
                Ok(n) => {
                    log::debug!("download pump done: {label} ({n} bytes)");
                    let _ = writer.shutdown().await;
                }
                Err(err) => {
                    log::debug!("download pump failed: {label}: {err}");
                    writer.close_with_error(err);
                }
            },
        }
    });
    TransferReader::piped(reader, token)
}

/// Spawn an upload pump and hand the write end to the caller.
///
/// The pump reads the caller's bytes from the pipe and performs the deferred
/// backend commit once it sees end of stream; the commit outcome is reported
/// through the oneshot consumed by [`TransferWriter::finish`].
pub(crate) fn piped_upload<F, Fut>(capacity: usize, label: String, pump: F) -> TransferWriter
where
    F: FnOnce(PipeReader) -> Fut,
    Fut: Future<Output = (PipeReader, io::Result<u64>)> + Send + 'static,
{
    let (reader, writer) = pipe(capacity);
    let token = CancellationToken::new();
    let task_token = token.clone();
    let (done_tx, done_rx) = oneshot::channel();
    let fut = pump(reader);
    tokio::spawn(async move {
        let outcome = tokio::select! {
            biased;
            _ = task_token.cancelled() => Err(cancelled_error()),
            (mut reader, res) = fut => {
                if let Err(err) = &res {
                    log::debug!("upload pump failed: {label}: {err}");
                    reader.close_with_error(io::Error::new(err.kind(), err.to_string()));
                }
                res
            }
        };
        let _ = done_tx.send(outcome);
    });
    TransferWriter::piped(writer, token, done_rx)
}
