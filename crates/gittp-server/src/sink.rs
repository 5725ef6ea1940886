//! Response sinks.
//!
//! The push pipeline writes hook output, protocol frames and the git process
//! output into a [`ResponseSink`]. Sinks differ in whether a flush reaches
//! the client right away ([`FlushMode::Incremental`]) or only when the
//! response is complete ([`FlushMode::Buffered`]).

use async_trait::async_trait;
use axum::{body::Body, http::StatusCode};
use bytes::Bytes;
use gittp_git::{FlushMode, TrailingFlush};
use std::io;
use tokio::sync::{mpsc, oneshot};

/// Body chunks queued for the client before writers wait for it to catch up.
pub const BODY_CHANNEL_CAPACITY: usize = 16;

/// Destination of a response body.
#[async_trait]
pub trait ResponseSink: Send {
    /// How flushes of this sink behave.
    fn flush_mode(&self) -> FlushMode;

    /// Sets the status the response will carry.
    ///
    /// Has no effect once the status has been committed by sending body bytes.
    fn set_status(&mut self, status: StatusCode);

    /// Appends `data` to the pending body bytes.
    fn buffer(&mut self, data: &[u8]);

    /// Hands the pending bytes to the client, waiting while it is behind.
    async fn flush(&mut self) -> io::Result<()>;

    /// Writes `data`, flushing it right away when the sink streams.
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.buffer(data);
        match self.flush_mode() {
            FlushMode::Incremental => self.flush().await,
            FlushMode::Buffered => Ok(()),
        }
    }
}

/// A sink streaming the body to the HTTP client through a bounded channel.
///
/// The status is committed by the first flush that carries bytes, or when the
/// sink is dropped.
pub struct StreamingBody {
    tx: mpsc::Sender<Bytes>,
    head: Option<oneshot::Sender<StatusCode>>,
    status: StatusCode,
    buf: Vec<u8>,
}

/// Creates a streaming sink, the receiver of its committed status and the
/// HTTP body it feeds.
pub fn streaming() -> (StreamingBody, oneshot::Receiver<StatusCode>, Body) {
    let (tx, rx) = mpsc::channel::<Bytes>(BODY_CHANNEL_CAPACITY);
    let (head_tx, head_rx) = oneshot::channel();

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, io::Error>(chunk), rx))
    });

    let sink = StreamingBody {
        tx,
        head: Some(head_tx),
        status: StatusCode::OK,
        buf: Vec::new(),
    };

    (sink, head_rx, Body::from_stream(stream))
}

impl StreamingBody {
    fn commit(&mut self) {
        if let Some(head) = self.head.take() {
            if head.send(self.status).is_err() {
                tracing::debug!("Response handler gone before the status was sent");
            }
        }
    }
}

#[async_trait]
impl ResponseSink for StreamingBody {
    fn flush_mode(&self) -> FlushMode {
        FlushMode::Incremental
    }

    fn set_status(&mut self, status: StatusCode) {
        if self.head.is_some() {
            self.status = status;
        }
    }

    fn buffer(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }

        self.commit();
        let chunk = Bytes::from(std::mem::take(&mut self.buf));
        self.tx
            .send(chunk)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))
    }
}

impl Drop for StreamingBody {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            tracing::debug!(bytes = self.buf.len(), "Dropping unsent response bytes");
        }
        self.commit();
    }
}

/// A sink collecting the whole body in memory.
#[derive(Debug)]
pub struct BufferedSink {
    /// Bytes written so far.
    pub bytes: Vec<u8>,
    /// Response status.
    pub status: StatusCode,
    /// Number of flushes requested.
    pub flushes: usize,
    mode: FlushMode,
}

impl BufferedSink {
    /// Creates an empty sink. `mode` is what the sink reports to writers.
    pub fn new(mode: FlushMode) -> Self {
        Self {
            bytes: Vec::new(),
            status: StatusCode::OK,
            flushes: 0,
            mode,
        }
    }
}

impl Default for BufferedSink {
    fn default() -> Self {
        Self::new(FlushMode::Buffered)
    }
}

#[async_trait]
impl ResponseSink for BufferedSink {
    fn flush_mode(&self) -> FlushMode {
        self.mode
    }

    fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    fn buffer(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

/// Passes the output of git-receive-pack through, holding back its closing
/// flush packet so frames written after the command still come before it.
pub(crate) struct CommandOutput<'a> {
    inner: &'a mut dyn ResponseSink,
    framing: TrailingFlush,
}

impl<'a> CommandOutput<'a> {
    pub(crate) fn new(inner: &'a mut dyn ResponseSink) -> Self {
        Self {
            inner,
            framing: TrailingFlush::new(),
        }
    }

    /// Ends the command output. Returns true if its closing flush packet was
    /// held back and still has to be written.
    pub(crate) fn finish(self) -> bool {
        let (tail, held) = self.framing.finish();
        self.inner.buffer(&tail);
        held
    }
}

#[async_trait]
impl<'a> ResponseSink for CommandOutput<'a> {
    fn flush_mode(&self) -> FlushMode {
        self.inner.flush_mode()
    }

    fn set_status(&mut self, status: StatusCode) {
        self.inner.set_status(status);
    }

    fn buffer(&mut self, data: &[u8]) {
        let ready = self.framing.feed(data);
        self.inner.buffer(&ready);
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}
