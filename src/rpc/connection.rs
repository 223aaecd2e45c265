//! Request/response correlation over a pair of byte streams
//!
//! `RpcConnection` writes framed requests to the peer's input stream and runs
//! a single background reader over the peer's output stream. The reader is the
//! only owner of the read buffer; it decodes complete lines and fills the
//! matching pending waiter. Callers block on their own waiter with a timeout.
//!
//! The connection outlives individual streams: `attach` installs a fresh pair
//! (one per subprocess launch) and `detach` tears it down, failing everything
//! still in flight. Request ids keep increasing across attachments.

use crate::io::framing::{Frame, FrameLimits, LineBuffer, READ_CHUNK_SIZE, encode_frame};
use crate::log_rpc_message;
use crate::rpc::error::TransportError;
use crate::rpc::pending::{PendingGuard, PendingRequests};
use crate::rpc::protocol::{DecodeError, Inbound, JsonRpcRequest, decode_inbound};
use serde_json::Value;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, trace, warn};

/// Boxed peer input stream (child stdin)
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed peer output stream (child stdout)
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Callback fired once when the peer closes its output stream
pub type ClosedHandler = Box<dyn FnOnce() + Send>;

/// The running read loop of one attachment
struct ReaderTask {
    cancel: CancellationToken,
    handle: JoinHandle<BoxedReader>,
}

/// JSON-RPC connection with request/response correlation
pub struct RpcConnection {
    /// Id counter and waiters, shared with the read loop
    pending: Arc<PendingRequests>,

    /// Peer input stream; the lock makes each framed write atomic
    writer: Mutex<Option<BoxedWriter>>,

    /// Cancelled on detach; aborts writes stuck on a peer that stopped reading
    attachment: parking_lot::Mutex<CancellationToken>,

    /// Background reader of the current attachment
    reader: parking_lot::Mutex<Option<ReaderTask>>,

    /// Set by the read loop when the peer closes its output stream
    peer_closed: Arc<AtomicBool>,

    /// Whether streams were ever attached (distinguishes NotConnected from Closed)
    ever_attached: AtomicBool,

    limits: FrameLimits,
}

impl RpcConnection {
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            pending: Arc::new(PendingRequests::new()),
            writer: Mutex::new(None),
            attachment: parking_lot::Mutex::new(CancellationToken::new()),
            reader: parking_lot::Mutex::new(None),
            peer_closed: Arc::new(AtomicBool::new(false)),
            ever_attached: AtomicBool::new(false),
            limits,
        }
    }

    /// Install a stream pair and start the read loop
    pub async fn attach<R, W>(&self, reader: R, writer: W, on_closed: Option<ClosedHandler>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        // Never leave a previous attachment running underneath a new one
        self.detach().await;

        self.peer_closed.store(false, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        *self.attachment.lock() = cancel.clone();
        *self.writer.lock().await = Some(Box::new(writer));

        let handle = tokio::spawn(read_loop(
            Box::new(reader),
            Arc::clone(&self.pending),
            self.limits,
            cancel.clone(),
            Arc::clone(&self.peer_closed),
            on_closed,
        ));
        *self.reader.lock() = Some(ReaderTask { cancel, handle });
        self.ever_attached.store(true, Ordering::SeqCst);

        debug!("RpcConnection: streams attached");
    }

    /// Tear down the current attachment.
    ///
    /// The read loop is detached first so a late read cannot deliver anything,
    /// and any write still blocked on the input stream is abandoned. Then the
    /// input stream is closed, then the output stream. Every waiter
    /// still outstanding is completed with `TransportError::Closed`. Returns
    /// the number of waiters failed.
    pub async fn detach(&self) -> usize {
        self.attachment.lock().cancel();
        let reader_task = self.reader.lock().take();
        let output = match reader_task {
            Some(ReaderTask { cancel, handle }) => {
                cancel.cancel();
                match handle.await {
                    Ok(stream) => Some(stream),
                    Err(e) => {
                        error!("RpcConnection: read loop ended abnormally: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        if let Some(mut input) = self.writer.lock().await.take() {
            if let Err(e) = input.shutdown().await {
                trace!("RpcConnection: closing input stream failed: {}", e);
            }
        }
        drop(output);

        let failed = self.pending.fail_all(|| TransportError::Closed);
        if failed > 0 {
            debug!("RpcConnection: failed {} pending request(s) on detach", failed);
        }
        failed
    }

    /// Whether a stream pair is currently installed and the peer has not hung up
    pub fn is_attached(&self) -> bool {
        self.reader.lock().is_some() && !self.peer_closed.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and wait for its response or the timeout.
    ///
    /// The timeout covers the write as well as the wait, so a peer that stopped
    /// reading its input cannot hold the caller past its deadline. Dropping the returned future before it resolves removes the pending
    /// entry; a reply arriving afterwards is discarded by the read loop.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let (id, receiver) = self.pending.register();
        let mut guard = PendingGuard::new(&self.pending, id);

        let request = JsonRpcRequest::new(id, method, params);
        let frame =
            encode_frame(&request).map_err(|e| TransportError::Serialization(e.to_string()))?;

        let exchange = async {
            self.write_frame(&frame).await?;
            log_rpc_message!(Level::TRACE, "outbound", method, id);

            let outcome = receiver.await;
            guard.disarm();
            match outcome {
                Ok(outcome) => {
                    log_rpc_message!(Level::TRACE, "inbound", method, id);
                    outcome
                }
                // Slot dropped without a value: torn down underneath us
                Err(_) => Err(TransportError::Closed),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Request {} '{}' timed out after {:?}", id, method, timeout);
                Err(TransportError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.peer_closed.load(Ordering::SeqCst) {
            return Err(peer_closed_error());
        }

        let detached = self.attachment.lock().clone();
        tokio::select! {
            _ = detached.cancelled() => {
                debug!("RpcConnection: write abandoned by detach");
                Err(TransportError::Closed)
            }
            result = self.write_locked(frame) => result,
        }
    }

    async fn write_locked(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(if self.ever_attached.load(Ordering::SeqCst) {
                TransportError::Closed
            } else {
                TransportError::NotConnected
            });
        };

        stream.write_all(frame).await?;
        stream.flush().await?;
        Ok(())
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        if let Some(task) = self.reader.get_mut().take() {
            task.cancel.cancel();
        }
        self.pending.fail_all(|| TransportError::Closed);
    }
}

fn peer_closed_error() -> TransportError {
    TransportError::from(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "control-plane process closed its output stream",
    ))
}

/// Background task that owns the output stream and the read buffer.
///
/// Returns the stream when cancelled or at end of stream so the caller decides
/// when it is closed.
async fn read_loop(
    mut stream: BoxedReader,
    pending: Arc<PendingRequests>,
    limits: FrameLimits,
    cancel: CancellationToken,
    peer_closed: Arc<AtomicBool>,
    on_closed: Option<ClosedHandler>,
) -> BoxedReader {
    let mut buffer = LineBuffer::new(limits);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    trace!("RpcConnection: read loop started");

    let failure = loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                trace!("RpcConnection: read loop detached");
                return stream;
            }
            read = stream.read(&mut chunk) => read,
        };

        match read {
            Ok(0) => {
                let tail = buffer.discard_partial();
                if tail > 0 {
                    warn!("Discarding {} undelimited byte(s) at end of stream", tail);
                }
                break peer_closed_error();
            }
            Ok(n) => {
                buffer.push(&chunk[..n]);
                while let Some(frame) = buffer.next_frame() {
                    dispatch_frame(frame, &pending);
                }
                if let Some(discarded) = buffer.enforce_limit() {
                    warn!(
                        "Read buffer exceeded {} bytes without a delimiter; discarded {} byte(s)",
                        limits.max_buffer_size, discarded
                    );
                }
            }
            Err(e) => {
                error!("Failed to read from control-plane output: {}", e);
                break TransportError::from(e);
            }
        }
    };

    peer_closed.store(true, Ordering::SeqCst);
    warn!("Control-plane output stream closed");

    let failed = pending.fail_all(|| failure.clone());
    if failed > 0 {
        warn!("Failed {} in-flight request(s) after output closed", failed);
    }
    if let Some(handler) = on_closed {
        handler();
    }

    trace!("RpcConnection: read loop finished");
    stream
}

/// Route one frame to its waiter, or log why it was dropped
fn dispatch_frame(frame: Frame, pending: &PendingRequests) {
    let line = match frame {
        Frame::Line(line) => line,
        Frame::Oversized { len } => {
            warn!("Skipping oversized message ({} bytes)", len);
            return;
        }
    };

    match decode_inbound(&line) {
        Ok(Inbound::Response { id, outcome }) => {
            if !pending.complete(id, outcome.map_err(TransportError::from)) {
                debug!("Dropping response for unknown or expired request {}", id);
            }
        }
        Ok(Inbound::PeerMessage { method }) => {
            debug!("Ignoring peer-initiated message '{}'", method);
        }
        Err(DecodeError::InvalidErrorObject { id, source }) => {
            warn!("Response {} carries an undecodable error object: {}", id, source);
            let error = TransportError::Serialization(format!(
                "undecodable error object in response {}: {}",
                id, source
            ));
            if !pending.complete(id, Err(error)) {
                debug!("Dropping response for unknown or expired request {}", id);
            }
        }
        Err(e) => {
            warn!(
                "Discarding malformed message: {} ({})",
                e,
                String::from_utf8_lossy(&line[..line.len().min(200)])
            );
        }
    }
}
