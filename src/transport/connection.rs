//! Per-connection state shared by the server and the client.
//!
//! Each connection owns:
//! - a [`Reassembler`] for its receive path, driven only by its own task;
//! - an unbounded outbound queue drained by exactly one [`run_sender`] task,
//!   which writes frames through a `FramedWrite<_, FrameCodec>` in FIFO order;
//! - a [`Session`] handle given to handlers and lifecycle observers.
//!
//! Collaborators only ever see the [`Session`]; the socket halves and the buffer
//! stay private to the connection tasks.

use std::borrow::BorrowMut;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::SinkExt;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::codec::FrameCodec;
use crate::core::packet::{Frame, HEADER_SIZE};
use crate::core::reassembler::Reassembler;
use crate::error::constants::ERR_SEND_QUEUE_CLOSED;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::DispatchOutcome;
use crate::utils::metrics::Metrics;

/// Identity of one connection, unique within its `Server` or `Connector`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a connection ended, as reported to `on_disconnect` observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its end of the socket.
    PeerClosed,
    /// Closed locally via [`Session::close`] or a listener/connector shutdown.
    Local,
    /// A fatal framing or transport error; `kind` is [`ProtocolError::kind`].
    Error { kind: &'static str, message: String },
}

impl CloseReason {
    pub(crate) fn from_error(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::PeerClosed => CloseReason::PeerClosed,
            ProtocolError::Shutdown => CloseReason::Local,
            other => CloseReason::Error {
                kind: other.kind(),
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::Local => f.write_str("closed locally"),
            CloseReason::Error { kind, message } => write!(f, "{}: {}", kind, message),
        }
    }
}

struct SessionInner {
    id: ConnectionId,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: CancellationToken,
    max_frame_size: usize,
}

/// Cloneable handle to one live connection.
///
/// Sending never blocks: frames are appended to the connection's outbound queue
/// and written by its sender task in the order they were queued.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        id: ConnectionId,
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<Frame>,
        closed: CancellationToken,
        max_frame_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                peer,
                outbound,
                closed,
                max_frame_size,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Queue one frame for this connection.
    ///
    /// Fails with [`ProtocolError::FrameTooLarge`] if the frame exceeds the
    /// configured maximum and with [`ProtocolError::NotConnected`] once the
    /// connection has closed.
    pub fn send(&self, type_id: i32, body: impl Into<Bytes>) -> Result<()> {
        let frame = Frame::new(type_id, body);
        let total = frame.total_len();
        if total > self.inner.max_frame_size {
            warn!(conn_id = %self.inner.id, type_id, length = total, "Refusing to queue oversized frame");
            return Err(ProtocolError::FrameTooLarge {
                length: total.min(u32::MAX as usize) as u32,
                max: self.inner.max_frame_size,
            });
        }
        if self.is_closed() {
            warn!(conn_id = %self.inner.id, type_id, "Send on closed connection rejected");
            return Err(ProtocolError::NotConnected);
        }
        self.inner.outbound.send(frame).map_err(|_| {
            warn!(conn_id = %self.inner.id, type_id, error = ERR_SEND_QUEUE_CLOSED, "Send on closed connection rejected");
            ProtocolError::NotConnected
        })
    }

    /// Serialize `message` with `bincode` and queue it under `type_id`.
    pub fn send_message<T: Serialize>(&self, type_id: i32, message: &T) -> Result<()> {
        let body = bincode::serialize(message)?;
        self.send(type_id, body)
    }

    /// Ask the connection to shut down. Queued frames not yet written are dropped.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled() || self.inner.outbound.is_closed()
    }

    /// Resolves once the connection has been asked to close.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }
}

/// Parameters for one connection's sender task.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SenderOptions {
    pub max_frame_size: usize,
    pub yield_depth: usize,
}

/// Drain `rx` into `writer` one frame at a time until the queue closes or
/// `cancel` fires.
///
/// Frames are fed to the sink back to back and flushed whenever the queue runs
/// dry. While more than `yield_depth` frames are waiting the task yields after
/// each write so other connections get scheduled.
pub(crate) async fn run_sender<W>(
    id: ConnectionId,
    writer: W,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    options: SenderOptions,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, FrameCodec::new(options.max_frame_size));
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };

        let length = frame.total_len();
        let type_id = frame.type_id;
        sink.feed(frame).await?;
        metrics.frame_sent(length as u64);
        trace!(conn_id = %id, type_id, length, "Frame queued to socket");

        let depth = rx.len();
        if depth == 0 {
            sink.flush().await?;
        } else if depth > options.yield_depth {
            tokio::task::yield_now().await;
        }
    }

    rx.close();
    let discarded = std::iter::from_fn(|| rx.try_recv().ok()).count();
    if discarded > 0 {
        warn!(conn_id = %id, discarded, "Dropping queued frames of closed connection");
    }
    debug!(conn_id = %id, "Sender stopped");
    Ok(())
}

/// Perform one transport read into the reassembler's spare space.
///
/// A zero-length read is reported as [`ProtocolError::PeerClosed`].
pub(crate) async fn read_chunk<R, B>(reader: &mut R, reassembler: &mut Reassembler<B>) -> Result<usize>
where
    R: AsyncRead + Unpin,
    B: BorrowMut<Vec<u8>>,
{
    let spare = reassembler.spare_mut()?;
    let n = reader.read(spare).await?;
    if n == 0 {
        return Err(ProtocolError::PeerClosed);
    }
    reassembler.commit(n);
    Ok(n)
}

/// Wire size of a frame with `body_len` bytes of body.
#[inline]
pub(crate) fn wire_len(body_len: usize) -> u64 {
    (HEADER_SIZE + body_len) as u64
}

/// Fold one dispatch result into the connection metrics.
pub(crate) fn record_dispatch(id: ConnectionId, metrics: &Metrics, outcome: Result<DispatchOutcome>) {
    match outcome {
        Ok(DispatchOutcome::Delivered { failed, .. }) => {
            for _ in 0..failed {
                metrics.handler_failed();
            }
        }
        Ok(DispatchOutcome::Dropped) => metrics.frame_dropped(),
        Err(e) => {
            metrics.frame_dropped();
            warn!(conn_id = %id, kind = e.kind(), error = %e, "Dispatch failed");
        }
    }
}
