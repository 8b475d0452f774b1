//! Transport session: one reader task and one writer task per connection.
//!
//! The reader forwards every delivery unit to the router as a [`SessionEvent`];
//! the writer drains a bounded outbound queue so `write` never waits on I/O.
//! Either task ending cancels the other, closes the endpoint and reports
//! [`SessionEvent::Closed`].

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, FrameReader, FrameWriter};
use crate::registry::PeerIdentity;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Remote closed the stream.
    Eof,
    ReadFailed(io::ErrorKind),
    /// `stop()` was called, or the writer hit an unrecoverable error.
    Cancelled,
    /// Router stopped listening for events.
    RouterGone,
}

/// Messages from sessions to the router.
#[derive(Debug)]
pub enum SessionEvent {
    Frame {
        session: SessionId,
        bytes: Vec<u8>,
    },
    Closed {
        session: SessionId,
        peer: PeerIdentity,
        reason: CloseReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("outbound queue full")]
    Backpressure,
    #[error("session closed")]
    Closed,
}

/// Handle to a running session. Owned by the router.
pub struct TransportSession {
    id: SessionId,
    peer: PeerIdentity,
    outbound: mpsc::Sender<Arc<[u8]>>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TransportSession {
    /// Start both tasks for `endpoint`. Must be called inside a Tokio runtime.
    pub fn spawn<E: Endpoint>(
        endpoint: E,
        events: mpsc::UnboundedSender<SessionEvent>,
        outbound_len: usize,
        write_timeout: Duration,
    ) -> Self {
        let id = SessionId::next();
        let peer = endpoint.peer_identity();
        let (reader, writer) = endpoint.split();
        let (outbound, outbound_rx) = mpsc::channel(outbound_len);
        let cancel = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            id,
            peer.clone(),
            reader,
            events,
            cancel.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            id,
            peer.clone(),
            writer,
            outbound_rx,
            cancel.clone(),
            write_timeout,
        ));
        info!(session = %id, peer = %peer, "session started");

        Self {
            id,
            peer,
            outbound,
            cancel,
            reader,
            writer,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Queue a frame for the writer. Never waits.
    pub fn write(&self, frame: Arc<[u8]>) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }

    /// True once either task has ended or `stop` was requested.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.reader.is_finished()
    }

    /// Interrupt the read, close the endpoint and wait for both tasks to exit.
    /// Fine to call on a session that already ended by itself.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.reader).await {
            warn!(session = %self.id, error = %e, "session reader task failed");
        }
        if let Err(e) = (&mut self.writer).await {
            warn!(session = %self.id, error = %e, "session writer task failed");
        }
        debug!(session = %self.id, peer = %self.peer, "session stopped");
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop<R: FrameReader>(
    id: SessionId,
    peer: PeerIdentity,
    mut reader: R,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    let reason = loop {
        let unit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break CloseReason::Cancelled,
            unit = reader.read_frame() => unit,
        };
        match unit {
            Ok(Some(bytes)) => {
                if events
                    .send(SessionEvent::Frame { session: id, bytes })
                    .is_err()
                {
                    break CloseReason::RouterGone;
                }
            }
            Ok(None) => break CloseReason::Eof,
            Err(e) => {
                warn!(session = %id, peer = %peer, error = %e, "read failed");
                break CloseReason::ReadFailed(e.kind());
            }
        }
    };
    // Wake the writer so it closes the endpoint.
    cancel.cancel();
    info!(session = %id, peer = %peer, ?reason, "session closed");
    let _ = events.send(SessionEvent::Closed {
        session: id,
        peer,
        reason,
    });
}

async fn write_loop<W: FrameWriter>(
    id: SessionId,
    peer: PeerIdentity,
    mut writer: W,
    mut outbound: mpsc::Receiver<Arc<[u8]>>,
    cancel: CancellationToken,
    write_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(f) => f,
                None => break,
            },
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(write_timeout, writer.write_frame(&frame)) => r,
        };
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) if is_unrecoverable(e.kind()) => {
                warn!(session = %id, peer = %peer, error = %e, "write failed, closing session");
                cancel.cancel();
                break;
            }
            Ok(Err(e)) => {
                warn!(session = %id, peer = %peer, error = %e, "write failed");
            }
            Err(_) => {
                // The unit may be half on the wire; the stream cannot carry another.
                warn!(session = %id, peer = %peer, timeout_ms = write_timeout.as_millis() as u64, "write timed out, closing session");
                cancel.cancel();
                break;
            }
        }
    }
    if let Err(e) = writer.close().await {
        debug!(session = %id, peer = %peer, error = %e, "close failed");
    }
}

fn is_unrecoverable(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
    )
}
