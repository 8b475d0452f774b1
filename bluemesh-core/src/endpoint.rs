//! Boundary with the transport layer: a connected endpoint split into a frame
//! reader and a frame writer. Each `read_frame` returns one delivery unit.

use std::io;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::registry::PeerIdentity;

/// A connected transport endpoint handed to the router.
pub trait Endpoint: Send + 'static {
    type Reader: FrameReader;
    type Writer: FrameWriter;

    /// Identity of the remote side. Used as the registry key.
    fn peer_identity(&self) -> PeerIdentity;

    /// Split into independently owned halves (one per session task).
    fn split(self) -> (Self::Reader, Self::Writer);
}

#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Next delivery unit. `Ok(None)` on clean end of stream.
    async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>>;
}

#[async_trait]
pub trait FrameWriter: Send + 'static {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Close the endpoint. Closing twice must succeed.
    async fn close(&mut self) -> io::Result<()>;
}

/// In-process endpoint over channels. `pair` returns both ends of one link.
pub struct MemoryEndpoint {
    remote: PeerIdentity,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryEndpoint {
    /// Link `a` and `b`. The first endpoint is `a`'s side (its peer is `b`), the second is `b`'s.
    pub fn pair(a: impl Into<PeerIdentity>, b: impl Into<PeerIdentity>) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MemoryEndpoint {
                remote: b.into(),
                tx: a_tx,
                rx: a_rx,
            },
            MemoryEndpoint {
                remote: a.into(),
                tx: b_tx,
                rx: b_rx,
            },
        )
    }
}

impl Endpoint for MemoryEndpoint {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn peer_identity(&self) -> PeerIdentity {
        self.remote.clone()
    }

    fn split(self) -> (MemoryReader, MemoryWriter) {
        (
            MemoryReader { rx: self.rx },
            MemoryWriter { tx: Some(self.tx) },
        )
    }
}

pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}

pub struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "endpoint closed"))?;
        tx.send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "remote side gone"))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.tx = None;
        Ok(())
    }
}
