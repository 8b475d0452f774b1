//! TCP transport: listener (incoming), dialler (outbound to configured peers), hello handshake.
//! Delivery unit on the wire: 4 bytes LE length + body.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bluemesh_core::{
    AcceptOutcome, ConnectionState, Endpoint, FrameReader, FrameWriter, MeshRouter, PeerIdentity,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const LEN_SIZE: usize = 4;
/// Largest delivery unit accepted from a peer.
pub const MAX_UNIT_LEN: u32 = 16 * 1024 * 1024;
const MAX_NAME_LEN: usize = 255;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connected TCP stream whose hello has been exchanged.
pub struct TcpEndpoint {
    peer: PeerIdentity,
    stream: TcpStream,
}

impl TcpEndpoint {
    /// Incoming side: read the peer's hello, then send ours.
    pub async fn accept(mut stream: TcpStream, my_name: &str) -> io::Result<Self> {
        let peer = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            let peer = read_hello(&mut stream).await?;
            write_unit(&mut stream, my_name.as_bytes()).await?;
            Ok::<_, io::Error>(peer)
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))??;
        Ok(Self { peer, stream })
    }

    /// Outgoing side: send our hello, then read the peer's.
    pub async fn connect(mut stream: TcpStream, my_name: &str) -> io::Result<Self> {
        let peer = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            write_unit(&mut stream, my_name.as_bytes()).await?;
            read_hello(&mut stream).await
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))??;
        Ok(Self { peer, stream })
    }
}

impl Endpoint for TcpEndpoint {
    type Reader = TcpFrameReader;
    type Writer = TcpFrameWriter;

    fn peer_identity(&self) -> PeerIdentity {
        self.peer.clone()
    }

    fn split(self) -> (TcpFrameReader, TcpFrameWriter) {
        let (reader, writer) = self.stream.into_split();
        (
            TcpFrameReader { half: reader },
            TcpFrameWriter {
                half: writer,
                closed: false,
                in_flight: false,
            },
        )
    }
}

pub struct TcpFrameReader {
    half: OwnedReadHalf,
}

#[async_trait]
impl FrameReader for TcpFrameReader {
    async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        read_unit(&mut self.half).await
    }
}

pub struct TcpFrameWriter {
    half: OwnedWriteHalf,
    closed: bool,
    /// Set while a unit is being written. Still set on entry means the last
    /// write was dropped partway and the stream is out of step.
    in_flight: bool,
}

#[async_trait]
impl FrameWriter for TcpFrameWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "endpoint closed"));
        }
        if self.in_flight {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "previous unit was interrupted",
            ));
        }
        self.in_flight = true;
        write_unit(&mut self.half, frame).await?;
        self.in_flight = false;
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.half.shutdown().await
    }
}

/// Read one unit. `Ok(None)` if the stream ends before a length header.
async fn read_unit<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; LEN_SIZE];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_UNIT_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unit too large: {} bytes", len),
        ));
    }
    // Grow with the data actually received, not the announced length.
    let mut body = Vec::new();
    (&mut *r).take(u64::from(len)).read_to_end(&mut body).await?;
    if body.len() != len as usize {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream ended inside a unit",
        ));
    }
    Ok(Some(body))
}

async fn write_unit<W: AsyncWrite + Unpin>(w: &mut W, body: &[u8]) -> io::Result<()> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|&n| n <= MAX_UNIT_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unit too large"))?;
    w.write_all(&len.to_le_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await
}

async fn read_hello<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<PeerIdentity> {
    let body = read_unit(r)
        .await?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "closed during handshake"))?;
    if body.is_empty() || body.len() > MAX_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "hello name must be 1..=255 bytes",
        ));
    }
    let name = String::from_utf8(body)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "hello name is not UTF-8"))?;
    Ok(PeerIdentity::from(name))
}

/// Accept incoming connections until the router stops. Accept errors are
/// logged and skipped.
pub async fn run_listener(router: Arc<MeshRouter>, listener: TcpListener, my_name: Arc<str>) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "listening"),
        Err(e) => warn!(error = %e, "listening on unknown address"),
    }
    loop {
        let accepted = listener.accept().await;
        if router.is_stopped() {
            return;
        }
        let (stream, from) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "accept failed");
                if let Some(pause) = accept_backoff(&e) {
                    tokio::time::sleep(pause).await;
                }
                continue;
            }
        };
        let router = router.clone();
        let my_name = my_name.clone();
        tokio::spawn(async move {
            match TcpEndpoint::accept(stream, &my_name).await {
                Ok(ep) => {
                    let peer = ep.peer_identity();
                    match router.accept_connection(ep).await {
                        Ok(outcome) => debug!(%from, %peer, ?outcome, "incoming connection"),
                        Err(e) => debug!(%from, %peer, error = %e, "incoming connection refused"),
                    }
                }
                Err(e) => warn!(%from, error = %e, "incoming handshake failed"),
            }
        });
    }
}

/// Pause after an accept error. Only descriptor exhaustion needs one: the
/// pending connection stays queued and accept would fail again at once.
fn accept_backoff(e: &io::Error) -> Option<Duration> {
    const EMFILE: i32 = 24;
    const ENFILE: i32 = 23;
    match e.raw_os_error() {
        Some(EMFILE) | Some(ENFILE) => Some(Duration::from_millis(100)),
        _ => None,
    }
}

/// Keep a connection to `addr` alive: dial, hand it to the router, wait for it
/// to drop, dial again. Returns once the router stops.
pub async fn run_dialler(
    router: Arc<MeshRouter>,
    addr: SocketAddr,
    my_name: Arc<str>,
    retry: Duration,
) {
    while !router.is_stopped() {
        match dial(&router, addr, &my_name).await {
            Ok(Some(peer)) => {
                while !router.is_stopped()
                    && router.connection_state(&peer) == ConnectionState::Connected
                {
                    tokio::time::sleep(retry).await;
                }
                info!(%addr, %peer, "link down, redialling");
            }
            Ok(None) => return,
            Err(e) => {
                debug!(%addr, error = %e, "dial failed");
                tokio::time::sleep(retry).await;
            }
        }
    }
}

/// One dial attempt. `Ok(Some(peer))` once the peer is connected (by this
/// link or an existing one), `Ok(None)` if the router has stopped.
async fn dial(
    router: &MeshRouter,
    addr: SocketAddr,
    my_name: &str,
) -> io::Result<Option<PeerIdentity>> {
    let stream = TcpStream::connect(addr).await?;
    let ep = TcpEndpoint::connect(stream, my_name).await?;
    let peer = ep.peer_identity();
    match router.accept_connection(ep).await {
        Ok(AcceptOutcome::Registered(session)) => {
            info!(%addr, %peer, %session, "connected to peer");
            Ok(Some(peer))
        }
        Ok(AcceptOutcome::Duplicate) => Ok(Some(peer)),
        Err(_) => Ok(None),
    }
}
