//! Mesh router: accepts connections, floods novel frames, queues payloads for the application.
//!
//! Sessions report to the router over one event channel drained by a
//! dispatcher task. Registry, session set, dedup window and inbound queue each
//! have their own lock; none is held while taking another or across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, RouterConfig};
use crate::dedup::Deduplicator;
use crate::endpoint::{Endpoint, FrameWriter};
use crate::queue::InboundQueue;
use crate::registry::{ConnectionRegistry, ConnectionState, PeerIdentity};
use crate::session::{SessionError, SessionEvent, SessionId, TransportSession};
use crate::wire::{self, MessageId};

/// Result of `accept_connection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    Registered(SessionId),
    /// Peer already connected; the new endpoint was closed.
    Duplicate,
}

/// Result of `route_inbound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Novel frame: handed to `forwarded` sessions and queued locally.
    Delivered { forwarded: usize },
    Duplicate,
    /// Shorter than a message ID.
    Malformed,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("router stopped")]
    Stopped,
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
}

struct Shared {
    config: RouterConfig,
    registry: ConnectionRegistry,
    sessions: Mutex<HashMap<SessionId, TransportSession>>,
    dedup: Deduplicator,
    inbox: InboundQueue,
    stopped: AtomicBool,
}

/// Flood router. Create inside a Tokio runtime; share behind an `Arc`.
pub struct MeshRouter {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<SessionEvent>,
    dispatcher: JoinHandle<()>,
}

impl MeshRouter {
    pub fn new(config: RouterConfig) -> Result<Self, RouterError> {
        config.validate()?;
        let shared = Arc::new(Shared {
            registry: ConnectionRegistry::new(),
            sessions: Mutex::new(HashMap::new()),
            dedup: Deduplicator::new(config.history_len),
            inbox: InboundQueue::new(config.inbox_capacity, config.overflow_policy),
            stopped: AtomicBool::new(false),
            config,
        });
        let (events, events_rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(shared.clone(), events_rx));
        Ok(Self {
            shared,
            events,
            dispatcher,
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.shared.config
    }

    /// Register the endpoint's peer and start a session for it. A peer that is
    /// already connected is not an error: the new endpoint is closed and
    /// `Duplicate` returned.
    pub async fn accept_connection<E: Endpoint>(
        &self,
        endpoint: E,
    ) -> Result<AcceptOutcome, RouterError> {
        if self.is_stopped() {
            close_endpoint(endpoint).await;
            return Err(RouterError::Stopped);
        }
        let peer = endpoint.peer_identity();
        if !self.shared.registry.try_register(&peer) {
            debug!(peer = %peer, "already connected, closing duplicate endpoint");
            close_endpoint(endpoint).await;
            return Ok(AcceptOutcome::Duplicate);
        }
        let cfg = &self.shared.config;
        // Spawn and insert under the set lock: a fast Closed event cannot miss
        // the entry, and a concurrent `stop` either drains it or is seen here.
        let admitted = {
            let mut sessions = self.shared.sessions.lock();
            if self.is_stopped() {
                Err(endpoint)
            } else {
                let session = TransportSession::spawn(
                    endpoint,
                    self.events.clone(),
                    cfg.outbound_queue_len,
                    cfg.write_timeout(),
                );
                let id = session.id();
                sessions.insert(id, session);
                Ok(id)
            }
        };
        match admitted {
            Ok(id) => {
                info!(peer = %peer, session = %id, "connection accepted");
                Ok(AcceptOutcome::Registered(id))
            }
            Err(endpoint) => {
                self.shared.registry.unregister(&peer);
                close_endpoint(endpoint).await;
                Err(RouterError::Stopped)
            }
        }
    }

    /// Flood-route one delivery unit received on session `from`.
    /// Order is dedup, then broadcast, then enqueue.
    pub fn route_inbound(&self, frame: &[u8], from: SessionId) -> RouteOutcome {
        self.shared.route_inbound(frame, from)
    }

    /// Wrap `payload` in a fresh message ID and flood it to every session.
    /// The ID is recorded first so an echo from a peer is dropped as a duplicate.
    pub fn submit_outbound(&self, payload: &[u8]) -> Result<MessageId, RouterError> {
        if self.is_stopped() {
            return Err(RouterError::Stopped);
        }
        let max = self.shared.config.max_payload_len;
        if payload.len() > max {
            return Err(RouterError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        let mut id = MessageId::generate();
        while !self.shared.dedup.observe(id) {
            id = MessageId::generate();
        }
        let frame: Arc<[u8]> = wire::encode_frame(&id, payload).into();
        let sent = self.shared.broadcast(&frame, None);
        debug!(id = %id, len = payload.len(), sent, "submitted outbound message");
        Ok(id)
    }

    /// Oldest delivered payload, or None. Never waits.
    pub fn next_message(&self) -> Option<Vec<u8>> {
        self.shared.inbox.pop()
    }

    pub fn pending_messages(&self) -> usize {
        self.shared.inbox.len()
    }

    pub fn connection_state(&self, peer: &PeerIdentity) -> ConnectionState {
        self.shared.registry.state(peer)
    }

    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.shared.registry.peers()
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stop every live session and wait for their workers. Idempotent.
    /// Further `accept_connection`/`submit_outbound` calls return `Stopped`.
    pub async fn stop(&self) {
        let drained: Vec<TransportSession> = {
            let mut sessions = self.shared.sessions.lock();
            self.shared.stopped.store(true, Ordering::Release);
            sessions.drain().map(|(_, s)| s).collect()
        };
        if drained.is_empty() {
            return;
        }
        info!(sessions = drained.len(), "stopping router");
        for session in drained {
            let peer = session.peer().clone();
            session.stop().await;
            self.shared.registry.unregister(&peer);
        }
    }
}

impl Drop for MeshRouter {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

impl Shared {
    fn route_inbound(&self, frame: &[u8], from: SessionId) -> RouteOutcome {
        let (id, payload) = match wire::split_id(frame) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(session = %from, error = %e, "dropping malformed frame");
                return RouteOutcome::Malformed;
            }
        };
        if !self.dedup.observe(id) {
            debug!(session = %from, id = %id, "duplicate frame dropped");
            return RouteOutcome::Duplicate;
        }
        let exclude = if self.config.echo_to_origin {
            None
        } else {
            Some(from)
        };
        let shared_frame: Arc<[u8]> = Arc::from(frame);
        let forwarded = self.broadcast(&shared_frame, exclude);
        self.inbox.push(payload.to_vec());
        debug!(session = %from, id = %id, forwarded, "frame routed");
        RouteOutcome::Delivered { forwarded }
    }

    /// Queue `frame` on every live session except `exclude`. Per-session
    /// failures are logged and skipped. Returns how many sessions accepted it.
    fn broadcast(&self, frame: &Arc<[u8]>, exclude: Option<SessionId>) -> usize {
        let sessions = self.sessions.lock();
        let mut sent = 0;
        for (id, session) in sessions.iter() {
            if Some(*id) == exclude {
                continue;
            }
            match session.write(frame.clone()) {
                Ok(()) => sent += 1,
                Err(SessionError::Backpressure) => {
                    warn!(session = %id, peer = %session.peer(), "outbound queue full, frame dropped for peer");
                }
                Err(SessionError::Closed) => {
                    debug!(session = %id, peer = %session.peer(), "skipping closed session");
                }
            }
        }
        sent
    }

    /// Forget a session that ended by itself. A stale event for a session
    /// already removed (by `stop`) is ignored so a newer connection from the
    /// same peer stays registered. The workers are joined on their own task:
    /// an endpoint's `close` must not hold up the dispatcher.
    fn on_session_closed(&self, id: SessionId, peer: &PeerIdentity) {
        let removed = self.sessions.lock().remove(&id);
        if let Some(session) = removed {
            self.registry.unregister(peer);
            info!(session = %id, peer = %peer, "peer disconnected");
            tokio::spawn(session.stop());
        }
    }
}

async fn dispatch(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Frame { session, bytes } => {
                shared.route_inbound(&bytes, session);
            }
            SessionEvent::Closed { session, peer, .. } => {
                shared.on_session_closed(session, &peer);
            }
        }
    }
}

async fn close_endpoint<E: Endpoint>(endpoint: E) {
    let peer = endpoint.peer_identity();
    let (_reader, mut writer) = endpoint.split();
    if let Err(e) = writer.close().await {
        debug!(peer = %peer, error = %e, "close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{FrameReader, MemoryEndpoint, MemoryReader, MemoryWriter};
    use crate::wire::MESSAGE_ID_LEN;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    struct Remote {
        reader: MemoryReader,
        writer: MemoryWriter,
    }

    impl Remote {
        async fn recv(&mut self) -> Option<Vec<u8>> {
            tokio::time::timeout(WAIT, self.reader.read_frame())
                .await
                .expect("timed out waiting for frame")
                .unwrap()
        }

        async fn nothing_within(&mut self, d: Duration) -> bool {
            tokio::time::timeout(d, self.reader.read_frame()).await.is_err()
        }

        async fn send(&mut self, bytes: &[u8]) {
            self.writer.write_frame(bytes).await.unwrap();
        }
    }

    async fn connect(router: &MeshRouter, name: &str) -> (SessionId, Remote) {
        let (local, remote) = MemoryEndpoint::pair("me", name);
        let id = match router.accept_connection(local).await.unwrap() {
            AcceptOutcome::Registered(id) => id,
            AcceptOutcome::Duplicate => panic!("unexpected duplicate"),
        };
        let (reader, writer) = remote.split();
        (id, Remote { reader, writer })
    }

    fn frame(id_byte: u8, payload: &[u8]) -> Vec<u8> {
        wire::encode_frame(&MessageId::from_bytes([id_byte; MESSAGE_ID_LEN]), payload)
    }

    #[tokio::test]
    async fn accept_registers_peer() {
        let router = MeshRouter::new(RouterConfig::default()).unwrap();
        let x = PeerIdentity::from("X");
        assert_eq!(router.connection_state(&x), ConnectionState::None);
        let _x = connect(&router, "X").await;
        assert_eq!(router.connection_state(&x), ConnectionState::Connected);
        assert_eq!(router.session_count(), 1);
        router.stop().await;
    }

    #[tokio::test]
    async fn duplicate_accept_closes_second_endpoint() {
        let router = MeshRouter::new(RouterConfig::default()).unwrap();
        let _first = connect(&router, "X").await;
        let (local, remote) = MemoryEndpoint::pair("me", "X");
        assert_eq!(
            router.accept_connection(local).await.unwrap(),
            AcceptOutcome::Duplicate
        );
        let (mut rr, _rw) = remote.split();
        assert_eq!(rr.read_frame().await.unwrap(), None);
        assert_eq!(router.session_count(), 1);
        assert_eq!(router.connected_peers(), vec![PeerIdentity::from("X")]);
        router.stop().await;
    }

    #[tokio::test]
    async fn route_is_idempotent() {
        let router = MeshRouter::new(RouterConfig::default()).unwrap();
        let (a, _ra) = connect(&router, "A").await;
        let (_b, mut rb) = connect(&router, "B").await;
        let f = frame(1, b"once");
        assert_eq!(
            router.route_inbound(&f, a),
            RouteOutcome::Delivered { forwarded: 1 }
        );
        assert_eq!(router.route_inbound(&f, a), RouteOutcome::Duplicate);
        assert_eq!(rb.recv().await, Some(f));
        assert!(rb.nothing_within(Duration::from_millis(50)).await);
        assert_eq!(router.pending_messages(), 1);
        assert_eq!(router.next_message(), Some(b"once".to_vec()));
        assert_eq!(router.next_message(), None);
        router.stop().await;
    }

    #[tokio::test]
    async fn origin_excluded_unless_echo_enabled() {
        let router = MeshRouter::new(RouterConfig::default()).unwrap();
        let (a, mut ra) = connect(&router, "A").await;
        router.route_inbound(&frame(2, b"x"), a);
        assert!(ra.nothing_within(Duration::from_millis(50)).await);
        router.stop().await;

        let cfg = RouterConfig {
            echo_to_origin: true,
            ..RouterConfig::default()
        };
        let router = MeshRouter::new(cfg).unwrap();
        let (a, mut ra) = connect(&router, "A").await;
        let f = frame(3, b"y");
        assert_eq!(
            router.route_inbound(&f, a),
            RouteOutcome::Delivered { forwarded: 1 }
        );
        assert_eq!(ra.recv().await, Some(f));
        router.stop().await;
    }

    #[tokio::test]
    async fn malformed_frame_dropped() {
        let router = MeshRouter::new(RouterConfig::default()).unwrap();
        let (a, _ra) = connect(&router, "A").await;
        assert_eq!(router.route_inbound(&[1, 2, 3], a), RouteOutcome::Malformed);
        assert_eq!(router.pending_messages(), 0);
        router.stop().await;
    }

    #[tokio::test]
    async fn submit_floods_and_suppresses_echo() {
        let router = MeshRouter::new(RouterConfig::default()).unwrap();
        let (a, mut ra) = connect(&router, "A").await;
        let (_b, mut rb) = connect(&router, "B").await;
        let id = router.submit_outbound(b"mine").unwrap();
        let sent_a = ra.recv().await.unwrap();
        let sent_b = rb.recv().await.unwrap();
        assert_eq!(sent_a, sent_b);
        assert_eq!(&sent_a[..MESSAGE_ID_LEN], id.as_bytes());
        assert_eq!(&sent_a[MESSAGE_ID_LEN..], b"mine");
        // Not delivered to ourselves, and an echo is a duplicate.
        assert_eq!(router.next_message(), None);
        assert_eq!(router.route_inbound(&sent_a, a), RouteOutcome::Duplicate);
        assert_eq!(router.next_message(), None);
        router.stop().await;
    }

    #[tokio::test]
    async fn oversized_payload_rejected() {
        let cfg = RouterConfig {
            max_payload_len: 4,
            ..RouterConfig::default()
        };
        let router = MeshRouter::new(cfg).unwrap();
        assert!(matches!(
            router.submit_outbound(b"too long"),
            Err(RouterError::PayloadTooLarge { len: 8, max: 4 })
        ));
        assert!(router.submit_outbound(b"ok").is_ok());
    }

    #[tokio::test]
    async fn frames_from_remote_are_routed_by_dispatcher() {
        let router = MeshRouter::new(RouterConfig::default()).unwrap();
        let (_a, mut ra) = connect(&router, "A").await;
        let (_b, mut rb) = connect(&router, "B").await;
        let f = frame(9, b"via session");
        ra.send(&f).await;
        assert_eq!(rb.recv().await, Some(f));
        let msg = wait_for_message(&router).await;
        assert_eq!(msg, b"via session");
        router.stop().await;
    }

    #[tokio::test]
    async fn remote_disconnect_unregisters_peer() {
        let router = MeshRouter::new(RouterConfig::default()).unwrap();
        let (_a, ra) = connect(&router, "A").await;
        drop(ra);
        let a = PeerIdentity::from("A");
        tokio::time::timeout(WAIT, async {
            while router.connection_state(&a) == ConnectionState::Connected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("peer should be unregistered");
        assert_eq!(router.session_count(), 0);
        // Same peer may reconnect.
        let _again = connect(&router, "A").await;
        assert_eq!(router.connection_state(&a), ConnectionState::Connected);
        router.stop().await;
    }

    /// Memory endpoint whose `close` never completes.
    struct SlowCloseEndpoint(MemoryEndpoint);

    struct SlowCloseWriter(MemoryWriter);

    #[async_trait::async_trait]
    impl FrameWriter for SlowCloseWriter {
        async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
            self.0.write_frame(frame).await
        }
        async fn close(&mut self) -> std::io::Result<()> {
            std::future::pending().await
        }
    }

    impl Endpoint for SlowCloseEndpoint {
        type Reader = MemoryReader;
        type Writer = SlowCloseWriter;
        fn peer_identity(&self) -> PeerIdentity {
            self.0.peer_identity()
        }
        fn split(self) -> (MemoryReader, SlowCloseWriter) {
            let (reader, writer) = self.0.split();
            (reader, SlowCloseWriter(writer))
        }
    }

    #[tokio::test]
    async fn slow_close_does_not_stall_routing() {
        let router = MeshRouter::new(RouterConfig::default()).unwrap();
        let (local, remote) = MemoryEndpoint::pair("me", "slow");
        router
            .accept_connection(SlowCloseEndpoint(local))
            .await
            .unwrap();
        let (_b, mut rb) = connect(&router, "B").await;

        drop(remote);
        let slow = PeerIdentity::from("slow");
        tokio::time::timeout(WAIT, async {
            while router.connection_state(&slow) == ConnectionState::Connected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("slow peer should be unregistered while its close hangs");

        rb.send(&frame(11, b"still routing")).await;
        assert_eq!(wait_for_message(&router).await, b"still routing");
        router.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_final() {
        let router = MeshRouter::new(RouterConfig::default()).unwrap();
        let (_a, mut ra) = connect(&router, "A").await;
        router.stop().await;
        router.stop().await;
        assert_eq!(ra.recv().await, None);
        assert_eq!(router.session_count(), 0);
        assert_eq!(
            router.connection_state(&PeerIdentity::from("A")),
            ConnectionState::None
        );
        assert!(matches!(
            router.submit_outbound(b"late"),
            Err(RouterError::Stopped)
        ));
        let (local, _remote) = MemoryEndpoint::pair("me", "B");
        assert!(matches!(
            router.accept_connection(local).await,
            Err(RouterError::Stopped)
        ));
    }

    #[tokio::test]
    async fn invalid_config_rejected() {
        let cfg = RouterConfig {
            history_len: 0,
            ..RouterConfig::default()
        };
        assert!(matches!(
            MeshRouter::new(cfg),
            Err(RouterError::Config(ConfigError::ZeroCapacity("history_len")))
        ));
    }

    async fn wait_for_message(router: &MeshRouter) -> Vec<u8> {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(m) = router.next_message() {
                    return m;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for message")
    }
}
