//! BlueMesh flood router.
//! Hosts hand connected endpoints to a `MeshRouter`; it deduplicates frames,
//! rebroadcasts novel ones to every other connection and queues payloads for pickup.

pub mod config;
pub mod dedup;
pub mod endpoint;
pub mod queue;
pub mod registry;
pub mod router;
pub mod session;
pub mod wire;

pub use config::{ConfigError, OverflowPolicy, RouterConfig};
pub use dedup::Deduplicator;
pub use endpoint::{Endpoint, FrameReader, FrameWriter, MemoryEndpoint};
pub use queue::{InboundQueue, PushOutcome};
pub use registry::{ConnectionRegistry, ConnectionState, PeerIdentity};
pub use router::{AcceptOutcome, MeshRouter, RouteOutcome, RouterError};
pub use session::{CloseReason, SessionError, SessionEvent, SessionId, TransportSession};
pub use wire::{decode_frame, encode_frame, Frame, FrameDecodeError, MessageId, MESSAGE_ID_LEN};
