//! Framing: fixed-width message ID prefix + raw payload, no length field.
//! The transport's delivery unit is the message boundary.

use std::fmt;

/// Byte width of every message identifier on the wire.
pub const MESSAGE_ID_LEN: usize = 16;

/// Dedup key carried at the front of every frame. Compared by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; MESSAGE_ID_LEN]);

impl MessageId {
    /// Fresh random identifier (UUID v4 bytes).
    pub fn generate() -> Self {
        MessageId(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; MESSAGE_ID_LEN]) -> Self {
        MessageId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Decoded frame: identifier and owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        encode_frame(&self.id, &self.payload)
    }
}

/// Encode `id || payload`.
pub fn encode_frame(id: &MessageId, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MESSAGE_ID_LEN + payload.len());
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split a delivery unit into its identifier and borrowed payload.
pub fn split_id(bytes: &[u8]) -> Result<(MessageId, &[u8]), FrameDecodeError> {
    if bytes.len() < MESSAGE_ID_LEN {
        return Err(FrameDecodeError::TooShort { len: bytes.len() });
    }
    let (head, payload) = bytes.split_at(MESSAGE_ID_LEN);
    let mut id = [0u8; MESSAGE_ID_LEN];
    id.copy_from_slice(head);
    Ok((MessageId(id), payload))
}

/// Decode one delivery unit into an owned frame.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
    let (id, payload) = split_id(bytes)?;
    Ok(Frame {
        id,
        payload: payload.to_vec(),
    })
}

/// Error decoding a delivery unit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame too short: {len} bytes, need at least {MESSAGE_ID_LEN}")]
    TooShort { len: usize },
}
