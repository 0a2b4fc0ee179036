//! Length-prefixed encoding of the per-stream control message preamble

use crate::messages::{ControlMessage, ProtoError};
use bytes::{BufMut, Bytes, BytesMut};

/// Maximum control message payload (64KB)
pub const MAX_CONTROL_MESSAGE_SIZE: usize = 64 * 1024;

/// Length prefix size: payload length as big-endian u32
pub const LENGTH_PREFIX_SIZE: usize = 4;

impl ControlMessage {
    /// Encode as `[u32 length][bincode payload]`
    pub fn encode_frame(&self) -> Result<Bytes, ProtoError> {
        let payload = bincode::serialize(self).map_err(|e| ProtoError::Encode(e.to_string()))?;
        if payload.len() > MAX_CONTROL_MESSAGE_SIZE {
            return Err(ProtoError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decode a payload whose length prefix has already been consumed
    pub fn decode(payload: &[u8]) -> Result<Self, ProtoError> {
        if payload.len() > MAX_CONTROL_MESSAGE_SIZE {
            return Err(ProtoError::MessageTooLarge(payload.len()));
        }
        bincode::deserialize(payload).map_err(|e| ProtoError::Decode(e.to_string()))
    }

    /// Decode a complete frame, prefix included
    pub fn decode_frame(frame: &[u8]) -> Result<Self, ProtoError> {
        if frame.len() < LENGTH_PREFIX_SIZE {
            return Err(ProtoError::Incomplete);
        }
        let (prefix, rest) = frame.split_at(LENGTH_PREFIX_SIZE);
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if len > MAX_CONTROL_MESSAGE_SIZE {
            return Err(ProtoError::MessageTooLarge(len));
        }
        if rest.len() < len {
            return Err(ProtoError::Incomplete);
        }
        Self::decode(&rest[..len])
    }
}
