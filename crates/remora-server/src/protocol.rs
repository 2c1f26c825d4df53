//! The two-message exchange protocol.
//!
//! Every message on the wire is exactly 32 bytes, little-endian:
//!
//! ```text
//! offset  field
//!      0  kind (u32): 1 = liveness, 2 = descriptor
//!      4  reserved (u32, zero)
//!      8  liveness: offset (u64)      descriptor: addr (u64)
//!     16                              descriptor: len (u32)
//!     20                              descriptor: rkey (u32)
//!     24                              descriptor: lkey (u32)
//!     28  zero padding to 32
//! ```

use remora_fabric::{AccessFlags, MessageBuffer, RegionDescriptor};

use crate::error::ServerError;
use crate::resources::ConnectionResources;

/// Fixed wire size of every exchange message.
pub const MESSAGE_SIZE: usize = 32;

const KIND_LIVENESS: u32 = 1;
const KIND_DESCRIPTOR: u32 = 2;

/// A decoded exchange message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMessage {
    /// Liveness probe/echo carrying a counter offset.
    Liveness { offset: u64 },
    /// Region descriptor advertising the remotely accessible buffer.
    Descriptor(RegionDescriptor),
}

impl ExchangeMessage {
    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut out = [0u8; MESSAGE_SIZE];
        match self {
            Self::Liveness { offset } => {
                out[0..4].copy_from_slice(&KIND_LIVENESS.to_le_bytes());
                out[8..16].copy_from_slice(&offset.to_le_bytes());
            }
            Self::Descriptor(desc) => {
                out[0..4].copy_from_slice(&KIND_DESCRIPTOR.to_le_bytes());
                out[8..16].copy_from_slice(&desc.addr.to_le_bytes());
                out[16..20].copy_from_slice(&desc.len.to_le_bytes());
                out[20..24].copy_from_slice(&desc.rkey.to_le_bytes());
                out[24..28].copy_from_slice(&desc.lkey.to_le_bytes());
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < MESSAGE_SIZE {
            return Err(DecodeError::Truncated { len: bytes.len() });
        }
        let kind = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        match kind {
            KIND_LIVENESS => Ok(Self::Liveness {
                offset: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            }),
            KIND_DESCRIPTOR => Ok(Self::Descriptor(RegionDescriptor {
                addr: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
                len: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
                rkey: u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
                lkey: u32::from_le_bytes(bytes[24..28].try_into().unwrap()),
            })),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

/// Errors from decoding an exchange message.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
    Truncated { len: usize },
    UnknownKind(u32),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { len } => {
                write!(f, "message truncated: {} of {} bytes", len, MESSAGE_SIZE)
            }
            Self::UnknownKind(kind) => write!(f, "unknown message kind {}", kind),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A receive posted on the queue pair, waiting to be filled.
pub struct PendingRecv {
    pub wr_id: u64,
    buf: MessageBuffer,
}

impl PendingRecv {
    /// Decode the message once its completion has been observed.
    pub fn decode(&self) -> Result<ExchangeMessage, DecodeError> {
        ExchangeMessage::decode(&self.buf.read_to_vec())
    }
}

/// Posts the protocol's work requests, numbering them.
pub struct ProtocolEngine {
    next_wr_id: u64,
}

impl ProtocolEngine {
    pub fn new() -> Self {
        Self { next_wr_id: 1 }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_wr_id;
        self.next_wr_id += 1;
        id
    }

    /// Post a receive for the next inbound exchange message.
    pub fn post_recv(&mut self, res: &ConnectionResources) -> Result<PendingRecv, ServerError> {
        let wr_id = self.next_id();
        let buf = res
            .pd
            .register_buffer(vec![0u8; MESSAGE_SIZE], AccessFlags::LOCAL_WRITE);
        res.qp.post_recv(wr_id, buf.clone())?;
        tracing::trace!(wr_id, "posted receive");
        Ok(PendingRecv { wr_id, buf })
    }

    /// Post the liveness echo (signaled).
    pub fn post_liveness(
        &mut self,
        res: &ConnectionResources,
        offset: u64,
    ) -> Result<u64, ServerError> {
        let msg = ExchangeMessage::Liveness { offset };
        let wr_id = self.post_message(res, &msg)?;
        tracing::trace!(wr_id, offset, "posted liveness");
        Ok(wr_id)
    }

    /// Post the region descriptor reply (signaled).
    pub fn post_descriptor(
        &mut self,
        res: &ConnectionResources,
        desc: RegionDescriptor,
    ) -> Result<u64, ServerError> {
        let msg = ExchangeMessage::Descriptor(desc);
        let wr_id = self.post_message(res, &msg)?;
        tracing::trace!(wr_id, addr = desc.addr, len = desc.len, "posted descriptor");
        Ok(wr_id)
    }

    /// Register the outgoing message and post it signaled. Send buffers
    /// carry the full access set, matching the receive side's contract.
    fn post_message(
        &mut self,
        res: &ConnectionResources,
        msg: &ExchangeMessage,
    ) -> Result<u64, ServerError> {
        let wr_id = self.next_id();
        let buf = res.pd.register_buffer(
            msg.encode().to_vec(),
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE,
        );
        res.qp.post_send(wr_id, buf, true)?;
        Ok(wr_id)
    }
}

impl Default for ProtocolEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_roundtrip() {
        let msg = ExchangeMessage::Liveness { offset: 42 };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), MESSAGE_SIZE);
        assert_eq!(ExchangeMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn liveness_wraps_at_u64_max() {
        let msg = ExchangeMessage::Liveness { offset: u64::MAX };
        let decoded = ExchangeMessage::decode(&msg.encode()).unwrap();
        match decoded {
            ExchangeMessage::Liveness { offset } => {
                assert_eq!(offset.wrapping_add(1), 0);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn descriptor_roundtrip() {
        let msg = ExchangeMessage::Descriptor(RegionDescriptor {
            addr: 0x1000,
            len: 4608,
            rkey: 0xDEAD_BEEF,
            lkey: 0xFEED_FACE,
        });
        assert_eq!(ExchangeMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(
            ExchangeMessage::decode(&[0u8; 8]),
            Err(DecodeError::Truncated { len: 8 })
        );
        let mut bytes = [0u8; MESSAGE_SIZE];
        bytes[0..4].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(
            ExchangeMessage::decode(&bytes),
            Err(DecodeError::UnknownKind(99))
        );
    }
}
