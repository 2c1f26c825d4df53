//! Control-stream framing.
//!
//! Every frame on the connection stream is `[kind: u8][len: u32 LE][payload]`.
//! The kind byte is surfaced raw so that unknown kinds reach the event loop
//! instead of being dropped inside the transport.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a frame payload.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Known frame kinds. Inbound frames may carry kinds outside this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Server accepts the connection; payload is [`AcceptInfo`].
    Accept = 1,
    /// Client finished mapping the segment; connection is established.
    Ready = 2,
    /// A posted message (send work request) for the peer's receive queue.
    Message = 3,
    /// The peer wrote the region; payload is addr (u64 LE) + len (u32 LE).
    RegionUpdate = 4,
    /// Orderly disconnect.
    Disconnect = 5,
}

impl FrameKind {
    /// Decode a raw kind byte, `None` for unknown kinds.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Accept),
            2 => Some(Self::Ready),
            3 => Some(Self::Message),
            4 => Some(Self::RegionUpdate),
            5 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// A raw inbound frame.
#[derive(Debug)]
pub struct Frame {
    /// Raw kind byte, possibly unknown.
    pub kind: u8,
    pub payload: Vec<u8>,
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, kind: FrameKind, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame payload exceeds maximum",
        ));
    }
    let mut head = [0u8; 5];
    head[0] = kind as u8;
    head[1..5].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    writer.write_all(&head).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one frame. Returns `Ok(None)` on clean end-of-stream (EOF before
/// the kind byte); EOF mid-frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut kind = [0u8; 1];
    match reader.read(&mut kind).await? {
        0 => return Ok(None),
        _ => {}
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame payload exceeds maximum",
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame {
        kind: kind[0],
        payload,
    }))
}

/// Rendezvous payload of the Accept frame: where the shared segment lives
/// and the connection parameters the acceptor granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptInfo {
    pub segment_path: String,
    pub segment_size: u64,
    pub initiator_depth: u8,
    pub responder_resources: u8,
}

impl AcceptInfo {
    pub fn encode(&self) -> Vec<u8> {
        let path = self.segment_path.as_bytes();
        let mut out = Vec::with_capacity(12 + path.len());
        out.extend_from_slice(&self.segment_size.to_le_bytes());
        out.push(self.initiator_depth);
        out.push(self.responder_resources);
        out.extend_from_slice(&(path.len() as u16).to_le_bytes());
        out.extend_from_slice(path);
        out
    }

    pub fn decode(payload: &[u8]) -> io::Result<Self> {
        if payload.len() < 12 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "accept payload truncated",
            ));
        }
        let segment_size = u64::from_le_bytes(payload[0..8].try_into().unwrap());
        let initiator_depth = payload[8];
        let responder_resources = payload[9];
        let path_len = u16::from_le_bytes(payload[10..12].try_into().unwrap()) as usize;
        let path_bytes = payload
            .get(12..12 + path_len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "accept payload truncated"))?;
        let segment_path = String::from_utf8(path_bytes.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "segment path not utf-8"))?;
        Ok(Self {
            segment_path,
            segment_size,
            initiator_depth,
            responder_resources,
        })
    }
}

/// Encode a region-update payload (written range, segment-relative).
pub fn encode_region_update(addr: u64, len: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&addr.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out
}

/// Decode a region-update payload.
pub fn decode_region_update(payload: &[u8]) -> io::Result<(u64, u32)> {
    if payload.len() != 12 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "region update payload must be 12 bytes",
        ));
    }
    let addr = u64::from_le_bytes(payload[0..8].try_into().unwrap());
    let len = u32::from_le_bytes(payload[8..12].try_into().unwrap());
    Ok((addr, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_frame(&mut a, FrameKind::Message, b"payload").await.unwrap();
        let frame = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Message as u8);
        assert_eq!(frame.payload, b"payload");
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let (a, mut b) = tokio::io::duplex(16);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_error() {
        let (mut a, mut b) = tokio::io::duplex(16);
        // kind + claimed length of 8, then hang up.
        a.write_all(&[3u8, 8, 0, 0, 0]).await.unwrap();
        drop(a);
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(16);
        let mut head = vec![3u8];
        head.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_le_bytes());
        a.write_all(&head).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }

    #[test]
    fn accept_info_roundtrip() {
        let info = AcceptInfo {
            segment_path: "/tmp/remora-1.seg".into(),
            segment_size: 65600,
            initiator_depth: 3,
            responder_resources: 3,
        };
        assert_eq!(AcceptInfo::decode(&info.encode()).unwrap(), info);
    }

    #[test]
    fn region_update_roundtrip() {
        let payload = encode_region_update(4096, 64);
        assert_eq!(decode_region_update(&payload).unwrap(), (4096, 64));
        assert!(decode_region_update(&payload[..8]).is_err());
    }
}
