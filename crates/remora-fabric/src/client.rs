//! Client endpoint.
//!
//! The client connects, waits for the accept rendezvous, maps the
//! server's segment, and signals readiness. After the message exchange it
//! holds a [`RemoteRegion`]: a descriptor-validated window into the
//! shared segment that it reads and writes directly, nudging the server
//! with region-update frames instead of messages.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::pd::{AccessFlags, RegionDescriptor};
use crate::segment::{Segment, SegmentError};
use crate::wire::{self, AcceptInfo, FrameKind};

/// Connection parameters the server granted in its accept.
#[derive(Debug, Clone, Copy)]
pub struct GrantedParam {
    pub initiator_depth: u8,
    pub responder_resources: u8,
}

/// A client-side connection.
pub struct RemoteClient {
    rd: OwnedReadHalf,
    wr: OwnedWriteHalf,
    segment: Option<Arc<Segment>>,
    granted: Option<GrantedParam>,
}

impl RemoteClient {
    /// Connect to a listening server. The connection is not usable until
    /// [`RemoteClient::wait_established`] returns.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (rd, wr) = stream.into_split();
        Ok(Self {
            rd,
            wr,
            segment: None,
            granted: None,
        })
    }

    /// Wait for the server's accept, map its segment, and signal ready.
    pub async fn wait_established(&mut self) -> Result<(), ClientError> {
        let frame = wire::read_frame(&mut self.rd)
            .await?
            .ok_or(ClientError::Disconnected)?;
        if frame.kind != FrameKind::Accept as u8 {
            return Err(ClientError::UnexpectedFrame(frame.kind));
        }
        let info = AcceptInfo::decode(&frame.payload)?;

        let segment = Segment::open_file(&info.segment_path)?;
        if segment.size() as u64 != info.segment_size {
            return Err(ClientError::BadDescriptor("segment size mismatch"));
        }
        self.segment = Some(segment);
        self.granted = Some(GrantedParam {
            initiator_depth: info.initiator_depth,
            responder_resources: info.responder_resources,
        });

        wire::write_frame(&mut self.wr, FrameKind::Ready, &[]).await?;
        tracing::debug!(path = %info.segment_path, "established");
        Ok(())
    }

    /// The mapped segment, once established.
    pub fn segment(&self) -> Option<&Arc<Segment>> {
        self.segment.as_ref()
    }

    /// The parameters the server granted, once established.
    pub fn granted(&self) -> Option<GrantedParam> {
        self.granted
    }

    /// Send one message to the server's receive queue.
    pub async fn send_message(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        wire::write_frame(&mut self.wr, FrameKind::Message, bytes).await?;
        Ok(())
    }

    /// Receive the next message. Non-message frames other than disconnect
    /// are a protocol violation from the server side.
    pub async fn recv_message(&mut self) -> Result<Vec<u8>, ClientError> {
        loop {
            let frame = wire::read_frame(&mut self.rd)
                .await?
                .ok_or(ClientError::Disconnected)?;
            match FrameKind::from_u8(frame.kind) {
                Some(FrameKind::Message) => return Ok(frame.payload),
                Some(FrameKind::Disconnect) => return Err(ClientError::Disconnected),
                Some(FrameKind::RegionUpdate) => {
                    tracing::debug!("region update from server");
                    continue;
                }
                _ => return Err(ClientError::UnexpectedFrame(frame.kind)),
            }
        }
    }

    /// Validate a region descriptor against the keys and geometry the
    /// owner published in the segment header, yielding a directly
    /// accessible region.
    pub fn remote_region(&self, desc: &RegionDescriptor) -> Result<RemoteRegion, ClientError> {
        use std::sync::atomic::Ordering;

        let segment = self.segment.clone().ok_or(ClientError::NotEstablished)?;
        let header = segment.header();

        if desc.rkey != header.region_rkey.load(Ordering::Acquire) {
            return Err(ClientError::BadDescriptor("remote key mismatch"));
        }
        let published_addr = header.region_addr.load(Ordering::Acquire);
        let published_len = header.region_len.load(Ordering::Acquire) as u64;
        let start = desc.addr;
        let end = start.checked_add(desc.len as u64);
        let within = start >= published_addr
            && matches!(end, Some(e) if e <= published_addr + published_len);
        if !within {
            return Err(ClientError::BadDescriptor("descriptor outside published region"));
        }
        let access = AccessFlags::from_bits_truncate(header.region_access.load(Ordering::Acquire));

        Ok(RemoteRegion {
            segment,
            addr: desc.addr,
            len: desc.len,
            access,
        })
    }

    /// Nudge the server after writing the region directly.
    pub async fn notify_region_update(&mut self, addr: u64, len: u32) -> Result<(), ClientError> {
        let payload = wire::encode_region_update(addr, len);
        wire::write_frame(&mut self.wr, FrameKind::RegionUpdate, &payload).await?;
        Ok(())
    }

    /// Orderly disconnect.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        wire::write_frame(&mut self.wr, FrameKind::Disconnect, &[]).await?;
        Ok(())
    }
}

/// A validated window into the peer's registered region.
pub struct RemoteRegion {
    segment: Arc<Segment>,
    addr: u64,
    len: u32,
    access: AccessFlags,
}

impl RemoteRegion {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn access(&self) -> AccessFlags {
        self.access
    }

    /// Remote read at a region-relative offset.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, ClientError> {
        if !self.access.contains(AccessFlags::REMOTE_READ) {
            return Err(ClientError::AccessDenied("region is not remotely readable"));
        }
        self.check_range(offset, len)?;
        Ok(self.segment.read_at(self.addr + offset, len)?)
    }

    /// Remote write at a region-relative offset.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), ClientError> {
        if !self.access.contains(AccessFlags::REMOTE_WRITE) {
            return Err(ClientError::AccessDenied("region is not remotely writable"));
        }
        self.check_range(offset, bytes.len())?;
        Ok(self.segment.write_at(self.addr + offset, bytes)?)
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<(), ClientError> {
        let end = offset.checked_add(len as u64);
        if matches!(end, Some(e) if e <= self.len as u64) {
            Ok(())
        } else {
            Err(ClientError::BadDescriptor("access outside region"))
        }
    }
}

/// Errors from the client endpoint.
#[derive(Debug)]
pub enum ClientError {
    Io(io::Error),
    Segment(SegmentError),
    /// Operation requires an established connection.
    NotEstablished,
    /// The server hung up or sent a disconnect.
    Disconnected,
    /// A frame arrived that the protocol does not allow here.
    UnexpectedFrame(u8),
    /// The descriptor disagrees with the published registration.
    BadDescriptor(&'static str),
    /// The region does not permit the attempted access.
    AccessDenied(&'static str),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::Segment(e) => write!(f, "segment error: {}", e),
            Self::NotEstablished => write!(f, "connection not established"),
            Self::Disconnected => write!(f, "server disconnected"),
            Self::UnexpectedFrame(kind) => write!(f, "unexpected frame kind {}", kind),
            Self::BadDescriptor(msg) => write!(f, "bad descriptor: {}", msg),
            Self::AccessDenied(msg) => write!(f, "access denied: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Segment(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<SegmentError> for ClientError {
    fn from(e: SegmentError) -> Self {
        Self::Segment(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm::{CmEvent, ConnParam, Listener};
    use crate::cq::{CompChannel, CompletionQueue};
    use crate::pd::ProtectionDomain;
    use crate::qp::{QpInitAttr, QueuePair};
    use crate::segment::SegmentConfig;

    struct ServerSide {
        listener: Listener,
        pd: ProtectionDomain,
        qp: Arc<QueuePair>,
        recv_cq: Arc<CompletionQueue>,
    }

    async fn establish(tag: &str) -> (ServerSide, RemoteClient) {
        let mut listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr();

        let client_task = tokio::spawn(async move {
            let mut client = RemoteClient::connect(addr).await.unwrap();
            client.wait_established().await.unwrap();
            client
        });

        let id = match listener.next_event().await.unwrap() {
            CmEvent::ConnectRequest(id) => id,
            other => panic!("unexpected event: {:?}", other),
        };
        let path =
            std::env::temp_dir().join(format!("remora-client-{}-{}.seg", tag, std::process::id()));
        let pd = id
            .alloc_pd(&path, SegmentConfig { data_capacity: 4096 })
            .unwrap();
        let channel = CompChannel::new().unwrap();
        let recv_cq = CompletionQueue::new(16, channel.clone());
        let qp = id
            .create_qp(QpInitAttr {
                max_send_wr: 8,
                max_recv_wr: 8,
                max_sge: 2,
                send_cq: CompletionQueue::new(16, channel),
                recv_cq: recv_cq.clone(),
            })
            .unwrap();
        id.accept(ConnParam::default()).unwrap();

        match listener.next_event().await.unwrap() {
            CmEvent::Established(_) => {}
            other => panic!("unexpected event: {:?}", other),
        }

        let client = client_task.await.unwrap();
        (
            ServerSide {
                listener,
                pd,
                qp,
                recv_cq,
            },
            client,
        )
    }

    #[tokio::test]
    async fn message_exchange() {
        let (server, mut client) = establish("msg").await;
        let buf = server
            .pd
            .register_buffer(vec![0u8; 16], AccessFlags::LOCAL_WRITE);
        server.qp.post_recv(1, buf.clone()).unwrap();

        client.send_message(b"hello").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(server.recv_cq.poll(4).len(), 1);
        assert_eq!(&buf.read_to_vec()[..5], b"hello");

        let reply = server.pd.register_buffer(
            b"world".to_vec(),
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE,
        );
        server.qp.post_send(2, reply, false).unwrap();
        assert_eq!(client.recv_message().await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn remote_region_access_and_validation() {
        let (server, client) = establish("region").await;

        let addr = server.pd.segment().alloc(256).unwrap();
        let handle = server
            .pd
            .register_region(addr, 256, AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE)
            .unwrap();
        handle.write_at(0, b"server data").unwrap();

        let desc = handle.descriptor();
        let region = client.remote_region(&desc).unwrap();
        assert_eq!(region.read_at(0, 11).unwrap(), b"server data");

        region.write_at(16, b"client data").unwrap();
        assert_eq!(handle.read_at(16, 11).unwrap(), b"client data");

        // Wrong key is rejected.
        let mut forged = desc;
        forged.rkey ^= 1;
        assert!(matches!(
            client.remote_region(&forged),
            Err(ClientError::BadDescriptor(_))
        ));

        // Out-of-region access is rejected.
        assert!(matches!(
            region.read_at(250, 16),
            Err(ClientError::BadDescriptor(_))
        ));
    }

    #[tokio::test]
    async fn region_update_nudges_server() {
        let (server, mut client) = establish("nudge").await;
        client.notify_region_update(64, 8).await.unwrap();
        assert_eq!(server.qp.wait_region_update(0).await, 1);
    }

    #[tokio::test]
    async fn disconnect_surfaces_on_server() {
        let (mut server, client) = establish("bye").await;
        client.disconnect().await.unwrap();
        match server.listener.next_event().await.unwrap() {
            CmEvent::Disconnected(_) => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
