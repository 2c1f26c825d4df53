//! Connection management.
//!
//! The listener accepts raw connections and surfaces them as events on an
//! mpsc channel; the per-connection [`CmId`] then walks the rendezvous:
//! allocate a protection domain (which creates the shared segment),
//! create the queue pair over the stream, and accept. Establishment and
//! disconnection arrive later on the same event stream, reported by the
//! queue pair drivers.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cq::DestroyError;
use crate::pd::ProtectionDomain;
use crate::qp::{QpInitAttr, QueuePair, WriterCmd};
use crate::segment::{Segment, SegmentConfig, SegmentError};
use crate::wire::AcceptInfo;

/// Identifier of one connection, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u32);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection manager events, in arrival order per connection.
#[derive(Debug)]
pub enum CmEvent {
    /// A peer connected; resolve it by accepting or destroying the id.
    ConnectRequest(Arc<CmId>),
    /// The peer mapped the segment and the connection is usable.
    Established(ConnId),
    /// The peer disconnected or the stream failed.
    Disconnected(ConnId),
    /// A frame with an unrecognized kind arrived.
    Unknown { conn: ConnId, kind: u8 },
}

/// Parameters granted to the peer when accepting.
#[derive(Debug, Clone, Copy)]
pub struct ConnParam {
    /// Outstanding remote reads the peer may initiate.
    pub initiator_depth: u8,
    /// Outstanding remote reads this side will serve.
    pub responder_resources: u8,
}

impl Default for ConnParam {
    fn default() -> Self {
        Self {
            initiator_depth: 3,
            responder_resources: 3,
        }
    }
}

static NEXT_CONN: AtomicU32 = AtomicU32::new(1);

/// Listening side of the connection manager.
pub struct Listener {
    local_addr: SocketAddr,
    events_rx: mpsc::Receiver<CmEvent>,
    accept_task: JoinHandle<()>,
}

impl Listener {
    /// Bind and start accepting. Connect requests surface via
    /// [`Listener::next_event`].
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let tcp = TcpListener::bind(addr).await?;
        let local_addr = tcp.local_addr()?;
        let (events_tx, events_rx) = mpsc::channel(16);

        let accept_task = tokio::spawn(accept_loop(tcp, events_tx));

        tracing::info!(%local_addr, "listening");
        Ok(Self {
            local_addr,
            events_rx,
            accept_task,
        })
    }

    /// The bound address (with the resolved port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next connection manager event. `None` once the accept task is gone
    /// and every per-connection sender has been dropped.
    pub async fn next_event(&mut self) -> Option<CmEvent> {
        self.events_rx.recv().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(tcp: TcpListener, events_tx: mpsc::Sender<CmEvent>) {
    loop {
        let (stream, peer_addr) = match tcp.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            tracing::warn!(error = %err, "set_nodelay failed");
        }

        let conn = ConnId(NEXT_CONN.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%conn, %peer_addr, "connect request");

        let id = Arc::new(CmId {
            conn,
            peer_addr,
            stream: Mutex::new(Some(stream)),
            segment: Mutex::new(None),
            writer_tx: Mutex::new(None),
            events_tx: events_tx.clone(),
            destroyed: AtomicBool::new(false),
        });

        if events_tx.send(CmEvent::ConnectRequest(id)).await.is_err() {
            return;
        }
    }
}

/// Server-side identity of one connection.
pub struct CmId {
    conn: ConnId,
    peer_addr: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
    segment: Mutex<Option<Arc<Segment>>>,
    writer_tx: Mutex<Option<mpsc::UnboundedSender<WriterCmd>>>,
    events_tx: mpsc::Sender<CmEvent>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for CmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmId")
            .field("conn", &self.conn)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl CmId {
    pub fn conn_id(&self) -> ConnId {
        self.conn
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The connection's segment, once a protection domain exists.
    pub fn segment(&self) -> Option<Arc<Segment>> {
        self.segment.lock().unwrap().clone()
    }

    /// Allocate the protection domain for this connection, creating its
    /// file-backed segment at `path`.
    pub fn alloc_pd(
        &self,
        path: impl AsRef<Path>,
        config: SegmentConfig,
    ) -> Result<ProtectionDomain, CmError> {
        if self.is_destroyed() {
            return Err(CmError::Destroyed);
        }
        let segment = Segment::create_file(path, config)?;
        *self.segment.lock().unwrap() = Some(segment.clone());
        Ok(ProtectionDomain::new(segment))
    }

    /// Create the queue pair, consuming the connection stream. Callable
    /// once per connection.
    pub fn create_qp(&self, attr: QpInitAttr) -> Result<Arc<QueuePair>, CmError> {
        if self.is_destroyed() {
            return Err(CmError::Destroyed);
        }
        let stream = self
            .stream
            .lock()
            .unwrap()
            .take()
            .ok_or(CmError::AlreadyConsumed)?;
        let (rd, wr) = stream.into_split();
        let (qp, writer_tx) = QueuePair::start(self.conn, rd, wr, attr, self.events_tx.clone());
        *self.writer_tx.lock().unwrap() = Some(writer_tx);
        Ok(qp)
    }

    /// Accept the connection, sending the segment rendezvous to the peer.
    /// Requires a protection domain and a queue pair.
    pub fn accept(&self, param: ConnParam) -> Result<(), CmError> {
        if self.is_destroyed() {
            return Err(CmError::Destroyed);
        }
        let segment = self
            .segment
            .lock()
            .unwrap()
            .clone()
            .ok_or(CmError::NoProtectionDomain)?;
        let path = segment.path().ok_or(CmError::NotFileBacked)?;

        let info = AcceptInfo {
            segment_path: path.to_string_lossy().into_owned(),
            segment_size: segment.size() as u64,
            initiator_depth: param.initiator_depth,
            responder_resources: param.responder_resources,
        };

        let writer_tx = self.writer_tx.lock().unwrap();
        let writer_tx = writer_tx.as_ref().ok_or(CmError::NoQueuePair)?;
        writer_tx
            .send(WriterCmd::Accept(info.encode()))
            .map_err(|_| CmError::Destroyed)?;

        tracing::debug!(conn = %self.conn, "accepted");
        Ok(())
    }

    /// Send an orderly disconnect to the peer, if the writer still runs.
    pub fn disconnect(&self) {
        if let Some(writer_tx) = self.writer_tx.lock().unwrap().as_ref() {
            let _ = writer_tx.send(WriterCmd::Disconnect);
        }
    }

    /// Tear the connection id down. Destroying twice is an error.
    pub fn destroy(&self) -> Result<(), DestroyError> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Err(DestroyError::AlreadyDestroyed);
        }
        self.disconnect();
        *self.writer_tx.lock().unwrap() = None;
        *self.stream.lock().unwrap() = None;
        *self.segment.lock().unwrap() = None;
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

/// Errors from connection manager operations.
#[derive(Debug)]
pub enum CmError {
    Io(io::Error),
    Segment(SegmentError),
    /// The connection stream was already consumed by a queue pair.
    AlreadyConsumed,
    /// Accept requires a protection domain (and its segment) first.
    NoProtectionDomain,
    /// Accept requires a queue pair first.
    NoQueuePair,
    /// The segment has no backing file to hand to the peer.
    NotFileBacked,
    Destroyed,
}

impl std::fmt::Display for CmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::Segment(e) => write!(f, "segment error: {}", e),
            Self::AlreadyConsumed => write!(f, "connection stream already consumed"),
            Self::NoProtectionDomain => write!(f, "no protection domain allocated"),
            Self::NoQueuePair => write!(f, "no queue pair created"),
            Self::NotFileBacked => write!(f, "segment is not file-backed"),
            Self::Destroyed => write!(f, "connection id destroyed"),
        }
    }
}

impl std::error::Error for CmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Segment(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CmError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<SegmentError> for CmError {
    fn from(e: SegmentError) -> Self {
        Self::Segment(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cq::{CompChannel, CompletionQueue};
    use crate::wire::{self, FrameKind};

    fn test_attr() -> QpInitAttr {
        let channel = CompChannel::new().unwrap();
        QpInitAttr {
            max_send_wr: 8,
            max_recv_wr: 8,
            max_sge: 2,
            send_cq: CompletionQueue::new(16, channel.clone()),
            recv_cq: CompletionQueue::new(16, channel),
        }
    }

    fn segment_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("remora-cm-{}-{}.seg", tag, std::process::id()))
    }

    #[tokio::test]
    async fn rendezvous_and_establish() {
        let mut listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut peer = TcpStream::connect(listener.local_addr()).await.unwrap();

        let id = match listener.next_event().await.unwrap() {
            CmEvent::ConnectRequest(id) => id,
            other => panic!("unexpected event: {:?}", other),
        };

        let _pd = id
            .alloc_pd(segment_path("rendezvous"), SegmentConfig { data_capacity: 1024 })
            .unwrap();
        let _qp = id.create_qp(test_attr()).unwrap();
        id.accept(ConnParam::default()).unwrap();

        let frame = wire::read_frame(&mut peer).await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Accept as u8);
        let info = AcceptInfo::decode(&frame.payload).unwrap();
        assert!(info.segment_path.contains("remora-cm-rendezvous"));
        assert_eq!(info.initiator_depth, 3);
        assert_eq!(info.responder_resources, 3);

        wire::write_frame(&mut peer, FrameKind::Ready, &[]).await.unwrap();
        match listener.next_event().await.unwrap() {
            CmEvent::Established(conn) => assert_eq!(conn, id.conn_id()),
            other => panic!("unexpected event: {:?}", other),
        }

        drop(peer);
        match listener.next_event().await.unwrap() {
            CmEvent::Disconnected(conn) => assert_eq!(conn, id.conn_id()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn accept_requires_pd_and_qp() {
        let mut listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let _peer = TcpStream::connect(listener.local_addr()).await.unwrap();

        let id = match listener.next_event().await.unwrap() {
            CmEvent::ConnectRequest(id) => id,
            other => panic!("unexpected event: {:?}", other),
        };

        assert!(matches!(
            id.accept(ConnParam::default()),
            Err(CmError::NoProtectionDomain)
        ));

        let _pd = id
            .alloc_pd(segment_path("ordering"), SegmentConfig { data_capacity: 1024 })
            .unwrap();
        assert!(matches!(
            id.accept(ConnParam::default()),
            Err(CmError::NoQueuePair)
        ));

        let _qp = id.create_qp(test_attr()).unwrap();
        assert!(matches!(id.create_qp(test_attr()), Err(CmError::AlreadyConsumed)));
        id.accept(ConnParam::default()).unwrap();
    }

    #[tokio::test]
    async fn destroy_is_once_only() {
        let mut listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let _peer = TcpStream::connect(listener.local_addr()).await.unwrap();

        let id = match listener.next_event().await.unwrap() {
            CmEvent::ConnectRequest(id) => id,
            other => panic!("unexpected event: {:?}", other),
        };

        id.destroy().unwrap();
        assert_eq!(id.destroy(), Err(DestroyError::AlreadyDestroyed));
        assert!(matches!(id.create_qp(test_attr()), Err(CmError::Destroyed)));
    }
}
