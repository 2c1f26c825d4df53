//! Queue pairs.
//!
//! A queue pair owns the two halves of the connection stream. The writer
//! task drains posted sends onto the stream; the reader task matches
//! inbound message frames against posted receives and retires both as
//! work completions. A message arriving with no receive posted is parked
//! in a backlog and delivered by the next `post_recv`, so the strict
//! request/reply alternation survives the race between a reply landing
//! and the receiver re-posting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cm::{CmEvent, ConnId};
use crate::cq::{CompletionQueue, DestroyError, WcOpcode, WcStatus, WorkCompletion};
use crate::pd::{AccessFlags, MessageBuffer};
use crate::wire::{self, Frame, FrameKind};

static NEXT_QP_NUM: AtomicU32 = AtomicU32::new(1);

/// Creation attributes for a queue pair.
#[derive(Clone)]
pub struct QpInitAttr {
    /// Maximum outstanding send work requests.
    pub max_send_wr: u32,
    /// Maximum outstanding receive work requests.
    pub max_recv_wr: u32,
    /// Maximum scatter/gather entries per request (informational; every
    /// buffer here is contiguous).
    pub max_sge: u32,
    pub send_cq: Arc<CompletionQueue>,
    pub recv_cq: Arc<CompletionQueue>,
}

pub(crate) enum WriterCmd {
    Accept(Vec<u8>),
    Message {
        wr_id: u64,
        buf: MessageBuffer,
        signaled: bool,
    },
    Disconnect,
}

struct PostedRecv {
    wr_id: u64,
    buf: MessageBuffer,
}

#[derive(Default)]
struct RecvState {
    posted: VecDeque<PostedRecv>,
    /// Messages that arrived before a receive was posted.
    backlog: VecDeque<Vec<u8>>,
}

/// Counter plus wakeup for inbound region-update nudges.
struct RegionUpdateSignal {
    notify: Notify,
    count: AtomicU64,
}

/// A connected queue pair.
pub struct QueuePair {
    qp_num: u32,
    conn: ConnId,
    max_send_wr: u32,
    max_recv_wr: u32,
    recv_state: Mutex<RecvState>,
    send_cq: Arc<CompletionQueue>,
    recv_cq: Arc<CompletionQueue>,
    writer_tx: mpsc::UnboundedSender<WriterCmd>,
    outstanding_sends: AtomicU32,
    region_update: Arc<RegionUpdateSignal>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl QueuePair {
    /// Spawn the reader and writer drivers over the two stream halves.
    /// Returns the queue pair and a sender the connection id uses for
    /// control frames (accept, disconnect).
    pub(crate) fn start<R, W>(
        conn: ConnId,
        rd: R,
        wr: W,
        attr: QpInitAttr,
        events_tx: mpsc::Sender<CmEvent>,
    ) -> (Arc<Self>, mpsc::UnboundedSender<WriterCmd>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let qp = Arc::new(Self {
            qp_num: NEXT_QP_NUM.fetch_add(1, Ordering::Relaxed),
            conn,
            max_send_wr: attr.max_send_wr,
            max_recv_wr: attr.max_recv_wr,
            recv_state: Mutex::new(RecvState::default()),
            send_cq: attr.send_cq,
            recv_cq: attr.recv_cq,
            writer_tx: writer_tx.clone(),
            outstanding_sends: AtomicU32::new(0),
            region_update: Arc::new(RegionUpdateSignal {
                notify: Notify::new(),
                count: AtomicU64::new(0),
            }),
            tasks: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        });

        let reader = tokio::spawn(reader_loop(qp.clone(), rd, events_tx));
        let writer = tokio::spawn(writer_loop(qp.clone(), wr, writer_rx));
        {
            let mut tasks = qp.tasks.lock().unwrap();
            tasks.push(reader);
            tasks.push(writer);
        }

        (qp, writer_tx)
    }

    /// Queue pair number, unique within the process.
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    /// Post a receive: the next unmatched inbound message fills `buf` and
    /// retires on the receive completion queue under `wr_id`. The buffer
    /// must carry local-write access.
    pub fn post_recv(&self, wr_id: u64, buf: MessageBuffer) -> Result<(), PostError> {
        if self.is_destroyed() {
            return Err(PostError::Destroyed);
        }
        if !buf.access().contains(AccessFlags::LOCAL_WRITE) {
            return Err(PostError::MissingAccess);
        }

        let mut completions = Vec::new();
        {
            let mut state = self.recv_state.lock().unwrap();
            if state.posted.len() >= self.max_recv_wr as usize {
                return Err(PostError::QueueFull);
            }
            state.posted.push_back(PostedRecv { wr_id, buf });

            // Deliver anything that raced ahead of this posting.
            while !state.backlog.is_empty() && !state.posted.is_empty() {
                let bytes = state.backlog.pop_front().unwrap();
                let recv = state.posted.pop_front().unwrap();
                completions.push(fill_recv(recv, &bytes));
            }
        }
        for wc in completions {
            self.recv_cq.push(wc);
        }
        Ok(())
    }

    /// Post a send of a registered buffer under `wr_id`. Transmission is
    /// the peer reading the buffer, so it must carry remote-read access.
    /// A signaled send retires on the send completion queue once the
    /// bytes hit the stream.
    pub fn post_send(
        &self,
        wr_id: u64,
        buf: MessageBuffer,
        signaled: bool,
    ) -> Result<(), PostError> {
        if self.is_destroyed() {
            return Err(PostError::Destroyed);
        }
        if !buf.access().contains(AccessFlags::REMOTE_READ) {
            return Err(PostError::MissingAccess);
        }

        // Reserve a send slot before handing off to the writer.
        let mut current = self.outstanding_sends.load(Ordering::Acquire);
        loop {
            if current >= self.max_send_wr {
                return Err(PostError::QueueFull);
            }
            match self.outstanding_sends.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if self
            .writer_tx
            .send(WriterCmd::Message {
                wr_id,
                buf,
                signaled,
            })
            .is_err()
        {
            self.outstanding_sends.fetch_sub(1, Ordering::AcqRel);
            return Err(PostError::Destroyed);
        }
        Ok(())
    }

    /// Number of receives posted and not yet consumed.
    pub fn outstanding_recvs(&self) -> usize {
        self.recv_state.lock().unwrap().posted.len()
    }

    /// Number of sends posted and not yet written out.
    pub fn outstanding_sends(&self) -> u32 {
        self.outstanding_sends.load(Ordering::Acquire)
    }

    /// Total region-update nudges received so far.
    pub fn region_updates(&self) -> u64 {
        self.region_update.count.load(Ordering::Acquire)
    }

    /// Wait until the region-update count exceeds `since`, returning the
    /// new count.
    pub async fn wait_region_update(&self, since: u64) -> u64 {
        loop {
            let notified = self.region_update.notify.notified();
            let count = self.region_update.count.load(Ordering::Acquire);
            if count > since {
                return count;
            }
            notified.await;
        }
    }

    /// Tear the queue pair down, aborting its drivers. Destroying twice
    /// is an error.
    pub fn destroy(&self) -> Result<(), DestroyError> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Err(DestroyError::AlreadyDestroyed);
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.recv_state.lock().unwrap().posted.clear();
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

fn fill_recv(recv: PostedRecv, bytes: &[u8]) -> WorkCompletion {
    let written = recv.buf.write(bytes);
    WorkCompletion {
        wr_id: recv.wr_id,
        opcode: WcOpcode::Recv,
        byte_len: written as u32,
        status: WcStatus::Success,
    }
}

async fn reader_loop<R>(qp: Arc<QueuePair>, mut rd: R, events_tx: mpsc::Sender<CmEvent>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match wire::read_frame(&mut rd).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(conn = %qp.conn, "peer closed the stream");
                let _ = events_tx.send(CmEvent::Disconnected(qp.conn)).await;
                return;
            }
            Err(err) => {
                tracing::warn!(conn = %qp.conn, error = %err, "stream read failed");
                let _ = events_tx.send(CmEvent::Disconnected(qp.conn)).await;
                return;
            }
        };

        match FrameKind::from_u8(frame.kind) {
            Some(FrameKind::Ready) => {
                let _ = events_tx.send(CmEvent::Established(qp.conn)).await;
            }
            Some(FrameKind::Message) => {
                deliver_message(&qp, frame);
            }
            Some(FrameKind::RegionUpdate) => match wire::decode_region_update(&frame.payload) {
                Ok((addr, len)) => {
                    tracing::debug!(conn = %qp.conn, addr, len, "region update");
                    qp.region_update.count.fetch_add(1, Ordering::AcqRel);
                    qp.region_update.notify.notify_waiters();
                }
                Err(err) => {
                    tracing::warn!(conn = %qp.conn, error = %err, "bad region update payload");
                }
            },
            Some(FrameKind::Disconnect) => {
                tracing::debug!(conn = %qp.conn, "peer disconnected");
                let _ = events_tx.send(CmEvent::Disconnected(qp.conn)).await;
                return;
            }
            Some(FrameKind::Accept) | None => {
                let _ = events_tx
                    .send(CmEvent::Unknown {
                        conn: qp.conn,
                        kind: frame.kind,
                    })
                    .await;
            }
        }
    }
}

fn deliver_message(qp: &QueuePair, frame: Frame) {
    let completion = {
        let mut state = qp.recv_state.lock().unwrap();
        match state.posted.pop_front() {
            Some(recv) => Some(fill_recv(recv, &frame.payload)),
            None => {
                tracing::trace!(conn = %qp.conn, "no receive posted, parking message");
                state.backlog.push_back(frame.payload);
                None
            }
        }
    };
    if let Some(wc) = completion {
        qp.recv_cq.push(wc);
    }
}

async fn writer_loop<W>(
    qp: Arc<QueuePair>,
    mut wr: W,
    mut rx: mpsc::UnboundedReceiver<WriterCmd>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Accept(payload) => {
                if let Err(err) = wire::write_frame(&mut wr, FrameKind::Accept, &payload).await {
                    tracing::warn!(conn = %qp.conn, error = %err, "accept frame write failed");
                    return;
                }
            }
            WriterCmd::Message {
                wr_id,
                buf,
                signaled,
            } => {
                let bytes = buf.read_to_vec();
                let result = wire::write_frame(&mut wr, FrameKind::Message, &bytes).await;
                qp.outstanding_sends.fetch_sub(1, Ordering::AcqRel);
                let status = match &result {
                    Ok(()) => WcStatus::Success,
                    Err(err) => {
                        tracing::warn!(conn = %qp.conn, error = %err, "message write failed");
                        WcStatus::Error
                    }
                };
                if signaled {
                    qp.send_cq.push(WorkCompletion {
                        wr_id,
                        opcode: WcOpcode::Send,
                        byte_len: bytes.len() as u32,
                        status,
                    });
                }
                if result.is_err() {
                    return;
                }
            }
            WriterCmd::Disconnect => {
                if let Err(err) = wire::write_frame(&mut wr, FrameKind::Disconnect, &[]).await {
                    tracing::debug!(conn = %qp.conn, error = %err, "disconnect frame write failed");
                }
                return;
            }
        }
    }
}

/// Errors from posting work requests.
#[derive(Debug, PartialEq, Eq)]
pub enum PostError {
    /// The queue already holds its maximum outstanding requests.
    QueueFull,
    /// The queue pair has been destroyed.
    Destroyed,
    /// The buffer lacks the access the operation requires.
    MissingAccess,
}

impl std::fmt::Display for PostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull => write!(f, "work queue full"),
            Self::Destroyed => write!(f, "queue pair destroyed"),
            Self::MissingAccess => write!(f, "buffer lacks required access"),
        }
    }
}

impl std::error::Error for PostError {}
