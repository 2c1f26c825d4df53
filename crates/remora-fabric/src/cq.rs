//! Completion queues and completion channels.
//!
//! Work requests retire as [`WorkCompletion`] entries on a bounded FIFO
//! queue. A queue may be armed for notification on a completion channel:
//! arming is one-shot, so the consumer drains, re-arms, and drains again
//! to close the window where a completion lands between the drain and the
//! arm.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::doorbell::Doorbell;

/// What kind of work request a completion retires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
}

/// Completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    Error,
}

/// One retired work request.
#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    /// Caller-chosen work request id.
    pub wr_id: u64,
    pub opcode: WcOpcode,
    /// Bytes transferred (received length for Recv, posted length for Send).
    pub byte_len: u32,
    pub status: WcStatus,
}

/// Notification channel shared by one or more completion queues.
pub struct CompChannel {
    bell: Doorbell,
    destroyed: AtomicBool,
}

impl CompChannel {
    /// Create a channel. Must be called within a tokio runtime.
    pub fn new() -> io::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            bell: Doorbell::new()?,
            destroyed: AtomicBool::new(false),
        }))
    }

    /// Wait for a notification from any armed queue on this channel.
    pub async fn wait(&self) -> io::Result<()> {
        if self.is_destroyed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "completion channel destroyed",
            ));
        }
        self.bell.wait().await
    }

    fn notify(&self) {
        self.bell.signal();
    }

    /// Tear the channel down. Destroying twice is an error.
    pub fn destroy(&self) -> Result<(), DestroyError> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Err(DestroyError::AlreadyDestroyed);
        }
        // Wake any waiter so it observes the destroyed flag.
        self.bell.signal();
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

/// A bounded completion queue.
pub struct CompletionQueue {
    capacity: usize,
    entries: Mutex<VecDeque<WorkCompletion>>,
    channel: Arc<CompChannel>,
    armed: AtomicBool,
    destroyed: AtomicBool,
}

impl CompletionQueue {
    pub fn new(capacity: usize, channel: Arc<CompChannel>) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            channel,
            armed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Maximum number of queued completions.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Arm the queue: the next pushed completion notifies the channel,
    /// then the queue disarms itself.
    pub fn req_notify(&self) {
        self.armed.store(true, Ordering::Release);
    }

    /// Retire a work request onto the queue. Called by queue pair drivers.
    pub(crate) fn push(&self, wc: WorkCompletion) {
        if self.is_destroyed() {
            tracing::warn!(wr_id = wc.wr_id, "completion dropped: queue destroyed");
            return;
        }
        let dropped = {
            let mut entries = self.entries.lock().unwrap();
            if entries.len() >= self.capacity {
                true
            } else {
                entries.push_back(wc);
                false
            }
        };
        if dropped {
            tracing::error!(
                wr_id = wc.wr_id,
                capacity = self.capacity,
                "completion queue overflow, dropping entry"
            );
        }
        // An armed waiter is woken even when the entry was dropped, so
        // it never sleeps out its deadline on work that already retired.
        if self.armed.swap(false, Ordering::AcqRel) {
            self.channel.notify();
        }
    }

    /// Drain up to `max` completions, oldest first.
    pub fn poll(&self, max: usize) -> Vec<WorkCompletion> {
        let mut entries = self.entries.lock().unwrap();
        let n = max.min(entries.len());
        entries.drain(..n).collect()
    }

    /// Tear the queue down. Destroying twice is an error.
    pub fn destroy(&self) -> Result<(), DestroyError> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Err(DestroyError::AlreadyDestroyed);
        }
        self.entries.lock().unwrap().clear();
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

/// Error from destroying an already-destroyed resource.
#[derive(Debug, PartialEq, Eq)]
pub enum DestroyError {
    AlreadyDestroyed,
}

impl std::fmt::Display for DestroyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyDestroyed => write!(f, "resource already destroyed"),
        }
    }
}

impl std::error::Error for DestroyError {}
