//! remora-fabric: a shared-memory remote-access fabric.
//!
//! One server-owned connection at a time; the peers rendezvous over a
//! control stream and share a file-backed memory segment:
//!
//! ```text
//!  server                                client
//!  ┌───────────────┐   control stream    ┌───────────────┐
//!  │ listener/cm   │◄───────────────────►│ RemoteClient  │
//!  │ pd + regions  │                     │ RemoteRegion  │
//!  │ qp ↔ cq ↔ bell│    shared segment   │               │
//!  │      mmap ────┼─────────────────────┼──── mmap      │
//!  └───────────────┘                     └───────────────┘
//! ```
//!
//! Messages posted on a queue pair travel as control frames and retire as
//! work completions; registered regions are accessed directly through the
//! mapping, gated by the keys published in the segment header.

pub mod client;
pub mod cm;
pub mod cq;
pub mod doorbell;
pub mod pd;
pub mod qp;
pub mod segment;
pub mod wire;

pub use client::{ClientError, RemoteClient, RemoteRegion};
pub use cm::{CmError, CmEvent, CmId, ConnId, ConnParam, Listener};
pub use cq::{CompChannel, CompletionQueue, DestroyError, WcOpcode, WcStatus, WorkCompletion};
pub use pd::{AccessFlags, MessageBuffer, ProtectionDomain, RegionDescriptor, RegionHandle};
pub use qp::{PostError, QpInitAttr, QueuePair};
pub use segment::{Segment, SegmentConfig, SegmentError};
