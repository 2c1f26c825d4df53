//! Server error type.

use std::io;

use remora_fabric::{CmError, ConnId, PostError, SegmentError, WcStatus};

use crate::protocol::DecodeError;

#[derive(Debug)]
pub enum ServerError {
    Cm(CmError),
    Post(PostError),
    Segment(SegmentError),
    Io(io::Error),
    Decode(DecodeError),
    /// The peer sent a well-formed message the protocol does not allow in
    /// the current state.
    UnexpectedMessage(&'static str),
    /// A frame with an unrecognized kind arrived.
    UnknownEvent { conn: ConnId, kind: u8 },
    /// A connection manager event arrived out of sequence.
    EventOutOfOrder(&'static str),
    /// A handshake completion wait hit its deadline.
    CompletionTimeout { expected: usize, got: usize },
    /// A work request retired with an error status.
    CompletionFailed { wr_id: u64, status: WcStatus },
    /// The listener's event stream ended.
    ListenerClosed,
    /// data_size / block_size do not describe a valid region.
    InvalidRegionGeometry(&'static str),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cm(e) => write!(f, "connection manager: {}", e),
            Self::Post(e) => write!(f, "work request: {}", e),
            Self::Segment(e) => write!(f, "segment: {}", e),
            Self::Io(e) => write!(f, "io: {}", e),
            Self::Decode(e) => write!(f, "message decode: {}", e),
            Self::UnexpectedMessage(msg) => write!(f, "unexpected message: {}", msg),
            Self::UnknownEvent { conn, kind } => {
                write!(f, "unknown event kind {} on {}", kind, conn)
            }
            Self::EventOutOfOrder(msg) => write!(f, "event out of order: {}", msg),
            Self::CompletionTimeout { expected, got } => write!(
                f,
                "timed out waiting for completions: expected {}, got {}",
                expected, got
            ),
            Self::CompletionFailed { wr_id, status } => {
                write!(f, "work request {} failed with status {:?}", wr_id, status)
            }
            Self::ListenerClosed => write!(f, "listener event stream closed"),
            Self::InvalidRegionGeometry(msg) => write!(f, "invalid region geometry: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cm(e) => Some(e),
            Self::Post(e) => Some(e),
            Self::Segment(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CmError> for ServerError {
    fn from(e: CmError) -> Self {
        Self::Cm(e)
    }
}

impl From<PostError> for ServerError {
    fn from(e: PostError) -> Self {
        Self::Post(e)
    }
}

impl From<SegmentError> for ServerError {
    fn from(e: SegmentError) -> Self {
        Self::Segment(e)
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<DecodeError> for ServerError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}
