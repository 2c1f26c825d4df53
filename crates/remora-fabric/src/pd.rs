//! Protection domains and memory registration.
//!
//! A protection domain scopes registrations to one connection's segment.
//! Registering memory produces keys: the local key authorizes posting the
//! buffer on a queue pair, the remote key is handed to the peer inside a
//! descriptor and checked on every remote access.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::segment::{Segment, SegmentError};

bitflags::bitflags! {
    /// Access permissions attached to a registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// The owner may receive into this memory.
        const LOCAL_WRITE = 1;
        /// The peer may read this memory.
        const REMOTE_READ = 2;
        /// The peer may write this memory.
        const REMOTE_WRITE = 4;
    }
}

static NEXT_PD_NUM: AtomicU32 = AtomicU32::new(1);

/// Wire-exchangeable description of a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDescriptor {
    /// Segment-relative base address.
    pub addr: u64,
    /// Region length in bytes.
    pub len: u32,
    /// Remote access key.
    pub rkey: u32,
    /// Owner's local key.
    pub lkey: u32,
}

/// A protection domain bound to one segment.
pub struct ProtectionDomain {
    segment: Arc<Segment>,
    pd_num: u32,
}

impl ProtectionDomain {
    pub fn new(segment: Arc<Segment>) -> Self {
        Self {
            segment,
            pd_num: NEXT_PD_NUM.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Domain number, unique within the process.
    pub fn pd_num(&self) -> u32 {
        self.pd_num
    }

    /// The segment this domain registers memory in.
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// Register a heap buffer for message sends and receives.
    pub fn register_buffer(&self, bytes: Vec<u8>, access: AccessFlags) -> MessageBuffer {
        MessageBuffer {
            inner: Arc::new(BufferInner {
                bytes: Mutex::new(bytes),
                lkey: fresh_key(),
                access,
            }),
        }
    }

    /// Register a range of the segment's data area for remote access and
    /// publish its geometry and key in the segment header.
    pub fn register_region(
        &self,
        addr: u64,
        len: u32,
        access: AccessFlags,
    ) -> Result<RegionHandle, SegmentError> {
        // Probe the bounds up front so a bad registration fails here, not
        // on first access.
        self.segment.read_at(addr, len as usize)?;

        let handle = RegionHandle {
            segment: self.segment.clone(),
            addr,
            len,
            lkey: fresh_key(),
            rkey: fresh_key(),
            access,
        };

        let header = self.segment.header();
        header.region_addr.store(addr, Ordering::Release);
        header.region_len.store(len, Ordering::Release);
        header.region_rkey.store(handle.rkey, Ordering::Release);
        header.region_access.store(access.bits(), Ordering::Release);

        tracing::debug!(
            pd = self.pd_num,
            addr,
            len,
            rkey = handle.rkey,
            "registered region"
        );
        Ok(handle)
    }
}

struct BufferInner {
    bytes: Mutex<Vec<u8>>,
    lkey: u32,
    access: AccessFlags,
}

/// A registered heap buffer usable in work requests.
#[derive(Clone)]
pub struct MessageBuffer {
    inner: Arc<BufferInner>,
}

impl MessageBuffer {
    /// Local key for this buffer.
    pub fn lkey(&self) -> u32 {
        self.inner.lkey
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.inner.bytes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Access flags the buffer was registered with.
    pub fn access(&self) -> AccessFlags {
        self.inner.access
    }

    /// Copy the buffer contents out.
    pub fn read_to_vec(&self) -> Vec<u8> {
        self.inner.bytes.lock().unwrap().clone()
    }

    /// Overwrite the buffer contents with `bytes` (receive-side fill).
    /// The buffer keeps its registered length; shorter fills leave the
    /// tail untouched, longer fills are truncated.
    pub fn write(&self, bytes: &[u8]) -> usize {
        let mut guard = self.inner.bytes.lock().unwrap();
        let n = bytes.len().min(guard.len());
        guard[..n].copy_from_slice(&bytes[..n]);
        n
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("lkey", &self.inner.lkey)
            .field("len", &self.len())
            .field("access", &self.inner.access)
            .finish()
    }
}

/// A registered, remotely accessible region of the segment.
pub struct RegionHandle {
    segment: Arc<Segment>,
    addr: u64,
    len: u32,
    lkey: u32,
    rkey: u32,
    access: AccessFlags,
}

impl RegionHandle {
    /// Segment-relative base address.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Region length in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Access flags the region was registered with.
    pub fn access(&self) -> AccessFlags {
        self.access
    }

    /// Descriptor handed to the peer.
    pub fn descriptor(&self) -> RegionDescriptor {
        RegionDescriptor {
            addr: self.addr,
            len: self.len,
            rkey: self.rkey,
            lkey: self.lkey,
        }
    }

    /// Owner-side write at a region-relative offset.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), SegmentError> {
        self.check_range(offset, bytes.len())?;
        self.segment.write_at(self.addr + offset, bytes)
    }

    /// Owner-side read at a region-relative offset.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, SegmentError> {
        self.check_range(offset, len)?;
        self.segment.read_at(self.addr + offset, len)
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<(), SegmentError> {
        let end = offset.checked_add(len as u64);
        if matches!(end, Some(e) if e <= self.len as u64) {
            Ok(())
        } else {
            Err(SegmentError::OutOfBounds {
                addr: self.addr + offset,
                len,
                size: self.segment.size(),
            })
        }
    }
}

/// Nonzero random key for a fresh registration.
fn fresh_key() -> u32 {
    loop {
        let key: u32 = rand::random();
        if key != 0 {
            return key;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentConfig;

    fn pd() -> ProtectionDomain {
        let segment = Segment::create_anonymous(SegmentConfig { data_capacity: 1024 }).unwrap();
        ProtectionDomain::new(segment)
    }

    #[test]
    fn buffer_registration_roundtrip() {
        let pd = pd();
        let buf = pd.register_buffer(vec![0u8; 32], AccessFlags::LOCAL_WRITE);
        assert_eq!(buf.len(), 32);
        assert_ne!(buf.lkey(), 0);

        assert_eq!(buf.write(b"hello"), 5);
        assert_eq!(&buf.read_to_vec()[..5], b"hello");

        // Fills are clamped to the registered length.
        assert_eq!(buf.write(&[7u8; 64]), 32);
    }

    #[test]
    fn region_registration_publishes_header() {
        let pd = pd();
        let addr = pd.segment().alloc(128).unwrap();
        let region = pd
            .register_region(addr, 128, AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE)
            .unwrap();

        let header = pd.segment().header();
        assert_eq!(header.region_addr.load(Ordering::Acquire), addr);
        assert_eq!(header.region_len.load(Ordering::Acquire), 128);
        assert_eq!(
            header.region_rkey.load(Ordering::Acquire),
            region.descriptor().rkey
        );
        assert_eq!(
            header.region_access.load(Ordering::Acquire),
            (AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE).bits()
        );
    }

    #[test]
    fn region_bounds_are_region_relative() {
        let pd = pd();
        let addr = pd.segment().alloc(64).unwrap();
        let region = pd.register_region(addr, 64, AccessFlags::REMOTE_READ).unwrap();

        region.write_at(0, b"abc").unwrap();
        assert_eq!(region.read_at(0, 3).unwrap(), b"abc");
        assert!(region.write_at(62, b"abc").is_err());
        assert!(region.read_at(64, 1).is_err());
    }

    #[test]
    fn register_region_rejects_out_of_segment() {
        let pd = pd();
        assert!(pd
            .register_region(0, 8, AccessFlags::REMOTE_READ)
            .is_err());
        let addr = pd.segment().alloc(8).unwrap();
        assert!(pd.register_region(addr, 4096, AccessFlags::REMOTE_READ).is_err());
    }
}
