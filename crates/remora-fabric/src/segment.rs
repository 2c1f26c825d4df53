//! Shared memory segments.
//!
//! A segment is the per-connection unit of shared memory. The creator
//! (server) maps a file-backed region, initializes the header, and hands
//! the path to the peer through the connection manager rendezvous; the
//! peer maps the same file. Registered memory regions live in the data
//! area and are addressed by segment-relative offsets, so both mappings
//! agree on addresses regardless of where the kernel placed them.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Segment Header (64 bytes, cache-line aligned)│
//! ├───────────────────────────────────────────────┤
//! │  Data area (bump-allocated registrations)     │
//! └───────────────────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::{Arc, Mutex};

/// Magic bytes identifying a remora segment.
pub const MAGIC: [u8; 8] = *b"REMORA\0\0";

/// Current protocol version (major in the high 16 bits).
pub const PROTOCOL_VERSION: u32 = 1 << 16; // v1.0

/// Default data-area capacity.
pub const DEFAULT_DATA_CAPACITY: usize = 256 * 1024;

const MAX_DATA_CAPACITY: usize = 512 * 1024 * 1024;

/// Segment header at the start of the mapping (64 bytes).
///
/// The region fields are published by the registering side and read by
/// the peer to validate descriptors, standing in for NIC-side rkey
/// enforcement.
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Magic bytes: "REMORA\0\0".
    pub magic: [u8; 8],
    /// Protocol version (major.minor packed).
    pub version: u32,
    /// Feature flags (unused, zero).
    pub flags: u32,
    /// Size of the data area in bytes.
    pub data_capacity: u64,

    /// Published registered-region base address (segment-relative).
    pub region_addr: AtomicU64,
    /// Published registered-region length.
    pub region_len: AtomicU32,
    /// Published remote access key.
    pub region_rkey: AtomicU32,
    /// Published access permissions (AccessFlags bits).
    pub region_access: AtomicU32,

    _pad: [u8; 20],
}

const _: () = assert!(core::mem::size_of::<SegmentHeader>() == 64);

impl SegmentHeader {
    fn init(&mut self, data_capacity: u64) {
        self.magic = MAGIC;
        self.version = PROTOCOL_VERSION;
        self.flags = 0;
        self.data_capacity = data_capacity;
        self.region_addr = AtomicU64::new(0);
        self.region_len = AtomicU32::new(0);
        self.region_rkey = AtomicU32::new(0);
        self.region_access = AtomicU32::new(0);
        self._pad = [0; 20];
    }

    /// Validate magic and major version.
    pub fn validate(&self) -> Result<(), SegmentError> {
        if self.magic != MAGIC {
            return Err(SegmentError::InvalidMagic);
        }
        if self.version >> 16 != PROTOCOL_VERSION >> 16 {
            return Err(SegmentError::IncompatibleVersion {
                expected: PROTOCOL_VERSION,
                found: self.version,
            });
        }
        Ok(())
    }
}

/// Byte offset of the data area within the segment.
pub const fn data_offset() -> usize {
    core::mem::size_of::<SegmentHeader>()
}

/// Total mapping size for a given data-area capacity.
pub const fn total_size(data_capacity: usize) -> usize {
    data_offset() + data_capacity
}

/// Configuration for creating a segment.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Capacity of the data area in bytes.
    pub data_capacity: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            data_capacity: DEFAULT_DATA_CAPACITY,
        }
    }
}

#[derive(Debug)]
enum MappingKind {
    Anonymous,
    /// File-backed; `owned` mappings unlink the file when dropped.
    File {
        path: PathBuf,
        owned: bool,
    },
}

#[derive(Debug)]
struct Mapping {
    base: usize,
    size: usize,
    kind: MappingKind,
}

impl Mapping {
    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        self.base as *mut u8
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base_ptr() as *mut libc::c_void, self.size) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            tracing::error!(error = %err, size = self.size, "munmap failed for segment mapping");
        } else {
            tracing::debug!(size = self.size, "unmapped segment");
        }

        if let MappingKind::File { path, owned: true } = &self.kind {
            if let Err(err) = std::fs::remove_file(path) {
                tracing::warn!(error = %err, path = %path.display(), "failed to unlink segment file");
            }
        }
    }
}

/// A mapped shared memory segment.
pub struct Segment {
    mapping: Mapping,
    data_capacity: usize,
    /// Bump allocator cursor over the data area (creator side only).
    next_alloc: Mutex<usize>,
}

// SAFETY: the raw mapping is shared between peers, but every access goes
// through bounds-checked copies or the atomics in the header; the
// alternating message protocol serializes region accesses.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a file-backed segment, initializing the header. The file is
    /// created (or truncated) and unlinked when this segment is dropped.
    pub fn create_file(
        path: impl AsRef<Path>,
        config: SegmentConfig,
    ) -> Result<Arc<Self>, SegmentError> {
        let path = path.as_ref().to_path_buf();
        validate_config(&config)?;
        let size = total_size(config.data_capacity);

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size as u64)?;

        let base = map_file(&file, size)?;
        drop(file);

        tracing::debug!(size, path = %path.display(), "created segment");

        let segment = Self {
            mapping: Mapping {
                base,
                size,
                kind: MappingKind::File { path, owned: true },
            },
            data_capacity: config.data_capacity,
            next_alloc: Mutex::new(0),
        };
        unsafe {
            (*(segment.mapping.base_ptr() as *mut SegmentHeader))
                .init(config.data_capacity as u64);
        }
        Ok(Arc::new(segment))
    }

    /// Open an existing file-backed segment created by the peer and
    /// validate its header. The data capacity is read from the header.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Arc<Self>, SegmentError> {
        let path = path.as_ref().to_path_buf();

        let file = std::fs::OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len() as usize;
        if len < data_offset() {
            return Err(SegmentError::InvalidConfig("segment file smaller than header"));
        }

        let base = map_file(&file, len)?;
        drop(file);

        let segment = Self {
            mapping: Mapping {
                base,
                size: len,
                kind: MappingKind::File { path, owned: false },
            },
            data_capacity: len - data_offset(),
            next_alloc: Mutex::new(0),
        };

        segment.header().validate()?;
        if segment.header().data_capacity as usize != segment.data_capacity {
            return Err(SegmentError::InvalidConfig(
                "segment file length disagrees with header capacity",
            ));
        }

        tracing::debug!(size = len, "opened segment");
        Ok(Arc::new(segment))
    }

    /// Create an anonymous segment (in-process use, mainly tests).
    pub fn create_anonymous(config: SegmentConfig) -> Result<Arc<Self>, SegmentError> {
        validate_config(&config)?;
        let size = total_size(config.data_capacity);
        let base = map_anonymous(size)?;

        let segment = Self {
            mapping: Mapping {
                base,
                size,
                kind: MappingKind::Anonymous,
            },
            data_capacity: config.data_capacity,
            next_alloc: Mutex::new(0),
        };
        unsafe {
            (*(segment.mapping.base_ptr() as *mut SegmentHeader))
                .init(config.data_capacity as u64);
        }
        Ok(Arc::new(segment))
    }

    /// The segment header.
    #[inline]
    pub fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.mapping.base_ptr() as *const SegmentHeader) }
    }

    /// Backing file path, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.mapping.kind {
            MappingKind::File { path, .. } => Some(path),
            MappingKind::Anonymous => None,
        }
    }

    /// Total mapping size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.mapping.size
    }

    /// Data-area capacity in bytes.
    #[inline]
    pub fn data_capacity(&self) -> usize {
        self.data_capacity
    }

    /// Allocate `len` bytes from the data area, 8-byte aligned.
    ///
    /// Returns the segment-relative address. There is no free: the data
    /// area lives as long as its connection.
    pub fn alloc(&self, len: usize) -> Result<u64, SegmentError> {
        let mut cursor = self.next_alloc.lock().unwrap();
        let start = (*cursor + 7) & !7;
        let end = start
            .checked_add(len)
            .ok_or(SegmentError::InvalidConfig("allocation size overflow"))?;
        if end > self.data_capacity {
            return Err(SegmentError::OutOfSpace {
                requested: len,
                available: self.data_capacity.saturating_sub(start),
            });
        }
        *cursor = end;
        Ok((data_offset() + start) as u64)
    }

    /// Copy bytes out of the segment. `addr` is segment-relative and must
    /// lie within the data area.
    pub fn read_at(&self, addr: u64, len: usize) -> Result<Vec<u8>, SegmentError> {
        self.check_range(addr, len)?;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.mapping.base_ptr().add(addr as usize),
                out.as_mut_ptr(),
                len,
            );
        }
        Ok(out)
    }

    /// Copy bytes into the segment at a segment-relative address.
    pub fn write_at(&self, addr: u64, bytes: &[u8]) -> Result<(), SegmentError> {
        self.check_range(addr, bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.mapping.base_ptr().add(addr as usize),
                bytes.len(),
            );
        }
        Ok(())
    }

    fn check_range(&self, addr: u64, len: usize) -> Result<(), SegmentError> {
        let start = addr as usize;
        let end = start.checked_add(len);
        let ok = start >= data_offset() && matches!(end, Some(e) if e <= self.mapping.size);
        if ok {
            Ok(())
        } else {
            Err(SegmentError::OutOfBounds {
                addr,
                len,
                size: self.mapping.size,
            })
        }
    }
}

fn validate_config(config: &SegmentConfig) -> Result<(), SegmentError> {
    if config.data_capacity == 0 {
        return Err(SegmentError::InvalidConfig("data_capacity must be > 0"));
    }
    if config.data_capacity > MAX_DATA_CAPACITY {
        return Err(SegmentError::InvalidConfig("data_capacity exceeds maximum"));
    }
    Ok(())
}

fn map_file(file: &std::fs::File, size: usize) -> Result<usize, SegmentError> {
    use std::os::unix::io::AsRawFd;

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(SegmentError::System(std::io::Error::last_os_error()));
    }
    Ok(ptr as usize)
}

fn map_anonymous(size: usize) -> Result<usize, SegmentError> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(SegmentError::System(std::io::Error::last_os_error()));
    }
    Ok(ptr as usize)
}

/// Errors from segment operations.
#[derive(Debug)]
pub enum SegmentError {
    /// Invalid configuration.
    InvalidConfig(&'static str),
    /// Header magic did not match.
    InvalidMagic,
    /// Header carries an incompatible major version.
    IncompatibleVersion { expected: u32, found: u32 },
    /// Data-area allocation failed.
    OutOfSpace { requested: usize, available: usize },
    /// Access outside the mapping.
    OutOfBounds { addr: u64, len: usize, size: usize },
    /// System error (mmap, file IO).
    System(std::io::Error),
}

impl std::fmt::Display for SegmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            Self::InvalidMagic => write!(f, "invalid segment magic"),
            Self::IncompatibleVersion { expected, found } => write!(
                f,
                "incompatible segment version: expected {}.{}, found {}.{}",
                expected >> 16,
                expected & 0xFFFF,
                found >> 16,
                found & 0xFFFF
            ),
            Self::OutOfSpace {
                requested,
                available,
            } => write!(
                f,
                "segment data area exhausted: requested {} bytes, {} available",
                requested, available
            ),
            Self::OutOfBounds { addr, len, size } => write!(
                f,
                "access out of bounds: addr {} len {} in segment of {} bytes",
                addr, len, size
            ),
            Self::System(e) => write!(f, "system error: {}", e),
        }
    }
}

impl std::error::Error for SegmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::System(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SegmentError {
    fn from(e: std::io::Error) -> Self {
        Self::System(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("remora-test-{}-{}.seg", tag, std::process::id()))
    }

    #[test]
    fn header_size() {
        assert_eq!(core::mem::size_of::<SegmentHeader>(), 64);
    }

    #[test]
    fn create_and_open_file_segment() {
        let path = temp_path("roundtrip");
        let created = Segment::create_file(&path, SegmentConfig { data_capacity: 4096 }).unwrap();
        assert_eq!(created.data_capacity(), 4096);
        assert!(path.exists());

        let opened = Segment::open_file(&path).unwrap();
        assert_eq!(opened.size(), created.size());
        opened.header().validate().unwrap();

        drop(opened);
        drop(created);
        // The creator unlinks the file on drop.
        assert!(!path.exists());
    }

    #[test]
    fn open_rejects_bad_magic() {
        let path = temp_path("badmagic");
        std::fs::write(&path, vec![0u8; total_size(64)]).unwrap();
        match Segment::open_file(&path) {
            Err(SegmentError::InvalidMagic) => {}
            other => panic!("expected InvalidMagic, got {:?}", other.map(|_| ())),
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn alloc_is_aligned_and_bounded() {
        let seg = Segment::create_anonymous(SegmentConfig { data_capacity: 64 }).unwrap();

        let a = seg.alloc(10).unwrap();
        assert_eq!(a, data_offset() as u64);
        let b = seg.alloc(8).unwrap();
        assert_eq!(b % 8, 0);
        assert!(b >= a + 10);

        match seg.alloc(1024) {
            Err(SegmentError::OutOfSpace { .. }) => {}
            other => panic!("expected OutOfSpace, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn read_write_roundtrip_and_bounds() {
        let seg = Segment::create_anonymous(SegmentConfig { data_capacity: 128 }).unwrap();
        let addr = seg.alloc(16).unwrap();

        seg.write_at(addr, b"hello remora").unwrap();
        assert_eq!(seg.read_at(addr, 12).unwrap(), b"hello remora");

        // Header is not addressable through data accessors.
        assert!(seg.write_at(0, &[1]).is_err());
        // Past the end.
        assert!(seg.read_at(addr, 4096).is_err());
    }

    #[test]
    fn shared_view_through_second_mapping() {
        let path = temp_path("shared");
        let a = Segment::create_file(&path, SegmentConfig { data_capacity: 128 }).unwrap();
        let b = Segment::open_file(&path).unwrap();

        let addr = a.alloc(8).unwrap();
        a.write_at(addr, b"ping").unwrap();
        assert_eq!(b.read_at(addr, 4).unwrap(), b"ping");

        b.write_at(addr, b"pong").unwrap();
        assert_eq!(a.read_at(addr, 4).unwrap(), b"pong");
    }
}
