//! The shared memory region.
//!
//! The region the client is given access to is a mapping table followed
//! by the data buffer:
//!
//! ```text
//! ┌──────────────────────────┬─────────────┬─────────────┬────
//! │ table: 8 bytes per block │ block 0     │ block 1     │ ...
//! └──────────────────────────┴─────────────┴─────────────┴────
//! ```
//!
//! Each data block starts initialized with a sentinel byte so the peer
//! can verify it is really reading server memory.

use remora_fabric::{AccessFlags, ProtectionDomain, RegionDescriptor, RegionHandle};

use crate::error::ServerError;

/// Byte written at the start of every data block.
pub const BLOCK_SENTINEL: u8 = b'A';

/// Size of one mapping table entry.
pub const MAPPING_ENTRY_SIZE: u32 = 8;

pub struct MemoryRegion {
    handle: RegionHandle,
    data_size: u32,
    block_size: u32,
    block_count: u32,
    table_len: u32,
}

impl MemoryRegion {
    /// Allocate, initialize, and register the region.
    pub fn build(
        pd: &ProtectionDomain,
        data_size: u32,
        block_size: u32,
    ) -> Result<Self, ServerError> {
        if data_size == 0 || block_size == 0 {
            return Err(ServerError::InvalidRegionGeometry("sizes must be nonzero"));
        }
        if data_size % block_size != 0 {
            return Err(ServerError::InvalidRegionGeometry(
                "block size must divide data size",
            ));
        }

        let block_count = data_size / block_size;
        let table_len = block_count * MAPPING_ENTRY_SIZE;
        let total_len = data_size + table_len;

        let addr = pd.segment().alloc(total_len as usize)?;
        let handle = pd.register_region(
            addr,
            total_len,
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE,
        )?;

        handle.write_at(0, &vec![0u8; table_len as usize])?;
        for block in 0..block_count {
            handle.write_at(
                (table_len + block * block_size) as u64,
                &[BLOCK_SENTINEL],
            )?;
        }

        tracing::debug!(addr, total_len, block_count, "built memory region");

        Ok(Self {
            handle,
            data_size,
            block_size,
            block_count,
            table_len,
        })
    }

    /// Descriptor advertising the full region.
    pub fn descriptor(&self) -> RegionDescriptor {
        self.handle.descriptor()
    }

    pub fn handle(&self) -> &RegionHandle {
        &self.handle
    }

    /// Region-relative offset of data block `index`.
    pub fn block_offset(&self, index: u32) -> Option<u64> {
        if index < self.block_count {
            Some((self.table_len + index * self.block_size) as u64)
        } else {
            None
        }
    }

    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Length of the mapping table prefix.
    pub fn table_len(&self) -> u32 {
        self.table_len
    }

    /// Total registered length (table plus data).
    pub fn len(&self) -> u32 {
        self.table_len + self.data_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remora_fabric::{Segment, SegmentConfig};

    fn pd() -> ProtectionDomain {
        let segment =
            Segment::create_anonymous(SegmentConfig { data_capacity: 64 * 1024 }).unwrap();
        ProtectionDomain::new(segment)
    }

    #[test]
    fn classic_geometry() {
        let pd = pd();
        let region = MemoryRegion::build(&pd, 4096, 64).unwrap();
        assert_eq!(region.block_count(), 64);
        assert_eq!(region.table_len(), 512);
        assert_eq!(region.len(), 4608);
        assert_eq!(region.descriptor().len, 4608);
    }

    #[test]
    fn table_zeroed_and_blocks_sentineled() {
        let pd = pd();
        let region = MemoryRegion::build(&pd, 256, 64).unwrap();

        let table = region.handle().read_at(0, region.table_len() as usize).unwrap();
        assert!(table.iter().all(|&b| b == 0));

        for block in 0..region.block_count() {
            let offset = region.block_offset(block).unwrap();
            assert_eq!(region.handle().read_at(offset, 1).unwrap(), [BLOCK_SENTINEL]);
        }
        assert!(region.block_offset(region.block_count()).is_none());
    }

    #[test]
    fn geometry_validation() {
        let pd = pd();
        assert!(matches!(
            MemoryRegion::build(&pd, 4096, 0),
            Err(ServerError::InvalidRegionGeometry(_))
        ));
        assert!(matches!(
            MemoryRegion::build(&pd, 100, 64),
            Err(ServerError::InvalidRegionGeometry(_))
        ));
    }

    #[test]
    fn build_fails_when_segment_too_small() {
        let segment = Segment::create_anonymous(SegmentConfig { data_capacity: 512 }).unwrap();
        let pd = ProtectionDomain::new(segment);
        assert!(matches!(
            MemoryRegion::build(&pd, 4096, 64),
            Err(ServerError::Segment(_))
        ));
    }
}
