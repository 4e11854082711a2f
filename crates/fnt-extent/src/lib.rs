#![forbid(unsafe_code)]
//! Extent mapping: attribute cluster to volume cluster resolution.
//!
//! [`ExtentList`] holds the decoded run list of one non-resident attribute,
//! possibly spread over several record segments. [`ClusterStream`] turns
//! cluster reads and writes against that list into device I/O, allocating
//! on first write into a sparse run and releasing on punch or truncate.
//! [`AttributeStream`] adds byte addressing and a data length on top.

pub mod attribute;
pub mod extents;
pub mod stream;
pub mod volume;

pub use attribute::{AttributeOwner, AttributeSizes, AttributeStream, MemoryOwner};
pub use extents::{CookedRun, ExtentList};
pub use stream::ClusterStream;
pub use volume::Volume;

#[cfg(test)]
pub(crate) mod tests_support {
    use crate::Volume;
    use fnt_alloc::{BitVector, FreeSpaceAllocator};
    use fnt_block::{ClusterDevice, MemByteDevice, ResidentBytes};
    use fnt_types::ClusterSize;
    use std::sync::Arc;

    /// An empty volume of `clusters` 512-byte clusters held in memory.
    pub fn test_volume(clusters: usize) -> Volume {
        let cs = ClusterSize::new(512).expect("cluster size");
        let dev = ClusterDevice::new(Arc::new(MemByteDevice::new(clusters * 512)), cs)
            .expect("device");
        let bitmap =
            BitVector::create(Box::new(ResidentBytes::new()), clusters as u64).expect("bitmap");
        let alloc = FreeSpaceAllocator::new(bitmap, clusters as u64).expect("allocator");
        Volume::new(dev, alloc).expect("volume")
    }
}
