//! A cluster device paired with its free-space allocator.

use fnt_alloc::FreeSpaceAllocator;
use fnt_block::ClusterDevice;
use fnt_error::{FntError, Result};
use fnt_types::ClusterSize;

/// Everything an extent-mapped stream needs to move bytes and clusters.
#[derive(Debug)]
pub struct Volume {
    dev: ClusterDevice,
    alloc: FreeSpaceAllocator,
}

impl Volume {
    pub fn new(dev: ClusterDevice, alloc: FreeSpaceAllocator) -> Result<Self> {
        if alloc.total_clusters() > dev.cluster_count() {
            return Err(FntError::InvalidGeometry(format!(
                "allocator covers {} clusters but device holds {}",
                alloc.total_clusters(),
                dev.cluster_count()
            )));
        }
        Ok(Self { dev, alloc })
    }

    #[must_use]
    pub fn device(&self) -> &ClusterDevice {
        &self.dev
    }

    #[must_use]
    pub fn allocator(&self) -> &FreeSpaceAllocator {
        &self.alloc
    }

    pub fn allocator_mut(&mut self) -> &mut FreeSpaceAllocator {
        &mut self.alloc
    }

    #[must_use]
    pub fn cluster_size(&self) -> ClusterSize {
        self.dev.cluster_size()
    }

    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }
}
