#![forbid(unsafe_code)]
//! Volume orchestration: configuration, format and open, and the index kinds
//! a metadata layer builds on top.
//!
//! [`OpenVolume`] bundles a validated geometry, the cluster device and the
//! free-space allocator. Attributes and indexes are created against it; the
//! records that own them are the caller's business.

use fnt_types::align_up;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub use fnt_alloc::{AllocRequest, BitVector, FreeSpaceAllocator};
pub use fnt_block::{
    ByteDevice, ByteStore, ClusterDevice, DeviceRegion, FileByteDevice, MemByteDevice, ResidentBytes,
};
pub use fnt_error::{FntError, Result};
pub use fnt_extent::{
    AttributeOwner, AttributeSizes, AttributeStream, ClusterStream, ExtentList, MemoryOwner, Volume,
};
pub use fnt_index::{
    CollationRule, Collator, IndexConfig, IndexEntry, IndexHost, IndexTree, MemIndexHost, NodeId,
    UpperCase,
    filename_key, filename_of, filename_parent, multiple_u32_key, security_hash_key, u32_key,
};
pub use fnt_types::{ClusterRun, ClusterSize, Lcn, Vcn, VolumeGeometry};

// ── Configuration ───────────────────────────────────────────────────────────

/// Volume layout and tuning, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub cluster_size: u32,
    /// Clusters in the volume; 0 takes every whole cluster of the device.
    pub total_clusters: u64,
    /// Leading clusters marked allocated at format time (boot region).
    pub reserved_clusters: u64,
    /// Persist the volume bitmap in a device region starting at this LCN.
    /// Without it the bitmap lives in memory and the volume cannot be
    /// reopened.
    pub bitmap_lcn: Option<u64>,
    pub index_block_size: u32,
    /// Resident budget of each index root, in bytes.
    pub root_index_capacity: u32,
    /// Merge adjacent runs after every mapping change.
    pub collapse_on_write: bool,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            cluster_size: 4096,
            total_clusters: 0,
            reserved_clusters: 16,
            bitmap_lcn: None,
            index_block_size: 4096,
            root_index_capacity: 0x1c8,
            collapse_on_write: true,
        }
    }
}

impl VolumeConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| FntError::Format(format!("volume config: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| FntError::Format(format!("volume config: {e}")))
    }

    /// Check everything that does not depend on the device size.
    pub fn validate(&self) -> Result<()> {
        self.cluster_size()?;
        for purpose in IndexPurpose::ALL {
            self.index_config(purpose).validate()?;
        }
        if self.total_clusters > 0 {
            self.check_layout(self.total_clusters)?;
        }
        Ok(())
    }

    pub fn cluster_size(&self) -> Result<ClusterSize> {
        ClusterSize::new(self.cluster_size).map_err(|e| FntError::InvalidGeometry(e.to_string()))
    }

    /// Geometry on a device of `device_bytes` bytes.
    pub fn geometry(&self, device_bytes: u64) -> Result<VolumeGeometry> {
        self.validate()?;
        let cluster_size = self.cluster_size()?;
        let available = device_bytes / cluster_size.as_u64();
        let total_clusters = match self.total_clusters {
            0 => available,
            n if n <= available => n,
            n => {
                return Err(FntError::InvalidGeometry(format!(
                    "volume of {n} clusters does not fit a device of {available}"
                )));
            }
        };
        self.check_layout(total_clusters)?;
        Ok(VolumeGeometry {
            cluster_size,
            total_clusters,
        })
    }

    /// Bytes of a bitmap covering `total_clusters`.
    #[must_use]
    pub fn bitmap_bytes(total_clusters: u64) -> u64 {
        align_up(total_clusters.div_ceil(8), 8).unwrap_or(u64::MAX)
    }

    /// Clusters reserved for a persisted bitmap.
    #[must_use]
    pub fn bitmap_clusters(&self, total_clusters: u64) -> u64 {
        if self.bitmap_lcn.is_none() {
            return 0;
        }
        Self::bitmap_bytes(total_clusters).div_ceil(u64::from(self.cluster_size.max(1)))
    }

    fn check_layout(&self, total_clusters: u64) -> Result<()> {
        if total_clusters == 0 {
            return Err(FntError::InvalidGeometry("volume has no clusters".into()));
        }
        if self.reserved_clusters > total_clusters {
            return Err(FntError::InvalidGeometry(format!(
                "{} reserved clusters exceed the {total_clusters}-cluster volume",
                self.reserved_clusters
            )));
        }
        if let Some(lcn) = self.bitmap_lcn {
            let end = lcn.saturating_add(self.bitmap_clusters(total_clusters));
            if lcn < self.reserved_clusters || end > total_clusters {
                return Err(FntError::InvalidGeometry(format!(
                    "bitmap region {lcn}..{end} must lie between the reserved area and cluster {total_clusters}"
                )));
            }
        }
        Ok(())
    }

    /// Index shape for `purpose` under this volume's block and root sizes.
    #[must_use]
    pub fn index_config(&self, purpose: IndexPurpose) -> IndexConfig {
        IndexConfig {
            collation: purpose.collation(),
            attribute_type: purpose.attribute_type(),
            block_size: self.index_block_size,
            root_capacity: self.root_index_capacity,
            file_index: purpose.file_index(),
        }
    }
}

// ── Index kinds ─────────────────────────────────────────────────────────────

/// The index kinds found on an NTFS volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexPurpose {
    /// File names of a directory.
    Directory,
    /// Security descriptors by hash.
    SecurityHash,
    /// Security descriptors by id.
    SecurityId,
    /// Object ids.
    ObjectId,
    /// Quota owners by SID.
    QuotaOwner,
    /// Quota records by owner id.
    QuotaId,
}

impl IndexPurpose {
    pub const ALL: [Self; 6] = [
        Self::Directory,
        Self::SecurityHash,
        Self::SecurityId,
        Self::ObjectId,
        Self::QuotaOwner,
        Self::QuotaId,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Directory => "$I30",
            Self::SecurityHash => "$SDH",
            Self::SecurityId => "$SII",
            Self::ObjectId | Self::QuotaOwner => "$O",
            Self::QuotaId => "$Q",
        }
    }

    #[must_use]
    pub fn collation(self) -> CollationRule {
        match self {
            Self::Directory => CollationRule::Filename,
            Self::SecurityHash => CollationRule::SecurityHash,
            Self::SecurityId | Self::QuotaId => CollationRule::UnsignedLong,
            Self::ObjectId => CollationRule::MultipleUnsignedLongs,
            Self::QuotaOwner => CollationRule::Sid,
        }
    }

    #[must_use]
    pub fn attribute_type(self) -> u32 {
        match self {
            Self::Directory => 0x30,
            _ => 0,
        }
    }

    #[must_use]
    pub fn file_index(self) -> bool {
        matches!(self, Self::Directory)
    }
}

// ── OpenVolume ──────────────────────────────────────────────────────────────

/// A formatted or reopened volume.
#[derive(Debug)]
pub struct OpenVolume {
    config: VolumeConfig,
    geometry: VolumeGeometry,
    volume: Volume,
    upcase: UpperCase,
}

impl OpenVolume {
    /// Lay out a fresh volume on `dev`: empty bitmap, reserved area and
    /// bitmap region marked allocated.
    pub fn format(dev: Arc<dyn ByteDevice>, config: &VolumeConfig) -> Result<Self> {
        let geometry = config.geometry(dev.len_bytes())?;
        let total = geometry.total_clusters;
        let cdev = ClusterDevice::new(dev, geometry.cluster_size)?;
        let store = Self::bitmap_store(&cdev, config, total, 0)?;
        let mut alloc = FreeSpaceAllocator::new(BitVector::create(store, total)?, total)?;
        alloc.mark_allocated(ClusterRun::new(0, config.reserved_clusters))?;
        if let Some(lcn) = config.bitmap_lcn {
            alloc.mark_allocated(ClusterRun::new(lcn, config.bitmap_clusters(total)))?;
        }
        let volume = Volume::new(cdev, alloc)?;
        volume.sync()?;
        debug!(
            total_clusters = total,
            cluster_size = geometry.cluster_size.get(),
            persisted_bitmap = config.bitmap_lcn.is_some(),
            "volume_format"
        );
        Ok(Self {
            config: config.clone(),
            geometry,
            volume,
            upcase: UpperCase::builtin(),
        })
    }

    /// Reopen a volume whose bitmap was persisted at `config.bitmap_lcn`.
    pub fn open(dev: Arc<dyn ByteDevice>, config: &VolumeConfig) -> Result<Self> {
        if config.bitmap_lcn.is_none() {
            return Err(FntError::Format(
                "volume bitmap is memory-resident; nothing to reopen".into(),
            ));
        }
        let geometry = config.geometry(dev.len_bytes())?;
        let total = geometry.total_clusters;
        let cdev = ClusterDevice::new(dev, geometry.cluster_size)?;
        let store = Self::bitmap_store(&cdev, config, total, VolumeConfig::bitmap_bytes(total))?;
        let alloc = FreeSpaceAllocator::new(BitVector::open(store, total)?, total)?;
        let volume = Volume::new(cdev, alloc)?;
        debug!(
            total_clusters = total,
            allocated = volume.allocator().allocated_clusters(),
            "volume_open"
        );
        Ok(Self {
            config: config.clone(),
            geometry,
            volume,
            upcase: UpperCase::builtin(),
        })
    }

    /// Format a file-backed volume of `len` bytes at `path`.
    pub fn format_file(path: impl AsRef<Path>, len: u64, config: &VolumeConfig) -> Result<Self> {
        let dev = FileByteDevice::create(path, len)?;
        Self::format(Arc::new(dev), config)
    }

    pub fn open_file(path: impl AsRef<Path>, config: &VolumeConfig) -> Result<Self> {
        let dev = FileByteDevice::open(path)?;
        Self::open(Arc::new(dev), config)
    }

    fn bitmap_store(
        cdev: &ClusterDevice,
        config: &VolumeConfig,
        total: u64,
        len: u64,
    ) -> Result<Box<dyn ByteStore>> {
        let store: Box<dyn ByteStore> = match config.bitmap_lcn {
            Some(lcn) => Box::new(DeviceRegion::new(
                cdev.clone(),
                lcn,
                config.bitmap_clusters(total),
                len,
            )?),
            None => Box::new(ResidentBytes::new()),
        };
        Ok(store)
    }

    #[must_use]
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    #[must_use]
    pub fn geometry(&self) -> VolumeGeometry {
        self.geometry
    }

    #[must_use]
    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn volume_mut(&mut self) -> &mut Volume {
        &mut self.volume
    }

    #[must_use]
    pub fn upcase(&self) -> &UpperCase {
        &self.upcase
    }

    /// Replace the upper-case table used by indexes opened from now on.
    pub fn set_upcase(&mut self, upcase: UpperCase) {
        self.upcase = upcase;
    }

    /// A new, empty non-resident attribute.
    #[must_use]
    pub fn create_attribute(&self, owner: Box<dyn AttributeOwner>) -> AttributeStream {
        AttributeStream::create(owner).collapse_on_write(self.config.collapse_on_write)
    }

    /// An existing non-resident attribute.
    pub fn open_attribute(
        &self,
        extents: ExtentList,
        data_length: u64,
        owner: Box<dyn AttributeOwner>,
    ) -> Result<AttributeStream> {
        Ok(AttributeStream::open(&self.volume, extents, data_length, owner)?
            .collapse_on_write(self.config.collapse_on_write))
    }

    pub fn create_index(
        &self,
        purpose: IndexPurpose,
        root: Box<dyn ByteStore>,
        host: Box<dyn IndexHost>,
    ) -> Result<IndexTree> {
        debug!(index = purpose.name(), "volume_create_index");
        IndexTree::create(
            &self.volume,
            self.config.index_config(purpose),
            &self.upcase,
            root,
            host,
        )
    }

    pub fn open_index(
        &self,
        purpose: IndexPurpose,
        root: Box<dyn ByteStore>,
        host: Box<dyn IndexHost>,
    ) -> Result<IndexTree> {
        IndexTree::open(
            &self.volume,
            self.config.index_config(purpose),
            &self.upcase,
            root,
            host,
        )
    }

    pub fn sync(&self) -> Result<()> {
        self.volume.sync()
    }
}
