use crate::collation::CollationRule;
use fnt_error::{FntError, Result};
use fnt_ondisk::{INDEX_ENTRY_HEADER_SIZE, INDEX_HEADER_SIZE, INDEX_ROOT_HEADER_SIZE, indx_entry_capacity};
use fnt_types::{ClusterSize, SECTOR_SIZE};
use serde::{Deserialize, Serialize};

/// Encoded size of an End entry carrying a child pointer.
pub const END_WITH_CHILD_SIZE: usize = INDEX_ENTRY_HEADER_SIZE + 8;

/// Fixed overhead of a resident INDEX_ROOT value ahead of its entries.
pub const ROOT_OVERHEAD: usize = INDEX_ROOT_HEADER_SIZE + INDEX_HEADER_SIZE;

/// Shape of one index, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub collation: CollationRule,
    /// Attribute type being indexed: 0x30 for file names, 0 for view indexes.
    pub attribute_type: u32,
    /// Bytes per overflow block.
    pub block_size: u32,
    /// Largest encoded INDEX_ROOT value the owning record will hold.
    pub root_capacity: u32,
    /// Entries carry an inline 8-byte file reference instead of data.
    pub file_index: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            collation: CollationRule::Binary,
            attribute_type: 0,
            block_size: 4096,
            root_capacity: 0x1c8,
            file_index: false,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size < SECTOR_SIZE || self.block_size % SECTOR_SIZE != 0 {
            return Err(FntError::InvalidGeometry(format!(
                "index block size {} is not a multiple of {SECTOR_SIZE}",
                self.block_size
            )));
        }
        if (self.root_capacity as usize) < ROOT_OVERHEAD + END_WITH_CHILD_SIZE {
            return Err(FntError::InvalidGeometry(format!(
                "index root capacity {} cannot hold an end entry with a child",
                self.root_capacity
            )));
        }
        if self.root_entry_capacity() > self.block_entry_capacity() {
            return Err(FntError::InvalidGeometry(format!(
                "index root capacity {} holds more than one {}-byte block",
                self.root_capacity, self.block_size
            )));
        }
        if self.max_entry_size() <= END_WITH_CHILD_SIZE {
            return Err(FntError::InvalidGeometry(format!(
                "index block size {} leaves no room for entries",
                self.block_size
            )));
        }
        Ok(())
    }

    /// Bytes available for entries in one overflow block.
    #[must_use]
    pub fn block_entry_capacity(&self) -> usize {
        indx_entry_capacity(self.block_size as usize)
    }

    /// Bytes available for entries in the resident root.
    #[must_use]
    pub fn root_entry_capacity(&self) -> usize {
        (self.root_capacity as usize).saturating_sub(ROOT_OVERHEAD)
    }

    /// Largest entry (counting a child pointer) the tree accepts. Any two
    /// such entries plus an End entry fit one block, so a block that
    /// overflows always holds at least three real entries.
    #[must_use]
    pub fn max_entry_size(&self) -> usize {
        self.block_entry_capacity().saturating_sub(END_WITH_CHILD_SIZE) / 2
    }

    /// Addressing unit of block VCNs: `(unit_bytes, units_per_block)`.
    /// Blocks at least a cluster wide are addressed in clusters, smaller
    /// blocks in 512-byte units.
    #[must_use]
    pub fn block_units(&self, cluster_size: ClusterSize) -> (u64, u64) {
        let unit = if self.block_size >= cluster_size.get() {
            cluster_size.get()
        } else {
            SECTOR_SIZE
        };
        (u64::from(unit), u64::from(self.block_size / unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        IndexConfig::default().validate().expect("valid");
    }

    #[test]
    fn rejects_bad_geometry() {
        let odd = IndexConfig {
            block_size: 1000,
            ..IndexConfig::default()
        };
        assert!(matches!(odd.validate(), Err(FntError::InvalidGeometry(_))));

        let tiny_root = IndexConfig {
            root_capacity: 0x30,
            ..IndexConfig::default()
        };
        assert!(tiny_root.validate().is_err());

        let root_wider_than_block = IndexConfig {
            block_size: 512,
            root_capacity: 4096,
            ..IndexConfig::default()
        };
        assert!(matches!(
            root_wider_than_block.validate(),
            Err(FntError::InvalidGeometry(_))
        ));

        let root_as_wide_as_block = IndexConfig {
            block_size: 512,
            root_capacity: 0x20 + (512 - 0x30),
            ..IndexConfig::default()
        };
        root_as_wide_as_block.validate().expect("equal capacities");
    }

    #[test]
    fn block_addressing_units() {
        let cfg = IndexConfig::default();
        let small = ClusterSize::new(512).expect("cs");
        let large = ClusterSize::new(8192).expect("cs");
        assert_eq!(cfg.block_units(small), (512, 8));
        assert_eq!(cfg.block_units(ClusterSize::new(4096).expect("cs")), (4096, 1));
        assert_eq!(cfg.block_units(large), (512, 8));
    }

    #[test]
    fn entry_limits() {
        let cfg = IndexConfig::default();
        assert_eq!(cfg.block_entry_capacity(), 4096 - 0x40);
        assert_eq!(cfg.root_entry_capacity(), 0x1c8 - 0x20);
        assert_eq!(cfg.max_entry_size(), (4096 - 0x40 - 0x18) / 2);
    }

    #[test]
    fn config_from_json() {
        let cfg: IndexConfig =
            serde_json::from_str(r#"{"collation":"Filename","file_index":true,"attribute_type":48}"#)
                .expect("parse");
        assert_eq!(cfg.collation, CollationRule::Filename);
        assert!(cfg.file_index);
        assert_eq!(cfg.block_size, 4096);
    }
}
