#![forbid(unsafe_code)]
//! Index B+trees: directories and the metadata views keyed the same way.
//!
//! An index is a resident root node plus overflow blocks in a dedicated
//! non-resident attribute, tracked by a per-index block bitmap. Keys are
//! ordered by the index's [`CollationRule`] and unique across the tree.

pub mod collation;
pub mod config;
pub mod host;
pub mod keys;
pub mod tree;

pub use collation::{CollationRule, Collator, UpperCase};
pub use config::IndexConfig;
pub use host::{IndexHost, MemIndexHost};
pub use keys::{filename_key, filename_of, filename_parent, multiple_u32_key, security_hash_key, u32_key};
pub use fnt_ondisk::IndexEntry;
pub use tree::{IndexTree, NodeId};
