#![forbid(unsafe_code)]
//! On-disk encodings for NTFS-style run lists and index nodes.
//!
//! Pure codec crate: no I/O, no side effects. Decoders take byte slices and
//! return typed structures or a [`fnt_types::ParseError`]; encoders produce
//! bit-exact bytes.

pub mod index;
pub mod runs;

pub use index::{
    ENTRY_FLAG_END, ENTRY_FLAG_HAS_CHILD, INDEX_ENTRY_HEADER_SIZE, INDEX_HEADER_SIZE,
    INDEX_ROOT_HEADER_SIZE, IndexBlockHeader, IndexEntry, IndexHeader, IndexRootHeader,
    apply_fixups, decode_index_block, decode_index_root, encode_index_block, encode_index_root,
    entries_size, indx_entry_capacity, indx_layout, parse_entries, protect_fixups, write_node,
};
pub use runs::{RawRun, decode_runs, encode_runs, encoded_len};
