#![forbid(unsafe_code)]
//! FrankenNTFS public API facade.
//!
//! Re-exports `fnt-core`, which in turn surfaces the allocator, extent and
//! index types a metadata layer needs.

pub use fnt_core::*;
