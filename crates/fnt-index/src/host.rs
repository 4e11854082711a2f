//! Storage an index tree borrows from the record that owns it.
//!
//! The root lives in a resident attribute handed to the tree directly. The
//! block bitmap and the index-allocation attribute only exist once the root
//! has overflowed, so the tree asks its [`IndexHost`] for them lazily.

use fnt_block::{ByteStore, ResidentBytes};
use fnt_error::Result;
use fnt_extent::{AttributeSizes, AttributeStream, MemoryOwner, Volume};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

pub trait IndexHost: fmt::Debug {
    /// The block bitmap, if the index has overflowed before.
    fn open_bitmap(&mut self) -> Result<Option<Box<dyn ByteStore>>>;

    /// Create an empty block bitmap.
    fn create_bitmap(&mut self) -> Result<Box<dyn ByteStore>>;

    /// The index-allocation attribute, if the index has overflowed before.
    fn open_allocation(&mut self, vol: &Volume) -> Result<Option<AttributeStream>>;

    /// Create an empty index-allocation attribute.
    fn create_allocation(&mut self) -> Result<AttributeStream>;

    /// Forget both overflow attributes. Clusters are released by the caller
    /// before this is invoked.
    fn remove_overflow(&mut self) -> Result<()>;
}

#[derive(Debug, Default)]
struct HostState {
    bitmap: Option<ResidentBytes>,
    allocation: Option<MemoryOwner>,
}

/// [`IndexHost`] keeping both overflow attributes in memory. Clones share
/// state, which lets a test reopen an index from what the first tree left
/// behind.
#[derive(Debug, Clone, Default)]
pub struct MemIndexHost {
    state: Arc<Mutex<HostState>>,
}

impl MemIndexHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn has_overflow(&self) -> bool {
        let state = self.state.lock();
        state.bitmap.is_some() || state.allocation.is_some()
    }

    #[must_use]
    pub fn bitmap_bytes(&self) -> Option<Vec<u8>> {
        self.state.lock().bitmap.as_ref().map(ResidentBytes::contents)
    }

    #[must_use]
    pub fn allocation_sizes(&self) -> Option<AttributeSizes> {
        self.state.lock().allocation.as_ref().map(MemoryOwner::sizes)
    }
}

impl IndexHost for MemIndexHost {
    fn open_bitmap(&mut self) -> Result<Option<Box<dyn ByteStore>>> {
        Ok(self
            .state
            .lock()
            .bitmap
            .clone()
            .map(|bytes| Box::new(bytes) as Box<dyn ByteStore>))
    }

    fn create_bitmap(&mut self) -> Result<Box<dyn ByteStore>> {
        let bytes = ResidentBytes::new();
        self.state.lock().bitmap = Some(bytes.clone());
        Ok(Box::new(bytes))
    }

    fn open_allocation(&mut self, vol: &Volume) -> Result<Option<AttributeStream>> {
        let Some(owner) = self.state.lock().allocation.clone() else {
            return Ok(None);
        };
        let extents = owner.extents()?;
        let data_length = owner.sizes().data_length;
        AttributeStream::open(vol, extents, data_length, Box::new(owner)).map(Some)
    }

    fn create_allocation(&mut self) -> Result<AttributeStream> {
        let owner = MemoryOwner::new();
        self.state.lock().allocation = Some(owner.clone());
        Ok(AttributeStream::create(Box::new(owner)))
    }

    fn remove_overflow(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.bitmap = None;
        state.allocation = None;
        Ok(())
    }
}
