//! Byte-granular view of a non-resident attribute.
//!
//! [`AttributeStream`] sits on a [`ClusterStream`] and reduces unaligned
//! reads and writes to whole-cluster I/O through one scratch cluster. Every
//! change of length or mapping is reported to the record layer through
//! [`AttributeOwner`].

use crate::extents::ExtentList;
use crate::stream::ClusterStream;
use crate::volume::Volume;
use fnt_error::{FntError, Result};
use fnt_types::u64_to_usize;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Length fields of a non-resident attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSizes {
    pub data_length: u64,
    /// Mapped clusters (stored and sparse) in bytes.
    pub allocated_length: u64,
}

/// Callback into whatever record holds the attribute header.
pub trait AttributeOwner: fmt::Debug {
    /// Record new data and allocated lengths.
    fn set_lengths(&mut self, sizes: AttributeSizes) -> Result<()>;

    /// Replace the stored run list, one encoded list per segment.
    fn store_runs(&mut self, segments: &[(u64, Vec<u8>)]) -> Result<()>;
}

#[derive(Debug, Default)]
struct OwnerState {
    sizes: AttributeSizes,
    segments: Vec<(u64, Vec<u8>)>,
}

/// In-memory [`AttributeOwner`]. Clones share state, so a caller can keep
/// one handle and give another to the stream.
#[derive(Debug, Clone, Default)]
pub struct MemoryOwner {
    state: Arc<Mutex<OwnerState>>,
}

impl MemoryOwner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sizes(&self) -> AttributeSizes {
        self.state.lock().sizes
    }

    #[must_use]
    pub fn segments(&self) -> Vec<(u64, Vec<u8>)> {
        self.state.lock().segments.clone()
    }

    /// Decode the last stored run list.
    pub fn extents(&self) -> Result<ExtentList> {
        let segments = self.segments();
        let borrowed: Vec<(u64, &[u8])> = segments
            .iter()
            .map(|(vcn, bytes)| (*vcn, bytes.as_slice()))
            .collect();
        ExtentList::from_encoded(&borrowed)
    }
}

impl AttributeOwner for MemoryOwner {
    fn set_lengths(&mut self, sizes: AttributeSizes) -> Result<()> {
        self.state.lock().sizes = sizes;
        Ok(())
    }

    fn store_runs(&mut self, segments: &[(u64, Vec<u8>)]) -> Result<()> {
        self.state.lock().segments = segments.to_vec();
        Ok(())
    }
}

fn to_usize(value: u64) -> Result<usize> {
    u64_to_usize(value, "attribute offset").map_err(|e| FntError::Invariant(e.to_string()))
}

/// Byte-addressed non-resident attribute.
#[derive(Debug)]
pub struct AttributeStream {
    stream: ClusterStream,
    owner: Box<dyn AttributeOwner>,
    data_length: u64,
    scratch: Vec<u8>,
}

impl AttributeStream {
    /// A new, empty attribute.
    #[must_use]
    pub fn create(owner: Box<dyn AttributeOwner>) -> Self {
        Self {
            stream: ClusterStream::new(ExtentList::new()),
            owner,
            data_length: 0,
            scratch: Vec::new(),
        }
    }

    /// An existing attribute with the given mapping and data length.
    pub fn open(
        vol: &Volume,
        extents: ExtentList,
        data_length: u64,
        owner: Box<dyn AttributeOwner>,
    ) -> Result<Self> {
        let mapped = vol.cluster_size().clusters_for(data_length);
        if mapped > extents.next_vcn() {
            return Err(FntError::corruption(
                extents.next_vcn(),
                format!(
                    "data length {data_length} needs {mapped} clusters but only {} are mapped",
                    extents.next_vcn()
                ),
            ));
        }
        extents.check_invariants()?;
        Ok(Self {
            stream: ClusterStream::new(extents),
            owner,
            data_length,
            scratch: Vec::new(),
        })
    }

    /// Allocate through the priority path (metadata table data).
    #[must_use]
    pub fn priority(mut self, priority: bool) -> Self {
        self.stream = self.stream.priority(priority);
        self
    }

    #[must_use]
    pub fn collapse_on_write(mut self, collapse: bool) -> Self {
        self.stream = self.stream.collapse_on_write(collapse);
        self
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.data_length
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data_length == 0
    }

    #[must_use]
    pub fn allocated_length(&self, vol: &Volume) -> u64 {
        self.stream.mapped_clusters() * vol.cluster_size().as_u64()
    }

    #[must_use]
    pub fn stream(&self) -> &ClusterStream {
        &self.stream
    }

    #[must_use]
    pub fn extents(&self) -> &ExtentList {
        self.stream.extents()
    }

    /// Read up to `buf.len()` bytes at `offset`, clamped to the data length.
    /// Returns the number of bytes read.
    pub fn read_at(&mut self, vol: &Volume, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.data_length || buf.is_empty() {
            return Ok(0);
        }
        let len = to_usize((self.data_length - offset).min(buf.len() as u64))?;
        let cs = vol.cluster_size().as_u64();
        let cs_bytes = vol.cluster_size().as_usize();
        self.scratch.resize(cs_bytes, 0);

        let mut done = 0_usize;
        while done < len {
            let pos = offset + done as u64;
            let vcn = pos / cs;
            let within = to_usize(pos % cs)?;
            let remaining = len - done;
            if within == 0 && remaining >= cs_bytes {
                let clusters = remaining / cs_bytes;
                let bytes = clusters * cs_bytes;
                self.stream
                    .read_clusters(vol, vcn, clusters as u64, &mut buf[done..done + bytes])?;
                done += bytes;
            } else {
                let chunk = (cs_bytes - within).min(remaining);
                self.stream.read_clusters(vol, vcn, 1, &mut self.scratch)?;
                buf[done..done + chunk].copy_from_slice(&self.scratch[within..within + chunk]);
                done += chunk;
            }
        }
        Ok(len)
    }

    /// Write `buf` at `offset`, growing the attribute when the write ends
    /// past the current data length.
    pub fn write_at(&mut self, vol: &mut Volume, offset: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| FntError::Invariant("attribute write overflows".into()))?;
        if end > self.data_length {
            self.grow(vol, end)?;
        }

        let cs = vol.cluster_size().as_u64();
        let cs_bytes = vol.cluster_size().as_usize();
        self.scratch.resize(cs_bytes, 0);

        let mut done = 0_usize;
        let outcome = (|| -> Result<()> {
            while done < buf.len() {
                let pos = offset + done as u64;
                let vcn = pos / cs;
                let within = to_usize(pos % cs)?;
                let remaining = buf.len() - done;
                if within == 0 && remaining >= cs_bytes {
                    let clusters = remaining / cs_bytes;
                    let bytes = clusters * cs_bytes;
                    self.stream
                        .write_clusters(vol, vcn, clusters as u64, &buf[done..done + bytes])?;
                    done += bytes;
                } else {
                    let chunk = (cs_bytes - within).min(remaining);
                    self.stream.read_clusters(vol, vcn, 1, &mut self.scratch)?;
                    self.scratch[within..within + chunk].copy_from_slice(&buf[done..done + chunk]);
                    self.stream.write_clusters(vol, vcn, 1, &self.scratch)?;
                    done += chunk;
                }
            }
            Ok(())
        })();
        self.notify(vol)?;
        outcome
    }

    /// Grow (sparse, zero-filled) or shrink (clusters freed) the attribute.
    pub fn set_len(&mut self, vol: &mut Volume, len: u64) -> Result<()> {
        if len > self.data_length {
            self.grow(vol, len)?;
        } else if len < self.data_length {
            let clusters = vol.cluster_size().clusters_for(len);
            let released = self.stream.truncate_to_clusters(vol, clusters)?;
            debug!(
                from = self.data_length,
                to = len,
                released,
                "attribute_truncate"
            );
            self.data_length = len;
        }
        self.notify(vol)
    }

    /// Release every cluster and drop the mapping.
    pub fn destroy(&mut self, vol: &mut Volume) -> Result<()> {
        self.set_len(vol, 0)
    }

    /// Extend the data length, zeroing stale bytes between the old end and
    /// the new end that already sit in stored clusters.
    fn grow(&mut self, vol: &mut Volume, new_len: u64) -> Result<()> {
        let cs = vol.cluster_size().as_u64();
        let cs_bytes = vol.cluster_size().as_usize();
        let mapped = self.stream.mapped_clusters();
        let old = self.data_length;
        let last = vol.cluster_size().clusters_for(new_len).min(mapped);
        let mut vcn = old / cs;
        while vcn < last {
            if self.stream.is_stored(vcn)? {
                self.scratch.resize(cs_bytes, 0);
                let from = if vcn == old / cs {
                    to_usize(old % cs)?
                } else {
                    0
                };
                self.stream.read_clusters(vol, vcn, 1, &mut self.scratch)?;
                if self.scratch[from..].iter().any(|b| *b != 0) {
                    self.scratch[from..].fill(0);
                    self.stream.write_clusters(vol, vcn, 1, &self.scratch)?;
                }
            }
            vcn += 1;
        }
        self.stream
            .expand_to_clusters(vol.cluster_size().clusters_for(new_len));
        self.data_length = new_len;
        Ok(())
    }

    fn notify(&mut self, vol: &Volume) -> Result<()> {
        self.owner.set_lengths(AttributeSizes {
            data_length: self.data_length,
            allocated_length: self.allocated_length(vol),
        })?;
        self.owner.store_runs(&self.stream.extents().encode_segments())
    }
}
