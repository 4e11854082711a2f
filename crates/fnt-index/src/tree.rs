//! Index B+tree over a resident root and overflow INDX blocks.
//!
//! Nodes are held in an arena: the root is a plain vector of entries and
//! every overflow block is cached by VCN. Child pointers are VCN lookups into
//! that cache, loaded from the index-allocation attribute on first use.
//!
//! ## Node rules
//!
//! - Entries ascend by collation order and end in exactly one End entry.
//! - A node that outgrows its space is split: the root moves everything into
//!   one fresh block (depose), any other node hands its low half to a new
//!   block and promotes the middle entry to its parent (divide).
//! - Removal of an internal entry swaps in the largest leaf entry of its
//!   left subtree. Children reduced to a lone End entry are lifted into the
//!   parent; an End entry left without a child inherits its neighbour's.
//! - Underflow is tolerated. Siblings are never merged.
//!
//! ## Atomicity
//!
//! Public mutators stage changes in the cache and write them back only when
//! the whole operation succeeds. On failure the cache is dropped, blocks
//! allocated by the operation are returned to the block bitmap, and the tree
//! reloads from storage.

use crate::collation::{Collator, UpperCase};
use crate::config::IndexConfig;
use crate::host::IndexHost;
use fnt_alloc::BitVector;
use fnt_block::ByteStore;
use fnt_error::{FntError, Result};
use fnt_extent::{AttributeStream, Volume};
use fnt_ondisk::{
    IndexEntry, IndexRootHeader, decode_index_block, decode_index_root, encode_index_block,
    encode_index_root, entries_size,
};
use fnt_types::u64_to_usize;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace, warn};

/// Upper bound on blocks per index.
const MAX_INDEX_BLOCKS: u64 = 0xFFFF_FFFF;

/// Deeper trees than this are treated as a cycle on disk.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeId {
    Root,
    Block(u64),
}

impl NodeId {
    fn cluster(self) -> u64 {
        match self {
            Self::Root => 0,
            Self::Block(vcn) => vcn,
        }
    }
}

#[derive(Debug)]
struct Overflow {
    bitmap: BitVector,
    alloc: AttributeStream,
}

enum Removal {
    Missing,
    Removed(Option<IndexEntry>),
}

#[derive(Debug)]
pub struct IndexTree {
    config: IndexConfig,
    collator: Collator,
    root_header: IndexRootHeader,
    root_store: Box<dyn ByteStore>,
    host: Box<dyn IndexHost>,
    root: Vec<IndexEntry>,
    blocks: HashMap<u64, Vec<IndexEntry>>,
    overflow: Option<Overflow>,
    dirty: BTreeSet<NodeId>,
    /// Blocks allocated by the operation in flight.
    fresh: Vec<u64>,
    /// Blocks released by the operation in flight; bits clear on commit.
    released: Vec<u64>,
    usn: u16,
    unit_bytes: u64,
    units_per_block: u64,
    /// Entry count, once a walk has established it.
    count: Option<usize>,
}

impl IndexTree {
    /// Create an empty index and write its root.
    pub fn create(
        vol: &Volume,
        config: IndexConfig,
        upcase: &UpperCase,
        root_store: Box<dyn ByteStore>,
        host: Box<dyn IndexHost>,
    ) -> Result<Self> {
        let mut tree = Self::assemble(vol, config, upcase, root_store, host)?;
        tree.root = vec![IndexEntry::end()];
        tree.count = Some(0);
        tree.write_root()?;
        debug!(
            collation = ?config.collation,
            block_size = config.block_size,
            "index_create"
        );
        Ok(tree)
    }

    /// Open an index from its stored root and, when present, the overflow
    /// attributes its host provides.
    pub fn open(
        vol: &Volume,
        config: IndexConfig,
        upcase: &UpperCase,
        root_store: Box<dyn ByteStore>,
        host: Box<dyn IndexHost>,
    ) -> Result<Self> {
        let mut tree = Self::assemble(vol, config, upcase, root_store, host)?;
        tree.root = tree.load_root()?;
        let bitmap = tree.host.open_bitmap()?;
        let alloc = tree.host.open_allocation(vol)?;
        tree.overflow = match (bitmap, alloc) {
            (Some(store), Some(alloc)) => Some(Overflow {
                bitmap: BitVector::open(store, MAX_INDEX_BLOCKS)?,
                alloc,
            }),
            (None, None) => None,
            _ => {
                return Err(FntError::corruption(
                    0,
                    "index has only one of block bitmap and allocation",
                ));
            }
        };
        if tree.overflow.is_none() && tree.root.iter().any(|e| e.child.is_some()) {
            return Err(FntError::corruption(0, "index root points at blocks that do not exist"));
        }
        debug!(overflow = tree.overflow.is_some(), "index_open");
        Ok(tree)
    }

    fn assemble(
        vol: &Volume,
        config: IndexConfig,
        upcase: &UpperCase,
        root_store: Box<dyn ByteStore>,
        host: Box<dyn IndexHost>,
    ) -> Result<Self> {
        config.validate()?;
        let (unit_bytes, units_per_block) = config.block_units(vol.cluster_size());
        let units = u8::try_from(units_per_block).map_err(|_| {
            FntError::InvalidGeometry(format!(
                "index block of {} bytes spans {units_per_block} units",
                config.block_size
            ))
        })?;
        Ok(Self {
            config,
            collator: Collator::new(config.collation, upcase),
            root_header: IndexRootHeader {
                attribute_type: config.attribute_type,
                collation_rule: config.collation.raw(),
                index_block_size: config.block_size,
                units_per_block: units,
            },
            root_store,
            host,
            root: Vec::new(),
            blocks: HashMap::new(),
            overflow: None,
            dirty: BTreeSet::new(),
            fresh: Vec::new(),
            released: Vec::new(),
            usn: 0,
            unit_bytes,
            units_per_block,
            count: None,
        })
    }

    #[must_use]
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    #[must_use]
    pub fn collator(&self) -> &Collator {
        &self.collator
    }

    /// Whether the tree holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.len() == 1 && self.root[0].child.is_none()
    }

    /// Overflow blocks currently in use.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.overflow
            .as_ref()
            .map_or(0, |ov| ov.bitmap.count_present(ov.bitmap.capacity_bits()))
    }

    /// Entries of the resident root, End entry included.
    #[must_use]
    pub fn root_entries(&self) -> &[IndexEntry] {
        &self.root
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    /// Value stored under `key`.
    pub fn find(&mut self, vol: &Volume, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.find_entry(vol, key)?.map(|e| e.data))
    }

    pub fn contains_key(&mut self, vol: &Volume, key: &[u8]) -> Result<bool> {
        Ok(self.find_entry(vol, key)?.is_some())
    }

    fn find_entry(&mut self, vol: &Volume, key: &[u8]) -> Result<Option<IndexEntry>> {
        Ok(self
            .locate(vol, key)?
            .map(|(_, mut entries, i)| entries.swap_remove(i)))
    }

    /// Every `(key, value)` pair in collation order.
    pub fn entries(&mut self, vol: &Volume) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut everything = |_: &[u8]| Ordering::Equal;
        self.walk(vol, NodeId::Root, 0, &mut everything, &mut out)?;
        Ok(out)
    }

    /// Entries for which `query` answers `Equal`, in collation order.
    ///
    /// `query` must be monotone over the collation: `Less` for keys below
    /// the wanted range, `Greater` for keys above it.
    pub fn find_all<F>(&mut self, vol: &Volume, mut query: F) -> Result<Vec<(Vec<u8>, Vec<u8>)>>
    where
        F: FnMut(&[u8]) -> Ordering,
    {
        let mut out = Vec::new();
        self.walk(vol, NodeId::Root, 0, &mut query, &mut out)?;
        Ok(out)
    }

    /// Number of entries in the tree. The first call on a reopened index
    /// walks every block; later calls are answered from a running count.
    pub fn len(&mut self, vol: &Volume) -> Result<usize> {
        if let Some(count) = self.count {
            return Ok(count);
        }
        let count = self.entries(vol)?.len();
        self.count = Some(count);
        Ok(count)
    }

    fn walk(
        &mut self,
        vol: &Volume,
        id: NodeId,
        depth: usize,
        query: &mut dyn FnMut(&[u8]) -> Ordering,
        out: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        if depth >= MAX_DEPTH {
            return Err(FntError::corruption(id.cluster(), "index tree too deep"));
        }
        for entry in self.node(vol, id)? {
            if entry.is_end {
                if let Some(child) = entry.child {
                    self.walk(vol, NodeId::Block(child), depth + 1, query, out)?;
                }
                break;
            }
            let ord = query(&entry.key);
            if ord != Ordering::Less {
                if let Some(child) = entry.child {
                    self.walk(vol, NodeId::Block(child), depth + 1, query, out)?;
                }
            }
            match ord {
                Ordering::Less => {}
                Ordering::Equal => out.push((entry.key, entry.data)),
                Ordering::Greater => break,
            }
        }
        Ok(())
    }

    // ── Mutation ────────────────────────────────────────────────────────────

    /// Add a new entry. Fails with [`FntError::Exists`] if the key is present.
    pub fn insert(&mut self, vol: &mut Volume, key: &[u8], data: &[u8]) -> Result<()> {
        let entry = self.new_entry(key, data)?;
        self.transact(vol, |tree, vol| tree.insert_at_root(vol, entry))?;
        if let Some(count) = self.count.as_mut() {
            *count += 1;
        }
        Ok(())
    }

    /// Replace the value stored under an existing key.
    pub fn update(&mut self, vol: &mut Volume, key: &[u8], data: &[u8]) -> Result<()> {
        let entry = self.new_entry(key, data)?;
        self.transact(vol, |tree, vol| {
            if let Some((id, mut entries, i)) = tree.locate(vol, key)? {
                let mut replaced = entries[i].clone();
                replaced.data = entry.data.clone();
                if replaced.size(tree.config.file_index) == entries[i].size(tree.config.file_index) {
                    entries[i] = replaced;
                    tree.put(id, entries);
                    trace!(node = id.cluster(), "index_update_in_place");
                    return Ok(());
                }
            } else {
                return Err(FntError::NotFound("index key".into()));
            }
            tree.remove_at_root(vol, key)?;
            tree.insert_at_root(vol, entry)
        })
    }

    /// Remove an entry. Fails with [`FntError::NotFound`] if the key is absent.
    pub fn remove(&mut self, vol: &mut Volume, key: &[u8]) -> Result<()> {
        self.transact(vol, |tree, vol| tree.remove_at_root(vol, key))?;
        if let Some(count) = self.count.as_mut() {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    /// Move every root entry into one overflow block, leaving the root with
    /// a single End entry. Returns whether anything moved.
    pub fn shrink_root(&mut self, vol: &mut Volume) -> Result<bool> {
        self.transact(vol, Self::depose)
    }

    /// Release every overflow block and its clusters and empty the root
    /// value.
    pub fn destroy(mut self, vol: &mut Volume) -> Result<()> {
        if let Some(mut ov) = self.overflow.take() {
            ov.alloc.destroy(vol)?;
            ov.bitmap.clear()?;
            self.host.remove_overflow()?;
        }
        self.root_store.set_len(0)?;
        debug!("index_destroy");
        Ok(())
    }

    fn new_entry(&self, key: &[u8], data: &[u8]) -> Result<IndexEntry> {
        self.collator
            .validate_key(key)
            .map_err(|e| FntError::Format(e.to_string()))?;
        if self.config.file_index && data.len() != 8 {
            return Err(FntError::Format(format!(
                "file index value must be an 8-byte reference, got {} bytes",
                data.len()
            )));
        }
        let mut entry = IndexEntry::new(key.to_vec(), data.to_vec());
        entry.child = Some(0);
        let size = entry.size(self.config.file_index);
        entry.child = None;
        if size > self.config.max_entry_size() {
            return Err(FntError::Format(format!(
                "index entry of {size} bytes exceeds the {} byte limit",
                self.config.max_entry_size()
            )));
        }
        Ok(entry)
    }

    fn transact<T>(
        &mut self,
        vol: &mut Volume,
        op: impl FnOnce(&mut Self, &mut Volume) -> Result<T>,
    ) -> Result<T> {
        let outcome = op(self, vol).and_then(|value| self.commit(vol).map(|()| value));
        if outcome.is_err() {
            if let Err(rollback) = self.rollback() {
                warn!(error = %rollback, "index_rollback_failed");
            }
        }
        outcome
    }

    fn insert_at_root(&mut self, vol: &mut Volume, entry: IndexEntry) -> Result<()> {
        match self.insert_below(vol, NodeId::Root, entry, 0)? {
            None => Ok(()),
            Some(_) => Err(FntError::Invariant("index root promoted an entry".into())),
        }
    }

    fn remove_at_root(&mut self, vol: &mut Volume, key: &[u8]) -> Result<()> {
        match self.remove_below(vol, NodeId::Root, key, 0)? {
            Removal::Missing => Err(FntError::NotFound("index key".into())),
            Removal::Removed(None) => Ok(()),
            Removal::Removed(Some(_)) => Err(FntError::Invariant("index root promoted an entry".into())),
        }
    }

    // ── Node algorithms ─────────────────────────────────────────────────────

    /// First entry whose key is not below `key`, and whether it matches.
    fn position(&self, id: NodeId, entries: &[IndexEntry], key: &[u8]) -> Result<(usize, bool)> {
        for (i, entry) in entries.iter().enumerate() {
            if entry.is_end {
                return Ok((i, false));
            }
            match self.collator.compare(key, &entry.key) {
                Ordering::Greater => {}
                ord => return Ok((i, ord == Ordering::Equal)),
            }
        }
        Err(FntError::corruption(id.cluster(), "index node has no end entry"))
    }

    /// Node, slot and entries holding `key`.
    fn locate(&mut self, vol: &Volume, key: &[u8]) -> Result<Option<(NodeId, Vec<IndexEntry>, usize)>> {
        let mut id = NodeId::Root;
        for _ in 0..MAX_DEPTH {
            let entries = self.node(vol, id)?;
            let (i, exact) = self.position(id, &entries, key)?;
            if exact {
                return Ok(Some((id, entries, i)));
            }
            match entries[i].child {
                Some(child) => id = NodeId::Block(child),
                None => return Ok(None),
            }
        }
        Err(FntError::corruption(id.cluster(), "index tree too deep"))
    }

    /// Insert `entry` at its sorted slot in `entries` (no descent).
    fn insert_here(&self, id: NodeId, entries: &mut Vec<IndexEntry>, entry: IndexEntry) -> Result<usize> {
        let (i, exact) = self.position(id, entries, &entry.key)?;
        if exact {
            return Err(FntError::Invariant(format!(
                "re-inserted index entry already present in node {}",
                id.cluster()
            )));
        }
        entries.insert(i, entry);
        Ok(i)
    }

    /// Add `entry` to the subtree at `id`. Returns an entry the parent must
    /// take in when this node had to divide.
    fn insert_below(
        &mut self,
        vol: &mut Volume,
        id: NodeId,
        entry: IndexEntry,
        depth: usize,
    ) -> Result<Option<IndexEntry>> {
        if depth >= MAX_DEPTH {
            return Err(FntError::corruption(id.cluster(), "index tree too deep"));
        }
        let mut entries = self.node(vol, id)?;
        let (i, exact) = self.position(id, &entries, &entry.key)?;
        if exact {
            return Err(FntError::Exists);
        }
        if let Some(child) = entries[i].child {
            let Some(promoted) = self.insert_below(vol, NodeId::Block(child), entry, depth + 1)? else {
                return Ok(None);
            };
            entries.insert(i, promoted);
        } else {
            trace!(node = id.cluster(), slot = i, "index_insert");
            entries.insert(i, entry);
        }
        self.put(id, entries);
        self.ensure_size(vol, id)
    }

    fn ensure_size(&mut self, vol: &mut Volume, id: NodeId) -> Result<Option<IndexEntry>> {
        let entries = self.node(vol, id)?;
        let used = entries_size(&entries, self.config.file_index);
        let capacity = match id {
            NodeId::Root => self.config.root_entry_capacity(),
            NodeId::Block(_) => self.config.block_entry_capacity(),
        };
        if used <= capacity {
            return Ok(None);
        }
        match id {
            NodeId::Root => {
                self.depose(vol)?;
                Ok(None)
            }
            NodeId::Block(vcn) => self.divide(vol, vcn).map(Some),
        }
    }

    /// Evacuate every root entry into one fresh block.
    fn depose(&mut self, vol: &mut Volume) -> Result<bool> {
        if self.root.len() == 1 {
            return Ok(false);
        }
        let vcn = self.allocate_block(vol)?;
        let moved = std::mem::take(&mut self.root);
        let count = moved.len() - 1;
        self.put(NodeId::Block(vcn), moved);
        let mut end = IndexEntry::end();
        end.child = Some(vcn);
        self.put(NodeId::Root, vec![end]);
        debug!(vcn, entries = count, "index_depose");

        // The root may have held more than one block takes.
        if let Some(promoted) = self.ensure_size(vol, NodeId::Block(vcn))? {
            let mut root = self.root.clone();
            self.insert_here(NodeId::Root, &mut root, promoted)?;
            self.put(NodeId::Root, root);
            self.ensure_size(vol, NodeId::Root)?;
        }
        Ok(true)
    }

    /// Split block `vcn`: the low half moves to a new block which the
    /// returned middle entry points at.
    fn divide(&mut self, vol: &mut Volume, vcn: u64) -> Result<IndexEntry> {
        let mut entries = self.node(vol, NodeId::Block(vcn))?;
        let real = entries.len() - 1;
        if real < 2 {
            return Err(FntError::Invariant(format!(
                "index block {vcn} overflows with {real} entries"
            )));
        }
        let new_vcn = self.allocate_block(vol)?;
        let mid = real / 2;
        let upper = entries.split_off(mid + 1);
        let mut promoted = entries
            .pop()
            .ok_or_else(|| FntError::Invariant("divide lost its middle entry".into()))?;
        let mut end = IndexEntry::end();
        end.child = promoted.child;
        entries.push(end);
        self.put(NodeId::Block(new_vcn), entries);
        self.put(NodeId::Block(vcn), upper);
        promoted.child = Some(new_vcn);
        debug!(vcn, new_vcn, moved = mid, "index_divide");
        Ok(promoted)
    }

    fn remove_below(&mut self, vol: &mut Volume, id: NodeId, key: &[u8], depth: usize) -> Result<Removal> {
        if depth >= MAX_DEPTH {
            return Err(FntError::corruption(id.cluster(), "index tree too deep"));
        }
        let mut entries = self.node(vol, id)?;
        let (mut i, exact) = self.position(id, &entries, key)?;

        if exact {
            let Some(child) = entries[i].child else {
                entries.remove(i);
                trace!(node = id.cluster(), slot = i, "index_remove");
                self.put(id, entries);
                return Ok(Removal::Removed(None));
            };
            if let Some(leaf) = self.largest_leaf(vol, child)? {
                let displaced = match self.remove_below(vol, NodeId::Block(child), &leaf.key, depth + 1)? {
                    Removal::Removed(displaced) => displaced,
                    Removal::Missing => {
                        return Err(FntError::corruption(child, "largest leaf vanished during removal"));
                    }
                };
                entries[i].key = leaf.key;
                entries[i].data = leaf.data;
                if let Some(entry) = displaced {
                    if self.insert_here(id, &mut entries, entry)? <= i {
                        i += 1;
                    }
                }
            } else {
                entries.remove(i);
                self.free_subtree(vol, child, depth + 1)?;
            }
        } else {
            let Some(child) = entries[i].child else {
                return Ok(Removal::Missing);
            };
            match self.remove_below(vol, NodeId::Block(child), key, depth + 1)? {
                Removal::Missing => return Ok(Removal::Missing),
                Removal::Removed(Some(entry)) => {
                    if self.insert_here(id, &mut entries, entry)? <= i {
                        i += 1;
                    }
                }
                Removal::Removed(None) => {}
            }
        }

        if let Some(entry) = self.lift_node(vol, id, &mut entries, i, depth)? {
            self.insert_here(id, &mut entries, entry)?;
        }
        if let Some(entry) = self.populate_end(vol, &mut entries, depth)? {
            self.insert_here(id, &mut entries, entry)?;
        }
        self.put(id, entries);
        Ok(Removal::Removed(self.ensure_size(vol, id)?))
    }

    /// Largest childless entry under block `vcn`, or `None` when the whole
    /// subtree holds no entries.
    fn largest_leaf(&mut self, vol: &Volume, vcn: u64) -> Result<Option<IndexEntry>> {
        let mut id = NodeId::Block(vcn);
        let mut all_empty = true;
        for _ in 0..MAX_DEPTH {
            let entries = self.node(vol, id)?;
            let n = entries.len();
            if let Some(child) = entries[n - 1].child {
                all_empty &= n == 1;
                id = NodeId::Block(child);
                continue;
            }
            if n > 1 && entries[n - 2].child.is_none() {
                return Ok(Some(entries[n - 2].clone()));
            }
            if n == 1 && all_empty {
                return Ok(None);
            }
            return Err(FntError::corruption(id.cluster(), "index node has no largest leaf"));
        }
        Err(FntError::corruption(id.cluster(), "index tree too deep"))
    }

    /// Absorb a child of `entries[i]` that holds only an End entry. A non-End
    /// entry left without a child moves down into the next entry's subtree.
    fn lift_node(
        &mut self,
        vol: &mut Volume,
        id: NodeId,
        entries: &mut Vec<IndexEntry>,
        i: usize,
        depth: usize,
    ) -> Result<Option<IndexEntry>> {
        let Some(child) = entries[i].child else {
            return Ok(None);
        };
        let child_entries = self.node(vol, NodeId::Block(child))?;
        if child_entries.len() == 1 {
            entries[i].child = child_entries[0].child;
            self.free_block(child);
            debug!(node = id.cluster(), vcn = child, "index_lift");
        }
        if entries[i].child.is_some() || entries[i].is_end {
            return Ok(None);
        }
        let lifted = entries.remove(i);
        match entries[i].child {
            Some(next) => self.insert_below(vol, NodeId::Block(next), lifted, depth + 1),
            None => {
                entries.insert(i, lifted);
                Ok(None)
            }
        }
    }

    /// Give a childless End entry the child of the entry before it, pushing
    /// that entry down into the subtree it used to head.
    fn populate_end(
        &mut self,
        vol: &mut Volume,
        entries: &mut Vec<IndexEntry>,
        depth: usize,
    ) -> Result<Option<IndexEntry>> {
        let n = entries.len();
        if n < 2 || entries[n - 1].child.is_some() || entries[n - 2].child.is_none() {
            return Ok(None);
        }
        let mut old = entries.remove(n - 2);
        let child = old.child.take();
        entries[n - 2].child = child;
        match child {
            Some(vcn) => self.insert_below(vol, NodeId::Block(vcn), old, depth + 1),
            None => Ok(None),
        }
    }

    fn free_subtree(&mut self, vol: &Volume, vcn: u64, depth: usize) -> Result<()> {
        if depth >= MAX_DEPTH {
            return Err(FntError::corruption(vcn, "index tree too deep"));
        }
        for entry in self.node(vol, NodeId::Block(vcn))? {
            if let Some(child) = entry.child {
                self.free_subtree(vol, child, depth + 1)?;
            }
        }
        self.free_block(vcn);
        Ok(())
    }

    // ── Block arena ─────────────────────────────────────────────────────────

    fn node(&mut self, vol: &Volume, id: NodeId) -> Result<Vec<IndexEntry>> {
        match id {
            NodeId::Root => Ok(self.root.clone()),
            NodeId::Block(vcn) => {
                if let Some(entries) = self.blocks.get(&vcn) {
                    return Ok(entries.clone());
                }
                let entries = self.read_block(vol, vcn)?;
                self.blocks.insert(vcn, entries.clone());
                Ok(entries)
            }
        }
    }

    fn put(&mut self, id: NodeId, entries: Vec<IndexEntry>) {
        match id {
            NodeId::Root => self.root = entries,
            NodeId::Block(vcn) => {
                self.blocks.insert(vcn, entries);
            }
        }
        self.dirty.insert(id);
    }

    fn ensure_overflow(&mut self) -> Result<()> {
        if self.overflow.is_some() {
            return Ok(());
        }
        let bitmap = BitVector::create(self.host.create_bitmap()?, MAX_INDEX_BLOCKS)?;
        let alloc = self.host.create_allocation()?;
        self.overflow = Some(Overflow { bitmap, alloc });
        debug!("index_overflow_create");
        Ok(())
    }

    fn next_usn(&mut self) -> u16 {
        self.usn = match self.usn.wrapping_add(1) {
            0 => 1,
            usn => usn,
        };
        self.usn
    }

    /// Claim the first free block, write it out empty so its clusters are
    /// allocated now, and cache it.
    fn allocate_block(&mut self, vol: &mut Volume) -> Result<u64> {
        self.ensure_overflow()?;
        let usn = self.next_usn();
        let (units_per_block, unit_bytes) = (self.units_per_block, self.unit_bytes);
        let block_size = self.config.block_size as usize;
        let file_index = self.config.file_index;
        let ov = self
            .overflow
            .as_mut()
            .ok_or_else(|| FntError::Invariant("index overflow missing".into()))?;

        let bit = ov.bitmap.allocate_first_available(0)?;
        let vcn = bit * units_per_block;
        let written = encode_index_block(block_size, vcn, usn, &[IndexEntry::end()], file_index)
            .map_err(|e| FntError::Format(e.to_string()))
            .and_then(|bytes| ov.alloc.write_at(vol, vcn * unit_bytes, &bytes));
        if let Err(err) = written {
            ov.bitmap.mark_absent(bit)?;
            return Err(err);
        }
        self.fresh.push(vcn);
        self.blocks.insert(vcn, vec![IndexEntry::end()]);
        debug!(vcn, bit, "index_block_alloc");
        Ok(vcn)
    }

    fn free_block(&mut self, vcn: u64) {
        self.blocks.remove(&vcn);
        self.dirty.remove(&NodeId::Block(vcn));
        self.released.push(vcn);
        debug!(vcn, "index_block_free");
    }

    fn read_block(&mut self, vol: &Volume, vcn: u64) -> Result<Vec<IndexEntry>> {
        let units_per_block = self.units_per_block;
        let offset = vcn * self.unit_bytes;
        let block_size = u64_to_usize(u64::from(self.config.block_size), "index_block_size")
            .map_err(|e| FntError::Format(e.to_string()))?;
        let file_index = self.config.file_index;
        let ov = self
            .overflow
            .as_mut()
            .ok_or_else(|| FntError::corruption(vcn, "child block without index allocation"))?;
        if vcn % units_per_block != 0 || !ov.bitmap.is_present(vcn / units_per_block) {
            return Err(FntError::corruption(vcn, "child block is not allocated"));
        }
        let mut buf = vec![0_u8; block_size];
        if ov.alloc.read_at(vol, offset, &mut buf)? != block_size {
            return Err(FntError::corruption(vcn, "index block past end of allocation"));
        }
        let (header, entries) = decode_index_block(buf, file_index)
            .map_err(|e| FntError::corruption(vcn, format!("index block: {e}")))?;
        if header.vcn != vcn {
            return Err(FntError::corruption(
                vcn,
                format!("index block records vcn {}", header.vcn),
            ));
        }
        self.usn = self.usn.max(header.update_sequence);
        trace!(vcn, entries = entries.len(), "index_block_read");
        Ok(entries)
    }

    fn encode_block(&mut self, vcn: u64, entries: &[IndexEntry]) -> Result<Vec<u8>> {
        let usn = self.next_usn();
        encode_index_block(
            self.config.block_size as usize,
            vcn,
            usn,
            entries,
            self.config.file_index,
        )
        .map_err(|e| FntError::Format(e.to_string()))
    }

    fn write_block(&mut self, vol: &mut Volume, vcn: u64, bytes: &[u8]) -> Result<()> {
        let offset = vcn * self.unit_bytes;
        let ov = self
            .overflow
            .as_mut()
            .ok_or_else(|| FntError::Invariant("index overflow missing".into()))?;
        ov.alloc.write_at(vol, offset, bytes)
    }

    fn encode_root(&self) -> Result<Vec<u8>> {
        encode_index_root(&self.root_header, &self.root, self.config.file_index)
            .map_err(|e| FntError::Format(e.to_string()))
    }

    fn write_root(&mut self) -> Result<()> {
        let bytes = self.encode_root()?;
        self.root_store.replace(&bytes)
    }

    fn load_root(&self) -> Result<Vec<IndexEntry>> {
        let bytes = self.root_store.read_all()?;
        let (header, entries) = decode_index_root(&bytes, self.config.file_index)
            .map_err(|e| FntError::corruption(0, format!("index root: {e}")))?;
        if header.collation_rule != self.root_header.collation_rule
            || header.index_block_size != self.root_header.index_block_size
            || header.attribute_type != self.root_header.attribute_type
        {
            return Err(FntError::Format(format!(
                "index root {header:?} does not match configuration {:?}",
                self.root_header
            )));
        }
        Ok(entries)
    }

    /// Write staged nodes: every image is encoded before the first write,
    /// and the root goes last.
    fn commit(&mut self, vol: &mut Volume) -> Result<()> {
        let dirty = std::mem::take(&mut self.dirty);
        let mut images = Vec::new();
        for id in &dirty {
            if let NodeId::Block(vcn) = *id {
                if let Some(entries) = self.blocks.get(&vcn).cloned() {
                    images.push((vcn, self.encode_block(vcn, &entries)?));
                }
            }
        }
        let root = if dirty.contains(&NodeId::Root) {
            Some(self.encode_root()?)
        } else {
            None
        };
        for (vcn, bytes) in &images {
            self.write_block(vol, *vcn, bytes)?;
        }
        if let Some(bytes) = root {
            self.root_store.replace(&bytes)?;
        }
        let released = std::mem::take(&mut self.released);
        if let Some(ov) = self.overflow.as_mut() {
            for vcn in released {
                ov.bitmap.mark_absent(vcn / self.units_per_block)?;
            }
        }
        self.fresh.clear();
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.blocks.clear();
        self.dirty.clear();
        self.released.clear();
        let fresh = std::mem::take(&mut self.fresh);
        if let Some(ov) = self.overflow.as_mut() {
            for vcn in fresh {
                ov.bitmap.mark_absent(vcn / self.units_per_block)?;
            }
        }
        self.root = self.load_root()?;
        debug!("index_rollback");
        Ok(())
    }
}
