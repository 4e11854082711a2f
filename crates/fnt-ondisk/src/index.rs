//! Index node encodings: index header, index entries, INDEX_ROOT and INDX
//! blocks with update-sequence fixups.

use fnt_types::{
    ParseError, SECTOR_SIZE, align_up_usize, ensure_slice, read_le_u16, read_le_u32, read_le_u64,
    usize_to_u16, usize_to_u32, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

// ── Constants ───────────────────────────────────────────────────────────────

pub const INDEX_HEADER_SIZE: usize = 0x10;
pub const INDEX_ENTRY_HEADER_SIZE: usize = 0x10;
pub const INDEX_ROOT_HEADER_SIZE: usize = 0x10;

/// Index header flag: this node's entries have children.
pub const INDEX_HEADER_HAS_CHILDREN: u8 = 0x01;

pub const ENTRY_FLAG_HAS_CHILD: u16 = 0x01;
pub const ENTRY_FLAG_END: u16 = 0x02;

pub const INDX_MAGIC: [u8; 4] = *b"INDX";
/// Offset of the index header inside an INDX block.
pub const INDX_HEADER_OFFSET: usize = 0x18;
/// Offset of the update sequence array inside an INDX block.
pub const INDX_USA_OFFSET: usize = 0x28;

// ── Index header ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHeader {
    /// Offset of the first entry, relative to the header.
    pub first_entry_offset: u32,
    /// `first_entry_offset` plus the size of all entries.
    pub total_size: u32,
    pub allocated_size: u32,
    pub has_children: bool,
}

impl IndexHeader {
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        ensure_slice(bytes, offset, INDEX_HEADER_SIZE)?;
        let header = Self {
            first_entry_offset: read_le_u32(bytes, offset)?,
            total_size: read_le_u32(bytes, offset + 0x04)?,
            allocated_size: read_le_u32(bytes, offset + 0x08)?,
            has_children: bytes[offset + 0x0C] & INDEX_HEADER_HAS_CHILDREN != 0,
        };
        if header.first_entry_offset < INDEX_HEADER_SIZE as u32
            || header.total_size < header.first_entry_offset
            || header.total_size > header.allocated_size
        {
            return Err(ParseError::InvalidField {
                field: "index_header",
                reason: "inconsistent offsets",
            });
        }
        Ok(header)
    }

    pub fn write_to(&self, bytes: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_u32(bytes, offset, self.first_entry_offset)?;
        write_le_u32(bytes, offset + 0x04, self.total_size)?;
        write_le_u32(bytes, offset + 0x08, self.allocated_size)?;
        write_le_u32(bytes, offset + 0x0C, u32::from(u8::from(self.has_children)))?;
        Ok(())
    }
}

// ── Index entry ─────────────────────────────────────────────────────────────

/// One index entry as stored in a node.
///
/// In a file index (directories) the 8-byte data value is the file
/// reference and sits at offset 0; in a view index it follows the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    pub is_end: bool,
    /// VCN of the child block, when the entry has one.
    pub child: Option<u64>,
}

impl IndexEntry {
    #[must_use]
    pub fn new(key: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            key,
            data,
            is_end: false,
            child: None,
        }
    }

    #[must_use]
    pub fn end() -> Self {
        Self {
            key: Vec::new(),
            data: Vec::new(),
            is_end: true,
            child: None,
        }
    }

    #[must_use]
    pub fn flags(&self) -> u16 {
        let mut flags = 0;
        if self.is_end {
            flags |= ENTRY_FLAG_END;
        }
        if self.child.is_some() {
            flags |= ENTRY_FLAG_HAS_CHILD;
        }
        flags
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn size(&self, file_index: bool) -> usize {
        let body = if self.is_end {
            INDEX_ENTRY_HEADER_SIZE
        } else if file_index {
            align_up_usize(INDEX_ENTRY_HEADER_SIZE + self.key.len(), 8)
        } else {
            align_up_usize(INDEX_ENTRY_HEADER_SIZE + self.key.len() + self.data.len(), 8)
        };
        body + if self.child.is_some() { 8 } else { 0 }
    }

    /// Encode into `bytes` at `offset`, returning the encoded size.
    pub fn write_to(
        &self,
        bytes: &mut [u8],
        offset: usize,
        file_index: bool,
    ) -> Result<usize, ParseError> {
        let size = self.size(file_index);
        ensure_slice(bytes, offset, size)?;
        bytes[offset..offset + size].fill(0);

        if file_index {
            if !self.is_end {
                if self.data.len() != 8 {
                    return Err(ParseError::InvalidField {
                        field: "file_reference",
                        reason: "file index data must be 8 bytes",
                    });
                }
                bytes[offset..offset + 8].copy_from_slice(&self.data);
            }
        } else if !self.is_end {
            let data_offset = usize_to_u16(INDEX_ENTRY_HEADER_SIZE + self.key.len(), "data_offset")?;
            write_le_u16(bytes, offset, data_offset)?;
            write_le_u16(bytes, offset + 0x02, usize_to_u16(self.data.len(), "data_length")?)?;
        }

        write_le_u16(bytes, offset + 0x08, usize_to_u16(size, "entry_length")?)?;
        let key_len = if self.is_end { 0 } else { self.key.len() };
        write_le_u16(bytes, offset + 0x0A, usize_to_u16(key_len, "key_length")?)?;
        write_le_u16(bytes, offset + 0x0C, self.flags())?;

        if !self.is_end {
            let key_at = offset + INDEX_ENTRY_HEADER_SIZE;
            bytes[key_at..key_at + self.key.len()].copy_from_slice(&self.key);
            if !file_index {
                let data_at = key_at + self.key.len();
                bytes[data_at..data_at + self.data.len()].copy_from_slice(&self.data);
            }
        }
        if let Some(child) = self.child {
            write_le_u64(bytes, offset + size - 8, child)?;
        }
        Ok(size)
    }

    /// Decode one entry at `offset`, returning it and its encoded size.
    pub fn parse(bytes: &[u8], offset: usize, file_index: bool) -> Result<(Self, usize), ParseError> {
        ensure_slice(bytes, offset, INDEX_ENTRY_HEADER_SIZE)?;
        let length = usize::from(read_le_u16(bytes, offset + 0x08)?);
        let key_len = usize::from(read_le_u16(bytes, offset + 0x0A)?);
        let flags = read_le_u16(bytes, offset + 0x0C)?;
        if length < INDEX_ENTRY_HEADER_SIZE || length % 8 != 0 {
            return Err(ParseError::InvalidField {
                field: "entry_length",
                reason: "must be a multiple of 8 and at least 16",
            });
        }
        let entry = ensure_slice(bytes, offset, length)?;
        let is_end = flags & ENTRY_FLAG_END != 0;
        let has_child = flags & ENTRY_FLAG_HAS_CHILD != 0;
        let body_end = if has_child {
            length.checked_sub(8).ok_or(ParseError::InvalidField {
                field: "entry_length",
                reason: "too short for child pointer",
            })?
        } else {
            length
        };
        if body_end < INDEX_ENTRY_HEADER_SIZE {
            return Err(ParseError::InvalidField {
                field: "entry_length",
                reason: "too short for child pointer",
            });
        }
        let child = if has_child {
            Some(read_le_u64(entry, length - 8)?)
        } else {
            None
        };

        if is_end {
            return Ok((
                Self {
                    key: Vec::new(),
                    data: Vec::new(),
                    is_end: true,
                    child,
                },
                length,
            ));
        }

        if INDEX_ENTRY_HEADER_SIZE + key_len > body_end {
            return Err(ParseError::InvalidField {
                field: "key_length",
                reason: "key overruns entry",
            });
        }
        let key = entry[INDEX_ENTRY_HEADER_SIZE..INDEX_ENTRY_HEADER_SIZE + key_len].to_vec();
        let data = if file_index {
            entry[0..8].to_vec()
        } else {
            let data_offset = usize::from(read_le_u16(entry, 0)?);
            let data_len = usize::from(read_le_u16(entry, 0x02)?);
            if data_offset
                .checked_add(data_len)
                .is_none_or(|end| end > body_end)
            {
                return Err(ParseError::InvalidField {
                    field: "data_length",
                    reason: "data overruns entry",
                });
            }
            entry[data_offset..data_offset + data_len].to_vec()
        };
        Ok((
            Self {
                key,
                data,
                is_end: false,
                child,
            },
            length,
        ))
    }
}

/// Total encoded size of `entries`.
#[must_use]
pub fn entries_size(entries: &[IndexEntry], file_index: bool) -> usize {
    entries.iter().map(|e| e.size(file_index)).sum()
}

/// Decode the entries described by `header` (located at `header_at`).
///
/// Decoding stops at the End entry; a node without one is malformed.
pub fn parse_entries(
    bytes: &[u8],
    header_at: usize,
    header: &IndexHeader,
    file_index: bool,
) -> Result<Vec<IndexEntry>, ParseError> {
    let mut pos = header_at + header.first_entry_offset as usize;
    let limit = header_at + header.total_size as usize;
    let mut entries = Vec::new();
    while pos < limit {
        let (entry, len) = IndexEntry::parse(bytes, pos, file_index)?;
        pos += len;
        let is_end = entry.is_end;
        entries.push(entry);
        if is_end {
            return Ok(entries);
        }
    }
    Err(ParseError::InvalidField {
        field: "index_entries",
        reason: "missing end entry",
    })
}

/// Write `entries` after a header at `header_at` whose entries begin at
/// `first_entry_offset` (relative to the header).
pub fn write_node(
    bytes: &mut [u8],
    header_at: usize,
    first_entry_offset: usize,
    allocated_size: usize,
    entries: &[IndexEntry],
    file_index: bool,
) -> Result<IndexHeader, ParseError> {
    let total = first_entry_offset + entries_size(entries, file_index);
    if total > allocated_size {
        return Err(ParseError::InvalidField {
            field: "index_entries",
            reason: "entries exceed node capacity",
        });
    }
    let header = IndexHeader {
        first_entry_offset: usize_to_u32(first_entry_offset, "first_entry_offset")?,
        total_size: usize_to_u32(total, "total_size")?,
        allocated_size: usize_to_u32(allocated_size, "allocated_size")?,
        has_children: entries.iter().any(|e| e.child.is_some()),
    };
    header.write_to(bytes, header_at)?;
    let mut pos = header_at + first_entry_offset;
    for entry in entries {
        pos += entry.write_to(bytes, pos, file_index)?;
    }
    Ok(header)
}

// ── INDEX_ROOT ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRootHeader {
    /// Attribute type being indexed (0x30 for file names, 0 for views).
    pub attribute_type: u32,
    pub collation_rule: u32,
    pub index_block_size: u32,
    /// Clusters per index block, or 512-byte units when blocks are smaller
    /// than a cluster.
    pub units_per_block: u8,
}

impl IndexRootHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, INDEX_ROOT_HEADER_SIZE)?;
        Ok(Self {
            attribute_type: read_le_u32(bytes, 0x00)?,
            collation_rule: read_le_u32(bytes, 0x04)?,
            index_block_size: read_le_u32(bytes, 0x08)?,
            units_per_block: bytes[0x0C],
        })
    }

    pub fn write_to(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice(bytes, 0, INDEX_ROOT_HEADER_SIZE)?;
        write_le_u32(bytes, 0x00, self.attribute_type)?;
        write_le_u32(bytes, 0x04, self.collation_rule)?;
        write_le_u32(bytes, 0x08, self.index_block_size)?;
        bytes[0x0C..0x10].copy_from_slice(&[self.units_per_block, 0, 0, 0]);
        Ok(())
    }
}

/// Encode a whole INDEX_ROOT value.
pub fn encode_index_root(
    root: &IndexRootHeader,
    entries: &[IndexEntry],
    file_index: bool,
) -> Result<Vec<u8>, ParseError> {
    let node_size = INDEX_HEADER_SIZE + entries_size(entries, file_index);
    let mut bytes = vec![0_u8; INDEX_ROOT_HEADER_SIZE + node_size];
    root.write_to(&mut bytes)?;
    write_node(
        &mut bytes,
        INDEX_ROOT_HEADER_SIZE,
        INDEX_HEADER_SIZE,
        node_size,
        entries,
        file_index,
    )?;
    Ok(bytes)
}

/// Decode a whole INDEX_ROOT value.
pub fn decode_index_root(
    bytes: &[u8],
    file_index: bool,
) -> Result<(IndexRootHeader, Vec<IndexEntry>), ParseError> {
    let root = IndexRootHeader::parse(bytes)?;
    let header = IndexHeader::parse(bytes, INDEX_ROOT_HEADER_SIZE)?;
    let entries = parse_entries(bytes, INDEX_ROOT_HEADER_SIZE, &header, file_index)?;
    Ok((root, entries))
}

// ── INDX blocks ─────────────────────────────────────────────────────────────

/// Update-sequence layout of an INDX block of `block_size` bytes:
/// `(usa_count, first_entry_offset_from_block_start)`.
#[must_use]
pub fn indx_layout(block_size: usize) -> (usize, usize) {
    let usa_count = block_size / SECTOR_SIZE as usize + 1;
    let first_entry = align_up_usize(INDX_USA_OFFSET + usa_count * 2, 8);
    (usa_count, first_entry)
}

/// Bytes available for entries in an INDX block.
#[must_use]
pub fn indx_entry_capacity(block_size: usize) -> usize {
    block_size - indx_layout(block_size).1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBlockHeader {
    pub lsn: u64,
    pub vcn: u64,
    pub update_sequence: u16,
}

/// Encode an INDX block holding `entries`, fixups applied.
pub fn encode_index_block(
    block_size: usize,
    vcn: u64,
    update_sequence: u16,
    entries: &[IndexEntry],
    file_index: bool,
) -> Result<Vec<u8>, ParseError> {
    if block_size < SECTOR_SIZE as usize || block_size % SECTOR_SIZE as usize != 0 {
        return Err(ParseError::InvalidField {
            field: "index_block_size",
            reason: "must be a multiple of 512",
        });
    }
    let (usa_count, first_entry) = indx_layout(block_size);
    let mut bytes = vec![0_u8; block_size];
    bytes[0..4].copy_from_slice(&INDX_MAGIC);
    write_le_u16(&mut bytes, 0x04, usize_to_u16(INDX_USA_OFFSET, "usa_offset")?)?;
    write_le_u16(&mut bytes, 0x06, usize_to_u16(usa_count, "usa_count")?)?;
    write_le_u64(&mut bytes, 0x08, 0)?;
    write_le_u64(&mut bytes, 0x10, vcn)?;
    write_node(
        &mut bytes,
        INDX_HEADER_OFFSET,
        first_entry - INDX_HEADER_OFFSET,
        block_size - INDX_HEADER_OFFSET,
        entries,
        file_index,
    )?;
    protect_fixups(&mut bytes, update_sequence)?;
    Ok(bytes)
}

/// Decode an INDX block. `bytes` is consumed because fixups are undone in
/// place.
pub fn decode_index_block(
    mut bytes: Vec<u8>,
    file_index: bool,
) -> Result<(IndexBlockHeader, Vec<IndexEntry>), ParseError> {
    let magic = ensure_slice(&bytes, 0, 4)?;
    if magic != INDX_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(u32::from_le_bytes(INDX_MAGIC)),
            actual: u64::from(read_le_u32(&bytes, 0)?),
        });
    }
    let update_sequence = apply_fixups(&mut bytes)?;
    let block = IndexBlockHeader {
        lsn: read_le_u64(&bytes, 0x08)?,
        vcn: read_le_u64(&bytes, 0x10)?,
        update_sequence,
    };
    let header = IndexHeader::parse(&bytes, INDX_HEADER_OFFSET)?;
    if INDX_HEADER_OFFSET + header.allocated_size as usize > bytes.len() {
        return Err(ParseError::InvalidField {
            field: "allocated_size",
            reason: "exceeds block size",
        });
    }
    let entries = parse_entries(&bytes, INDX_HEADER_OFFSET, &header, file_index)?;
    Ok((block, entries))
}

fn usa_bounds(bytes: &[u8]) -> Result<(usize, usize), ParseError> {
    let usa_offset = usize::from(read_le_u16(bytes, 0x04)?);
    let usa_count = usize::from(read_le_u16(bytes, 0x06)?);
    let sectors = bytes.len() / SECTOR_SIZE as usize;
    if usa_count == 0 || usa_count - 1 > sectors {
        return Err(ParseError::InvalidField {
            field: "usa_count",
            reason: "does not match block size",
        });
    }
    ensure_slice(bytes, usa_offset, usa_count * 2)?;
    Ok((usa_offset, usa_count))
}

/// Stamp `update_sequence` into the last two bytes of every sector, saving
/// the displaced bytes in the update sequence array.
pub fn protect_fixups(bytes: &mut [u8], update_sequence: u16) -> Result<(), ParseError> {
    let (usa_offset, usa_count) = usa_bounds(bytes)?;
    write_le_u16(bytes, usa_offset, update_sequence)?;
    let sector = SECTOR_SIZE as usize;
    for i in 0..usa_count - 1 {
        let tail = (i + 1) * sector - 2;
        let saved = read_le_u16(bytes, tail)?;
        write_le_u16(bytes, usa_offset + 2 + i * 2, saved)?;
        write_le_u16(bytes, tail, update_sequence)?;
    }
    Ok(())
}

/// Verify and undo fixups, returning the update sequence number.
///
/// A sector whose tail does not carry the update sequence number was torn
/// or overwritten; that is reported as an invalid field.
pub fn apply_fixups(bytes: &mut [u8]) -> Result<u16, ParseError> {
    let (usa_offset, usa_count) = usa_bounds(bytes)?;
    let update_sequence = read_le_u16(bytes, usa_offset)?;
    let sector = SECTOR_SIZE as usize;
    for i in 0..usa_count - 1 {
        let tail = (i + 1) * sector - 2;
        if read_le_u16(bytes, tail)? != update_sequence {
            return Err(ParseError::InvalidField {
                field: "update_sequence",
                reason: "sector tail does not match",
            });
        }
        let saved = read_le_u16(bytes, usa_offset + 2 + i * 2)?;
        write_le_u16(bytes, tail, saved)?;
    }
    Ok(update_sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_entry(key: &[u8], data: &[u8]) -> IndexEntry {
        IndexEntry::new(key.to_vec(), data.to_vec())
    }

    #[test]
    fn view_entry_layout() {
        let mut entry = view_entry(&[1, 2, 3], &[9, 9]);
        assert_eq!(entry.size(false), 0x18);
        entry.child = Some(0x20);
        assert_eq!(entry.size(false), 0x20);

        let mut buf = vec![0_u8; 0x20];
        let written = entry.write_to(&mut buf, 0, false).expect("write");
        assert_eq!(written, 0x20);
        assert_eq!(read_le_u16(&buf, 0x00).unwrap(), 0x13);
        assert_eq!(read_le_u16(&buf, 0x02).unwrap(), 2);
        assert_eq!(read_le_u16(&buf, 0x08).unwrap(), 0x20);
        assert_eq!(read_le_u16(&buf, 0x0A).unwrap(), 3);
        assert_eq!(read_le_u16(&buf, 0x0C).unwrap(), ENTRY_FLAG_HAS_CHILD);
        assert_eq!(&buf[0x10..0x15], &[1, 2, 3, 9, 9]);
        assert_eq!(read_le_u64(&buf, 0x18).unwrap(), 0x20);

        let (parsed, len) = IndexEntry::parse(&buf, 0, false).expect("parse");
        assert_eq!(len, 0x20);
        assert_eq!(parsed, entry);
    }

    #[test]
    fn file_entry_keeps_reference_inline() {
        let entry = view_entry(&[0xAA; 0x42], &0x0001_0000_0000_0005_u64.to_le_bytes());
        assert_eq!(entry.size(true), 0x58);
        let mut buf = vec![0_u8; 0x58];
        entry.write_to(&mut buf, 0, true).expect("write");
        assert_eq!(read_le_u64(&buf, 0).unwrap(), 0x0001_0000_0000_0005);
        let (parsed, _) = IndexEntry::parse(&buf, 0, true).expect("parse");
        assert_eq!(parsed, entry);

        let bad = view_entry(&[1], &[1, 2]);
        assert!(bad.write_to(&mut buf, 0, true).is_err());
    }

    #[test]
    fn end_entry_sizes() {
        let mut end = IndexEntry::end();
        assert_eq!(end.size(false), 0x10);
        end.child = Some(4);
        assert_eq!(end.size(true), 0x18);
        assert_eq!(end.flags(), ENTRY_FLAG_END | ENTRY_FLAG_HAS_CHILD);
    }

    #[test]
    fn root_round_trip_is_byte_exact() {
        let root = IndexRootHeader {
            attribute_type: 0,
            collation_rule: 0x10,
            index_block_size: 4096,
            units_per_block: 1,
        };
        let mut end = IndexEntry::end();
        end.child = Some(8);
        let entries = vec![view_entry(&5_u32.to_le_bytes(), b"five"), end];
        let bytes = encode_index_root(&root, &entries, false).expect("encode");
        assert_eq!(bytes.len(), 0x20 + 0x18 + 0x18);
        let header = IndexHeader::parse(&bytes, INDEX_ROOT_HEADER_SIZE).expect("header");
        assert!(header.has_children);
        assert_eq!(header.first_entry_offset, 0x10);
        assert_eq!(header.total_size, header.allocated_size);

        let (root2, entries2) = decode_index_root(&bytes, false).expect("decode");
        assert_eq!(root2, root);
        assert_eq!(entries2, entries);
        assert_eq!(encode_index_root(&root2, &entries2, false).unwrap(), bytes);
    }

    #[test]
    fn missing_end_entry_rejected() {
        let entries = vec![view_entry(b"k", b"v")];
        let mut bytes = vec![0_u8; 0x10 + 0x18];
        write_node(&mut bytes, 0, 0x10, 0x28, &entries, false).expect("write");
        let header = IndexHeader::parse(&bytes, 0).expect("header");
        assert!(matches!(
            parse_entries(&bytes, 0, &header, false),
            Err(ParseError::InvalidField {
                reason: "missing end entry",
                ..
            })
        ));
    }

    #[test]
    fn indx_layout_for_common_sizes() {
        assert_eq!(indx_layout(4096), (9, 0x40));
        assert_eq!(indx_layout(512), (2, 0x30));
        assert_eq!(indx_entry_capacity(4096), 4096 - 0x40);
    }

    #[test]
    fn index_block_round_trip_and_fixups() {
        let entries = vec![
            view_entry(&[1; 8], &[2; 500]),
            view_entry(&[3; 8], &[4; 500]),
            IndexEntry::end(),
        ];
        let bytes = encode_index_block(4096, 16, 7, &entries, false).expect("encode");
        assert_eq!(&bytes[0..4], b"INDX");
        for sector in 0..8 {
            assert_eq!(read_le_u16(&bytes, sector * 512 + 510).unwrap(), 7);
        }
        assert_eq!(read_le_u16(&bytes, 0x18).unwrap(), 0x28);

        let (block, decoded) = decode_index_block(bytes.clone(), false).expect("decode");
        assert_eq!(block.vcn, 16);
        assert_eq!(block.update_sequence, 7);
        assert_eq!(decoded, entries);

        let mut torn = bytes;
        torn[1022] ^= 0xFF;
        assert!(decode_index_block(torn, false).is_err());
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = encode_index_block(512, 0, 1, &[IndexEntry::end()], false).unwrap();
        bytes[0] = b'F';
        assert!(matches!(
            decode_index_block(bytes, false),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn overfull_node_rejected() {
        let entries = vec![view_entry(&[0; 8], &[0; 600]), IndexEntry::end()];
        assert!(encode_index_block(512, 0, 1, &entries, false).is_err());
    }
}
