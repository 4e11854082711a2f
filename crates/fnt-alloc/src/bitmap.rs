//! Bit arrays backed by a resident byte store.
//!
//! Bit `i` lives in byte `i / 8` at position `i % 8` (LSB-first), which is the
//! on-disk layout of both the volume cluster bitmap and the per-index block
//! bitmap.

use fnt_block::ByteStore;
use fnt_error::{FntError, Result};
use tracing::trace;

/// Bitmaps grow in whole 8-byte steps.
const GROWTH_ALIGN: usize = 8;

// ── Slice helpers ───────────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice. Bits past the slice read as clear.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    let Ok(byte_idx) = usize::try_from(idx / 8) else {
        return false;
    };
    let bit_idx = idx % 8;
    byte_idx < bitmap.len() && (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice. Out-of-range bits are ignored.
pub fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    if let Ok(byte_idx) = usize::try_from(idx / 8) {
        if let Some(byte) = bitmap.get_mut(byte_idx) {
            *byte |= 1 << (idx % 8);
        }
    }
}

/// Clear bit `idx` in a bitmap byte slice. Out-of-range bits are ignored.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    if let Ok(byte_idx) = usize::try_from(idx / 8) {
        if let Some(byte) = bitmap.get_mut(byte_idx) {
            *byte &= !(1 << (idx % 8));
        }
    }
}

/// First clear bit in `[start, end)`, skipping fully-set bytes.
#[must_use]
pub fn bitmap_find_clear(bitmap: &[u8], start: u64, end: u64) -> Option<u64> {
    let end = end.min(bitmap.len() as u64 * 8);
    let mut idx = start;
    while idx < end {
        if idx % 8 == 0 {
            let byte_idx = usize::try_from(idx / 8).ok()?;
            if bitmap[byte_idx] == 0xFF {
                idx += 8;
                continue;
            }
        }
        if !bitmap_get(bitmap, idx) {
            return Some(idx);
        }
        idx += 1;
    }
    None
}

/// Number of set bits in `[start, end)`.
#[must_use]
pub fn bitmap_count_set(bitmap: &[u8], start: u64, end: u64) -> u64 {
    let end = end.min(bitmap.len() as u64 * 8);
    let mut idx = start;
    let mut set = 0_u64;
    while idx < end {
        if idx % 8 == 0 && idx + 8 <= end {
            let Ok(byte_idx) = usize::try_from(idx / 8) else {
                break;
            };
            set += u64::from(bitmap[byte_idx].count_ones());
            idx += 8;
            continue;
        }
        if bitmap_get(bitmap, idx) {
            set += 1;
        }
        idx += 1;
    }
    set
}

// ── BitVector ───────────────────────────────────────────────────────────────

/// A growable bit array persisted through a [`ByteStore`].
///
/// Reads are served from an in-memory copy; every mutation writes the
/// changed bytes through to the store before returning.
#[derive(Debug)]
pub struct BitVector {
    store: Box<dyn ByteStore>,
    bytes: Vec<u8>,
    max_bits: u64,
}

impl BitVector {
    /// Load a bit vector from `store`. `max_bits` caps growth.
    pub fn open(store: Box<dyn ByteStore>, max_bits: u64) -> Result<Self> {
        let bytes = store.read_all()?;
        Ok(Self {
            store,
            bytes,
            max_bits,
        })
    }

    /// A fresh, empty bit vector over `store` (existing contents discarded).
    pub fn create(mut store: Box<dyn ByteStore>, max_bits: u64) -> Result<Self> {
        store.set_len(0)?;
        Ok(Self {
            store,
            bytes: Vec::new(),
            max_bits,
        })
    }

    /// Number of addressable bits currently backed by storage.
    #[must_use]
    pub fn capacity_bits(&self) -> u64 {
        (self.bytes.len() as u64 * 8).min(self.max_bits)
    }

    #[must_use]
    pub fn max_bits(&self) -> u64 {
        self.max_bits
    }

    pub fn set_max_bits(&mut self, max_bits: u64) {
        self.max_bits = max_bits;
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn is_present(&self, idx: u64) -> bool {
        bitmap_get(&self.bytes, idx)
    }

    pub fn mark_present(&mut self, idx: u64) -> Result<()> {
        self.mark_present_range(idx, 1)
    }

    /// Set `count` bits starting at `start`, growing storage as needed.
    pub fn mark_present_range(&mut self, start: u64, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let end = start
            .checked_add(count)
            .filter(|end| *end <= self.max_bits)
            .ok_or_else(|| {
                FntError::Invariant(format!(
                    "bits {start}+{count} beyond bitmap limit {}",
                    self.max_bits
                ))
            })?;
        self.ensure_bits(end)?;
        for idx in start..end {
            bitmap_set(&mut self.bytes, idx);
        }
        self.write_through(start, end)
    }

    pub fn mark_absent(&mut self, idx: u64) -> Result<()> {
        self.mark_absent_range(idx, 1)
    }

    /// Clear `count` bits starting at `start`. Bits past storage are already
    /// absent and are skipped.
    pub fn mark_absent_range(&mut self, start: u64, count: u64) -> Result<()> {
        let end = start.saturating_add(count).min(self.bytes.len() as u64 * 8);
        if start >= end {
            return Ok(());
        }
        for idx in start..end {
            bitmap_clear(&mut self.bytes, idx);
        }
        self.write_through(start, end)
    }

    /// First clear bit at or after `start` within current storage.
    #[must_use]
    pub fn find_first_available(&self, start: u64) -> Option<u64> {
        bitmap_find_clear(&self.bytes, start, self.capacity_bits())
    }

    /// Claim the first clear bit at or after `start`, growing storage when
    /// every existing bit is taken.
    pub fn allocate_first_available(&mut self, start: u64) -> Result<u64> {
        let idx = match self.find_first_available(start) {
            Some(idx) => idx,
            None => {
                let idx = self.capacity_bits().max(start);
                if idx >= self.max_bits {
                    return Err(FntError::NoSpace);
                }
                idx
            }
        };
        self.mark_present(idx)?;
        trace!(bit = idx, "bitmap_allocate");
        Ok(idx)
    }

    /// Number of set bits among the first `limit` bits.
    #[must_use]
    pub fn count_present(&self, limit: u64) -> u64 {
        bitmap_count_set(&self.bytes, 0, limit)
    }

    /// Resize backing storage to hold `bits` bits (rounded up to 8 bytes).
    ///
    /// Shrinking clears the bits at or beyond `bits` that remain inside the
    /// last kept byte.
    pub fn set_size(&mut self, bits: u64) -> Result<()> {
        let new_len = Self::bytes_for(bits)?;
        if new_len < self.bytes.len() {
            self.bytes.truncate(new_len);
            self.store.set_len(new_len as u64)?;
            let tail_end = new_len as u64 * 8;
            if bits < tail_end {
                for idx in bits..tail_end {
                    bitmap_clear(&mut self.bytes, idx);
                }
                self.write_through(bits, tail_end)?;
            }
        } else if new_len > self.bytes.len() {
            self.bytes.resize(new_len, 0);
            self.store.set_len(new_len as u64)?;
        }
        Ok(())
    }

    /// Clear every bit and release storage.
    pub fn clear(&mut self) -> Result<()> {
        self.bytes.clear();
        self.store.set_len(0)
    }

    fn bytes_for(bits: u64) -> Result<usize> {
        let bytes = usize::try_from(bits.div_ceil(8))
            .map_err(|_| FntError::Invariant(format!("bitmap of {bits} bits too large")))?;
        Ok(fnt_types::align_up_usize(bytes, GROWTH_ALIGN))
    }

    fn ensure_bits(&mut self, bits: u64) -> Result<()> {
        if bits > self.bytes.len() as u64 * 8 {
            let new_len = Self::bytes_for(bits)?;
            trace!(old_len = self.bytes.len(), new_len, "bitmap_grow");
            self.bytes.resize(new_len, 0);
            self.store.set_len(new_len as u64)?;
        }
        Ok(())
    }

    fn write_through(&mut self, start_bit: u64, end_bit: u64) -> Result<()> {
        let first = usize::try_from(start_bit / 8)
            .map_err(|_| FntError::Invariant("bitmap offset overflow".into()))?;
        let last = usize::try_from(end_bit.div_ceil(8))
            .map_err(|_| FntError::Invariant("bitmap offset overflow".into()))?
            .min(self.bytes.len());
        if first >= last {
            return Ok(());
        }
        self.store.write_at(first as u64, &self.bytes[first..last])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnt_block::ResidentBytes;

    fn fresh(max_bits: u64) -> (BitVector, ResidentBytes) {
        let store = ResidentBytes::new();
        let bv = BitVector::create(Box::new(store.clone()), max_bits).expect("create");
        (bv, store)
    }

    #[test]
    fn slice_helpers_are_lsb_first() {
        let mut bm = [0_u8; 2];
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 9);
        assert_eq!(bm, [0x01, 0x02]);
        assert!(bitmap_get(&bm, 9));
        bitmap_clear(&mut bm, 9);
        assert!(!bitmap_get(&bm, 9));
        assert!(!bitmap_get(&bm, 1000));
    }

    #[test]
    fn find_clear_skips_full_bytes() {
        let bm = [0xFF, 0xFF, 0b1110_1111, 0x00];
        assert_eq!(bitmap_find_clear(&bm, 0, 32), Some(20));
        assert_eq!(bitmap_find_clear(&bm, 21, 32), Some(24));
        assert_eq!(bitmap_find_clear(&bm, 0, 20), None);
        assert_eq!(bitmap_count_set(&bm, 0, 32), 23);
        // 5 bits of byte 0, all of byte 1, bits 16..=19 of byte 2.
        assert_eq!(bitmap_count_set(&bm, 3, 21), 17);
    }

    #[test]
    fn grows_in_eight_byte_steps_and_writes_through() {
        let (mut bv, store) = fresh(u64::MAX);
        bv.mark_present(3).expect("mark");
        assert_eq!(store.len(), 8);
        assert_eq!(store.contents()[0], 0x08);

        bv.mark_present(64).expect("mark");
        assert_eq!(store.len(), 16);
        assert!(bv.is_present(64));
        assert_eq!(bv.count_present(u64::MAX), 2);

        bv.mark_absent(3).expect("clear");
        assert_eq!(store.contents()[0], 0);
    }

    #[test]
    fn allocate_first_available_extends_when_full() {
        let (mut bv, _store) = fresh(u64::MAX);
        bv.mark_present_range(0, 64).expect("fill");
        assert_eq!(bv.find_first_available(0), None);
        assert_eq!(bv.allocate_first_available(0).expect("alloc"), 64);
        assert_eq!(bv.allocate_first_available(0).expect("alloc"), 65);
        bv.mark_absent(10).expect("free");
        assert_eq!(bv.allocate_first_available(0).expect("alloc"), 10);
    }

    #[test]
    fn respects_max_bits() {
        let (mut bv, _store) = fresh(4);
        for expected in 0..4 {
            assert_eq!(bv.allocate_first_available(0).expect("alloc"), expected);
        }
        assert!(matches!(
            bv.allocate_first_available(0),
            Err(FntError::NoSpace)
        ));
        assert!(matches!(
            bv.mark_present(4),
            Err(FntError::Invariant(_))
        ));
    }

    #[test]
    fn reopen_sees_persisted_bits() {
        let (mut bv, store) = fresh(1024);
        bv.mark_present_range(100, 5).expect("mark");
        drop(bv);
        let bv = BitVector::open(Box::new(store), 1024).expect("open");
        assert!((100..105).all(|i| bv.is_present(i)));
        assert!(!bv.is_present(105));
    }

    #[test]
    fn shrink_clears_tail_bits() {
        let (mut bv, store) = fresh(u64::MAX);
        bv.mark_present_range(0, 70).expect("mark");
        bv.set_size(10).expect("shrink");
        assert_eq!(store.len(), 8);
        assert!(bv.is_present(9));
        assert!(!bv.is_present(10));
        assert_eq!(bv.count_present(u64::MAX), 10);
    }
}
