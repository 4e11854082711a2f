//! Key ordering for index trees.
//!
//! Every index is created with one [`CollationRule`], fixed for its lifetime.
//! [`Collator`] is the executable form: a closed set of comparators, some of
//! which carry an [`UpperCase`] table for case-insensitive name ordering.

use fnt_types::{ParseError, read_le_u32};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

/// Number of UTF-16 code units covered by an upper-case table.
pub const UPCASE_ENTRIES: usize = 0x1_0000;

/// On-disk size of an upper-case table (one `u16` per code unit).
pub const UPCASE_TABLE_BYTES: usize = UPCASE_ENTRIES * 2;

/// Offset of the name length byte inside a FILE_NAME key.
pub const FILENAME_LENGTH_OFFSET: usize = 0x40;

/// Offset of the UTF-16LE name inside a FILE_NAME key.
pub const FILENAME_NAME_OFFSET: usize = 0x42;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollationRule {
    Binary,
    Filename,
    UnicodeString,
    UnsignedLong,
    Sid,
    SecurityHash,
    MultipleUnsignedLongs,
}

impl CollationRule {
    pub fn from_raw(raw: u32) -> Result<Self, ParseError> {
        Ok(match raw {
            0x00 => Self::Binary,
            0x01 => Self::Filename,
            0x02 => Self::UnicodeString,
            0x10 => Self::UnsignedLong,
            0x11 => Self::Sid,
            0x12 => Self::SecurityHash,
            0x13 => Self::MultipleUnsignedLongs,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "collation_rule",
                    reason: "unknown rule",
                });
            }
        })
    }

    #[must_use]
    pub fn raw(self) -> u32 {
        match self {
            Self::Binary => 0x00,
            Self::Filename => 0x01,
            Self::UnicodeString => 0x02,
            Self::UnsignedLong => 0x10,
            Self::Sid => 0x11,
            Self::SecurityHash => 0x12,
            Self::MultipleUnsignedLongs => 0x13,
        }
    }

    /// Whether this rule folds case through an upper-case table.
    #[must_use]
    pub fn needs_upcase(self) -> bool {
        matches!(self, Self::Filename | Self::UnicodeString)
    }
}

// ── Upper-case table ────────────────────────────────────────────────────────

/// Maps every UTF-16 code unit to its upper-case form.
///
/// Cloning is cheap; the table is shared.
#[derive(Clone, PartialEq, Eq)]
pub struct UpperCase {
    table: Arc<Vec<u16>>,
}

impl std::fmt::Debug for UpperCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpperCase")
            .field("entries", &self.table.len())
            .finish()
    }
}

impl Default for UpperCase {
    fn default() -> Self {
        Self::builtin()
    }
}

impl UpperCase {
    /// Simple upper-casing of the Basic Multilingual Plane. Code units whose
    /// upper-case form is not a single BMP character map to themselves.
    #[must_use]
    pub fn builtin() -> Self {
        let table = (0..=u16::MAX)
            .map(|unit| {
                let Some(ch) = char::from_u32(u32::from(unit)) else {
                    return unit;
                };
                let mut upper = ch.to_uppercase();
                match (upper.next(), upper.next()) {
                    (Some(single), None) => u16::try_from(u32::from(single)).unwrap_or(unit),
                    _ => unit,
                }
            })
            .collect();
        Self {
            table: Arc::new(table),
        }
    }

    /// Load a 128 KiB little-endian table.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() != UPCASE_TABLE_BYTES {
            return Err(ParseError::InsufficientData {
                needed: UPCASE_TABLE_BYTES,
                offset: 0,
                actual: bytes.len(),
            });
        }
        let table = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self {
            table: Arc::new(table),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.table.iter().flat_map(|unit| unit.to_le_bytes()).collect()
    }

    #[must_use]
    pub fn upcase(&self, unit: u16) -> u16 {
        self.table[usize::from(unit)]
    }

    /// Compare two UTF-16LE byte strings after upper-casing. A trailing odd
    /// byte is ignored. Equal prefixes order the shorter string first.
    #[must_use]
    pub fn compare_utf16le(&self, x: &[u8], y: &[u8]) -> Ordering {
        let xs = x.chunks_exact(2).map(|p| self.upcase(u16::from_le_bytes([p[0], p[1]])));
        let ys = y.chunks_exact(2).map(|p| self.upcase(u16::from_le_bytes([p[0], p[1]])));
        xs.cmp(ys)
    }
}

// ── Collator ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Collator {
    Binary,
    Filename(UpperCase),
    UnicodeString(UpperCase),
    UnsignedLong,
    Sid,
    SecurityHash,
    MultipleUnsignedLongs,
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    read_le_u32(bytes, offset).unwrap_or(0)
}

fn filename_units(key: &[u8]) -> &[u8] {
    let len = key.get(FILENAME_LENGTH_OFFSET).copied().map_or(0, usize::from);
    let end = (FILENAME_NAME_OFFSET + len * 2).min(key.len());
    key.get(FILENAME_NAME_OFFSET..end).unwrap_or(&[])
}

impl Collator {
    #[must_use]
    pub fn new(rule: CollationRule, upcase: &UpperCase) -> Self {
        match rule {
            CollationRule::Binary => Self::Binary,
            CollationRule::Filename => Self::Filename(upcase.clone()),
            CollationRule::UnicodeString => Self::UnicodeString(upcase.clone()),
            CollationRule::UnsignedLong => Self::UnsignedLong,
            CollationRule::Sid => Self::Sid,
            CollationRule::SecurityHash => Self::SecurityHash,
            CollationRule::MultipleUnsignedLongs => Self::MultipleUnsignedLongs,
        }
    }

    #[must_use]
    pub fn rule(&self) -> CollationRule {
        match self {
            Self::Binary => CollationRule::Binary,
            Self::Filename(_) => CollationRule::Filename,
            Self::UnicodeString(_) => CollationRule::UnicodeString,
            Self::UnsignedLong => CollationRule::UnsignedLong,
            Self::Sid => CollationRule::Sid,
            Self::SecurityHash => CollationRule::SecurityHash,
            Self::MultipleUnsignedLongs => CollationRule::MultipleUnsignedLongs,
        }
    }

    /// Reject keys this rule cannot order meaningfully.
    pub fn validate_key(&self, key: &[u8]) -> Result<(), ParseError> {
        let ok = match self {
            Self::Binary => true,
            Self::Filename(_) => {
                key.len() >= FILENAME_NAME_OFFSET
                    && FILENAME_NAME_OFFSET + usize::from(key[FILENAME_LENGTH_OFFSET]) * 2
                        <= key.len()
            }
            Self::UnicodeString(_) => key.len() % 2 == 0,
            Self::UnsignedLong => key.len() >= 4,
            Self::Sid => key.len() >= 8 && key.len() == 8 + usize::from(key[1]) * 4,
            Self::SecurityHash => key.len() >= 8,
            Self::MultipleUnsignedLongs => !key.is_empty() && key.len() % 4 == 0,
        };
        if ok {
            Ok(())
        } else {
            Err(ParseError::InvalidField {
                field: "index_key",
                reason: "malformed for collation rule",
            })
        }
    }

    #[must_use]
    pub fn compare(&self, x: &[u8], y: &[u8]) -> Ordering {
        match self {
            Self::Binary | Self::Sid => x.cmp(y),
            Self::Filename(upcase) => upcase.compare_utf16le(filename_units(x), filename_units(y)),
            Self::UnicodeString(upcase) => upcase.compare_utf16le(x, y),
            Self::UnsignedLong => u32_at(x, 0).cmp(&u32_at(y, 0)),
            Self::SecurityHash => u32_at(x, 0)
                .cmp(&u32_at(y, 0))
                .then_with(|| u32_at(x, 4).cmp(&u32_at(y, 4))),
            Self::MultipleUnsignedLongs => {
                let xs = x.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
                let ys = y.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
                xs.cmp(ys)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{filename_key, multiple_u32_key, security_hash_key, u32_key};

    fn utf16(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }

    #[test]
    fn rule_codes_round_trip() {
        for rule in [
            CollationRule::Binary,
            CollationRule::Filename,
            CollationRule::UnicodeString,
            CollationRule::UnsignedLong,
            CollationRule::Sid,
            CollationRule::SecurityHash,
            CollationRule::MultipleUnsignedLongs,
        ] {
            assert_eq!(CollationRule::from_raw(rule.raw()).expect("known"), rule);
        }
        assert!(CollationRule::from_raw(0x99).is_err());
    }

    #[test]
    fn builtin_upcase_folds_ascii_and_latin1() {
        let up = UpperCase::builtin();
        assert_eq!(up.upcase(u16::from(b'a')), u16::from(b'A'));
        assert_eq!(up.upcase(0x00E9), 0x00C9);
        assert_eq!(up.upcase(u16::from(b'1')), u16::from(b'1'));
        // U+00DF upper-cases to "SS", which is not a single unit.
        assert_eq!(up.upcase(0x00DF), 0x00DF);
        assert_eq!(up.upcase(0xD800), 0xD800);
    }

    #[test]
    fn upcase_table_bytes_round_trip() {
        let up = UpperCase::builtin();
        let bytes = up.to_bytes();
        assert_eq!(bytes.len(), UPCASE_TABLE_BYTES);
        assert_eq!(UpperCase::from_bytes(&bytes).expect("load"), up);
        assert!(UpperCase::from_bytes(&bytes[..100]).is_err());
    }

    #[test]
    fn filename_collation_ignores_case() {
        let c = Collator::new(CollationRule::Filename, &UpperCase::builtin());
        let a = filename_key(5, "readme.TXT", 1).expect("key");
        let b = filename_key(9, "README.txt", 1).expect("key");
        let z = filename_key(5, "zeta", 1).expect("key");
        assert_eq!(c.compare(&a, &b), Ordering::Equal);
        assert_eq!(c.compare(&a, &z), Ordering::Less);
        assert_eq!(
            c.compare(&filename_key(5, "ab", 1).expect("key"), &filename_key(5, "abc", 1).expect("key")),
            Ordering::Less
        );
        c.validate_key(&a).expect("valid");
        assert!(c.validate_key(&a[..0x41]).is_err());
    }

    #[test]
    fn unicode_string_collation() {
        let c = Collator::new(CollationRule::UnicodeString, &UpperCase::builtin());
        assert_eq!(c.compare(&utf16("abc"), &utf16("ABC")), Ordering::Equal);
        assert_eq!(c.compare(&utf16("abc"), &utf16("abd")), Ordering::Less);
        assert!(c.validate_key(&[1, 2, 3]).is_err());
    }

    #[test]
    fn integer_collations() {
        let c = Collator::UnsignedLong;
        assert_eq!(c.compare(&u32_key(2), &u32_key(256)), Ordering::Less);
        assert!(c.validate_key(&[1, 2]).is_err());

        let m = Collator::MultipleUnsignedLongs;
        assert_eq!(
            m.compare(&multiple_u32_key(&[1, 9]), &multiple_u32_key(&[2, 0])),
            Ordering::Less
        );
        assert_eq!(
            m.compare(&multiple_u32_key(&[1, 2]), &multiple_u32_key(&[1, 2])),
            Ordering::Equal
        );
        assert!(m.validate_key(&[0; 6]).is_err());
    }

    #[test]
    fn security_hash_breaks_ties_on_id() {
        let c = Collator::SecurityHash;
        assert_eq!(
            c.compare(&security_hash_key(7, 300), &security_hash_key(7, 299)),
            Ordering::Greater
        );
        assert_eq!(
            c.compare(&security_hash_key(1, 999), &security_hash_key(2, 0)),
            Ordering::Less
        );
    }

    #[test]
    fn sid_is_bytewise_then_length() {
        let c = Collator::Sid;
        let everyone = [1_u8, 1, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0];
        let system = [1_u8, 1, 0, 0, 0, 0, 0, 5, 18, 0, 0, 0];
        assert_eq!(c.compare(&everyone, &system), Ordering::Less);
        c.validate_key(&system).expect("valid");
        assert!(c.validate_key(&system[..10]).is_err());
    }
}
