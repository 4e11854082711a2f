//! Key builders for the common index kinds.

use crate::collation::{FILENAME_LENGTH_OFFSET, FILENAME_NAME_OFFSET};
use fnt_types::{ParseError, write_le_u64};

/// Longest name a FILE_NAME key can carry, in UTF-16 code units.
pub const MAX_NAME_UNITS: usize = 255;

/// Build a FILE_NAME-shaped directory key. Timestamps, sizes and flags are
/// zero; only the parent reference, namespace and name are filled in.
pub fn filename_key(parent_ref: u64, name: &str, namespace: u8) -> Result<Vec<u8>, ParseError> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.is_empty() || units.len() > MAX_NAME_UNITS {
        return Err(ParseError::InvalidField {
            field: "file_name",
            reason: "name must be 1..=255 UTF-16 units",
        });
    }
    let len = u8::try_from(units.len()).map_err(|_| ParseError::IntegerConversion {
        field: "file_name_length",
    })?;
    let mut key = vec![0_u8; FILENAME_NAME_OFFSET + units.len() * 2];
    write_le_u64(&mut key, 0x00, parent_ref)?;
    key[FILENAME_LENGTH_OFFSET] = len;
    key[FILENAME_LENGTH_OFFSET + 1] = namespace;
    for (i, unit) in units.iter().enumerate() {
        let at = FILENAME_NAME_OFFSET + i * 2;
        key[at..at + 2].copy_from_slice(&unit.to_le_bytes());
    }
    Ok(key)
}

/// Decode the name of a FILE_NAME key. Unpaired surrogates are replaced.
#[must_use]
pub fn filename_of(key: &[u8]) -> Option<String> {
    let len = usize::from(*key.get(FILENAME_LENGTH_OFFSET)?);
    let bytes = key.get(FILENAME_NAME_OFFSET..FILENAME_NAME_OFFSET + len * 2)?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Some(String::from_utf16_lossy(&units))
}

/// Parent directory reference of a FILE_NAME key.
#[must_use]
pub fn filename_parent(key: &[u8]) -> Option<u64> {
    fnt_types::read_le_u64(key, 0).ok()
}

/// Key of the security-descriptor hash index: `(hash, id)`.
#[must_use]
pub fn security_hash_key(hash: u32, id: u32) -> [u8; 8] {
    let mut key = [0_u8; 8];
    key[..4].copy_from_slice(&hash.to_le_bytes());
    key[4..].copy_from_slice(&id.to_le_bytes());
    key
}

#[must_use]
pub fn u32_key(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

#[must_use]
pub fn multiple_u32_key(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_key_layout() {
        let key = filename_key(0x0005_0000_0000_0005, "Dir", 3).expect("key");
        assert_eq!(key.len(), 0x42 + 6);
        assert_eq!(key[0x40], 3);
        assert_eq!(key[0x41], 3);
        assert_eq!(&key[0x42..0x44], &[b'D', 0]);
        assert_eq!(filename_of(&key).as_deref(), Some("Dir"));
        assert_eq!(filename_parent(&key), Some(0x0005_0000_0000_0005));
    }

    #[test]
    fn filename_key_rejects_bad_lengths() {
        assert!(filename_key(5, "", 1).is_err());
        assert!(filename_key(5, &"x".repeat(256), 1).is_err());
        assert!(filename_key(5, &"x".repeat(255), 1).is_ok());
    }

    #[test]
    fn integer_keys_are_little_endian() {
        assert_eq!(u32_key(0x0102_0304), [4, 3, 2, 1]);
        assert_eq!(security_hash_key(1, 2), [1, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(multiple_u32_key(&[1, 2]), vec![1, 0, 0, 0, 2, 0, 0, 0]);
    }
}
