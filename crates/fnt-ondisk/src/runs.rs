//! Run-list encoding.
//!
//! Each run starts with a header byte: low nibble is the byte width of the
//! length field, high nibble the byte width of the LCN offset field. Both
//! fields are little-endian two's complement in minimal width. An offset
//! width of 0 marks a sparse run. Offsets are relative to the previous
//! stored run's LCN (the first stored run is relative to 0). A 0x00 header
//! ends the list.

use fnt_types::{ParseError, ensure_slice};
use serde::{Deserialize, Serialize};

/// One encoded run: a cluster count and an optional LCN delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRun {
    pub length: u64,
    /// `None` for a sparse run.
    pub delta: Option<i64>,
}

impl RawRun {
    #[must_use]
    pub fn stored(length: u64, delta: i64) -> Self {
        Self {
            length,
            delta: Some(delta),
        }
    }

    #[must_use]
    pub fn sparse(length: u64) -> Self {
        Self {
            length,
            delta: None,
        }
    }

    #[must_use]
    pub fn is_sparse(&self) -> bool {
        self.delta.is_none()
    }

    /// Encoded size of this run in bytes, header included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + signed_width(length_as_i64(self.length)) + self.delta.map_or(0, signed_width)
    }
}

fn length_as_i64(length: u64) -> i64 {
    i64::try_from(length).unwrap_or(i64::MAX)
}

/// Minimal number of bytes to hold `value` in two's complement.
#[must_use]
pub fn signed_width(value: i64) -> usize {
    for width in 1..8 {
        let bits = width * 8;
        let min = -(1_i64 << (bits - 1));
        let max = (1_i64 << (bits - 1)) - 1;
        if (min..=max).contains(&value) {
            return width;
        }
    }
    8
}

fn read_signed(bytes: &[u8]) -> i64 {
    let mut buf = if bytes.last().is_some_and(|b| b & 0x80 != 0) {
        [0xFF_u8; 8]
    } else {
        [0_u8; 8]
    };
    buf[..bytes.len()].copy_from_slice(bytes);
    i64::from_le_bytes(buf)
}

fn write_signed(out: &mut Vec<u8>, value: i64, width: usize) {
    out.extend_from_slice(&value.to_le_bytes()[..width]);
}

/// Decode runs from `bytes`, stopping at the 0x00 terminator or the end of
/// the slice. Returns the runs and the number of bytes consumed (terminator
/// included when present).
pub fn decode_runs(bytes: &[u8]) -> Result<(Vec<RawRun>, usize), ParseError> {
    let mut runs = Vec::new();
    let mut pos = 0_usize;
    while pos < bytes.len() {
        let header = bytes[pos];
        if header == 0 {
            return Ok((runs, pos + 1));
        }
        let len_width = usize::from(header & 0x0F);
        let off_width = usize::from(header >> 4);
        if len_width == 0 || len_width > 8 {
            return Err(ParseError::InvalidField {
                field: "run_length_width",
                reason: "must be 1..=8",
            });
        }
        if off_width > 8 {
            return Err(ParseError::InvalidField {
                field: "run_offset_width",
                reason: "must be 0..=8",
            });
        }
        let length = read_signed(ensure_slice(bytes, pos + 1, len_width)?);
        let length = u64::try_from(length)
            .ok()
            .filter(|len| *len > 0)
            .ok_or(ParseError::InvalidField {
                field: "run_length",
                reason: "must be positive",
            })?;
        let delta = if off_width == 0 {
            None
        } else {
            Some(read_signed(ensure_slice(
                bytes,
                pos + 1 + len_width,
                off_width,
            )?))
        };
        runs.push(RawRun { length, delta });
        pos += 1 + len_width + off_width;
    }
    Ok((runs, pos))
}

/// Encode runs followed by the 0x00 terminator.
#[must_use]
pub fn encode_runs(runs: &[RawRun]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(runs));
    for run in runs {
        let length = length_as_i64(run.length);
        let len_width = signed_width(length);
        let off_width = run.delta.map_or(0, signed_width);
        #[expect(clippy::cast_possible_truncation)]
        out.push(((off_width as u8) << 4) | len_width as u8);
        write_signed(&mut out, length, len_width);
        if let Some(delta) = run.delta {
            write_signed(&mut out, delta, off_width);
        }
    }
    out.push(0);
    out
}

/// Encoded size of `runs`, terminator included.
#[must_use]
pub fn encoded_len(runs: &[RawRun]) -> usize {
    runs.iter().map(RawRun::encoded_len).sum::<usize>() + 1
}
