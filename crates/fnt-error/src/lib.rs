#![forbid(unsafe_code)]
//! Error types for FrankenNTFS.
//!
//! # Error Taxonomy
//!
//! FrankenNTFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `fnt-types` | Byte-level violations while decoding run lists, index headers and INDX blocks |
//! | Runtime | `FntError` | `fnt-error` (this crate) | Errors returned by the allocator, extent layer and index engine |
//!
//! ## Mapping Policy: ParseError → FntError
//!
//! `fnt-error` does not depend on `fnt-types`. Callers that decode on-disk
//! bytes convert at the read site because only they know which cluster (or
//! index block VCN) the bytes came from:
//!
//! | ParseError Variant | FntError Variant |
//! |--------------------|------------------|
//! | `InsufficientData` | `Corruption { cluster, detail }` |
//! | `InvalidMagic` | `Corruption { cluster, detail }` |
//! | `InvalidField` | `Corruption` for live metadata, `Format` for caller-supplied input |
//! | `IntegerConversion` | `Corruption { cluster, detail }` |
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Invariant` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `PermissionDenied` | `EACCES` |
//!
//! There is no retry anywhere below this type. Resource exhaustion is rolled
//! back by the component that detected it before `NoSpace` is returned.

use thiserror::Error;

/// Unified error type for all FrankenNTFS operations.
#[derive(Debug, Error)]
pub enum FntError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata is malformed: bad run encoding, missing End entry,
    /// fixup mismatch, duplicate key in a stored node.
    ///
    /// `cluster` is the LCN (or index block VCN) the bytes were read from.
    #[error("corrupt metadata at cluster {cluster}: {detail}")]
    Corruption { cluster: u64, detail: String },

    /// Caller-supplied data that cannot be represented on disk.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without a known location.
    #[error("parse error: {0}")]
    Parse(String),

    /// Cluster size, volume size or index block size out of range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// No free clusters (or index blocks) satisfy the request.
    #[error("no space left on device")]
    NoSpace,

    /// Key, run or region not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// Key already present in a unique index.
    #[error("already exists")]
    Exists,

    /// A programming defect was detected: VCN outside the mapped range,
    /// split point outside a run, freeing clusters outside the volume.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Write attempted on a read-only device.
    #[error("permission denied")]
    PermissionDenied,
}

impl FntError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive so adding a variant fails to compile until
    /// its errno is chosen.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::Invariant(_) => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::PermissionDenied => libc::EACCES,
        }
    }

    /// Shorthand for a corruption error at `cluster`.
    #[must_use]
    pub fn corruption(cluster: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            cluster,
            detail: detail.into(),
        }
    }

    /// True for errors that indicate damaged on-disk state rather than a
    /// caller or resource problem.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Result alias using `FntError`.
pub type Result<T> = std::result::Result<T, FntError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(FntError, libc::c_int)> = vec![
            (FntError::Io(std::io::Error::other("test")), libc::EIO),
            (FntError::corruption(7, "missing end entry"), libc::EIO),
            (FntError::Format("entry too large".into()), libc::EINVAL),
            (FntError::Parse("short read".into()), libc::EINVAL),
            (
                FntError::InvalidGeometry("cluster_size=3000".into()),
                libc::EINVAL,
            ),
            (FntError::NoSpace, libc::ENOSPC),
            (FntError::NotFound("key".into()), libc::ENOENT),
            (FntError::Exists, libc::EEXIST),
            (FntError::Invariant("vcn 9 beyond 8".into()), libc::EIO),
            (FntError::PermissionDenied, libc::EACCES),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = FntError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = FntError::corruption(42, "fixup mismatch in sector 3");
        assert_eq!(
            err.to_string(),
            "corrupt metadata at cluster 42: fixup mismatch in sector 3"
        );
        assert!(err.is_corruption());

        assert_eq!(FntError::NoSpace.to_string(), "no space left on device");
        assert_eq!(
            FntError::Invariant("split outside run".into()).to_string(),
            "invariant violated: split outside run"
        );
        assert!(!FntError::Exists.is_corruption());
    }
}
