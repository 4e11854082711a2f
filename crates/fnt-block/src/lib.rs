#![forbid(unsafe_code)]
//! Raw device I/O for FrankenNTFS.
//!
//! Three layers:
//!
//! - [`ByteDevice`]: byte-addressed pread/pwrite over a file or memory.
//! - [`ClusterDevice`]: whole-cluster reads and writes at
//!   `lcn * cluster_size`.
//! - [`ByteStore`]: small growable byte stores standing in for resident
//!   attribute values (index roots, bitmaps). [`ResidentBytes`] keeps the
//!   value in memory; [`DeviceRegion`] pins it to a fixed cluster range.

use fnt_error::{FntError, Result};
use fnt_types::{ClusterSize, u64_to_usize};
use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

fn checked_end(offset: u64, len: usize, what: &str) -> Result<u64> {
    let len = u64::try_from(len).map_err(|_| FntError::Format(format!("{what} length overflows u64")))?;
    offset
        .checked_add(len)
        .ok_or_else(|| FntError::Format(format!("{what} range overflows u64")))
}

// ── Byte devices ────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync + fmt::Debug {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `FileExt` positional I/O.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing image, falling back to read-only when the file is
    /// not writable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) an image of exactly `len` zero bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, buf.len(), "read")?;
        if end > self.len {
            return Err(FntError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(FntError::PermissionDenied);
        }
        let end = checked_end(offset, buf.len(), "write")?;
        if end > self.len {
            return Err(FntError::Format(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Memory-backed byte device. Used for tests and scratch volumes.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    /// Copy of the whole device image.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = u64_to_usize(offset, "offset").map_err(|e| FntError::Format(e.to_string()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| FntError::Format("read range overflow".into()))?;
        let bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(FntError::Format(format!(
                "read out of bounds: offset={offset} len={} dev_len={}",
                buf.len(),
                bytes.len()
            )));
        }
        buf.copy_from_slice(&bytes[start..end]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = u64_to_usize(offset, "offset").map_err(|e| FntError::Format(e.to_string()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| FntError::Format("write range overflow".into()))?;
        let mut bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(FntError::Format(format!(
                "write out of bounds: offset={offset} len={} dev_len={}",
                buf.len(),
                bytes.len()
            )));
        }
        bytes[start..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Cluster device ──────────────────────────────────────────────────────────

/// Whole-cluster view of a byte device.
///
/// Invariant: `cluster_count * cluster_size <= inner.len_bytes()`.
#[derive(Debug, Clone)]
pub struct ClusterDevice {
    inner: Arc<dyn ByteDevice>,
    cluster_size: ClusterSize,
    cluster_count: u64,
}

impl ClusterDevice {
    pub fn new(inner: Arc<dyn ByteDevice>, cluster_size: ClusterSize) -> Result<Self> {
        let len = inner.len_bytes();
        let cluster_count = len / cluster_size.as_u64();
        if cluster_count == 0 {
            return Err(FntError::InvalidGeometry(format!(
                "device of {len} bytes holds no {cluster_size}-byte cluster"
            )));
        }
        Ok(Self {
            inner,
            cluster_size,
            cluster_count,
        })
    }

    #[must_use]
    pub fn cluster_size(&self) -> ClusterSize {
        self.cluster_size
    }

    #[must_use]
    pub fn cluster_count(&self) -> u64 {
        self.cluster_count
    }

    #[must_use]
    pub fn inner(&self) -> &Arc<dyn ByteDevice> {
        &self.inner
    }

    fn span_offset(&self, lcn: u64, buf_len: usize) -> Result<u64> {
        let cs = self.cluster_size.as_usize();
        if buf_len % cs != 0 {
            return Err(FntError::Invariant(format!(
                "cluster I/O of {buf_len} bytes is not a multiple of {cs}"
            )));
        }
        let count = (buf_len / cs) as u64;
        let end = lcn
            .checked_add(count)
            .ok_or_else(|| FntError::Invariant("cluster range overflow".into()))?;
        if end > self.cluster_count {
            return Err(FntError::Invariant(format!(
                "clusters {lcn}..{end} beyond device end {}",
                self.cluster_count
            )));
        }
        self.cluster_size
            .cluster_to_byte(lcn)
            .ok_or_else(|| FntError::Invariant("cluster offset overflow".into()))
    }

    /// Read `buf.len() / cluster_size` whole clusters starting at `lcn`.
    pub fn read_clusters(&self, lcn: u64, buf: &mut [u8]) -> Result<()> {
        let offset = self.span_offset(lcn, buf.len())?;
        trace!(lcn, bytes = buf.len(), "cluster_read");
        self.inner.read_exact_at(offset, buf)
    }

    /// Write whole clusters starting at `lcn`.
    pub fn write_clusters(&self, lcn: u64, buf: &[u8]) -> Result<()> {
        let offset = self.span_offset(lcn, buf.len())?;
        trace!(lcn, bytes = buf.len(), "cluster_write");
        self.inner.write_all_at(offset, buf)
    }

    /// Fill `count` clusters starting at `lcn` with zeros.
    pub fn zero_clusters(&self, lcn: u64, count: u64) -> Result<()> {
        let zeros = vec![0_u8; self.cluster_size.as_usize()];
        for i in 0..count {
            self.write_clusters(lcn + i, &zeros)?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

// ── Resident byte stores ────────────────────────────────────────────────────

/// Growable byte value, the shape of a resident attribute.
pub trait ByteStore: fmt::Debug {
    /// Current length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `buf.len()` bytes at `offset`. The range must lie within `len()`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` at `offset`, growing the value when the write ends past
    /// `len()`. Any gap is zero-filled.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Grow (zero-filled) or shrink the value.
    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Whole contents.
    fn read_all(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; u64_to_usize(self.len(), "len").map_err(|e| FntError::Format(e.to_string()))?];
        self.read_at(0, &mut buf)?;
        Ok(buf)
    }

    /// Replace the whole contents.
    fn replace(&mut self, bytes: &[u8]) -> Result<()> {
        self.set_len(bytes.len() as u64)?;
        self.write_at(0, bytes)
    }
}

/// In-memory resident value. Clones share the same bytes, so the record
/// layer can keep a handle while the index or bitmap owns another.
#[derive(Debug, Clone, Default)]
pub struct ResidentBytes {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl ResidentBytes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteStore for ResidentBytes {
    fn len(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let start = u64_to_usize(offset, "offset").map_err(|e| FntError::Format(e.to_string()))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                FntError::Invariant(format!(
                    "resident read {offset}+{} beyond length {}",
                    buf.len(),
                    bytes.len()
                ))
            })?;
        buf.copy_from_slice(&bytes[start..end]);
        drop(bytes);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let start = u64_to_usize(offset, "offset").map_err(|e| FntError::Format(e.to_string()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| FntError::Format("resident write range overflow".into()))?;
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len = u64_to_usize(len, "len").map_err(|e| FntError::Format(e.to_string()))?;
        self.bytes.lock().resize(len, 0);
        Ok(())
    }
}

/// Byte value pinned to a fixed run of clusters on the device.
///
/// The logical length lives in memory; growing past the reserved capacity
/// fails with `NoSpace`.
#[derive(Debug, Clone)]
pub struct DeviceRegion {
    dev: ClusterDevice,
    start_lcn: u64,
    capacity: u64,
    len: u64,
}

impl DeviceRegion {
    /// A region of `clusters` clusters at `start_lcn` with logical length
    /// `len`.
    pub fn new(dev: ClusterDevice, start_lcn: u64, clusters: u64, len: u64) -> Result<Self> {
        let end = start_lcn
            .checked_add(clusters)
            .ok_or_else(|| FntError::InvalidGeometry("region overflows".into()))?;
        if end > dev.cluster_count() {
            return Err(FntError::InvalidGeometry(format!(
                "region {start_lcn}..{end} beyond device end {}",
                dev.cluster_count()
            )));
        }
        let capacity = clusters * dev.cluster_size().as_u64();
        if len > capacity {
            return Err(FntError::InvalidGeometry(format!(
                "region length {len} exceeds capacity {capacity}"
            )));
        }
        Ok(Self {
            dev,
            start_lcn,
            capacity,
            len,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn base(&self) -> u64 {
        self.start_lcn * self.dev.cluster_size().as_u64()
    }
}

impl ByteStore for DeviceRegion {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, buf.len(), "region read")?;
        if end > self.len {
            return Err(FntError::Invariant(format!(
                "region read {offset}+{} beyond length {}",
                buf.len(),
                self.len
            )));
        }
        self.dev.inner().read_exact_at(self.base() + offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = checked_end(offset, buf.len(), "region write")?;
        if end > self.capacity {
            return Err(FntError::NoSpace);
        }
        if offset > self.len {
            let gap = u64_to_usize(offset - self.len, "gap").map_err(|e| FntError::Format(e.to_string()))?;
            self.dev
                .inner()
                .write_all_at(self.base() + self.len, &vec![0_u8; gap])?;
        }
        self.dev.inner().write_all_at(self.base() + offset, buf)?;
        self.len = self.len.max(end);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if len > self.capacity {
            return Err(FntError::NoSpace);
        }
        if len > self.len {
            let gap = u64_to_usize(len - self.len, "gap").map_err(|e| FntError::Format(e.to_string()))?;
            self.dev
                .inner()
                .write_all_at(self.base() + self.len, &vec![0_u8; gap])?;
        }
        self.len = len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_clusters(clusters: usize) -> ClusterDevice {
        let mem: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(clusters * 4096));
        ClusterDevice::new(mem, ClusterSize::new(4096).expect("cs")).expect("device")
    }

    #[test]
    fn cluster_device_round_trips() {
        let dev = mem_clusters(4);
        dev.write_clusters(2, &[7_u8; 4096]).expect("write");
        let mut buf = vec![0_u8; 4096];
        dev.read_clusters(2, &mut buf).expect("read");
        assert_eq!(buf, vec![7_u8; 4096]);
    }

    #[test]
    fn cluster_device_rejects_out_of_range_and_partial() {
        let dev = mem_clusters(4);
        let mut buf = vec![0_u8; 8192];
        assert!(matches!(
            dev.read_clusters(3, &mut buf),
            Err(FntError::Invariant(_))
        ));
        assert!(matches!(
            dev.write_clusters(0, &[0_u8; 100]),
            Err(FntError::Invariant(_))
        ));
    }

    #[test]
    fn zero_sized_device_rejected() {
        let mem: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(100));
        assert!(matches!(
            ClusterDevice::new(mem, ClusterSize::new(4096).expect("cs")),
            Err(FntError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn resident_bytes_grow_and_share() {
        let mut a = ResidentBytes::new();
        let b = a.clone();
        a.write_at(4, &[1, 2]).expect("write");
        assert_eq!(b.contents(), vec![0, 0, 0, 0, 1, 2]);
        a.set_len(2).expect("shrink");
        assert_eq!(b.len(), 2);
        let mut out = [0_u8; 4];
        assert!(a.read_at(0, &mut out).is_err());
    }

    #[test]
    fn device_region_capacity_enforced() {
        let dev = mem_clusters(4);
        let mut region = DeviceRegion::new(dev.clone(), 1, 1, 0).expect("region");
        region.write_at(10, &[0xAB; 4]).expect("write");
        assert_eq!(region.len(), 14);
        assert_eq!(region.read_all().expect("read"), {
            let mut v = vec![0_u8; 10];
            v.extend_from_slice(&[0xAB; 4]);
            v
        });
        assert!(matches!(
            region.write_at(4095, &[1, 2]),
            Err(FntError::NoSpace)
        ));

        let mut raw = vec![0_u8; 4096];
        dev.read_clusters(1, &mut raw).expect("raw");
        assert_eq!(&raw[10..14], &[0xAB; 4]);
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vol.img");
        let dev = FileByteDevice::create(&path, 8192).expect("create");
        dev.write_all_at(4096, b"INDX").expect("write");
        dev.sync().expect("sync");

        let reopened = FileByteDevice::open(&path).expect("open");
        assert!(reopened.is_writable());
        let mut buf = [0_u8; 4];
        reopened.read_exact_at(4096, &mut buf).expect("read");
        assert_eq!(&buf, b"INDX");
        assert!(reopened.read_exact_at(8190, &mut buf).is_err());
    }
}
