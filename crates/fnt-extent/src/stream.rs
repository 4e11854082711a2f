//! Cluster-granular I/O over an extent-mapped attribute.

use crate::extents::ExtentList;
use crate::volume::Volume;
use fnt_alloc::AllocRequest;
use fnt_error::{FntError, Result};
use fnt_types::{Lcn, u64_to_usize};
use tracing::{debug, trace};

/// Turns "cluster N of this attribute" into "cluster M on disk".
///
/// Sparse runs read as zeros. Writing into a sparse run allocates first;
/// writing into a stored run never allocates. Growth of the mapped range is
/// logical only until bytes land.
#[derive(Debug, Clone)]
pub struct ClusterStream {
    extents: ExtentList,
    priority: bool,
    collapse_on_write: bool,
}

impl ClusterStream {
    #[must_use]
    pub fn new(extents: ExtentList) -> Self {
        Self {
            extents,
            priority: false,
            collapse_on_write: true,
        }
    }

    /// Mark this stream as the metadata table's own data.
    #[must_use]
    pub fn priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    /// Whether runs are merged after every mapping change.
    #[must_use]
    pub fn collapse_on_write(mut self, collapse: bool) -> Self {
        self.collapse_on_write = collapse;
        self
    }

    #[must_use]
    pub fn extents(&self) -> &ExtentList {
        &self.extents
    }

    pub fn extents_mut(&mut self) -> &mut ExtentList {
        &mut self.extents
    }

    #[must_use]
    pub fn into_extents(self) -> ExtentList {
        self.extents
    }

    /// Mapped length in clusters (stored plus sparse).
    #[must_use]
    pub fn mapped_clusters(&self) -> u64 {
        self.extents.next_vcn()
    }

    /// Whether `vcn` is backed by a physical cluster.
    pub fn is_stored(&self, vcn: u64) -> Result<bool> {
        Ok(self.extents.lcn_of(vcn)?.is_some())
    }

    fn span_bytes(vol: &Volume, count: u64, buf_len: usize) -> Result<usize> {
        let bytes = vol
            .cluster_size()
            .cluster_to_byte(count)
            .ok_or_else(|| FntError::Invariant("cluster span overflows".into()))?;
        let bytes = u64_to_usize(bytes, "span").map_err(|e| FntError::Invariant(e.to_string()))?;
        if bytes != buf_len {
            return Err(FntError::Invariant(format!(
                "buffer of {buf_len} bytes for {count} clusters"
            )));
        }
        Ok(bytes)
    }

    fn check_mapped(&self, start_vcn: u64, count: u64) -> Result<u64> {
        start_vcn
            .checked_add(count)
            .filter(|end| *end <= self.extents.next_vcn())
            .ok_or_else(|| {
                FntError::Invariant(format!(
                    "clusters {start_vcn}+{count} beyond mapped range {}",
                    self.extents.next_vcn()
                ))
            })
    }

    /// Read `count` clusters starting at `start_vcn` into `buf`.
    pub fn read_clusters(
        &self,
        vol: &Volume,
        start_vcn: u64,
        count: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        Self::span_bytes(vol, count, buf.len())?;
        let end = self.check_mapped(start_vcn, count)?;
        let cs = vol.cluster_size().as_usize();
        let mut vcn = start_vcn;
        let mut off = 0_usize;
        while vcn < end {
            let run = self.extents.runs()[self.extents.find_run(vcn)?];
            let n = run.end_vcn().min(end) - vcn;
            let bytes = u64_to_usize(n, "run").map_err(|e| FntError::Invariant(e.to_string()))? * cs;
            let chunk = &mut buf[off..off + bytes];
            match run.lcn {
                None => chunk.fill(0),
                Some(lcn) => vol.device().read_clusters(lcn + (vcn - run.start_vcn), chunk)?,
            }
            vcn += n;
            off += bytes;
        }
        Ok(())
    }

    /// Write `count` clusters from `buf`, allocating any sparse clusters in
    /// the range first. Returns the number of clusters newly allocated.
    pub fn write_clusters(
        &mut self,
        vol: &mut Volume,
        start_vcn: u64,
        count: u64,
        buf: &[u8],
    ) -> Result<u64> {
        Self::span_bytes(vol, count, buf.len())?;
        let end = self.check_mapped(start_vcn, count)?;
        let allocated = self.allocate_clusters(vol, start_vcn, count)?;
        let cs = vol.cluster_size().as_usize();
        let mut vcn = start_vcn;
        let mut off = 0_usize;
        while vcn < end {
            let run = self.extents.runs()[self.extents.find_run(vcn)?];
            let lcn = run.lcn.ok_or_else(|| {
                FntError::Invariant(format!("vcn {vcn} still sparse after allocation"))
            })?;
            let n = run.end_vcn().min(end) - vcn;
            let bytes = u64_to_usize(n, "run").map_err(|e| FntError::Invariant(e.to_string()))? * cs;
            vol.device()
                .write_clusters(lcn + (vcn - run.start_vcn), &buf[off..off + bytes])?;
            vcn += n;
            off += bytes;
        }
        Ok(allocated)
    }

    /// Back every sparse cluster in `[start_vcn, start_vcn + count)` with
    /// physical clusters. Returns the number newly allocated.
    ///
    /// Contents of newly allocated clusters are undefined until written.
    /// On allocation failure the runs already filled stay filled and the
    /// list remains valid.
    pub fn allocate_clusters(&mut self, vol: &mut Volume, start_vcn: u64, count: u64) -> Result<u64> {
        let end = self.check_mapped(start_vcn, count)?;
        let mut allocated = 0_u64;
        let outcome = self.fill_sparse(vol, start_vcn, end, &mut allocated);
        if self.collapse_on_write {
            self.extents.collapse_runs();
        }
        outcome?;
        if allocated > 0 {
            debug!(start_vcn, count, allocated, "stream_allocate");
        }
        Ok(allocated)
    }

    fn fill_sparse(
        &mut self,
        vol: &mut Volume,
        start_vcn: u64,
        end: u64,
        allocated: &mut u64,
    ) -> Result<()> {
        let mut vcn = start_vcn;
        while vcn < end {
            let mut idx = self.extents.find_run(vcn)?;
            let run = self.extents.runs()[idx];
            if !run.is_sparse() {
                vcn = run.end_vcn();
                continue;
            }
            if run.start_vcn < vcn {
                self.extents.split_run(idx, vcn)?;
                idx += 1;
            }
            if self.extents.runs()[idx].end_vcn() > end {
                self.extents.split_run(idx, end)?;
            }
            let run = self.extents.runs()[idx];
            let hint = self.extents.lcn_after_stored_before(idx).map(Lcn);
            let mut req = AllocRequest::new(run.length)
                .after(hint)
                .size_hint(self.extents.next_vcn());
            req.priority = self.priority;
            let physical = vol.allocator_mut().allocate(&req)?;
            if let Err(err) = self.extents.make_non_sparse(idx, &physical) {
                vol.allocator_mut().free_runs(&physical)?;
                return Err(err);
            }
            trace!(vcn = run.start_vcn, count = run.length, pieces = physical.len(), "stream_fill_sparse");
            *allocated += run.length;
            vcn = run.end_vcn();
        }
        Ok(())
    }

    /// Free the physical clusters behind `[start_vcn, start_vcn + count)`
    /// and map the range sparse. Returns the number of clusters freed.
    pub fn release_clusters(&mut self, vol: &mut Volume, start_vcn: u64, count: u64) -> Result<u64> {
        let end = self.check_mapped(start_vcn, count)?;
        let mut released = 0_u64;
        let outcome = self.punch(vol, start_vcn, end, &mut released);
        if self.collapse_on_write {
            self.extents.collapse_runs();
        }
        outcome?;
        if released > 0 {
            debug!(start_vcn, count, released, "stream_release");
        }
        Ok(released)
    }

    fn punch(&mut self, vol: &mut Volume, start_vcn: u64, end: u64, released: &mut u64) -> Result<()> {
        let mut vcn = start_vcn;
        while vcn < end {
            let mut idx = self.extents.find_run(vcn)?;
            let run = self.extents.runs()[idx];
            if run.is_sparse() {
                vcn = run.end_vcn().min(end);
                continue;
            }
            if run.start_vcn < vcn {
                self.extents.split_run(idx, vcn)?;
                idx += 1;
            }
            if self.extents.runs()[idx].end_vcn() > end {
                self.extents.split_run(idx, end)?;
            }
            let run = self.extents.runs()[idx];
            if let Some(physical) = run.cluster_run() {
                vol.allocator_mut().free(physical)?;
            }
            self.extents.make_sparse(idx)?;
            *released += run.length;
            vcn = run.end_vcn();
        }
        Ok(())
    }

    /// Grow the mapped range to `count` clusters with a sparse tail.
    pub fn expand_to_clusters(&mut self, count: u64) {
        let next = self.extents.next_vcn();
        if count > next {
            self.extents.append_sparse(count - next);
            if self.collapse_on_write {
                self.extents.collapse_runs();
            }
            trace!(from = next, to = count, "stream_expand");
        }
    }

    /// Shrink the mapped range to `count` clusters, freeing whatever lay
    /// beyond. Returns the number of clusters freed.
    pub fn truncate_to_clusters(&mut self, vol: &mut Volume, count: u64) -> Result<u64> {
        let next = self.extents.next_vcn();
        if count >= next {
            return Ok(0);
        }
        let released = self.release_clusters(vol, count, next - count)?;
        let idx = if count == 0 {
            0
        } else {
            let idx = self.extents.find_run(count - 1)?;
            if self.extents.runs()[idx].end_vcn() > count {
                self.extents.split_run(idx, count)?;
            }
            idx + 1
        };
        self.extents.truncate_at(idx);
        debug!(from = next, to = count, released, "stream_truncate");
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::test_volume;
    use fnt_types::ClusterRun;
    use proptest::prelude::*;

    fn assert_runs_allocated(vol: &Volume, stream: &ClusterStream) {
        for run in stream.extents().stored_runs() {
            for lcn in run.start.0..run.end() {
                assert!(vol.allocator().is_allocated(Lcn(lcn)), "lcn {lcn} not allocated");
            }
        }
    }

    #[test]
    fn sparse_expand_reads_zero_without_allocating() {
        let vol = test_volume(1024);
        let mut stream = ClusterStream::new(ExtentList::new());
        stream.expand_to_clusters(16);
        let mut buf = vec![0xAA_u8; 512 * 16];
        stream.read_clusters(&vol, 0, 16, &mut buf).expect("read");
        assert!(buf.iter().all(|b| *b == 0));
        assert_eq!(vol.allocator().allocated_clusters(), 0);
        assert_eq!(stream.extents().run_count(), 1);
    }

    #[test]
    fn write_allocates_only_the_touched_clusters() {
        let mut vol = test_volume(1024);
        let mut stream = ClusterStream::new(ExtentList::new());
        stream.expand_to_clusters(10);
        let data = vec![0x5A_u8; 512 * 2];
        let newly = stream.write_clusters(&mut vol, 4, 2, &data).expect("write");
        assert_eq!(newly, 2);
        assert_eq!(vol.allocator().allocated_clusters(), 2);
        assert_eq!(stream.extents().run_count(), 3);

        let again = stream.write_clusters(&mut vol, 4, 2, &data).expect("rewrite");
        assert_eq!(again, 0);

        let mut buf = vec![0_u8; 512 * 10];
        stream.read_clusters(&vol, 0, 10, &mut buf).expect("read");
        assert!(buf[..2048].iter().all(|b| *b == 0));
        assert!(buf[2048..3072].iter().all(|b| *b == 0x5A));
        assert!(buf[3072..].iter().all(|b| *b == 0));
        assert_runs_allocated(&vol, &stream);
        stream.extents().check_invariants().expect("valid");
    }

    #[test]
    fn adjacent_allocations_stay_contiguous() {
        let mut vol = test_volume(1024);
        let mut stream = ClusterStream::new(ExtentList::new());
        stream.expand_to_clusters(8);
        stream.allocate_clusters(&mut vol, 0, 4).expect("first");
        stream.allocate_clusters(&mut vol, 4, 4).expect("second");
        assert_eq!(stream.extents().run_count(), 1);
        assert_eq!(stream.extents().stored_clusters(), 8);
    }

    #[test]
    fn release_and_truncate_return_clusters() {
        let mut vol = test_volume(1024);
        let mut stream = ClusterStream::new(ExtentList::new());
        stream.expand_to_clusters(12);
        stream.allocate_clusters(&mut vol, 0, 12).expect("alloc");
        assert_eq!(stream.release_clusters(&mut vol, 3, 4).expect("release"), 4);
        assert_eq!(vol.allocator().allocated_clusters(), 8);
        assert!(!stream.is_stored(5).unwrap());
        assert!(stream.is_stored(7).unwrap());

        assert_eq!(stream.truncate_to_clusters(&mut vol, 5).expect("truncate"), 5);
        assert_eq!(stream.mapped_clusters(), 5);
        assert_eq!(vol.allocator().allocated_clusters(), 3);
        assert_runs_allocated(&vol, &stream);
        stream.extents().check_invariants().expect("valid");

        stream.truncate_to_clusters(&mut vol, 0).expect("truncate all");
        assert_eq!(vol.allocator().allocated_clusters(), 0);
        assert_eq!(stream.extents().run_count(), 0);
    }

    #[test]
    fn io_outside_mapping_is_rejected() {
        let mut vol = test_volume(64);
        let mut stream = ClusterStream::new(ExtentList::new());
        stream.expand_to_clusters(2);
        assert!(matches!(
            stream.write_clusters(&mut vol, 1, 2, &[0_u8; 1024]),
            Err(FntError::Invariant(_))
        ));
        let mut buf = [0_u8; 100];
        assert!(matches!(
            stream.read_clusters(&vol, 0, 1, &mut buf),
            Err(FntError::Invariant(_))
        ));
    }

    #[test]
    fn disk_full_leaves_mapping_consistent() {
        let mut vol = test_volume(64);
        vol.allocator_mut()
            .mark_allocated(ClusterRun::new(0, 60))
            .expect("fill");
        let before = vol.allocator().bitmap().as_bytes().to_vec();
        let mut stream = ClusterStream::new(ExtentList::new());
        stream.expand_to_clusters(8);
        let err = stream.allocate_clusters(&mut vol, 0, 8).unwrap_err();
        assert!(matches!(err, FntError::NoSpace));
        assert_eq!(vol.allocator().bitmap().as_bytes(), before.as_slice());
        stream.extents().check_invariants().expect("valid");
        assert_eq!(stream.mapped_clusters(), 8);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn two_streams_never_share_clusters(
            ops in proptest::collection::vec((any::<bool>(), any::<bool>(), 0_u64..32, 1_u64..8), 1..50),
        ) {
            let mut vol = test_volume(512);
            let mut streams = [ClusterStream::new(ExtentList::new()), ClusterStream::new(ExtentList::new())];
            for s in &mut streams {
                s.expand_to_clusters(40);
            }
            for (which, release, start, len) in ops {
                let s = &mut streams[usize::from(which)];
                if release {
                    s.release_clusters(&mut vol, start, len).unwrap();
                } else {
                    s.allocate_clusters(&mut vol, start, len).unwrap();
                }
                s.extents().check_invariants().unwrap();
            }
            let mut owned = std::collections::BTreeSet::new();
            for s in &streams {
                for run in s.extents().stored_runs() {
                    for lcn in run.start.0..run.end() {
                        prop_assert!(owned.insert(lcn), "lcn {} mapped twice", lcn);
                        prop_assert!(vol.allocator().is_allocated(Lcn(lcn)));
                    }
                }
            }
            prop_assert_eq!(vol.allocator().allocated_clusters(), owned.len() as u64);
        }
    }
}
