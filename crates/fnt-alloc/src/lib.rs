#![forbid(unsafe_code)]
//! Cluster allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw LSB-first bit manipulation plus [`BitVector`], a
//!    growable bit array persisted through a resident byte store.
//! 2. **FreeSpaceAllocator**: one bit per volume cluster (1 = allocated)
//!    with a multi-strategy, fragmentation-aware search.
//!
//! The allocator is the only mutator of the volume bitmap. Extent code asks
//! for runs and hands them back; it never touches bits directly.
//!
//! ## Search order
//!
//! Every request first tries to extend forward from the caller's proposed
//! start. Priority streams (the metadata table) then look for one
//! contiguous span from cluster 0, and finally take whatever is free from
//! cluster 0 onward. Ordinary streams look for a contiguous span in the
//! upper 7/8 of the volume, then take free clusters from progressively
//! lower windows: `[n/8, n)`, `[n/16, n/8)`, `[n/32, n/16)`, `[0, n/32)`.
//! The contiguous passes are skipped once the disk is known to be
//! fragmented.

pub mod bitmap;

pub use bitmap::{
    BitVector, bitmap_clear, bitmap_count_set, bitmap_find_clear, bitmap_get, bitmap_set,
};

use fnt_error::{FntError, Result};
use fnt_types::{ClusterRun, Lcn};
use tracing::{debug, trace, warn};

// ── Allocation request ──────────────────────────────────────────────────────

/// Parameters for one allocation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocRequest {
    /// Clusters wanted. The call is all-or-nothing.
    pub count: u64,
    /// Cluster immediately after the stream's current tail, if any.
    pub proposed_start: Option<Lcn>,
    /// The metadata table's own data stream.
    pub priority: bool,
    /// Expected final size of the stream in clusters. A quarter of it is
    /// left as headroom after a non-priority search.
    pub total_size_hint: u64,
}

impl AllocRequest {
    #[must_use]
    pub fn new(count: u64) -> Self {
        Self {
            count,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn after(mut self, lcn: Option<Lcn>) -> Self {
        self.proposed_start = lcn;
        self
    }

    #[must_use]
    pub fn priority(mut self) -> Self {
        self.priority = true;
        self
    }

    #[must_use]
    pub fn size_hint(mut self, clusters: u64) -> Self {
        self.total_size_hint = clusters;
        self
    }
}

// ── Free-space allocator ────────────────────────────────────────────────────

/// Volume-wide cluster allocator.
#[derive(Debug)]
pub struct FreeSpaceAllocator {
    bitmap: BitVector,
    total_clusters: u64,
    allocated: u64,
    next_data_cluster: u64,
    fragmented: bool,
}

impl FreeSpaceAllocator {
    /// Wrap a loaded bitmap describing `total_clusters` clusters.
    pub fn new(mut bitmap: BitVector, total_clusters: u64) -> Result<Self> {
        bitmap.set_max_bits(total_clusters);
        if bitmap.capacity_bits() < total_clusters {
            bitmap.set_size(total_clusters)?;
        }
        let allocated = bitmap.count_present(total_clusters);
        debug!(total_clusters, allocated, "alloc_open");
        Ok(Self {
            bitmap,
            total_clusters,
            allocated,
            next_data_cluster: 0,
            fragmented: false,
        })
    }

    #[must_use]
    pub fn total_clusters(&self) -> u64 {
        self.total_clusters
    }

    #[must_use]
    pub fn allocated_clusters(&self) -> u64 {
        self.allocated
    }

    #[must_use]
    pub fn free_clusters(&self) -> u64 {
        self.total_clusters - self.allocated
    }

    #[must_use]
    pub fn is_fragmented(&self) -> bool {
        self.fragmented
    }

    #[must_use]
    pub fn is_allocated(&self, lcn: Lcn) -> bool {
        self.bitmap.is_present(lcn.0)
    }

    #[must_use]
    pub fn bitmap(&self) -> &BitVector {
        &self.bitmap
    }

    /// Allocate `req.count` clusters, returning the runs in the order they
    /// were claimed.
    ///
    /// On shortfall every cluster claimed by this call is released again and
    /// `NoSpace` is returned, leaving the bitmap exactly as it was.
    pub fn allocate(&mut self, req: &AllocRequest) -> Result<Vec<ClusterRun>> {
        if req.count == 0 {
            return Ok(Vec::new());
        }
        if req.count > self.free_clusters() {
            debug!(
                count = req.count,
                free = self.free_clusters(),
                "alloc_no_space"
            );
            return Err(FntError::NoSpace);
        }

        let saved_cursor = self.next_data_cluster;
        let mut runs = Vec::new();
        let outcome = self.search(req, &mut runs);
        let found: u64 = runs.iter().map(|r| r.count).sum();

        match outcome {
            Ok(()) if found >= req.count => {}
            other => {
                self.rollback(&runs);
                self.next_data_cluster = saved_cursor;
                debug!(count = req.count, found, "alloc_rolled_back");
                other?;
                return Err(FntError::NoSpace);
            }
        }

        self.allocated += found;
        let was_fragmented = self.fragmented;
        let run_count = runs.len() as u64;
        // A single short run says nothing about fragmentation.
        if (found > 4 && run_count == 1) || run_count > 1 {
            self.fragmented = found / run_count < 4;
        }
        if was_fragmented != self.fragmented {
            debug!(
                fragmented = self.fragmented,
                runs = run_count,
                "alloc_fragmented_mode"
            );
        }
        debug!(
            count = req.count,
            runs = run_count,
            first_lcn = runs.first().map_or(0, |r| r.start.0),
            priority = req.priority,
            "alloc_clusters"
        );
        Ok(runs)
    }

    fn search(&mut self, req: &AllocRequest, runs: &mut Vec<ClusterRun>) -> Result<()> {
        let n = self.total_clusters;
        let count = req.count;
        let mut found = 0_u64;

        if let Some(start) = req.proposed_start {
            found += self.extend_run(count - found, runs, start.0)?;
        }

        if req.priority {
            if found < count && !self.fragmented {
                found += self.find_clusters(count - found, runs, 0, n, true, true, 0)?;
            }
            if found < count {
                self.find_clusters(count - found, runs, 0, n, true, false, 0)?;
            }
        } else {
            let windows = [(n / 8, n), (n / 16, n / 8), (n / 32, n / 16), (0, n / 32)];
            if found < count && !self.fragmented {
                found += self.find_clusters(
                    count - found,
                    runs,
                    n / 8,
                    n,
                    false,
                    true,
                    req.total_size_hint / 4,
                )?;
            }
            for (start, end) in windows {
                if found >= count {
                    break;
                }
                found += self.find_clusters(count - found, runs, start, end, false, false, 0)?;
            }
        }
        Ok(())
    }

    /// Claim free clusters forward from `start`.
    fn extend_run(&mut self, count: u64, runs: &mut Vec<ClusterRun>, start: u64) -> Result<u64> {
        let end = self.total_clusters;
        let mut focus = start;
        while focus < end && focus - start < count && !self.bitmap.is_present(focus) {
            focus += 1;
        }
        let len = focus - start;
        if len > 0 {
            self.claim(runs, start, len)?;
            trace!(lcn = start, count = len, "alloc_extend_run");
        }
        Ok(len)
    }

    /// Scan `[start, end)` for free clusters.
    ///
    /// Priority scans begin at `start`; ordinary scans resume at the
    /// round-robin cursor and wrap inside the window. In contiguous mode only
    /// a single span large enough for the whole remainder is accepted.
    #[expect(clippy::too_many_arguments)]
    fn find_clusters(
        &mut self,
        count: u64,
        runs: &mut Vec<ClusterRun>,
        start: u64,
        end: u64,
        priority: bool,
        contiguous: bool,
        headroom: u64,
    ) -> Result<u64> {
        if start >= end || count == 0 {
            return Ok(0);
        }
        let window = end - start;
        let mut focus = if priority {
            start
        } else {
            if self.next_data_cluster < start || self.next_data_cluster >= end {
                self.next_data_cluster = start;
            }
            self.next_data_cluster
        };

        let mut found = 0_u64;
        let mut inspected = 0_u64;
        while found < count && inspected < window {
            if self.bitmap.is_present(focus) {
                focus += 1;
                inspected += 1;
            } else {
                let run_start = focus;
                let want = count - found;
                while focus < end && focus - run_start < want && !self.bitmap.is_present(focus) {
                    focus += 1;
                    inspected += 1;
                }
                let len = focus - run_start;
                if !contiguous || len >= want {
                    self.claim(runs, run_start, len)?;
                    found += len;
                }
            }
            if focus >= end {
                focus = start;
            }
        }

        if !priority {
            self.next_data_cluster = focus + headroom;
        }
        trace!(start, end, contiguous, found, "alloc_find_clusters");
        Ok(found)
    }

    fn claim(&mut self, runs: &mut Vec<ClusterRun>, start: u64, len: u64) -> Result<()> {
        self.bitmap.mark_present_range(start, len)?;
        match runs.last_mut() {
            Some(last) if last.end() == start => last.count += len,
            _ => runs.push(ClusterRun::new(start, len)),
        }
        Ok(())
    }

    fn rollback(&mut self, runs: &[ClusterRun]) {
        for run in runs {
            if let Err(err) = self.bitmap.mark_absent_range(run.start.0, run.count) {
                warn!(lcn = run.start.0, count = run.count, %err, "alloc_rollback_failed");
            }
        }
    }

    /// Return a run to the free pool.
    ///
    /// Freeing already-free clusters is tolerated and logged; a run beyond the
    /// end of the volume is a caller defect.
    pub fn free(&mut self, run: ClusterRun) -> Result<()> {
        if run.count == 0 {
            return Ok(());
        }
        let end = self.checked_end(run)?;
        let still_set = bitmap_count_set(self.bitmap.as_bytes(), run.start.0, end);
        if still_set < run.count {
            warn!(
                lcn = run.start.0,
                count = run.count,
                already_free = run.count - still_set,
                "free_unallocated_clusters"
            );
        }
        self.bitmap.mark_absent_range(run.start.0, run.count)?;
        self.allocated -= still_set;
        trace!(lcn = run.start.0, count = run.count, "free_clusters");
        Ok(())
    }

    pub fn free_runs(&mut self, runs: &[ClusterRun]) -> Result<()> {
        for run in runs {
            self.free(*run)?;
        }
        Ok(())
    }

    /// Mark a run allocated outside the search path (boot region, bitmap
    /// region, or runs loaded from an existing attribute).
    pub fn mark_allocated(&mut self, run: ClusterRun) -> Result<()> {
        if run.count == 0 {
            return Ok(());
        }
        let end = self.checked_end(run)?;
        let already = bitmap_count_set(self.bitmap.as_bytes(), run.start.0, end);
        self.bitmap.mark_present_range(run.start.0, run.count)?;
        self.allocated += run.count - already;
        Ok(())
    }

    /// Resize the volume. Shrinking past an allocated cluster is refused.
    pub fn set_total_clusters(&mut self, total: u64) -> Result<()> {
        if total < self.total_clusters {
            let tail = bitmap_count_set(self.bitmap.as_bytes(), total, self.total_clusters);
            if tail > 0 {
                return Err(FntError::Invariant(format!(
                    "cannot shrink volume to {total} clusters: {tail} clusters in use past the end"
                )));
            }
        }
        self.bitmap.set_max_bits(total);
        self.bitmap.set_size(total)?;
        debug!(old = self.total_clusters, new = total, "alloc_resize");
        self.total_clusters = total;
        if self.next_data_cluster >= total {
            self.next_data_cluster = 0;
        }
        Ok(())
    }

    fn checked_end(&self, run: ClusterRun) -> Result<u64> {
        run.start
            .0
            .checked_add(run.count)
            .filter(|end| *end <= self.total_clusters)
            .ok_or_else(|| {
                FntError::Invariant(format!(
                    "clusters {}+{} beyond volume end {}",
                    run.start, run.count, self.total_clusters
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnt_block::ResidentBytes;
    use proptest::prelude::*;

    fn make_alloc(total: u64) -> FreeSpaceAllocator {
        let bv = BitVector::create(Box::new(ResidentBytes::new()), total).expect("bitmap");
        FreeSpaceAllocator::new(bv, total).expect("alloc")
    }

    fn total_len(runs: &[ClusterRun]) -> u64 {
        runs.iter().map(|r| r.count).sum()
    }

    #[test]
    fn ordinary_allocation_on_empty_volume_is_contiguous() {
        let mut alloc = make_alloc(1000);
        let runs = alloc.allocate(&AllocRequest::new(100)).expect("alloc");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].count, 100);
        assert!(runs[0].start.0 >= 125, "ordinary data starts past n/8");
        assert_eq!(alloc.bitmap().count_present(1000), 100);
        assert_eq!(alloc.allocated_clusters(), 100);
        assert!(!alloc.is_fragmented());
    }

    #[test]
    fn priority_allocation_starts_at_zero() {
        let mut alloc = make_alloc(1000);
        alloc.mark_allocated(ClusterRun::new(0, 16)).expect("boot");
        let runs = alloc
            .allocate(&AllocRequest::new(32).priority())
            .expect("alloc");
        assert_eq!(runs, vec![ClusterRun::new(16, 32)]);
    }

    #[test]
    fn proposed_start_extends_tail_run() {
        let mut alloc = make_alloc(1000);
        let first = alloc.allocate(&AllocRequest::new(10)).expect("first");
        let tail = first[0].start.checked_add(10);
        let second = alloc
            .allocate(&AllocRequest::new(5).after(tail))
            .expect("second");
        assert_eq!(second, vec![ClusterRun::new(first[0].end(), 5)]);
    }

    #[test]
    fn free_then_reallocate_keeps_counts() {
        let mut alloc = make_alloc(1000);
        let runs = alloc.allocate(&AllocRequest::new(10)).expect("alloc");
        let base = runs[0].start.0;
        alloc.free(ClusterRun::new(base + 3, 4)).expect("free");
        assert_eq!(alloc.allocated_clusters(), 6);
        let again = alloc
            .allocate(&AllocRequest::new(4).after(Some(Lcn(base + 3))))
            .expect("realloc");
        assert_eq!(again, vec![ClusterRun::new(base + 3, 4)]);
        assert_eq!(alloc.bitmap().count_present(1000), 10);
    }

    #[test]
    fn shortfall_rolls_back_everything() {
        let mut alloc = make_alloc(64);
        alloc.mark_allocated(ClusterRun::new(0, 60)).expect("fill");
        let before = alloc.bitmap().as_bytes().to_vec();
        assert!(matches!(
            alloc.allocate(&AllocRequest::new(5)),
            Err(FntError::NoSpace)
        ));
        assert_eq!(alloc.bitmap().as_bytes(), before.as_slice());
        assert_eq!(alloc.free_clusters(), 4);
        let runs = alloc.allocate(&AllocRequest::new(4)).expect("fits");
        assert_eq!(total_len(&runs), 4);
    }

    #[test]
    fn fragmented_disk_yields_many_runs_and_sets_mode() {
        let mut alloc = make_alloc(256);
        for lcn in (0..256).step_by(2) {
            alloc.mark_allocated(ClusterRun::new(lcn, 1)).expect("mark");
        }
        let runs = alloc.allocate(&AllocRequest::new(20)).expect("alloc");
        assert_eq!(total_len(&runs), 20);
        assert!(runs.iter().all(|r| r.count == 1));
        assert!(alloc.is_fragmented());

        for run in &runs {
            alloc.free(*run).expect("free");
        }
        alloc.mark_allocated(ClusterRun::new(0, 256)).expect("fill");
        alloc.free(ClusterRun::new(100, 50)).expect("hole");
        let single = alloc.allocate(&AllocRequest::new(8)).expect("alloc");
        assert_eq!(single.len(), 1);
        assert!(!alloc.is_fragmented());
    }

    #[test]
    fn many_large_runs_do_not_mark_the_disk_fragmented() {
        let mut alloc = make_alloc(1000);
        alloc.mark_allocated(ClusterRun::new(0, 1000)).expect("fill");
        for start in [200, 300, 400, 500, 600] {
            alloc.free(ClusterRun::new(start, 10)).expect("hole");
        }
        let runs = alloc.allocate(&AllocRequest::new(50)).expect("alloc");
        assert_eq!(runs.len(), 5);
        assert!(runs.iter().all(|r| r.count == 10));
        assert!(!alloc.is_fragmented());
    }

    #[test]
    fn short_single_run_keeps_fragmented_mode() {
        let mut alloc = make_alloc(256);
        for lcn in (0..256).step_by(2) {
            alloc.mark_allocated(ClusterRun::new(lcn, 1)).expect("mark");
        }
        alloc.allocate(&AllocRequest::new(20)).expect("alloc");
        assert!(alloc.is_fragmented());

        alloc.mark_allocated(ClusterRun::new(0, 256)).expect("fill");
        alloc.free(ClusterRun::new(100, 3)).expect("small hole");
        let small = alloc.allocate(&AllocRequest::new(3)).expect("alloc");
        assert_eq!(small, vec![ClusterRun::new(100, 3)]);
        assert!(alloc.is_fragmented());

        alloc.free(ClusterRun::new(180, 8)).expect("larger hole");
        let large = alloc.allocate(&AllocRequest::new(8)).expect("alloc");
        assert_eq!(large, vec![ClusterRun::new(180, 8)]);
        assert!(!alloc.is_fragmented());
    }

    #[test]
    fn lower_windows_used_as_last_resort() {
        let mut alloc = make_alloc(320);
        alloc.mark_allocated(ClusterRun::new(40, 280)).expect("upper");
        let runs = alloc.allocate(&AllocRequest::new(10)).expect("alloc");
        assert_eq!(total_len(&runs), 10);
        assert!(runs.iter().all(|r| r.end() <= 40));
    }

    #[test]
    fn double_free_is_tolerated_and_out_of_range_rejected() {
        let mut alloc = make_alloc(100);
        alloc.mark_allocated(ClusterRun::new(10, 5)).expect("mark");
        alloc.free(ClusterRun::new(10, 5)).expect("free");
        alloc.free(ClusterRun::new(10, 5)).expect("double free");
        assert_eq!(alloc.allocated_clusters(), 0);
        assert!(matches!(
            alloc.free(ClusterRun::new(98, 5)),
            Err(FntError::Invariant(_))
        ));
    }

    #[test]
    fn resize_refuses_to_drop_used_clusters() {
        let mut alloc = make_alloc(100);
        alloc.mark_allocated(ClusterRun::new(90, 1)).expect("mark");
        assert!(alloc.set_total_clusters(50).is_err());
        alloc.set_total_clusters(200).expect("grow");
        assert_eq!(alloc.free_clusters(), 199);
        let runs = alloc.allocate(&AllocRequest::new(150)).expect("alloc");
        assert_eq!(total_len(&runs), 150);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn allocations_never_overlap_and_rollback_is_exact(
            ops in proptest::collection::vec((1_u64..40, any::<bool>(), any::<bool>()), 1..60),
        ) {
            let mut alloc = make_alloc(512);
            let mut live: Vec<ClusterRun> = Vec::new();

            for (count, priority, free_one) in ops {
                if free_one && !live.is_empty() {
                    let run = live.remove(0);
                    alloc.free(run).unwrap();
                    continue;
                }
                let before = alloc.bitmap().as_bytes().to_vec();
                let mut req = AllocRequest::new(count);
                req.priority = priority;
                match alloc.allocate(&req) {
                    Ok(runs) => {
                        prop_assert_eq!(total_len(&runs), count);
                        for run in &runs {
                            for lcn in run.start.0..run.end() {
                                prop_assert!(!bitmap_get(&before, lcn));
                                prop_assert!(alloc.is_allocated(Lcn(lcn)));
                            }
                        }
                        live.extend(runs);
                    }
                    Err(FntError::NoSpace) => {
                        prop_assert_eq!(alloc.bitmap().as_bytes(), before.as_slice());
                    }
                    Err(other) => prop_assert!(false, "unexpected error {other}"),
                }
                prop_assert_eq!(alloc.allocated_clusters(), total_len(&live));
                prop_assert_eq!(alloc.bitmap().count_present(512), total_len(&live));
            }
        }
    }
}
