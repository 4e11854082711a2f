//! Cooked run lists.
//!
//! An [`ExtentList`] holds the absolute (VCN, LCN) view of an attribute's
//! mapping, stitched from one or more encoded segments. Each cooked run also
//! carries the LCN delta it will be encoded with, so any mutation that moves
//! a stored run must re-derive the delta of the next stored run. That
//! happens in exactly one place: [`ExtentList::relink`].

use fnt_error::{FntError, Result};
use fnt_ondisk::{RawRun, decode_runs, encode_runs};
use fnt_types::ClusterRun;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// One run in absolute form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookedRun {
    pub start_vcn: u64,
    pub length: u64,
    /// First LCN, or `None` for a sparse run.
    pub lcn: Option<u64>,
    /// Encoded delta from the previous stored run of the same segment.
    pub delta: i64,
    /// Segment (run-list fragment) that owns this run.
    pub segment: usize,
}

impl CookedRun {
    #[must_use]
    pub fn end_vcn(&self) -> u64 {
        self.start_vcn + self.length
    }

    #[must_use]
    pub fn is_sparse(&self) -> bool {
        self.lcn.is_none()
    }

    /// The physical clusters of a stored run.
    #[must_use]
    pub fn cluster_run(&self) -> Option<ClusterRun> {
        self.lcn.map(|lcn| ClusterRun::new(lcn, self.length))
    }
}

#[expect(clippy::cast_possible_wrap)]
fn lcn_delta(lcn: u64, prev: u64) -> i64 {
    (lcn as i64).wrapping_sub(prev as i64)
}

impl Default for ExtentList {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalized, mutable run list of one attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentList {
    runs: Vec<CookedRun>,
    /// Start VCN of every segment; segment 0 always starts at 0.
    segment_starts: Vec<u64>,
    /// Inclusive index range touched since the last collapse.
    dirty: Option<(usize, usize)>,
}

impl ExtentList {
    #[must_use]
    pub fn new() -> Self {
        Self {
            runs: Vec::new(),
            segment_starts: vec![0],
            dirty: None,
        }
    }

    /// Build from decoded segments `(start_vcn, runs)`.
    ///
    /// Segments must be in VCN order and abut each other; deltas restart at
    /// each segment.
    pub fn from_segments(segments: &[(u64, Vec<RawRun>)]) -> Result<Self> {
        let mut list = Self {
            runs: Vec::new(),
            segment_starts: Vec::with_capacity(segments.len().max(1)),
            dirty: None,
        };
        let mut vcn = 0_u64;
        for (segment, (start_vcn, raw)) in segments.iter().enumerate() {
            if *start_vcn != vcn {
                return Err(FntError::corruption(
                    *start_vcn,
                    format!("run list segment {segment} starts at vcn {start_vcn}, expected {vcn}"),
                ));
            }
            list.segment_starts.push(*start_vcn);
            let mut prev = 0_u64;
            for run in raw {
                let lcn = match run.delta {
                    None => None,
                    Some(delta) => {
                        let lcn = prev.checked_add_signed(delta).ok_or_else(|| {
                            FntError::corruption(vcn, format!("run delta {delta} underflows lcn {prev}"))
                        })?;
                        prev = lcn;
                        Some(lcn)
                    }
                };
                list.runs.push(CookedRun {
                    start_vcn: vcn,
                    length: run.length,
                    lcn,
                    delta: run.delta.unwrap_or(0),
                    segment,
                });
                vcn = vcn.checked_add(run.length).ok_or_else(|| {
                    FntError::corruption(vcn, "run list vcn overflows")
                })?;
            }
        }
        if list.segment_starts.is_empty() {
            list.segment_starts.push(0);
        }
        Ok(list)
    }

    /// Decode from encoded run-list bytes per segment.
    pub fn from_encoded(segments: &[(u64, &[u8])]) -> Result<Self> {
        let mut decoded = Vec::with_capacity(segments.len());
        for (start_vcn, bytes) in segments {
            let (runs, _) = decode_runs(bytes)
                .map_err(|e| FntError::corruption(*start_vcn, format!("run list: {e}")))?;
            decoded.push((*start_vcn, runs));
        }
        Self::from_segments(&decoded)
    }

    /// Raw runs per segment, as they would be written back.
    #[must_use]
    pub fn raw_segments(&self) -> Vec<(u64, Vec<RawRun>)> {
        let mut out: Vec<(u64, Vec<RawRun>)> = self
            .segment_starts
            .iter()
            .map(|start| (*start, Vec::new()))
            .collect();
        for run in &self.runs {
            let raw = if run.is_sparse() {
                RawRun::sparse(run.length)
            } else {
                RawRun::stored(run.length, run.delta)
            };
            out[run.segment].1.push(raw);
        }
        out
    }

    /// Encoded run-list bytes per segment.
    #[must_use]
    pub fn encode_segments(&self) -> Vec<(u64, Vec<u8>)> {
        self.raw_segments()
            .into_iter()
            .map(|(start, runs)| (start, encode_runs(&runs)))
            .collect()
    }

    #[must_use]
    pub fn runs(&self) -> &[CookedRun] {
        &self.runs
    }

    #[must_use]
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segment_starts.len()
    }

    /// One past the last mapped VCN.
    #[must_use]
    pub fn next_vcn(&self) -> u64 {
        self.runs.last().map_or(0, CookedRun::end_vcn)
    }

    /// Clusters backed by physical storage.
    #[must_use]
    pub fn stored_clusters(&self) -> u64 {
        self.runs
            .iter()
            .filter(|r| !r.is_sparse())
            .map(|r| r.length)
            .sum()
    }

    /// Physical runs, in VCN order.
    pub fn stored_runs(&self) -> impl Iterator<Item = ClusterRun> + '_ {
        self.runs.iter().filter_map(CookedRun::cluster_run)
    }

    /// LCN one past the end of the last stored run before `idx`.
    #[must_use]
    pub fn lcn_after_stored_before(&self, idx: usize) -> Option<u64> {
        self.runs[..idx.min(self.runs.len())]
            .iter()
            .rev()
            .find_map(|r| r.lcn.map(|lcn| lcn + r.length))
    }

    /// Physical cluster behind `vcn`, `None` when sparse.
    pub fn lcn_of(&self, vcn: u64) -> Result<Option<u64>> {
        let run = &self.runs[self.find_run(vcn)?];
        Ok(run.lcn.map(|lcn| lcn + (vcn - run.start_vcn)))
    }

    /// Index of the run covering `vcn`.
    ///
    /// A VCN past the mapped range is a caller defect.
    pub fn find_run(&self, vcn: u64) -> Result<usize> {
        if vcn >= self.next_vcn() {
            return Err(FntError::Invariant(format!(
                "vcn {vcn} beyond mapped range {}",
                self.next_vcn()
            )));
        }
        Ok(self.runs.partition_point(|r| r.end_vcn() <= vcn))
    }

    /// Cut run `idx` in two at `vcn`.
    pub fn split_run(&mut self, idx: usize, vcn: u64) -> Result<()> {
        let run = *self
            .runs
            .get(idx)
            .ok_or_else(|| FntError::Invariant(format!("split of missing run {idx}")))?;
        if vcn <= run.start_vcn || vcn >= run.end_vcn() {
            return Err(FntError::Invariant(format!(
                "split at vcn {vcn} outside run {}..{}",
                run.start_vcn,
                run.end_vcn()
            )));
        }
        let head_len = vcn - run.start_vcn;
        let tail = CookedRun {
            start_vcn: vcn,
            length: run.length - head_len,
            lcn: run.lcn.map(|lcn| lcn + head_len),
            delta: 0,
            segment: run.segment,
        };
        self.runs[idx].length = head_len;
        self.runs.insert(idx + 1, tail);
        self.note_insert(idx + 1, 1);
        self.relink(idx + 1, idx + 2);
        self.mark_dirty(idx, idx + 1);
        trace!(idx, vcn, sparse = run.is_sparse(), "extent_split_run");
        Ok(())
    }

    /// Turn stored run `idx` sparse. The clusters are not freed here.
    pub fn make_sparse(&mut self, idx: usize) -> Result<()> {
        let run = self
            .runs
            .get_mut(idx)
            .ok_or_else(|| FntError::Invariant(format!("make_sparse of missing run {idx}")))?;
        run.lcn = None;
        run.delta = 0;
        self.relink(idx, idx + 1);
        self.mark_dirty(idx, idx);
        Ok(())
    }

    /// Replace sparse run `idx` with stored runs covering exactly its length.
    pub fn make_non_sparse(&mut self, idx: usize, physical: &[ClusterRun]) -> Result<()> {
        let run = *self
            .runs
            .get(idx)
            .ok_or_else(|| FntError::Invariant(format!("make_non_sparse of missing run {idx}")))?;
        if !run.is_sparse() {
            return Err(FntError::Invariant(format!(
                "run {idx} at vcn {} is already stored",
                run.start_vcn
            )));
        }
        let total: u64 = physical.iter().map(|r| r.count).sum();
        if total != run.length || physical.iter().any(|r| r.count == 0) {
            return Err(FntError::Invariant(format!(
                "{total} clusters supplied for sparse run of {}",
                run.length
            )));
        }
        let mut vcn = run.start_vcn;
        let replacement: Vec<CookedRun> = physical
            .iter()
            .map(|p| {
                let cooked = CookedRun {
                    start_vcn: vcn,
                    length: p.count,
                    lcn: Some(p.start.0),
                    delta: 0,
                    segment: run.segment,
                };
                vcn += p.count;
                cooked
            })
            .collect();
        let added = replacement.len();
        self.runs.splice(idx..=idx, replacement);
        self.note_insert(idx + 1, added - 1);
        self.relink(idx, idx + added);
        self.mark_dirty(idx, idx + added - 1);
        trace!(idx, vcn = run.start_vcn, pieces = added, "extent_fill_sparse");
        Ok(())
    }

    /// Merge adjacent runs inside the dirty window: sparse with sparse, and
    /// stored with stored when physically contiguous. The VCN mapping never
    /// changes.
    pub fn collapse_runs(&mut self) {
        let Some((lo, hi)) = self.dirty.take() else {
            return;
        };
        if self.runs.len() < 2 {
            return;
        }
        let mut i = lo.saturating_sub(1);
        let mut hi = (hi + 1).min(self.runs.len() - 1);
        let mut merged = 0_usize;
        while i < hi {
            let (a, b) = (self.runs[i], self.runs[i + 1]);
            let contiguous = a.segment == b.segment
                && match (a.lcn, b.lcn) {
                    (None, None) => true,
                    (Some(x), Some(y)) => x + a.length == y,
                    _ => false,
                };
            if contiguous {
                self.runs.remove(i + 1);
                self.runs[i].length += b.length;
                self.relink(i, i + 1);
                hi -= 1;
                merged += 1;
            } else {
                i += 1;
            }
        }
        if merged > 0 {
            trace!(merged, runs = self.runs.len(), "extent_collapse");
        }
    }

    /// Drop run `idx` and everything after it.
    pub fn truncate_at(&mut self, idx: usize) {
        self.runs.truncate(idx);
        let keep = self.runs.last().map_or(1, |r| r.segment + 1);
        self.segment_starts.truncate(keep);
        if let Some((lo, hi)) = self.dirty {
            let len = self.runs.len();
            self.dirty = if lo >= len {
                None
            } else {
                Some((lo, hi.min(len - 1)))
            };
        }
    }

    /// Map `count` more clusters as one sparse run at the end.
    pub fn append_sparse(&mut self, count: u64) {
        if count == 0 {
            return;
        }
        let segment = self.segment_starts.len() - 1;
        let start_vcn = self.next_vcn();
        self.runs.push(CookedRun {
            start_vcn,
            length: count,
            lcn: None,
            delta: 0,
            segment,
        });
        let idx = self.runs.len() - 1;
        self.mark_dirty(idx, idx);
    }

    /// Verify coverage, segment boundaries and encoded deltas.
    pub fn check_invariants(&self) -> Result<()> {
        let mut vcn = 0_u64;
        let mut segment = 0_usize;
        let mut prev_lcn = 0_u64;
        for (i, run) in self.runs.iter().enumerate() {
            if run.length == 0 {
                return Err(FntError::Invariant(format!("run {i} is empty")));
            }
            if run.start_vcn != vcn {
                return Err(FntError::Invariant(format!(
                    "run {i} starts at vcn {} but previous run ends at {vcn}",
                    run.start_vcn
                )));
            }
            if run.segment != segment {
                if run.segment < segment || run.segment >= self.segment_starts.len() {
                    return Err(FntError::Invariant(format!(
                        "run {i} has out-of-order segment {}",
                        run.segment
                    )));
                }
                segment = run.segment;
                prev_lcn = 0;
            }
            let opens_segment = i == 0 || self.runs[i - 1].segment != run.segment;
            if opens_segment && self.segment_starts[run.segment] != run.start_vcn {
                return Err(FntError::Invariant(format!(
                    "segment {} starts at {} but its first run is at {}",
                    run.segment, self.segment_starts[run.segment], run.start_vcn
                )));
            }
            if let Some(lcn) = run.lcn {
                if run.delta != lcn_delta(lcn, prev_lcn) {
                    return Err(FntError::Invariant(format!(
                        "run {i} delta {} does not match lcn {lcn} after {prev_lcn}",
                        run.delta
                    )));
                }
                prev_lcn = lcn;
            }
            vcn = run.end_vcn();
        }
        Ok(())
    }

    // ── Internal bookkeeping ───────────────────────────────────────────────

    /// Recompute encoded deltas for every stored run in `[start, end)` and
    /// for the first stored run after `end` in the same segment.
    fn relink(&mut self, start: usize, end: usize) {
        let Some(first) = self.runs.get(start) else {
            return;
        };
        let mut segment = first.segment;
        let mut prev = self.runs[..start]
            .iter()
            .rev()
            .take_while(|r| r.segment == segment)
            .find_map(|r| r.lcn)
            .unwrap_or(0);
        for i in start..self.runs.len() {
            let run = &mut self.runs[i];
            if run.segment != segment {
                if i >= end {
                    break;
                }
                segment = run.segment;
                prev = 0;
            }
            if let Some(lcn) = run.lcn {
                run.delta = lcn_delta(lcn, prev);
                prev = lcn;
                if i >= end {
                    break;
                }
            }
        }
    }

    fn mark_dirty(&mut self, lo: usize, hi: usize) {
        self.dirty = Some(match self.dirty {
            Some((a, b)) => (a.min(lo), b.max(hi)),
            None => (lo, hi),
        });
    }

    fn note_insert(&mut self, at: usize, count: usize) {
        if let Some((lo, hi)) = &mut self.dirty {
            if *lo >= at {
                *lo += count;
            }
            if *hi >= at {
                *hi += count;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn list(raw: Vec<RawRun>) -> ExtentList {
        ExtentList::from_segments(&[(0, raw)]).expect("list")
    }

    #[test]
    fn cooks_absolute_lcns() {
        let l = list(vec![
            RawRun::stored(4, 100),
            RawRun::sparse(2),
            RawRun::stored(3, -50),
        ]);
        let lcns: Vec<_> = l.runs().iter().map(|r| r.lcn).collect();
        assert_eq!(lcns, vec![Some(100), None, Some(50)]);
        assert_eq!(l.next_vcn(), 9);
        assert_eq!(l.find_run(5).unwrap(), 1);
        assert_eq!(l.lcn_of(7).unwrap(), Some(51));
        assert!(matches!(l.find_run(9), Err(FntError::Invariant(_))));
        l.check_invariants().expect("valid");
    }

    #[test]
    fn split_patches_next_stored_delta() {
        let mut l = list(vec![RawRun::stored(10, 100), RawRun::stored(5, 20)]);
        l.split_run(0, 4).expect("split");
        let runs = l.runs();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[1].lcn, Some(104));
        assert_eq!(runs[1].delta, 4);
        assert_eq!(runs[2].delta, 120 - 104);
        l.check_invariants().expect("valid");
        assert!(l.split_run(0, 0).is_err());
        assert!(l.split_run(0, 4).is_err());
    }

    #[test]
    fn make_sparse_relinks_following_run() {
        let mut l = list(vec![
            RawRun::stored(2, 10),
            RawRun::stored(2, 10),
            RawRun::stored(2, 10),
        ]);
        l.make_sparse(1).expect("sparse");
        assert_eq!(l.runs()[2].lcn, Some(30));
        assert_eq!(l.runs()[2].delta, 20);
        l.check_invariants().expect("valid");
    }

    #[test]
    fn make_non_sparse_replaces_one_run_with_many() {
        let mut l = list(vec![RawRun::stored(2, 50), RawRun::sparse(6), RawRun::stored(1, 10)]);
        l.make_non_sparse(1, &[ClusterRun::new(200, 4), ClusterRun::new(7, 2)])
            .expect("fill");
        let runs = l.runs();
        assert_eq!(runs.len(), 4);
        assert_eq!((runs[1].start_vcn, runs[1].lcn, runs[1].delta), (2, Some(200), 150));
        assert_eq!((runs[2].start_vcn, runs[2].lcn, runs[2].delta), (6, Some(7), -193));
        assert_eq!(runs[3].delta, 60 - 7);
        l.check_invariants().expect("valid");

        assert!(l.make_non_sparse(0, &[ClusterRun::new(1, 2)]).is_err());
    }

    #[test]
    fn collapse_merges_contiguous_neighbours_only() {
        let mut l = list(vec![RawRun::stored(8, 40)]);
        l.split_run(0, 2).expect("split");
        l.split_run(1, 5).expect("split");
        l.make_sparse(1).expect("sparse");
        l.collapse_runs();
        assert_eq!(l.run_count(), 3);

        l.make_non_sparse(1, &[ClusterRun::new(42, 3)]).expect("refill");
        l.collapse_runs();
        assert_eq!(l.run_count(), 1);
        assert_eq!(l.runs()[0].length, 8);
        assert_eq!(l.runs()[0].lcn, Some(40));
        l.check_invariants().expect("valid");
    }

    #[test]
    fn append_and_truncate() {
        let mut l = ExtentList::new();
        l.append_sparse(4);
        l.append_sparse(4);
        l.collapse_runs();
        assert_eq!(l.run_count(), 1);
        assert_eq!(l.next_vcn(), 8);
        l.split_run(0, 3).expect("split");
        l.truncate_at(1);
        assert_eq!(l.next_vcn(), 3);
        l.truncate_at(0);
        assert_eq!(l.next_vcn(), 0);
        assert_eq!(l.segment_count(), 1);
        l.check_invariants().expect("valid");
    }

    #[test]
    fn multi_segment_round_trip() {
        let first = encode_runs(&[RawRun::stored(4, 100), RawRun::sparse(4)]);
        let second = encode_runs(&[RawRun::stored(2, 300), RawRun::stored(2, -100)]);
        let l = ExtentList::from_encoded(&[(0, &first), (8, &second)]).expect("load");
        assert_eq!(l.segment_count(), 2);
        assert_eq!(l.lcn_of(8).unwrap(), Some(300));
        assert_eq!(l.lcn_of(11).unwrap(), Some(201));
        l.check_invariants().expect("valid");

        let encoded = l.encode_segments();
        assert_eq!(encoded, vec![(0, first), (8, second)]);
    }

    #[test]
    fn segments_must_abut() {
        let err = ExtentList::from_segments(&[
            (0, vec![RawRun::stored(4, 1)]),
            (5, vec![RawRun::stored(1, 9)]),
        ])
        .unwrap_err();
        assert!(err.is_corruption());
        assert!(
            ExtentList::from_segments(&[(0, vec![RawRun::stored(1, -5)])])
                .unwrap_err()
                .is_corruption()
        );
    }

    #[test]
    fn segment_boundary_is_not_merged() {
        let mut l = ExtentList::from_segments(&[
            (0, vec![RawRun::stored(4, 10)]),
            (4, vec![RawRun::stored(4, 14)]),
        ])
        .expect("load");
        l.mark_dirty(0, 1);
        l.collapse_runs();
        assert_eq!(l.run_count(), 2);
        assert_eq!(l.runs()[1].delta, 14);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn random_mutations_keep_coverage_and_deltas(
            ops in proptest::collection::vec((0_u8..4, 0_u64..64, 1_u64..8), 1..60),
        ) {
            let mut l = ExtentList::new();
            l.append_sparse(64);
            let mut next_lcn = 1000_u64;
            for (op, vcn, len) in ops {
                let idx = l.find_run(vcn).unwrap();
                let run = l.runs()[idx];
                match op {
                    0 if vcn > run.start_vcn => l.split_run(idx, vcn).unwrap(),
                    1 if run.is_sparse() => {
                        let half = run.length / 2;
                        let pieces = if half == 0 {
                            vec![ClusterRun::new(next_lcn, run.length)]
                        } else {
                            vec![
                                ClusterRun::new(next_lcn + len, half),
                                ClusterRun::new(next_lcn, run.length - half),
                            ]
                        };
                        next_lcn += run.length + len + 1;
                        l.make_non_sparse(idx, &pieces).unwrap();
                    }
                    2 if !run.is_sparse() => l.make_sparse(idx).unwrap(),
                    _ => l.collapse_runs(),
                }
                l.check_invariants().unwrap();
                prop_assert_eq!(l.next_vcn(), 64);
            }
            let round = ExtentList::from_segments(&l.raw_segments()).unwrap();
            prop_assert_eq!(
                round.runs().iter().map(|r| (r.start_vcn, r.lcn)).collect::<Vec<_>>(),
                l.runs().iter().map(|r| (r.start_vcn, r.lcn)).collect::<Vec<_>>()
            );
        }
    }
}
