use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::coordinate::{Address, Coordinate};
use crate::entanglement::{EntanglementDetector, ScoreComponents};

#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Undirected edge, stored with `source < target`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntanglementEdge {
    pub source: Address,
    pub target: Address,
    pub score: f64,
    pub components: ScoreComponents,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SweepOptions {
    pub shard_size: usize,
    pub workers: usize,
    /// Upper bound on pairs scored; whole shard pairs that would exceed it are skipped.
    pub max_pairs: Option<u64>,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            shard_size: 256,
            workers: 4,
            max_pairs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepReport {
    pub threshold: f64,
    pub edges: Vec<EntanglementEdge>,
    pub pairs_scored: u64,
    pub shard_pairs_total: usize,
    pub shard_pairs_completed: usize,
    pub cancelled: bool,
    pub budget_exhausted: bool,
}

impl SweepReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.shard_pairs_completed == self.shard_pairs_total
    }
}

struct SweepContext<'a> {
    entries: &'a [(Address, Coordinate)],
    detector: &'a EntanglementDetector,
    threshold: f64,
    shard_size: usize,
    shard_pairs: &'a [(usize, usize)],
    max_pairs: Option<u64>,
    cancel: &'a CancellationToken,
    cursor: AtomicUsize,
    reserved_pairs: AtomicU64,
    pairs_scored: AtomicU64,
    completed: AtomicUsize,
    budget_exhausted: AtomicBool,
    merged: Mutex<Vec<EntanglementEdge>>,
}

impl SweepContext<'_> {
    fn shard_range(&self, shard: usize) -> Range<usize> {
        let start = shard * self.shard_size;
        start..(start + self.shard_size).min(self.entries.len())
    }

    fn pair_count(&self, left: usize, right: usize) -> u64 {
        let left_len = u64::try_from(self.shard_range(left).len()).unwrap_or(u64::MAX);
        if left == right {
            left_len * left_len.saturating_sub(1) / 2
        } else {
            let right_len = u64::try_from(self.shard_range(right).len()).unwrap_or(u64::MAX);
            left_len.saturating_mul(right_len)
        }
    }

    fn reserve(&self, pairs: u64) -> bool {
        let Some(max_pairs) = self.max_pairs else {
            return true;
        };
        self.reserved_pairs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(pairs).filter(|total| *total <= max_pairs)
            })
            .is_ok()
    }

    fn edge(&self, left: usize, right: usize) -> Option<EntanglementEdge> {
        let (left_address, left_coordinate) = &self.entries[left];
        let (right_address, right_coordinate) = &self.entries[right];
        let breakdown = self.detector.breakdown(left_coordinate, right_coordinate);
        if breakdown.score < self.threshold {
            return None;
        }
        let (source, target) = if left_address <= right_address {
            (left_address.clone(), right_address.clone())
        } else {
            (right_address.clone(), left_address.clone())
        };
        Some(EntanglementEdge {
            source,
            target,
            score: breakdown.score,
            components: breakdown.components,
        })
    }

    /// Scores one shard pair. Returns `None` when cancelled part-way; a partial
    /// shard pair is never merged.
    fn score_shard_pair(&self, left: usize, right: usize) -> Option<Vec<EntanglementEdge>> {
        let mut edges = Vec::new();
        let right_range = self.shard_range(right);
        for i in self.shard_range(left) {
            if self.cancel.is_cancelled() {
                return None;
            }
            let start = if left == right { i + 1 } else { right_range.start };
            for j in start..right_range.end {
                if let Some(edge) = self.edge(i, j) {
                    edges.push(edge);
                }
            }
        }
        Some(edges)
    }

    fn run_worker(&self) {
        loop {
            if self.cancel.is_cancelled() || self.budget_exhausted.load(Ordering::SeqCst) {
                return;
            }
            let index = self.cursor.fetch_add(1, Ordering::SeqCst);
            let Some(&(left, right)) = self.shard_pairs.get(index) else {
                return;
            };
            let pairs = self.pair_count(left, right);
            if !self.reserve(pairs) {
                self.budget_exhausted.store(true, Ordering::SeqCst);
                return;
            }
            let Some(edges) = self.score_shard_pair(left, right) else {
                return;
            };
            self.merged
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(edges);
            self.pairs_scored.fetch_add(pairs, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Scores every unordered pair of `entries` across a pool of scoped worker
/// threads. Entries are split into shards of `shard_size`; each worker claims
/// whole shard pairs and merges their edges only once the shard pair is done.
/// The result is deterministic for a given input regardless of worker count.
#[must_use]
pub fn sweep(
    entries: &[(Address, Coordinate)],
    detector: &EntanglementDetector,
    threshold: f64,
    options: SweepOptions,
    cancel: &CancellationToken,
) -> SweepReport {
    let shard_size = options.shard_size.max(1);
    let shard_count = entries.len().div_ceil(shard_size);
    let shard_pairs = (0..shard_count)
        .flat_map(|left| (left..shard_count).map(move |right| (left, right)))
        .collect::<Vec<_>>();

    let context = SweepContext {
        entries,
        detector,
        threshold,
        shard_size,
        shard_pairs: &shard_pairs,
        max_pairs: options.max_pairs,
        cancel,
        cursor: AtomicUsize::new(0),
        reserved_pairs: AtomicU64::new(0),
        pairs_scored: AtomicU64::new(0),
        completed: AtomicUsize::new(0),
        budget_exhausted: AtomicBool::new(false),
        merged: Mutex::new(Vec::new()),
    };

    let workers = options.workers.clamp(1, shard_pairs.len().max(1));
    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| context.run_worker());
        }
    });

    let mut edges = context
        .merged
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner);
    edges.sort_by(|a, b| a.source.cmp(&b.source).then_with(|| a.target.cmp(&b.target)));

    SweepReport {
        threshold,
        edges,
        pairs_scored: context.pairs_scored.into_inner(),
        shard_pairs_total: shard_pairs.len(),
        shard_pairs_completed: context.completed.into_inner(),
        cancelled: cancel.is_cancelled(),
        budget_exhausted: context.budget_exhausted.into_inner(),
    }
}
