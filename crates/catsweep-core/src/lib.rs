//! Core domain model for catsweep: catalog ids, fetch outcomes, run counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "catsweep-core";

/// A fetched or staged catalog record: string keys, arbitrary JSON values.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Numeric key addressing one record in the remote catalog.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CatalogId(pub u64);

impl fmt::Display for CatalogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for CatalogId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Half-open id interval `[start, end)` enumerated by a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub start: u64,
    pub end: u64,
}

impl IdRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn ids(&self) -> impl Iterator<Item = CatalogId> {
        (self.start..self.end).map(CatalogId)
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Result of one fetch against the remote catalog. Exactly one variant holds.
///
/// `NotFound` is a remote-confirmed absence and is never retried within a
/// run; `Transient` is a swallowed network-level failure whose retry policy
/// belongs to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Found(Record),
    NotFound { message: String },
    Transient { cause: String },
}

impl FetchOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, FetchOutcome::Found(_))
    }
}

/// Process-lifetime counters for one fetch run, updated concurrently by
/// fetch units. Owned by the scheduler and snapshot into a
/// [`FetchRunReport`]; never a module-level singleton.
#[derive(Debug, Default)]
pub struct RunStats {
    processed: AtomicU64,
    staged: AtomicU64,
    absent: AtomicU64,
    transient_failures: AtomicU64,
    io_failures: AtomicU64,
}

impl RunStats {
    pub fn record_staged(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.staged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_absent(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.absent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transient_failure(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.transient_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_io_failure(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.io_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn staged(&self) -> u64 {
        self.staged.load(Ordering::Relaxed)
    }

    pub fn report(
        &self,
        run_id: Uuid,
        range: IdRange,
        waves: u64,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> FetchRunReport {
        FetchRunReport {
            run_id,
            started_at,
            finished_at,
            targets: range.len(),
            processed: self.processed.load(Ordering::Relaxed),
            staged: self.staged.load(Ordering::Relaxed),
            absent: self.absent.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            io_failures: self.io_failures.load(Ordering::Relaxed),
            waves,
        }
    }
}

/// Owned summary of one completed fetch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchRunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets: u64,
    pub processed: u64,
    pub staged: u64,
    pub absent: u64,
    pub transient_failures: u64,
    pub io_failures: u64,
    pub waves: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_range_is_half_open() {
        let range = IdRange::new(10, 13);
        let ids: Vec<_> = range.ids().collect();
        assert_eq!(ids, vec![CatalogId(10), CatalogId(11), CatalogId(12)]);
        assert_eq!(range.len(), 3);
        assert!(!range.is_empty());
        assert!(IdRange::new(5, 5).is_empty());
        assert_eq!(IdRange::new(7, 3).len(), 0);
    }

    #[test]
    fn stats_snapshot_counts_every_terminal_outcome() {
        let stats = RunStats::default();
        stats.record_staged();
        stats.record_staged();
        stats.record_absent();
        stats.record_transient_failure();
        stats.record_io_failure();

        let report = stats.report(
            Uuid::new_v4(),
            IdRange::new(0, 5),
            1,
            Utc::now(),
            Utc::now(),
        );
        assert_eq!(report.targets, 5);
        assert_eq!(report.processed, 5);
        assert_eq!(report.staged, 2);
        assert_eq!(report.absent, 1);
        assert_eq!(report.transient_failures, 1);
        assert_eq!(report.io_failures, 1);
    }
}
