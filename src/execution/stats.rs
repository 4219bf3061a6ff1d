use crate::prelude::*;

use std::sync::atomic::{AtomicI64, Ordering::Relaxed};

#[derive(Default, Serialize)]
pub struct Counter(pub AtomicI64);

impl Counter {
    pub fn inc(&self, by: i64) {
        self.0.fetch_add(by, Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Relaxed)
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Self(AtomicI64::new(self.get()))
    }
}

impl std::fmt::Display for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get())
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Live counters of a conversion run, shared between the engine and the
/// writer. `resources_evaluated` counts per-phase evaluations, so a fully
/// traversed resource contributes twice.
#[derive(Debug, Default, Serialize)]
pub struct ConversionStats {
    pub resources_evaluated: Counter,
    pub resources_skipped: Counter,
    pub nodes_written: Counter,
    pub relationships_written: Counter,
    pub batches_committed: Counter,
    pub batches_retried: Counter,
}

impl ConversionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            resources_evaluated: self.resources_evaluated.get(),
            resources_skipped: self.resources_skipped.get(),
            nodes_written: self.nodes_written.get(),
            relationships_written: self.relationships_written.get(),
            batches_committed: self.batches_committed.get(),
            batches_retried: self.batches_retried.get(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub resources_evaluated: i64,
    pub resources_skipped: i64,
    pub nodes_written: i64,
    pub relationships_written: i64,
    pub batches_committed: i64,
    pub batches_retried: i64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} resources evaluated ({} skipped), {} nodes and {} relationships written, {} batches committed ({} retries)",
            self.resources_evaluated,
            self.resources_skipped,
            self.nodes_written,
            self.relationships_written,
            self.batches_committed,
            self.batches_retried,
        )
    }
}
