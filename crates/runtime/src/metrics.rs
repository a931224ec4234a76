use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use confluence_core::OpKind;

/// Dispatch loop counters, shared between the dispatch thread and readers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchMetrics {
    /// Requests executed, successful or not, by kind.
    pub executed: HashMap<OpKind, u64>,
    /// Requests whose terminal status was not Ok, by kind.
    pub failed: HashMap<OpKind, u64>,
    /// Requests with no registered handler.
    pub unsupported: u64,
    /// Requests resolved with a shutdown status instead of executing.
    pub drained_on_shutdown: u64,
    /// Rolling average execution time by kind.
    pub avg_duration: HashMap<OpKind, Duration>,
    /// Last completion time by kind.
    pub last_completed: HashMap<OpKind, DateTime<Utc>>,
    /// Requests queued and not yet popped, filled in when a snapshot is taken.
    pub queue_depth: usize,
}

impl DispatchMetrics {
    /// Record one executed request.
    pub fn record_execution(&mut self, kind: OpKind, duration: Duration, ok: bool) {
        let count = {
            let executed = self.executed.entry(kind).or_default();
            *executed += 1;
            *executed
        };
        if !ok {
            *self.failed.entry(kind).or_default() += 1;
        }
        self.last_completed.insert(kind, Utc::now());

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let prev = self.avg_duration.get(&kind).copied().unwrap_or_default();
        let avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            Duration::from_nanos((prev_nanos + (cur_nanos - prev_nanos) / count as f64) as u64)
        };
        self.avg_duration.insert(kind, avg);
    }

    pub fn record_unsupported(&mut self) {
        self.unsupported += 1;
    }

    pub fn record_drained(&mut self, count: usize) {
        self.drained_on_shutdown += count as u64;
    }

    pub fn total_executed(&self) -> u64 {
        self.executed.values().sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.failed.values().sum()
    }
}
