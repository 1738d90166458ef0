//! Per-stage progress counters
//!
//! Shared by the concurrent per-document tasks of one stage run; turned into
//! a persisted [`StageSummary`] when the stage ends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::db::stage_stats::StageSummary;

/// Minimum spacing between progress events
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct StageCounters {
    total: usize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    consecutive_failures: AtomicUsize,
    last_error: Mutex<Option<String>>,
    last_report: Mutex<Option<Instant>>,
}

impl StageCounters {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            consecutive_failures: AtomicUsize::new(0),
            last_error: Mutex::new(None),
            last_report: Mutex::new(None),
        }
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Returns the length of the current failure streak
    pub fn record_failure(&self, error: &str) -> usize {
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error.to_string());
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Work already done by an earlier run
    pub fn record_skipped(&self, count: usize) {
        self.skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> usize {
        self.succeeded() + self.failed() + self.skipped()
    }

    /// Every attempted document failed
    pub fn all_failed(&self) -> bool {
        let failed = self.failed();
        failed > 0 && self.succeeded() == 0
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// True at most once per interval, and always for the final document
    pub fn should_report(&self) -> bool {
        if self.processed() >= self.total {
            return true;
        }
        let mut last = self.last_report.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) if at.elapsed() < PROGRESS_INTERVAL => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    pub fn display_string(&self, verb: &str) -> String {
        format!(
            "{} of {} documents {}, {} failed, {} already done",
            self.succeeded(),
            self.total,
            verb,
            self.failed(),
            self.skipped()
        )
    }

    pub fn summary(&self, details: serde_json::Value) -> StageSummary {
        let failed = self.failed() as i64;
        StageSummary {
            documents_in: self.total as i64,
            documents_out: (self.succeeded() + self.skipped()) as i64,
            failed_documents: failed,
            skipped_documents: self.skipped() as i64,
            error_count: failed,
            last_error: self.last_error(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_streak_resets_on_success() {
        let counters = StageCounters::new(5);
        assert_eq!(counters.record_failure("timeout"), 1);
        assert_eq!(counters.record_failure("timeout"), 2);
        counters.record_success();
        assert_eq!(counters.record_failure("bad response"), 1);

        assert_eq!(counters.failed(), 3);
        assert_eq!(counters.last_error().as_deref(), Some("bad response"));
        assert!(!counters.all_failed());
    }

    #[test]
    fn test_all_failed_needs_an_attempt() {
        let counters = StageCounters::new(0);
        assert!(!counters.all_failed());
        counters.record_failure("x");
        assert!(counters.all_failed());
    }

    #[test]
    fn test_summary_counts_skipped_as_output() {
        let counters = StageCounters::new(4);
        counters.record_skipped(2);
        counters.record_success();
        counters.record_failure("boom");

        let summary = counters.summary(serde_json::json!({"groups": 1}));
        assert_eq!(summary.documents_in, 4);
        assert_eq!(summary.documents_out, 3);
        assert_eq!(summary.failed_documents, 1);
        assert_eq!(summary.skipped_documents, 2);
        assert_eq!(summary.details["groups"], 1);
        assert_eq!(
            counters.display_string("triaged"),
            "1 of 4 documents triaged, 1 failed, 2 already done"
        );
    }

    #[test]
    fn test_final_document_always_reports() {
        let counters = StageCounters::new(1);
        assert!(counters.should_report());
        counters.record_success();
        assert!(counters.should_report());
        assert!(counters.should_report());
    }
}
