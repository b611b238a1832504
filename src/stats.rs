//! Endpoint statistics (spec §3, §4.D): the only per-endpoint mutable
//! state, guarded so it stays consistent under concurrent handler
//! invocations (spec §5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const LAST_ERROR_MAX_BYTES: usize = 1024;

/// Truncate `s` to at most `max_bytes` bytes, stepping back to the nearest
/// char boundary rather than panicking mid-codepoint.
fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Live counters for one endpoint. Reads (`snapshot`) never block a
/// concurrently-running handler for longer than a short critical section.
#[derive(Default)]
pub struct Stats {
    num_requests: AtomicU64,
    num_errors: AtomicU64,
    processing_time: AtomicU64,
    last_error: Mutex<String>,
    data: Mutex<HashMap<String, serde_json::Value>>,
}

/// A point-in-time, serializable view of [`Stats`] (spec §3).
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EndpointStats {
    /// Total number of completed handler invocations.
    pub num_requests: u64,
    /// Number of those invocations that counted as errors.
    pub num_errors: u64,
    /// Most recent error message, truncated to 1024 bytes, empty if none.
    pub last_error: String,
    /// Total wall-clock handler time, in nanoseconds.
    pub processing_time: u64,
    /// `processing_time / max(1, num_requests)`.
    pub average_processing_time: u64,
    /// Opaque per-endpoint user extension data.
    pub data: HashMap<String, serde_json::Value>,
}

impl Stats {
    /// Record one completed request: `elapsed` is the handler's measured
    /// wall-clock duration, `error` is set when the handler errored or
    /// called `respond_error` (spec §4.D's statistics update rule).
    pub fn record(&self, elapsed_ns: u64, error: Option<&str>) {
        self.num_requests.fetch_add(1, Ordering::SeqCst);
        self.processing_time.fetch_add(elapsed_ns, Ordering::SeqCst);
        if let Some(error) = error {
            self.num_errors.fetch_add(1, Ordering::SeqCst);
            *self.last_error.lock().unwrap() = truncate_utf8(error, LAST_ERROR_MAX_BYTES);
        }
    }

    /// Zero every counter, per `reset()` (spec §4.D, invariant 4).
    pub fn reset(&self) {
        self.num_requests.store(0, Ordering::SeqCst);
        self.num_errors.store(0, Ordering::SeqCst);
        self.processing_time.store(0, Ordering::SeqCst);
        self.last_error.lock().unwrap().clear();
    }

    /// Take a consistent, serializable snapshot.
    pub fn snapshot(&self) -> EndpointStats {
        let num_requests = self.num_requests.load(Ordering::SeqCst);
        let processing_time = self.processing_time.load(Ordering::SeqCst);
        EndpointStats {
            num_requests,
            num_errors: self.num_errors.load(Ordering::SeqCst),
            last_error: self.last_error.lock().unwrap().clone(),
            processing_time,
            average_processing_time: processing_time / num_requests.max(1),
            data: self.data.lock().unwrap().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stats_are_zero() {
        let stats = Stats::default();
        let snap = stats.snapshot();
        assert_eq!(snap.num_requests, 0);
        assert_eq!(snap.num_errors, 0);
        assert_eq!(snap.average_processing_time, 0);
        assert!(snap.last_error.is_empty());
    }

    #[test]
    fn average_is_derived_not_stored() {
        let stats = Stats::default();
        stats.record(100, None);
        stats.record(300, None);
        let snap = stats.snapshot();
        assert_eq!(snap.num_requests, 2);
        assert_eq!(snap.processing_time, 400);
        assert_eq!(snap.average_processing_time, 200);
    }

    #[test]
    fn errors_are_counted_and_last_error_kept() {
        let stats = Stats::default();
        stats.record(10, None);
        stats.record(20, Some("boom"));
        let snap = stats.snapshot();
        assert_eq!(snap.num_requests, 2);
        assert_eq!(snap.num_errors, 1);
        assert_eq!(snap.last_error, "boom");
        assert!(snap.num_errors <= snap.num_requests);
    }

    #[test]
    fn last_error_is_truncated() {
        let stats = Stats::default();
        stats.record(1, Some(&"x".repeat(2000)));
        assert_eq!(stats.snapshot().last_error.len(), LAST_ERROR_MAX_BYTES);
    }

    #[test]
    fn reset_zeroes_everything() {
        let stats = Stats::default();
        stats.record(10, Some("boom"));
        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.num_requests, 0);
        assert_eq!(snap.num_errors, 0);
        assert_eq!(snap.processing_time, 0);
        assert!(snap.last_error.is_empty());
    }
}
