//! Correlation cache
//!
//! Tracks, per request id, the cancellation handle of the in-flight
//! forwarding pipeline, plus the single process-wide liveness instant.
//! All operations are safe under concurrent callers and never hold a
//! lock across an await point.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct TrackedOperation {
    seq: u64,
    cancel: CancellationToken,
}

pub struct CorrelationCache {
    inflight: DashMap<String, TrackedOperation>,
    seq: AtomicU64,
    // Overwritten on every liveness signal, never cleared
    last_seen: Mutex<Instant>,
}

impl CorrelationCache {
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
            seq: AtomicU64::new(0),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Record that the peer is alive now. Pongs and inbound requests both
    /// land here; a peer issuing requests is evidently alive.
    pub fn mark_liveness(&self) {
        let mut last = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
    }

    pub fn last_liveness(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an in-flight pipeline. A second `track` for an id already
    /// present is a protocol violation by the peer; the stale handle is
    /// cancelled best-effort and replaced. Returns a generation so the
    /// pipeline can later remove only its own entry.
    pub fn track(&self, request_id: &str, cancel: CancellationToken) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        if let Some(stale) = self
            .inflight
            .insert(request_id.to_string(), TrackedOperation { seq, cancel })
        {
            warn!(request_id, "duplicate SERVER_REQUEST for tracked id, cancelling stale pipeline");
            stale.cancel.cancel();
        }
        seq
    }

    /// Server acknowledged the response stream: drop the entry and stop
    /// the pipeline if it is still running. Unknown ids are expected under
    /// races with natural completion and ignored.
    pub fn acknowledge(&self, request_id: &str) {
        if let Some((_, op)) = self.inflight.remove(request_id) {
            debug!(request_id, "acknowledged, cancelling pipeline");
            op.cancel.cancel();
        }
    }

    /// Natural completion: remove the entry without cancelling, and only
    /// if it still belongs to this pipeline (a replacement entry from a
    /// duplicate request must survive).
    pub fn complete(&self, request_id: &str, seq: u64) {
        self.inflight.remove_if(request_id, |_, op| op.seq == seq);
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

impl Default for CorrelationCache {
    fn default() -> Self {
        Self::new()
    }
}
