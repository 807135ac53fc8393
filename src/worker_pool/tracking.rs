//! Phase tracking: a shared map from request id to [`RequestStatus`],
//! mutated by workers and read via snapshot copy by anything that wants a
//! progress view.

use std::time::Instant;

use tokio::sync::Mutex;

use crate::model::{PhaseMap, RequestPhase, RequestStatus};

/// The shared phase map. A thin wrapper so call sites read like verbs
/// (`set_phase`, `remove`) instead of locking a raw `Mutex` everywhere.
#[derive(Default)]
pub struct PhaseTracker {
    phases: Mutex<PhaseMap>,
}

impl PhaseTracker {
    /// Build an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request entering the pool for the first time.
    pub async fn admit(&self, request_id: &str, queued_at: Instant) {
        let mut phases = self.phases.lock().await;
        phases.insert(
            request_id.to_owned(),
            RequestStatus {
                request_id: request_id.to_owned(),
                phase: RequestPhase::Queued,
                queued_at: Some(queued_at),
                phase_entered_at: Some(Instant::now()),
                retry_count: 0,
                rate_limit_eta: None,
            },
        );
    }

    /// Move a request to a new phase, preserving its `queued_at` and
    /// `retry_count`.
    pub async fn set_phase(&self, request_id: &str, phase: RequestPhase) {
        let mut phases = self.phases.lock().await;
        if let Some(status) = phases.get_mut(request_id) {
            status.phase = phase;
            status.phase_entered_at = Some(Instant::now());
            if phase != RequestPhase::RateLimited {
                status.rate_limit_eta = None;
            }
        }
    }

    /// Move a request into `RateLimited` with an ETA.
    pub async fn set_rate_limited(&self, request_id: &str, eta_secs: f64) {
        let mut phases = self.phases.lock().await;
        if let Some(status) = phases.get_mut(request_id) {
            status.phase = RequestPhase::RateLimited;
            status.phase_entered_at = Some(Instant::now());
            status.rate_limit_eta = Some(eta_secs);
        }
    }

    /// Bump the retry counter for a request, resetting it to `Queued`.
    pub async fn requeue_with_retry(&self, request_id: &str, retry_count: u32) {
        let mut phases = self.phases.lock().await;
        if let Some(status) = phases.get_mut(request_id) {
            status.phase = RequestPhase::Queued;
            status.phase_entered_at = Some(Instant::now());
            status.retry_count = retry_count;
            status.rate_limit_eta = None;
        }
    }

    /// Remove a request once it reaches a terminal state.
    pub async fn remove(&self, request_id: &str) {
        self.phases.lock().await.remove(request_id);
    }

    /// A read-only copy of the current phase map, for progress snapshots.
    pub async fn snapshot(&self) -> PhaseMap {
        self.phases.lock().await.clone()
    }

    /// Ids still tracked (i.e. not yet terminal), for the watchdog.
    pub async fn outstanding_ids(&self) -> Vec<String> {
        self.phases.lock().await.keys().cloned().collect()
    }
}
