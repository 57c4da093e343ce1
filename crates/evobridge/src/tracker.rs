//! Pending-request table with per-request timeouts.
//!
//! The table is the single authority on a request's fate: whichever path
//! removes an id first (matching response, timer, cancellation, crash)
//! owns settling it, and every later attempt is a no-op. Removal from the
//! concurrent map is the atomic point that decides the race, so the read
//! loop and timer tasks never both claim the same id.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::bridge::protocol::RequestId;
use crate::error::BridgeError;
use crate::metrics::MetricsCollector;

/// How a pending request ended.
pub type SettleOutcome = Result<Value, BridgeError>;

struct PendingRequest {
    tx: oneshot::Sender<SettleOutcome>,
    submitted_at: Instant,
    timer: Option<AbortHandle>,
}

/// Table of outstanding requests, keyed by correlation id.
///
/// Completions feed the shared [`MetricsCollector`]: success results record
/// a latency sample, timeouts bump the timeout counter, everything else
/// bumps the error counter.
pub struct RequestTracker {
    pending: DashMap<RequestId, PendingRequest>,
    metrics: Arc<MetricsCollector>,
}

impl RequestTracker {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self {
            pending: DashMap::new(),
            metrics,
        }
    }

    /// Register an id and arm its timeout.
    ///
    /// Colliding ids are rejected rather than silently overwritten; the
    /// tracker, not the id generator, is the collision authority.
    pub fn register(
        self: &Arc<Self>,
        id: RequestId,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<SettleOutcome>, BridgeError> {
        let (tx, rx) = oneshot::channel();

        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => return Err(BridgeError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    tx,
                    submitted_at: Instant::now(),
                    timer: None,
                });
            }
        }

        let tracker = Arc::clone(self);
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracker.expire(&timer_id, timeout);
        });

        // The response may already have settled the entry while the timer
        // was being spawned; in that case the orphaned timer fires against
        // an absent id and does nothing.
        if let Some(mut entry) = self.pending.get_mut(&id) {
            entry.timer = Some(timer.abort_handle());
        }

        Ok(rx)
    }

    /// Settle an id with the given outcome.
    ///
    /// Returns false when the id is unknown or already settled; callers
    /// treat that as a no-op, since a timeout may have won the race.
    pub fn settle(&self, id: &RequestId, outcome: SettleOutcome) -> bool {
        let Some((_, entry)) = self.pending.remove(id) else {
            return false;
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }

        match &outcome {
            Ok(_) => self.metrics.record_completion(entry.submitted_at.elapsed()),
            Err(BridgeError::Timeout(_)) => self.metrics.record_timeout(),
            Err(_) => self.metrics.record_error(),
        }

        // The caller may have dropped the receiver; the settlement still
        // counted above.
        let _ = entry.tx.send(outcome);
        true
    }

    /// Timer path: settle with a timeout error.
    pub fn expire(&self, id: &RequestId, after: Duration) -> bool {
        let expired = self.settle(id, Err(BridgeError::Timeout(after)));
        if expired {
            tracing::debug!(%id, ?after, "request timed out");
        }
        expired
    }

    /// Settle every outstanding request with a clone of `error`.
    ///
    /// Used when the worker crashes or the bridge stops; returns how many
    /// requests were rejected.
    pub fn fail_all(&self, error: &BridgeError) -> usize {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut rejected = 0;
        for id in ids {
            if self.settle(&id, Err(error.clone())) {
                rejected += 1;
            }
        }
        rejected
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker() -> Arc<RequestTracker> {
        Arc::new(RequestTracker::new(Arc::new(MetricsCollector::new())))
    }

    #[tokio::test]
    async fn settle_resolves_the_receiver() {
        let tracker = tracker();
        let rx = tracker
            .register(RequestId::from("a"), Duration::from_secs(5))
            .unwrap();

        assert!(tracker.settle(&RequestId::from("a"), Ok(json!({"ok": true}))));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn settle_twice_is_a_no_op() {
        let tracker = tracker();
        let _rx = tracker
            .register(RequestId::from("a"), Duration::from_secs(5))
            .unwrap();

        assert!(tracker.settle(&RequestId::from("a"), Ok(Value::Null)));
        assert!(!tracker.settle(&RequestId::from("a"), Ok(Value::Null)));
    }

    #[tokio::test]
    async fn unknown_id_is_a_no_op() {
        let tracker = tracker();
        assert!(!tracker.settle(&RequestId::from("ghost"), Ok(Value::Null)));
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let tracker = tracker();
        let _rx = tracker
            .register(RequestId::from("dup"), Duration::from_secs(5))
            .unwrap();

        assert!(matches!(
            tracker.register(RequestId::from("dup"), Duration::from_secs(5)),
            Err(BridgeError::DuplicateId(_))
        ));

        // Settling frees the id for reuse.
        tracker.settle(&RequestId::from("dup"), Ok(Value::Null));
        assert!(
            tracker
                .register(RequestId::from("dup"), Duration::from_secs(5))
                .is_ok()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_expires_the_request() {
        let metrics = Arc::new(MetricsCollector::new());
        let tracker = Arc::new(RequestTracker::new(Arc::clone(&metrics)));
        let rx = tracker
            .register(RequestId::from("t"), Duration::from_millis(100))
            .unwrap();

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(BridgeError::Timeout(_))));
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(metrics.snapshot().timeout_count, 1);

        // A late response for the expired id must not re-settle it.
        assert!(!tracker.settle(&RequestId::from("t"), Ok(Value::Null)));
        assert_eq!(metrics.snapshot().request_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_request_does_not_time_out() {
        let metrics = Arc::new(MetricsCollector::new());
        let tracker = Arc::new(RequestTracker::new(Arc::clone(&metrics)));
        let rx = tracker
            .register(RequestId::from("s"), Duration::from_millis(50))
            .unwrap();
        tracker.settle(&RequestId::from("s"), Ok(Value::Null));
        assert_eq!(rx.await.unwrap().unwrap(), Value::Null);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(metrics.snapshot().timeout_count, 0);
    }

    #[tokio::test]
    async fn fail_all_rejects_every_pending_request() {
        let tracker = tracker();
        let receivers: Vec<_> = (0..3)
            .map(|n| {
                tracker
                    .register(RequestId::from(n as i64), Duration::from_secs(5))
                    .unwrap()
            })
            .collect();

        let rejected = tracker.fail_all(&BridgeError::ProcessCrash {
            detail: "exit code 1".to_string(),
        });
        assert_eq!(rejected, 3);
        assert_eq!(tracker.pending_count(), 0);

        for rx in receivers {
            assert!(matches!(
                rx.await.unwrap(),
                Err(BridgeError::ProcessCrash { .. })
            ));
        }
    }

    #[tokio::test]
    async fn metrics_categorize_outcomes() {
        let metrics = Arc::new(MetricsCollector::new());
        let tracker = Arc::new(RequestTracker::new(Arc::clone(&metrics)));

        let _a = tracker
            .register(RequestId::from("ok"), Duration::from_secs(5))
            .unwrap();
        let _b = tracker
            .register(RequestId::from("err"), Duration::from_secs(5))
            .unwrap();

        tracker.settle(&RequestId::from("ok"), Ok(Value::Null));
        tracker.settle(
            &RequestId::from("err"),
            Err(BridgeError::Remote {
                code: -32603,
                message: "boom".to_string(),
                data: None,
            }),
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.request_count, 1);
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(snapshot.timeout_count, 0);
    }
}
