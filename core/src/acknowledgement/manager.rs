use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{AckSetId, AcknowledgementSet, CompletionCallback};
use crate::telemetry::{Metrics, NoopMetrics};

pub const SETS_CREATED: &str = "acknowledgement_sets_created";
pub const SETS_SUCCEEDED: &str = "acknowledgement_sets_succeeded";
pub const SETS_FAILED: &str = "acknowledgement_sets_failed";
pub const SETS_EXPIRED: &str = "acknowledgement_sets_expired";

/// Process-scoped registry of live acknowledgement sets.
///
/// The registry holds the only long-lived strong reference to each set until
/// it reaches a terminal state; records only carry weak handles.
pub struct AcknowledgementSetManager {
    sets: Mutex<HashMap<AckSetId, Arc<AcknowledgementSet>>>,
    next_id: AtomicU64,
    metrics: Arc<dyn Metrics>,
}

impl Default for AcknowledgementSetManager {
    fn default() -> Self {
        Self::new(Arc::new(NoopMetrics))
    }
}

impl AcknowledgementSetManager {
    pub fn new(metrics: Arc<dyn Metrics>) -> Self {
        Self {
            sets: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// Creates a sealed set expecting exactly `expected_count` acknowledgements
    /// within `timeout`. A set expecting zero completes immediately.
    pub fn create<F>(
        &self,
        expected_count: usize,
        timeout: Duration,
        on_complete: F,
    ) -> Arc<AcknowledgementSet>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let set = self.register(expected_count, true, timeout, Box::new(on_complete));
        if expected_count == 0 {
            set.seal();
        }
        set
    }

    /// Creates an open set. Records join it through [`AcknowledgementSet::add`]
    /// and it cannot complete until [`AcknowledgementSet::seal`] is called.
    pub fn create_open<F>(&self, timeout: Duration, on_complete: F) -> Arc<AcknowledgementSet>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.register(0, false, timeout, Box::new(on_complete))
    }

    fn register(
        &self,
        expected: usize,
        sealed: bool,
        timeout: Duration,
        on_complete: CompletionCallback,
    ) -> Arc<AcknowledgementSet> {
        let id = AckSetId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let metrics = self.metrics.clone();
        let callback: CompletionCallback = Box::new(move |success| {
            metrics.increment(if success { SETS_SUCCEEDED } else { SETS_FAILED });
            on_complete(success);
        });
        let set = Arc::new(AcknowledgementSet::new(
            id,
            expected,
            sealed,
            Instant::now() + timeout,
            callback,
        ));
        self.sets.lock().insert(id, set.clone());
        self.metrics.increment(SETS_CREATED);
        debug!(set = %id, expected, sealed, ?timeout, "created acknowledgement set");
        set
    }

    /// Number of sets still waiting for acknowledgements.
    pub fn pending(&self) -> usize {
        self.sets
            .lock()
            .values()
            .filter(|set| !set.status().is_terminal())
            .count()
    }

    /// Expires every set past its deadline and forgets finished sets. Returns
    /// the number of sets expired by this call.
    pub fn expire_overdue(&self) -> usize {
        let now = Instant::now();
        let candidates: Vec<_> = self.sets.lock().values().cloned().collect();

        // callbacks run without the registry lock held
        let expired = candidates
            .iter()
            .filter(|set| set.expire_if_due(now))
            .count();
        if expired > 0 {
            self.metrics.increment_by(SETS_EXPIRED, expired as u64);
            info!(expired, "expired overdue acknowledgement sets");
        }

        self.sets
            .lock()
            .retain(|_, set| !set.status().is_terminal());
        expired
    }

    /// Runs [`Self::expire_overdue`] every `period` until `ct` is cancelled.
    pub fn spawn_monitor(self: Arc<Self>, period: Duration, ct: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ct.cancelled() => break,
                    _ = ticker.tick() => {
                        self.expire_overdue();
                    }
                }
            }
            debug!("acknowledgement monitor stopped");
        })
    }

    /// Expires every pending set so no producer waits on a stage that is going
    /// away. Returns the number of sets expired.
    pub fn shutdown(&self) -> usize {
        let sets: Vec<_> = self.sets.lock().drain().map(|(_, set)| set).collect();
        let expired = sets.iter().filter(|set| set.expire()).count();
        if expired > 0 {
            self.metrics.increment_by(SETS_EXPIRED, expired as u64);
        }
        info!(expired, "acknowledgement manager shut down");
        expired
    }
}
