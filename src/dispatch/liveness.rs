//! Liveness monitor — periodic heartbeat scan that probes live workers and
//! reaps silent ones.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::dispatcher::Dispatcher;
use super::model::{RemovalCause, WorkerId};

/// What one scan did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Workers removed for exceeding the heartbeat timeout.
    pub reaped: Vec<WorkerId>,
    /// Idle/Busy workers that were sent a probe.
    pub probed: usize,
}

impl Dispatcher {
    /// Run one liveness scan now.
    pub async fn scan(&self) -> ScanReport {
        self.scan_at(Instant::now()).await
    }

    /// Run one liveness scan as of `now`.
    ///
    /// Workers whose last heartbeat is older than the configured timeout are
    /// removed (failing their task with `WorkerTimeout`); the remaining
    /// Idle/Busy workers get a non-blocking ping.
    pub async fn scan_at(&self, now: Instant) -> ScanReport {
        let timeout = self.config().heartbeat_timeout;
        let mut state = self.state.lock().await;
        if state.shutting_down {
            return ScanReport::default();
        }

        let mut report = ScanReport::default();
        for (worker_id, elapsed) in state.registry.stale(now, timeout) {
            warn!(worker_id = %worker_id, elapsed = ?elapsed, "Worker heartbeat timeout");
            let cause = RemovalCause::TimedOut {
                elapsed_ms: elapsed.as_millis() as u64,
            };
            if state.remove_worker(worker_id, cause) {
                report.reaped.push(worker_id);
            }
        }

        for worker in state.registry.iter().filter(|w| w.status.is_alive()) {
            if worker.connection.ping() {
                report.probed += 1;
            } else {
                debug!(worker_id = %worker.id, "Probe not sent, connection closing");
            }
        }

        if !report.reaped.is_empty() {
            info!(count = report.reaped.len(), "Reaped stale workers");
        }
        report
    }
}

/// Spawn a background task that scans every `heartbeat_interval` until the
/// dispatcher shuts down.
pub fn spawn_liveness_task(dispatcher: Arc<Dispatcher>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = dispatcher.config().heartbeat_interval;
        let start = Instant::now().checked_add(period).unwrap_or_else(Instant::now);
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let shutdown = dispatcher.shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Liveness monitor stopped");
                    break;
                }
                _ = interval.tick() => {
                    dispatcher.scan().await;
                }
            }
        }
    })
}
