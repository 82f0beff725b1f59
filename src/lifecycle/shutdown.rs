//! Shutdown coordination for the gate.
//!
//! Stopping the listener is not enough: requests already acknowledged with
//! a 202 are still in the queue, and drained requests run on detached tasks.
//! [`drain_gate`] holds the process open until they finish or the grace
//! period runs out.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::admission::{AdmissionController, GateStatus};

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
#[derive(Clone)]
pub struct Shutdown {
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Number of tasks still listening.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for every admitted and queued request to complete, up to `grace`.
///
/// Returns the status left behind. Non-zero counts are requests abandoned
/// at exit.
pub async fn drain_gate(gate: &AdmissionController, grace: Duration) -> GateStatus {
    let status = gate.status();
    if status.active == 0 && status.queued == 0 {
        return status;
    }

    tracing::info!(
        active = status.active,
        queued = status.queued,
        grace_secs = grace.as_secs_f64(),
        "Draining admission gate"
    );

    if tokio::time::timeout(grace, gate.wait_idle()).await.is_ok() {
        tracing::info!("Admission gate drained");
        return gate.status();
    }

    let left = gate.status();
    tracing::warn!(
        abandoned_active = left.active,
        abandoned_queued = left.queued,
        "Grace period elapsed; abandoning requests"
    );
    left
}
