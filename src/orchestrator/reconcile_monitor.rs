//! Background reconcile loop.
//!
//! Runs [`Supervisor::reconcile`] on a fixed interval until cancelled.
//! `list_active` still reconciles on every read; this loop only keeps the
//! registry fresh between reads.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::supervisor::Supervisor;

/// Spawn a task that reconciles every `interval` until `cancel` fires.
#[must_use]
pub fn spawn_reconcile_monitor(
    supervisor: Supervisor,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("reconcile monitor shutting down");
                    break;
                }
                () = tokio::time::sleep(interval) => {}
            }

            let report = supervisor.reconcile().await;
            if report.is_empty() {
                debug!("reconcile pass made no changes");
            } else {
                info!(
                    pruned = ?report.pruned,
                    adopted = ?report.adopted,
                    "reconcile pass updated registry"
                );
            }
        }
    })
}
