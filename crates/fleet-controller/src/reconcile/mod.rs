//! Reconciliation
//!
//! Resource-change events are funneled through a deduplicating queue and
//! drained by a single worker that runs one pass per fleet resource. A
//! request stays in-flight from enqueue until the pass completes without a
//! requeue, so a burst of watch events for one resource cannot flood the
//! loop.

pub mod queue;
pub mod reconciler;

pub use queue::ReconcileRequest;
pub use queue::ReconciliationQueue;
pub use queue::ResourceKind;
pub use reconciler::FleetReconciler;
pub use reconciler::ReconcileOutcome;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Drain the queue until cancelled, applying the completion discipline:
/// a request is marked complete only when its pass does not requeue, which
/// keeps the resource in-flight across the scheduled-delay window.
pub async fn run_worker(
    queue: Arc<ReconciliationQueue>,
    reconciler: Arc<FleetReconciler>,
    cancel: CancellationToken,
) {
    info!("reconciliation worker started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("reconciliation worker cancelled");
                break;
            }
            request = queue.dequeue() => {
                match reconciler.reconcile(&request).await {
                    ReconcileOutcome::Done => queue.mark_complete(&request),
                    ReconcileOutcome::RequeueAfter(delay) => queue.requeue(request, delay),
                }
            }
        }
    }
}
