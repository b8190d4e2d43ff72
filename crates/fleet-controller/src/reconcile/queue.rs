//! Deduplicating reconciliation queue
//!
//! Work is keyed by resource identity: an equal request that is already
//! queued or being processed is dropped on enqueue. The check and the
//! insert happen under one lock. Scheduled requeues run on the timer
//! driver and re-enter through `enqueue` with a fresh timestamp.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::k8s::fleet::Fleet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ResourceKind {
    #[display("Fleet")]
    Fleet,
}

/// One unit of reconciliation work.
///
/// Equality and hashing cover `(namespace, name, kind)` only; the enqueue
/// timestamp is excluded so an equal request is recognized as already
/// in-flight no matter when it was created.
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub namespace: String,
    pub name: String,
    pub kind: ResourceKind,
    pub enqueued_at: Instant,
}

impl ReconcileRequest {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind,
            enqueued_at: Instant::now(),
        }
    }

    pub fn for_fleet(fleet: &Fleet) -> Self {
        Self::new(
            fleet
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            fleet.metadata.name.clone().unwrap_or_default(),
            ResourceKind::Fleet,
        )
    }
}

impl PartialEq for ReconcileRequest {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.name == other.name && self.kind == other.kind
    }
}

impl Eq for ReconcileRequest {}

impl Hash for ReconcileRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.name.hash(state);
        self.kind.hash(state);
    }
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<ReconcileRequest>,
    in_flight: HashSet<ReconcileRequest>,
}

#[derive(Default)]
pub struct ReconciliationQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl ReconciliationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add work unless an equal request is already queued or processing.
    /// Returns whether the request was accepted.
    pub fn enqueue(&self, request: ReconcileRequest) -> bool {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.in_flight.contains(&request) {
                debug!(namespace = %request.namespace, name = %request.name, "request already in flight");
                return false;
            }
            inner.in_flight.insert(request.clone());
            inner.queue.push_back(request);
        }
        self.notify.notify_one();
        true
    }

    /// Wait until a request is available and return it. The request stays
    /// in the in-flight set until `mark_complete` or a `requeue` cycle.
    pub async fn dequeue(&self) -> ReconcileRequest {
        loop {
            if let Some(request) = {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                inner.queue.pop_front()
            } {
                return request;
            }
            self.notify.notified().await;
        }
    }

    /// Release the request after a pass that does not requeue.
    pub fn mark_complete(&self, request: &ReconcileRequest) {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .in_flight
            .remove(request);
    }

    /// Schedule re-insertion after `delay`. The original request stays
    /// in-flight for the whole window; when the timer fires it is swapped
    /// for a fresh request in one critical section.
    pub fn requeue(self: &Arc<Self>, request: ReconcileRequest, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut inner = queue.inner.lock().expect("queue lock poisoned");
                inner.in_flight.remove(&request);
                let fresh =
                    ReconcileRequest::new(request.namespace.clone(), request.name.clone(), request.kind);
                inner.in_flight.insert(fresh.clone());
                inner.queue.push_back(fresh);
            }
            queue.notify.notify_one();
        });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .in_flight
            .len()
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::*;

    fn request(name: &str) -> ReconcileRequest {
        ReconcileRequest::new("games", name, ResourceKind::Fleet)
    }

    #[tokio::test(start_paused = true)]
    async fn equal_requests_are_deduplicated_while_in_flight() {
        let queue = Arc::new(ReconciliationQueue::new());
        assert!(queue.enqueue(request("lobby")));
        assert!(!queue.enqueue(request("lobby")));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.in_flight_count(), 1);

        // Still deduplicated while being processed.
        let taken = queue.dequeue().await;
        assert_eq!(taken.name, "lobby");
        assert!(!queue.enqueue(request("lobby")));

        // Released after completion.
        queue.mark_complete(&taken);
        assert!(queue.enqueue(request("lobby")));
    }

    #[tokio::test(start_paused = true)]
    async fn different_resources_do_not_interfere() {
        let queue = Arc::new(ReconciliationQueue::new());
        assert!(queue.enqueue(request("lobby")));
        assert!(queue.enqueue(request("arena")));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_keeps_request_in_flight_across_the_delay_window() {
        let queue = Arc::new(ReconciliationQueue::new());
        queue.enqueue(request("lobby"));
        let taken = queue.dequeue().await;

        queue.requeue(taken, Duration::from_secs(5));
        tokio::task::yield_now().await;

        // A watch event arriving mid-window must not produce extra work.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!queue.enqueue(request("lobby")));
        assert!(timeout(Duration::from_millis(100), queue.dequeue())
            .await
            .is_err());

        tokio::time::advance(Duration::from_secs(4)).await;
        let fresh = timeout(Duration::from_secs(1), queue.dequeue())
            .await
            .expect("requeued request should be delivered");
        assert_eq!(fresh.name, "lobby");
        assert_eq!(queue.in_flight_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requeued_request_carries_a_fresh_timestamp() {
        let queue = Arc::new(ReconciliationQueue::new());
        queue.enqueue(request("lobby"));
        let taken = queue.dequeue().await;
        let original_enqueued_at = taken.enqueued_at;

        queue.requeue(taken, Duration::from_secs(5));
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let fresh = timeout(Duration::from_secs(1), queue.dequeue())
            .await
            .expect("requeued request should be delivered");
        assert!(fresh.enqueued_at > original_enqueued_at);
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_wakes_on_enqueue() {
        let queue = Arc::new(ReconciliationQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(request("lobby"));
        let taken = waiter.await.unwrap();
        assert_eq!(taken.name, "lobby");
    }
}
