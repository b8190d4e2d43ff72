//! Test adapter implementing the workload trait
//!
//! Keeps fleets and pod counts in memory so reconciler tests can run
//! without a cluster, and records every create/delete for assertions.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use error_stack::Report;

use super::fleet::Fleet;
use super::types::KubernetesError;
use super::workloads::WorkloadApi;

#[derive(Default)]
pub struct MockWorkloads {
    fleets: DashMap<String, Fleet>,
    pod_count: AtomicU32,
    pub created_pods: Mutex<Vec<String>>,
    pub deleted_pods: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl MockWorkloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_fleet(&self, fleet: Fleet) {
        let name = fleet.metadata.name.clone().unwrap_or_default();
        self.fleets.insert(name, fleet);
    }

    pub fn set_pod_count(&self, count: u32) {
        self.pod_count.store(count, Ordering::SeqCst);
    }

    /// Make every call fail, to exercise the transient-error path.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check_fail(&self) -> Result<(), Report<KubernetesError>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Report::new(KubernetesError::ApiFailure {
                message: "injected failure".to_string(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkloadApi for MockWorkloads {
    async fn get_fleet(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<Fleet>, Report<KubernetesError>> {
        self.check_fail()?;
        Ok(self.fleets.get(name).map(|entry| entry.value().clone()))
    }

    async fn create_instance_pod(
        &self,
        fleet: &Fleet,
    ) -> Result<String, Report<KubernetesError>> {
        self.check_fail()?;
        let name = format!(
            "{}-{}",
            fleet.metadata.name.clone().unwrap_or_default(),
            self.pod_count.fetch_add(1, Ordering::SeqCst)
        );
        self.created_pods
            .lock()
            .expect("mock lock poisoned")
            .push(name.clone());
        Ok(name)
    }

    async fn delete_pod(
        &self,
        _namespace: &str,
        pod_name: &str,
    ) -> Result<(), Report<KubernetesError>> {
        self.check_fail()?;
        self.deleted_pods
            .lock()
            .expect("mock lock poisoned")
            .push(pod_name.to_string());
        self.pod_count.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn count_live_pods(
        &self,
        _namespace: &str,
        _fleet_name: &str,
    ) -> Result<u32, Report<KubernetesError>> {
        self.check_fail()?;
        Ok(self.pod_count.load(Ordering::SeqCst))
    }
}
