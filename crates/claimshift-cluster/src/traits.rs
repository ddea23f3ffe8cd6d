use std::time::Duration;

use async_trait::async_trait;
use claimshift_common::error::{Result, ShiftError};
use claimshift_common::types::{ClaimSpec, PodPhase, WorkloadReference};
use tracing::debug;

use crate::types::{
    ClaimState, LeaseOutcome, OwnerRef, PodManifest, PodStatus, PodSummary, SecretManifest,
};

#[async_trait]
pub trait WorkloadApi: Send + Sync {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>>;
    async fn replica_set_owner(&self, namespace: &str, name: &str) -> Result<Option<OwnerRef>>;
    async fn get_replicas(&self, workload: &WorkloadReference) -> Result<Option<i32>>;
    async fn set_replicas(&self, workload: &WorkloadReference, replicas: i32) -> Result<()>;
    async fn delete_workload(&self, workload: &WorkloadReference) -> Result<()>;
}

#[async_trait]
pub trait ClaimApi: Send + Sync {
    async fn create_claim(&self, claim: &ClaimSpec) -> Result<()>;
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()>;
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimState>>;
}

#[async_trait]
pub trait PodApi: Send + Sync {
    async fn create_pod(&self, pod: &PodManifest) -> Result<()>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
    async fn pod_status(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>>;
    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String>;
    async fn create_secret(&self, secret: &SecretManifest) -> Result<()>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    // Returns once the pod settles relative to `target` (see `status_settles`).
    // Transient read errors are retried; callers bound the wait.
    async fn wait_for_pod(
        &self,
        namespace: &str,
        name: &str,
        target: PodPhase,
        poll_interval: Duration,
    ) -> Result<PodStatus> {
        loop {
            match self.pod_status(namespace, name).await {
                Ok(Some(status)) if status_settles(target, &status) => return Ok(status),
                Ok(Some(status)) => {
                    debug!(pod = name, phase = %status.phase, target = %target, "pod not ready yet");
                }
                Ok(None) => debug!(pod = name, "pod not visible yet"),
                Err(err) if err.is_retryable() => {
                    debug!(pod = name, error = %err, "transient error reading pod phase");
                }
                Err(err) => return Err(err),
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[async_trait]
pub trait LeaseApi: Send + Sync {
    async fn acquire_lease(
        &self,
        namespace: &str,
        name: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<LeaseOutcome>;
    async fn renew_lease(&self, namespace: &str, name: &str, holder: &str) -> Result<bool>;
    async fn release_lease(&self, namespace: &str, name: &str, holder: &str) -> Result<()>;
}

#[async_trait]
pub trait RecordApi: Send + Sync {
    async fn load_record(&self, namespace: &str, name: &str) -> Result<Option<String>>;
    async fn store_record(&self, namespace: &str, name: &str, payload: &str) -> Result<()>;
    async fn delete_record(&self, namespace: &str, name: &str) -> Result<()>;
}

pub trait Cluster: WorkloadApi + ClaimApi + PodApi + LeaseApi + RecordApi {}

impl<T> Cluster for T where T: WorkloadApi + ClaimApi + PodApi + LeaseApi + RecordApi {}

pub fn phase_settles(target: PodPhase, observed: PodPhase) -> bool {
    if observed == target || observed == PodPhase::Failed {
        return true;
    }
    target == PodPhase::Running && observed.is_terminal()
}

// A Running pod only counts once it reports Ready.
pub fn status_settles(target: PodPhase, status: &PodStatus) -> bool {
    if target == PodPhase::Running && status.phase == PodPhase::Running {
        return status.ready;
    }
    phase_settles(target, status.phase)
}

pub fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(ShiftError::NotFound { .. }) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use claimshift_common::types::PodPhase;

    use super::{phase_settles, status_settles};
    use crate::types::PodStatus;

    #[test]
    fn failed_settles_every_wait() {
        assert!(phase_settles(PodPhase::Succeeded, PodPhase::Failed));
        assert!(phase_settles(PodPhase::Running, PodPhase::Failed));
    }

    #[test]
    fn running_target_settles_on_completion() {
        assert!(phase_settles(PodPhase::Running, PodPhase::Running));
        assert!(phase_settles(PodPhase::Running, PodPhase::Succeeded));
        assert!(!phase_settles(PodPhase::Running, PodPhase::Pending));
    }

    #[test]
    fn succeeded_target_waits_through_running() {
        assert!(!phase_settles(PodPhase::Succeeded, PodPhase::Running));
        assert!(!phase_settles(PodPhase::Succeeded, PodPhase::Unknown));
        assert!(phase_settles(PodPhase::Succeeded, PodPhase::Succeeded));
    }

    #[test]
    fn running_target_waits_for_readiness() {
        let mut status = PodStatus {
            phase: PodPhase::Running,
            ready: false,
            pod_ip: Some("10.0.0.7".to_string()),
            uid: Some("uid-1".to_string()),
        };
        assert!(!status_settles(PodPhase::Running, &status));

        status.ready = true;
        assert!(status_settles(PodPhase::Running, &status));

        status.ready = false;
        status.phase = PodPhase::Failed;
        assert!(status_settles(PodPhase::Running, &status));
    }
}
