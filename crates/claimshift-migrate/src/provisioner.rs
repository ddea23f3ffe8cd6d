use std::{sync::Arc, time::Duration};

use claimshift_cluster::{Cluster, ignore_not_found};
use claimshift_common::error::{Result, ShiftError};
use claimshift_common::types::ClaimSpec;
use tracing::info;

use crate::readiness::ReadinessPoller;

#[derive(Clone)]
pub struct VolumeProvisioner {
    cluster: Arc<dyn Cluster>,
    poller: ReadinessPoller,
    release_timeout: Duration,
}

impl VolumeProvisioner {
    pub fn new(cluster: Arc<dyn Cluster>, poller: ReadinessPoller, release_timeout: Duration) -> Self {
        Self {
            cluster,
            poller,
            release_timeout,
        }
    }

    pub async fn create(&self, claim: &ClaimSpec) -> Result<()> {
        match self.cluster.create_claim(claim).await {
            Err(ShiftError::AlreadyExists { kind, name }) => {
                if self.terminating(claim).await? {
                    return Err(still_terminating(claim));
                }
                return Err(ShiftError::AlreadyExists { kind, name });
            }
            other => other?,
        }
        info!(
            claim = %claim.name,
            size_gib = claim.size_gib,
            storage_class = %claim.storage_class,
            "created claim"
        );
        Ok(())
    }

    // Returns once the claim is gone, not just marked for deletion.
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.cluster.delete_claim(namespace, name).await?;
        self.poller
            .await_claim_released(self.cluster.as_ref(), namespace, name, self.release_timeout)
            .await?;
        info!(claim = name, "deleted claim");
        Ok(())
    }

    // Accepts a claim left behind by an earlier attempt when it already has
    // the requested size and class.
    pub async fn ensure(&self, claim: &ClaimSpec) -> Result<()> {
        match self.create(claim).await {
            Err(ShiftError::AlreadyExists { .. }) => {}
            other => return other,
        }
        match self.cluster.get_claim(&claim.namespace, &claim.name).await? {
            Some(existing) if existing.terminating => Err(still_terminating(claim)),
            Some(existing)
                if existing.spec.size_gib == claim.size_gib
                    && existing.spec.storage_class == claim.storage_class =>
            {
                info!(claim = %claim.name, "claim already provisioned");
                Ok(())
            }
            Some(existing) => Err(ShiftError::Conflict(format!(
                "claim {} already exists with {} GiB of class {}",
                existing.spec.name, existing.spec.size_gib, existing.spec.storage_class
            ))),
            None => Err(ShiftError::Transient(format!(
                "claim {} disappeared while being provisioned",
                claim.name
            ))),
        }
    }

    pub async fn retire(&self, namespace: &str, name: &str) -> Result<()> {
        ignore_not_found(self.cluster.delete_claim(namespace, name).await)?;
        self.poller
            .await_claim_released(self.cluster.as_ref(), namespace, name, self.release_timeout)
            .await?;
        info!(claim = name, "retired claim");
        Ok(())
    }

    // True when the claim exists and is not being deleted.
    pub async fn is_live(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .cluster
            .get_claim(namespace, name)
            .await?
            .is_some_and(|existing| !existing.terminating))
    }

    async fn terminating(&self, claim: &ClaimSpec) -> Result<bool> {
        Ok(self
            .cluster
            .get_claim(&claim.namespace, &claim.name)
            .await?
            .is_some_and(|existing| existing.terminating))
    }
}

fn still_terminating(claim: &ClaimSpec) -> ShiftError {
    ShiftError::Transient(format!("claim {} is still terminating", claim.name))
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc, time::Duration};

    use claimshift_cluster::{ClaimApi, ClusterEvent, MemoryCluster};
    use claimshift_common::error::ShiftError;
    use claimshift_common::types::ClaimSpec;

    use super::VolumeProvisioner;
    use crate::abort::AbortSignal;
    use crate::readiness::ReadinessPoller;

    fn provisioner(cluster: Arc<MemoryCluster>) -> VolumeProvisioner {
        let poller = ReadinessPoller::new(Duration::from_secs(1), AbortSignal::never());
        VolumeProvisioner::new(cluster, poller, Duration::from_secs(60))
    }

    fn claim(name: &str, size_gib: u64, storage_class: &str) -> ClaimSpec {
        ClaimSpec {
            name: name.to_string(),
            namespace: "default".to_string(),
            size_gib,
            storage_class: storage_class.to_string(),
        }
    }

    #[tokio::test]
    async fn second_create_fails_and_keeps_first_claim() {
        let cluster = Arc::new(MemoryCluster::new());
        let provisioner = provisioner(cluster.clone());

        provisioner.create(&claim("data0-tmp", 20, "fast")).await.unwrap();
        let err = provisioner
            .create(&claim("data0-tmp", 40, "slow"))
            .await
            .unwrap_err();

        assert!(matches!(err, ShiftError::AlreadyExists { .. }));
        assert_eq!(
            cluster.claim("default", "data0-tmp"),
            Some(claim("data0-tmp", 20, "fast"))
        );
    }

    #[tokio::test]
    async fn delete_of_missing_claim_is_not_found() {
        let cluster = Arc::new(MemoryCluster::new());
        let provisioner = provisioner(cluster);

        let err = provisioner.delete("default", "data0").await.unwrap_err();
        assert!(err.is_not_found());
        provisioner.retire("default", "data0").await.unwrap();
    }

    #[tokio::test]
    async fn ensure_accepts_matching_claims_only() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_claim(claim("data0-tmp", 20, "fast"), BTreeMap::new());
        let provisioner = provisioner(cluster.clone());

        provisioner.ensure(&claim("data0-tmp", 20, "fast")).await.unwrap();
        let err = provisioner
            .ensure(&claim("data0-tmp", 30, "fast"))
            .await
            .unwrap_err();
        assert!(matches!(err, ShiftError::Conflict(_)));
        assert!(cluster.journal().is_empty());

        provisioner.ensure(&claim("data1", 5, "fast")).await.unwrap();
        assert_eq!(
            cluster.journal(),
            vec![ClusterEvent::CreateClaim {
                name: "data1".to_string(),
                size_gib: 5,
                storage_class: "fast".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delete_returns_once_the_claim_is_released() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.set_claim_release_reads(3);
        cluster.add_claim(claim("data0", 5, "slow"), BTreeMap::new());
        let provisioner = provisioner(cluster.clone());

        provisioner.delete("default", "data0").await.unwrap();
        assert!(!cluster.claim_terminating("default", "data0"));
        provisioner.create(&claim("data0", 20, "fast")).await.unwrap();
        assert_eq!(cluster.claim("default", "data0"), Some(claim("data0", 20, "fast")));
    }

    #[tokio::test(start_paused = true)]
    async fn terminating_claims_are_never_accepted() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.set_claim_release_reads(10);
        cluster.add_claim(claim("data0", 20, "fast"), BTreeMap::new());
        let provisioner = provisioner(cluster.clone());
        assert!(provisioner.is_live("default", "data0").await.unwrap());
        cluster.delete_claim("default", "data0").await.unwrap();
        assert!(!provisioner.is_live("default", "data0").await.unwrap());

        let err = provisioner.create(&claim("data0", 20, "fast")).await.unwrap_err();
        assert!(err.is_retryable());
        let err = provisioner.ensure(&claim("data0", 20, "fast")).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
