use std::{sync::Arc, time::Duration};

use claimshift_cluster::{Cluster, LeaseOutcome};
use claimshift_common::error::{Result, ShiftError};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};

use crate::abort::AbortHandle;

const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(1);

pub fn lease_name(claim: &str) -> String {
    format!("claimshift-{claim}")
}

pub struct ClaimLease {
    cluster: Arc<dyn Cluster>,
    namespace: String,
    name: String,
    holder: String,
    on_lost: AbortHandle,
    renewal: Option<JoinHandle<()>>,
}

struct Renewal {
    cluster: Arc<dyn Cluster>,
    namespace: String,
    name: String,
    holder: String,
    duration: Duration,
    on_lost: AbortHandle,
}

impl ClaimLease {
    // `on_lost` fires once the lease is taken over or cannot be renewed
    // within its duration.
    pub async fn acquire(
        cluster: Arc<dyn Cluster>,
        namespace: &str,
        claim: &str,
        holder: &str,
        duration: Duration,
        on_lost: AbortHandle,
    ) -> Result<Self> {
        let name = lease_name(claim);
        match cluster.acquire_lease(namespace, &name, holder, duration).await? {
            LeaseOutcome::Acquired => {
                info!(lease = %name, holder, "acquired migration lease");
            }
            LeaseOutcome::HeldBy(current) => {
                return Err(ShiftError::LeaseHeld {
                    claim: claim.to_string(),
                    holder: current,
                });
            }
        }

        let renewal = Renewal {
            cluster: Arc::clone(&cluster),
            namespace: namespace.to_string(),
            name: name.clone(),
            holder: holder.to_string(),
            duration,
            on_lost: on_lost.clone(),
        };
        Ok(Self {
            cluster,
            namespace: namespace.to_string(),
            name,
            holder: holder.to_string(),
            on_lost,
            renewal: Some(tokio::spawn(renewal.run())),
        })
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn is_lost(&self) -> bool {
        self.on_lost.is_aborted()
    }

    pub async fn release(mut self) -> Result<()> {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
        self.cluster
            .release_lease(&self.namespace, &self.name, &self.holder)
            .await?;
        info!(lease = %self.name, "released migration lease");
        Ok(())
    }
}

impl Drop for ClaimLease {
    fn drop(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

impl Renewal {
    async fn run(self) {
        let every = (self.duration / 3).max(MIN_RENEW_INTERVAL);
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        let mut renewed_at = Instant::now();
        loop {
            ticker.tick().await;
            match self
                .cluster
                .renew_lease(&self.namespace, &self.name, &self.holder)
                .await
            {
                Ok(true) => {
                    renewed_at = Instant::now();
                    debug!(lease = %self.name, "renewed migration lease");
                }
                Ok(false) => {
                    error!(lease = %self.name, holder = %self.holder, "migration lease was taken over");
                    break;
                }
                Err(err) if renewed_at.elapsed() >= self.duration => {
                    error!(lease = %self.name, error = %err, "migration lease expired without renewal");
                    break;
                }
                Err(err) => warn!(lease = %self.name, error = %err, "failed to renew migration lease"),
            }
        }
        self.on_lost.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use claimshift_cluster::{MemoryCluster, MemoryOp};
    use claimshift_common::error::ShiftError;

    use super::ClaimLease;
    use crate::abort::abort_channel;

    #[tokio::test]
    async fn second_holder_is_refused_until_release() {
        let cluster = Arc::new(MemoryCluster::new());
        let duration = Duration::from_secs(60);
        let (handle, _) = abort_channel();

        let lease = ClaimLease::acquire(cluster.clone(), "default", "data0", "run-a", duration, handle.clone())
            .await
            .unwrap();
        assert_eq!(cluster.lease_holder("default", "claimshift-data0").as_deref(), Some("run-a"));

        let err = ClaimLease::acquire(cluster.clone(), "default", "data0", "run-b", duration, handle.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ShiftError::LeaseHeld { holder, .. } if holder == "run-a"));

        lease.release().await.unwrap();
        assert_eq!(cluster.lease_holder("default", "claimshift-data0"), None);

        let lease = ClaimLease::acquire(cluster.clone(), "default", "data0", "run-b", duration, handle)
            .await
            .unwrap();
        assert_eq!(lease.holder(), "run-b");
        assert!(!lease.is_lost());
    }

    #[tokio::test]
    async fn expired_leases_are_taken_over() {
        let cluster = Arc::new(MemoryCluster::new());
        let stale = chrono::Utc::now() - chrono::Duration::seconds(600);
        cluster.seed_lease("default", "claimshift-data0", "crashed", stale, Duration::from_secs(60));
        let (handle, _) = abort_channel();

        let lease = ClaimLease::acquire(cluster.clone(), "default", "data0", "run-a", Duration::from_secs(60), handle)
            .await
            .unwrap();
        assert_eq!(cluster.lease_holder("default", "claimshift-data0").as_deref(), Some("run-a"));
        lease.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn takeover_fires_the_lost_signal() {
        let cluster = Arc::new(MemoryCluster::new());
        let (handle, signal) = abort_channel();
        let lease = ClaimLease::acquire(cluster.clone(), "default", "data0", "run-a", Duration::from_secs(30), handle)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!signal.is_aborted());

        cluster.seed_lease("default", "claimshift-data0", "run-b", chrono::Utc::now(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(signal.is_aborted());
        assert!(lease.is_lost());

        lease.release().await.unwrap();
        assert_eq!(cluster.lease_holder("default", "claimshift-data0").as_deref(), Some("run-b"));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_renewals_give_up_after_the_lease_duration() {
        let cluster = Arc::new(MemoryCluster::new());
        for _ in 0..10 {
            cluster.inject_failure(MemoryOp::RenewLease, ShiftError::Transient("503".to_string()));
        }
        let (handle, signal) = abort_channel();
        let lease = ClaimLease::acquire(cluster.clone(), "default", "data0", "run-a", Duration::from_secs(9), handle)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(!lease.is_lost());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(lease.is_lost());
        assert!(signal.is_aborted());
    }
}
