use std::sync::Arc;

use claimshift_cluster::{Cluster, ignore_not_found};
use claimshift_common::error::{Result, ShiftError};
use claimshift_common::types::{WorkloadKind, WorkloadReference};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const REPLICA_SET_KIND: &str = "ReplicaSet";
const BARE_POD_KIND: &str = "Pod";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovered {
    pub workload: WorkloadReference,
    // Present only for kinds that carry a replica count.
    pub replicas: Option<i32>,
}

#[derive(Clone)]
pub struct WorkloadAdapter {
    cluster: Arc<dyn Cluster>,
}

impl WorkloadAdapter {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster }
    }

    pub async fn discover(&self, claim: &str, namespace: &str) -> Result<Option<Discovered>> {
        let pods = self.cluster.list_pods(namespace).await?;
        let mut owners: Vec<WorkloadReference> = Vec::new();

        for pod in pods.iter().filter(|pod| pod.mounts_claim(claim)) {
            let (kind, name) = match pod.controller() {
                Some(owner) if owner.kind == REPLICA_SET_KIND => {
                    match self.cluster.replica_set_owner(namespace, &owner.name).await? {
                        Some(deployment) => (WorkloadKind::from_kind(&deployment.kind), deployment.name),
                        None => (WorkloadKind::from_kind(&owner.kind), owner.name.clone()),
                    }
                }
                Some(owner) => (WorkloadKind::from_kind(&owner.kind), owner.name.clone()),
                None => (WorkloadKind::Unknown(BARE_POD_KIND.to_string()), pod.name.clone()),
            };
            let reference = WorkloadReference {
                kind,
                name,
                namespace: namespace.to_string(),
            };
            if !owners.contains(&reference) {
                owners.push(reference);
            }
        }

        if owners.len() > 1 {
            return Err(ShiftError::MultipleOwners {
                claim: claim.to_string(),
                owners: owners.iter().map(ToString::to_string).collect(),
            });
        }
        let Some(workload) = owners.pop() else {
            info!(claim, namespace, "no pod uses the claim");
            return Ok(None);
        };

        let replicas = if workload.kind.has_replicas() {
            Some(self.cluster.get_replicas(&workload).await?.unwrap_or(1))
        } else {
            None
        };
        info!(claim, workload = %workload, replicas = ?replicas, "discovered claim owner");
        Ok(Some(Discovered { workload, replicas }))
    }

    pub fn check_quiesce(&self, discovered: &Discovered, allow_daemonset_delete: bool) -> Result<()> {
        if discovered.workload.kind == WorkloadKind::DaemonSet && !allow_daemonset_delete {
            return Err(ShiftError::DaemonSetDeletionRefused {
                name: discovered.workload.name.clone(),
            });
        }
        Ok(())
    }

    pub async fn quiesce(&self, discovered: &Discovered, allow_daemonset_delete: bool) -> Result<()> {
        self.check_quiesce(discovered, allow_daemonset_delete)?;
        let workload = &discovered.workload;
        match &workload.kind {
            WorkloadKind::Deployment | WorkloadKind::StatefulSet => {
                self.cluster.set_replicas(workload, 0).await?;
                info!(workload = %workload, "scaled workload to zero");
            }
            WorkloadKind::DaemonSet => {
                ignore_not_found(self.cluster.delete_workload(workload).await)?;
                warn!(workload = %workload, "deleted daemonset; it will not be recreated");
            }
            WorkloadKind::Unknown(kind) => {
                warn!(workload = %workload, kind = %kind, "cannot quiesce workload of this kind, leaving it running");
            }
        }
        Ok(())
    }

    pub async fn resume(&self, discovered: &Discovered) -> Result<()> {
        let workload = &discovered.workload;
        match &workload.kind {
            WorkloadKind::Deployment | WorkloadKind::StatefulSet => {
                let replicas = discovered.replicas.unwrap_or(1);
                self.cluster.set_replicas(workload, replicas).await?;
                info!(workload = %workload, replicas, "restored workload replicas");
            }
            WorkloadKind::DaemonSet => {
                warn!(workload = %workload, "daemonset must be redeployed externally");
            }
            WorkloadKind::Unknown(kind) => {
                warn!(workload = %workload, kind = %kind, "nothing to resume for workload of this kind");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use claimshift_cluster::{ClusterEvent, MemoryCluster, OwnerRef};
    use claimshift_common::error::ShiftError;
    use claimshift_common::types::{WorkloadKind, WorkloadReference};

    use super::{Discovered, WorkloadAdapter};

    fn owner(kind: &str, name: &str) -> Vec<OwnerRef> {
        vec![OwnerRef {
            kind: kind.to_string(),
            name: name.to_string(),
            controller: true,
        }]
    }

    fn deployment(name: &str) -> WorkloadReference {
        WorkloadReference {
            kind: WorkloadKind::Deployment,
            name: name.to_string(),
            namespace: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn replica_set_pods_resolve_to_their_deployment() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_workload("default", WorkloadKind::Deployment, "app0", Some(3));
        cluster.add_replica_set("default", "app0-7d9f", "app0");
        cluster.add_pod("default", "app0-7d9f-a", &["data0"], owner("ReplicaSet", "app0-7d9f"));
        cluster.add_pod("default", "app0-7d9f-b", &["data0"], owner("ReplicaSet", "app0-7d9f"));
        cluster.add_pod("default", "other", &["data1"], owner("StatefulSet", "db"));

        let adapter = WorkloadAdapter::new(cluster);
        let discovered = adapter.discover("data0", "default").await.unwrap().unwrap();
        assert_eq!(discovered.workload, deployment("app0"));
        assert_eq!(discovered.replicas, Some(3));
    }

    #[tokio::test]
    async fn unset_replicas_default_to_one() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_workload("default", WorkloadKind::StatefulSet, "db", None);
        cluster.add_pod("default", "db-0", &["data0"], owner("StatefulSet", "db"));

        let discovered = WorkloadAdapter::new(cluster)
            .discover("data0", "default")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(discovered.replicas, Some(1));
    }

    #[tokio::test]
    async fn unused_claims_have_no_owner() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_pod("default", "other", &["data1"], owner("StatefulSet", "db"));

        let discovered = WorkloadAdapter::new(cluster).discover("data0", "default").await.unwrap();
        assert_eq!(discovered, None);
    }

    #[tokio::test]
    async fn bare_pods_are_reported_as_unknown() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_pod("default", "debug", &["data0"], Vec::new());

        let discovered = WorkloadAdapter::new(cluster)
            .discover("data0", "default")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(discovered.workload.kind, WorkloadKind::Unknown("Pod".to_string()));
        assert_eq!(discovered.workload.name, "debug");
        assert_eq!(discovered.replicas, None);
    }

    #[tokio::test]
    async fn multiple_owners_are_an_error() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_workload("default", WorkloadKind::Deployment, "app0", Some(1));
        cluster.add_pod("default", "app0-a", &["data0"], owner("Deployment", "app0"));
        cluster.add_pod("default", "db-0", &["data0"], owner("StatefulSet", "db"));

        let err = WorkloadAdapter::new(cluster)
            .discover("data0", "default")
            .await
            .unwrap_err();
        match err {
            ShiftError::MultipleOwners { claim, owners } => {
                assert_eq!(claim, "data0");
                assert_eq!(owners, vec!["Deployment/app0", "StatefulSet/db"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn quiesce_and_resume_round_trip_replicas() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_workload("default", WorkloadKind::Deployment, "app0", Some(3));
        let adapter = WorkloadAdapter::new(cluster.clone());
        let discovered = Discovered {
            workload: deployment("app0"),
            replicas: Some(3),
        };

        adapter.quiesce(&discovered, false).await.unwrap();
        assert_eq!(cluster.replicas("default", WorkloadKind::Deployment, "app0"), Some(Some(0)));
        adapter.resume(&discovered).await.unwrap();
        assert_eq!(cluster.replicas("default", WorkloadKind::Deployment, "app0"), Some(Some(3)));
    }

    #[tokio::test]
    async fn daemonsets_need_explicit_opt_in() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_workload("default", WorkloadKind::DaemonSet, "agent", None);
        let adapter = WorkloadAdapter::new(cluster.clone());
        let discovered = Discovered {
            workload: WorkloadReference {
                kind: WorkloadKind::DaemonSet,
                name: "agent".to_string(),
                namespace: "default".to_string(),
            },
            replicas: None,
        };

        let err = adapter.quiesce(&discovered, false).await.unwrap_err();
        assert!(matches!(err, ShiftError::DaemonSetDeletionRefused { .. }));
        assert!(cluster.journal().is_empty());

        adapter.quiesce(&discovered, true).await.unwrap();
        assert_eq!(
            cluster.journal(),
            vec![ClusterEvent::DeleteWorkload {
                workload: "DaemonSet/agent".to_string()
            }]
        );
        adapter.resume(&discovered).await.unwrap();
        assert_eq!(cluster.replicas("default", WorkloadKind::DaemonSet, "agent"), None);
    }
}
