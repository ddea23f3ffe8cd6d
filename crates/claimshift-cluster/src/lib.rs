pub mod kubernetes;
pub mod memory;
pub mod traits;
pub mod types;

pub use kubernetes::KubeCluster;
pub use memory::{ClaimFiles, ClusterEvent, MemoryCluster, MemoryOp, TransferMode};
pub use traits::{
    ClaimApi, Cluster, LeaseApi, PodApi, RecordApi, WorkloadApi, ignore_not_found, phase_settles,
    status_settles,
};
pub use types::{
    ClaimState, EnvValue, EnvVar, LeaseOutcome, OwnerRef, PodManifest, PodStatus, PodSummary,
    RestartPolicy, SecretManifest,
};
