use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use claimshift_common::error::{Result, ShiftError};
use claimshift_common::types::{ClaimSpec, PodPhase, PodRole, WorkloadKind, WorkloadReference};

use crate::traits::{ClaimApi, LeaseApi, PodApi, RecordApi, WorkloadApi};
use crate::types::{
    ClaimState, LeaseOutcome, OwnerRef, PodManifest, PodStatus, PodSummary, SecretManifest,
};

pub type ClaimFiles = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    ScaleWorkload { workload: String, replicas: i32 },
    DeleteWorkload { workload: String },
    CreateClaim { name: String, size_gib: u64, storage_class: String },
    DeleteClaim { name: String },
    CreateSecret { name: String },
    DeleteSecret { name: String },
    CreatePod { name: String, role: PodRole, claim: String },
    PodSettled { name: String, phase: PodPhase },
    DeletePod { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOp {
    ListPods,
    SetReplicas,
    CreateClaim,
    DeleteClaim,
    CreatePod,
    DeletePod,
    PodStatus,
    StoreRecord,
    RenewLease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Complete,
    Fail,
    Stall,
    ReplaceSource,
}

#[derive(Debug, Clone)]
struct MemoryPod {
    summary: PodSummary,
    status: PodStatus,
    claim: Option<String>,
    logs: String,
    // Status reads left before a running pod reports Ready.
    warmup: u32,
}

#[derive(Debug, Clone)]
struct MemoryClaim {
    spec: ClaimSpec,
    files: ClaimFiles,
    // Set once deleted: reads left before the object is finally removed.
    releasing: Option<u32>,
}

impl MemoryClaim {
    fn live(&self) -> bool {
        self.releasing.is_none()
    }
}

#[derive(Debug, Clone)]
struct MemoryLease {
    holder: String,
    renewed_at: DateTime<Utc>,
    duration: Duration,
}

#[derive(Debug)]
struct MemoryState {
    pods: BTreeMap<(String, String), MemoryPod>,
    replica_sets: BTreeMap<(String, String), OwnerRef>,
    workloads: BTreeMap<(String, String, String), Option<i32>>,
    claims: BTreeMap<(String, String), MemoryClaim>,
    secrets: BTreeMap<(String, String), BTreeMap<String, String>>,
    leases: BTreeMap<(String, String), MemoryLease>,
    records: BTreeMap<(String, String), String>,
    journal: Vec<ClusterEvent>,
    failures: HashMap<MemoryOp, VecDeque<ShiftError>>,
    transfer_mode: TransferMode,
    claim_release_reads: u32,
    source_warmup_reads: u32,
    next_ip: u32,
    next_uid: u64,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            pods: BTreeMap::new(),
            replica_sets: BTreeMap::new(),
            workloads: BTreeMap::new(),
            claims: BTreeMap::new(),
            secrets: BTreeMap::new(),
            leases: BTreeMap::new(),
            records: BTreeMap::new(),
            journal: Vec::new(),
            failures: HashMap::new(),
            transfer_mode: TransferMode::Complete,
            claim_release_reads: 0,
            source_warmup_reads: 0,
            next_ip: 1,
            next_uid: 1,
        }
    }
}

impl MemoryState {
    fn take_failure(&mut self, op: MemoryOp) -> Result<()> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn allocate_ip(&mut self) -> String {
        let ip = self.next_ip;
        self.next_ip += 1;
        format!("10.0.{}.{}", ip / 250, ip % 250 + 1)
    }

    fn allocate_uid(&mut self) -> String {
        let uid = self.next_uid;
        self.next_uid += 1;
        format!("uid-{uid}")
    }

    fn settle(&mut self, namespace: &str, name: &str, phase: PodPhase) {
        if let Some(pod) = self.pods.get_mut(&key(namespace, name)) {
            pod.status.phase = phase;
        }
        self.journal.push(ClusterEvent::PodSettled {
            name: name.to_string(),
            phase,
        });
    }

    fn run_destination(&mut self, manifest: &PodManifest) {
        let namespace = manifest.namespace.as_str();
        let source_addr = manifest.literal_env("SOURCE_ADDR").map(str::to_string);
        let source = source_addr.and_then(|addr| {
            self.pods
                .iter()
                .find(|((ns, _), pod)| {
                    ns == namespace && pod.status.pod_ip.as_deref() == Some(addr.as_str())
                })
                .map(|((_, name), pod)| (name.clone(), pod.claim.clone(), pod.status.ready))
        });

        // An unready source refuses the connection and the one-shot client exits.
        let Some((source_pod, Some(source_claim), true)) = source else {
            self.settle(namespace, &manifest.name, PodPhase::Failed);
            return;
        };

        match self.transfer_mode {
            TransferMode::Stall => {}
            TransferMode::Fail => self.settle(namespace, &manifest.name, PodPhase::Failed),
            TransferMode::Complete | TransferMode::ReplaceSource => {
                if self.transfer_mode == TransferMode::ReplaceSource {
                    let uid = self.allocate_uid();
                    let ip = self.allocate_ip();
                    if let Some(pod) = self.pods.get_mut(&key(namespace, &source_pod)) {
                        pod.status.uid = Some(uid);
                        pod.status.pod_ip = Some(ip);
                    }
                }

                let files = self
                    .claims
                    .get(&key(namespace, &source_claim))
                    .map(|claim| claim.files.clone())
                    .unwrap_or_default();
                let copied = files.len();
                let mirror = manifest.script.contains("--delete");
                if let Some(target) = self.claims.get_mut(&key(namespace, &manifest.claim)) {
                    if mirror {
                        target.files = files;
                    } else {
                        target.files.extend(files);
                    }
                }
                if let Some(pod) = self.pods.get_mut(&key(namespace, &manifest.name)) {
                    pod.logs = format!("sent {copied} files from {source_pod}\n");
                }
                self.settle(namespace, &manifest.name, PodPhase::Succeeded);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryCluster {
    state: Mutex<MemoryState>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_workload(&self, namespace: &str, kind: WorkloadKind, name: &str, replicas: Option<i32>) {
        self.state().workloads.insert(
            (namespace.to_string(), kind.as_str().to_string(), name.to_string()),
            replicas,
        );
    }

    pub fn add_replica_set(&self, namespace: &str, name: &str, deployment: &str) {
        self.state().replica_sets.insert(
            key(namespace, name),
            OwnerRef {
                kind: "Deployment".to_string(),
                name: deployment.to_string(),
                controller: true,
            },
        );
    }

    pub fn add_pod(&self, namespace: &str, name: &str, claims: &[&str], owners: Vec<OwnerRef>) {
        let mut state = self.state();
        let uid = state.allocate_uid();
        let ip = state.allocate_ip();
        state.pods.insert(
            key(namespace, name),
            MemoryPod {
                summary: PodSummary {
                    name: name.to_string(),
                    claims: claims.iter().map(|claim| claim.to_string()).collect(),
                    owners,
                },
                status: PodStatus {
                    phase: PodPhase::Running,
                    ready: true,
                    pod_ip: Some(ip),
                    uid: Some(uid),
                },
                claim: claims.first().map(|claim| claim.to_string()),
                logs: String::new(),
                warmup: 0,
            },
        );
    }

    pub fn add_claim(&self, claim: ClaimSpec, files: ClaimFiles) {
        self.state().claims.insert(
            key(&claim.namespace, &claim.name),
            MemoryClaim {
                spec: claim,
                files,
                releasing: None,
            },
        );
    }

    pub fn set_claim_files(&self, namespace: &str, name: &str, files: ClaimFiles) {
        if let Some(claim) = self.state().claims.get_mut(&key(namespace, name)) {
            claim.files = files;
        }
    }

    pub fn seed_lease(&self, namespace: &str, name: &str, holder: &str, renewed_at: DateTime<Utc>, duration: Duration) {
        self.state().leases.insert(
            key(namespace, name),
            MemoryLease {
                holder: holder.to_string(),
                renewed_at,
                duration,
            },
        );
    }

    pub fn seed_record(&self, namespace: &str, name: &str, payload: &str) {
        self.state()
            .records
            .insert(key(namespace, name), payload.to_string());
    }

    pub fn set_transfer_mode(&self, mode: TransferMode) {
        self.state().transfer_mode = mode;
    }

    // Deleted claims stay visible as terminating for this many `get_claim`
    // reads, the way the pvc-protection finalizer holds them.
    pub fn set_claim_release_reads(&self, reads: u32) {
        self.state().claim_release_reads = reads;
    }

    // Source pods run but stay unready for this many `pod_status` reads.
    pub fn set_source_warmup_reads(&self, reads: u32) {
        self.state().source_warmup_reads = reads;
    }

    pub fn inject_failure(&self, op: MemoryOp, err: ShiftError) {
        self.state().failures.entry(op).or_default().push_back(err);
    }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<ClaimSpec> {
        self.state()
            .claims
            .get(&key(namespace, name))
            .filter(|claim| claim.live())
            .map(|claim| claim.spec.clone())
    }

    pub fn claim_terminating(&self, namespace: &str, name: &str) -> bool {
        self.state()
            .claims
            .get(&key(namespace, name))
            .is_some_and(|claim| !claim.live())
    }

    pub fn claim_files(&self, namespace: &str, name: &str) -> Option<ClaimFiles> {
        self.state()
            .claims
            .get(&key(namespace, name))
            .filter(|claim| claim.live())
            .map(|claim| claim.files.clone())
    }

    pub fn replicas(&self, namespace: &str, kind: WorkloadKind, name: &str) -> Option<Option<i32>> {
        self.state()
            .workloads
            .get(&(namespace.to_string(), kind.as_str().to_string(), name.to_string()))
            .copied()
    }

    pub fn pod_names(&self, namespace: &str) -> Vec<String> {
        self.state()
            .pods
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn secret_names(&self, namespace: &str) -> Vec<String> {
        self.state()
            .secrets
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn record(&self, namespace: &str, name: &str) -> Option<String> {
        self.state().records.get(&key(namespace, name)).cloned()
    }

    pub fn lease_holder(&self, namespace: &str, name: &str) -> Option<String> {
        self.state()
            .leases
            .get(&key(namespace, name))
            .map(|lease| lease.holder.clone())
    }

    pub fn journal(&self) -> Vec<ClusterEvent> {
        self.state().journal.clone()
    }
}

#[async_trait]
impl WorkloadApi for MemoryCluster {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>> {
        let mut state = self.state();
        state.take_failure(MemoryOp::ListPods)?;
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod.summary.clone())
            .collect())
    }

    async fn replica_set_owner(&self, namespace: &str, name: &str) -> Result<Option<OwnerRef>> {
        Ok(self.state().replica_sets.get(&key(namespace, name)).cloned())
    }

    async fn get_replicas(&self, workload: &WorkloadReference) -> Result<Option<i32>> {
        let state = self.state();
        state
            .workloads
            .get(&workload_key(workload))
            .copied()
            .ok_or_else(|| ShiftError::NotFound {
                kind: "workload",
                name: workload.to_string(),
            })
    }

    async fn set_replicas(&self, workload: &WorkloadReference, replicas: i32) -> Result<()> {
        let mut state = self.state();
        state.take_failure(MemoryOp::SetReplicas)?;
        if !workload.kind.has_replicas() {
            return Err(ShiftError::InvalidArgument(format!(
                "workload kind {} has no replica count",
                workload.kind
            )));
        }
        let entry = state
            .workloads
            .get_mut(&workload_key(workload))
            .ok_or_else(|| ShiftError::NotFound {
                kind: "workload",
                name: workload.to_string(),
            })?;
        *entry = Some(replicas);
        state.journal.push(ClusterEvent::ScaleWorkload {
            workload: workload.to_string(),
            replicas,
        });
        Ok(())
    }

    async fn delete_workload(&self, workload: &WorkloadReference) -> Result<()> {
        let mut state = self.state();
        if state.workloads.remove(&workload_key(workload)).is_none() {
            return Err(ShiftError::NotFound {
                kind: "workload",
                name: workload.to_string(),
            });
        }
        // Owned pods are garbage collected with their controller.
        let owned: Vec<(String, String)> = state
            .pods
            .iter()
            .filter(|((ns, _), pod)| {
                *ns == workload.namespace
                    && pod.summary.controller().is_some_and(|owner| {
                        owner.kind == workload.kind.as_str() && owner.name == workload.name
                    })
            })
            .map(|(pod_key, _)| pod_key.clone())
            .collect();
        for pod_key in owned {
            state.pods.remove(&pod_key);
        }
        state.journal.push(ClusterEvent::DeleteWorkload {
            workload: workload.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl ClaimApi for MemoryCluster {
    async fn create_claim(&self, claim: &ClaimSpec) -> Result<()> {
        let mut state = self.state();
        state.take_failure(MemoryOp::CreateClaim)?;
        let claim_key = key(&claim.namespace, &claim.name);
        if state.claims.contains_key(&claim_key) {
            return Err(ShiftError::AlreadyExists {
                kind: "claim",
                name: claim.name.clone(),
            });
        }
        state.claims.insert(
            claim_key,
            MemoryClaim {
                spec: claim.clone(),
                files: ClaimFiles::new(),
                releasing: None,
            },
        );
        state.journal.push(ClusterEvent::CreateClaim {
            name: claim.name.clone(),
            size_gib: claim.size_gib,
            storage_class: claim.storage_class.clone(),
        });
        Ok(())
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.take_failure(MemoryOp::DeleteClaim)?;
        let claim_key = key(namespace, name);
        let release_reads = state.claim_release_reads;
        let Some(claim) = state.claims.get_mut(&claim_key) else {
            return Err(ShiftError::NotFound {
                kind: "claim",
                name: name.to_string(),
            });
        };
        if !claim.live() {
            return Ok(());
        }
        if release_reads == 0 {
            state.claims.remove(&claim_key);
        } else {
            claim.releasing = Some(release_reads);
        }
        state.journal.push(ClusterEvent::DeleteClaim {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimState>> {
        let mut state = self.state();
        let claim_key = key(namespace, name);
        let Some(claim) = state.claims.get_mut(&claim_key) else {
            return Ok(None);
        };
        let releasing = claim.releasing;
        match releasing {
            None => Ok(Some(ClaimState {
                spec: claim.spec.clone(),
                terminating: false,
            })),
            Some(reads) if reads <= 1 => {
                state.claims.remove(&claim_key);
                Ok(None)
            }
            Some(reads) => {
                claim.releasing = Some(reads - 1);
                Ok(Some(ClaimState {
                    spec: claim.spec.clone(),
                    terminating: true,
                }))
            }
        }
    }
}

#[async_trait]
impl PodApi for MemoryCluster {
    async fn create_pod(&self, pod: &PodManifest) -> Result<()> {
        let mut state = self.state();
        state.take_failure(MemoryOp::CreatePod)?;
        let pod_key = key(&pod.namespace, &pod.name);
        if state.pods.contains_key(&pod_key) {
            return Err(ShiftError::AlreadyExists {
                kind: "pod",
                name: pod.name.clone(),
            });
        }

        let claim_bound = state
            .claims
            .get(&key(&pod.namespace, &pod.claim))
            .is_some_and(MemoryClaim::live);
        let secrets_present = pod
            .secret_refs()
            .all(|secret| state.secrets.contains_key(&key(&pod.namespace, secret)));
        let uid = state.allocate_uid();
        let ip = state.allocate_ip();
        state.pods.insert(
            pod_key,
            MemoryPod {
                summary: PodSummary {
                    name: pod.name.clone(),
                    claims: vec![pod.claim.clone()],
                    owners: Vec::new(),
                },
                status: PodStatus {
                    phase: PodPhase::Pending,
                    ready: false,
                    pod_ip: Some(ip),
                    uid: Some(uid),
                },
                claim: Some(pod.claim.clone()),
                logs: String::new(),
                warmup: 0,
            },
        );
        state.journal.push(ClusterEvent::CreatePod {
            name: pod.name.clone(),
            role: pod.role,
            claim: pod.claim.clone(),
        });

        if !claim_bound || !secrets_present {
            return Ok(());
        }
        match pod.role {
            PodRole::Source => {
                let warmup = state.source_warmup_reads;
                if let Some(entry) = state.pods.get_mut(&key(&pod.namespace, &pod.name)) {
                    entry.status.phase = PodPhase::Running;
                    entry.status.ready = warmup == 0;
                    entry.warmup = warmup;
                    entry.logs = format!("Server listening on 0.0.0.0 port {}.\n", pod.port.unwrap_or(22));
                }
            }
            PodRole::Destination => state.run_destination(pod),
        }
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.take_failure(MemoryOp::DeletePod)?;
        if state.pods.remove(&key(namespace, name)).is_none() {
            return Err(ShiftError::NotFound {
                kind: "pod",
                name: name.to_string(),
            });
        }
        state.journal.push(ClusterEvent::DeletePod {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn pod_status(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>> {
        let mut state = self.state();
        state.take_failure(MemoryOp::PodStatus)?;
        Ok(state.pods.get_mut(&key(namespace, name)).map(|pod| {
            if pod.warmup > 0 {
                pod.warmup -= 1;
                pod.status.ready = pod.warmup == 0;
            }
            pod.status.clone()
        }))
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String> {
        self.state()
            .pods
            .get(&key(namespace, name))
            .map(|pod| pod.logs.clone())
            .ok_or_else(|| ShiftError::NotFound {
                kind: "pod",
                name: name.to_string(),
            })
    }

    async fn create_secret(&self, secret: &SecretManifest) -> Result<()> {
        let mut state = self.state();
        let secret_key = key(&secret.namespace, &secret.name);
        if state.secrets.contains_key(&secret_key) {
            return Err(ShiftError::AlreadyExists {
                kind: "secret",
                name: secret.name.clone(),
            });
        }
        state.secrets.insert(secret_key, secret.data.clone());
        state.journal.push(ClusterEvent::CreateSecret {
            name: secret.name.clone(),
        });
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.secrets.remove(&key(namespace, name)).is_none() {
            return Err(ShiftError::NotFound {
                kind: "secret",
                name: name.to_string(),
            });
        }
        state.journal.push(ClusterEvent::DeleteSecret {
            name: name.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl LeaseApi for MemoryCluster {
    async fn acquire_lease(
        &self,
        namespace: &str,
        name: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<LeaseOutcome> {
        let mut state = self.state();
        let now = Utc::now();
        if let Some(lease) = state.leases.get(&key(namespace, name)) {
            let expires_at = lease.renewed_at
                + chrono::Duration::from_std(lease.duration).unwrap_or(chrono::Duration::zero());
            if lease.holder != holder && expires_at > now {
                return Ok(LeaseOutcome::HeldBy(lease.holder.clone()));
            }
        }
        state.leases.insert(
            key(namespace, name),
            MemoryLease {
                holder: holder.to_string(),
                renewed_at: now,
                duration,
            },
        );
        Ok(LeaseOutcome::Acquired)
    }

    async fn renew_lease(&self, namespace: &str, name: &str, holder: &str) -> Result<bool> {
        let mut state = self.state();
        state.take_failure(MemoryOp::RenewLease)?;
        match state.leases.get_mut(&key(namespace, name)) {
            Some(lease) if lease.holder == holder => {
                lease.renewed_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, namespace: &str, name: &str, holder: &str) -> Result<()> {
        let mut state = self.state();
        let lease_key = key(namespace, name);
        if state
            .leases
            .get(&lease_key)
            .is_some_and(|lease| lease.holder == holder)
        {
            state.leases.remove(&lease_key);
        }
        Ok(())
    }
}

#[async_trait]
impl RecordApi for MemoryCluster {
    async fn load_record(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        Ok(self.record(namespace, name))
    }

    async fn store_record(&self, namespace: &str, name: &str, payload: &str) -> Result<()> {
        let mut state = self.state();
        state.take_failure(MemoryOp::StoreRecord)?;
        state
            .records
            .insert(key(namespace, name), payload.to_string());
        Ok(())
    }

    async fn delete_record(&self, namespace: &str, name: &str) -> Result<()> {
        self.state().records.remove(&key(namespace, name));
        Ok(())
    }
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

fn workload_key(workload: &WorkloadReference) -> (String, String, String) {
    (
        workload.namespace.clone(),
        workload.kind.as_str().to_string(),
        workload.name.clone(),
    )
}
