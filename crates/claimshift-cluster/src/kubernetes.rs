use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use claimshift_common::error::{Result, ShiftError};
use claimshift_common::types::{ClaimSpec, GIB, PodPhase, WorkloadKind, WorkloadReference};
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
        coordination::v1::{Lease, LeaseSpec},
        core::v1::{
            ConfigMap, Container, ContainerPort, EnvVar as KubeEnvVar, EnvVarSource,
            PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
            Pod, PodSpec, Probe, Secret, SecretKeySelector, TCPSocketAction, Volume, VolumeMount,
            VolumeResourceRequirements,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{MicroTime, ObjectMeta},
        util::intstr::IntOrString,
    },
};
use kube::{
    Api, Client,
    api::{DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams},
    runtime::wait::await_condition,
};
use serde_json::json;

use crate::traits::{
    ClaimApi, LeaseApi, PodApi, RecordApi, WorkloadApi, ignore_not_found, status_settles,
};
use crate::types::{
    ClaimState, EnvValue, LeaseOutcome, MANAGED_BY_LABEL, MANAGED_BY_VALUE, OwnerRef, PodManifest, PodStatus,
    PodSummary, SecretManifest,
};

const FIELD_MANAGER: &str = "claimshift";
const RECORD_KEY: &str = "record.json";
const DATA_VOLUME: &str = "data";
const STORAGE_RESOURCE: &str = "storage";
const READY_CONDITION: &str = "Ready";
const READINESS_PERIOD_SECS: i32 = 2;

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.map_err(|err| {
            ShiftError::InvalidArgument(format!("failed to build kubernetes client: {err}"))
        })?;
        Ok(Self::new(client))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn leases(&self, namespace: &str) -> Api<Lease> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl WorkloadApi for KubeCluster {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|err| map_kube_error(err, "pods", namespace))?;
        Ok(pods.items.iter().map(pod_summary).collect())
    }

    async fn replica_set_owner(&self, namespace: &str, name: &str) -> Result<Option<OwnerRef>> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let replica_set = api
            .get_opt(name)
            .await
            .map_err(|err| map_kube_error(err, "replicaset", name))?;
        Ok(replica_set.and_then(|rs| controller_owner(&rs.metadata)))
    }

    async fn get_replicas(&self, workload: &WorkloadReference) -> Result<Option<i32>> {
        let name = workload.name.as_str();
        match &workload.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                let deployment = api
                    .get(name)
                    .await
                    .map_err(|err| map_kube_error(err, "deployment", name))?;
                Ok(deployment.spec.and_then(|spec| spec.replicas))
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                let stateful_set = api
                    .get(name)
                    .await
                    .map_err(|err| map_kube_error(err, "statefulset", name))?;
                Ok(stateful_set.spec.and_then(|spec| spec.replicas))
            }
            WorkloadKind::DaemonSet | WorkloadKind::Unknown(_) => Ok(None),
        }
    }

    async fn set_replicas(&self, workload: &WorkloadReference, replicas: i32) -> Result<()> {
        let name = workload.name.as_str();
        let patch = Patch::Strategic(json!({ "spec": { "replicas": replicas } }));
        let params = PatchParams::default();
        match &workload.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.patch(name, &params, &patch)
                    .await
                    .map_err(|err| map_kube_error(err, "deployment", name))?;
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.patch(name, &params, &patch)
                    .await
                    .map_err(|err| map_kube_error(err, "statefulset", name))?;
            }
            other => {
                return Err(ShiftError::InvalidArgument(format!(
                    "workload kind {other} has no replica count"
                )));
            }
        }
        Ok(())
    }

    async fn delete_workload(&self, workload: &WorkloadReference) -> Result<()> {
        let name = workload.name.as_str();
        let params = DeleteParams::default();
        match &workload.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.delete(name, &params)
                    .await
                    .map_err(|err| map_kube_error(err, "deployment", name))?;
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.delete(name, &params)
                    .await
                    .map_err(|err| map_kube_error(err, "statefulset", name))?;
            }
            WorkloadKind::DaemonSet => {
                let api: Api<DaemonSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.delete(name, &params)
                    .await
                    .map_err(|err| map_kube_error(err, "daemonset", name))?;
            }
            WorkloadKind::Unknown(kind) => {
                return Err(ShiftError::InvalidArgument(format!(
                    "cannot delete workload of unsupported kind {kind}"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClaimApi for KubeCluster {
    async fn create_claim(&self, claim: &ClaimSpec) -> Result<()> {
        self.claims(&claim.namespace)
            .create(&PostParams::default(), &claim_object(claim))
            .await
            .map_err(|err| map_kube_error(err, "claim", &claim.name))?;
        Ok(())
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        self.claims(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|err| map_kube_error(err, "claim", name))?;
        Ok(())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimState>> {
        let claim = self
            .claims(namespace)
            .get_opt(name)
            .await
            .map_err(|err| map_kube_error(err, "claim", name))?;
        Ok(claim.map(|claim| ClaimState {
            spec: claim_spec(namespace, name, &claim),
            terminating: claim.metadata.deletion_timestamp.is_some(),
        }))
    }
}

#[async_trait]
impl PodApi for KubeCluster {
    async fn create_pod(&self, pod: &PodManifest) -> Result<()> {
        self.pods(&pod.namespace)
            .create(&PostParams::default(), &pod_object(pod))
            .await
            .map_err(|err| map_kube_error(err, "pod", &pod.name))?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        self.pods(namespace)
            .delete(name, &params)
            .await
            .map_err(|err| map_kube_error(err, "pod", name))?;
        Ok(())
    }

    async fn pod_status(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>> {
        let pod = self
            .pods(namespace)
            .get_opt(name)
            .await
            .map_err(|err| map_kube_error(err, "pod", name))?;
        Ok(pod.as_ref().map(pod_status))
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String> {
        self.pods(namespace)
            .logs(name, &LogParams::default())
            .await
            .map_err(|err| map_kube_error(err, "pod", name))
    }

    async fn create_secret(&self, secret: &SecretManifest) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &secret.namespace);
        api.create(&PostParams::default(), &secret_object(secret))
            .await
            .map_err(|err| map_kube_error(err, "secret", &secret.name))?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|err| map_kube_error(err, "secret", name))?;
        Ok(())
    }

    async fn wait_for_pod(
        &self,
        namespace: &str,
        name: &str,
        target: PodPhase,
        _poll_interval: Duration,
    ) -> Result<PodStatus> {
        let settled = move |pod: Option<&Pod>| {
            pod.map(|pod| status_settles(target, &pod_status(pod)))
                .unwrap_or(false)
        };
        let pod = await_condition(self.pods(namespace), name, settled)
            .await
            .map_err(|err| ShiftError::Transient(format!("watch on pod {name} ended: {err}")))?;
        pod.as_ref().map(pod_status).ok_or_else(|| ShiftError::NotFound {
            kind: "pod",
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl LeaseApi for KubeCluster {
    async fn acquire_lease(
        &self,
        namespace: &str,
        name: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<LeaseOutcome> {
        let api = self.leases(namespace);
        let now = Utc::now();
        let duration_secs = i32::try_from(duration.as_secs()).unwrap_or(i32::MAX).max(1);

        let existing = api
            .get_opt(name)
            .await
            .map_err(|err| map_kube_error(err, "lease", name))?;

        let Some(mut lease) = existing else {
            let lease = Lease {
                metadata: managed_meta(name, namespace),
                spec: Some(lease_spec(holder, duration_secs, now, 0)),
            };
            return match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(LeaseOutcome::Acquired),
                Err(err) => match map_kube_error(err, "lease", name) {
                    ShiftError::AlreadyExists { .. } => Ok(LeaseOutcome::HeldBy("unknown".to_string())),
                    other => Err(other),
                },
            };
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let current = spec.holder_identity.clone().unwrap_or_default();
        if !current.is_empty() && current != holder && !lease_expired(&spec, now) {
            return Ok(LeaseOutcome::HeldBy(current));
        }

        let transitions = spec.lease_transitions.unwrap_or(0);
        let transitions = if current == holder { transitions } else { transitions + 1 };
        lease.spec = Some(lease_spec(holder, duration_secs, now, transitions));
        match api.replace(name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(LeaseOutcome::Acquired),
            Err(err) => match map_kube_error(err, "lease", name) {
                ShiftError::Conflict(_) => Ok(LeaseOutcome::HeldBy(current)),
                other => Err(other),
            },
        }
    }

    async fn renew_lease(&self, namespace: &str, name: &str, holder: &str) -> Result<bool> {
        let api = self.leases(namespace);
        let Some(mut lease) = api
            .get_opt(name)
            .await
            .map_err(|err| map_kube_error(err, "lease", name))?
        else {
            return Ok(false);
        };

        let mut spec = lease.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() != Some(holder) {
            return Ok(false);
        }
        spec.renew_time = Some(MicroTime(Utc::now()));
        lease.spec = Some(spec);
        match api.replace(name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(err) => match map_kube_error(err, "lease", name) {
                ShiftError::Conflict(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn release_lease(&self, namespace: &str, name: &str, holder: &str) -> Result<()> {
        let api = self.leases(namespace);
        let Some(lease) = api
            .get_opt(name)
            .await
            .map_err(|err| map_kube_error(err, "lease", name))?
        else {
            return Ok(());
        };

        let current = lease.spec.as_ref().and_then(|spec| spec.holder_identity.as_deref());
        if current != Some(holder) {
            return Ok(());
        }
        let result = api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|err| map_kube_error(err, "lease", name));
        ignore_not_found(result)
    }
}

#[async_trait]
impl RecordApi for KubeCluster {
    async fn load_record(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let config_map = self
            .config_maps(namespace)
            .get_opt(name)
            .await
            .map_err(|err| map_kube_error(err, "configmap", name))?;
        Ok(config_map
            .and_then(|config_map| config_map.data)
            .and_then(|mut data| data.remove(RECORD_KEY)))
    }

    async fn store_record(&self, namespace: &str, name: &str, payload: &str) -> Result<()> {
        let config_map = ConfigMap {
            metadata: managed_meta(name, namespace),
            data: Some(BTreeMap::from([(RECORD_KEY.to_string(), payload.to_string())])),
            ..ConfigMap::default()
        };
        self.config_maps(namespace)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&config_map),
            )
            .await
            .map_err(|err| map_kube_error(err, "configmap", name))?;
        Ok(())
    }

    async fn delete_record(&self, namespace: &str, name: &str) -> Result<()> {
        let result = self
            .config_maps(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|err| map_kube_error(err, "configmap", name));
        ignore_not_found(result)
    }
}

pub fn map_kube_error(err: kube::Error, kind: &'static str, name: &str) -> ShiftError {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => ShiftError::NotFound {
                kind,
                name: name.to_string(),
            },
            409 if response.reason == "AlreadyExists" => ShiftError::AlreadyExists {
                kind,
                name: name.to_string(),
            },
            409 => ShiftError::Conflict(format!("{kind} {name}: {}", response.message)),
            401 | 403 => ShiftError::Unauthorized(format!("{kind} {name}: {}", response.message)),
            400 | 422 => ShiftError::InvalidArgument(format!("{kind} {name}: {}", response.message)),
            429 | 500..=599 => ShiftError::Transient(format!(
                "{kind} {name}: {} ({})",
                response.message, response.code
            )),
            code => ShiftError::InternalError(format!(
                "{kind} {name}: unexpected api response {code}: {}",
                response.message
            )),
        },
        kube::Error::Auth(err) => ShiftError::Unauthorized(format!("{kind} {name}: {err}")),
        err @ (kube::Error::HyperError(_) | kube::Error::Service(_) | kube::Error::ReadEvents(_)) => {
            ShiftError::Transient(format!("{kind} {name}: {err}"))
        }
        other => ShiftError::InternalError(format!("{kind} {name}: {other}")),
    }
}

fn managed_meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([(
            MANAGED_BY_LABEL.to_string(),
            MANAGED_BY_VALUE.to_string(),
        )])),
        ..ObjectMeta::default()
    }
}

fn controller_owner(metadata: &ObjectMeta) -> Option<OwnerRef> {
    let owners = metadata.owner_references.as_ref()?;
    owners
        .iter()
        .find(|owner| owner.controller.unwrap_or(false))
        .or_else(|| owners.first())
        .map(|owner| OwnerRef {
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            controller: owner.controller.unwrap_or(false),
        })
}

fn pod_summary(pod: &Pod) -> PodSummary {
    let claims = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .filter_map(|volume| volume.persistent_volume_claim.as_ref())
                .map(|source| source.claim_name.clone())
                .collect()
        })
        .unwrap_or_default();
    let owners = pod
        .metadata
        .owner_references
        .as_ref()
        .map(|owners| {
            owners
                .iter()
                .map(|owner| OwnerRef {
                    kind: owner.kind.clone(),
                    name: owner.name.clone(),
                    controller: owner.controller.unwrap_or(false),
                })
                .collect()
        })
        .unwrap_or_default();

    PodSummary {
        name: pod.metadata.name.clone().unwrap_or_default(),
        claims,
        owners,
    }
}

fn pod_status(pod: &Pod) -> PodStatus {
    let status = pod.status.as_ref();
    let ready = status
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == READY_CONDITION && condition.status == "True")
        });
    PodStatus {
        phase: status
            .and_then(|status| status.phase.as_deref())
            .map(PodPhase::parse)
            .unwrap_or(PodPhase::Pending),
        ready,
        pod_ip: status.and_then(|status| status.pod_ip.clone()),
        uid: pod.metadata.uid.clone(),
    }
}

fn pod_object(manifest: &PodManifest) -> Pod {
    let env = manifest
        .env
        .iter()
        .map(|var| match &var.value {
            EnvValue::Literal(value) => KubeEnvVar {
                name: var.name.clone(),
                value: Some(value.clone()),
                value_from: None,
            },
            EnvValue::SecretKey { secret, key } => KubeEnvVar {
                name: var.name.clone(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: secret.clone(),
                        key: key.clone(),
                        optional: Some(false),
                    }),
                    ..EnvVarSource::default()
                }),
            },
        })
        .collect();

    let ports = manifest.port.map(|port| {
        vec![ContainerPort {
            name: Some("ssh".to_string()),
            container_port: i32::from(port),
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        }]
    });
    // Ready only once something accepts connections on the served port.
    let readiness = manifest.port.map(|port| Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(i32::from(port)),
            host: None,
        }),
        period_seconds: Some(READINESS_PERIOD_SECS),
        ..Probe::default()
    });

    let mut metadata = managed_meta(&manifest.name, &manifest.namespace);
    if let Some(labels) = metadata.labels.as_mut() {
        labels.extend(manifest.labels.clone());
    }

    Pod {
        metadata,
        spec: Some(PodSpec {
            containers: vec![Container {
                name: manifest.container.clone(),
                image: Some(manifest.image.clone()),
                command: Some(manifest.command.clone()),
                args: Some(vec![manifest.script.clone()]),
                env: Some(env),
                ports,
                readiness_probe: readiness,
                volume_mounts: Some(vec![VolumeMount {
                    name: DATA_VOLUME.to_string(),
                    mount_path: manifest.mount_path.clone(),
                    ..VolumeMount::default()
                }]),
                ..Container::default()
            }],
            restart_policy: Some(manifest.restart_policy.as_str().to_string()),
            volumes: Some(vec![Volume {
                name: DATA_VOLUME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: manifest.claim.clone(),
                    read_only: None,
                }),
                ..Volume::default()
            }]),
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

fn secret_object(manifest: &SecretManifest) -> Secret {
    let mut metadata = managed_meta(&manifest.name, &manifest.namespace);
    if let Some(labels) = metadata.labels.as_mut() {
        labels.extend(manifest.labels.clone());
    }
    Secret {
        metadata,
        string_data: Some(manifest.data.clone()),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    }
}

fn claim_object(claim: &ClaimSpec) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim.name.clone()),
            namespace: Some(claim.namespace.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    STORAGE_RESOURCE.to_string(),
                    Quantity(claim.size_bytes().to_string()),
                )])),
                ..VolumeResourceRequirements::default()
            }),
            storage_class_name: Some(claim.storage_class.clone()),
            ..PersistentVolumeClaimSpec::default()
        }),
        ..PersistentVolumeClaim::default()
    }
}

fn claim_spec(namespace: &str, name: &str, claim: &PersistentVolumeClaim) -> ClaimSpec {
    let spec = claim.spec.as_ref();
    let size_bytes = spec
        .and_then(|spec| spec.resources.as_ref())
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get(STORAGE_RESOURCE))
        .and_then(|quantity| parse_quantity_bytes(&quantity.0))
        .unwrap_or(0);
    ClaimSpec {
        name: name.to_string(),
        namespace: namespace.to_string(),
        size_gib: size_bytes.div_ceil(GIB),
        storage_class: spec
            .and_then(|spec| spec.storage_class_name.clone())
            .unwrap_or_default(),
    }
}

fn lease_spec(holder: &str, duration_secs: i32, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
    LeaseSpec {
        holder_identity: Some(holder.to_string()),
        lease_duration_seconds: Some(duration_secs),
        acquire_time: Some(MicroTime(now)),
        renew_time: Some(MicroTime(now)),
        lease_transitions: Some(transitions),
        ..LeaseSpec::default()
    }
}

fn lease_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    let Some(last) = spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) else {
        return true;
    };
    let duration = i64::from(spec.lease_duration_seconds.unwrap_or(0));
    last.0 + chrono::Duration::seconds(duration) < now
}

pub fn parse_quantity_bytes(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    let multiplier: u64 = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        _ => return None,
    };
    amount.checked_mul(multiplier)
}
