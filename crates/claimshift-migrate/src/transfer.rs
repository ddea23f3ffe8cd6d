use std::{collections::BTreeMap, sync::Arc, time::Duration};

use claimshift_auth::Credential;
use claimshift_cluster::types::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use claimshift_cluster::{
    Cluster, EnvVar, PodManifest, PodStatus, RestartPolicy, SecretManifest, ignore_not_found,
};
use claimshift_common::error::{Result, ShiftError};
use claimshift_common::types::{
    MigrationRequest, PodPhase, PodRole, TransferDirection, TransferSession,
};
use tracing::{info, warn};

use crate::readiness::ReadinessPoller;

pub const MOUNT_PATH: &str = "/mnt/data";
pub const CLAIM_LABEL: &str = "claimshift.io/claim";
pub const ROLE_LABEL: &str = "claimshift.io/role";
pub const DIRECTION_LABEL: &str = "claimshift.io/direction";

const SOURCE_CONTAINER: &str = "ssh-server";
const DESTINATION_CONTAINER: &str = "rsync-client";
const USERNAME_KEY: &str = "username";
const PASSWORD_KEY: &str = "password";

pub fn plan_session(request: &MigrationRequest, direction: TransferDirection) -> TransferSession {
    let (source_claim, dest_claim) = match direction {
        TransferDirection::Forward => (request.source_claim.clone(), request.temp_claim()),
        TransferDirection::Back => (request.temp_claim(), request.source_claim.clone()),
    };
    let dest_pod = format!("claimshift-dst-{}", request.source_claim);
    TransferSession {
        direction,
        source_claim,
        dest_claim,
        source_pod: format!("claimshift-src-{}", request.source_claim),
        secret_name: format!("{dest_pod}-credential"),
        dest_pod,
    }
}

#[derive(Clone)]
pub struct TransferLauncher {
    cluster: Arc<dyn Cluster>,
    poller: ReadinessPoller,
    image: String,
    source_ready_timeout: Duration,
}

impl TransferLauncher {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        poller: ReadinessPoller,
        image: impl Into<String>,
        source_ready_timeout: Duration,
    ) -> Self {
        Self {
            cluster,
            poller,
            image: image.into(),
            source_ready_timeout,
        }
    }

    // Starts the source, waits for it to serve, then starts the destination
    // against its address. Returns the source status observed at launch.
    pub async fn launch(
        &self,
        request: &MigrationRequest,
        session: &TransferSession,
        credential: &Credential,
    ) -> Result<PodStatus> {
        let namespace = request.namespace.as_str();
        self.teardown(namespace, session).await?;

        self.cluster
            .create_secret(&secret_manifest(request, session, credential))
            .await?;
        self.create_pod(&self.source_manifest(request, session)).await?;
        info!(
            pod = %session.source_pod,
            claim = %session.source_claim,
            direction = %session.direction,
            "launched transfer source"
        );

        let source = self
            .poller
            .await_phase(
                self.cluster.as_ref(),
                namespace,
                &session.source_pod,
                PodPhase::Running,
                self.source_ready_timeout,
            )
            .await?;
        let address = source.pod_ip.clone().ok_or_else(|| {
            ShiftError::Transient(format!("source pod {} has no address yet", session.source_pod))
        })?;

        self.create_pod(&self.destination_manifest(request, session, &address))
            .await?;
        info!(
            pod = %session.dest_pod,
            claim = %session.dest_claim,
            source_addr = %address,
            bandwidth_limit_kbs = request.bandwidth_limit_kbs,
            "launched transfer destination"
        );
        Ok(source)
    }

    pub async fn await_completion(
        &self,
        namespace: &str,
        session: &TransferSession,
        source: &PodStatus,
        deadline: Duration,
    ) -> Result<PodStatus> {
        let status = self
            .poller
            .await_phase(
                self.cluster.as_ref(),
                namespace,
                &session.dest_pod,
                PodPhase::Succeeded,
                deadline,
            )
            .await?;
        self.verify_source(namespace, session, source).await?;
        Ok(status)
    }

    pub async fn verify_source(
        &self,
        namespace: &str,
        session: &TransferSession,
        launched: &PodStatus,
    ) -> Result<()> {
        let current = self.cluster.pod_status(namespace, &session.source_pod).await?;
        let unchanged = current
            .as_ref()
            .is_some_and(|status| status.uid == launched.uid && status.pod_ip == launched.pod_ip);
        if !unchanged {
            return Err(ShiftError::SourceReplaced {
                pod: session.source_pod.clone(),
            });
        }
        Ok(())
    }

    pub async fn collect_logs(&self, namespace: &str, session: &TransferSession) {
        for pod in [&session.source_pod, &session.dest_pod] {
            match self.cluster.pod_logs(namespace, pod).await {
                Ok(logs) => {
                    for line in logs.lines().filter(|line| !line.trim().is_empty()) {
                        info!(pod = %pod, "{line}");
                    }
                }
                Err(err) => warn!(pod = %pod, error = %err, "failed to fetch transfer logs"),
            }
        }
    }

    pub async fn teardown(&self, namespace: &str, session: &TransferSession) -> Result<()> {
        ignore_not_found(self.cluster.delete_pod(namespace, &session.dest_pod).await)?;
        ignore_not_found(self.cluster.delete_pod(namespace, &session.source_pod).await)?;
        ignore_not_found(
            self.cluster
                .delete_secret(namespace, &session.secret_name)
                .await,
        )
    }

    async fn create_pod(&self, manifest: &PodManifest) -> Result<()> {
        match self.cluster.create_pod(manifest).await {
            Err(ShiftError::AlreadyExists { name, .. }) => Err(ShiftError::Transient(format!(
                "pod {name} is still terminating"
            ))),
            other => other,
        }
    }

    pub fn source_manifest(&self, request: &MigrationRequest, session: &TransferSession) -> PodManifest {
        let port = request.transfer_port;
        let script = [
            "set -e".to_string(),
            "apk add --no-cache openssh rsync".to_string(),
            "echo \"$SSH_USER:$SSH_PASSWORD\" | chpasswd".to_string(),
            "echo 'PermitRootLogin yes' >> /etc/ssh/sshd_config".to_string(),
            "echo 'PasswordAuthentication yes' >> /etc/ssh/sshd_config".to_string(),
            "ssh-keygen -A".to_string(),
            format!("exec /usr/sbin/sshd -D -e -p {port}"),
        ]
        .join("\n");

        PodManifest {
            name: session.source_pod.clone(),
            namespace: request.namespace.clone(),
            role: PodRole::Source,
            container: SOURCE_CONTAINER.to_string(),
            image: self.image.clone(),
            command: shell(),
            script,
            env: vec![
                EnvVar::from_secret("SSH_USER", &session.secret_name, USERNAME_KEY),
                EnvVar::from_secret("SSH_PASSWORD", &session.secret_name, PASSWORD_KEY),
            ],
            claim: session.source_claim.clone(),
            mount_path: MOUNT_PATH.to_string(),
            port: Some(port),
            restart_policy: RestartPolicy::Always,
            labels: session_labels(request, session, PodRole::Source),
        }
    }

    pub fn destination_manifest(
        &self,
        request: &MigrationRequest,
        session: &TransferSession,
        source_addr: &str,
    ) -> PodManifest {
        let script = [
            "set -e".to_string(),
            "apk add --no-cache rsync openssh-client sshpass".to_string(),
            format!(
                "sshpass -e rsync -aHAXSc --delete --bwlimit={kbs} --progress \
                 -e \"ssh -p {port} -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null\" \
                 \"$SSH_USER@$SOURCE_ADDR:{MOUNT_PATH}/\" {MOUNT_PATH}/",
                kbs = request.bandwidth_limit_kbs,
                port = request.transfer_port,
            ),
        ]
        .join("\n");

        PodManifest {
            name: session.dest_pod.clone(),
            namespace: request.namespace.clone(),
            role: PodRole::Destination,
            container: DESTINATION_CONTAINER.to_string(),
            image: self.image.clone(),
            command: shell(),
            script,
            env: vec![
                EnvVar::from_secret("SSH_USER", &session.secret_name, USERNAME_KEY),
                EnvVar::from_secret("SSHPASS", &session.secret_name, PASSWORD_KEY),
                EnvVar::literal("SOURCE_ADDR", source_addr),
            ],
            claim: session.dest_claim.clone(),
            mount_path: MOUNT_PATH.to_string(),
            port: None,
            restart_policy: RestartPolicy::Never,
            labels: session_labels(request, session, PodRole::Destination),
        }
    }
}

pub fn secret_manifest(
    request: &MigrationRequest,
    session: &TransferSession,
    credential: &Credential,
) -> SecretManifest {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(CLAIM_LABEL.to_string(), request.source_claim.clone());
    labels.insert(DIRECTION_LABEL.to_string(), session.direction.as_str().to_string());

    let data = BTreeMap::from([
        (USERNAME_KEY.to_string(), credential.username.clone()),
        (PASSWORD_KEY.to_string(), credential.secret.clone()),
    ]);
    SecretManifest {
        name: session.secret_name.clone(),
        namespace: request.namespace.clone(),
        data,
        labels,
    }
}

fn session_labels(
    request: &MigrationRequest,
    session: &TransferSession,
    role: PodRole,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (CLAIM_LABEL.to_string(), request.source_claim.clone()),
        (ROLE_LABEL.to_string(), role.as_str().to_string()),
        (DIRECTION_LABEL.to_string(), session.direction.as_str().to_string()),
    ])
}

fn shell() -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string()]
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use claimshift_auth::{CredentialProvider, StaticCredentialProvider};
    use claimshift_cluster::{EnvValue, MemoryCluster, PodApi, RestartPolicy, TransferMode};
    use claimshift_common::error::ShiftError;
    use claimshift_common::types::{ClaimSpec, MigrationRequest, PodPhase, TransferDirection};

    use super::{TransferLauncher, plan_session, secret_manifest};
    use crate::abort::AbortSignal;
    use crate::readiness::ReadinessPoller;

    fn request() -> MigrationRequest {
        MigrationRequest::new("data0", 20, "fast", "default")
            .unwrap()
            .with_bandwidth_limit(5000)
            .unwrap()
            .with_transfer_port(2222)
            .unwrap()
    }

    fn launcher(cluster: Arc<MemoryCluster>) -> TransferLauncher {
        let poller = ReadinessPoller::new(Duration::from_secs(1), AbortSignal::never());
        TransferLauncher::new(cluster, poller, "alpine:latest", Duration::from_secs(30))
    }

    fn claim(name: &str) -> ClaimSpec {
        ClaimSpec {
            name: name.to_string(),
            namespace: "default".to_string(),
            size_gib: 20,
            storage_class: "fast".to_string(),
        }
    }

    #[test]
    fn sessions_swap_claims_but_keep_pod_names() {
        let forward = plan_session(&request(), TransferDirection::Forward);
        let back = plan_session(&request(), TransferDirection::Back);

        assert_eq!(forward.source_claim, "data0");
        assert_eq!(forward.dest_claim, "data0-tmp");
        assert_eq!(back.source_claim, "data0-tmp");
        assert_eq!(back.dest_claim, "data0");
        assert_eq!(forward.source_pod, "claimshift-src-data0");
        assert_eq!(back.dest_pod, "claimshift-dst-data0");
        assert_eq!(back.secret_name, "claimshift-dst-data0-credential");
    }

    #[test]
    fn manifests_carry_port_bandwidth_and_secret_references() {
        let launcher = launcher(Arc::new(MemoryCluster::new()));
        let session = plan_session(&request(), TransferDirection::Forward);

        let source = launcher.source_manifest(&request(), &session);
        assert_eq!(source.port, Some(2222));
        assert_eq!(source.restart_policy, RestartPolicy::Always);
        assert!(source.script.contains("sshd -D -e -p 2222"));
        assert!(source.script.contains("PermitRootLogin yes"));
        assert_eq!(source.labels["claimshift.io/role"], "source");
        assert_eq!(source.labels["claimshift.io/direction"], "forward");

        let dest = launcher.destination_manifest(&request(), &session, "10.0.0.7");
        assert_eq!(dest.claim, "data0-tmp");
        assert_eq!(dest.restart_policy, RestartPolicy::Never);
        assert!(dest.script.contains("--bwlimit=5000"));
        assert!(dest.script.contains("ssh -p 2222"));
        assert!(dest.script.contains("rsync -aHAXSc --delete"));
        assert_eq!(dest.literal_env("SOURCE_ADDR"), Some("10.0.0.7"));
        assert!(dest.env.iter().any(|var| var.name == "SSHPASS"
            && var.value
                == EnvValue::SecretKey {
                    secret: "claimshift-dst-data0-credential".to_string(),
                    key: "password".to_string(),
                }));
    }

    #[test]
    fn secrets_never_leak_into_scripts() {
        let launcher = launcher(Arc::new(MemoryCluster::new()));
        let session = plan_session(&request(), TransferDirection::Back);
        let credential = StaticCredentialProvider::new("root", "s3cr3t-s3cr3t")
            .issue()
            .unwrap();

        let secret = secret_manifest(&request(), &session, &credential);
        assert_eq!(secret.data["password"], "s3cr3t-s3cr3t");
        assert_eq!(secret.data["username"], "root");

        let source = launcher.source_manifest(&request(), &session);
        let dest = launcher.destination_manifest(&request(), &session, "10.0.0.7");
        assert!(!source.script.contains("s3cr3t"));
        assert!(!dest.script.contains("s3cr3t"));
    }

    #[tokio::test(start_paused = true)]
    async fn launch_runs_source_then_destination() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_claim(claim("data0"), [("a".to_string(), b"1".to_vec())].into());
        cluster.add_claim(claim("data0-tmp"), Default::default());
        let launcher = launcher(cluster.clone());
        let session = plan_session(&request(), TransferDirection::Forward);
        let credential = StaticCredentialProvider::new("root", "s3cr3t-s3cr3t")
            .issue()
            .unwrap();

        let source = launcher.launch(&request(), &session, &credential).await.unwrap();
        assert_eq!(source.phase, PodPhase::Running);
        let dest = launcher
            .await_completion("default", &session, &source, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(dest.phase, PodPhase::Succeeded);
        assert_eq!(
            cluster.claim_files("default", "data0-tmp"),
            cluster.claim_files("default", "data0")
        );

        launcher.teardown("default", &session).await.unwrap();
        assert!(cluster.pod_names("default").is_empty());
        assert!(cluster.secret_names("default").is_empty());
        launcher.teardown("default", &session).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn destination_waits_for_a_ready_source() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.set_source_warmup_reads(3);
        cluster.add_claim(claim("data0"), [("a".to_string(), b"1".to_vec())].into());
        cluster.add_claim(
            claim("data0-tmp"),
            [("stale".to_string(), b"0".to_vec())].into(),
        );
        let launcher = launcher(cluster.clone());
        let session = plan_session(&request(), TransferDirection::Forward);
        let credential = StaticCredentialProvider::new("root", "s3cr3t-s3cr3t")
            .issue()
            .unwrap();

        let source = launcher.launch(&request(), &session, &credential).await.unwrap();
        assert!(source.ready);
        launcher
            .await_completion("default", &session, &source, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            cluster.claim_files("default", "data0-tmp"),
            cluster.claim_files("default", "data0")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_source_is_detected() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.set_transfer_mode(TransferMode::ReplaceSource);
        cluster.add_claim(claim("data0"), Default::default());
        cluster.add_claim(claim("data0-tmp"), Default::default());
        let launcher = launcher(cluster.clone());
        let session = plan_session(&request(), TransferDirection::Forward);
        let credential = StaticCredentialProvider::new("root", "s3cr3t-s3cr3t")
            .issue()
            .unwrap();

        let source = launcher.launch(&request(), &session, &credential).await.unwrap();
        let err = launcher
            .await_completion("default", &session, &source, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, ShiftError::SourceReplaced { pod } if pod == "claimshift-src-data0"));
        assert!(cluster.pod_status("default", "claimshift-src-data0").await.unwrap().is_some());
    }
}
