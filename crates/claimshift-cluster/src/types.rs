use std::{collections::BTreeMap, fmt};

use claimshift_common::types::{ClaimSpec, PodPhase, PodRole};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "claimshift";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
    pub controller: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSummary {
    pub name: String,
    pub claims: Vec<String>,
    pub owners: Vec<OwnerRef>,
}

impl PodSummary {
    pub fn mounts_claim(&self, claim: &str) -> bool {
        self.claims.iter().any(|name| name == claim)
    }

    pub fn controller(&self) -> Option<&OwnerRef> {
        self.owners
            .iter()
            .find(|owner| owner.controller)
            .or_else(|| self.owners.first())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodStatus {
    pub phase: PodPhase,
    // The pod's Ready condition; set once its readiness check passes.
    pub ready: bool,
    pub pod_ip: Option<String>,
    pub uid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimState {
    pub spec: ClaimSpec,
    // Deletion was requested but finalizers still hold the object.
    pub terminating: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    Never,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::Never => "Never",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    Literal(String),
    SecretKey { secret: String, key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: EnvValue,
}

impl EnvVar {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: EnvValue::Literal(value.into()),
        }
    }

    pub fn from_secret(
        name: impl Into<String>,
        secret: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: EnvValue::SecretKey {
                secret: secret.into(),
                key: key.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodManifest {
    pub name: String,
    pub namespace: String,
    pub role: PodRole,
    pub container: String,
    pub image: String,
    pub command: Vec<String>,
    pub script: String,
    pub env: Vec<EnvVar>,
    pub claim: String,
    pub mount_path: String,
    pub port: Option<u16>,
    pub restart_policy: RestartPolicy,
    pub labels: BTreeMap<String, String>,
}

impl PodManifest {
    pub fn literal_env(&self, name: &str) -> Option<&str> {
        self.env.iter().find_map(|var| match &var.value {
            EnvValue::Literal(value) if var.name == name => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn secret_refs(&self) -> impl Iterator<Item = &str> {
        self.env.iter().filter_map(|var| match &var.value {
            EnvValue::SecretKey { secret, .. } => Some(secret.as_str()),
            EnvValue::Literal(_) => None,
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SecretManifest {
    pub name: String,
    pub namespace: String,
    pub data: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl fmt::Debug for SecretManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretManifest")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .field("labels", &self.labels)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired,
    HeldBy(String),
}
