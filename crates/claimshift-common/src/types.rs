use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShiftError};

pub const GIB: u64 = 1 << 30;
pub const TEMP_CLAIM_SUFFIX: &str = "-tmp";
pub const DEFAULT_BANDWIDTH_LIMIT_KBS: u32 = 10240;
pub const DEFAULT_TRANSFER_PORT: u16 = 19022;

const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub source_claim: String,
    pub target_size_gib: u64,
    pub storage_class: String,
    pub namespace: String,
    pub bandwidth_limit_kbs: u32,
    pub transfer_port: u16,
    #[serde(default)]
    pub allow_daemonset_delete: bool,
}

impl MigrationRequest {
    pub fn new(
        source_claim: impl Into<String>,
        target_size_gib: u64,
        storage_class: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Result<Self> {
        let request = Self {
            source_claim: source_claim.into(),
            target_size_gib,
            storage_class: storage_class.into(),
            namespace: namespace.into(),
            bandwidth_limit_kbs: DEFAULT_BANDWIDTH_LIMIT_KBS,
            transfer_port: DEFAULT_TRANSFER_PORT,
            allow_daemonset_delete: false,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn with_bandwidth_limit(mut self, kbs: u32) -> Result<Self> {
        if kbs == 0 {
            return Err(ShiftError::InvalidArgument(
                "bandwidth limit must be greater than zero".to_string(),
            ));
        }
        self.bandwidth_limit_kbs = kbs;
        Ok(self)
    }

    pub fn with_transfer_port(mut self, port: u16) -> Result<Self> {
        if port == 0 {
            return Err(ShiftError::InvalidArgument(
                "transfer port must be greater than zero".to_string(),
            ));
        }
        self.transfer_port = port;
        Ok(self)
    }

    pub fn allow_daemonset_delete(mut self, allow: bool) -> Self {
        self.allow_daemonset_delete = allow;
        self
    }

    pub fn temp_claim(&self) -> String {
        format!("{}{TEMP_CLAIM_SUFFIX}", self.source_claim)
    }

    pub fn validate(&self) -> Result<()> {
        validate_dns_label("namespace", &self.namespace)?;
        validate_dns_label("claim", &self.source_claim)?;
        validate_dns_label("temporary claim", &self.temp_claim())?;
        if self.storage_class.trim().is_empty() {
            return Err(ShiftError::InvalidArgument(
                "storage class cannot be empty".to_string(),
            ));
        }
        if self.target_size_gib == 0 {
            return Err(ShiftError::InvalidArgument(
                "target size must be greater than zero".to_string(),
            ));
        }
        if self.target_size_gib > u64::MAX / GIB {
            return Err(ShiftError::InvalidArgument(format!(
                "target size is too large: {} GiB",
                self.target_size_gib
            )));
        }
        if self.bandwidth_limit_kbs == 0 {
            return Err(ShiftError::InvalidArgument(
                "bandwidth limit must be greater than zero".to_string(),
            ));
        }
        if self.transfer_port == 0 {
            return Err(ShiftError::InvalidArgument(
                "transfer port must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_dns_label(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ShiftError::InvalidArgument(format!("{what} name cannot be empty")));
    }
    if value.len() > MAX_LABEL_LEN {
        return Err(ShiftError::InvalidArgument(format!(
            "{what} name is longer than {MAX_LABEL_LEN} characters: {value}"
        )));
    }
    let valid_chars = value
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    let valid_edges = !value.starts_with('-') && !value.ends_with('-');
    if !valid_chars || !valid_edges {
        return Err(ShiftError::InvalidArgument(format!(
            "{what} name is not a valid DNS-1123 label: {value}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Unknown(String),
}

impl WorkloadKind {
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "Deployment" => Self::Deployment,
            "StatefulSet" => Self::StatefulSet,
            "DaemonSet" => Self::DaemonSet,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::DaemonSet => "DaemonSet",
            Self::Unknown(kind) => kind.as_str(),
        }
    }

    pub fn has_replicas(&self) -> bool {
        matches!(self, Self::Deployment | Self::StatefulSet)
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadReference {
    pub kind: WorkloadKind,
    pub name: String,
    pub namespace: String,
}

impl fmt::Display for WorkloadReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSpec {
    pub name: String,
    pub namespace: String,
    pub size_gib: u64,
    pub storage_class: String,
}

impl ClaimSpec {
    pub fn size_bytes(&self) -> u64 {
        self.size_gib.saturating_mul(GIB)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodRole {
    Source,
    Destination,
}

impl PodRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Destination => "destination",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Forward,
    Back,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Back => "back",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    pub direction: TransferDirection,
    pub source_claim: String,
    pub dest_claim: String,
    pub source_pod: String,
    pub dest_pod: String,
    pub secret_name: String,
}

#[cfg(test)]
mod tests {
    use super::{ClaimSpec, GIB, MigrationRequest, PodPhase, WorkloadKind};

    #[test]
    fn request_derives_temp_claim_and_size() {
        let request = MigrationRequest::new("data0", 20, "fast", "default").unwrap();
        assert_eq!(request.temp_claim(), "data0-tmp");
        assert_eq!(request.bandwidth_limit_kbs, 10240);
        assert_eq!(request.transfer_port, 19022);

        let claim = ClaimSpec {
            name: request.temp_claim(),
            namespace: request.namespace.clone(),
            size_gib: request.target_size_gib,
            storage_class: request.storage_class.clone(),
        };
        assert_eq!(claim.size_bytes(), 20 * GIB);
    }

    #[test]
    fn request_rejects_bad_input() {
        assert!(MigrationRequest::new("", 20, "fast", "default").is_err());
        assert!(MigrationRequest::new("data0", 0, "fast", "default").is_err());
        assert!(MigrationRequest::new("data0", 20, " ", "default").is_err());
        assert!(MigrationRequest::new("data0", 20, "fast", "").is_err());
        assert!(MigrationRequest::new("Data0", 20, "fast", "default").is_err());
        assert!(MigrationRequest::new("-data0", 20, "fast", "default").is_err());

        let long_name = "a".repeat(60);
        assert!(MigrationRequest::new(long_name, 20, "fast", "default").is_err());

        let request = MigrationRequest::new("data0", 20, "fast", "default").unwrap();
        assert!(request.clone().with_bandwidth_limit(0).is_err());
        assert!(request.with_transfer_port(0).is_err());
    }

    #[test]
    fn workload_kind_round_trips_names() {
        assert_eq!(WorkloadKind::from_kind("StatefulSet"), WorkloadKind::StatefulSet);
        assert_eq!(
            WorkloadKind::from_kind("Job"),
            WorkloadKind::Unknown("Job".to_string())
        );
        assert_eq!(WorkloadKind::from_kind("Job").as_str(), "Job");
        assert!(!WorkloadKind::DaemonSet.has_replicas());
    }

    #[test]
    fn unknown_phase_strings_map_to_unknown() {
        assert_eq!(PodPhase::parse("Succeeded"), PodPhase::Succeeded);
        assert_eq!(PodPhase::parse("Evicted"), PodPhase::Unknown);
        assert!(PodPhase::Failed.is_terminal());
        assert!(!PodPhase::Running.is_terminal());
    }
}
