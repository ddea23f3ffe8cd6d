use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use claimshift_cluster::Cluster;
use claimshift_common::error::{Result, ShiftError};
use claimshift_common::types::{MigrationRequest, TransferDirection};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::workload::Discovered;

pub fn record_name(claim: &str) -> String {
    format!("claimshift-{claim}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MigrationState {
    Discover,
    Quiesce,
    ProvisionTemp,
    CopyForward,
    AwaitForward,
    CleanupForward,
    RecreateOriginal,
    CopyBack,
    AwaitBack,
    CleanupBack,
    Resume,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    Copy,
    Await,
    Cleanup,
}

impl MigrationState {
    pub fn next(self) -> Self {
        match self {
            Self::Discover => Self::Quiesce,
            Self::Quiesce => Self::ProvisionTemp,
            Self::ProvisionTemp => Self::CopyForward,
            Self::CopyForward => Self::AwaitForward,
            Self::AwaitForward => Self::CleanupForward,
            Self::CleanupForward => Self::RecreateOriginal,
            Self::RecreateOriginal => Self::CopyBack,
            Self::CopyBack => Self::AwaitBack,
            Self::AwaitBack => Self::CleanupBack,
            Self::CleanupBack => Self::Resume,
            Self::Resume | Self::Done => Self::Done,
        }
    }

    pub fn round(self) -> Option<(TransferDirection, RoundPhase)> {
        match self {
            Self::CopyForward => Some((TransferDirection::Forward, RoundPhase::Copy)),
            Self::AwaitForward => Some((TransferDirection::Forward, RoundPhase::Await)),
            Self::CleanupForward => Some((TransferDirection::Forward, RoundPhase::Cleanup)),
            Self::CopyBack => Some((TransferDirection::Back, RoundPhase::Copy)),
            Self::AwaitBack => Some((TransferDirection::Back, RoundPhase::Await)),
            Self::CleanupBack => Some((TransferDirection::Back, RoundPhase::Cleanup)),
            _ => None,
        }
    }

    pub fn direction(self) -> Option<TransferDirection> {
        self.round().map(|(direction, _)| direction)
    }

    pub fn copy(direction: TransferDirection) -> Self {
        match direction {
            TransferDirection::Forward => Self::CopyForward,
            TransferDirection::Back => Self::CopyBack,
        }
    }

    // Transfers cannot be resumed mid-copy; the pods are relaunched.
    pub fn restart_point(self) -> Self {
        match self {
            Self::AwaitForward => Self::CopyForward,
            Self::AwaitBack => Self::CopyBack,
            other => other,
        }
    }

    // True while the canonical claim still holds the pre-migration data.
    pub fn original_data_intact(self) -> bool {
        self <= Self::CleanupForward
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "Discover",
            Self::Quiesce => "Quiesce",
            Self::ProvisionTemp => "ProvisionTemp",
            Self::CopyForward => "CopyForward",
            Self::AwaitForward => "AwaitForward",
            Self::CleanupForward => "CleanupForward",
            Self::RecreateOriginal => "RecreateOriginal",
            Self::CopyBack => "CopyBack",
            Self::AwaitBack => "AwaitBack",
            Self::CleanupBack => "CleanupBack",
            Self::Resume => "Resume",
            Self::Done => "Done",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub request: MigrationRequest,
    pub state: MigrationState,
    #[serde(default)]
    pub discovered: Option<Discovered>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<RecordedError>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn new(request: MigrationRequest) -> Self {
        let now = Utc::now();
        Self {
            request,
            state: MigrationState::Discover,
            discovered: None,
            attempts: 1,
            last_error: None,
            started_at: now,
            updated_at: now,
        }
    }

    // Claim, namespace, size and class must agree; transfer tuning may
    // change between attempts.
    pub fn matches(&self, request: &MigrationRequest) -> bool {
        self.request.source_claim == request.source_claim
            && self.request.namespace == request.namespace
            && self.request.target_size_gib == request.target_size_gib
            && self.request.storage_class == request.storage_class
    }

    pub fn resumed(mut self, request: &MigrationRequest) -> Self {
        self.request = request.clone();
        self.state = self.state.restart_point();
        self.attempts = self.attempts.saturating_add(1);
        self.updated_at = Utc::now();
        self
    }

    pub fn advance(&mut self) {
        self.state = self.state.next();
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, err: &ShiftError) {
        self.last_error = Some(RecordedError {
            code: err.code().to_string(),
            message: err.to_string(),
        });
        self.updated_at = Utc::now();
    }

    pub fn rewind(&mut self) {
        self.state = MigrationState::Discover;
        self.updated_at = Utc::now();
    }
}

#[derive(Clone)]
pub struct RecordStore {
    cluster: Arc<dyn Cluster>,
    namespace: String,
    name: String,
}

impl RecordStore {
    pub fn new(cluster: Arc<dyn Cluster>, request: &MigrationRequest) -> Self {
        Self {
            cluster,
            namespace: request.namespace.clone(),
            name: record_name(&request.source_claim),
        }
    }

    pub async fn load(&self, request: &MigrationRequest) -> Result<Option<MigrationRecord>> {
        let Some(payload) = self.cluster.load_record(&self.namespace, &self.name).await? else {
            return Ok(None);
        };
        let record: MigrationRecord = serde_json::from_str(&payload)?;
        if !record.matches(request) {
            return Err(ShiftError::RecordMismatch {
                claim: request.source_claim.clone(),
            });
        }
        Ok(Some(record))
    }

    pub async fn save(&self, record: &MigrationRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        self.cluster
            .store_record(&self.namespace, &self.name, &payload)
            .await?;
        debug!(record = %self.name, state = %record.state, "stored migration record");
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        self.cluster.delete_record(&self.namespace, &self.name).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use claimshift_cluster::MemoryCluster;
    use claimshift_common::error::ShiftError;
    use claimshift_common::types::{MigrationRequest, TransferDirection};

    use super::{MigrationRecord, MigrationState, RecordStore, RoundPhase};

    fn request() -> MigrationRequest {
        MigrationRequest::new("data0", 20, "fast", "default").unwrap()
    }

    #[test]
    fn states_run_in_order_and_end_at_done() {
        let mut state = MigrationState::Discover;
        let mut seen = vec![state];
        while state != MigrationState::Done {
            state = state.next();
            seen.push(state);
        }
        assert_eq!(seen.len(), 12);
        assert_eq!(MigrationState::Done.next(), MigrationState::Done);
        assert_eq!(
            MigrationState::AwaitBack.round(),
            Some((TransferDirection::Back, RoundPhase::Await))
        );
        assert_eq!(MigrationState::RecreateOriginal.direction(), None);
    }

    #[test]
    fn await_states_restart_from_copy() {
        assert_eq!(MigrationState::AwaitForward.restart_point(), MigrationState::CopyForward);
        assert_eq!(MigrationState::AwaitBack.restart_point(), MigrationState::CopyBack);
        assert_eq!(
            MigrationState::RecreateOriginal.restart_point(),
            MigrationState::RecreateOriginal
        );
    }

    #[test]
    fn original_data_is_intact_until_forward_cleanup_finishes() {
        assert!(MigrationState::Quiesce.original_data_intact());
        assert!(MigrationState::CleanupForward.original_data_intact());
        assert!(!MigrationState::RecreateOriginal.original_data_intact());
        assert!(!MigrationState::Resume.original_data_intact());
    }

    #[tokio::test]
    async fn records_persist_and_reject_other_requests() {
        let cluster = Arc::new(MemoryCluster::new());
        let store = RecordStore::new(cluster.clone(), &request());

        let mut record = MigrationRecord::new(request());
        record.advance();
        record.fail(&ShiftError::Transient("etcd leader changed".to_string()));
        store.save(&record).await.unwrap();
        assert!(cluster.record("default", "claimshift-data0").is_some());

        let loaded = store.load(&request()).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.last_error.unwrap().code, "Transient");

        let retuned = request().with_bandwidth_limit(100).unwrap();
        assert!(store.load(&retuned).await.unwrap().is_some());

        let bigger = MigrationRequest::new("data0", 40, "fast", "default").unwrap();
        let err = store.load(&bigger).await.unwrap_err();
        assert!(matches!(err, ShiftError::RecordMismatch { .. }));

        store.delete().await.unwrap();
        assert!(store.load(&request()).await.unwrap().is_none());
    }
}
