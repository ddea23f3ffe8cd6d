use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

#[derive(Debug, Error)]
pub enum ShiftError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("transient cluster error: {0}")]
    Transient(String),
    #[error("claim {claim} is used by more than one workload: {}", owners.join(", "))]
    MultipleOwners { claim: String, owners: Vec<String> },
    #[error("refusing to delete daemonset {name} without explicit opt-in")]
    DaemonSetDeletionRefused { name: String },
    #[error("transfer pod {pod} failed")]
    TransferFailed { pod: String },
    #[error("source pod {pod} was replaced while the transfer was running")]
    SourceReplaced { pod: String },
    #[error("timed out waiting for {kind} {name} to become {state}")]
    TimedOut {
        kind: &'static str,
        name: String,
        state: String,
    },
    #[error("migration lease for claim {claim} is held by {holder}")]
    LeaseHeld { claim: String, holder: String },
    #[error("lost the migration lease for claim {claim}")]
    LeaseLost { claim: String },
    #[error("stored migration record for claim {claim} does not match the request")]
    RecordMismatch { claim: String },
    #[error("migration aborted")]
    Aborted,
    #[error("internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl ShiftError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::AlreadyExists { .. } => "AlreadyExists",
            Self::NotFound { .. } => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::Unauthorized(_) => "Unauthorized",
            Self::Transient(_) => "Transient",
            Self::MultipleOwners { .. } => "MultipleOwners",
            Self::DaemonSetDeletionRefused { .. } => "DaemonSetDeletionRefused",
            Self::TransferFailed { .. } => "TransferFailed",
            Self::SourceReplaced { .. } => "SourceReplaced",
            Self::TimedOut { .. } => "TimedOut",
            Self::LeaseHeld { .. } => "LeaseHeld",
            Self::LeaseLost { .. } => "LeaseLost",
            Self::RecordMismatch { .. } => "RecordMismatch",
            Self::Aborted => "Aborted",
            Self::InternalError(_) => "InternalError",
            Self::Serialization(_) => "InternalError",
        }
    }
}

pub type Result<T> = std::result::Result<T, ShiftError>;

#[cfg(test)]
mod tests {
    use super::{ErrorClass, ShiftError};

    #[test]
    fn only_transient_errors_are_retryable() {
        assert_eq!(
            ShiftError::Transient("503".to_string()).class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            ShiftError::Conflict("resource version".to_string()).class(),
            ErrorClass::Fatal
        );
        assert!(!ShiftError::TransferFailed { pod: "dst".to_string() }.is_retryable());
        assert!(!ShiftError::LeaseLost { claim: "data0".to_string() }.is_retryable());
    }

    #[test]
    fn timeouts_name_the_object_and_state() {
        let err = ShiftError::TimedOut {
            kind: "claim",
            name: "data0".to_string(),
            state: "released".to_string(),
        };
        assert_eq!(err.to_string(), "timed out waiting for claim data0 to become released");
        assert_eq!(err.code(), "TimedOut");
    }

    #[test]
    fn multiple_owners_lists_every_owner() {
        let err = ShiftError::MultipleOwners {
            claim: "data0".to_string(),
            owners: vec!["Deployment/app0".to_string(), "StatefulSet/db".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "claim data0 is used by more than one workload: Deployment/app0, StatefulSet/db"
        );
        assert_eq!(err.code(), "MultipleOwners");
    }
}
