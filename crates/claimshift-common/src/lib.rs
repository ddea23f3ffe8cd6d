pub mod error;
pub mod types;

pub use error::{ErrorClass, Result, ShiftError};
pub use types::{
    ClaimSpec, MigrationRequest, PodPhase, PodRole, TransferDirection, TransferSession,
    WorkloadKind, WorkloadReference,
};
