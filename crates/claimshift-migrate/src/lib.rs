pub mod abort;
pub mod lease;
pub mod orchestrator;
pub mod provisioner;
pub mod readiness;
pub mod retry;
pub mod settings;
pub mod status;
pub mod transfer;
pub mod workload;

pub use abort::{AbortHandle, AbortSignal, abort_channel};
pub use lease::{ClaimLease, lease_name};
pub use orchestrator::Orchestrator;
pub use provisioner::VolumeProvisioner;
pub use readiness::ReadinessPoller;
pub use retry::RetryPolicy;
pub use settings::MigrationSettings;
pub use status::{MigrationRecord, MigrationState, RecordStore, record_name};
pub use transfer::{TransferLauncher, plan_session};
pub use workload::{Discovered, WorkloadAdapter};
