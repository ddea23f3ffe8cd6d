use std::{process::ExitCode, sync::Arc};

use clap::{CommandFactory, Parser, error::ErrorKind};
use claimshift_auth::{CredentialProvider, RandomCredentialProvider};
use claimshift_cluster::{Cluster, KubeCluster};
use claimshift_common::ShiftError;
use claimshift_common::types::{DEFAULT_BANDWIDTH_LIMIT_KBS, DEFAULT_TRANSFER_PORT, MigrationRequest};
use claimshift_migrate::{MigrationSettings, Orchestrator, abort_channel};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "claimshift",
    version,
    about = "Resize or reclass a persistent volume claim by copying it through a temporary claim"
)]
struct Cli {
    /// Claim to migrate
    #[arg(long = "old-pvc")]
    old_pvc: String,

    /// Target size in GiB
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    size: u64,

    #[arg(long)]
    storage_class: String,

    #[arg(long)]
    namespace: String,

    /// rsync bandwidth limit in KB/s
    #[arg(long, default_value_t = DEFAULT_BANDWIDTH_LIMIT_KBS)]
    bwlimit: u32,

    #[arg(long, default_value_t = DEFAULT_TRANSFER_PORT)]
    ssh_port: u16,

    /// Allow deleting a DaemonSet that mounts the claim; it is not recreated
    #[arg(long, default_value_t = false)]
    allow_daemonset_delete: bool,
}

impl Cli {
    fn request(&self) -> claimshift_common::Result<MigrationRequest> {
        Ok(MigrationRequest::new(
            self.old_pvc.as_str(),
            self.size,
            self.storage_class.as_str(),
            self.namespace.as_str(),
        )?
        .with_bandwidth_limit(self.bwlimit)?
        .with_transfer_port(self.ssh_port)?
        .allow_daemonset_delete(self.allow_daemonset_delete))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    let request = match cli.request() {
        Ok(request) => request,
        Err(err @ ShiftError::InvalidArgument(_)) => {
            eprintln!("error: {err}\n\n{}", usage());
            return ExitCode::FAILURE;
        }
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = init_tracing() {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    match run(request).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("claimshift failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn usage() -> String {
    Cli::command().render_usage().to_string()
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = EnvFilter::from_default_env().add_directive("claimshift=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    Ok(())
}

async fn run(request: MigrationRequest) -> anyhow::Result<()> {
    let settings = MigrationSettings::from_env()?;
    let cluster: Arc<dyn Cluster> = Arc::new(KubeCluster::try_default().await?);
    let credentials: Arc<dyn CredentialProvider> = Arc::new(RandomCredentialProvider::default());

    let (abort_handle, abort) = abort_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; aborting migration");
            abort_handle.abort();
        }
    });

    info!(
        claim = %request.source_claim,
        namespace = %request.namespace,
        size_gib = request.target_size_gib,
        storage_class = %request.storage_class,
        bandwidth_limit_kbs = request.bandwidth_limit_kbs,
        transfer_port = request.transfer_port,
        "starting claim migration"
    );
    let claim = request.source_claim.clone();
    let orchestrator = Orchestrator::new(cluster, request, settings, credentials, abort);
    let record = orchestrator.run().await?;
    info!(
        claim = %claim,
        attempts = record.attempts,
        "claim migrated"
    );
    Ok(())
}
