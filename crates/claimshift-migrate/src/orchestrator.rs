use std::sync::Arc;

use claimshift_auth::{Credential, CredentialProvider};
use claimshift_cluster::{Cluster, PodStatus};
use claimshift_common::error::{Result, ShiftError};
use claimshift_common::types::{ClaimSpec, MigrationRequest, TransferDirection, TransferSession};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::abort::{AbortHandle, AbortSignal};
use crate::lease::ClaimLease;
use crate::provisioner::VolumeProvisioner;
use crate::readiness::ReadinessPoller;
use crate::retry::RetryPolicy;
use crate::settings::MigrationSettings;
use crate::status::{MigrationRecord, MigrationState, RecordStore, RoundPhase};
use crate::transfer::{TransferLauncher, plan_session};
use crate::workload::WorkloadAdapter;

pub struct Orchestrator {
    cluster: Arc<dyn Cluster>,
    request: MigrationRequest,
    settings: MigrationSettings,
    credentials: Arc<dyn CredentialProvider>,
    abort: AbortSignal,
    lease_lost: AbortHandle,
    retry: RetryPolicy,
    workloads: WorkloadAdapter,
    provisioner: VolumeProvisioner,
    launcher: TransferLauncher,
    records: RecordStore,
}

impl Orchestrator {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        request: MigrationRequest,
        settings: MigrationSettings,
        credentials: Arc<dyn CredentialProvider>,
        abort: AbortSignal,
    ) -> Self {
        // Every wait observes both the caller's signal and the loss of the lease.
        let (lease_lost, abort) = abort.child();
        let poller = ReadinessPoller::new(settings.poll_interval, abort.clone());
        let launcher = TransferLauncher::new(
            Arc::clone(&cluster),
            poller.clone(),
            settings.transfer_image.clone(),
            settings.source_ready_timeout,
        );
        Self {
            workloads: WorkloadAdapter::new(Arc::clone(&cluster)),
            provisioner: VolumeProvisioner::new(
                Arc::clone(&cluster),
                poller,
                settings.claim_release_timeout,
            ),
            records: RecordStore::new(Arc::clone(&cluster), &request),
            retry: settings.retry_policy(),
            launcher,
            cluster,
            request,
            settings,
            credentials,
            abort,
            lease_lost,
        }
    }

    // Consumes the orchestrator: a lost lease leaves its signal fired for good.
    pub async fn run(self) -> Result<MigrationRecord> {
        self.request.validate()?;
        self.settings.validate()?;

        let holder = format!("claimshift-{}", Uuid::new_v4());
        let lease = ClaimLease::acquire(
            Arc::clone(&self.cluster),
            &self.request.namespace,
            &self.request.source_claim,
            &holder,
            self.settings.lease_duration,
            self.lease_lost.clone(),
        )
        .await?;

        let result = self.migrate(&lease).await;
        if lease.is_lost() {
            return result;
        }
        if let Err(err) = lease.release().await {
            warn!(error = %err, "failed to release migration lease");
        }
        result
    }

    async fn migrate(&self, lease: &ClaimLease) -> Result<MigrationRecord> {
        let (mut record, resuming) = match self.records.load(&self.request).await? {
            Some(stored) => {
                let record = stored.resumed(&self.request);
                info!(
                    claim = %self.request.source_claim,
                    state = %record.state,
                    attempt = record.attempts,
                    "resuming migration from stored record"
                );
                (record, true)
            }
            None => (MigrationRecord::new(self.request.clone()), false),
        };
        let credential = self.credentials.issue()?;

        match self.drive(&mut record, &credential, resuming).await {
            Ok(()) => {
                if let Err(err) = self.records.delete().await {
                    warn!(error = %err, "failed to delete migration record");
                }
                info!(claim = %self.request.source_claim, "migration complete");
                Ok(record)
            }
            // The new holder owns the cluster from here on; nothing is undone
            // and the record is left as last persisted.
            Err(err) if lease.is_lost() => {
                error!(
                    claim = %self.request.source_claim,
                    holder = lease.holder(),
                    state = %record.state,
                    error = %err,
                    "migration lease lost; stopping without compensation"
                );
                Err(ShiftError::LeaseLost {
                    claim: self.request.source_claim.clone(),
                })
            }
            Err(err) => {
                self.compensate(&mut record, &err).await;
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        record: &mut MigrationRecord,
        credential: &Credential,
        resuming: bool,
    ) -> Result<()> {
        loop {
            match (record.state, record.state.direction()) {
                (MigrationState::Done, _) => return Ok(()),
                (_, Some(direction)) => {
                    self.run_round(direction, record, credential, resuming)
                        .await?
                }
                (state, None) => {
                    self.persist(record).await?;
                    info!(claim = %self.request.source_claim, state = %state, "running step");
                    self.step(state, record, resuming).await?;
                    record.advance();
                }
            }
        }
    }

    async fn step(
        &self,
        state: MigrationState,
        record: &mut MigrationRecord,
        resuming: bool,
    ) -> Result<()> {
        let request = &self.request;
        match state {
            MigrationState::Discover => {
                let workloads = &self.workloads;
                let discovered = self
                    .retry
                    .run(&self.abort, state.as_str(), move |_| {
                        workloads.discover(&request.source_claim, &request.namespace)
                    })
                    .await?;
                match discovered {
                    Some(discovered) => {
                        self.workloads
                            .check_quiesce(&discovered, request.allow_daemonset_delete)?;
                        record.discovered = Some(discovered);
                    }
                    // A rerun after the owner was already quiesced away, e.g. a
                    // deleted daemonset, still has to account for it.
                    None => {
                        if let Some(kept) = &record.discovered {
                            warn!(
                                claim = %request.source_claim,
                                workload = %kept.workload,
                                "owner no longer found; keeping the one discovered earlier"
                            );
                        }
                    }
                }
            }
            MigrationState::Quiesce => {
                if let Some(discovered) = &record.discovered {
                    let workloads = &self.workloads;
                    self.retry
                        .run(&self.abort, state.as_str(), move |_| {
                            workloads.quiesce(discovered, request.allow_daemonset_delete)
                        })
                        .await?;
                }
            }
            MigrationState::ProvisionTemp => {
                if resuming {
                    self.reset_temp_claim(state).await?;
                }
                self.provision(state, &self.claim_spec(request.temp_claim()), resuming)
                    .await?;
            }
            MigrationState::RecreateOriginal => {
                self.provision(state, &self.claim_spec(request.source_claim.clone()), resuming)
                    .await?;
            }
            MigrationState::Resume => {
                if let Some(discovered) = &record.discovered {
                    let workloads = &self.workloads;
                    self.retry
                        .run(&self.abort, state.as_str(), move |_| workloads.resume(discovered))
                        .await?;
                }
            }
            other => {
                return Err(ShiftError::InternalError(format!(
                    "state {other} is not a standalone step"
                )));
            }
        }
        Ok(())
    }

    // Launch, await and clean up one transfer session. Both directions share
    // this routine; the record is persisted before each phase.
    async fn run_round(
        &self,
        direction: TransferDirection,
        record: &mut MigrationRecord,
        credential: &Credential,
        resuming: bool,
    ) -> Result<()> {
        let session = plan_session(&self.request, direction);
        let mut source: Option<PodStatus> = None;

        while let Some((round, phase)) = record.state.round() {
            if round != direction {
                break;
            }
            let state = record.state;
            self.persist(record).await?;
            info!(
                claim = %self.request.source_claim,
                state = %state,
                direction = %direction,
                "running transfer phase"
            );

            match phase {
                RoundPhase::Copy => {
                    let launcher = &self.launcher;
                    let request = &self.request;
                    let session = &session;
                    source = Some(
                        self.retry
                            .run(&self.abort, state.as_str(), move |_| {
                                launcher.launch(request, session, credential)
                            })
                            .await?,
                    );
                }
                RoundPhase::Await => {
                    let Some(launched) = source.as_ref() else {
                        record.state = MigrationState::copy(direction);
                        continue;
                    };
                    let launcher = &self.launcher;
                    let namespace = self.request.namespace.as_str();
                    let session = &session;
                    let deadline = self.settings.transfer_timeout;
                    self.retry
                        .run(&self.abort, state.as_str(), move |_| {
                            launcher.await_completion(namespace, session, launched, deadline)
                        })
                        .await?;
                }
                RoundPhase::Cleanup => {
                    self.abort.sleep(self.settings.grace_period).await?;
                    self.launcher
                        .collect_logs(&self.request.namespace, &session)
                        .await;
                    let session = &session;
                    self.retry
                        .run(&self.abort, state.as_str(), move |attempt| {
                            self.cleanup(session, resuming || attempt > 1)
                        })
                        .await?;
                }
            }
            record.advance();
        }
        Ok(())
    }

    async fn cleanup(&self, session: &TransferSession, tolerant: bool) -> Result<()> {
        let namespace = self.request.namespace.as_str();
        self.launcher.teardown(namespace, session).await?;
        if tolerant {
            self.provisioner.retire(namespace, &session.source_claim).await
        } else {
            self.provisioner.delete(namespace, &session.source_claim).await
        }
    }

    // The canonical claim is still intact here, so whatever an earlier run
    // copied into the temporary claim is discarded.
    async fn reset_temp_claim(&self, state: MigrationState) -> Result<()> {
        let provisioner = &self.provisioner;
        let namespace = self.request.namespace.as_str();
        let temp_claim = self.request.temp_claim();
        let temp_claim = temp_claim.as_str();
        self.retry
            .run(&self.abort, state.as_str(), move |_| {
                provisioner.retire(namespace, temp_claim)
            })
            .await
    }

    async fn provision(&self, state: MigrationState, claim: &ClaimSpec, resuming: bool) -> Result<()> {
        let provisioner = &self.provisioner;
        self.retry
            .run(&self.abort, state.as_str(), move |attempt| async move {
                if resuming || attempt > 1 {
                    provisioner.ensure(claim).await
                } else {
                    provisioner.create(claim).await
                }
            })
            .await
    }

    async fn persist(&self, record: &MigrationRecord) -> Result<()> {
        let records = &self.records;
        self.retry
            .run(&self.abort, "persist", move |_| records.save(record))
            .await
    }

    fn claim_spec(&self, name: String) -> ClaimSpec {
        ClaimSpec {
            name,
            namespace: self.request.namespace.clone(),
            size_gib: self.request.target_size_gib,
            storage_class: self.request.storage_class.clone(),
        }
    }

    // Best effort: every failure here is logged and the original error is
    // what the caller sees.
    async fn compensate(&self, record: &mut MigrationRecord, err: &ShiftError) {
        let failed_at = record.state;
        error!(
            claim = %self.request.source_claim,
            state = %failed_at,
            code = err.code(),
            error = %err,
            "migration failed"
        );
        record.fail(err);

        if let Some(direction) = failed_at.direction() {
            let session = plan_session(&self.request, direction);
            if let Err(teardown_err) = self
                .launcher
                .teardown(&self.request.namespace, &session)
                .await
            {
                warn!(error = %teardown_err, "failed to remove transfer session");
            }
        }

        if self.original_intact(failed_at).await {
            let restored = match &record.discovered {
                Some(discovered) if failed_at > MigrationState::Discover => {
                    match self.workloads.resume(discovered).await {
                        Ok(()) => true,
                        Err(resume_err) => {
                            warn!(error = %resume_err, "failed to restore workload");
                            false
                        }
                    }
                }
                _ => true,
            };
            if restored {
                record.rewind();
                info!(
                    claim = %self.request.source_claim,
                    "original claim untouched; rerun to retry the migration"
                );
            }
        } else {
            warn!(
                claim = %self.request.source_claim,
                state = %failed_at,
                "original claim already replaced; operator intervention or a rerun is required"
            );
        }

        if let Err(store_err) = self.records.save(record).await {
            warn!(error = %store_err, "failed to store migration record");
        }
    }

    // A failure in the forward cleanup may come after the canonical claim was
    // already deleted, so that state is confirmed against the cluster.
    async fn original_intact(&self, failed_at: MigrationState) -> bool {
        if !failed_at.original_data_intact() {
            return false;
        }
        if failed_at != MigrationState::CleanupForward {
            return true;
        }
        match self
            .provisioner
            .is_live(&self.request.namespace, &self.request.source_claim)
            .await
        {
            Ok(live) => live,
            Err(err) => {
                warn!(error = %err, "failed to check the canonical claim");
                false
            }
        }
    }
}
