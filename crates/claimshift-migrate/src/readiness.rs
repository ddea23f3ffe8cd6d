use std::time::Duration;

use claimshift_cluster::{ClaimApi, PodApi, PodStatus};
use claimshift_common::error::{Result, ShiftError};
use claimshift_common::types::PodPhase;
use tracing::{debug, info};

use crate::abort::AbortSignal;

#[derive(Debug, Clone)]
pub struct ReadinessPoller {
    poll_interval: Duration,
    abort: AbortSignal,
}

impl ReadinessPoller {
    pub fn new(poll_interval: Duration, abort: AbortSignal) -> Self {
        Self {
            poll_interval,
            abort,
        }
    }

    pub async fn await_phase<C: PodApi + ?Sized>(
        &self,
        cluster: &C,
        namespace: &str,
        pod: &str,
        target: PodPhase,
        deadline: Duration,
    ) -> Result<PodStatus> {
        debug!(pod, target = %target, deadline_secs = deadline.as_secs(), "waiting for pod");
        let wait = cluster.wait_for_pod(namespace, pod, target, self.poll_interval);
        let status = self
            .abort
            .guard(async {
                tokio::time::timeout(deadline, wait)
                    .await
                    .map_err(|_| ShiftError::TimedOut {
                        kind: "pod",
                        name: pod.to_string(),
                        state: target.to_string(),
                    })?
            })
            .await?;

        if status.phase != target {
            return Err(ShiftError::TransferFailed {
                pod: pod.to_string(),
            });
        }
        info!(pod, phase = %status.phase, "pod reached target phase");
        Ok(status)
    }

    // Deleted claims linger while finalizers run; a claim of the same name
    // cannot be created until the old object is gone.
    pub async fn await_claim_released<C: ClaimApi + ?Sized>(
        &self,
        cluster: &C,
        namespace: &str,
        claim: &str,
        deadline: Duration,
    ) -> Result<()> {
        let wait = async {
            loop {
                match cluster.get_claim(namespace, claim).await {
                    Ok(None) => return Ok(()),
                    Ok(Some(state)) => {
                        debug!(claim, terminating = state.terminating, "claim not released yet");
                    }
                    Err(err) if err.is_retryable() => {
                        debug!(claim, error = %err, "transient error reading claim");
                    }
                    Err(err) => return Err(err),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        self.abort
            .guard(async {
                tokio::time::timeout(deadline, wait)
                    .await
                    .map_err(|_| ShiftError::TimedOut {
                        kind: "claim",
                        name: claim.to_string(),
                        state: "released".to_string(),
                    })?
            })
            .await?;
        debug!(claim, "claim released");
        Ok(())
    }
}
