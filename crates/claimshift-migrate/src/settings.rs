use std::{str::FromStr, time::Duration};

use claimshift_common::error::{Result, ShiftError};

use crate::retry::RetryPolicy;

pub const DEFAULT_TRANSFER_IMAGE: &str = "alpine:latest";

const MIN_LEASE_DURATION: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSettings {
    pub poll_interval: Duration,
    pub grace_period: Duration,
    pub source_ready_timeout: Duration,
    pub transfer_timeout: Duration,
    pub claim_release_timeout: Duration,
    pub transfer_image: String,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub lease_duration: Duration,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            grace_period: Duration::from_secs(20),
            source_ready_timeout: Duration::from_secs(600),
            transfer_timeout: Duration::from_secs(24 * 60 * 60),
            claim_release_timeout: Duration::from_secs(300),
            transfer_image: DEFAULT_TRANSFER_IMAGE.to_string(),
            retry_attempts: 5,
            retry_base_delay: Duration::from_millis(500),
            lease_duration: Duration::from_secs(60),
        }
    }
}

impl MigrationSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let settings = Self {
            poll_interval: seconds(&lookup, "CLAIMSHIFT_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            grace_period: seconds(&lookup, "CLAIMSHIFT_GRACE_PERIOD_SECS", defaults.grace_period)?,
            source_ready_timeout: seconds(
                &lookup,
                "CLAIMSHIFT_SOURCE_READY_TIMEOUT_SECS",
                defaults.source_ready_timeout,
            )?,
            transfer_timeout: seconds(
                &lookup,
                "CLAIMSHIFT_TRANSFER_TIMEOUT_SECS",
                defaults.transfer_timeout,
            )?,
            claim_release_timeout: seconds(
                &lookup,
                "CLAIMSHIFT_CLAIM_RELEASE_TIMEOUT_SECS",
                defaults.claim_release_timeout,
            )?,
            transfer_image: lookup("CLAIMSHIFT_TRANSFER_IMAGE").unwrap_or(defaults.transfer_image),
            retry_attempts: parsed(&lookup, "CLAIMSHIFT_RETRY_ATTEMPTS")?
                .unwrap_or(defaults.retry_attempts),
            retry_base_delay: parsed(&lookup, "CLAIMSHIFT_RETRY_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            lease_duration: seconds(
                &lookup,
                "CLAIMSHIFT_LEASE_DURATION_SECS",
                defaults.lease_duration,
            )?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(ShiftError::InvalidArgument(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(ShiftError::InvalidArgument(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        if self.lease_duration < MIN_LEASE_DURATION {
            return Err(ShiftError::InvalidArgument(format!(
                "lease duration must be at least {}s",
                MIN_LEASE_DURATION.as_secs()
            )));
        }
        if self.transfer_image.trim().is_empty() {
            return Err(ShiftError::InvalidArgument(
                "transfer image cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_base_delay)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ShiftError::InvalidArgument(format!("{key} has an invalid value: {raw}"))),
        None => Ok(None),
    }
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    Ok(parsed::<u64>(lookup, key)?
        .map(Duration::from_secs)
        .unwrap_or(default))
}
