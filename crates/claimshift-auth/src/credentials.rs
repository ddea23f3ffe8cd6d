use std::{fmt, sync::Arc};

use claimshift_common::error::{Result, ShiftError};
use rand::{Rng, distributions::Alphanumeric, rngs::OsRng};

pub const DEFAULT_USERNAME: &str = "root";
pub const DEFAULT_SECRET_LENGTH: usize = 24;
const MIN_SECRET_LENGTH: usize = 12;

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

pub trait CredentialProvider: Send + Sync {
    fn issue(&self) -> Result<Credential>;
}

#[derive(Clone, Debug)]
pub struct RandomCredentialProvider {
    username: String,
    length: usize,
}

impl RandomCredentialProvider {
    pub fn new(username: impl Into<String>, length: usize) -> Result<Self> {
        let username = username.into();
        if username.trim().is_empty() {
            return Err(ShiftError::InvalidArgument(
                "credential username cannot be empty".to_string(),
            ));
        }
        if length < MIN_SECRET_LENGTH {
            return Err(ShiftError::InvalidArgument(format!(
                "credential secret must be at least {MIN_SECRET_LENGTH} characters"
            )));
        }
        Ok(Self { username, length })
    }
}

impl Default for RandomCredentialProvider {
    fn default() -> Self {
        Self {
            username: DEFAULT_USERNAME.to_string(),
            length: DEFAULT_SECRET_LENGTH,
        }
    }
}

impl CredentialProvider for RandomCredentialProvider {
    fn issue(&self) -> Result<Credential> {
        let secret: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(self.length)
            .map(char::from)
            .collect();
        Ok(Credential {
            username: self.username.clone(),
            secret,
        })
    }
}

#[derive(Clone, Debug)]
pub struct StaticCredentialProvider {
    credential: Credential,
}

impl StaticCredentialProvider {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            credential: Credential {
                username: username.into(),
                secret: secret.into(),
            },
        }
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn issue(&self) -> Result<Credential> {
        Ok(self.credential.clone())
    }
}

impl CredentialProvider for Arc<dyn CredentialProvider> {
    fn issue(&self) -> Result<Credential> {
        self.as_ref().issue()
    }
}

#[cfg(test)]
mod tests {
    use super::{CredentialProvider, RandomCredentialProvider, StaticCredentialProvider};

    #[test]
    fn random_secrets_are_alphanumeric_and_fresh() {
        let provider = RandomCredentialProvider::default();
        let first = provider.issue().unwrap();
        let second = provider.issue().unwrap();

        assert_eq!(first.username, "root");
        assert_eq!(first.secret.len(), 24);
        assert!(first.secret.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(first.secret, second.secret);
    }

    #[test]
    fn short_secrets_are_rejected() {
        assert!(RandomCredentialProvider::new("root", 4).is_err());
        assert!(RandomCredentialProvider::new("", 24).is_err());
    }

    #[test]
    fn debug_output_hides_the_secret() {
        let credential = StaticCredentialProvider::new("root", "hunter2hunter2")
            .issue()
            .unwrap();
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("root"));
    }
}
