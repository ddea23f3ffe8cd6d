pub mod credentials;

pub use credentials::{Credential, CredentialProvider, RandomCredentialProvider, StaticCredentialProvider};
