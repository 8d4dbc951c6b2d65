//! Azure AD token credentials
//!
//! The service never holds a long-lived storage key in deployed mode. Instead
//! it asks the identity platform for a bearer token scoped to Azure Storage
//! and uses that token to request user delegation keys.
//!
//! Sources are tried in order by [`DefaultCredentialChain`]:
//! - [`EnvironmentCredential`] - service principal from `AZURE_*` variables
//! - [`ManagedIdentityCredential`] - App Service / Functions identity
//!   endpoint, or the instance metadata service

pub mod environment;
pub mod managed_identity;

pub use environment::EnvironmentCredential;
pub use managed_identity::ManagedIdentityCredential;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::config::CredentialConfig;

/// OAuth scope for Azure Storage data plane access.
pub const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";

#[derive(Error, Debug)]
pub enum CredentialError {
    /// The credential source is not configured in this environment.
    #[error("{0} is unavailable: {1}")]
    Unavailable(&'static str, String),

    #[error("Token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{source_name} rejected the token request: HTTP {status} - {body}")]
    Rejected {
        source_name: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    #[error("No credential in the chain produced a token: {}", .0.join("; "))]
    Exhausted(Vec<String>),
}

/// A bearer token and the moment it stops being valid.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError>;
}

/// Tries each credential in turn and returns the first token obtained.
pub struct DefaultCredentialChain {
    sources: Vec<Box<dyn TokenCredential>>,
}

impl DefaultCredentialChain {
    pub fn new(sources: Vec<Box<dyn TokenCredential>>) -> Self {
        Self { sources }
    }

    /// The standard chain: service principal, then managed identity.
    pub fn from_config(config: &CredentialConfig, client: reqwest::Client) -> Self {
        Self::new(vec![
            Box::new(EnvironmentCredential::from_config(config, client.clone())),
            Box::new(ManagedIdentityCredential::from_config(config, client)),
        ])
    }
}

#[async_trait]
impl TokenCredential for DefaultCredentialChain {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let mut failures = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            match source.get_token(scope).await {
                Ok(token) => return Ok(token),
                Err(e) => {
                    debug!("Credential source failed: {}", e);
                    failures.push(e.to_string());
                }
            }
        }

        Err(CredentialError::Exhausted(failures))
    }
}

/// Managed identity endpoints take a resource rather than a scope.
pub(crate) fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}
