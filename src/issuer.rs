//! Signed download URL issuance
//!
//! The flow is strictly linear:
//! validate input -> check the blob exists -> acquire a delegation
//! credential -> compute the signature -> respond.
//! A signature is never computed for a blob that was not found.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::storage::{
    validate_blob_path, BlobStore, SasPermission, SignatureRequest, StorageError,
};

/// Lifetime of both the delegation credential and the signature.
pub const SIGNATURE_TTL_SECS: i64 = 3600;

pub const MSG_NOT_SPECIFIED: &str = "No container or blob specified";
pub const MSG_NOT_FOUND: &str = "No container or blob found";

#[derive(Error, Debug)]
pub enum IssueError {
    #[error("container or blob parameter missing")]
    MissingParameters,

    #[error("blob lookup failed: {0}")]
    BlobUnavailable(#[source] StorageError),

    #[error("delegation credential unavailable: {0}")]
    DelegationUnavailable(#[source] StorageError),

    #[error("signature generation failed: {0}")]
    Signing(#[source] StorageError),
}

impl IssueError {
    /// The only text a caller ever sees for this failure.
    pub fn public_message(&self) -> &'static str {
        match self {
            IssueError::MissingParameters => MSG_NOT_SPECIFIED,
            IssueError::BlobUnavailable(_)
            | IssueError::DelegationUnavailable(_)
            | IssueError::Signing(_) => MSG_NOT_FOUND,
        }
    }
}

/// A blob URL plus its SAS query string.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedUrl {
    pub blob_url: String,
    pub query: String,
    pub expires_on: DateTime<Utc>,
}

impl std::fmt::Display for SignedUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}?{}", self.blob_url, self.query)
    }
}

pub struct SignedUrlIssuer {
    store: Arc<dyn BlobStore>,
    ttl: Duration,
}

impl SignedUrlIssuer {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            ttl: Duration::seconds(SIGNATURE_TTL_SECS),
        }
    }

    pub fn account_name(&self) -> &str {
        self.store.account_name()
    }

    pub async fn issue_download_url(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<SignedUrl, IssueError> {
        self.issue_download_url_at(container, blob, Utc::now()).await
    }

    /// Same as [`issue_download_url`](Self::issue_download_url) with an
    /// explicit processing time.
    pub async fn issue_download_url_at(
        &self,
        container: &str,
        blob: &str,
        now: DateTime<Utc>,
    ) -> Result<SignedUrl, IssueError> {
        if container.is_empty() || blob.is_empty() {
            return Err(IssueError::MissingParameters);
        }

        if let Err(e) = validate_blob_path(container, blob) {
            info!("Rejected blob path {}/{}", container, blob);
            return Err(IssueError::BlobUnavailable(e));
        }

        if let Err(e) = self.store.get_blob_properties(container, blob).await {
            info!("Blob lookup failed for {}/{}: {}", container, blob, e);
            return Err(IssueError::BlobUnavailable(e));
        }

        let expiry = now + self.ttl;
        let credential = self
            .store
            .get_delegation_credential(now, expiry)
            .await
            .map_err(|e| {
                warn!("Delegation credential request failed: {}", e);
                IssueError::DelegationUnavailable(e)
            })?;

        let request = SignatureRequest {
            container: container.to_string(),
            blob: blob.to_string(),
            permission: SasPermission::Read,
            expiry,
        };
        let query = self
            .store
            .generate_signature(&credential, &request)
            .map_err(|e| {
                warn!("Signature generation failed for {}/{}: {}", container, blob, e);
                IssueError::Signing(e)
            })?;

        info!("Issued read-only URL for {}/{} expiring {}", container, blob, expiry);

        Ok(SignedUrl {
            blob_url: self.store.blob_url(container, blob),
            query,
            expires_on: expiry,
        })
    }
}
