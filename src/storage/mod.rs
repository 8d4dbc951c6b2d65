//! Blob storage access
//!
//! [`BlobStore`] is the capability set the download issuer needs from a
//! storage backend: an existence check, a short-lived signing credential,
//! and signature generation. [`AzureBlobClient`] implements it against the
//! Azure Blob REST API.

pub mod azure;
pub mod sas;
pub mod shared_key;

#[cfg(test)]
pub(crate) mod fake;

pub use azure::AzureBlobClient;
pub use sas::SasPermission;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::credentials::CredentialError;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Blob {container}/{blob} not found")]
    NotFound { container: String, blob: String },

    #[error("Azure {operation} failed: HTTP {status} - {body}")]
    Status {
        operation: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Storage request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Invalid blob path {container}/{blob}")]
    InvalidName { container: String, blob: String },

    #[error("Invalid storage response: {0}")]
    InvalidResponse(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Rejects names whose URL would not address the blob as written.
///
/// URL parsing removes `.` and `..` path segments, so such a blob would be
/// checked at one location and signed for another. Container names never
/// contain `/`, and blob names may not have empty segments.
pub fn validate_blob_path(container: &str, blob: &str) -> Result<(), StorageError> {
    let dot_or_empty = |segment: &str| matches!(segment, "" | "." | "..");
    if container.contains('/') || dot_or_empty(container) || blob.split('/').any(dot_or_empty) {
        return Err(StorageError::InvalidName {
            container: container.to_string(),
            blob: blob.to_string(),
        });
    }
    Ok(())
}

/// Metadata returned by the existence check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlobProperties {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Key material returned by Get User Delegation Key.
#[derive(Clone, PartialEq)]
pub struct UserDelegationKey {
    pub signed_oid: String,
    pub signed_tid: String,
    pub signed_start: String,
    pub signed_expiry: String,
    pub signed_service: String,
    pub signed_version: String,
    /// Base64-encoded signing key.
    pub value: String,
}

impl std::fmt::Debug for UserDelegationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserDelegationKey")
            .field("signed_oid", &self.signed_oid)
            .field("signed_tid", &self.signed_tid)
            .field("signed_start", &self.signed_start)
            .field("signed_expiry", &self.signed_expiry)
            .field("signed_service", &self.signed_service)
            .field("signed_version", &self.signed_version)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Credential used to sign a single SAS.
#[derive(Clone)]
pub enum SigningCredential {
    /// Deployed mode: key obtained from the identity platform.
    UserDelegation(UserDelegationKey),
    /// Local development: the decoded storage account key.
    AccountKey(Vec<u8>),
}

impl std::fmt::Debug for SigningCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningCredential::UserDelegation(key) => {
                f.debug_tuple("UserDelegation").field(key).finish()
            }
            SigningCredential::AccountKey(_) => f.write_str("AccountKey(<redacted>)"),
        }
    }
}

/// What a signature grants access to.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureRequest {
    pub container: String,
    pub blob: String,
    pub permission: SasPermission,
    pub expiry: DateTime<Utc>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Storage account the URLs are issued for.
    fn account_name(&self) -> &str;

    /// Canonical URL of a blob, without any query string.
    fn blob_url(&self, container: &str, blob: &str) -> String;

    async fn get_blob_properties(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<BlobProperties, StorageError>;

    async fn get_delegation_credential(
        &self,
        start: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<SigningCredential, StorageError>;

    /// Computes the SAS query string. Pure; no network access.
    fn generate_signature(
        &self,
        credential: &SigningCredential,
        request: &SignatureRequest,
    ) -> Result<String, StorageError>;
}
