// In-memory BlobStore used by issuer and route tests.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::sas::{self, BlobSasParams};
use super::{
    BlobProperties, BlobStore, SignatureRequest, SigningCredential, StorageError,
    UserDelegationKey,
};

pub(crate) const ACCOUNT: &str = "fakeaccount";
pub(crate) const VERSION: &str = "2021-08-06";

#[derive(Default)]
pub(crate) struct FakeBlobStore {
    blobs: HashSet<(String, String)>,
    fail_delegation: bool,
    pub(crate) delegation_calls: AtomicUsize,
    pub(crate) signature_calls: AtomicUsize,
    pub(crate) delegation_windows: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
}

impl FakeBlobStore {
    pub(crate) fn with_blob(mut self, container: &str, blob: &str) -> Self {
        self.blobs.insert((container.to_string(), blob.to_string()));
        self
    }

    pub(crate) fn failing_delegation(mut self) -> Self {
        self.fail_delegation = true;
        self
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    fn account_name(&self) -> &str {
        ACCOUNT
    }

    fn blob_url(&self, container: &str, blob: &str) -> String {
        format!("https://{}.blob.core.windows.net/{}/{}", ACCOUNT, container, blob)
    }

    async fn get_blob_properties(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<BlobProperties, StorageError> {
        if self.blobs.contains(&(container.to_string(), blob.to_string())) {
            Ok(BlobProperties::default())
        } else {
            Err(StorageError::NotFound {
                container: container.to_string(),
                blob: blob.to_string(),
            })
        }
    }

    async fn get_delegation_credential(
        &self,
        start: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<SigningCredential, StorageError> {
        self.delegation_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut windows) = self.delegation_windows.lock() {
            windows.push((start, expiry));
        }
        if self.fail_delegation {
            return Err(StorageError::Status {
                operation: "get_user_delegation_key",
                status: reqwest::StatusCode::FORBIDDEN,
                body: "AuthorizationPermissionMismatch".to_string(),
            });
        }

        Ok(SigningCredential::UserDelegation(UserDelegationKey {
            signed_oid: "oid".to_string(),
            signed_tid: "tid".to_string(),
            signed_start: sas::format_time(&start),
            signed_expiry: sas::format_time(&expiry),
            signed_service: "b".to_string(),
            signed_version: VERSION.to_string(),
            value: BASE64.encode([7u8; 32]),
        }))
    }

    fn generate_signature(
        &self,
        credential: &SigningCredential,
        request: &SignatureRequest,
    ) -> Result<String, StorageError> {
        self.signature_calls.fetch_add(1, Ordering::SeqCst);
        let params = BlobSasParams {
            account_name: ACCOUNT,
            container: &request.container,
            blob: &request.blob,
            permission: request.permission,
            expiry: request.expiry,
            version: VERSION,
        };
        match credential {
            SigningCredential::UserDelegation(key) => sas::user_delegation_sas(&params, key),
            SigningCredential::AccountKey(key) => sas::service_sas(&params, key),
        }
    }
}
