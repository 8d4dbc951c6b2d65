//! Azure Blob Storage client
//!
//! Talks to the Blob REST API directly with `reqwest`. Only the calls the
//! download flow needs are implemented:
//! - Get Blob Properties (`HEAD` on the blob) for the existence check
//! - Get User Delegation Key (`POST ?restype=service&comp=userdelegationkey`)
//!
//! Requests are authorized with a bearer token from the credential chain,
//! or with Shared Key when an account key is configured (local emulator).

use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::sas::{self, BlobSasParams};
use super::shared_key::{self, SharedKeyRequest};
use super::{
    validate_blob_path, BlobProperties, BlobStore, SignatureRequest, SigningCredential,
    StorageError, UserDelegationKey,
};
use crate::config::{Config, CredentialMode, StorageConfig};
use crate::credentials::{DefaultCredentialChain, TokenCredential, STORAGE_SCOPE};

/// Blob paths keep `/` literal; everything outside the unreserved set is encoded.
const BLOB_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// How requests to the account are authorized.
pub enum StorageAuth {
    Token(Arc<dyn TokenCredential>),
    /// Decoded account key.
    SharedKey(Vec<u8>),
}

impl StorageAuth {
    fn describe(&self) -> &'static str {
        match self {
            StorageAuth::Token(_) => "token",
            StorageAuth::SharedKey(_) => "shared_key",
        }
    }
}

pub struct AzureBlobClient {
    client: Client,
    account_url: String,
    /// Path component of the account URL (non-empty for emulator endpoints).
    account_path: String,
    account_name: String,
    api_version: String,
    auth: StorageAuth,
}

impl AzureBlobClient {
    pub fn new(config: &StorageConfig, auth: StorageAuth, client: Client) -> anyhow::Result<Self> {
        let url = Url::parse(&config.account_url)
            .with_context(|| format!("Invalid storage account URL: {}", config.account_url))?;
        let account_path = url.path().trim_end_matches('/').to_string();

        info!(
            "Azure blob client initialized: account={} auth={}",
            config.account_name,
            auth.describe()
        );

        Ok(Self {
            client,
            account_url: config.account_url.trim_end_matches('/').to_string(),
            account_path,
            account_name: config.account_name.clone(),
            api_version: config.api_version.clone(),
            auth,
        })
    }

    /// Builds the client and its credential from the loaded configuration.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.storage.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        let auth = match config.credential.effective_mode() {
            CredentialMode::SharedKey => {
                let key = config
                    .credential
                    .account_key
                    .as_deref()
                    .context("AZURE_STORAGE_KEY must be set for shared key mode")?;
                let decoded = BASE64
                    .decode(key.trim())
                    .context("AZURE_STORAGE_KEY is not valid base64")?;
                StorageAuth::SharedKey(decoded)
            }
            CredentialMode::Identity | CredentialMode::Auto => StorageAuth::Token(Arc::new(
                DefaultCredentialChain::from_config(&config.credential, client.clone()),
            )),
        };

        Self::new(&config.storage, auth, client)
    }

    fn encoded_blob_path(container: &str, blob: &str) -> String {
        format!(
            "{}/{}",
            utf8_percent_encode(container, BLOB_PATH),
            utf8_percent_encode(blob, BLOB_PATH)
        )
    }

    fn http_date() -> String {
        Utc::now().format(HTTP_DATE_FORMAT).to_string()
    }

    /// Adds the authorization header. `signed` describes the request for
    /// Shared Key; it is ignored for bearer tokens.
    async fn authorize(
        &self,
        builder: RequestBuilder,
        signed: &SharedKeyRequest<'_>,
    ) -> Result<RequestBuilder, StorageError> {
        match &self.auth {
            StorageAuth::Token(credential) => {
                let token = credential.get_token(STORAGE_SCOPE).await?;
                Ok(builder.bearer_auth(token.token))
            }
            StorageAuth::SharedKey(key) => {
                let header = shared_key::authorization(&self.account_name, key, signed)?;
                Ok(builder.header(AUTHORIZATION, header))
            }
        }
    }

    async fn request_user_delegation_key(
        &self,
        credential: &Arc<dyn TokenCredential>,
        start: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<UserDelegationKey, StorageError> {
        let token = credential.get_token(STORAGE_SCOPE).await?;
        let body = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
             <KeyInfo><Start>{}</Start><Expiry>{}</Expiry></KeyInfo>",
            sas::format_time(&start),
            sas::format_time(&expiry)
        );
        let request_id = Uuid::new_v4().to_string();

        let response = self
            .client
            .post(format!("{}/", self.account_url))
            .query(&[("restype", "service"), ("comp", "userdelegationkey")])
            .header("x-ms-date", Self::http_date())
            .header("x-ms-version", &self.api_version)
            .header("x-ms-client-request-id", &request_id)
            .header(CONTENT_TYPE, "application/xml")
            .bearer_auth(token.token)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Status {
                operation: "get_user_delegation_key",
                status,
                body,
            });
        }

        let body = response.text().await?;
        debug!(request_id = %request_id, "User delegation key issued");
        parse_user_delegation_key(&body)
    }
}

fn header_string(response: &reqwest::Response, name: impl reqwest::header::AsHeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Extracts the text of the first `<tag>...</tag>` element.
fn xml_element<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)?;
    Some(&body[start..start + end])
}

fn parse_user_delegation_key(body: &str) -> Result<UserDelegationKey, StorageError> {
    let field = |tag: &str| {
        xml_element(body, tag)
            .map(|v| v.trim().to_string())
            .ok_or_else(|| StorageError::InvalidResponse(format!("UserDelegationKey missing <{}>", tag)))
    };

    Ok(UserDelegationKey {
        signed_oid: field("SignedOid")?,
        signed_tid: field("SignedTid")?,
        signed_start: field("SignedStart")?,
        signed_expiry: field("SignedExpiry")?,
        signed_service: field("SignedService")?,
        signed_version: field("SignedVersion")?,
        value: field("Value")?,
    })
}

#[async_trait]
impl BlobStore for AzureBlobClient {
    fn account_name(&self) -> &str {
        &self.account_name
    }

    fn blob_url(&self, container: &str, blob: &str) -> String {
        format!(
            "{}/{}",
            self.account_url,
            Self::encoded_blob_path(container, blob)
        )
    }

    async fn get_blob_properties(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<BlobProperties, StorageError> {
        validate_blob_path(container, blob)?;
        let date = Self::http_date();
        let request_id = Uuid::new_v4().to_string();
        let path = format!(
            "{}/{}",
            self.account_path,
            Self::encoded_blob_path(container, blob)
        );
        let ms_headers = [
            ("x-ms-date", date.as_str()),
            ("x-ms-version", self.api_version.as_str()),
            ("x-ms-client-request-id", request_id.as_str()),
        ];

        let mut builder = self.client.head(self.blob_url(container, blob));
        for (name, value) in ms_headers {
            builder = builder.header(name, value);
        }
        let signed = SharedKeyRequest {
            method: "HEAD",
            path: &path,
            ms_headers: &ms_headers,
            ..Default::default()
        };
        let response = self.authorize(builder, &signed).await?.send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound {
                container: container.to_string(),
                blob: blob.to_string(),
            });
        }
        if !status.is_success() {
            // HEAD responses carry the error code in a header, not a body.
            let body = header_string(&response, "x-ms-error-code").unwrap_or_default();
            return Err(StorageError::Status {
                operation: "get_blob_properties",
                status,
                body,
            });
        }

        Ok(BlobProperties {
            content_length: header_string(&response, CONTENT_LENGTH).and_then(|v| v.parse().ok()),
            content_type: header_string(&response, CONTENT_TYPE),
            etag: header_string(&response, ETAG),
            last_modified: header_string(&response, LAST_MODIFIED),
        })
    }

    async fn get_delegation_credential(
        &self,
        start: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<SigningCredential, StorageError> {
        match &self.auth {
            StorageAuth::Token(credential) => self
                .request_user_delegation_key(credential, start, expiry)
                .await
                .map(SigningCredential::UserDelegation),
            StorageAuth::SharedKey(key) => Ok(SigningCredential::AccountKey(key.clone())),
        }
    }

    fn generate_signature(
        &self,
        credential: &SigningCredential,
        request: &SignatureRequest,
    ) -> Result<String, StorageError> {
        let params = BlobSasParams {
            account_name: &self.account_name,
            container: &request.container,
            blob: &request.blob,
            permission: request.permission,
            expiry: request.expiry,
            version: &self.api_version,
        };

        match credential {
            SigningCredential::UserDelegation(key) => sas::user_delegation_sas(&params, key),
            SigningCredential::AccountKey(key) => sas::service_sas(&params, key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_API_VERSION;
    use crate::credentials::{AccessToken, CredentialError};
    use crate::storage::SasPermission;
    use chrono::TimeZone;
    use mockito::Matcher;

    struct StaticToken;

    #[async_trait]
    impl TokenCredential for StaticToken {
        async fn get_token(&self, _scope: &str) -> Result<AccessToken, CredentialError> {
            Ok(AccessToken {
                token: "test-token".to_string(),
                expires_on: Utc::now() + chrono::Duration::hours(1),
            })
        }
    }

    struct NoToken;

    #[async_trait]
    impl TokenCredential for NoToken {
        async fn get_token(&self, _scope: &str) -> Result<AccessToken, CredentialError> {
            Err(CredentialError::Exhausted(vec!["nothing configured".to_string()]))
        }
    }

    fn storage_config(account_url: &str) -> StorageConfig {
        StorageConfig {
            account_url: account_url.to_string(),
            account_name: "testaccount".to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout_secs: 5,
        }
    }

    fn token_client(account_url: &str) -> AzureBlobClient {
        AzureBlobClient::new(
            &storage_config(account_url),
            StorageAuth::Token(Arc::new(StaticToken)),
            Client::new(),
        )
        .unwrap()
    }

    const DELEGATION_KEY_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<UserDelegationKey>
  <SignedOid>11111111-2222-3333-4444-555555555555</SignedOid>
  <SignedTid>66666666-7777-8888-9999-000000000000</SignedTid>
  <SignedStart>2024-05-01T12:00:00Z</SignedStart>
  <SignedExpiry>2024-05-01T13:00:00Z</SignedExpiry>
  <SignedService>b</SignedService>
  <SignedVersion>2021-08-06</SignedVersion>
  <Value>KioqKioqKioqKioqKioqKioqKioqKioqKioqKioqKio=</Value>
</UserDelegationKey>"#;

    #[test]
    fn test_blob_url_format() {
        let client = token_client("https://testaccount.blob.core.windows.net/");
        assert_eq!(
            client.blob_url("images", "cat.png"),
            "https://testaccount.blob.core.windows.net/images/cat.png"
        );
    }

    #[test]
    fn test_blob_url_encoding() {
        let client = token_client("https://testaccount.blob.core.windows.net");
        assert_eq!(
            client.blob_url("docs", "reports/2024 Q1 #final.pdf"),
            "https://testaccount.blob.core.windows.net/docs/reports/2024%20Q1%20%23final.pdf"
        );
    }

    #[test]
    fn test_emulator_account_path() {
        let client = token_client("http://127.0.0.1:10000/devstoreaccount1");
        assert_eq!(client.account_path, "/devstoreaccount1");
        assert_eq!(
            client.blob_url("images", "cat.png"),
            "http://127.0.0.1:10000/devstoreaccount1/images/cat.png"
        );
    }

    #[test]
    fn test_parse_user_delegation_key() {
        let key = parse_user_delegation_key(DELEGATION_KEY_XML).unwrap();
        assert_eq!(key.signed_oid, "11111111-2222-3333-4444-555555555555");
        assert_eq!(key.signed_service, "b");
        assert_eq!(key.signed_version, "2021-08-06");
        assert_eq!(key.value, "KioqKioqKioqKioqKioqKioqKioqKioqKioqKioqKio=");
    }

    #[test]
    fn test_parse_user_delegation_key_missing_field() {
        let err = parse_user_delegation_key("<UserDelegationKey><SignedOid>x</SignedOid></UserDelegationKey>")
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_get_blob_properties_found() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("HEAD", "/testaccount/images/cat.png")
            .match_header("authorization", "Bearer test-token")
            .match_header("x-ms-version", DEFAULT_API_VERSION)
            .match_header("x-ms-client-request-id", Matcher::Any)
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_header("etag", "\"0x8DC\"")
            .create_async()
            .await;

        let client = token_client(&format!("{}/testaccount", server.url()));
        let props = client.get_blob_properties("images", "cat.png").await.unwrap();

        mock.assert_async().await;
        assert_eq!(props.content_type.as_deref(), Some("image/png"));
        assert_eq!(props.etag.as_deref(), Some("\"0x8DC\""));
    }

    #[tokio::test]
    async fn test_get_blob_properties_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("HEAD", "/testaccount/missing/x")
            .with_status(404)
            .with_header("x-ms-error-code", "ContainerNotFound")
            .create_async()
            .await;

        let client = token_client(&format!("{}/testaccount", server.url()));
        let err = client.get_blob_properties("missing", "x").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_get_blob_properties_rejects_dot_segments() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("HEAD", "/testaccount/secret/x")
            .with_status(200)
            .expect(0)
            .create_async()
            .await;

        let client = token_client(&format!("{}/testaccount", server.url()));
        let err = client
            .get_blob_properties("images", "../secret/x")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::InvalidName { .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_blob_properties_forbidden() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("HEAD", "/testaccount/images/cat.png")
            .with_status(403)
            .with_header("x-ms-error-code", "AuthorizationPermissionMismatch")
            .create_async()
            .await;

        let client = token_client(&format!("{}/testaccount", server.url()));
        let err = client.get_blob_properties("images", "cat.png").await.unwrap_err();
        match err {
            StorageError::Status { status, body, .. } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(body, "AuthorizationPermissionMismatch");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_blob_properties_without_token() {
        let client = AzureBlobClient::new(
            &storage_config("https://testaccount.blob.core.windows.net"),
            StorageAuth::Token(Arc::new(NoToken)),
            Client::new(),
        )
        .unwrap();

        let err = client.get_blob_properties("images", "cat.png").await.unwrap_err();
        assert!(matches!(err, StorageError::Credential(_)));
    }

    #[tokio::test]
    async fn test_get_blob_properties_shared_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("HEAD", "/devstoreaccount1/images/cat.png")
            .match_header(
                "authorization",
                Matcher::Regex("^SharedKey testaccount:.+$".to_string()),
            )
            .match_header("x-ms-date", Matcher::Any)
            .with_status(200)
            .create_async()
            .await;

        let client = AzureBlobClient::new(
            &storage_config(&format!("{}/devstoreaccount1", server.url())),
            StorageAuth::SharedKey(b"local-dev-key".to_vec()),
            Client::new(),
        )
        .unwrap();

        tokio_test::assert_ok!(client.get_blob_properties("images", "cat.png").await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_user_delegation_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/testaccount/")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("restype".into(), "service".into()),
                Matcher::UrlEncoded("comp".into(), "userdelegationkey".into()),
            ]))
            .match_header("authorization", "Bearer test-token")
            .match_body(Matcher::Regex(
                "<Start>2024-05-01T12:00:00Z</Start><Expiry>2024-05-01T13:00:00Z</Expiry>"
                    .to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/xml")
            .with_body(DELEGATION_KEY_XML)
            .create_async()
            .await;

        let client = token_client(&format!("{}/testaccount", server.url()));
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let expiry = start + chrono::Duration::hours(1);
        let credential = client.get_delegation_credential(start, expiry).await.unwrap();

        mock.assert_async().await;
        match credential {
            SigningCredential::UserDelegation(key) => {
                assert_eq!(key.signed_tid, "66666666-7777-8888-9999-000000000000");
            }
            other => panic!("unexpected credential: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_user_delegation_key_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/testaccount/")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body("<Error><Code>AuthorizationFailure</Code></Error>")
            .create_async()
            .await;

        let client = token_client(&format!("{}/testaccount", server.url()));
        let now = Utc::now();
        let err = client
            .get_delegation_credential(now, now + chrono::Duration::hours(1))
            .await
            .unwrap_err();

        match err {
            StorageError::Status { operation, status, body } => {
                assert_eq!(operation, "get_user_delegation_key");
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert!(body.contains("AuthorizationFailure"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shared_key_delegation_uses_account_key() {
        let client = AzureBlobClient::new(
            &storage_config("http://127.0.0.1:10000/devstoreaccount1"),
            StorageAuth::SharedKey(b"local-dev-key".to_vec()),
            Client::new(),
        )
        .unwrap();

        let now = Utc::now();
        let credential = client
            .get_delegation_credential(now, now + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(matches!(credential, SigningCredential::AccountKey(ref k) if k == b"local-dev-key"));
    }

    #[test]
    fn test_generate_signature_dispatch() {
        let client = token_client("https://testaccount.blob.core.windows.net");
        let request = SignatureRequest {
            container: "images".to_string(),
            blob: "cat.png".to_string(),
            permission: SasPermission::Read,
            expiry: Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap(),
        };

        let key = parse_user_delegation_key(DELEGATION_KEY_XML).unwrap();
        let delegated = client
            .generate_signature(&SigningCredential::UserDelegation(key), &request)
            .unwrap();
        assert!(delegated.contains("skoid="));
        assert!(delegated.contains("sp=r"));

        let keyed = client
            .generate_signature(&SigningCredential::AccountKey(b"k".to_vec()), &request)
            .unwrap();
        assert!(!keyed.contains("skoid="));
        assert!(keyed.contains("sp=r"));
    }
}
