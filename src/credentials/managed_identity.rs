// Managed identity credential
// App Service / Azure Functions expose IDENTITY_ENDPOINT + IDENTITY_HEADER;
// VMs and containers fall back to the instance metadata service (IMDS).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration as StdDuration;

use super::{scope_to_resource, AccessToken, CredentialError, TokenCredential};
use crate::config::CredentialConfig;

const NAME: &str = "ManagedIdentityCredential";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";
const IMDS_API_VERSION: &str = "2018-02-01";
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
/// Off Azure the IMDS address does not answer; cap the wait per attempt.
const IMDS_TIMEOUT: StdDuration = StdDuration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
enum Endpoint {
    AppService { url: String, header: String },
    Imds { url: String },
}

pub struct ManagedIdentityCredential {
    client: Client,
    endpoint: Endpoint,
    /// Selects a user-assigned identity when set.
    client_id: Option<String>,
}

/// Endpoints disagree on whether `expires_on` is a number or a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiresOn {
    Number(i64),
    Text(String),
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_on: Option<ExpiresOn>,
}

impl ManagedIdentityCredential {
    pub fn from_config(config: &CredentialConfig, client: Client) -> Self {
        let endpoint = match (&config.identity_endpoint, &config.identity_header) {
            (Some(url), Some(header)) => Endpoint::AppService {
                url: url.clone(),
                header: header.clone(),
            },
            _ => Endpoint::Imds {
                url: IMDS_ENDPOINT.to_string(),
            },
        };

        Self {
            client,
            endpoint,
            client_id: config.client_id.clone(),
        }
    }

    /// Points the credential at a custom metadata endpoint.
    pub fn with_imds_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Endpoint::Imds { url: url.into() };
        self
    }

    fn build_request(&self, resource: &str) -> reqwest::RequestBuilder {
        let mut query: Vec<(&str, &str)> = vec![("resource", resource)];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }

        match &self.endpoint {
            Endpoint::AppService { url, header } => {
                query.push(("api-version", APP_SERVICE_API_VERSION));
                self.client
                    .get(url)
                    .query(&query)
                    .header("X-IDENTITY-HEADER", header)
            }
            Endpoint::Imds { url } => {
                query.push(("api-version", IMDS_API_VERSION));
                self.client
                    .get(url)
                    .query(&query)
                    .header("Metadata", "true")
                    .timeout(IMDS_TIMEOUT)
            }
        }
    }
}

fn parse_expires_on(value: Option<ExpiresOn>) -> Result<DateTime<Utc>, CredentialError> {
    let seconds = match value {
        Some(ExpiresOn::Number(n)) => n,
        Some(ExpiresOn::Text(s)) => s
            .trim()
            .parse()
            .map_err(|_| CredentialError::InvalidResponse(format!("bad expires_on: {}", s)))?,
        // assume a short lifetime when absent
        None => return Ok(Utc::now() + Duration::minutes(5)),
    };

    DateTime::<Utc>::from_timestamp(seconds, 0)
        .ok_or_else(|| CredentialError::InvalidResponse(format!("bad expires_on: {}", seconds)))
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let resource = scope_to_resource(scope);

        let response = self.build_request(resource).send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                CredentialError::Unavailable(NAME, e.to_string())
            } else {
                CredentialError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Rejected {
                source_name: NAME,
                status,
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::InvalidResponse(e.to_string()))?;

        Ok(AccessToken {
            token: token.access_token,
            expires_on: parse_expires_on(token.expires_on)?,
        })
    }
}
