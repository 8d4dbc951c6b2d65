use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use reqwest::Url;
use serde::Deserialize;
use std::env;

/// Blob REST API version sent as `x-ms-version` and signed as `sv`.
pub const DEFAULT_API_VERSION: &str = "2021-08-06";
/// Oldest service version whose SAS string-to-sign layout is implemented.
pub const MIN_API_VERSION: &str = "2020-12-06";
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub credential: CredentialConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base URL of the storage account, without a trailing slash.
    pub account_url: String,
    pub account_name: String,
    pub api_version: String,
    pub timeout_secs: u64,
}

/// How the service authenticates against the storage account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialMode {
    /// Shared key when one is configured, identity chain otherwise.
    Auto,
    Identity,
    SharedKey,
}

impl std::str::FromStr for CredentialMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(CredentialMode::Auto),
            "identity" | "default" => Ok(CredentialMode::Identity),
            "shared_key" | "sharedkey" | "key" => Ok(CredentialMode::SharedKey),
            other => Err(anyhow!("Unknown CREDENTIAL_MODE: {}", other)),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct CredentialConfig {
    pub mode: CredentialMode,
    pub account_key: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub authority_host: String,
    pub identity_endpoint: Option<String>,
    pub identity_header: Option<String>,
}

impl std::fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("mode", &self.mode)
            .field("account_key", &self.account_key.as_ref().map(|_| "<redacted>"))
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("authority_host", &self.authority_host)
            .field("identity_endpoint", &self.identity_endpoint)
            .field("identity_header", &self.identity_header.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl CredentialConfig {
    /// Resolves `Auto` against what is actually configured.
    pub fn effective_mode(&self) -> CredentialMode {
        match self.mode {
            CredentialMode::Auto if self.account_key.is_some() => CredentialMode::SharedKey,
            CredentialMode::Auto => CredentialMode::Identity,
            mode => mode,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Empty values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let account_url = get("ACCOUNT_URL")
            .context("ACCOUNT_URL must be set")?
            .trim()
            .trim_end_matches('/')
            .to_string();
        let account_name = match get("STORAGE_ACCOUNT_NAME") {
            Some(name) => name,
            None => account_name_from_url(&account_url)?,
        };

        let port = get("FUNCTIONS_CUSTOMHANDLER_PORT")
            .or_else(|| get("PORT"))
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .context("Invalid listen port")?;

        let credential = CredentialConfig {
            mode: get("CREDENTIAL_MODE")
                .unwrap_or_else(|| "auto".to_string())
                .parse()?,
            account_key: get("AZURE_STORAGE_KEY"),
            tenant_id: get("AZURE_TENANT_ID"),
            client_id: get("AZURE_CLIENT_ID"),
            client_secret: get("AZURE_CLIENT_SECRET"),
            authority_host: get("AZURE_AUTHORITY_HOST")
                .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_string())
                .trim_end_matches('/')
                .to_string(),
            identity_endpoint: get("IDENTITY_ENDPOINT"),
            identity_header: get("IDENTITY_HEADER"),
        };

        if credential.mode == CredentialMode::SharedKey && credential.account_key.is_none() {
            bail!("CREDENTIAL_MODE=shared_key requires AZURE_STORAGE_KEY");
        }

        Ok(Self {
            server: ServerConfig {
                port,
                host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                cors_allowed_origins: get("ALLOWED_ORIGINS")
                    .unwrap_or_else(|| "http://localhost:3000,http://localhost:5173".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            storage: StorageConfig {
                account_url,
                account_name,
                api_version: parse_api_version(get("STORAGE_API_VERSION"))?,
                timeout_secs: get("STORAGE_TIMEOUT_SECS")
                    .unwrap_or_else(|| "30".to_string())
                    .parse()
                    .context("Invalid STORAGE_TIMEOUT_SECS")?,
            },
            credential,
        })
    }
}

/// Service versions are `YYYY-MM-DD` dates, so they order lexically.
fn parse_api_version(value: Option<String>) -> Result<String> {
    let version = match value {
        Some(v) => v.trim().to_string(),
        None => return Ok(DEFAULT_API_VERSION.to_string()),
    };
    NaiveDate::parse_from_str(&version, "%Y-%m-%d")
        .with_context(|| format!("Invalid STORAGE_API_VERSION: {}", version))?;
    if version.as_str() < MIN_API_VERSION {
        bail!(
            "STORAGE_API_VERSION {} is older than the minimum supported {}",
            version,
            MIN_API_VERSION
        );
    }
    Ok(version)
}

/// Derives the storage account name from its endpoint.
///
/// Public endpoints carry the account as the first host label
/// (`https://acct.blob.core.windows.net`). Emulator and IP-style endpoints
/// carry it as the first path segment (`http://127.0.0.1:10000/devstoreaccount1`).
pub fn account_name_from_url(account_url: &str) -> Result<String> {
    let url = Url::parse(account_url)
        .with_context(|| format!("ACCOUNT_URL is not a valid URL: {}", account_url))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("ACCOUNT_URL has no host: {}", account_url))?;

    let path_style = host == "localhost" || host.parse::<std::net::IpAddr>().is_ok()
        || host.starts_with('[');
    let name = if path_style {
        url.path_segments()
            .and_then(|mut segments| segments.next())
            .unwrap_or_default()
    } else {
        host.split('.').next().unwrap_or_default()
    };

    if name.is_empty() {
        bail!("Could not derive a storage account name from {}", account_url);
    }
    Ok(name.to_string())
}
