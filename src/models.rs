use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::Config;
use crate::issuer::SignedUrlIssuer;

/// Immutable per-process state shared by every request.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub issuer: Arc<SignedUrlIssuer>,
}

impl AppState {
    pub fn new(config: Config, issuer: SignedUrlIssuer) -> Self {
        Self {
            config,
            issuer: Arc::new(issuer),
        }
    }
}

/// Query string of `GET /download`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadQuery {
    pub container: Option<String>,
    pub blob: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub account: String,
}
