use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::debug;

use crate::issuer::IssueError;
use crate::models::{AppState, DownloadQuery};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/download", get(download))
        // Azure Functions mounts HTTP triggers under /api
        .route("/api/download", get(download))
        .with_state(state)
}

impl IntoResponse for IssueError {
    fn into_response(self) -> Response {
        let status = match self {
            IssueError::MissingParameters => StatusCode::BAD_REQUEST,
            _ => StatusCode::NOT_FOUND,
        };
        (status, self.public_message()).into_response()
    }
}

/// GET /download?container=..&blob=.. - returns a signed, read-only URL as text.
async fn download(
    State(state): State<AppState>,
    params: Result<Query<DownloadQuery>, QueryRejection>,
) -> Result<String, IssueError> {
    // An unparseable query string is treated like a missing one.
    let params = params.map(|Query(p)| p).unwrap_or_else(|e| {
        debug!("Rejected download query: {}", e);
        DownloadQuery::default()
    });
    let container = params.container.unwrap_or_default();
    let blob = params.blob.unwrap_or_default();
    debug!("Download URL requested for {}/{}", container, blob);

    let signed = state.issuer.issue_download_url(&container, &blob).await?;
    Ok(signed.to_string())
}
