// Signed Download - issues time-limited, read-only download URLs for Azure blobs

pub mod config;
pub mod credentials;
pub mod issuer;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod storage;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use issuer::{IssueError, SignedUrl, SignedUrlIssuer};
pub use models::AppState;

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}
