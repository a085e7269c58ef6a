//! Defines routes for chunk intake and finalized-upload lookup.
//!
//! ## Structure
//! - `POST /upload_chunk` -> multipart chunk submission
//! - `GET  /uploads` -> list finalized files (supports max-keys, continuation-token)
//! - `GET  /uploads/{id}` -> one finalized file's record
//! - `POST /hooks/tus` -> tusd post-finish hook
//! - `GET  /healthz`, `GET /readyz` -> probes

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        tus_handlers::tus_hook,
        upload_handlers::{get_upload, list_uploads, upload_chunk},
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. `max_body_bytes` caps every request body; chunk
/// requests over it are rejected with 413.
pub fn routes(max_body_bytes: usize) -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/upload_chunk", post(upload_chunk))
        .route("/uploads", get(list_uploads))
        .route("/uploads/{id}", get(get_upload))
        .route("/hooks/tus", post(tus_hook))
        .layer(DefaultBodyLimit::max(max_body_bytes))
}
