//! Defines routes for the file lifecycle endpoints.
//!
//! ## Structure
//! - `POST /storage/registration`       — register an expected file
//! - `POST /storage/upload/{file_id}`   — upload its payload (multipart)
//! - `POST /storage/publish/{file_id}`  — open it for retrieval
//! - `GET  /storage/get/{file_id}`      — download an open file
//!
//! Health endpoints (`/healthz`, `/readyz`) are mounted at the root.

use crate::{
    handlers::{
        file_handlers::{get_file, publish_file, register_file, upload_file},
        health_handlers::{healthz, readyz},
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for all storage routes.
///
/// The router carries shared state (`StorageService`) to all handlers.
pub fn routes() -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // file lifecycle routes
        .route("/storage/registration", post(register_file))
        .route("/storage/upload/{file_id}", post(upload_file))
        .route("/storage/publish/{file_id}", post(publish_file))
        .route("/storage/get/{file_id}", get(get_file))
}
