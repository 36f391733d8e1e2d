//! HTTP handlers for the file lifecycle: registration, upload, publish,
//! download. Transport concerns (JSON, multipart, headers) live here;
//! everything else is delegated to `StorageService`.

use crate::{
    errors::AppError,
    services::storage_service::{RegisterParams, StorageService},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request body for `POST /storage/registration`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub file_name: String,
    pub hash: String,
    pub weight: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub id: Uuid,
    pub url: String,
    pub date_modified: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub id: Uuid,
    pub url: String,
}

/// Request body for `POST /storage/publish/{file_id}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub date_published: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    pub id: Uuid,
    pub date_published: DateTime<Utc>,
}

/// `POST /storage/registration` — declare an expected file.
pub async fn register_file(
    State(service): State<StorageService>,
    Json(req): Json<RegistrationRequest>,
) -> Result<impl IntoResponse, AppError> {
    tracing::info!("file registration request ({})", req.file_name);
    let registered = service
        .register_file(RegisterParams {
            file_name: req.file_name,
            hash: req.hash,
            weight: req.weight,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegistrationResponse {
            id: registered.id,
            url: registered.url,
            date_modified: registered.date_modified,
        }),
    ))
}

/// `POST /storage/upload/{file_id}` — deliver the payload as a multipart
/// form with a single `file` field.
pub async fn upload_file(
    State(service): State<StorageService>,
    Path(file_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    tracing::info!("file upload request (file_id: {})", file_id);

    let mut delivered: Option<(String, Bytes)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.to_string()))?
    {
        if field.name() == Some("file") {
            let name = field.file_name().unwrap_or_default().to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|err| AppError::bad_request(err.to_string()))?;
            delivered = Some((name, bytes));
            break;
        }
    }
    let (delivered_name, payload) =
        delivered.ok_or_else(|| AppError::bad_request("missing `file` form field"))?;

    let url = service
        .upload_file(file_id, &delivered_name, &payload)
        .await?;

    Ok((StatusCode::CREATED, Json(UploadResponse { id: file_id, url })))
}

/// `POST /storage/publish/{file_id}` — open the file for retrieval.
pub async fn publish_file(
    State(service): State<StorageService>,
    Path(file_id): Path<Uuid>,
    Json(req): Json<PublishRequest>,
) -> Result<impl IntoResponse, AppError> {
    tracing::info!("file publish request (file_id: {})", file_id);
    let record = service.publish_file(file_id, req.date_published).await?;

    Ok(Json(PublishResponse {
        id: record.id,
        date_published: req.date_published,
    }))
}

/// `GET /storage/get/{file_id}` — download an open file as an attachment.
pub async fn get_file(
    State(service): State<StorageService>,
    Path(file_id): Path<Uuid>,
) -> Result<Response, AppError> {
    tracing::info!("file download request (file_id: {})", file_id);
    let (file_name, bytes) = service.get_file(file_id).await?;

    let mut response = Response::new(Body::from(bytes));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    let disposition = format!("attachment; filename=\"{}\"", file_name.replace('"', "_"));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}
