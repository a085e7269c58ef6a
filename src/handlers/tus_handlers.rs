//! tusd HTTP hook receiver.
//!
//! tusd owns the resumable-upload protocol; once it has a whole file it
//! calls `POST /hooks/tus` with a `post-finish` event, and the file is moved
//! into the output directory under the usual final-name convention.

use crate::{
    errors::AppError,
    services::upload_service::{ExternalUpload, UploadService},
};
use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf};
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
pub struct TusHookRequest {
    #[serde(rename = "Type")]
    pub hook_type: String,
    #[serde(rename = "Event")]
    pub event: TusHookEvent,
}

#[derive(Debug, Deserialize)]
pub struct TusHookEvent {
    #[serde(rename = "Upload")]
    pub upload: TusUploadInfo,
}

#[derive(Debug, Deserialize)]
pub struct TusUploadInfo {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "MetaData", default)]
    pub meta_data: HashMap<String, String>,
    #[serde(rename = "Storage", default)]
    pub storage: Option<TusStorage>,
}

#[derive(Debug, Deserialize)]
pub struct TusStorage {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "InfoPath", default)]
    pub info_path: Option<String>,
}

/// tusd treats any 2xx as success; an empty object means "no changes".
#[derive(Debug, Serialize, Default)]
pub struct TusHookResponse {
    #[serde(rename = "StoredName", skip_serializing_if = "Option::is_none")]
    pub stored_name: Option<String>,
}

/// `POST /hooks/tus`
pub async fn tus_hook(
    State(service): State<UploadService>,
    Json(hook): Json<TusHookRequest>,
) -> Result<Json<TusHookResponse>, AppError> {
    if service.tus_dir.is_none() {
        return Err(AppError::not_found("tus hook is not enabled"));
    }
    if hook.hook_type != "post-finish" {
        debug!(hook = %hook.hook_type, "ignoring tus hook");
        return Ok(Json(TusHookResponse::default()));
    }

    let upload = hook.event.upload;
    let storage = upload
        .storage
        .ok_or_else(|| AppError::bad_request("post-finish hook without Storage.Path"))?;
    let filename = upload
        .meta_data
        .get("filename")
        .or_else(|| upload.meta_data.get("name"))
        .cloned()
        .unwrap_or_else(|| upload.id.clone());

    let stored = service
        .finalize_external(&ExternalUpload {
            upload_id: upload.id,
            source: PathBuf::from(storage.path),
            info_path: storage.info_path.map(PathBuf::from),
            filename,
            size: upload.size,
        })
        .await?;

    info!(stored_name = %stored.stored_name, bytes = stored.size_bytes, "tus upload finalized");
    Ok(Json(TusHookResponse {
        stored_name: Some(stored.stored_name),
    }))
}
