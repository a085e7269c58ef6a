//! HTTP handlers for chunk intake and the finalized-uploads listing.
//! Chunk payloads are streamed straight to staging; only the small text
//! fields are buffered, up to the configured form-memory ceiling.

use crate::{
    errors::AppError,
    models::{
        session::{ChunkUpload, SessionId, SessionManifest},
        upload::StoredUpload,
    },
    services::{
        ledger::ListUploadsParams,
        session_tracker::Progress,
        upload_service::{ChunkOutcome, UploadService},
    },
};
use axum::{
    Json,
    extract::{Multipart, Path, Query, State, multipart::Field},
    http::StatusCode,
};
use base64::{Engine as _, engine::general_purpose};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::{io, str::FromStr};
use tokio_util::io::StreamReader;
use tracing::{debug, info};
use uuid::Uuid;

/// Body of a successful `POST /upload_chunk`.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChunkResponse {
    InProgress {
        session_id: String,
        received: u32,
        total: u32,
        progress: f64,
    },
    Finalizing {
        session_id: String,
        received: u32,
        total: u32,
    },
    Complete {
        session_id: String,
        file: StoredUpload,
    },
}

impl ChunkResponse {
    fn from_outcome(session_id: &SessionId, outcome: ChunkOutcome) -> Self {
        let session_id = session_id.to_string();
        match outcome {
            ChunkOutcome::InProgress(p) => ChunkResponse::InProgress {
                session_id,
                received: p.received,
                total: p.total,
                progress: (p.percent() * 100.0).round() / 100.0,
            },
            ChunkOutcome::Finalizing(Progress {
                received, total, ..
            }) => ChunkResponse::Finalizing {
                session_id,
                received,
                total,
            },
            ChunkOutcome::Complete(file) => ChunkResponse::Complete { session_id, file },
        }
    }
}

/// Text fields collected ahead of the `chunk` payload.
#[derive(Debug, Default)]
struct ChunkForm {
    upload_id: Option<String>,
    chunk_index: Option<String>,
    total_chunks: Option<String>,
    filename: Option<String>,
    total_size: Option<String>,
}

impl ChunkForm {
    fn slot(&mut self, name: &str) -> Option<&mut Option<String>> {
        match name {
            "upload_id" => Some(&mut self.upload_id),
            "chunk_index" => Some(&mut self.chunk_index),
            "total_chunks" => Some(&mut self.total_chunks),
            "filename" => Some(&mut self.filename),
            "total_size" => Some(&mut self.total_size),
            _ => None,
        }
    }

    /// Validate the collected fields once the payload is reached.
    fn into_upload(self) -> Result<ChunkUpload, AppError> {
        let (Some(upload_id), Some(chunk_index), Some(total_chunks), Some(filename), Some(total_size)) = (
            non_empty(self.upload_id),
            non_empty(self.chunk_index),
            non_empty(self.total_chunks),
            non_empty(self.filename),
            non_empty(self.total_size),
        ) else {
            return Err(AppError::bad_request(
                "Missing parameters: upload_id, chunk_index, total_chunks, filename and total_size must precede chunk",
            ));
        };

        Ok(ChunkUpload {
            session_id: SessionId::parse(&upload_id)?,
            chunk_index: parse_number("chunk_index", &chunk_index)?,
            manifest: SessionManifest {
                filename,
                total_chunks: parse_number("total_chunks", &total_chunks)?,
                total_size: parse_number("total_size", &total_size)?,
            },
        })
    }
}

/// `POST /upload_chunk`: persist one chunk; the request carrying the last
/// missing chunk also reassembles and finalizes the file.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    mut multipart: Multipart,
) -> Result<Json<ChunkResponse>, AppError> {
    let mut form = ChunkForm::default();
    let mut form_budget = service.limits.max_memory;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();
        if name == "chunk" {
            let upload = form.into_upload()?;
            return store_chunk(&service, &upload, field).await;
        }
        match form.slot(&name) {
            Some(slot) => *slot = Some(read_text_field(field, &mut form_budget).await?),
            None => debug!("ignoring unknown form field `{}`", name),
        }
    }

    Err(AppError::bad_request("Missing file chunk"))
}

async fn store_chunk(
    service: &UploadService,
    upload: &ChunkUpload,
    field: Field<'_>,
) -> Result<Json<ChunkResponse>, AppError> {
    // Dropping the guard (request finished or client gone) cancels the copy.
    let cancel = service.request_token();
    let _guard = cancel.clone().drop_guard();

    let stream = field.map_err(io::Error::other);
    let mut body = StreamReader::new(Box::pin(stream));

    let outcome = service.accept_chunk(upload, &mut body, &cancel).await?;
    if let ChunkOutcome::Complete(file) = &outcome {
        info!(
            session_id = %upload.session_id,
            stored_name = %file.stored_name,
            bytes = file.size_bytes,
            "upload complete"
        );
    }
    Ok(Json(ChunkResponse::from_outcome(&upload.session_id, outcome)))
}

/// Buffer a text field, charging its size against the request's budget.
async fn read_text_field(mut field: Field<'_>, budget: &mut u64) -> Result<String, AppError> {
    let mut buf = Vec::new();
    while let Some(bytes) = field.chunk().await? {
        let len = bytes.len() as u64;
        if len > *budget {
            return Err(AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "form fields exceed the configured memory limit",
            ));
        }
        *budget -= len;
        buf.extend_from_slice(&bytes);
    }
    String::from_utf8(buf).map_err(|_| AppError::bad_request("form fields must be UTF-8"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_number<T: FromStr>(name: &str, raw: &str) -> Result<T, AppError> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::bad_request(format!("Invalid {}", name)))
}

/// Query params accepted by `GET /uploads`.
#[derive(Debug, Deserialize)]
pub struct ListUploadsQuery {
    #[serde(rename = "max-keys")]
    pub max_keys: Option<usize>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListUploadsResponse {
    pub uploads: Vec<StoredUpload>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

/// `GET /uploads`: finalized files, newest first.
pub async fn list_uploads(
    State(service): State<UploadService>,
    Query(q): Query<ListUploadsQuery>,
) -> Result<Json<ListUploadsResponse>, AppError> {
    let before_seq = match q.continuation_token.as_deref() {
        Some(token) => Some(
            decode_continuation_token(token)
                .ok_or_else(|| AppError::bad_request("Invalid continuation-token"))?,
        ),
        None => None,
    };
    let params = ListUploadsParams {
        before_seq,
        max_keys: q.max_keys.unwrap_or(100),
    };

    let result = service.ledger.list(params).await?;
    Ok(Json(ListUploadsResponse {
        uploads: result.uploads,
        is_truncated: result.is_truncated,
        next_continuation_token: result.next_cursor.map(encode_continuation_token),
    }))
}

/// `GET /uploads/{id}`: one finalized file's record.
pub async fn get_upload(
    State(service): State<UploadService>,
    Path(id): Path<String>,
) -> Result<Json<StoredUpload>, AppError> {
    let id = Uuid::parse_str(&id).map_err(|_| AppError::not_found(format!("upload `{}` not found", id)))?;
    Ok(Json(service.ledger.get(id).await?))
}

fn encode_continuation_token(seq: i64) -> String {
    general_purpose::STANDARD.encode(seq.to_string())
}

fn decode_continuation_token(token: &str) -> Option<i64> {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|s| s.parse().ok())
}
