//! Represents a finalized file recorded in the uploads ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Values of the `source` column.
pub const SOURCE_CHUNKED: &str = "chunked";
pub const SOURCE_TUS: &str = "tus";

/// A durable, uniquely named file in the output directory.
///
/// The row stores metadata only; the bytes live at
/// `upload_dir/{stored_name}` and are never rewritten.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredUpload {
    /// Insertion order, used as the listing cursor. Zero until recorded.
    #[serde(skip)]
    pub seq: i64,

    /// Public identifier.
    pub id: Uuid,

    /// Session (or tus upload ID) the file was assembled from.
    pub session_id: String,

    /// Filename the client declared, before sanitization.
    pub original_filename: String,

    /// `<token>_<timestamp>_<sanitized name>` inside the output directory.
    pub stored_name: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of the final bytes when it was computed during reassembly.
    pub etag: Option<String>,

    /// Declared chunk count; absent for uploads that arrived whole.
    pub total_chunks: Option<i64>,

    /// `chunked` or `tus`.
    pub source: String,

    /// When the file was finalized.
    pub created_at: DateTime<Utc>,
}
