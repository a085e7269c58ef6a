//! Upload session identity and the metadata a client declares for it.

use serde::Serialize;
use std::fmt;

use crate::services::error::{UploadError, UploadResult};

const MAX_SESSION_ID_LEN: usize = 128;

/// Client-chosen session token, validated to be a single safe path segment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Accepts ASCII letters, digits, `-` and `_` only.
    ///
    /// That alphabet cannot express `/`, `\`, `.` or NUL, so the token can
    /// never climb out of the staging directory.
    pub fn parse(raw: &str) -> UploadResult<Self> {
        if raw.is_empty() {
            return Err(UploadError::validation("upload_id must not be empty"));
        }
        if raw.len() > MAX_SESSION_ID_LEN {
            return Err(UploadError::validation(format!(
                "upload_id must be at most {} characters",
                MAX_SESSION_ID_LEN
            )));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(UploadError::validation(
                "upload_id may only contain letters, digits, '-' and '_'",
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the first chunk of a session declares. Every later chunk must agree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionManifest {
    /// Original filename as sent by the client. Untrusted.
    pub filename: String,
    pub total_chunks: u32,
    pub total_size: u64,
}

/// One inbound chunk request, after form parsing.
#[derive(Clone, Debug)]
pub struct ChunkUpload {
    pub session_id: SessionId,
    pub chunk_index: u32,
    pub manifest: SessionManifest,
}
