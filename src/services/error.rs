//! Error taxonomy shared by the upload pipeline.

use std::io;
use thiserror::Error;

use super::transfer::TransferError;

#[derive(Debug, Error)]
pub enum UploadError {
    /// Missing or malformed request input. No state was changed.
    #[error("{0}")]
    Validation(String),
    /// Persisting a chunk failed; the client is expected to resend it.
    #[error("writing chunk {index} failed: {source}")]
    ChunkWrite {
        index: u32,
        #[source]
        source: io::Error,
    },
    #[error("chunk {index} is missing from staging")]
    MissingChunk { index: u32 },
    #[error("reassembled size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("finalizing upload failed: {0}")]
    Finalize(#[source] io::Error),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("upload `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

impl UploadError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Classify a failed copy into a chunk index.
    pub(crate) fn chunk_write(index: u32, err: TransferError) -> Self {
        match err {
            TransferError::Cancelled(_) => Self::Cancelled,
            other => Self::ChunkWrite {
                index,
                source: other.into_io(),
            },
        }
    }

    /// Classify a failed copy during reassembly or relocation.
    pub(crate) fn from_transfer(err: TransferError) -> Self {
        match err {
            TransferError::Cancelled(_) => Self::Cancelled,
            other => Self::Io(other.into_io()),
        }
    }
}
