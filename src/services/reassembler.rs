//! Reassembler: concatenates a session's chunks into one staging artifact.

use std::{io::ErrorKind, path::PathBuf};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    chunk_store::ChunkStore,
    error::{UploadError, UploadResult},
    transfer::{self, Md5Writer},
};
use crate::models::session::SessionId;

const ARTIFACT_NAME: &str = "assembled";

/// A fully reassembled, size-verified file still inside staging.
#[derive(Clone, Debug)]
pub struct StagedArtifact {
    pub session_id: SessionId,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// MD5 of the artifact bytes, lowercase hex.
    pub etag: String,
}

#[derive(Clone, Debug)]
pub struct Reassembler {
    store: ChunkStore,
}

impl Reassembler {
    pub fn new(store: ChunkStore) -> Self {
        Self { store }
    }

    pub fn artifact_path(&self, session_id: &SessionId) -> PathBuf {
        self.store.session_dir(session_id).join(ARTIFACT_NAME)
    }

    /// Stream chunks `0..total_chunks` into the session's artifact, in
    /// ascending index order, and verify the result is `total_size` bytes.
    ///
    /// Directory listing order is never consulted. On a size mismatch the
    /// artifact is left in staging for inspection.
    pub async fn reassemble(
        &self,
        session_id: &SessionId,
        total_chunks: u32,
        total_size: u64,
        cancel: &CancellationToken,
    ) -> UploadResult<StagedArtifact> {
        let present = self.store.persisted_indices(session_id).await?;
        if let Some(index) = (0..total_chunks).find(|i| !present.contains(i)) {
            warn!(session_id = %session_id, chunk_index = index, "chunk missing before reassembly");
            return Err(UploadError::MissingChunk { index });
        }

        let path = self.artifact_path(session_id);
        let file = File::create(&path).await?;
        let mut out = Md5Writer::new(file);

        for index in 0..total_chunks {
            let chunk_path = self.store.chunk_path(session_id, index);
            let mut chunk = match File::open(&chunk_path).await {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    warn!(session_id = %session_id, chunk_index = index, "chunk missing at reassembly");
                    return Err(UploadError::MissingChunk { index });
                }
                Err(err) => return Err(err.into()),
            };
            transfer::copy(&mut out, &mut chunk, cancel)
                .await
                .map_err(UploadError::from_transfer)?;
        }

        out.flush().await?;
        let (file, etag, _) = out.finish();
        file.sync_all().await?;
        drop(file);

        let actual = fs::metadata(&path).await?.len();
        if actual != total_size {
            warn!(
                session_id = %session_id,
                expected = total_size,
                actual,
                "reassembled artifact size mismatch; leaving staging intact"
            );
            return Err(UploadError::SizeMismatch {
                expected: total_size,
                actual,
            });
        }

        info!(session_id = %session_id, total_chunks, bytes = actual, "reassembled upload");
        Ok(StagedArtifact {
            session_id: session_id.clone(),
            path,
            size_bytes: actual,
            etag,
        })
    }
}
