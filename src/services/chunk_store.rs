//! ChunkStore: persists numbered chunks beneath
//! `staging_dir/{session_id}/chunk_{index}`.
//!
//! Each chunk is streamed into a uniquely named `.part` sibling, synced, and
//! renamed into place, so a chunk file only ever exists in its complete
//! form. Out-of-order arrival and resends are both fine: a resend simply
//! replaces the file, last rename wins.

use std::{
    collections::BTreeSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tokio::{
    fs::{self, File},
    io::AsyncRead,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    error::{UploadError, UploadResult},
    transfer,
};
use crate::models::session::SessionId;

const CHUNK_PREFIX: &str = "chunk_";
const PART_SUFFIX: &str = ".part";

#[derive(Clone, Debug)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &SessionId) -> PathBuf {
        self.root.join(session_id.as_str())
    }

    pub fn chunk_path(&self, session_id: &SessionId, index: u32) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{}{}", CHUNK_PREFIX, index))
    }

    /// Stream `src` into the chunk slot `index` of `session_id`.
    ///
    /// Creates the session directory on first use. On any failure the
    /// partial file is removed and the slot keeps whatever it held before.
    pub async fn write_chunk<R>(
        &self,
        session_id: &SessionId,
        index: u32,
        src: &mut R,
        cancel: &CancellationToken,
    ) -> UploadResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| UploadError::ChunkWrite { index, source })?;

        let final_path = self.chunk_path(session_id, index);
        let part_path = dir.join(format!(
            "{}{}.{}{}",
            CHUNK_PREFIX,
            index,
            Uuid::new_v4().simple(),
            PART_SUFFIX
        ));
        let mut file = File::create(&part_path)
            .await
            .map_err(|source| UploadError::ChunkWrite { index, source })?;

        let written = match transfer::copy(&mut file, src, cancel).await {
            Ok(n) => n,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&part_path).await;
                return Err(UploadError::chunk_write(index, err));
            }
        };
        if let Err(source) = file.sync_all().await {
            drop(file);
            let _ = fs::remove_file(&part_path).await;
            return Err(UploadError::ChunkWrite { index, source });
        }
        drop(file);

        if let Err(source) = fs::rename(&part_path, &final_path).await {
            let _ = fs::remove_file(&part_path).await;
            return Err(UploadError::ChunkWrite { index, source });
        }

        debug!(session_id = %session_id, chunk_index = index, bytes = written, "chunk persisted");
        Ok(written)
    }

    /// Indices of the complete chunk files currently in staging.
    pub async fn persisted_indices(&self, session_id: &SessionId) -> UploadResult<BTreeSet<u32>> {
        let mut indices = BTreeSet::new();
        let mut entries = match fs::read_dir(self.session_dir(session_id)).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(indices),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(index) = entry
                .file_name()
                .to_str()
                .and_then(parse_chunk_name)
            {
                indices.insert(index);
            }
        }
        Ok(indices)
    }

    /// Remove a session's directory and everything in it. Missing is fine.
    pub async fn purge_session(&self, session_id: &SessionId) -> UploadResult<()> {
        let dir = self.session_dir(session_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(session_id = %session_id, "purged staging directory");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Names of session directories not modified since `cutoff`.
    pub async fn stale_session_dirs(&self, cutoff: SystemTime) -> UploadResult<Vec<String>> {
        let mut stale = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(stale),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_dir() || meta.modified()? >= cutoff {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                stale.push(name.to_string());
            }
        }
        Ok(stale)
    }

    /// Ensure the staging root exists and is empty.
    ///
    /// Runs once at startup: nothing in staging survives a restart.
    /// Returns the number of entries removed.
    pub async fn reset(&self) -> UploadResult<usize> {
        fs::create_dir_all(&self.root).await?;
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(err) => warn!("failed to remove stale staging entry {}: {}", path.display(), err),
            }
        }
        Ok(removed)
    }
}

/// `chunk_7` -> 7. Partial files and anything else -> None.
fn parse_chunk_name(name: &str) -> Option<u32> {
    name.strip_prefix(CHUNK_PREFIX)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn sid(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn writes_one_file_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let session = sid("up_abc");
        let token = CancellationToken::new();

        let mut first: &[u8] = b"first";
        let mut third: &[u8] = b"third!";
        assert_eq!(store.write_chunk(&session, 0, &mut first, &token).await.unwrap(), 5);
        assert_eq!(store.write_chunk(&session, 2, &mut third, &token).await.unwrap(), 6);

        assert_eq!(
            std::fs::read(dir.path().join("up_abc").join("chunk_2")).unwrap(),
            b"third!"
        );
        let indices = store.persisted_indices(&session).await.unwrap();
        assert_eq!(indices.into_iter().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[tokio::test]
    async fn resend_replaces_previous_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let session = sid("resend");
        let token = CancellationToken::new();

        let mut original: &[u8] = b"original bytes";
        let mut resent: &[u8] = b"new";
        store.write_chunk(&session, 0, &mut original, &token).await.unwrap();
        store.write_chunk(&session, 0, &mut resent, &token).await.unwrap();

        assert_eq!(std::fs::read(store.chunk_path(&session, 0)).unwrap(), b"new");
        assert_eq!(store.persisted_indices(&session).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_write_leaves_no_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let session = sid("cancelled");

        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tx.write_all(b"partial").await.unwrap();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let err = store
            .write_chunk(&session, 1, &mut rx, &token)
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Cancelled));
        assert!(store.persisted_indices(&session).await.unwrap().is_empty());
        let leftovers: Vec<_> = std::fs::read_dir(store.session_dir(&session))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
        drop(tx);
    }

    #[tokio::test]
    async fn reset_clears_stale_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("staging");
        std::fs::create_dir_all(root.join("old_session")).unwrap();
        std::fs::write(root.join("old_session").join("chunk_0"), b"x").unwrap();
        std::fs::write(root.join("stray"), b"y").unwrap();

        let store = ChunkStore::new(&root);
        assert_eq!(store.reset().await.unwrap(), 2);
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn purge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let session = sid("gone");
        let mut data: &[u8] = b"x";
        store
            .write_chunk(&session, 0, &mut data, &CancellationToken::new())
            .await
            .unwrap();

        store.purge_session(&session).await.unwrap();
        store.purge_session(&session).await.unwrap();
        assert!(!store.session_dir(&session).exists());
    }

    #[tokio::test]
    async fn stale_dirs_respect_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("orphan")).unwrap();

        let past = SystemTime::now() - std::time::Duration::from_secs(3600);
        let future = SystemTime::now() + std::time::Duration::from_secs(3600);
        assert!(store.stale_session_dirs(past).await.unwrap().is_empty());
        assert_eq!(store.stale_session_dirs(future).await.unwrap(), vec!["orphan"]);
    }

    #[test]
    fn chunk_names_parse_strictly() {
        assert_eq!(parse_chunk_name("chunk_12"), Some(12));
        assert_eq!(parse_chunk_name("chunk_12.3f2a.part"), None);
        assert_eq!(parse_chunk_name("assembled"), None);
    }
}
