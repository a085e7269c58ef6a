//! src/services/upload_service.rs
//!
//! UploadService: ties the chunk store, session tracker, reassembler,
//! finalizer and ledger into the per-request upload flow:
//!
//! chunk request -> admit -> persist chunk -> record -> (complete?) claim ->
//! reassemble -> finalize -> ledger.
//!
//! Reassembly and finalization run on a spawned task bound to the service's
//! shutdown token rather than the request's, so a client disconnecting on
//! its last chunk can neither abort a half-done finalization nor strand the
//! session's claim.

use chrono::Utc;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{fs, io::AsyncRead, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    chunk_store::ChunkStore,
    error::{UploadError, UploadResult},
    finalizer::{FinalizedFile, Finalizer},
    ledger::UploadLedger,
    reassembler::Reassembler,
    session_tracker::{Admission, Progress, SessionTracker},
};
use crate::{
    config::AppConfig,
    models::{
        session::{ChunkUpload, SessionId},
        upload::{SOURCE_CHUNKED, SOURCE_TUS, StoredUpload},
    },
};

/// What a chunk request achieved.
#[derive(Debug)]
pub enum ChunkOutcome {
    InProgress(Progress),
    /// Another request already claimed the session for finalization.
    Finalizing(Progress),
    Complete(StoredUpload),
}

/// Request limits taken from configuration.
#[derive(Clone, Copy, Debug)]
pub struct UploadLimits {
    pub max_upload_size: u64,
    pub max_memory: u64,
    pub request_timeout: Duration,
}

/// A completed tus upload handed over by the hook endpoint.
#[derive(Clone, Debug)]
pub struct ExternalUpload {
    pub upload_id: String,
    pub source: PathBuf,
    pub info_path: Option<PathBuf>,
    pub filename: String,
    pub size: u64,
}

#[derive(Clone)]
pub struct UploadService {
    pub store: ChunkStore,
    pub tracker: Arc<SessionTracker>,
    pub reassembler: Reassembler,
    pub finalizer: Finalizer,
    pub ledger: UploadLedger,
    pub limits: UploadLimits,
    pub tus_dir: Option<PathBuf>,
    shutdown: CancellationToken,
}

impl UploadService {
    pub fn new(cfg: &AppConfig, ledger: UploadLedger, shutdown: CancellationToken) -> Self {
        let store = ChunkStore::new(&cfg.staging_dir);
        Self {
            reassembler: Reassembler::new(store.clone()),
            finalizer: Finalizer::new(&cfg.upload_dir, store.clone()),
            store,
            tracker: Arc::new(SessionTracker::new()),
            ledger,
            limits: UploadLimits {
                max_upload_size: cfg.max_upload_size,
                max_memory: cfg.max_memory,
                request_timeout: cfg.request_timeout,
            },
            tus_dir: cfg.tus_dir.clone(),
            shutdown,
        }
    }

    /// Startup housekeeping: empty staging, drop interrupted copies, and
    /// make sure the schema exists.
    pub async fn prepare(&self) -> UploadResult<()> {
        let stale = self.store.reset().await?;
        if stale > 0 {
            info!("removed {} stale staging entries", stale);
        }
        self.finalizer.sweep_partials().await?;
        self.ledger.migrate().await?;
        Ok(())
    }

    /// Cancellation token for one request.
    ///
    /// Fires on process shutdown, after the configured request timeout, or
    /// when the caller drops the token's guard.
    pub fn request_token(&self) -> CancellationToken {
        let token = self.shutdown.child_token();
        let timeout = self.limits.request_timeout;
        let watched = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    warn!("request exceeded {:?}, cancelling transfer", timeout);
                    watched.cancel();
                }
                _ = watched.cancelled() => {}
            }
        });
        token
    }

    /// Persist one chunk and, if it completes its session, reassemble and
    /// finalize the file.
    pub async fn accept_chunk<R>(
        &self,
        upload: &ChunkUpload,
        body: &mut R,
        cancel: &CancellationToken,
    ) -> UploadResult<ChunkOutcome>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if upload.manifest.total_size > self.limits.max_upload_size {
            return Err(UploadError::validation(format!(
                "total_size {} exceeds the {} byte limit",
                upload.manifest.total_size, self.limits.max_upload_size
            )));
        }

        let session_id = &upload.session_id;
        match self
            .tracker
            .admit(session_id, &upload.manifest, upload.chunk_index)
            .await?
        {
            Admission::Accepted => {}
            Admission::Finalizing(progress) => return Ok(ChunkOutcome::Finalizing(progress)),
            Admission::Finished(stored) => return Ok(ChunkOutcome::Complete(stored)),
        }

        self.store
            .write_chunk(session_id, upload.chunk_index, body, cancel)
            .await?;

        let progress = match self
            .tracker
            .record_chunk_and_check_complete(session_id, upload.chunk_index)
            .await
        {
            Ok(progress) => progress,
            // Finalized while this duplicate was being written.
            Err(UploadError::NotFound(_)) => {
                let total = upload.manifest.total_chunks;
                return Ok(ChunkOutcome::Finalizing(Progress {
                    received: total,
                    total,
                    complete: true,
                }));
            }
            Err(err) => return Err(err),
        };
        if !progress.complete {
            return Ok(ChunkOutcome::InProgress(progress));
        }
        if !self.tracker.try_claim(session_id).await {
            return Ok(ChunkOutcome::Finalizing(progress));
        }

        let service = self.clone();
        let upload = upload.clone();
        let handle: JoinHandle<UploadResult<StoredUpload>> =
            tokio::spawn(async move { service.complete_session(&upload).await });
        let stored = handle
            .await
            .map_err(|err| UploadError::Io(std::io::Error::other(err)))??;
        Ok(ChunkOutcome::Complete(stored))
    }

    /// Reassemble and finalize a claimed session. Releases the claim on
    /// failure so a resent chunk can trigger another attempt.
    async fn complete_session(&self, upload: &ChunkUpload) -> UploadResult<StoredUpload> {
        let session_id = &upload.session_id;
        let manifest = &upload.manifest;

        let result = async {
            let artifact = self
                .reassembler
                .reassemble(
                    session_id,
                    manifest.total_chunks,
                    manifest.total_size,
                    &self.shutdown,
                )
                .await?;
            let finalized = self
                .finalizer
                .finalize(&artifact, &manifest.filename, &self.shutdown)
                .await?;
            Ok::<_, UploadError>((finalized, artifact.etag))
        }
        .await;

        let (finalized, etag) = match result {
            Ok(done) => done,
            Err(err) => {
                error!(session_id = %session_id, "completing upload failed: {}", err);
                self.tracker.release(session_id).await;
                return Err(err);
            }
        };
        let upload = new_stored_upload(
            session_id.as_str(),
            &manifest.filename,
            &finalized,
            Some(etag),
            Some(i64::from(manifest.total_chunks)),
            SOURCE_CHUNKED,
        );
        let stored = self.record(upload).await;
        self.tracker.finish(session_id, stored.clone()).await;
        Ok(stored)
    }

    /// Move a file completed by tusd into the output directory.
    ///
    /// The source must resolve inside the configured tus directory.
    pub async fn finalize_external(&self, external: &ExternalUpload) -> UploadResult<StoredUpload> {
        let tus_dir = self
            .tus_dir
            .as_deref()
            .ok_or_else(|| UploadError::validation("tus hook is not enabled"))?;
        let source = contained_path(tus_dir, &external.source).await?;

        let actual = fs::metadata(&source).await?.len();
        if actual != external.size {
            return Err(UploadError::SizeMismatch {
                expected: external.size,
                actual,
            });
        }

        let finalized = self
            .finalizer
            .place(&source, &external.filename, &self.shutdown)
            .await?;

        if let Some(info_path) = &external.info_path {
            if let Ok(info_path) = contained_path(tus_dir, info_path).await {
                if let Err(err) = fs::remove_file(&info_path).await {
                    warn!("failed to remove tus info file {}: {}", info_path.display(), err);
                }
            }
        }

        let upload = new_stored_upload(
            &external.upload_id,
            &external.filename,
            &finalized,
            None,
            None,
            SOURCE_TUS,
        );
        Ok(self.record(upload).await)
    }

    /// Write the ledger row. A failure here is logged, not returned: the
    /// final file already exists and stays.
    async fn record(&self, upload: StoredUpload) -> StoredUpload {
        match self.ledger.record(&upload).await {
            Ok(recorded) => recorded,
            Err(err) => {
                error!(stored_name = %upload.stored_name, "failed to record upload in ledger: {}", err);
                upload
            }
        }
    }

    /// Expire sessions idle longer than `ttl` and delete their staging data,
    /// plus any staging directory older than `ttl` that no session owns.
    pub async fn reap_expired(&self, ttl: Duration) -> usize {
        let chrono_ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expired = self.tracker.expire_idle(chrono_ttl, Utc::now()).await;
        for session_id in &expired {
            if let Err(err) = self.store.purge_session(session_id).await {
                warn!(session_id = %session_id, "failed to purge expired session: {}", err);
            }
        }

        let mut reaped = expired.len();
        let Some(cutoff) = SystemTime::now().checked_sub(ttl) else {
            return reaped;
        };
        let stale = match self.store.stale_session_dirs(cutoff).await {
            Ok(stale) => stale,
            Err(err) => {
                warn!("failed to scan staging for orphans: {}", err);
                return reaped;
            }
        };
        for name in stale {
            let Ok(session_id) = SessionId::parse(&name) else {
                continue;
            };
            if self.tracker.progress(&session_id).await.is_some() {
                continue;
            }
            match self.store.purge_session(&session_id).await {
                Ok(()) => {
                    info!(session_id = %session_id, "removed orphaned staging directory");
                    reaped += 1;
                }
                Err(err) => warn!(session_id = %session_id, "failed to purge orphan: {}", err),
            }
        }
        reaped
    }

    /// Background task sweeping idle sessions until shutdown.
    pub fn spawn_reaper(&self, interval: Duration, ttl: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = service.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = service.reap_expired(ttl).await;
                        if reaped > 0 {
                            info!("reaped {} idle upload sessions", reaped);
                        }
                    }
                }
            }
        })
    }
}

fn new_stored_upload(
    session_id: &str,
    original_filename: &str,
    finalized: &FinalizedFile,
    etag: Option<String>,
    total_chunks: Option<i64>,
    source: &str,
) -> StoredUpload {
    StoredUpload {
        seq: 0,
        id: Uuid::new_v4(),
        session_id: session_id.to_string(),
        original_filename: original_filename.to_string(),
        stored_name: finalized.stored_name.clone(),
        size_bytes: i64::try_from(finalized.size_bytes).unwrap_or(i64::MAX),
        etag,
        total_chunks,
        source: source.to_string(),
        created_at: Utc::now(),
    }
}

/// Canonicalize `path` and require it to live under `root`.
async fn contained_path(root: &Path, path: &Path) -> UploadResult<PathBuf> {
    let root = fs::canonicalize(root).await?;
    let resolved = match fs::canonicalize(path).await {
        Ok(resolved) => resolved,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(UploadError::NotFound(path.display().to_string()));
        }
        Err(err) => return Err(err.into()),
    };
    if !resolved.starts_with(&root) {
        return Err(UploadError::validation(format!(
            "{} is outside the tus directory",
            path.display()
        )));
    }
    Ok(resolved)
}
