//! In-memory registry of active upload sessions.
//!
//! A session is created implicitly by its first chunk. Completion is set
//! equality between the received indices and `0..total_chunks`, and the
//! transition into finalization is a claim only one caller can win.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;

use super::error::{UploadError, UploadResult};
use crate::models::{
    session::{SessionId, SessionManifest},
    upload::StoredUpload,
};

#[derive(Debug)]
enum Phase {
    Receiving,
    /// A reassembly/finalize run owns the session.
    Finalizing,
    /// Finalized; kept until it idles out so resends cannot start over.
    Finished(StoredUpload),
}

#[derive(Debug)]
struct TrackedSession {
    manifest: SessionManifest,
    received: BTreeSet<u32>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    phase: Phase,
}

impl TrackedSession {
    fn new(manifest: SessionManifest, now: DateTime<Utc>) -> Self {
        Self {
            manifest,
            received: BTreeSet::new(),
            created_at: now,
            last_activity: now,
            phase: Phase::Receiving,
        }
    }

    fn is_complete(&self) -> bool {
        self.received.len() == self.manifest.total_chunks as usize
            && (0..self.manifest.total_chunks).all(|i| self.received.contains(&i))
    }

    fn progress(&self) -> Progress {
        Progress {
            received: self.received.len() as u32,
            total: self.manifest.total_chunks,
            complete: self.is_complete(),
        }
    }
}

/// Snapshot of a session's chunk count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub received: u32,
    pub total: u32,
    pub complete: bool,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        f64::from(self.received) / f64::from(self.total) * 100.0
    }
}

/// Result of asking whether a chunk may be written.
#[derive(Debug, Clone)]
pub enum Admission {
    Accepted,
    /// The session is already being reassembled; the chunk must not touch staging.
    Finalizing(Progress),
    /// The session was already finalized into this file.
    Finished(StoredUpload),
}

#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: Mutex<HashMap<SessionId, TrackedSession>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a chunk against its session, creating the session if this
    /// is the first chunk seen for it.
    pub async fn admit(
        &self,
        session_id: &SessionId,
        manifest: &SessionManifest,
        chunk_index: u32,
    ) -> UploadResult<Admission> {
        if manifest.total_chunks == 0 {
            return Err(UploadError::validation("total_chunks must be at least 1"));
        }
        if chunk_index >= manifest.total_chunks {
            return Err(UploadError::validation(format!(
                "chunk_index {} out of range for {} chunks",
                chunk_index, manifest.total_chunks
            )));
        }

        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(session_id.clone())
            .or_insert_with(|| TrackedSession::new(manifest.clone(), now));

        if session.manifest != *manifest {
            return Err(UploadError::validation(format!(
                "upload `{}` was started with different filename, total_chunks or total_size",
                session_id
            )));
        }
        match &session.phase {
            Phase::Receiving => {
                session.last_activity = now;
                Ok(Admission::Accepted)
            }
            Phase::Finalizing => Ok(Admission::Finalizing(session.progress())),
            Phase::Finished(stored) => Ok(Admission::Finished(stored.clone())),
        }
    }

    /// Record a persisted chunk and report whether the set is now complete.
    pub async fn record_chunk_and_check_complete(
        &self,
        session_id: &SessionId,
        chunk_index: u32,
    ) -> UploadResult<Progress> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| UploadError::NotFound(session_id.to_string()))?;
        session.received.insert(chunk_index);
        session.last_activity = Utc::now();
        Ok(session.progress())
    }

    /// Atomically move a complete session into finalization.
    ///
    /// Returns true for exactly one caller per completion; everyone else
    /// sees false.
    pub async fn try_claim(&self, session_id: &SessionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(session_id) {
            Some(session) if session.is_complete() && matches!(session.phase, Phase::Receiving) => {
                session.phase = Phase::Finalizing;
                true
            }
            _ => false,
        }
    }

    /// Give up a claim after a failed run so a resent chunk can retry.
    pub async fn release(&self, session_id: &SessionId) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id) {
            if matches!(session.phase, Phase::Finalizing) {
                session.phase = Phase::Receiving;
            }
            session.last_activity = Utc::now();
        }
    }

    /// Mark a session finalized. The entry stays as a tombstone until
    /// [`SessionTracker::expire_idle`] drops it.
    pub async fn finish(&self, session_id: &SessionId, stored: StoredUpload) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.phase = Phase::Finished(stored);
            session.last_activity = Utc::now();
        }
    }

    pub async fn progress(&self, session_id: &SessionId) -> Option<Progress> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).map(TrackedSession::progress)
    }

    /// Drop sessions with no chunk activity for longer than `ttl` and
    /// return the ids of unfinished ones. Sessions being finalized are never
    /// expired; finished tombstones are dropped silently.
    pub async fn expire_idle(&self, ttl: Duration, now: DateTime<Utc>) -> Vec<SessionId> {
        let Some(cutoff) = now.checked_sub_signed(ttl) else {
            return Vec::new();
        };
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, s)| !matches!(s.phase, Phase::Finalizing) && s.last_activity < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        let mut abandoned = Vec::with_capacity(expired.len());
        for id in expired {
            let Some(session) = sessions.remove(&id) else {
                continue;
            };
            if matches!(session.phase, Phase::Finished(_)) {
                continue;
            }
            tracing::info!(
                session_id = %id,
                received = session.received.len(),
                total = session.manifest.total_chunks,
                age_secs = (now - session.created_at).num_seconds(),
                "expiring idle upload session"
            );
            abandoned.push(id);
        }
        abandoned
    }

    /// Sessions still receiving or being finalized.
    pub async fn active_sessions(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .filter(|s| !matches!(s.phase, Phase::Finished(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sid(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    fn manifest(total_chunks: u32) -> SessionManifest {
        SessionManifest {
            filename: "clip.mp4".into(),
            total_chunks,
            total_size: 100,
        }
    }

    fn stored(id: &SessionId) -> StoredUpload {
        StoredUpload {
            seq: 1,
            id: uuid::Uuid::new_v4(),
            session_id: id.to_string(),
            original_filename: "clip.mp4".into(),
            stored_name: "0badf00d_20240101000000_clip.mp4".into(),
            size_bytes: 100,
            etag: None,
            total_chunks: Some(1),
            source: crate::models::upload::SOURCE_CHUNKED.into(),
            created_at: Utc::now(),
        }
    }

    async fn receive(tracker: &SessionTracker, id: &SessionId, m: &SessionManifest, idx: u32) -> Progress {
        assert!(matches!(tracker.admit(id, m, idx).await.unwrap(), Admission::Accepted));
        tracker.record_chunk_and_check_complete(id, idx).await.unwrap()
    }

    #[tokio::test]
    async fn completes_once_every_index_is_present() {
        let tracker = SessionTracker::new();
        let id = sid("s1");
        let m = manifest(3);

        assert!(!receive(&tracker, &id, &m, 2).await.complete);
        assert!(!receive(&tracker, &id, &m, 0).await.complete);
        let progress = receive(&tracker, &id, &m, 1).await;
        assert!(progress.complete);
        assert_eq!(progress.received, 3);
        assert_eq!(progress.percent(), 100.0);
    }

    #[tokio::test]
    async fn duplicate_index_does_not_mask_a_missing_one() {
        let tracker = SessionTracker::new();
        let id = sid("dup");
        let m = manifest(3);

        receive(&tracker, &id, &m, 0).await;
        receive(&tracker, &id, &m, 1).await;
        let progress = receive(&tracker, &id, &m, 1).await;

        assert_eq!(progress.received, 2);
        assert!(!progress.complete);
    }

    #[tokio::test]
    async fn rejects_out_of_range_and_inconsistent_chunks() {
        let tracker = SessionTracker::new();
        let id = sid("bad");

        assert!(matches!(
            tracker.admit(&id, &manifest(2), 2).await,
            Err(UploadError::Validation(_))
        ));
        assert!(matches!(
            tracker.admit(&id, &manifest(0), 0).await,
            Err(UploadError::Validation(_))
        ));

        tracker.admit(&id, &manifest(2), 0).await.unwrap();
        let mut changed = manifest(2);
        changed.total_size = 999;
        assert!(matches!(
            tracker.admit(&id, &changed, 1).await,
            Err(UploadError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn only_one_concurrent_claim_wins() {
        let tracker = Arc::new(SessionTracker::new());
        let id = sid("race");
        let m = manifest(1);
        receive(&tracker, &id, &m, 0).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let tracker = tracker.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move { tracker.try_claim(&id).await }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        assert!(matches!(
            tracker.admit(&id, &m, 0).await.unwrap(),
            Admission::Finalizing(_)
        ));
    }

    #[tokio::test]
    async fn released_claim_can_be_retaken() {
        let tracker = SessionTracker::new();
        let id = sid("retry");
        let m = manifest(1);
        receive(&tracker, &id, &m, 0).await;

        assert!(tracker.try_claim(&id).await);
        tracker.release(&id).await;
        assert!(tracker.try_claim(&id).await);

        tracker.finish(&id, stored(&id)).await;
        assert!(!tracker.try_claim(&id).await);
        assert_eq!(tracker.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn finished_session_answers_resends_with_its_file() {
        let tracker = SessionTracker::new();
        let id = sid("done");
        let m = manifest(1);
        receive(&tracker, &id, &m, 0).await;
        assert!(tracker.try_claim(&id).await);
        tracker.finish(&id, stored(&id)).await;

        let Admission::Finished(file) = tracker.admit(&id, &m, 0).await.unwrap() else {
            panic!("a finalized session must not accept chunks again");
        };
        assert_eq!(file.stored_name, "0badf00d_20240101000000_clip.mp4");
        assert!(!tracker.try_claim(&id).await);
    }

    #[tokio::test]
    async fn finished_sessions_expire_quietly() {
        let tracker = SessionTracker::new();
        let id = sid("gone");
        receive(&tracker, &id, &manifest(1), 0).await;
        assert!(tracker.try_claim(&id).await);
        tracker.finish(&id, stored(&id)).await;

        let later = Utc::now() + Duration::hours(2);
        assert!(tracker.expire_idle(Duration::hours(1), later).await.is_empty());
        assert!(tracker.progress(&id).await.is_none());
    }

    #[tokio::test]
    async fn incomplete_session_cannot_be_claimed() {
        let tracker = SessionTracker::new();
        let id = sid("partial");
        receive(&tracker, &id, &manifest(2), 0).await;
        assert!(!tracker.try_claim(&id).await);
    }

    #[tokio::test]
    async fn expires_idle_sessions_but_not_finalizing_ones() {
        let tracker = SessionTracker::new();
        let idle = sid("idle");
        let busy = sid("busy");
        receive(&tracker, &idle, &manifest(2), 0).await;
        receive(&tracker, &busy, &manifest(1), 0).await;
        assert!(tracker.try_claim(&busy).await);

        let later = Utc::now() + Duration::hours(2);
        let expired = tracker.expire_idle(Duration::hours(1), later).await;

        assert_eq!(expired, vec![idle.clone()]);
        assert!(tracker.progress(&idle).await.is_none());
        assert!(tracker.progress(&busy).await.is_some());
    }
}
