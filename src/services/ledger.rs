//! UploadLedger: SQLite record of every finalized file.
//!
//! The ledger is informational: files in the output directory are the
//! source of truth, rows describe them.

use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::error::{UploadError, UploadResult};
use crate::models::upload::StoredUpload;

/// Schema applied at startup and by `--migrate`.
const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const MAX_LIST_KEYS: usize = 1000;

#[derive(Clone, Debug)]
pub struct ListUploadsParams {
    /// Only return rows older than this cursor.
    pub before_seq: Option<i64>,
    pub max_keys: usize,
}

#[derive(Debug)]
pub struct ListUploadsResult {
    pub uploads: Vec<StoredUpload>,
    pub is_truncated: bool,
    pub next_cursor: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct UploadLedger {
    db: Arc<SqlitePool>,
}

impl UploadLedger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Run the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> UploadResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Insert a row and return the recorded copy with its `seq` assigned.
    pub async fn record(&self, upload: &StoredUpload) -> UploadResult<StoredUpload> {
        let recorded = sqlx::query_as::<_, StoredUpload>(
            r#"
            INSERT INTO uploads (
                id, session_id, original_filename, stored_name, size_bytes,
                etag, total_chunks, source, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING seq, id, session_id, original_filename, stored_name, size_bytes,
                      etag, total_chunks, source, created_at
            "#,
        )
        .bind(upload.id)
        .bind(&upload.session_id)
        .bind(&upload.original_filename)
        .bind(&upload.stored_name)
        .bind(upload.size_bytes)
        .bind(&upload.etag)
        .bind(upload.total_chunks)
        .bind(&upload.source)
        .bind(upload.created_at)
        .fetch_one(&*self.db)
        .await?;
        Ok(recorded)
    }

    pub async fn get(&self, id: Uuid) -> UploadResult<StoredUpload> {
        sqlx::query_as::<_, StoredUpload>(
            "SELECT seq, id, session_id, original_filename, stored_name, size_bytes,
                    etag, total_chunks, source, created_at
             FROM uploads WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => UploadError::NotFound(id.to_string()),
            other => UploadError::Sqlx(other),
        })
    }

    /// List rows newest first, paging backwards by `seq`.
    pub async fn list(&self, params: ListUploadsParams) -> UploadResult<ListUploadsResult> {
        let max_keys = params.max_keys.clamp(1, MAX_LIST_KEYS);
        let fetch_limit = max_keys + 1;

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT seq, id, session_id, original_filename, stored_name, size_bytes, \
             etag, total_chunks, source, created_at FROM uploads",
        );
        if let Some(cursor) = params.before_seq {
            builder.push(" WHERE seq < ");
            builder.push_bind(cursor);
        }
        builder.push(" ORDER BY seq DESC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut rows: Vec<StoredUpload> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut is_truncated = false;
        let mut next_cursor = None;
        if rows.len() == fetch_limit {
            rows.pop();
            next_cursor = rows.last().map(|row| row.seq);
            is_truncated = true;
        }

        Ok(ListUploadsResult {
            uploads: rows,
            is_truncated,
            next_cursor,
        })
    }

    pub async fn ping(&self) -> UploadResult<()> {
        let one = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        if one == 1 {
            Ok(())
        } else {
            Err(UploadError::Io(std::io::Error::other(format!(
                "unexpected result: {}",
                one
            ))))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::upload::SOURCE_CHUNKED;
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Fresh migrated in-memory ledger. One connection, so every query sees
    /// the same database.
    pub(crate) async fn memory_ledger() -> UploadLedger {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let ledger = UploadLedger::new(Arc::new(pool));
        ledger.migrate().await.unwrap();
        ledger
    }

    fn sample(name: &str) -> StoredUpload {
        StoredUpload {
            seq: 0,
            id: Uuid::new_v4(),
            session_id: format!("session_{name}"),
            original_filename: name.to_string(),
            stored_name: format!("deadbeef_20240101000000_{name}"),
            size_bytes: 42,
            etag: Some("abc".into()),
            total_chunks: Some(2),
            source: SOURCE_CHUNKED.into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn records_and_fetches() {
        let ledger = memory_ledger().await;
        let upload = sample("a.mp4");

        let recorded = ledger.record(&upload).await.unwrap();
        assert!(recorded.seq > 0);

        let fetched = ledger.get(upload.id).await.unwrap();
        assert_eq!(fetched.stored_name, upload.stored_name);
        assert_eq!(fetched.total_chunks, Some(2));
        assert!(matches!(
            ledger.get(Uuid::new_v4()).await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let ledger = memory_ledger().await;
        ledger.migrate().await.unwrap();
        ledger.ping().await.unwrap();
    }

    #[tokio::test]
    async fn lists_newest_first_with_cursor() {
        let ledger = memory_ledger().await;
        for name in ["1.mp4", "2.mp4", "3.mp4"] {
            ledger.record(&sample(name)).await.unwrap();
        }

        let page = ledger
            .list(ListUploadsParams {
                before_seq: None,
                max_keys: 2,
            })
            .await
            .unwrap();
        let names: Vec<_> = page.uploads.iter().map(|u| u.original_filename.as_str()).collect();
        assert_eq!(names, vec!["3.mp4", "2.mp4"]);
        assert!(page.is_truncated);

        let rest = ledger
            .list(ListUploadsParams {
                before_seq: page.next_cursor,
                max_keys: 2,
            })
            .await
            .unwrap();
        assert_eq!(rest.uploads.len(), 1);
        assert_eq!(rest.uploads[0].original_filename, "1.mp4");
        assert!(!rest.is_truncated);
    }
}
