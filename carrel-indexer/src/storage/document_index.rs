//! SQLite-backed document persistence and the chunk index.
//!
//! One database holds three tables: `documents` (the status tracker's
//! records), `chunks` (the searchable chunk store), and `index_jobs` (the
//! durable queue, whose schema and lifecycle live in
//! [`crate::pipeline::job_queue`]). Multi-table mutations that must be
//! atomic (intake, re-index, delete, and the worker's terminal commits)
//! run as single transactions here.
//!
//! Status transitions are compare-and-set: every UPDATE carries the
//! expected current status in its WHERE clause, and an affected-row count
//! of zero means the caller lost a race and must discard its result.
//! Terminal commits additionally delete the job row guarded by the lease
//! owner, so only the worker that still holds the lease can commit.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tracing::{debug, error};

use crate::error::{PipelineError, Result};
use crate::storage::query::{DocumentFilter, DocumentPage, DocumentStats, SqlBind};
use crate::storage::{
    BlobRef, ChunkDraft, ChunkIndexer, ChunkRecord, Document, DocumentCategory, DocumentDraft,
    DocumentId, IndexState, IndexStatus,
};

/// Database file name under the base directory.
pub const DB_FILE_NAME: &str = "carrel.db";

pub(crate) fn ts_to_datetime(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| PipelineError::Internal(format!("timestamp {ts} out of range")))
}

/// Outcome of a document deletion. `blob_in_use` is true when another
/// document still references the same content-addressed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedDocument {
    pub blob_ref: BlobRef,
    pub blob_in_use: bool,
}

/// Handle to the document database. Cheap to clone; all clones share one
/// connection pool.
#[derive(Debug, Clone)]
pub struct DocumentIndex {
    pool: SqlitePool,
}

impl DocumentIndex {
    /// Open (creating if needed) the database under `base_dir`.
    pub async fn open(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir)?;
        let options = SqliteConnectOptions::new()
            .filename(base_dir.join(DB_FILE_NAME))
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true)
            .create_if_missing(true)
            .optimize_on_close(true, None);
        let pool = SqlitePool::connect_with(options).await?;
        let index = Self { pool };
        index.create_tables().await?;
        Ok(index)
    }

    /// Open an in-memory database. Each SQLite `:memory:` connection is its
    /// own database, so the pool is capped at a single connection.
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let index = Self { pool };
        index.create_tables().await?;
        Ok(index)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                uploaded_by INTEGER NOT NULL,
                file_name TEXT NOT NULL,
                blob_ref TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                file_type TEXT NOT NULL,
                category TEXT NOT NULL,
                description TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                index_status TEXT NOT NULL DEFAULT 'PENDING',
                indexed_at INTEGER,
                chunk_count INTEGER,
                error_message TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                ordinal INTEGER NOT NULL,
                text TEXT NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(document_id, ordinal)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_project ON documents(project_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(index_status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_created ON documents(created_at DESC, id DESC)",
        )
        .execute(&self.pool)
        .await?;

        crate::pipeline::job_queue::create_job_tables(&self.pool).await?;
        Ok(())
    }

    /// Insert a new document in `PENDING` together with its first job, as
    /// one transaction. Returns the created record.
    pub async fn create_document(&self, draft: &DocumentDraft) -> Result<Document> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "INSERT INTO documents (
                project_id, uploaded_by, file_name, blob_ref, file_size,
                mime_type, file_type, category, description,
                created_at, updated_at, index_status
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(draft.project_id)
        .bind(draft.uploaded_by)
        .bind(&draft.file_name)
        .bind(&draft.blob_ref)
        .bind(draft.file_size)
        .bind(&draft.mime_type)
        .bind(&draft.file_type)
        .bind(draft.category.as_str())
        .bind(&draft.description)
        .bind(now)
        .bind(now)
        .bind(IndexStatus::Pending.as_str())
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        sqlx::query("INSERT INTO index_jobs (document_id, attempt, enqueued_at) VALUES (?, 1, ?)")
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(document_id = id, file_name = %draft.file_name, "document created");
        Ok(Document {
            id,
            project_id: draft.project_id,
            uploaded_by: draft.uploaded_by,
            file_name: draft.file_name.clone(),
            blob_ref: draft.blob_ref.clone(),
            file_size: draft.file_size,
            mime_type: draft.mime_type.clone(),
            file_type: draft.file_type.clone(),
            category: draft.category,
            description: draft.description.clone(),
            created_at: ts_to_datetime(now)?,
            updated_at: ts_to_datetime(now)?,
            state: IndexState::Pending,
        })
    }

    pub async fn get_document(&self, document_id: DocumentId) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_document(&r)).transpose()
    }

    /// Reset a terminal document to `PENDING`, drop its stale chunks, and
    /// enqueue a fresh job, as one transaction. Fails with `InvalidState`
    /// when the document is currently `PENDING` or `PROCESSING`, and with
    /// `NotFound` when it does not exist.
    pub async fn request_reindex(&self, document_id: DocumentId) -> Result<Document> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE documents
             SET index_status = ?, indexed_at = NULL, chunk_count = NULL,
                 error_message = NULL, updated_at = ?
             WHERE id = ? AND index_status IN (?, ?)",
        )
        .bind(IndexStatus::Pending.as_str())
        .bind(now)
        .bind(document_id)
        .bind(IndexStatus::Indexed.as_str())
        .bind(IndexStatus::Failed.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let status_row = sqlx::query("SELECT index_status FROM documents WHERE id = ?")
                .bind(document_id)
                .fetch_optional(&mut *tx)
                .await?;
            return match status_row {
                None => Err(PipelineError::NotFound { document_id }),
                Some(row) => {
                    let current = decode_status(&row, document_id)?;
                    Err(PipelineError::InvalidState {
                        document_id,
                        current,
                    })
                }
            };
        }

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO index_jobs (document_id, attempt, enqueued_at) VALUES (?, 1, ?)
             ON CONFLICT(document_id) DO NOTHING",
        )
        .bind(document_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_one(&mut *tx)
            .await?;
        let document = decode_document(&row)?;
        tx.commit().await?;

        debug!(document_id, "re-index requested");
        Ok(document)
    }

    /// Remove a document, its chunks, and any queued job (leased or not),
    /// as one transaction. Blob refs are content-addressed and may be
    /// shared, so the outcome reports whether any surviving document still
    /// points at the blob before the caller cleans up blob storage.
    pub async fn delete_document(&self, document_id: DocumentId) -> Result<DeletedDocument> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT blob_ref FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(PipelineError::NotFound { document_id });
        };
        let blob_ref: String = row.try_get("blob_ref")?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM index_jobs WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE blob_ref = ?")
            .bind(&blob_ref)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(document_id, "document deleted");
        Ok(DeletedDocument {
            blob_ref,
            blob_in_use: remaining > 0,
        })
    }

    /// Move a freshly leased document into `PROCESSING`. Accepts both
    /// `PENDING` (first lease) and `PROCESSING` (re-lease after an expired
    /// lease left the document mid-flight). Returns false when the
    /// document is missing or terminal, which means the job is orphaned.
    pub async fn mark_processing(&self, document_id: DocumentId) -> Result<bool> {
        let now = Utc::now().timestamp();
        let updated = sqlx::query(
            "UPDATE documents SET index_status = ?, updated_at = ?
             WHERE id = ? AND index_status IN (?, ?)",
        )
        .bind(IndexStatus::Processing.as_str())
        .bind(now)
        .bind(document_id)
        .bind(IndexStatus::Pending.as_str())
        .bind(IndexStatus::Processing.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    /// Commit a successful indexing run: `PROCESSING → INDEXED` plus the
    /// lease-guarded removal of the job, atomically. Errors mean the
    /// committing worker lost the race (status moved or lease stolen) and
    /// its result must be discarded.
    pub async fn commit_indexed(
        &self,
        document_id: DocumentId,
        job_id: i64,
        worker_id: &str,
        chunk_count: u32,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE documents
             SET index_status = ?, indexed_at = ?, chunk_count = ?,
                 error_message = NULL, updated_at = ?
             WHERE id = ? AND index_status = ?",
        )
        .bind(IndexStatus::Indexed.as_str())
        .bind(now)
        .bind(i64::from(chunk_count))
        .bind(now)
        .bind(document_id)
        .bind(IndexStatus::Processing.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated != 1 {
            return Err(PipelineError::Internal(format!(
                "stale INDEXED commit for document {document_id} discarded"
            )));
        }
        release_lease(&mut tx, document_id, job_id, worker_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Commit a permanent failure: `PROCESSING → FAILED` with the public
    /// message, drop any partially indexed chunks, and remove the job
    /// (lease-guarded), atomically.
    pub async fn commit_failed(
        &self,
        document_id: DocumentId,
        job_id: i64,
        worker_id: &str,
        error_message: &str,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE documents
             SET index_status = ?, error_message = ?, indexed_at = NULL,
                 chunk_count = NULL, updated_at = ?
             WHERE id = ? AND index_status = ?",
        )
        .bind(IndexStatus::Failed.as_str())
        .bind(error_message)
        .bind(now)
        .bind(document_id)
        .bind(IndexStatus::Processing.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated != 1 {
            return Err(PipelineError::Internal(format!(
                "stale FAILED commit for document {document_id} discarded"
            )));
        }
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        release_lease(&mut tx, document_id, job_id, worker_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Commit a transient failure with attempts remaining: `PROCESSING →
    /// PENDING` and re-enqueue the job with an incremented attempt, its
    /// next eligibility delayed until `not_before`, atomically and
    /// lease-guarded.
    pub async fn commit_retry(
        &self,
        document_id: DocumentId,
        job_id: i64,
        worker_id: &str,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE documents SET index_status = ?, updated_at = ?
             WHERE id = ? AND index_status = ?",
        )
        .bind(IndexStatus::Pending.as_str())
        .bind(now)
        .bind(document_id)
        .bind(IndexStatus::Processing.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated != 1 {
            return Err(PipelineError::Internal(format!(
                "stale retry commit for document {document_id} discarded"
            )));
        }
        let released = sqlx::query(
            "UPDATE index_jobs
             SET attempt = attempt + 1, lease_owner = NULL, visibility_deadline = ?
             WHERE id = ? AND lease_owner = ?",
        )
        .bind(not_before.timestamp())
        .bind(job_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if released != 1 {
            return Err(PipelineError::Internal(format!(
                "lease on job {job_id} no longer held by {worker_id}; retry discarded"
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    /// List documents matching `filter`, newest first (ties broken by id),
    /// with offset pagination. `total_count` covers the whole filtered set
    /// and is read in the same transaction as the page.
    pub async fn list(
        &self,
        filter: &DocumentFilter,
        page: u32,
        page_size: u32,
    ) -> Result<DocumentPage> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 500);
        let (clause, binds) = filter.where_clause(Utc::now());
        let where_sql = if clause.is_empty() {
            String::new()
        } else {
            format!(" WHERE {clause}")
        };

        let count_sql = format!("SELECT COUNT(*) FROM documents{where_sql}");
        let mut count_query = sqlx::query_scalar::<sqlx::Sqlite, i64>(&count_sql);
        for bind in &binds {
            count_query = match bind {
                SqlBind::Int(v) => count_query.bind(*v),
                SqlBind::Text(v) => count_query.bind(v.clone()),
            };
        }
        let mut tx = self.pool.begin().await?;
        let total_count = count_query.fetch_one(&mut *tx).await?;

        let select_sql = format!(
            "SELECT * FROM documents{where_sql}
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        );
        let mut select_query = sqlx::query::<sqlx::Sqlite>(&select_sql);
        for bind in &binds {
            select_query = match bind {
                SqlBind::Int(v) => select_query.bind(*v),
                SqlBind::Text(v) => select_query.bind(v.clone()),
            };
        }
        let offset = i64::from(page - 1) * i64::from(page_size);
        let rows = select_query
            .bind(i64::from(page_size))
            .bind(offset)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        let documents = rows
            .iter()
            .map(decode_document)
            .collect::<Result<Vec<_>>>()?;
        Ok(DocumentPage {
            documents,
            total_count: total_count as u64,
            page,
            page_size,
        })
    }

    /// Aggregate counts, optionally scoped to one project. Every category
    /// is present in the map; the total equals the sum of the counts.
    pub async fn stats(&self, project_id: Option<i64>) -> Result<DocumentStats> {
        let mut counts: std::collections::HashMap<DocumentCategory, u64> = DocumentCategory::ALL
            .iter()
            .map(|category| (*category, 0u64))
            .collect();

        let sql = match project_id {
            Some(_) => {
                "SELECT category, COUNT(*) AS n FROM documents WHERE project_id = ? GROUP BY category"
            }
            None => "SELECT category, COUNT(*) AS n FROM documents GROUP BY category",
        };
        let mut query = sqlx::query::<sqlx::Sqlite>(sql);
        if let Some(project_id) = project_id {
            query = query.bind(project_id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut total_count = 0u64;
        for row in rows {
            let category_str: String = row.try_get("category")?;
            let category = DocumentCategory::from_str(&category_str)
                .map_err(PipelineError::Internal)?;
            let n: i64 = row.try_get("n")?;
            total_count += n as u64;
            counts.insert(category, n as u64);
        }
        Ok(DocumentStats {
            total_count,
            counts_by_category: counts,
        })
    }
}

/// Delete the job row, guarded by the lease owner. One affected row means
/// the caller still held the lease; anything else aborts the transaction.
async fn release_lease(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    document_id: DocumentId,
    job_id: i64,
    worker_id: &str,
) -> Result<()> {
    let deleted = sqlx::query("DELETE FROM index_jobs WHERE id = ? AND lease_owner = ?")
        .bind(job_id)
        .bind(worker_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    if deleted != 1 {
        return Err(PipelineError::Internal(format!(
            "lease on job {job_id} (document {document_id}) no longer held by {worker_id}"
        )));
    }
    Ok(())
}

fn decode_status(row: &SqliteRow, document_id: DocumentId) -> Result<IndexStatus> {
    let status_str: String = row.try_get("index_status")?;
    IndexStatus::from_str(&status_str).map_err(|e| {
        error!(document_id, "corrupt status column: {e}");
        PipelineError::Internal(format!("document {document_id}: {e}"))
    })
}

/// Decode a document row, enforcing the status/field coupling. A row that
/// violates it is reported as an internal error and never surfaced as a
/// document.
fn decode_document(row: &SqliteRow) -> Result<Document> {
    let id: i64 = row.try_get("id")?;
    let status = decode_status(row, id)?;
    let indexed_at: Option<i64> = row.try_get("indexed_at")?;
    let chunk_count: Option<i64> = row.try_get("chunk_count")?;
    let error_message: Option<String> = row.try_get("error_message")?;

    let violation = |detail: &str| {
        error!(document_id = id, status = %status, detail, "document row violates status invariant");
        PipelineError::Internal(format!(
            "document {id} row violates the {status} field invariant: {detail}"
        ))
    };

    let state = match status {
        IndexStatus::Pending | IndexStatus::Processing => {
            if indexed_at.is_some() || chunk_count.is_some() || error_message.is_some() {
                return Err(violation("expected no indexing fields"));
            }
            match status {
                IndexStatus::Pending => IndexState::Pending,
                _ => IndexState::Processing,
            }
        }
        IndexStatus::Indexed => {
            if error_message.is_some() {
                return Err(violation("error_message set on an indexed document"));
            }
            match (indexed_at, chunk_count) {
                (Some(at), Some(n)) if n >= 0 => IndexState::Indexed {
                    indexed_at: ts_to_datetime(at)?,
                    chunk_count: n as u32,
                },
                _ => return Err(violation("indexed_at/chunk_count missing or negative")),
            }
        }
        IndexStatus::Failed => {
            if indexed_at.is_some() || chunk_count.is_some() {
                return Err(violation("success fields set on a failed document"));
            }
            match error_message {
                Some(error_message) => IndexState::Failed { error_message },
                None => return Err(violation("error_message missing")),
            }
        }
    };

    Ok(Document {
        id,
        project_id: row.try_get("project_id")?,
        uploaded_by: row.try_get("uploaded_by")?,
        file_name: row.try_get("file_name")?,
        blob_ref: row.try_get("blob_ref")?,
        file_size: row.try_get("file_size")?,
        mime_type: row.try_get("mime_type")?,
        file_type: row.try_get("file_type")?,
        category: {
            let category_str: String = row.try_get("category")?;
            DocumentCategory::from_str(&category_str).map_err(PipelineError::Internal)?
        },
        description: row.try_get("description")?,
        created_at: ts_to_datetime(row.try_get("created_at")?)?,
        updated_at: ts_to_datetime(row.try_get("updated_at")?)?,
        state,
    })
}

fn index_unavailable(e: sqlx::Error) -> PipelineError {
    PipelineError::IndexUnavailable(e.to_string())
}

fn decode_chunk(row: &SqliteRow) -> Result<ChunkRecord> {
    let ordinal: i64 = row.try_get("ordinal")?;
    Ok(ChunkRecord {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        ordinal: ordinal as u32,
        text: row.try_get("text")?,
        start_offset: row.try_get("start_offset")?,
        end_offset: row.try_get("end_offset")?,
        created_at: ts_to_datetime(row.try_get("created_at")?)?,
    })
}

/// The SQLite chunk index: replace-on-reindex semantics over the `chunks`
/// table. Backend failures surface as `IndexUnavailable` so the worker
/// retries them.
#[derive(Debug, Clone)]
pub struct SqliteChunkIndexer {
    pool: SqlitePool,
}

impl SqliteChunkIndexer {
    pub fn new(index: &DocumentIndex) -> Self {
        Self {
            pool: index.pool().clone(),
        }
    }
}

#[async_trait]
impl ChunkIndexer for SqliteChunkIndexer {
    async fn replace_chunks(&self, document_id: DocumentId, chunks: &[ChunkDraft]) -> Result<u32> {
        for (position, chunk) in chunks.iter().enumerate() {
            if chunk.ordinal as usize != position {
                return Err(PipelineError::Internal(format!(
                    "chunk ordinals for document {document_id} are not contiguous from 0"
                )));
            }
        }

        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(index_unavailable)?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(index_unavailable)?;
        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (document_id, ordinal, text, start_offset, end_offset, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(document_id)
            .bind(i64::from(chunk.ordinal))
            .bind(&chunk.text)
            .bind(chunk.start_offset)
            .bind(chunk.end_offset)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(index_unavailable)?;
        }
        tx.commit().await.map_err(index_unavailable)?;
        Ok(chunks.len() as u32)
    }

    async fn delete_chunks(&self, document_id: DocumentId) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(index_unavailable)?
            .rows_affected();
        Ok(deleted)
    }

    async fn chunks_for(&self, document_id: DocumentId) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY ordinal")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
            .map_err(index_unavailable)?;
        rows.iter().map(decode_chunk).collect()
    }

    async fn search_chunks(&self, query: &str, limit: usize) -> Result<Vec<ChunkRecord>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE LOWER(text) LIKE ?
             ORDER BY document_id, ordinal LIMIT ?",
        )
        .bind(format!("%{needle}%"))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(index_unavailable)?;
        rows.iter().map(decode_chunk).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CreatedFilter;

    fn draft(project_id: i64, file_name: &str, category: DocumentCategory) -> DocumentDraft {
        DocumentDraft {
            project_id,
            uploaded_by: 100,
            file_name: file_name.to_string(),
            blob_ref: "ab12".into(),
            file_size: 64,
            mime_type: "text/plain".into(),
            file_type: "text".into(),
            category,
            description: None,
        }
    }

    async fn lease_job(index: &DocumentIndex, document_id: DocumentId, owner: &str) -> i64 {
        let deadline = Utc::now().timestamp() + 300;
        sqlx::query(
            "UPDATE index_jobs SET lease_owner = ?, visibility_deadline = ?
             WHERE document_id = ? RETURNING id",
        )
        .bind(owner)
        .bind(deadline)
        .bind(document_id)
        .fetch_one(index.pool())
        .await
        .unwrap()
        .try_get::<i64, _>("id")
        .unwrap()
    }

    async fn job_count(index: &DocumentIndex) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM index_jobs")
            .fetch_one(index.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_document_starts_pending_with_a_job() {
        let index = DocumentIndex::open_memory().await.unwrap();
        let doc = index
            .create_document(&draft(1, "notes.txt", DocumentCategory::Project))
            .await
            .unwrap();
        assert_eq!(doc.status(), IndexStatus::Pending);

        let loaded = index.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(job_count(&index).await, 1);
    }

    #[tokio::test]
    async fn indexed_commit_requires_processing_and_the_lease() {
        let index = DocumentIndex::open_memory().await.unwrap();
        let doc = index
            .create_document(&draft(1, "notes.txt", DocumentCategory::Project))
            .await
            .unwrap();
        let job_id = lease_job(&index, doc.id, "w1").await;

        assert!(index.mark_processing(doc.id).await.unwrap());

        // A worker that no longer owns the lease cannot commit.
        let err = index.commit_indexed(doc.id, job_id, "w2", 3).await.unwrap_err();
        assert!(matches!(err, PipelineError::Internal(_)));
        let still = index.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(still.status(), IndexStatus::Processing);
        assert_eq!(job_count(&index).await, 1);

        index.commit_indexed(doc.id, job_id, "w1", 3).await.unwrap();
        let done = index.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(done.status(), IndexStatus::Indexed);
        assert_eq!(done.state.chunk_count(), Some(3));
        assert!(done.state.indexed_at().is_some());
        assert_eq!(job_count(&index).await, 0);

        // The old lease holder's late terminal commit is rejected too.
        let err = index.commit_failed(doc.id, job_id, "w1", "late").await.unwrap_err();
        assert!(matches!(err, PipelineError::Internal(_)));
        let unchanged = index.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status(), IndexStatus::Indexed);
    }

    #[tokio::test]
    async fn failed_commit_stores_message_and_drops_chunks() {
        let index = DocumentIndex::open_memory().await.unwrap();
        let indexer = SqliteChunkIndexer::new(&index);
        let doc = index
            .create_document(&draft(1, "bad.bin", DocumentCategory::System))
            .await
            .unwrap();
        let job_id = lease_job(&index, doc.id, "w1").await;
        index.mark_processing(doc.id).await.unwrap();
        indexer
            .replace_chunks(
                doc.id,
                &[ChunkDraft {
                    ordinal: 0,
                    text: "partial".into(),
                    start_offset: 0,
                    end_offset: 7,
                }],
            )
            .await
            .unwrap();

        index
            .commit_failed(doc.id, job_id, "w1", "unsupported MIME type 'application/x-unknown'")
            .await
            .unwrap();

        let failed = index.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(failed.status(), IndexStatus::Failed);
        assert_eq!(
            failed.state.error_message(),
            Some("unsupported MIME type 'application/x-unknown'")
        );
        assert!(failed.state.chunk_count().is_none());
        assert!(indexer.chunks_for(doc.id).await.unwrap().is_empty());
        assert_eq!(job_count(&index).await, 0);
    }

    #[tokio::test]
    async fn retry_commit_returns_to_pending_and_bumps_attempt() {
        let index = DocumentIndex::open_memory().await.unwrap();
        let doc = index
            .create_document(&draft(1, "flaky.txt", DocumentCategory::Reference))
            .await
            .unwrap();
        let job_id = lease_job(&index, doc.id, "w1").await;
        index.mark_processing(doc.id).await.unwrap();

        index
            .commit_retry(doc.id, job_id, "w1", Utc::now())
            .await
            .unwrap();

        let back = index.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(back.status(), IndexStatus::Pending);
        let attempt: i64 = sqlx::query_scalar("SELECT attempt FROM index_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(index.pool())
            .await
            .unwrap();
        assert_eq!(attempt, 2);
        let owner: Option<String> =
            sqlx::query_scalar("SELECT lease_owner FROM index_jobs WHERE id = ?")
                .bind(job_id)
                .fetch_one(index.pool())
                .await
                .unwrap();
        assert!(owner.is_none());
    }

    #[tokio::test]
    async fn reindex_rules_match_the_state_machine() {
        let index = DocumentIndex::open_memory().await.unwrap();
        let doc = index
            .create_document(&draft(1, "doc.txt", DocumentCategory::Guideline))
            .await
            .unwrap();

        // PENDING: not a terminal state.
        let err = index.request_reindex(doc.id).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidState {
                current: IndexStatus::Pending,
                ..
            }
        ));

        let job_id = lease_job(&index, doc.id, "w1").await;
        index.mark_processing(doc.id).await.unwrap();
        let err = index.request_reindex(doc.id).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidState {
                current: IndexStatus::Processing,
                ..
            }
        ));

        index.commit_indexed(doc.id, job_id, "w1", 1).await.unwrap();
        let reset = index.request_reindex(doc.id).await.unwrap();
        assert_eq!(reset.status(), IndexStatus::Pending);
        assert_eq!(job_count(&index).await, 1);

        let err = index.request_reindex(9999).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { document_id: 9999 }));
    }

    #[tokio::test]
    async fn delete_cascades_to_chunks_and_jobs() {
        let index = DocumentIndex::open_memory().await.unwrap();
        let indexer = SqliteChunkIndexer::new(&index);
        let doc = index
            .create_document(&draft(1, "gone.txt", DocumentCategory::Template))
            .await
            .unwrap();
        indexer
            .replace_chunks(
                doc.id,
                &[ChunkDraft {
                    ordinal: 0,
                    text: "chunk".into(),
                    start_offset: 0,
                    end_offset: 5,
                }],
            )
            .await
            .unwrap();

        let deleted = index.delete_document(doc.id).await.unwrap();
        assert_eq!(deleted.blob_ref, "ab12");
        assert!(!deleted.blob_in_use);
        assert!(index.get_document(doc.id).await.unwrap().is_none());
        assert!(indexer.chunks_for(doc.id).await.unwrap().is_empty());
        assert_eq!(job_count(&index).await, 0);

        let err = index.delete_document(doc.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_reports_blobs_shared_with_other_documents() {
        let index = DocumentIndex::open_memory().await.unwrap();
        // Identical bytes produce identical content-addressed refs.
        let first = index
            .create_document(&draft(1, "copy-a.txt", DocumentCategory::Project))
            .await
            .unwrap();
        let second = index
            .create_document(&draft(2, "copy-b.txt", DocumentCategory::Project))
            .await
            .unwrap();

        let deleted = index.delete_document(first.id).await.unwrap();
        assert!(deleted.blob_in_use);

        let deleted = index.delete_document(second.id).await.unwrap();
        assert!(!deleted.blob_in_use);
    }

    #[tokio::test]
    async fn replace_chunks_is_a_full_swap() {
        let index = DocumentIndex::open_memory().await.unwrap();
        let indexer = SqliteChunkIndexer::new(&index);
        let doc = index
            .create_document(&draft(1, "swap.txt", DocumentCategory::Project))
            .await
            .unwrap();

        let first: Vec<ChunkDraft> = (0..3)
            .map(|i| ChunkDraft {
                ordinal: i,
                text: format!("first {i}"),
                start_offset: i64::from(i) * 10,
                end_offset: i64::from(i) * 10 + 7,
            })
            .collect();
        assert_eq!(indexer.replace_chunks(doc.id, &first).await.unwrap(), 3);

        let second: Vec<ChunkDraft> = (0..2)
            .map(|i| ChunkDraft {
                ordinal: i,
                text: format!("second {i}"),
                start_offset: i64::from(i) * 10,
                end_offset: i64::from(i) * 10 + 8,
            })
            .collect();
        assert_eq!(indexer.replace_chunks(doc.id, &second).await.unwrap(), 2);

        let stored = indexer.chunks_for(doc.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|c| c.text.starts_with("second")));
        assert_eq!(
            stored.iter().map(|c| c.ordinal).collect::<Vec<_>>(),
            vec![0, 1]
        );

        // Idempotent even when nothing is left.
        assert_eq!(indexer.delete_chunks(doc.id).await.unwrap(), 2);
        assert_eq!(indexer.delete_chunks(doc.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn replace_chunks_rejects_ordinal_gaps() {
        let index = DocumentIndex::open_memory().await.unwrap();
        let indexer = SqliteChunkIndexer::new(&index);
        let doc = index
            .create_document(&draft(1, "gap.txt", DocumentCategory::Project))
            .await
            .unwrap();
        let gapped = vec![
            ChunkDraft {
                ordinal: 0,
                text: "zero".into(),
                start_offset: 0,
                end_offset: 4,
            },
            ChunkDraft {
                ordinal: 2,
                text: "two".into(),
                start_offset: 8,
                end_offset: 11,
            },
        ];
        let err = indexer.replace_chunks(doc.id, &gapped).await.unwrap_err();
        assert!(matches!(err, PipelineError::Internal(_)));
        assert!(indexer.chunks_for(doc.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_chunks_matches_substrings_case_insensitively() {
        let index = DocumentIndex::open_memory().await.unwrap();
        let indexer = SqliteChunkIndexer::new(&index);
        let doc = index
            .create_document(&draft(1, "search.txt", DocumentCategory::Project))
            .await
            .unwrap();
        indexer
            .replace_chunks(
                doc.id,
                &[
                    ChunkDraft {
                        ordinal: 0,
                        text: "The Quarterly budget review".into(),
                        start_offset: 0,
                        end_offset: 27,
                    },
                    ChunkDraft {
                        ordinal: 1,
                        text: "unrelated content".into(),
                        start_offset: 20,
                        end_offset: 37,
                    },
                ],
            )
            .await
            .unwrap();

        let hits = indexer.search_chunks("quarterly BUDGET", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].ordinal, 0);
        assert!(indexer.search_chunks("   ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_rows_surface_as_internal_errors() {
        let index = DocumentIndex::open_memory().await.unwrap();
        let doc = index
            .create_document(&draft(1, "corrupt.txt", DocumentCategory::Project))
            .await
            .unwrap();
        // Violate the coupling directly: a PENDING row with an error message.
        sqlx::query("UPDATE documents SET error_message = 'boom' WHERE id = ?")
            .bind(doc.id)
            .execute(index.pool())
            .await
            .unwrap();

        let err = index.get_document(doc.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::Internal(_)));
    }

    #[tokio::test]
    async fn list_filters_paginates_and_orders_newest_first() {
        let index = DocumentIndex::open_memory().await.unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            let category = if i % 2 == 0 {
                DocumentCategory::Project
            } else {
                DocumentCategory::Reference
            };
            let doc = index
                .create_document(&draft(if i < 3 { 1 } else { 2 }, &format!("file-{i}.txt"), category))
                .await
                .unwrap();
            ids.push(doc.id);
            // Distinct creation times, oldest first.
            sqlx::query("UPDATE documents SET created_at = ? WHERE id = ?")
                .bind(1_700_000_000_i64 + i64::from(i) * 86_400)
                .bind(doc.id)
                .execute(index.pool())
                .await
                .unwrap();
        }

        let all = index.list(&DocumentFilter::new(), 1, 10).await.unwrap();
        assert_eq!(all.total_count, 5);
        assert_eq!(
            all.documents.iter().map(|d| d.id).collect::<Vec<_>>(),
            ids.iter().rev().copied().collect::<Vec<_>>()
        );

        let page2 = index.list(&DocumentFilter::new(), 2, 2).await.unwrap();
        assert_eq!(page2.total_count, 5);
        assert_eq!(page2.documents.len(), 2);
        assert_eq!(page2.documents[0].id, ids[2]);

        let filtered = index
            .list(
                &DocumentFilter::new()
                    .with_project_id(1)
                    .with_category(DocumentCategory::Project),
                1,
                10,
            )
            .await
            .unwrap();
        assert_eq!(filtered.total_count, 2);
        assert!(filtered
            .documents
            .iter()
            .all(|d| d.project_id == 1 && d.category == DocumentCategory::Project));

        let searched = index
            .list(&DocumentFilter::new().with_search("FILE-4"), 1, 10)
            .await
            .unwrap();
        assert_eq!(searched.total_count, 1);
        assert_eq!(searched.documents[0].file_name, "file-4.txt");

        let since = index
            .list(
                &DocumentFilter::new().with_created(CreatedFilter::Range {
                    from: ts_to_datetime(1_700_000_000 + 3 * 86_400).ok(),
                    to: None,
                }),
                1,
                10,
            )
            .await
            .unwrap();
        assert_eq!(since.total_count, 2);
    }

    #[tokio::test]
    async fn list_total_agrees_with_page_during_concurrent_intake() {
        let dir = tempfile::tempdir().unwrap();
        let index = DocumentIndex::open(dir.path()).await.unwrap();
        for i in 0..5 {
            index
                .create_document(&draft(1, &format!("seed-{i}.txt"), DocumentCategory::Project))
                .await
                .unwrap();
        }

        let writer = {
            let index = index.clone();
            tokio::spawn(async move {
                for i in 0..40 {
                    index
                        .create_document(&draft(1, &format!("late-{i}.txt"), DocumentCategory::Project))
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        // A writer committing mid-list must not desync the page from its
        // total.
        loop {
            let page = index.list(&DocumentFilter::new(), 1, 100).await.unwrap();
            assert_eq!(page.documents.len() as u64, page.total_count);
            if writer.is_finished() {
                break;
            }
        }
        writer.await.unwrap();

        let all = index.list(&DocumentFilter::new(), 1, 100).await.unwrap();
        assert_eq!(all.total_count, 45);
        assert_eq!(all.documents.len(), 45);
    }

    #[tokio::test]
    async fn status_filter_returns_only_matching_documents() {
        let index = DocumentIndex::open_memory().await.unwrap();
        let ok_doc = index
            .create_document(&draft(1, "ok.txt", DocumentCategory::Project))
            .await
            .unwrap();
        let bad_doc = index
            .create_document(&draft(1, "bad.txt", DocumentCategory::Project))
            .await
            .unwrap();

        let job = lease_job(&index, bad_doc.id, "w1").await;
        index.mark_processing(bad_doc.id).await.unwrap();
        index
            .commit_failed(bad_doc.id, job, "w1", "text extraction failed: no text layer")
            .await
            .unwrap();

        let failed = index
            .list(&DocumentFilter::new().with_status(IndexStatus::Failed), 1, 10)
            .await
            .unwrap();
        assert_eq!(failed.total_count, 1);
        assert_eq!(failed.documents[0].id, bad_doc.id);

        let pending = index
            .list(&DocumentFilter::new().with_status(IndexStatus::Pending), 1, 10)
            .await
            .unwrap();
        assert_eq!(pending.documents[0].id, ok_doc.id);
    }

    #[tokio::test]
    async fn stats_cover_all_categories_and_sum_to_total() {
        let index = DocumentIndex::open_memory().await.unwrap();
        for (project, category) in [
            (1, DocumentCategory::Project),
            (1, DocumentCategory::Project),
            (1, DocumentCategory::Reference),
            (2, DocumentCategory::System),
        ] {
            index
                .create_document(&draft(project, "f.txt", category))
                .await
                .unwrap();
        }

        let all = index.stats(None).await.unwrap();
        assert_eq!(all.total_count, 4);
        assert_eq!(all.counts_by_category.len(), 5);
        assert_eq!(
            all.counts_by_category.values().sum::<u64>(),
            all.total_count
        );

        let project_one = index.stats(Some(1)).await.unwrap();
        assert_eq!(project_one.total_count, 3);
        assert_eq!(
            project_one.counts_by_category[&DocumentCategory::Project],
            2
        );
        assert_eq!(
            project_one.counts_by_category[&DocumentCategory::Guideline],
            0
        );
    }
}
