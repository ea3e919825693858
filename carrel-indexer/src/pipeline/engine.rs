//! Pipeline assembly and the public facade.
//!
//! [`PipelineEngine`] wires the storage layer, blob store, extractor
//! registry, splitter, and job queue together, owns the worker pool, and
//! exposes the operations callers use: submit, get, list, stats, re-index,
//! delete, and chunk search. Facade methods are safe to call while workers
//! run; every cross-worker race is resolved at the storage layer's
//! compare-and-set transitions.
//!
//! Two processing modes: [`PipelineEngine::start`] spawns `max_workers`
//! long-running workers (production), while
//! [`PipelineEngine::process_pending_jobs`] drains the queue inline on the
//! caller's task (CLI `work --drain` and tests).

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use carrel_text::{SplitterConfig, TextSplitter};
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::pipeline::extract::ExtractorRegistry;
use crate::pipeline::job_queue::JobQueue;
use crate::pipeline::worker::Worker;
use crate::sanitize::{file_type_for, normalize_mime, sanitize_description};
use crate::storage::{
    BlobStore, ChunkIndexer, ChunkRecord, Document, DocumentDraft, DocumentFilter, DocumentId,
    DocumentIndex, DocumentPage, DocumentStats, FsBlobStore, MemoryBlobStore, NewDocument,
    SqliteChunkIndexer,
};

/// Blob directory created under the engine's base directory.
pub const BLOB_DIR_NAME: &str = "blobs";

/// Pipeline tuning knobs. `Default` matches production; tests shrink the
/// timeouts and zero the backoff.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of concurrent workers started by [`PipelineEngine::start`].
    pub max_workers: usize,
    /// Total attempts (first run included) before a transient failure
    /// becomes `FAILED`.
    pub max_attempts: u32,
    /// How long a claimed job stays invisible to other workers. Must
    /// comfortably exceed `extract_timeout + index_timeout`.
    pub lease_duration: Duration,
    /// Upper bound on one blocking-dequeue wait.
    pub claim_wait: Duration,
    /// Budget for blob fetch + extraction + chunking.
    pub extract_timeout: Duration,
    /// Budget for the chunk write.
    pub index_timeout: Duration,
    /// Base retry delay; doubles with each attempt.
    pub retry_backoff: Duration,
    pub splitter: SplitterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_attempts: 3,
            lease_duration: Duration::from_secs(300),
            claim_wait: Duration::from_secs(1),
            extract_timeout: Duration::from_secs(60),
            index_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(5),
            splitter: SplitterConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_claim_wait(mut self, claim_wait: Duration) -> Self {
        self.claim_wait = claim_wait;
        self
    }

    pub fn with_extract_timeout(mut self, extract_timeout: Duration) -> Self {
        self.extract_timeout = extract_timeout;
        self
    }

    pub fn with_index_timeout(mut self, index_timeout: Duration) -> Self {
        self.index_timeout = index_timeout;
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_splitter(mut self, splitter: SplitterConfig) -> Self {
        self.splitter = splitter;
        self
    }

    /// Delay before the next attempt after a transient failure on
    /// `attempt`: `retry_backoff * 2^(attempt - 1)`, shift-capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(1u32 << shift)
    }
}

/// Worker activity since the engine was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessingStats {
    pub documents_indexed: u64,
    pub documents_failed: u64,
    pub retries_scheduled: u64,
    pub chunks_written: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    documents_indexed: AtomicU64,
    documents_failed: AtomicU64,
    retries_scheduled: AtomicU64,
    chunks_written: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_indexed(&self, chunk_count: u32) {
        self.documents_indexed.fetch_add(1, Ordering::Relaxed);
        self.chunks_written
            .fetch_add(u64::from(chunk_count), Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.documents_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ProcessingStats {
        ProcessingStats {
            documents_indexed: self.documents_indexed.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
        }
    }
}

/// The assembled ingestion pipeline.
pub struct PipelineEngine {
    config: PipelineConfig,
    index: DocumentIndex,
    queue: JobQueue,
    registry: Arc<ExtractorRegistry>,
    splitter: Arc<TextSplitter>,
    blobs: Arc<dyn BlobStore>,
    indexer: Arc<dyn ChunkIndexer>,
    stats: Arc<StatsCounters>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl PipelineEngine {
    /// Open (creating if needed) a file-backed pipeline under `base_dir`:
    /// the SQLite database plus a `blobs/` directory, with the default
    /// extractor set.
    pub async fn new(base_dir: &Path, config: PipelineConfig) -> Result<Self> {
        let index = DocumentIndex::open(base_dir).await?;
        let blobs: Arc<dyn BlobStore> =
            Arc::new(FsBlobStore::open(base_dir.join(BLOB_DIR_NAME)).await?);
        Ok(Self::with_components(
            config,
            index,
            blobs,
            ExtractorRegistry::with_defaults(),
        ))
    }

    /// Fully in-memory pipeline (SQLite `:memory:` + `MemoryBlobStore`)
    /// with the default extractor set.
    pub async fn new_memory(config: PipelineConfig) -> Result<Self> {
        let index = DocumentIndex::open_memory().await?;
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        Ok(Self::with_components(
            config,
            index,
            blobs,
            ExtractorRegistry::with_defaults(),
        ))
    }

    /// Assemble an engine from explicit parts. Tests use this to keep a
    /// handle on the blob store or to inject extractors.
    pub fn with_components(
        config: PipelineConfig,
        index: DocumentIndex,
        blobs: Arc<dyn BlobStore>,
        registry: ExtractorRegistry,
    ) -> Self {
        let queue = JobQueue::new(&index, config.lease_duration, config.claim_wait);
        let indexer: Arc<dyn ChunkIndexer> = Arc::new(SqliteChunkIndexer::new(&index));
        let splitter = Arc::new(TextSplitter::new(config.splitter));
        Self {
            queue,
            registry: Arc::new(registry),
            splitter,
            indexer,
            stats: Arc::new(StatsCounters::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            index,
            blobs,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn make_worker(&self, worker_id: String) -> Worker {
        Worker::new(
            worker_id,
            self.config.clone(),
            self.index.clone(),
            self.queue.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.splitter),
            Arc::clone(&self.blobs),
            Arc::clone(&self.indexer),
            Arc::clone(&self.stats),
        )
    }

    /// Spawn the worker pool. Idempotent while running.
    pub fn start(&mut self) {
        if !self.workers.is_empty() {
            warn!("pipeline already started");
            return;
        }
        self.shutdown.store(false, Ordering::Relaxed);
        for _ in 0..self.config.max_workers.max(1) {
            let worker = self.make_worker(format!("worker-{}", Uuid::new_v4()));
            let shutdown = Arc::clone(&self.shutdown);
            self.workers
                .push(tokio::spawn(async move { worker.run(shutdown).await }));
        }
        info!(workers = self.config.max_workers, "pipeline started");
    }

    /// Stop the worker pool and wait for in-flight jobs to commit.
    pub async fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shutdown.store(true, Ordering::Relaxed);
        for _ in 0..self.workers.len() {
            self.queue.nudge();
        }
        for result in join_all(std::mem::take(&mut self.workers)).await {
            if let Err(e) = result {
                error!("worker task panicked: {e}");
            }
        }
        info!("pipeline stopped");
    }

    /// Process queued jobs inline until none is immediately claimable.
    /// Returns how many jobs were processed (retries of the same document
    /// count separately).
    pub async fn process_pending_jobs(&self) -> Result<u64> {
        const DRAIN_LIMIT: u64 = 10_000;
        let worker = self.make_worker(format!("drain-{}", Uuid::new_v4()));
        let mut processed = 0;
        while processed < DRAIN_LIMIT && worker.run_once().await? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Store the blob, create the `PENDING` document and its job in one
    /// transaction, and wake a worker. The only synchronous failure modes
    /// are input validation and blob storage.
    pub async fn submit_document(&self, new_document: NewDocument) -> Result<Document> {
        let file_name = new_document.file_name.trim();
        if file_name.is_empty() {
            return Err(PipelineError::InvalidInput(
                "file_name must not be blank".into(),
            ));
        }
        if new_document.bytes.is_empty() {
            return Err(PipelineError::InvalidInput("file must not be empty".into()));
        }
        let mime_type = normalize_mime(&new_document.mime_type);
        if mime_type.is_empty() {
            return Err(PipelineError::InvalidInput(
                "mime_type must not be blank".into(),
            ));
        }

        let blob_ref = self.blobs.store(&new_document.bytes, &mime_type).await?;
        let draft = DocumentDraft {
            project_id: new_document.project_id,
            uploaded_by: new_document.uploader_id,
            file_name: file_name.to_string(),
            blob_ref,
            file_size: new_document.bytes.len() as i64,
            file_type: file_type_for(&mime_type, file_name).to_string(),
            mime_type,
            category: new_document.category,
            description: sanitize_description(new_document.description),
        };
        let document = self.index.create_document(&draft).await?;
        self.queue.nudge();
        info!(
            document_id = document.id,
            file_name = %document.file_name,
            mime_type = %document.mime_type,
            file_size = document.file_size,
            "document submitted"
        );
        Ok(document)
    }

    pub async fn get_document(&self, document_id: DocumentId) -> Result<Option<Document>> {
        self.index.get_document(document_id).await
    }

    pub async fn list(
        &self,
        filter: &DocumentFilter,
        page: u32,
        page_size: u32,
    ) -> Result<DocumentPage> {
        self.index.list(filter, page, page_size).await
    }

    pub async fn stats(&self, project_id: Option<i64>) -> Result<DocumentStats> {
        self.index.stats(project_id).await
    }

    /// Queue a terminal (`INDEXED` or `FAILED`) document for re-indexing.
    pub async fn request_reindex(&self, document_id: DocumentId) -> Result<Document> {
        let document = self.index.request_reindex(document_id).await?;
        self.queue.nudge();
        info!(document_id, "re-index queued");
        Ok(document)
    }

    /// Delete a document with everything attached to it. The blob is
    /// removed best-effort, and only when no other document shares it.
    pub async fn delete_document(&self, document_id: DocumentId) -> Result<()> {
        let deleted = self.index.delete_document(document_id).await?;
        if deleted.blob_in_use {
            debug!(document_id, blob_ref = %deleted.blob_ref, "blob retained; still referenced");
        } else if let Err(e) = self.blobs.delete(&deleted.blob_ref).await {
            warn!(document_id, blob_ref = %deleted.blob_ref, "blob cleanup failed: {e}");
        }
        info!(document_id, "document deleted");
        Ok(())
    }

    /// All chunks of one document, in ordinal order.
    pub async fn chunks_for(&self, document_id: DocumentId) -> Result<Vec<ChunkRecord>> {
        self.indexer.chunks_for(document_id).await
    }

    /// Case-insensitive substring search over indexed chunk text.
    pub async fn search_chunks(&self, query: &str, limit: usize) -> Result<Vec<ChunkRecord>> {
        self.indexer.search_chunks(query, limit).await
    }

    pub async fn queue_depth(&self) -> Result<u64> {
        self.queue.depth().await
    }

    pub fn processing_stats(&self) -> ProcessingStats {
        self.stats.snapshot()
    }
}
