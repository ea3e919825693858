//! The pull-process-commit worker loop.
//!
//! Each worker independently claims a job, moves the document to
//! `PROCESSING`, runs fetch → extract → chunk under the extract timeout and
//! the chunk write under the index timeout, and commits exactly one
//! outcome: `INDEXED`, a retry (transient failure with attempts left), or
//! `FAILED`. Every commit is compare-and-set and lease-guarded, so a worker
//! whose lease expired mid-flight finds its commit rejected and discards
//! the result with a log line instead of clobbering its replacement's.
//!
//! Internal errors (invariant violations, database faults) commit nothing:
//! the document keeps its current status, the lease runs out, and the job
//! becomes claimable again. They are logged and never written into a
//! document's public `error_message`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use carrel_text::{TextChunk, TextSplitter};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::pipeline::engine::{PipelineConfig, StatsCounters};
use crate::pipeline::extract::ExtractorRegistry;
use crate::pipeline::job_queue::{JobQueue, LeasedJob};
use crate::storage::{BlobStore, ChunkDraft, ChunkIndexer, Document, DocumentId, DocumentIndex};

fn chunk_draft(chunk: TextChunk) -> ChunkDraft {
    ChunkDraft {
        ordinal: chunk.sequence as u32,
        text: chunk.text,
        start_offset: chunk.start_offset as i64,
        end_offset: chunk.end_offset as i64,
    }
}

pub(crate) struct Worker {
    worker_id: String,
    config: PipelineConfig,
    index: DocumentIndex,
    queue: JobQueue,
    registry: Arc<ExtractorRegistry>,
    splitter: Arc<TextSplitter>,
    blobs: Arc<dyn BlobStore>,
    indexer: Arc<dyn ChunkIndexer>,
    stats: Arc<StatsCounters>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        worker_id: String,
        config: PipelineConfig,
        index: DocumentIndex,
        queue: JobQueue,
        registry: Arc<ExtractorRegistry>,
        splitter: Arc<TextSplitter>,
        blobs: Arc<dyn BlobStore>,
        indexer: Arc<dyn ChunkIndexer>,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            worker_id,
            config,
            index,
            queue,
            registry,
            splitter,
            blobs,
            indexer,
            stats,
        }
    }

    /// Loop until `shutdown` is set, claiming and processing jobs. The
    /// bounded dequeue wait keeps shutdown responsive without polling hot.
    pub(crate) async fn run(&self, shutdown: Arc<AtomicBool>) {
        debug!(worker_id = %self.worker_id, "worker started");
        while !shutdown.load(Ordering::Relaxed) {
            match self.queue.next_job(&self.worker_id).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = %self.worker_id, "dequeue failed: {e}");
                    tokio::time::sleep(self.config.claim_wait).await;
                }
            }
        }
        debug!(worker_id = %self.worker_id, "worker stopped");
    }

    /// Claim and process a single job without waiting. Returns whether a
    /// job was processed; used by drain mode and tests.
    pub(crate) async fn run_once(&self) -> Result<bool> {
        match self.queue.claim(&self.worker_id).await? {
            Some(job) => {
                self.process(job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) async fn process(&self, job: LeasedJob) {
        let started = Instant::now();
        let document = match self.index.get_document(job.document_id).await {
            Ok(Some(document)) => document,
            Ok(None) => {
                // Deleted between enqueue and claim.
                debug!(
                    worker_id = %self.worker_id,
                    document_id = job.document_id,
                    "document gone; discarding job"
                );
                self.discard_job(&job).await;
                return;
            }
            Err(e) => {
                error!(
                    worker_id = %self.worker_id,
                    document_id = job.document_id,
                    "loading document failed: {e}"
                );
                return;
            }
        };

        match self.index.mark_processing(document.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    worker_id = %self.worker_id,
                    document_id = document.id,
                    "document not in a startable state; discarding job"
                );
                self.discard_job(&job).await;
                return;
            }
            Err(e) => {
                error!(
                    worker_id = %self.worker_id,
                    document_id = document.id,
                    "starting job failed: {e}"
                );
                return;
            }
        }

        let outcome = match self.extract_and_chunk(&document).await {
            Ok(chunks) => self.write_chunks(document.id, &chunks).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(chunk_count) => {
                match self
                    .index
                    .commit_indexed(document.id, job.id, &self.worker_id, chunk_count)
                    .await
                {
                    Ok(()) => {
                        self.stats.record_indexed(chunk_count);
                        info!(
                            worker_id = %self.worker_id,
                            document_id = document.id,
                            chunk_count,
                            attempt = job.attempt,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "document indexed"
                        );
                    }
                    Err(e) => warn!(
                        worker_id = %self.worker_id,
                        document_id = document.id,
                        "indexed result discarded: {e}"
                    ),
                }
            }
            Err(error) => self.handle_failure(&job, error, started).await,
        }
    }

    /// Blob fetch, extraction, and chunking under one timeout budget.
    /// Extraction and chunking are CPU-bound and run on the blocking pool;
    /// on timeout the blocking task is abandoned, not cancelled, and its
    /// late result is dropped.
    async fn extract_and_chunk(&self, document: &Document) -> Result<Vec<ChunkDraft>> {
        let seconds = self.config.extract_timeout.as_secs();
        let blobs = Arc::clone(&self.blobs);
        let registry = Arc::clone(&self.registry);
        let splitter = Arc::clone(&self.splitter);
        let blob_ref = document.blob_ref.clone();
        let mime_type = document.mime_type.clone();

        let stage = async move {
            let bytes = blobs.fetch(&blob_ref).await?;
            let join = tokio::task::spawn_blocking(move || -> Result<Vec<ChunkDraft>> {
                let text = registry.extract(&mime_type, &bytes)?;
                Ok(splitter.split(&text).into_iter().map(chunk_draft).collect())
            })
            .await;
            match join {
                Ok(result) => result,
                // A panicking extractor surfaces here as a transient failure.
                Err(e) => Err(PipelineError::ExtractionFailed(format!(
                    "extractor panicked: {e}"
                ))),
            }
        };

        match tokio::time::timeout(self.config.extract_timeout, stage).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::StageTimeout {
                stage: "extract",
                seconds,
            }),
        }
    }

    async fn write_chunks(&self, document_id: DocumentId, chunks: &[ChunkDraft]) -> Result<u32> {
        let seconds = self.config.index_timeout.as_secs();
        match tokio::time::timeout(
            self.config.index_timeout,
            self.indexer.replace_chunks(document_id, chunks),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::StageTimeout {
                stage: "index",
                seconds,
            }),
        }
    }

    async fn handle_failure(&self, job: &LeasedJob, error: PipelineError, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if error.is_transient() && job.attempt < self.config.max_attempts {
            let delay = self.config.retry_delay(job.attempt);
            let not_before = Utc::now() + delay;
            match self
                .index
                .commit_retry(job.document_id, job.id, &self.worker_id, not_before)
                .await
            {
                Ok(()) => {
                    self.stats.record_retry();
                    warn!(
                        worker_id = %self.worker_id,
                        document_id = job.document_id,
                        attempt = job.attempt,
                        delay_s = delay.as_secs(),
                        elapsed_ms,
                        "transient failure, will retry: {error}"
                    );
                }
                Err(e) => warn!(
                    worker_id = %self.worker_id,
                    document_id = job.document_id,
                    "retry discarded: {e}"
                ),
            }
            return;
        }

        let message = if error.is_permanent() {
            error.to_string()
        } else if error.is_transient() {
            format!(
                "indexing failed after {} attempts; retries exhausted: {error}",
                job.attempt
            )
        } else {
            // Internal faults never reach a document's error_message. The
            // lease expires and the job becomes claimable again.
            error!(
                worker_id = %self.worker_id,
                document_id = job.document_id,
                elapsed_ms,
                "internal failure while indexing: {error}"
            );
            return;
        };

        match self
            .index
            .commit_failed(job.document_id, job.id, &self.worker_id, &message)
            .await
        {
            Ok(()) => {
                self.stats.record_failed();
                warn!(
                    worker_id = %self.worker_id,
                    document_id = job.document_id,
                    attempt = job.attempt,
                    elapsed_ms,
                    "document failed: {message}"
                );
            }
            Err(e) => warn!(
                worker_id = %self.worker_id,
                document_id = job.document_id,
                "failure result discarded: {e}"
            ),
        }
    }

    async fn discard_job(&self, job: &LeasedJob) {
        if let Err(e) = self.queue.discard(job, &self.worker_id).await {
            warn!(
                worker_id = %self.worker_id,
                job_id = job.id,
                "discarding job failed: {e}"
            );
        }
    }
}
