//! Ingestion pipeline: the job queue, extraction, workers, and the engine
//! that assembles them.
//!
//! Every submitted document follows `PENDING -> PROCESSING -> INDEXED` (or
//! `FAILED`), driven by a durable at-least-once job queue in the same
//! SQLite database as the documents. Workers claim jobs under a lease,
//! fetch the blob, extract text with a MIME-keyed extractor from
//! [`extract::ExtractorRegistry`], split it into overlapping chunks, and
//! swap the chunk set in one transaction. Transient failures retry with
//! exponential backoff up to `max_attempts`; permanent ones fail the
//! document immediately. A worker that dies mid-job loses its lease and the
//! job is simply re-delivered.

pub mod engine;
pub mod extract;
pub mod job_queue;
mod worker;

pub use engine::{PipelineConfig, PipelineEngine, ProcessingStats, BLOB_DIR_NAME};
pub use extract::{ExtractError, ExtractorRegistry, TextExtractor};
pub use job_queue::{JobQueue, LeasedJob};
