//! carrel-indexer: Document ingestion and indexing pipeline
//!
//! This crate turns uploaded research documents (plain text, HTML, XML, PDF,
//! and Office formats) into searchable text chunks. Uploads land in a
//! content-addressed blob store and a SQLite document index, then a durable
//! job queue drives a worker pool through extraction, chunking, and chunk
//! storage. Processing is asynchronous and at-least-once: a crashed worker
//! loses its lease and the job is re-delivered.
//!
//! ## Key Modules
//!
//! - **[`pipeline`]**: The engine, worker pool, job queue, and text extractors
//! - **[`storage`]**: Documents, chunks, blob stores, and the list/stats queries
//! - **[`error`]**: The pipeline error taxonomy (transient vs. permanent)
//! - **[`sanitize`]**: MIME and metadata normalization helpers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use carrel_indexer::pipeline::{PipelineConfig, PipelineEngine};
//! use carrel_indexer::storage::{DocumentCategory, NewDocument};
//! use std::path::Path;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut engine = PipelineEngine::new(Path::new("./data"), PipelineConfig::default()).await?;
//! engine.start();
//!
//! let document = engine
//!     .submit_document(NewDocument {
//!         project_id: 1,
//!         uploader_id: 42,
//!         file_name: "notes.txt".into(),
//!         bytes: b"Meeting notes from Tuesday.".to_vec(),
//!         mime_type: "text/plain".into(),
//!         category: DocumentCategory::Project,
//!         description: None,
//!     })
//!     .await?;
//! println!("submitted document {}", document.id);
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Upload → BlobStore + DocumentIndex (PENDING) → JobQueue
//!                                                   ↓
//! Chunks ← TextSplitter ← ExtractorRegistry ← Worker pool
//!   ↓
//! ChunkIndexer → INDEXED / FAILED → list, stats, search APIs
//! ```

pub mod error;
pub mod pipeline;
pub mod sanitize;
pub mod storage;
