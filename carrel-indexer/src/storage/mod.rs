//! Storage layer: persistent documents, chunks, and the trait seams the
//! pipeline is wired through.
//!
//! The concrete SQLite implementation lives in [`document_index`]; the blob
//! store adapters live in [`blob_store`]; the read-side filter model lives
//! in [`query`]. Workers and the engine depend on the [`BlobStore`] and
//! [`ChunkIndexer`] traits rather than concrete types, so tests can inject
//! failing or in-memory implementations and the chunk index remains a
//! pluggable backend.
//!
//! A document's indexing fields are carried as the [`IndexState`] tagged
//! union rather than independently nullable columns, which makes the
//! status/field coupling (`INDEXED` has `indexed_at` + `chunk_count`,
//! `FAILED` has `error_message`, earlier states have neither) impossible to
//! misstate in memory. The row decoder enforces the same coupling when
//! loading from SQL.

pub mod blob_store;
pub mod document_index;
pub mod query;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::Result;

pub use blob_store::{FsBlobStore, MemoryBlobStore};
pub use document_index::{DeletedDocument, DocumentIndex, SqliteChunkIndexer};
pub use query::{CreatedFilter, DateBucket, DocumentFilter, DocumentPage, DocumentStats};

/// Unique document identifier (SQLite rowid-backed, opaque to callers).
pub type DocumentId = i64;

/// Stable reference to a stored blob.
pub type BlobRef = String;

/// Document category, surfaced verbatim to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentCategory {
    Project,
    Reference,
    Template,
    Guideline,
    System,
}

impl DocumentCategory {
    pub const ALL: [DocumentCategory; 5] = [
        DocumentCategory::Project,
        DocumentCategory::Reference,
        DocumentCategory::Template,
        DocumentCategory::Guideline,
        DocumentCategory::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentCategory::Project => "PROJECT",
            DocumentCategory::Reference => "REFERENCE",
            DocumentCategory::Template => "TEMPLATE",
            DocumentCategory::Guideline => "GUIDELINE",
            DocumentCategory::System => "SYSTEM",
        }
    }
}

impl fmt::Display for DocumentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PROJECT" => Ok(DocumentCategory::Project),
            "REFERENCE" => Ok(DocumentCategory::Reference),
            "TEMPLATE" => Ok(DocumentCategory::Template),
            "GUIDELINE" => Ok(DocumentCategory::Guideline),
            "SYSTEM" => Ok(DocumentCategory::System),
            other => Err(format!(
                "unknown category '{other}' (expected PROJECT, REFERENCE, TEMPLATE, GUIDELINE, or SYSTEM)"
            )),
        }
    }
}

/// Indexing status, surfaced verbatim to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexStatus {
    Pending,
    Processing,
    Indexed,
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Pending => "PENDING",
            IndexStatus::Processing => "PROCESSING",
            IndexStatus::Indexed => "INDEXED",
            IndexStatus::Failed => "FAILED",
        }
    }

    /// Terminal states may only change through an explicit re-index.
    pub fn is_terminal(&self) -> bool {
        matches!(self, IndexStatus::Indexed | IndexStatus::Failed)
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(IndexStatus::Pending),
            "PROCESSING" => Ok(IndexStatus::Processing),
            "INDEXED" => Ok(IndexStatus::Indexed),
            "FAILED" => Ok(IndexStatus::Failed),
            other => Err(format!(
                "unknown index status '{other}' (expected PENDING, PROCESSING, INDEXED, or FAILED)"
            )),
        }
    }
}

/// A document's indexing state with the fields that only exist in that
/// state. `Indexed` carries the success metadata, `Failed` carries the
/// public error message, and the in-flight states carry nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexState {
    Pending,
    Processing,
    Indexed {
        indexed_at: DateTime<Utc>,
        chunk_count: u32,
    },
    Failed {
        error_message: String,
    },
}

impl IndexState {
    pub fn status(&self) -> IndexStatus {
        match self {
            IndexState::Pending => IndexStatus::Pending,
            IndexState::Processing => IndexStatus::Processing,
            IndexState::Indexed { .. } => IndexStatus::Indexed,
            IndexState::Failed { .. } => IndexStatus::Failed,
        }
    }

    pub fn indexed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            IndexState::Indexed { indexed_at, .. } => Some(*indexed_at),
            _ => None,
        }
    }

    pub fn chunk_count(&self) -> Option<u32> {
        match self {
            IndexState::Indexed { chunk_count, .. } => Some(*chunk_count),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            IndexState::Failed { error_message } => Some(error_message),
            _ => None,
        }
    }
}

/// One uploaded file version and its indexing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: DocumentId,
    pub project_id: i64,
    pub uploaded_by: i64,
    pub file_name: String,
    pub blob_ref: BlobRef,
    pub file_size: i64,
    pub mime_type: String,
    /// Filterable type tag derived from the MIME type or file extension.
    pub file_type: String,
    pub category: DocumentCategory,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: IndexState,
}

impl Document {
    pub fn status(&self) -> IndexStatus {
        self.state.status()
    }
}

// Serialized with the state flattened into the four status fields callers
// expect (`index_status`, `indexed_at`, `chunk_count`, `error_message`).
impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut doc = serializer.serialize_struct("Document", 16)?;
        doc.serialize_field("id", &self.id)?;
        doc.serialize_field("project_id", &self.project_id)?;
        doc.serialize_field("uploaded_by", &self.uploaded_by)?;
        doc.serialize_field("file_name", &self.file_name)?;
        doc.serialize_field("blob_ref", &self.blob_ref)?;
        doc.serialize_field("file_size", &self.file_size)?;
        doc.serialize_field("mime_type", &self.mime_type)?;
        doc.serialize_field("file_type", &self.file_type)?;
        doc.serialize_field("category", self.category.as_str())?;
        doc.serialize_field("description", &self.description)?;
        doc.serialize_field("created_at", &self.created_at)?;
        doc.serialize_field("updated_at", &self.updated_at)?;
        doc.serialize_field("index_status", self.state.status().as_str())?;
        doc.serialize_field("indexed_at", &self.state.indexed_at())?;
        doc.serialize_field("chunk_count", &self.state.chunk_count())?;
        doc.serialize_field("error_message", &self.state.error_message())?;
        doc.end()
    }
}

/// Intake payload for a new document submission.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub project_id: i64,
    pub uploader_id: i64,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub category: DocumentCategory,
    pub description: Option<String>,
}

/// A validated, blob-backed document ready to be inserted. Produced by the
/// engine after sanitization and blob storage; consumed by
/// [`DocumentIndex::create_document`](document_index::DocumentIndex::create_document).
#[derive(Debug, Clone)]
pub struct DocumentDraft {
    pub project_id: i64,
    pub uploaded_by: i64,
    pub file_name: String,
    pub blob_ref: BlobRef,
    pub file_size: i64,
    pub mime_type: String,
    pub file_type: String,
    pub category: DocumentCategory,
    pub description: Option<String>,
}

/// A chunk as the worker hands it to the indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDraft {
    pub ordinal: u32,
    pub text: String,
    pub start_offset: i64,
    pub end_offset: i64,
}

/// A persisted chunk row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkRecord {
    pub id: i64,
    pub document_id: DocumentId,
    pub ordinal: u32,
    pub text: String,
    pub start_offset: i64,
    pub end_offset: i64,
    pub created_at: DateTime<Utc>,
}

/// Raw uploaded bytes, stored and retrieved by a stable reference.
///
/// An external collaborator from the pipeline's point of view: every
/// failure is reported as `StorageUnavailable` and treated as retryable.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn store(&self, bytes: &[u8], mime_type: &str) -> Result<BlobRef>;
    async fn fetch(&self, blob_ref: &str) -> Result<Vec<u8>>;
    async fn delete(&self, blob_ref: &str) -> Result<()>;
}

/// The searchable chunk store. Replacement is atomic per document: queries
/// observe either the prior chunk set or the new one, never a mix.
#[async_trait]
pub trait ChunkIndexer: Send + Sync {
    /// Atomically replace all chunks for a document, returning how many
    /// were written.
    async fn replace_chunks(&self, document_id: DocumentId, chunks: &[ChunkDraft]) -> Result<u32>;

    /// Delete all chunks for a document, returning how many were removed.
    /// Idempotent: deleting a document with no chunks succeeds with 0.
    async fn delete_chunks(&self, document_id: DocumentId) -> Result<u64>;

    /// All chunks for a document, ordered by ordinal.
    async fn chunks_for(&self, document_id: DocumentId) -> Result<Vec<ChunkRecord>>;

    /// Case-insensitive substring search over chunk text.
    async fn search_chunks(&self, query: &str, limit: usize) -> Result<Vec<ChunkRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            IndexStatus::Pending,
            IndexStatus::Processing,
            IndexStatus::Indexed,
            IndexStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<IndexStatus>(), Ok(status));
        }
        for category in DocumentCategory::ALL {
            assert_eq!(category.as_str().parse::<DocumentCategory>(), Ok(category));
        }
        assert!("banana".parse::<IndexStatus>().is_err());
    }

    #[test]
    fn state_accessors_follow_the_variant() {
        let indexed = IndexState::Indexed {
            indexed_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            chunk_count: 3,
        };
        assert_eq!(indexed.status(), IndexStatus::Indexed);
        assert_eq!(indexed.chunk_count(), Some(3));
        assert!(indexed.error_message().is_none());

        let failed = IndexState::Failed {
            error_message: "unsupported MIME type 'application/x-unknown'".into(),
        };
        assert_eq!(failed.status(), IndexStatus::Failed);
        assert!(failed.indexed_at().is_none());
        assert!(failed.chunk_count().is_none());
        assert_eq!(
            failed.error_message(),
            Some("unsupported MIME type 'application/x-unknown'")
        );
    }

    #[test]
    fn document_serializes_with_flattened_state() {
        let document = Document {
            id: 7,
            project_id: 1,
            uploaded_by: 2,
            file_name: "notes.txt".into(),
            blob_ref: "abc123".into(),
            file_size: 42,
            mime_type: "text/plain".into(),
            file_type: "text".into(),
            category: DocumentCategory::Reference,
            description: None,
            created_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 5).unwrap(),
            state: IndexState::Indexed {
                indexed_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 5).unwrap(),
                chunk_count: 3,
            },
        };
        let value = serde_json::to_value(&document).unwrap();
        assert_eq!(value["index_status"], "INDEXED");
        assert_eq!(value["chunk_count"], 3);
        assert_eq!(value["error_message"], serde_json::Value::Null);
        assert_eq!(value["category"], "REFERENCE");
    }
}
