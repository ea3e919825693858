use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use carrel_indexer::pipeline::{BLOB_DIR_NAME, PipelineConfig, PipelineEngine, ProcessingStats};
use carrel_indexer::sanitize::mime_for_extension;
use carrel_indexer::storage::document_index::DB_FILE_NAME;
use carrel_indexer::storage::{
    ChunkRecord, CreatedFilter, DateBucket, Document, DocumentCategory, DocumentFilter,
    DocumentStats, IndexState, IndexStatus, NewDocument,
};

/// A CLI tool to submit, index, and query research documents.
#[derive(Parser, Debug)]
#[command(name = "carrel", author, version, about, long_about = None)]
struct Args {
    /// Base directory containing the carrel.db database and blob store
    #[arg(short, long, default_value = ".")]
    base_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the document database and blob directory
    Init,
    /// Submit a file for asynchronous indexing
    Submit {
        /// Path of the file to ingest
        file: PathBuf,
        /// Project the document belongs to
        #[arg(short, long)]
        project: i64,
        /// Uploading user id
        #[arg(short, long, default_value_t = 0)]
        uploader: i64,
        /// Document category
        #[arg(short, long, default_value = "PROJECT")]
        category: DocumentCategory,
        /// Free-form description
        #[arg(short, long)]
        description: Option<String>,
        /// MIME type (inferred from the file extension when omitted)
        #[arg(short, long)]
        mime: Option<String>,
    },
    /// Show a single document
    Get {
        /// Document ID
        id: i64,
        /// Also print the indexed chunk text
        #[arg(long)]
        chunks: bool,
        /// Output format
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },
    /// List documents with optional filters
    List {
        /// Filter by index status (PENDING, PROCESSING, INDEXED, FAILED)
        #[arg(long)]
        status: Option<IndexStatus>,
        /// Filter by category
        #[arg(long)]
        category: Option<DocumentCategory>,
        /// Filter by project id
        #[arg(long)]
        project: Option<i64>,
        /// Filter by uploading user id
        #[arg(long)]
        uploader: Option<i64>,
        /// Filter by derived file type (pdf, word, text, ...)
        #[arg(long)]
        file_type: Option<String>,
        /// Filter by creation date (today, this_week, this_month, this_year)
        #[arg(long)]
        created: Option<DateBucket>,
        /// Substring match over file name and description
        #[arg(long)]
        search: Option<String>,
        /// Page number, starting at 1
        #[arg(short, long, default_value_t = 1)]
        page: u32,
        /// Documents per page
        #[arg(long, default_value_t = 20)]
        page_size: u32,
        /// Output format
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },
    /// Search indexed chunk text
    Search {
        /// Substring to look for (case-insensitive)
        query: String,
        /// Maximum number of results
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
        /// Output format
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },
    /// Show document counts and queue depth
    Stats {
        /// Restrict to one project
        #[arg(short, long)]
        project: Option<i64>,
        /// Output format
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },
    /// Queue a finished (INDEXED or FAILED) document for re-indexing
    Reindex {
        /// Document ID
        id: i64,
    },
    /// Delete a document, its chunks, and any queued work
    Delete {
        /// Document ID
        id: i64,
    },
    /// Run indexing workers against the queue
    Work {
        /// Process queued jobs until none remain, then exit
        #[arg(long)]
        drain: bool,
        /// Number of concurrent workers
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Init => {
            let _engine =
                PipelineEngine::new(&args.base_dir, PipelineConfig::default()).await?;
            println!("Initialized document index at {}", args.base_dir.display());
            println!("Database: {}", args.base_dir.join(DB_FILE_NAME).display());
            println!("Blob store: {}", args.base_dir.join(BLOB_DIR_NAME).display());
            Ok(())
        }
        Commands::Submit {
            file,
            project,
            uploader,
            category,
            description,
            mime,
        } => {
            let engine = PipelineEngine::new(&args.base_dir, PipelineConfig::default()).await?;

            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let file_name = file
                .file_name()
                .and_then(|name| name.to_str())
                .context("file name is not valid UTF-8")?
                .to_string();
            let mime_type = match mime {
                Some(mime) => mime,
                None => mime_for_extension(&file_name)
                    .with_context(|| {
                        format!("cannot infer a MIME type for '{file_name}'; pass --mime")
                    })?
                    .to_string(),
            };

            let document = engine
                .submit_document(NewDocument {
                    project_id: project,
                    uploader_id: uploader,
                    file_name,
                    bytes,
                    mime_type,
                    category,
                    description,
                })
                .await?;
            println!(
                "Submitted document {} ({} bytes, {})",
                document.id, document.file_size, document.mime_type
            );
            println!("Run `carrel work --drain` to process the queue");
            Ok(())
        }
        Commands::Get { id, chunks, output } => {
            let engine = PipelineEngine::new(&args.base_dir, PipelineConfig::default()).await?;

            let Some(document) = engine.get_document(id).await? else {
                println!("Document {id} not found");
                return Ok(());
            };
            let chunk_rows = if chunks {
                engine.chunks_for(id).await?
            } else {
                Vec::new()
            };

            match output {
                OutputFormat::Json => {
                    if chunks {
                        #[derive(Serialize)]
                        struct DocumentWithChunks {
                            document: Document,
                            chunks: Vec<ChunkRecord>,
                        }
                        let combined = DocumentWithChunks {
                            document,
                            chunks: chunk_rows,
                        };
                        println!("{}", serde_json::to_string_pretty(&combined)?);
                    } else {
                        println!("{}", serde_json::to_string_pretty(&document)?);
                    }
                }
                OutputFormat::Text => {
                    print_document(&document);
                    for chunk in &chunk_rows {
                        println!(
                            "--- chunk {} (chars {}..{})",
                            chunk.ordinal, chunk.start_offset, chunk.end_offset
                        );
                        println!("{}", chunk.text);
                    }
                }
            }
            Ok(())
        }
        Commands::List {
            status,
            category,
            project,
            uploader,
            file_type,
            created,
            search,
            page,
            page_size,
            output,
        } => {
            let engine = PipelineEngine::new(&args.base_dir, PipelineConfig::default()).await?;

            let mut filter = DocumentFilter::new();
            filter.status = status;
            filter.category = category;
            if let Some(project) = project {
                filter.project_ids.push(project);
            }
            if let Some(uploader) = uploader {
                filter.uploader_ids.push(uploader);
            }
            filter.file_type = file_type;
            filter.created = created.map(CreatedFilter::Bucket);
            filter.search = search;

            let listing = engine.list(&filter, page, page_size).await?;
            match output {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&listing)?);
                }
                OutputFormat::Text => {
                    let total_pages = listing
                        .total_count
                        .div_ceil(u64::from(listing.page_size))
                        .max(1);
                    println!(
                        "Found {} documents (page {} of {}):",
                        listing.total_count, listing.page, total_pages
                    );
                    for document in &listing.documents {
                        println!(
                            "  {} | {:<10} | {:<9} | {}",
                            document.id,
                            document.state.status().as_str(),
                            document.category.as_str(),
                            document.file_name
                        );
                    }
                }
            }
            Ok(())
        }
        Commands::Search {
            query,
            limit,
            output,
        } => {
            let engine = PipelineEngine::new(&args.base_dir, PipelineConfig::default()).await?;

            let hits = engine.search_chunks(&query, limit).await?;
            match output {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&hits)?);
                }
                OutputFormat::Text => {
                    println!("Found {} matching chunks:", hits.len());
                    for chunk in &hits {
                        let preview: String = chunk.text.chars().take(100).collect();
                        println!(
                            "  document {} chunk {}: {}",
                            chunk.document_id, chunk.ordinal, preview
                        );
                    }
                }
            }
            Ok(())
        }
        Commands::Stats { project, output } => {
            let engine = PipelineEngine::new(&args.base_dir, PipelineConfig::default()).await?;

            let documents = engine.stats(project).await?;
            let queued_jobs = engine.queue_depth().await?;
            match output {
                OutputFormat::Json => {
                    #[derive(Serialize)]
                    struct StatsOutput {
                        documents: DocumentStats,
                        queued_jobs: u64,
                    }
                    let output = StatsOutput {
                        documents,
                        queued_jobs,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Text => {
                    println!("Document Statistics:");
                    println!("  Total documents: {}", documents.total_count);
                    for category in DocumentCategory::ALL {
                        let count = documents
                            .counts_by_category
                            .get(&category)
                            .copied()
                            .unwrap_or(0);
                        println!("  {}: {}", category.as_str(), count);
                    }
                    println!("  Queued jobs: {queued_jobs}");
                }
            }
            Ok(())
        }
        Commands::Reindex { id } => {
            let engine = PipelineEngine::new(&args.base_dir, PipelineConfig::default()).await?;

            let document = engine.request_reindex(id).await?;
            println!(
                "Document {} queued for re-indexing (status {})",
                document.id,
                document.state.status().as_str()
            );
            println!("Run `carrel work --drain` to process the queue");
            Ok(())
        }
        Commands::Delete { id } => {
            let engine = PipelineEngine::new(&args.base_dir, PipelineConfig::default()).await?;

            engine.delete_document(id).await?;
            println!("Deleted document {id}");
            Ok(())
        }
        Commands::Work { drain, workers } => {
            let config = PipelineConfig::default().with_max_workers(workers);
            let mut engine = PipelineEngine::new(&args.base_dir, config).await?;

            if drain {
                let processed = engine.process_pending_jobs().await?;
                println!("Processed {processed} jobs");
                print_processing_stats(&engine.processing_stats());
            } else {
                engine.start();
                println!("Indexing workers running; press Ctrl-C to stop");
                tokio::signal::ctrl_c().await?;
                println!("Stopping...");
                engine.shutdown().await;
                print_processing_stats(&engine.processing_stats());
            }
            Ok(())
        }
    }
}

fn print_document(document: &Document) {
    println!("ID: {}", document.id);
    println!(
        "File: {} ({}, {} bytes)",
        document.file_name, document.mime_type, document.file_size
    );
    println!(
        "Project: {} | Uploaded by: {}",
        document.project_id, document.uploaded_by
    );
    println!(
        "Category: {} | Type: {}",
        document.category.as_str(),
        document.file_type
    );
    if let Some(description) = &document.description {
        println!("Description: {description}");
    }
    println!("Created: {}", document.created_at);
    println!("Status: {}", document.state.status().as_str());
    match &document.state {
        IndexState::Indexed {
            indexed_at,
            chunk_count,
        } => {
            println!("Indexed: {indexed_at} ({chunk_count} chunks)");
        }
        IndexState::Failed { error_message } => {
            println!("Error: {error_message}");
        }
        IndexState::Pending | IndexState::Processing => {}
    }
}

fn print_processing_stats(stats: &ProcessingStats) {
    println!("  Documents indexed: {}", stats.documents_indexed);
    println!("  Documents failed: {}", stats.documents_failed);
    println!("  Retries scheduled: {}", stats.retries_scheduled);
    println!("  Chunks written: {}", stats.chunks_written);
}
