pub mod text;

// Re-export the splitter types for external use
pub use text::{DEFAULT_BOUNDARY_PATTERNS, SplitterConfig, TextChunk, TextSplitter};
