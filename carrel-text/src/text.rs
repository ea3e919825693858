//! Deterministic overlapping-window text splitting.
//!
//! This module turns a document's extracted text into an ordered sequence of
//! bounded, overlapping chunks suitable for indexing. Window sizes are
//! measured in *characters* so multi-byte text is never cut mid-character;
//! the offsets reported back are *byte* offsets into the original string so
//! callers can slice the source text directly.
//!
//! Cut positions prefer natural boundaries. Before falling back to a hard
//! cut at the window limit, the splitter searches backward through a
//! configurable radius for the most significant boundary it can find:
//! paragraph break, then sentence end, then line break, then any
//! whitespace. The search patterns are ordered regexes, most significant
//! first, mirroring how a human would prefer to break prose.
//!
//! Splitting is a pure function of the input text and the configuration:
//! the same text with the same settings always produces the same chunk
//! count, texts, and offsets.

use regex::Regex;
use serde::Serialize;

/// Boundary patterns ordered from most significant to least significant.
///
/// The splitter tries each pattern in order against the tail of the current
/// window and cuts at the last match of the first pattern that matches at
/// all. Later patterns are only consulted when every earlier one is absent
/// from the search radius.
pub const DEFAULT_BOUNDARY_PATTERNS: &[&str] = &[
    // Paragraph break: a blank line, possibly with trailing spaces
    r"\n[ \t]*\n",
    // Sentence end: terminator, optional closing quote/paren, then whitespace
    r#"[.!?]["')\]]?\s"#,
    // Line break
    r"\n",
    // Any whitespace
    r"\s",
];

/// Configuration for [`TextSplitter`].
///
/// `max_chunk_chars` bounds every window; consecutive windows share
/// `overlap_chars` characters of context; `boundary_radius` is how far back
/// from the hard limit the splitter will move a cut to land on a natural
/// boundary. A radius of zero disables boundary search entirely and every
/// cut is a hard cut, which is occasionally useful in tests that need exact
/// offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitterConfig {
    /// Maximum characters per chunk.
    pub max_chunk_chars: usize,
    /// Characters of overlap between consecutive chunks.
    pub overlap_chars: usize,
    /// How many characters before the hard limit to search for a boundary.
    pub boundary_radius: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 1000,
            overlap_chars: 100,
            boundary_radius: 100,
        }
    }
}

impl SplitterConfig {
    /// Set the maximum characters per chunk.
    pub fn with_max_chunk_chars(mut self, max_chunk_chars: usize) -> Self {
        self.max_chunk_chars = max_chunk_chars;
        self
    }

    /// Set the overlap between consecutive chunks.
    pub fn with_overlap_chars(mut self, overlap_chars: usize) -> Self {
        self.overlap_chars = overlap_chars;
        self
    }

    /// Set the boundary search radius.
    pub fn with_boundary_radius(mut self, boundary_radius: usize) -> Self {
        self.boundary_radius = boundary_radius;
        self
    }
}

/// One bounded slice of the input text.
///
/// `sequence` numbers chunks 0.. in input order. `start_offset` and
/// `end_offset` are byte offsets into the original text, always on UTF-8
/// character boundaries, so `&text[start_offset..end_offset] == chunk.text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextChunk {
    /// Position of this chunk in the sequence, starting at 0.
    pub sequence: usize,
    /// The chunk's text.
    pub text: String,
    /// Byte offset of the chunk's first byte in the input.
    pub start_offset: usize,
    /// Byte offset one past the chunk's last byte in the input.
    pub end_offset: usize,
}

/// Splits text into bounded, overlapping windows.
///
/// # Examples
///
/// ```
/// use carrel_text::{SplitterConfig, TextSplitter};
///
/// let splitter = TextSplitter::new(SplitterConfig::default());
/// let chunks = splitter.split("A short note.");
/// assert_eq!(chunks.len(), 1);
/// assert_eq!(chunks[0].text, "A short note.");
/// assert_eq!(chunks[0].start_offset, 0);
/// assert_eq!(chunks[0].end_offset, 13);
/// ```
///
/// Longer input produces overlapping windows:
///
/// ```
/// use carrel_text::{SplitterConfig, TextSplitter};
///
/// let config = SplitterConfig {
///     max_chunk_chars: 10,
///     overlap_chars: 2,
///     boundary_radius: 0,
/// };
/// let chunks = TextSplitter::new(config).split("abcdefghijklmnop");
/// assert_eq!(chunks.len(), 2);
/// assert_eq!(chunks[0].text, "abcdefghij");
/// assert_eq!(chunks[1].text, "ijklmnop");
/// ```
#[derive(Debug, Clone)]
pub struct TextSplitter {
    config: SplitterConfig,
    boundaries: Vec<Regex>,
}

impl TextSplitter {
    /// Create a splitter with the default boundary patterns.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is inconsistent: `max_chunk_chars` must
    /// be nonzero, `overlap_chars` must be smaller than `max_chunk_chars`,
    /// and `boundary_radius` must not exceed `max_chunk_chars`.
    pub fn new(config: SplitterConfig) -> Self {
        Self::with_boundary_patterns(config, DEFAULT_BOUNDARY_PATTERNS)
    }

    /// Create a splitter with custom boundary patterns, ordered from most
    /// significant to least significant.
    ///
    /// # Panics
    ///
    /// Panics on an inconsistent configuration (see [`TextSplitter::new`])
    /// or an invalid regex pattern.
    pub fn with_boundary_patterns(config: SplitterConfig, patterns: &[&str]) -> Self {
        assert!(config.max_chunk_chars > 0, "max_chunk_chars must be > 0");
        assert!(
            config.overlap_chars < config.max_chunk_chars,
            "overlap_chars must be smaller than max_chunk_chars"
        );
        assert!(
            config.boundary_radius <= config.max_chunk_chars,
            "boundary_radius must not exceed max_chunk_chars"
        );
        let boundaries = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .unwrap_or_else(|e| panic!("invalid boundary pattern {pattern:?}: {e}"))
            })
            .collect();
        Self { config, boundaries }
    }

    /// The configuration this splitter was built with.
    pub fn config(&self) -> &SplitterConfig {
        &self.config
    }

    /// Split `text` into chunks.
    ///
    /// Empty or whitespace-only input yields no chunks. Every returned
    /// chunk is nonempty, sequences are contiguous from 0, and for each
    /// chunk `&text[start_offset..end_offset]` equals its `text`.
    pub fn split(&self, text: &str) -> Vec<TextChunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        // Byte position of every character, so character-counted windows
        // map back to byte offsets without re-scanning.
        let char_starts: Vec<usize> = text.char_indices().map(|(pos, _)| pos).collect();
        let total_chars = char_starts.len();
        let byte_at = |char_pos: usize| -> usize {
            char_starts.get(char_pos).copied().unwrap_or(text.len())
        };

        let max = self.config.max_chunk_chars;
        let overlap = self.config.overlap_chars;
        let radius = self.config.boundary_radius;

        let mut chunks = Vec::new();
        let mut start = 0usize;
        loop {
            let hard_end = (start + max).min(total_chars);
            let mut end = hard_end;

            // Only move the cut when there is text beyond this window;
            // the final window always runs to the end of the input.
            if hard_end < total_chars && radius > 0 {
                let floor = hard_end.saturating_sub(radius).max(start + 1);
                let slice = &text[byte_at(floor)..byte_at(hard_end)];
                if let Some(cut) = self.find_boundary(slice) {
                    let cut_byte = byte_at(floor) + cut;
                    let cut_char = char_starts.partition_point(|&pos| pos < cut_byte);
                    if cut_char > start {
                        end = cut_char;
                    }
                }
            }

            let start_offset = byte_at(start);
            let end_offset = byte_at(end);
            chunks.push(TextChunk {
                sequence: chunks.len(),
                text: text[start_offset..end_offset].to_string(),
                start_offset,
                end_offset,
            });

            if end >= total_chars {
                break;
            }
            // Step back by the overlap, but always advance past the
            // previous start so short boundary cuts cannot stall the loop.
            start = end.saturating_sub(overlap).max(start + 1);
        }
        chunks
    }

    /// Find the preferred cut inside `slice`, as a byte offset one past the
    /// boundary. Patterns are tried in significance order; within a
    /// pattern the last match wins so chunks stay as full as possible.
    fn find_boundary(&self, slice: &str) -> Option<usize> {
        for pattern in &self.boundaries {
            if let Some(found) = pattern.find_iter(slice).last() {
                return Some(found.end());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hard_splitter(max: usize, overlap: usize) -> TextSplitter {
        TextSplitter::new(SplitterConfig {
            max_chunk_chars: max,
            overlap_chars: overlap,
            boundary_radius: 0,
        })
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let splitter = TextSplitter::new(SplitterConfig::default());
        assert!(splitter.split("").is_empty());
        assert!(splitter.split("   \n\t  \n").is_empty());
    }

    #[test]
    fn short_input_is_one_chunk() {
        let splitter = TextSplitter::new(SplitterConfig::default());
        let chunks = splitter.split("hello world");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].sequence, 0);
        assert_eq!(chunks[0].text, "hello world");
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].end_offset, 11);
    }

    #[test]
    fn hard_cuts_overlap_by_configured_amount() {
        let text = "a".repeat(2100);
        let chunks = hard_splitter(1000, 100).split(&text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks
                .iter()
                .map(|c| (c.start_offset, c.end_offset))
                .collect::<Vec<_>>(),
            vec![(0, 1000), (900, 1900), (1800, 2100)]
        );
        assert_eq!(chunks[0].text.len(), 1000);
        assert_eq!(chunks[2].text.len(), 300);
    }

    #[test]
    fn boundary_search_does_not_change_count_for_unbroken_text() {
        // No whitespace anywhere, so every pattern misses and the
        // default-radius splitter behaves exactly like the hard splitter.
        let text = "a".repeat(2100);
        let chunks = TextSplitter::new(SplitterConfig::default()).split(&text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].end_offset, 2100);
    }

    #[test]
    fn prefers_paragraph_break_over_sentence_end() {
        // Window limit is 40; the search radius covers both the sentence
        // end at "one." and the paragraph break after it.
        let text = "First sentence one.\n\nSecond block follows here with more text.";
        let config = SplitterConfig {
            max_chunk_chars: 40,
            overlap_chars: 0,
            boundary_radius: 30,
        };
        let chunks = TextSplitter::new(config).split(text);
        assert_eq!(chunks[0].text, "First sentence one.\n\n");
        assert_eq!(chunks[1].start_offset, 21);
    }

    #[test]
    fn falls_back_to_sentence_then_whitespace() {
        let text = "One two three four. Five six seven eight nine ten eleven";
        let config = SplitterConfig {
            max_chunk_chars: 30,
            overlap_chars: 0,
            boundary_radius: 15,
        };
        let chunks = TextSplitter::new(config).split(text);
        // The radius around the 30-char limit contains the ". " after
        // "four" at offset 18..20, so the first cut lands there.
        assert_eq!(chunks[0].text, "One two three four. ");

        // Without any sentence end in the radius it cuts on whitespace.
        let plain = "alpha beta gamma delta epsilon zeta eta theta";
        let chunks = TextSplitter::new(config).split(plain);
        assert!(chunks[0].text.ends_with(' '));
        assert!(chunks[0].text.len() <= 30);
    }

    #[test]
    fn offsets_slice_back_to_chunk_text() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(60);
        let chunks = TextSplitter::new(SplitterConfig::default()).split(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(&text[chunk.start_offset..chunk.end_offset], chunk.text);
            assert!(!chunk.text.is_empty());
            assert!(chunk.text.chars().count() <= 1000);
        }
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence, i);
        }
        assert_eq!(chunks.last().map(|c| c.end_offset), Some(text.len()));
    }

    #[test]
    fn multibyte_text_cuts_on_character_boundaries() {
        let text = "é".repeat(50);
        let chunks = hard_splitter(20, 5).split(&text);
        for chunk in &chunks {
            assert_eq!(&text[chunk.start_offset..chunk.end_offset], chunk.text);
            // Each é is two bytes, so offsets land on even positions.
            assert_eq!(chunk.start_offset % 2, 0);
            assert_eq!(chunk.end_offset % 2, 0);
            assert!(chunk.text.chars().count() <= 20);
        }
        assert_eq!(chunks.last().map(|c| c.end_offset), Some(text.len()));
    }

    #[test]
    fn splitting_is_deterministic() {
        let text = "Sentence number one. Sentence number two!\n\nA new paragraph with more words. ".repeat(40);
        let splitter = TextSplitter::new(SplitterConfig::default());
        let first = splitter.split(&text);
        let second = splitter.split(&text);
        assert_eq!(first, second);
    }

    #[test]
    fn overlap_preserves_context_across_windows() {
        let text = "x".repeat(250);
        let chunks = hard_splitter(100, 20).split(&text);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end_offset - pair[1].start_offset, 20);
        }
    }

    #[test]
    #[should_panic(expected = "overlap_chars must be smaller")]
    fn rejects_overlap_at_least_max() {
        TextSplitter::new(SplitterConfig {
            max_chunk_chars: 10,
            overlap_chars: 10,
            boundary_radius: 0,
        });
    }
}
