//! Lexigraph Ingestion: chunk-level extraction into the knowledge graph
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      EXTRACTION PIPELINE                             │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │   document ──► chunks ──► ┌─────────┐  fan-out  ┌────────────────┐  │
//! │                           │ Indexer │══════════►│ worker (1..N)  │  │
//! │                           └─────────┘           │                │  │
//! │                                ▲                │  Extractor     │  │
//! │                                │                │   │ one LM call│  │
//! │                            summary              │   ▼            │  │
//! │                        {succeeded,              │  GraphStore    │  │
//! │                         failed[kind]}           │   .add(...)    │  │
//! │                                                 └────────────────┘  │
//! │                                                                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Invariants
//!
//! - One structured model call per chunk in enhanced mode (two in legacy)
//! - Within a chunk, entities are resolved before any relationship lands
//! - One chunk's failure never affects its siblings; failures surface in
//!   the summary, classified by kind

pub mod benchmark;
pub mod extract;
pub mod indexer;
pub mod llm;
#[cfg(feature = "openai")]
pub mod providers;

use serde::{Deserialize, Serialize};

pub use benchmark::{BenchmarkReport, BenchmarkReporter, GoldMergePair, ModeReport};
pub use extract::{ChunkExtractor, ExtractionError, ExtractorStats};
pub use indexer::{ChunkFailure, FailureKind, IndexSummary, Indexer};
pub use llm::{CompletionRequest, CompletionResponse, LanguageModel, LlmError, Message, Role};

// ============================================================================
// Chunks
// ============================================================================

/// An opaque text fragment with a stable identifier. Immutable inside the
/// pipeline; the back-pointer to the source document travels separately as
/// provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
}

impl Chunk {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Text → chunks. Chunking strategy is an external collaborator; the
/// pipeline only requires stable chunk ids.
pub trait Chunker: Send + Sync {
    fn chunk(&self, document_id: &str, text: &str) -> Vec<Chunk>;
}

/// Minimal default: blank-line separated paragraphs, ids derived from the
/// document id and paragraph position.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParagraphChunker;

impl Chunker for ParagraphChunker {
    fn chunk(&self, document_id: &str, text: &str) -> Vec<Chunk> {
        text.split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .enumerate()
            .map(|(i, p)| Chunk::new(format!("{document_id}:{i}"), p))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraph_chunker_assigns_stable_ids() {
        let chunks = ParagraphChunker.chunk("doc", "first para\n\nsecond para\n\n\n\n");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].id, "doc:0");
        assert_eq!(chunks[1].id, "doc:1");
        assert_eq!(chunks[1].text, "second para");
    }

    #[test]
    fn paragraph_chunker_skips_empty_documents() {
        assert!(ParagraphChunker.chunk("doc", "   \n\n  ").is_empty());
    }
}
