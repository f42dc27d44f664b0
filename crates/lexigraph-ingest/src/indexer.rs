//! Chunk orchestration: fan-out, deadlines, isolation.
//!
//! The indexer owns the worker pool. Each chunk is processed independently
//! under its own deadline; a failure is converted into a classified record
//! and never disturbs sibling chunks. Back-pressure comes from a bounded
//! submission window of `2 × max_workers` spawned-but-unfinished tasks.

use crate::extract::ChunkExtractor;
use crate::{Chunk, Chunker, ParagraphChunker};
use lexigraph_store::{GraphStore, Provenance};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

// ============================================================================
// Failure records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Model output unparseable or oracle unreachable after retries.
    Extraction,
    /// Chunk exceeded its deadline.
    Timeout,
    /// Pipeline cancellation observed before the chunk persisted anything.
    Cancelled,
    /// Database failure outside the known, recovered races.
    Storage,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Extraction => write!(f, "extraction"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Cancelled => write!(f, "cancelled"),
            FailureKind::Storage => write!(f, "storage"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub chunk_id: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of `add_chunks`. Failures keep submission order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexSummary {
    pub succeeded: usize,
    pub failed: Vec<ChunkFailure>,
}

impl IndexSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed.len()
    }

    /// First `n` failures of each kind, for operator-facing output.
    pub fn error_samples(&self, n: usize) -> BTreeMap<FailureKind, Vec<&ChunkFailure>> {
        let mut samples: BTreeMap<FailureKind, Vec<&ChunkFailure>> = BTreeMap::new();
        for failure in &self.failed {
            let bucket = samples.entry(failure.kind).or_default();
            if bucket.len() < n {
                bucket.push(failure);
            }
        }
        samples
    }
}

// ============================================================================
// Indexer
// ============================================================================

pub struct Indexer {
    extractor: Arc<ChunkExtractor>,
    store: Arc<GraphStore>,
    chunker: Arc<dyn Chunker>,
    cancelled: Arc<AtomicBool>,
}

impl Indexer {
    pub fn new(extractor: Arc<ChunkExtractor>, store: Arc<GraphStore>) -> Self {
        Self {
            extractor,
            store,
            chunker: Arc::new(ParagraphChunker),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = chunker;
        self
    }

    /// Request cancellation: no new chunks are taken up; in-flight chunks
    /// finish within their own deadlines (the grace period) and the partial
    /// summary is returned.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Chunk `text` (via the injected chunker) and index the result.
    pub async fn add_text(&self, document_id: &str, text: &str) -> IndexSummary {
        let chunks = self.chunker.chunk(document_id, text);
        self.add_chunks(document_id, chunks).await
    }

    /// Process all chunks, in parallel when enabled, sequentially otherwise.
    pub async fn add_chunks(&self, document_id: &str, chunks: Vec<Chunk>) -> IndexSummary {
        let config = self.store.config();
        let summary = if config.parallel_processing() {
            self.run_parallel(document_id, chunks).await
        } else {
            self.run_sequential(document_id, chunks).await
        };

        info!(
            document_id,
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            "indexing finished"
        );
        summary
    }

    async fn run_sequential(&self, document_id: &str, chunks: Vec<Chunk>) -> IndexSummary {
        let mut summary = IndexSummary::default();
        let timeout = self.store.config().chunk_timeout();

        for chunk in chunks {
            if self.is_cancelled() {
                summary.failed.push(cancelled(&chunk.id));
                continue;
            }

            let outcome = run_one(
                Arc::clone(&self.extractor),
                Arc::clone(&self.store),
                document_id.to_string(),
                chunk,
                Arc::clone(&self.cancelled),
                timeout,
            )
            .await;
            match outcome {
                Ok(()) => summary.succeeded += 1,
                Err(failure) => {
                    warn!(chunk_id = %failure.chunk_id, kind = %failure.kind, "chunk failed");
                    summary.failed.push(failure);
                }
            }
        }
        summary
    }

    async fn run_parallel(&self, document_id: &str, chunks: Vec<Chunk>) -> IndexSummary {
        let config = self.store.config();
        let workers = config.effective_workers();
        let timeout = config.chunk_timeout();

        // Submission window bounds spawned-but-unfinished tasks; the worker
        // semaphore bounds actual concurrency.
        let submission = Arc::new(Semaphore::new(workers * 2));
        let pool = Arc::new(Semaphore::new(workers));
        let mut tasks: JoinSet<Result<(), ChunkFailure>> = JoinSet::new();
        let mut summary = IndexSummary::default();

        for chunk in chunks {
            if self.is_cancelled() {
                summary.failed.push(cancelled(&chunk.id));
                continue;
            }

            let Ok(submit_permit) = Arc::clone(&submission).acquire_owned().await else {
                summary.failed.push(cancelled(&chunk.id));
                continue;
            };

            let pool = Arc::clone(&pool);
            let extractor = Arc::clone(&self.extractor);
            let store = Arc::clone(&self.store);
            let cancelled_flag = Arc::clone(&self.cancelled);
            let document_id = document_id.to_string();

            tasks.spawn(async move {
                let _submit = submit_permit;
                let Ok(_work) = pool.acquire_owned().await else {
                    return Err(cancelled(&chunk.id));
                };
                run_one(extractor, store, document_id, chunk, cancelled_flag, timeout).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => summary.succeeded += 1,
                Ok(Err(failure)) => {
                    warn!(chunk_id = %failure.chunk_id, kind = %failure.kind, "chunk failed");
                    summary.failed.push(failure);
                }
                Err(join_error) => {
                    // A panicked worker still only costs its own chunk.
                    summary.failed.push(ChunkFailure {
                        chunk_id: "<unknown>".to_string(),
                        kind: FailureKind::Storage,
                        message: format!("worker aborted: {join_error}"),
                    });
                }
            }
        }
        summary
    }
}

fn cancelled(chunk_id: &str) -> ChunkFailure {
    ChunkFailure {
        chunk_id: chunk_id.to_string(),
        kind: FailureKind::Cancelled,
        message: "pipeline cancelled".to_string(),
    }
}

/// Process one chunk under its deadline: extract, then persist. Entities
/// land before any of the chunk's relationships by construction of
/// `GraphStore::add`.
async fn run_one(
    extractor: Arc<ChunkExtractor>,
    store: Arc<GraphStore>,
    document_id: String,
    chunk: Chunk,
    cancelled_flag: Arc<AtomicBool>,
    timeout: std::time::Duration,
) -> Result<(), ChunkFailure> {
    let chunk_id = chunk.id.clone();
    let work = async {
        if cancelled_flag.load(Ordering::SeqCst) {
            return Err(cancelled(&chunk_id));
        }

        let extraction = extractor.extract(&chunk).await.map_err(|e| ChunkFailure {
            chunk_id: chunk_id.clone(),
            kind: FailureKind::Extraction,
            message: e.to_string(),
        })?;

        // Last write-free checkpoint: past this, the chunk persists fully.
        if cancelled_flag.load(Ordering::SeqCst) {
            return Err(cancelled(&chunk_id));
        }

        let provenance = Provenance {
            document_id,
            chunk_id: chunk_id.clone(),
        };
        store
            .add(&extraction, &provenance)
            .await
            .map_err(|e| ChunkFailure {
                chunk_id: chunk_id.clone(),
                kind: FailureKind::Storage,
                message: e.to_string(),
            })?;
        Ok(())
    };

    match tokio::time::timeout(timeout, work).await {
        Ok(result) => result,
        Err(_) => Err(ChunkFailure {
            chunk_id,
            kind: FailureKind::Timeout,
            message: format!("deadline of {}s exceeded", timeout.as_secs()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(id: &str, kind: FailureKind) -> ChunkFailure {
        ChunkFailure {
            chunk_id: id.to_string(),
            kind,
            message: String::new(),
        }
    }

    #[test]
    fn error_samples_caps_per_kind() {
        let summary = IndexSummary {
            succeeded: 5,
            failed: vec![
                failure("a", FailureKind::Timeout),
                failure("b", FailureKind::Timeout),
                failure("c", FailureKind::Timeout),
                failure("d", FailureKind::Extraction),
            ],
        };

        let samples = summary.error_samples(2);
        assert_eq!(samples[&FailureKind::Timeout].len(), 2);
        assert_eq!(samples[&FailureKind::Extraction].len(), 1);
        assert_eq!(summary.total(), 9);
    }
}
