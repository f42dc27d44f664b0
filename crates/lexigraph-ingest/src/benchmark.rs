//! Benchmark reporter: legacy vs enhanced over a fixed corpus.
//!
//! Runs the full pipeline twice against fresh in-memory backends and emits
//! the KPI vector as JSON. Diagnostic tooling, not on the hot path.

use crate::extract::ChunkExtractor;
use crate::indexer::Indexer;
use crate::llm::LanguageModel;
use crate::Chunk;
use lexigraph_store::{
    Embedder, GraphStore, MemoryGraph, Normalizer, PipelineConfig, RelationshipType,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// A labeled pair of surface forms with the ground-truth merge decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldMergePair {
    pub surface_a: String,
    pub surface_b: String,
    pub should_merge: bool,
}

/// KPI vector for one pipeline mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeReport {
    pub enhanced: bool,
    pub entities: usize,
    pub relationships: usize,
    /// Fraction of entities sharing a normalized surface form with another.
    pub duplicate_entity_rate: f64,
    /// Precision of predicted merges against the gold subset; absent when
    /// no merge was predicted for any gold pair.
    pub merge_precision: Option<f64>,
    pub edge_to_node_ratio: f64,
    /// Fraction of edges carrying a non-generic type.
    pub typed_relationship_coverage: f64,
    pub mean_llm_calls_per_chunk: f64,
    pub throughput_chunks_per_second: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub corpus_chunks: usize,
    pub model: String,
    pub legacy: ModeReport,
    pub enhanced: ModeReport,
}

impl BenchmarkReport {
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct BenchmarkReporter {
    corpus: Vec<Chunk>,
    gold: Vec<GoldMergePair>,
}

impl BenchmarkReporter {
    pub fn new(corpus: Vec<Chunk>, gold: Vec<GoldMergePair>) -> Self {
        Self { corpus, gold }
    }

    /// Run legacy then enhanced and assemble the comparison report.
    pub async fn run(
        &self,
        model: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
    ) -> anyhow::Result<BenchmarkReport> {
        let legacy = self
            .run_mode(PipelineConfig::legacy(), Arc::clone(&model), Arc::clone(&embedder))
            .await?;
        let enhanced = self
            .run_mode(PipelineConfig::enhanced(), Arc::clone(&model), embedder)
            .await?;

        Ok(BenchmarkReport {
            generated_at: chrono::Utc::now(),
            corpus_chunks: self.corpus.len(),
            model: model.model_name(),
            legacy,
            enhanced,
        })
    }

    async fn run_mode(
        &self,
        config: PipelineConfig,
        model: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
    ) -> anyhow::Result<ModeReport> {
        let db = Arc::new(MemoryGraph::new());
        let db_handle: Arc<dyn lexigraph_store::GraphDatabase> = db.clone() as Arc<dyn lexigraph_store::GraphDatabase>;
        let store = Arc::new(
            GraphStore::open(db_handle, embedder, config.clone(), "benchmark").await?,
        );
        let extractor = Arc::new(ChunkExtractor::new(model, config.clone()));
        let indexer = Indexer::new(Arc::clone(&extractor), Arc::clone(&store));

        let started = Instant::now();
        let summary = indexer.add_chunks("benchmark", self.corpus.clone()).await;
        let elapsed = started.elapsed().as_secs_f64();

        let entities = store.database().all_entities("benchmark").await?;
        let relationships = store.database().all_relationships().await?;
        let stats = extractor.stats();

        // Duplicate detection always uses the canonical normalizer,
        // whatever the mode under test did.
        let probe = Normalizer::new(true);
        let mut groups: HashMap<String, usize> = HashMap::new();
        for entity in &entities {
            *groups.entry(probe.normalize_name(&entity.display_name)).or_insert(0) += 1;
        }
        let duplicated: usize = groups.values().filter(|&&n| n > 1).sum();
        let duplicate_entity_rate = if entities.is_empty() {
            0.0
        } else {
            duplicated as f64 / entities.len() as f64
        };

        // Map every observed surface form (display name + aliases) to its
        // entity, then score the gold pairs.
        let mut surface_to_entity: HashMap<String, uuid::Uuid> = HashMap::new();
        for entity in &entities {
            surface_to_entity.insert(probe.normalize_name(&entity.display_name), entity.id);
            for alias in &entity.metadata.aliases {
                surface_to_entity.insert(probe.normalize_name(alias), entity.id);
            }
        }
        let mut predicted_merges = 0usize;
        let mut correct_merges = 0usize;
        for pair in &self.gold {
            let a = surface_to_entity.get(&probe.normalize_name(&pair.surface_a));
            let b = surface_to_entity.get(&probe.normalize_name(&pair.surface_b));
            if let (Some(a), Some(b)) = (a, b) {
                if a == b {
                    predicted_merges += 1;
                    if pair.should_merge {
                        correct_merges += 1;
                    }
                }
            }
        }
        let merge_precision = if predicted_merges == 0 {
            None
        } else {
            Some(correct_merges as f64 / predicted_merges as f64)
        };

        let typed = relationships
            .iter()
            .filter(|r| r.relationship_type != RelationshipType::Generic)
            .count();
        let typed_relationship_coverage = if relationships.is_empty() {
            0.0
        } else {
            typed as f64 / relationships.len() as f64
        };

        let edge_to_node_ratio = if entities.is_empty() {
            0.0
        } else {
            relationships.len() as f64 / entities.len() as f64
        };

        let total = summary.total();
        let mean_llm_calls_per_chunk = if self.corpus.is_empty() {
            0.0
        } else {
            stats.llm_calls as f64 / self.corpus.len() as f64
        };
        let throughput_chunks_per_second = if elapsed > 0.0 {
            total as f64 / elapsed
        } else {
            0.0
        };
        let error_rate = if total == 0 {
            0.0
        } else {
            summary.failed.len() as f64 / total as f64
        };

        Ok(ModeReport {
            enhanced: config.enable_enhanced_kg,
            entities: entities.len(),
            relationships: relationships.len(),
            duplicate_entity_rate,
            merge_precision,
            edge_to_node_ratio,
            typed_relationship_coverage,
            mean_llm_calls_per_chunk,
            throughput_chunks_per_second,
            error_rate,
        })
    }
}

/// Hand the reporter a deduplicated corpus view, useful when callers build
/// the corpus from overlapping documents.
pub fn dedupe_corpus(chunks: Vec<Chunk>) -> Vec<Chunk> {
    let mut seen: HashSet<String> = HashSet::new();
    chunks
        .into_iter()
        .filter(|c| seen.insert(c.id.clone()))
        .collect()
}
