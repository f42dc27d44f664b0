//! Chunk extraction: one structured model call per chunk.
//!
//! Enhanced mode issues a single unified call returning entities,
//! covariates, and typed relationships; legacy mode issues two calls
//! (entities + untyped relationships, then covariates). Unifying the calls
//! is the one optimization that halves model cost per chunk.
//!
//! Whatever the mode, the raw output is normalized and validated before it
//! reaches the store: confidence clamped to [0, 1] and floored at the
//! configured minimum, endpoints checked against the extracted entity set,
//! unknown relationship types collapsed to `generic`.

use crate::llm::{CompletionRequest, LanguageModel, LlmError, Message};
use crate::Chunk;
use lexigraph_store::{
    EntityCandidate, Extraction, PipelineConfig, RelationshipCandidate, RelationshipType,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempts per model call before the chunk is abandoned.
const RETRY_BUDGET: u32 = 3;
/// Confidence assigned to untyped legacy relationships.
const LEGACY_CONFIDENCE: f32 = 0.8;

/// Extraction failed for one chunk. Never fatal to the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("model output unparseable after {attempts} attempts: {last_error}")]
    Malformed { attempts: u32, last_error: String },
    #[error("model unreachable after {attempts} attempts: {source}")]
    Oracle {
        attempts: u32,
        #[source]
        source: LlmError,
    },
}

/// Counters for the benchmark reporter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractorStats {
    pub llm_calls: u64,
    pub low_confidence_drops: u64,
    pub unknown_endpoint_drops: u64,
    pub unknown_type_downgrades: u64,
}

// ============================================================================
// Wire format
// ============================================================================

/// Raw model output. Permissive by design: every field is defaulted and
/// common key spellings are accepted; validation is what produces the typed
/// [`Extraction`].
#[derive(Debug, Clone, Default, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    relationships: Vec<RawRelationship>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawEntity {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    covariates: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRelationship {
    #[serde(alias = "source")]
    source_name: String,
    #[serde(alias = "target")]
    target_name: String,
    #[serde(default, alias = "type")]
    relationship_type: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawCovariates {
    #[serde(default)]
    entities: Vec<RawEntity>,
}

// ============================================================================
// Extractor
// ============================================================================

pub struct ChunkExtractor {
    model: Arc<dyn LanguageModel>,
    config: PipelineConfig,
    llm_calls: AtomicU64,
    low_confidence_drops: AtomicU64,
    unknown_endpoint_drops: AtomicU64,
    unknown_type_downgrades: AtomicU64,
}

impl ChunkExtractor {
    pub fn new(model: Arc<dyn LanguageModel>, config: PipelineConfig) -> Self {
        Self {
            model,
            config,
            llm_calls: AtomicU64::new(0),
            low_confidence_drops: AtomicU64::new(0),
            unknown_endpoint_drops: AtomicU64::new(0),
            unknown_type_downgrades: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> ExtractorStats {
        ExtractorStats {
            llm_calls: self.llm_calls.load(Ordering::Relaxed),
            low_confidence_drops: self.low_confidence_drops.load(Ordering::Relaxed),
            unknown_endpoint_drops: self.unknown_endpoint_drops.load(Ordering::Relaxed),
            unknown_type_downgrades: self.unknown_type_downgrades.load(Ordering::Relaxed),
        }
    }

    /// Extract entities, covariates, and relationships from one chunk.
    pub async fn extract(&self, chunk: &Chunk) -> Result<Extraction, ExtractionError> {
        let raw = if self.config.typed_relationships() {
            self.extract_unified(chunk).await?
        } else {
            self.extract_legacy(chunk).await?
        };
        Ok(self.validate(raw))
    }

    /// Enhanced: one call returning everything.
    async fn extract_unified(&self, chunk: &Chunk) -> Result<RawExtraction, ExtractionError> {
        let request = CompletionRequest {
            messages: vec![
                Message::system(UNIFIED_SYSTEM_PROMPT),
                Message::user(format!("Extract the knowledge graph from:\n\n{}", chunk.text)),
            ],
            max_tokens: Some(4096),
            temperature: Some(0.1),
            json_schema: Some(extraction_schema()),
        };
        self.call_with_retry(request).await
    }

    /// Legacy: entities + untyped relationships, then covariates.
    async fn extract_legacy(&self, chunk: &Chunk) -> Result<RawExtraction, ExtractionError> {
        let request = CompletionRequest {
            messages: vec![
                Message::system(LEGACY_GRAPH_PROMPT),
                Message::user(format!("Extract entities and relationships from:\n\n{}", chunk.text)),
            ],
            max_tokens: Some(4096),
            temperature: Some(0.1),
            json_schema: Some(extraction_schema()),
        };
        let mut raw: RawExtraction = self.call_with_retry(request).await?;

        if raw.entities.is_empty() {
            return Ok(raw);
        }

        let names: Vec<&str> = raw.entities.iter().map(|e| e.name.as_str()).collect();
        let request = CompletionRequest {
            messages: vec![
                Message::system(LEGACY_COVARIATE_PROMPT),
                Message::user(format!(
                    "Entities: {}\n\nText:\n\n{}",
                    names.join(", "),
                    chunk.text
                )),
            ],
            max_tokens: Some(2048),
            temperature: Some(0.1),
            json_schema: None,
        };
        let covariates: RawCovariates = self.call_with_retry(request).await?;

        for enriched in covariates.entities {
            if let Some(entity) = raw.entities.iter_mut().find(|e| e.name == enriched.name) {
                for (key, value) in enriched.covariates {
                    entity.covariates.entry(key).or_insert(value);
                }
            }
        }
        Ok(raw)
    }

    /// One model call with the retry budget applied to transport errors and
    /// malformed output alike.
    async fn call_with_retry<T: serde::de::DeserializeOwned>(
        &self,
        request: CompletionRequest,
    ) -> Result<T, ExtractionError> {
        let mut last_parse_error: Option<String> = None;

        for attempt in 1..=RETRY_BUDGET {
            self.llm_calls.fetch_add(1, Ordering::Relaxed);
            match self.model.complete(request.clone()).await {
                Ok(response) => match serde_json::from_str::<T>(strip_fences(&response.content)) {
                    Ok(parsed) => return Ok(parsed),
                    Err(e) => {
                        debug!(attempt, error = %e, "model output failed to parse");
                        last_parse_error = Some(e.to_string());
                    }
                },
                Err(LlmError::RateLimited { retry_after_ms }) if attempt < RETRY_BUDGET => {
                    tokio::time::sleep(Duration::from_millis(retry_after_ms)).await;
                }
                Err(e) if e.is_retryable() && attempt < RETRY_BUDGET => {
                    debug!(attempt, error = %e, "retryable oracle error");
                }
                Err(e) => {
                    return Err(ExtractionError::Oracle {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }

        Err(ExtractionError::Malformed {
            attempts: RETRY_BUDGET,
            last_error: last_parse_error.unwrap_or_else(|| "no response".to_string()),
        })
    }

    /// Normalize the raw output into a typed extraction, applying the
    /// mandatory validation rules.
    fn validate(&self, raw: RawExtraction) -> Extraction {
        let typed = self.config.typed_relationships();

        let mut entities: Vec<EntityCandidate> = Vec::with_capacity(raw.entities.len());
        let mut seen: HashSet<String> = HashSet::new();
        for entity in raw.entities {
            let name = entity.name.trim().to_string();
            if name.is_empty() || !seen.insert(name.clone()) {
                continue;
            }
            entities.push(EntityCandidate {
                name,
                description: entity.description.trim().to_string(),
                covariates: entity.covariates,
            });
        }
        let names: HashSet<&str> = entities.iter().map(|e| e.name.as_str()).collect();

        let mut relationships: Vec<RelationshipCandidate> = Vec::new();
        for rel in raw.relationships {
            let source_name = rel.source_name.trim().to_string();
            let target_name = rel.target_name.trim().to_string();
            if !names.contains(source_name.as_str()) || !names.contains(target_name.as_str()) {
                self.unknown_endpoint_drops.fetch_add(1, Ordering::Relaxed);
                warn!(source = %source_name, target = %target_name, "relationship references unknown entity");
                continue;
            }

            let confidence = rel
                .confidence
                .unwrap_or(LEGACY_CONFIDENCE)
                .clamp(0.0, 1.0);
            // The floor keeps exact-threshold confidences.
            if confidence < self.config.min_relationship_confidence {
                self.low_confidence_drops.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let relationship_type = if typed {
                match rel.relationship_type.as_deref().and_then(RelationshipType::from_label) {
                    Some(ty) => ty,
                    None => {
                        self.unknown_type_downgrades.fetch_add(1, Ordering::Relaxed);
                        RelationshipType::Generic
                    }
                }
            } else {
                RelationshipType::Generic
            };

            relationships.push(RelationshipCandidate {
                source_name,
                target_name,
                relationship_type,
                confidence,
                description: rel.description.trim().to_string(),
            });
        }

        Extraction {
            entities,
            relationships,
        }
    }
}

/// Models occasionally wrap JSON in markdown fences despite JSON mode.
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

// ============================================================================
// Prompts and schema
// ============================================================================

const UNIFIED_SYSTEM_PROMPT: &str = r#"You extract a knowledge graph from text.

Return JSON with two arrays:
- "entities": {"name", "description", "covariates"} where covariates holds
  auxiliary attributes such as {"entity_type": "drug"}.
- "relationships": {"source_name", "target_name", "relationship_type",
  "confidence", "description"}.

relationship_type must be one of: hypernym, hyponym, meronym, holonym,
synonym, antonym, causal, temporal, dependency, reference, generic.
confidence is a number between 0 and 1. Only relate entities that appear in
the entities array. Be conservative: extract what is stated, not implied."#;

const LEGACY_GRAPH_PROMPT: &str = r#"You extract entities and relationships from text.

Return JSON with two arrays:
- "entities": {"name", "description"}.
- "relationships": {"source_name", "target_name", "description"}.

Only relate entities that appear in the entities array."#;

const LEGACY_COVARIATE_PROMPT: &str = r#"For each listed entity, extract auxiliary attributes from the text.

Return JSON: {"entities": [{"name", "covariates"}]} where covariates is an
object such as {"entity_type": "procedure"}. Include only entities from the
list."#;

/// JSON schema handed to providers that support constrained output.
fn extraction_schema() -> serde_json::Value {
    let type_labels: Vec<&str> = RelationshipType::ALL.iter().map(|t| t.label()).collect();
    serde_json::json!({
        "type": "object",
        "properties": {
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "description": {"type": "string"},
                        "covariates": {"type": "object"}
                    },
                    "required": ["name"]
                }
            },
            "relationships": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "source_name": {"type": "string"},
                        "target_name": {"type": "string"},
                        "relationship_type": {"type": "string", "enum": type_labels},
                        "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                        "description": {"type": "string"}
                    },
                    "required": ["source_name", "target_name"]
                }
            }
        },
        "required": ["entities", "relationships"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, Usage};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Replays a fixed sequence of responses.
    struct ScriptedModel {
        responses: Mutex<Vec<Result<String, LlmError>>>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                return Err(LlmError::Api("script exhausted".to_string()));
            }
            responses.remove(0).map(|content| CompletionResponse {
                content,
                usage: Usage::default(),
                model: "scripted".to_string(),
            })
        }

        fn model_name(&self) -> String {
            "scripted".to_string()
        }
    }

    fn unified_payload() -> String {
        serde_json::json!({
            "entities": [
                {"name": "sepsis", "description": "systemic response", "covariates": {"entity_type": "condition"}},
                {"name": "septic shock", "description": "severe sepsis"},
                {"name": "", "description": "dropped"}
            ],
            "relationships": [
                {"source_name": "sepsis", "target_name": "septic shock", "relationship_type": "hypernym", "confidence": 0.9, "description": "broader"},
                {"source_name": "sepsis", "target_name": "septic shock", "relationship_type": "blorp", "confidence": 0.8, "description": "unknown type"},
                {"source_name": "sepsis", "target_name": "septic shock", "relationship_type": "causal", "confidence": 0.1, "description": "low"},
                {"source_name": "sepsis", "target_name": "ghost", "relationship_type": "causal", "confidence": 0.9, "description": "missing endpoint"},
                {"source_name": "sepsis", "target_name": "septic shock", "relationship_type": "temporal", "confidence": 1.7, "description": "clamped"}
            ]
        })
        .to_string()
    }

    #[tokio::test]
    async fn unified_extraction_validates_and_normalizes() {
        let model = ScriptedModel::new(vec![Ok(unified_payload())]);
        let extractor = ChunkExtractor::new(model, PipelineConfig::enhanced());

        let extraction = extractor
            .extract(&Chunk::new("c1", "some text"))
            .await
            .unwrap();

        assert_eq!(extraction.entities.len(), 2, "empty name dropped");
        assert_eq!(extraction.relationships.len(), 3);
        assert_eq!(
            extraction.relationships[0].relationship_type,
            RelationshipType::Hypernym
        );
        assert_eq!(
            extraction.relationships[1].relationship_type,
            RelationshipType::Generic,
            "unknown type downgraded"
        );
        assert_eq!(extraction.relationships[2].confidence, 1.0, "clamped");

        let stats = extractor.stats();
        assert_eq!(stats.llm_calls, 1, "single unified call");
        assert_eq!(stats.low_confidence_drops, 1);
        assert_eq!(stats.unknown_endpoint_drops, 1);
        assert_eq!(stats.unknown_type_downgrades, 1);
    }

    #[tokio::test]
    async fn confidence_at_threshold_is_kept() {
        let payload = serde_json::json!({
            "entities": [{"name": "a"}, {"name": "b"}],
            "relationships": [
                {"source_name": "a", "target_name": "b", "relationship_type": "causal", "confidence": 0.3}
            ]
        })
        .to_string();
        let model = ScriptedModel::new(vec![Ok(payload)]);
        let extractor = ChunkExtractor::new(model, PipelineConfig::enhanced());

        let extraction = extractor.extract(&Chunk::new("c", "t")).await.unwrap();
        assert_eq!(extraction.relationships.len(), 1);
    }

    #[tokio::test]
    async fn zero_entities_drops_all_relationships() {
        let payload = serde_json::json!({
            "entities": [],
            "relationships": [
                {"source_name": "a", "target_name": "b", "relationship_type": "causal", "confidence": 0.9}
            ]
        })
        .to_string();
        let model = ScriptedModel::new(vec![Ok(payload)]);
        let extractor = ChunkExtractor::new(model, PipelineConfig::enhanced());

        let extraction = extractor.extract(&Chunk::new("c", "t")).await.unwrap();
        assert!(extraction.entities.is_empty());
        assert!(extraction.relationships.is_empty());
    }

    #[tokio::test]
    async fn malformed_output_retries_then_fails_the_chunk() {
        let model = ScriptedModel::new(vec![
            Ok("not json".to_string()),
            Ok("{broken".to_string()),
            Ok("[]".to_string()),
        ]);
        let extractor = ChunkExtractor::new(model, PipelineConfig::enhanced());

        let err = extractor.extract(&Chunk::new("c", "t")).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Malformed { attempts: 3, .. }));
        assert_eq!(extractor.stats().llm_calls, 3);
    }

    #[tokio::test]
    async fn retry_recovers_from_one_bad_response() {
        let model = ScriptedModel::new(vec![
            Ok("```json garbage".to_string()),
            Ok(unified_payload()),
        ]);
        let extractor = ChunkExtractor::new(model, PipelineConfig::enhanced());

        let extraction = extractor.extract(&Chunk::new("c", "t")).await.unwrap();
        assert_eq!(extraction.entities.len(), 2);
    }

    #[tokio::test]
    async fn legacy_mode_issues_two_calls_and_forces_generic() {
        let graph_payload = serde_json::json!({
            "entities": [{"name": "MAP", "description": "pressure"}, {"name": "BP", "description": "pressure"}],
            "relationships": [
                {"source_name": "MAP", "target_name": "BP", "description": "related"}
            ]
        })
        .to_string();
        let covariate_payload = serde_json::json!({
            "entities": [{"name": "MAP", "covariates": {"entity_type": "measurement"}}]
        })
        .to_string();
        let model = ScriptedModel::new(vec![Ok(graph_payload), Ok(covariate_payload)]);
        let extractor = ChunkExtractor::new(model, PipelineConfig::legacy());

        let extraction = extractor.extract(&Chunk::new("c", "t")).await.unwrap();
        assert_eq!(extractor.stats().llm_calls, 2, "legacy pays two calls");
        assert_eq!(
            extraction.relationships[0].relationship_type,
            RelationshipType::Generic
        );
        assert_eq!(extraction.relationships[0].confidence, LEGACY_CONFIDENCE);
        assert_eq!(
            extraction.entities[0].covariates["entity_type"],
            serde_json::json!("measurement")
        );
    }

    #[test]
    fn fence_stripping_handles_wrapped_json() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```\n[]\n```"), "[]");
        assert_eq!(strip_fences(" {\"a\":1} "), "{\"a\":1}");
    }
}
