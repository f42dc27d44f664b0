//! Lexigraph Storage Layer
//!
//! Persists the typed, weighted knowledge graph produced by chunk-level
//! extraction:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         GRAPH STORE                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  ┌────────────┐     ┌───────────────┐     ┌──────────────────┐     │
//! │  │ Extraction │────►│  GraphStore   │────►│  GraphDatabase   │     │
//! │  │ (per chunk)│     │               │     │  (relational +   │     │
//! │  └────────────┘     │  resolution   │     │   vector index)  │     │
//! │                     │  weighting    │     └──────────────────┘     │
//! │                     │  guardrails   │              ▲               │
//! │                     └───────┬───────┘              │               │
//! │                             │                ┌─────┴─────┐         │
//! │                             └───────────────►│ EntityCache│        │
//! │                                              │   (LRU)    │        │
//! │                                              └───────────┘         │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Properties
//!
//! - **Idempotent**: entity creation keys on a deterministic canonical id;
//!   relationship insertion keys on (source, target, type)
//! - **Race-safe**: concurrent workers creating the same entity serialize on
//!   a striped lock; a lost unique-constraint race re-reads the winner
//! - **Bounded**: per-entity out-degree is capped so a misbehaving model
//!   cannot explode graph density

pub mod cache;
pub mod config;
pub mod database;
pub mod graph;
pub mod migration;
pub mod normalize;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub use cache::EntityCache;
pub use config::{ConfigError, PipelineConfig};
pub use database::{Embedder, GraphDatabase, MemoryGraph, NewEntity, NewRelationship};
pub use graph::{ChunkGraphSummary, GraphMetrics, GraphStore};
pub use migration::{Migration, SchemaChange};
pub use normalize::Normalizer;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for an entity row
pub type EntityId = Uuid;

/// Unique identifier for a relationship row
pub type RelationshipId = Uuid;

// ============================================================================
// Relationship taxonomy
// ============================================================================

/// The fixed relationship type taxonomy.
///
/// Every type carries a base weight; the stored edge weight is
/// `clamp(confidence, 0, 1) × base × 10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipType {
    Hypernym,
    Hyponym,
    Meronym,
    Holonym,
    Synonym,
    Antonym,
    Causal,
    Temporal,
    Dependency,
    Reference,
    Generic,
}

impl RelationshipType {
    pub const ALL: [RelationshipType; 11] = [
        RelationshipType::Hypernym,
        RelationshipType::Hyponym,
        RelationshipType::Meronym,
        RelationshipType::Holonym,
        RelationshipType::Synonym,
        RelationshipType::Antonym,
        RelationshipType::Causal,
        RelationshipType::Temporal,
        RelationshipType::Dependency,
        RelationshipType::Reference,
        RelationshipType::Generic,
    ];

    /// Base weight used for edge weighting.
    pub fn base_weight(self) -> f32 {
        match self {
            RelationshipType::Hypernym => 1.0,
            RelationshipType::Hyponym => 1.0,
            RelationshipType::Meronym => 0.9,
            RelationshipType::Holonym => 0.9,
            RelationshipType::Synonym => 0.95,
            RelationshipType::Antonym => 0.9,
            RelationshipType::Causal => 0.8,
            RelationshipType::Temporal => 0.7,
            RelationshipType::Dependency => 0.85,
            RelationshipType::Reference => 0.6,
            RelationshipType::Generic => 0.5,
        }
    }

    /// Whether the type implies an identical inverse edge.
    pub fn is_symmetric(self) -> bool {
        matches!(self, RelationshipType::Synonym | RelationshipType::Antonym)
    }

    /// The semantic inverse, where one exists.
    pub fn inverse(self) -> Option<RelationshipType> {
        match self {
            RelationshipType::Hypernym => Some(RelationshipType::Hyponym),
            RelationshipType::Hyponym => Some(RelationshipType::Hypernym),
            RelationshipType::Meronym => Some(RelationshipType::Holonym),
            RelationshipType::Holonym => Some(RelationshipType::Meronym),
            RelationshipType::Synonym => Some(RelationshipType::Synonym),
            RelationshipType::Antonym => Some(RelationshipType::Antonym),
            _ => None,
        }
    }

    /// Parse a label as emitted by the model. Unknown labels map to `None`;
    /// validation downgrades those to [`RelationshipType::Generic`].
    pub fn from_label(label: &str) -> Option<RelationshipType> {
        match label.trim().to_lowercase().as_str() {
            "hypernym" => Some(RelationshipType::Hypernym),
            "hyponym" => Some(RelationshipType::Hyponym),
            "meronym" => Some(RelationshipType::Meronym),
            "holonym" => Some(RelationshipType::Holonym),
            "synonym" => Some(RelationshipType::Synonym),
            "antonym" => Some(RelationshipType::Antonym),
            "causal" => Some(RelationshipType::Causal),
            "temporal" => Some(RelationshipType::Temporal),
            "dependency" => Some(RelationshipType::Dependency),
            "reference" => Some(RelationshipType::Reference),
            "generic" => Some(RelationshipType::Generic),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RelationshipType::Hypernym => "hypernym",
            RelationshipType::Hyponym => "hyponym",
            RelationshipType::Meronym => "meronym",
            RelationshipType::Holonym => "holonym",
            RelationshipType::Synonym => "synonym",
            RelationshipType::Antonym => "antonym",
            RelationshipType::Causal => "causal",
            RelationshipType::Temporal => "temporal",
            RelationshipType::Dependency => "dependency",
            RelationshipType::Reference => "reference",
            RelationshipType::Generic => "generic",
        }
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Stored edge weight: `clamp(confidence, 0, 1) × base_weight × 10`.
pub fn edge_weight(relationship_type: RelationshipType, confidence: f32) -> f32 {
    confidence.clamp(0.0, 1.0) * relationship_type.base_weight() * 10.0
}

// ============================================================================
// Provenance
// ============================================================================

/// Where a piece of graph state came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub document_id: String,
    pub chunk_id: String,
}

// ============================================================================
// Entity rows
// ============================================================================

/// Mutable-by-merge portion of an entity row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    /// Alternative surface forms observed for this entity, in first-seen
    /// order, deduped by exact surface string.
    pub aliases: Vec<String>,
    /// Auxiliary attributes extracted alongside the entity (e.g.
    /// `entity_type = "drug"`). Merged by union; existing values win.
    pub covariates: BTreeMap<String, serde_json::Value>,
    /// Chunks that contributed to this entity.
    pub provenance: Vec<Provenance>,
}

/// A persisted entity. `display_name` is the surface form first seen and is
/// frozen after creation; only `metadata` mutates, via alias-append and
/// covariate-merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub knowledge_base: String,
    pub display_name: String,
    pub normalized_name: String,
    pub canonical_id: String,
    pub description: String,
    pub embedding: Vec<f32>,
    pub metadata: EntityMetadata,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Relationship rows
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationshipMetadata {
    pub provenance: Option<Provenance>,
    /// Raw model output the edge was parsed from, kept for audit.
    pub raw: Option<serde_json::Value>,
}

/// A persisted directed edge. At most one row exists per
/// (source, target, type) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub id: RelationshipId,
    pub source_id: EntityId,
    pub target_id: EntityId,
    pub relationship_type: RelationshipType,
    /// In [0, 1].
    pub confidence: f32,
    /// In [0, 10]: `clamp(confidence) × base_weight × 10`.
    pub weight: f32,
    pub description: String,
    pub metadata: RelationshipMetadata,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Extraction (transient input to the store)
// ============================================================================

/// An entity candidate produced by chunk extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityCandidate {
    pub name: String,
    pub description: String,
    pub covariates: BTreeMap<String, serde_json::Value>,
}

/// A relationship candidate produced by chunk extraction. Endpoints are
/// surface names, resolved to entity ids at persistence time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipCandidate {
    pub source_name: String,
    pub target_name: String,
    pub relationship_type: RelationshipType,
    pub confidence: f32,
    pub description: String,
}

/// Everything extracted from one chunk. Discarded after persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Extraction {
    pub entities: Vec<EntityCandidate>,
    pub relationships: Vec<RelationshipCandidate>,
}

// ============================================================================
// Errors
// ============================================================================

/// Storage-layer error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A unique constraint rejected an insert. For entity inserts this is
    /// the signal that another worker won the resolution race.
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("entity {0} not found")]
    EntityNotFound(EntityId),

    /// The source (or, for a synthesized inverse, the target) entity is at
    /// its outgoing-edge cap. Logged and non-fatal.
    #[error("degree cap reached for entity {entity}: {cap} outgoing edges")]
    DegreeCapped { entity: EntityId, cap: usize },

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn base_weights_match_taxonomy_table() {
        assert_relative_eq!(RelationshipType::Hypernym.base_weight(), 1.0);
        assert_relative_eq!(RelationshipType::Hyponym.base_weight(), 1.0);
        assert_relative_eq!(RelationshipType::Meronym.base_weight(), 0.9);
        assert_relative_eq!(RelationshipType::Holonym.base_weight(), 0.9);
        assert_relative_eq!(RelationshipType::Synonym.base_weight(), 0.95);
        assert_relative_eq!(RelationshipType::Antonym.base_weight(), 0.9);
        assert_relative_eq!(RelationshipType::Causal.base_weight(), 0.8);
        assert_relative_eq!(RelationshipType::Temporal.base_weight(), 0.7);
        assert_relative_eq!(RelationshipType::Dependency.base_weight(), 0.85);
        assert_relative_eq!(RelationshipType::Reference.base_weight(), 0.6);
        assert_relative_eq!(RelationshipType::Generic.base_weight(), 0.5);
    }

    #[test]
    fn only_synonym_and_antonym_are_symmetric() {
        for ty in RelationshipType::ALL {
            let expect = matches!(ty, RelationshipType::Synonym | RelationshipType::Antonym);
            assert_eq!(ty.is_symmetric(), expect, "{ty}");
        }
    }

    #[test]
    fn symmetric_types_are_self_inverse() {
        assert_eq!(
            RelationshipType::Synonym.inverse(),
            Some(RelationshipType::Synonym)
        );
        assert_eq!(
            RelationshipType::Antonym.inverse(),
            Some(RelationshipType::Antonym)
        );
        assert_eq!(
            RelationshipType::Hypernym.inverse(),
            Some(RelationshipType::Hyponym)
        );
        assert_eq!(RelationshipType::Causal.inverse(), None);
    }

    #[test]
    fn labels_round_trip() {
        for ty in RelationshipType::ALL {
            assert_eq!(RelationshipType::from_label(ty.label()), Some(ty));
        }
        assert_eq!(RelationshipType::from_label("  Synonym "), Some(RelationshipType::Synonym));
        assert_eq!(RelationshipType::from_label("part_of"), None);
    }

    #[test]
    fn serde_uses_lowercase_labels() {
        let json = serde_json::to_string(&RelationshipType::Hypernym).unwrap();
        assert_eq!(json, "\"hypernym\"");
        let back: RelationshipType = serde_json::from_str("\"antonym\"").unwrap();
        assert_eq!(back, RelationshipType::Antonym);
    }
}
