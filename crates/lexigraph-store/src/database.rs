//! Database and embedding seams.
//!
//! The pipeline treats the database as an external transactional store with
//! vector similarity search, and the embedding model as a function
//! text → vector. Both are defined here by their contracts; deployments
//! substitute their own clients. [`MemoryGraph`] is the in-process reference
//! backend used by tests and the benchmark corpus run.

use crate::migration::Migration;
use crate::{
    EntityId, EntityMetadata, EntityRecord, Provenance, RelationshipId, RelationshipMetadata,
    RelationshipRecord, RelationshipType, StorageError,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

// ============================================================================
// Embedding oracle
// ============================================================================

/// Embedding model contract: text in, fixed-dimension vector out. The
/// dimension is a deployment constant; nothing here hard-codes it.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError>;

    fn dimension(&self) -> usize;
}

// ============================================================================
// Insert payloads
// ============================================================================

/// A fully prepared entity row, ready for insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEntity {
    pub knowledge_base: String,
    pub display_name: String,
    pub normalized_name: String,
    pub canonical_id: String,
    pub description: String,
    pub embedding: Vec<f32>,
    pub metadata: EntityMetadata,
}

/// A fully weighted relationship row, ready for insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRelationship {
    pub source_id: EntityId,
    pub target_id: EntityId,
    pub relationship_type: RelationshipType,
    pub confidence: f32,
    pub weight: f32,
    pub description: String,
    pub metadata: RelationshipMetadata,
}

// ============================================================================
// Database contract
// ============================================================================

/// Operations the store requires of its database.
///
/// Atomicity requirements: entity insertion is guarded by a unique
/// constraint on (knowledge_base, canonical_id); a violated constraint
/// surfaces as [`StorageError::UniqueViolation`] and signals a lost
/// resolution race. Relationship insertion is idempotent on
/// (source, target, type): `Ok(None)` means the triple already exists.
#[async_trait]
pub trait GraphDatabase: Send + Sync {
    async fn insert_entity(&self, row: NewEntity) -> Result<EntityId, StorageError>;

    async fn entity_by_canonical_id(
        &self,
        knowledge_base: &str,
        canonical_id: &str,
    ) -> Result<Option<EntityRecord>, StorageError>;

    async fn entity_by_id(&self, id: EntityId) -> Result<Option<EntityRecord>, StorageError>;

    /// Merge new aliases / covariates / provenance into an entity's
    /// metadata atomically and return the merged result. Aliases dedupe on
    /// exact surface form; covariate conflicts preserve the existing value.
    async fn merge_entity_metadata(
        &self,
        id: EntityId,
        aliases: Vec<String>,
        covariates: BTreeMap<String, serde_json::Value>,
        provenance: Option<Provenance>,
    ) -> Result<EntityMetadata, StorageError>;

    /// Cosine top-k within one knowledge base, most similar first.
    async fn nearest_entities(
        &self,
        knowledge_base: &str,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<(EntityRecord, f32)>, StorageError>;

    async fn insert_relationship(
        &self,
        row: NewRelationship,
    ) -> Result<Option<RelationshipId>, StorageError>;

    /// Outgoing edge count for the degree guardrail.
    async fn count_outgoing(&self, entity: EntityId) -> Result<usize, StorageError>;

    async fn apply_migration(&self, migration: &Migration) -> Result<(), StorageError>;

    // ------------------------------------------------------------------
    // Introspection (benchmark + tests)
    // ------------------------------------------------------------------

    async fn entity_count(&self, knowledge_base: &str) -> Result<usize, StorageError>;

    async fn relationship_count(&self) -> Result<usize, StorageError>;

    async fn all_entities(&self, knowledge_base: &str) -> Result<Vec<EntityRecord>, StorageError>;

    async fn all_relationships(&self) -> Result<Vec<RelationshipRecord>, StorageError>;
}

/// Cosine similarity; 0.0 when either vector is zero or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ============================================================================
// In-memory reference backend
// ============================================================================

#[derive(Default)]
struct MemoryGraphInner {
    entities: HashMap<EntityId, EntityRecord>,
    /// (knowledge_base, canonical_id) → entity. The unique constraint.
    by_canonical: HashMap<(String, String), EntityId>,
    relationships: Vec<RelationshipRecord>,
    /// The (source, target, type) unique constraint.
    triples: HashSet<(EntityId, EntityId, RelationshipType)>,
    outgoing: HashMap<EntityId, usize>,
    applied_migrations: HashSet<String>,
}

/// Brute-force in-memory backend. All operations take a single write or
/// read lock, which gives them the per-operation atomicity the contract
/// asks of a real database.
#[derive(Default)]
pub struct MemoryGraph {
    inner: RwLock<MemoryGraphInner>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied_migrations(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut ids: Vec<String> = inner.applied_migrations.iter().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl GraphDatabase for MemoryGraph {
    async fn insert_entity(&self, row: NewEntity) -> Result<EntityId, StorageError> {
        let mut inner = self.inner.write();
        let key = (row.knowledge_base.clone(), row.canonical_id.clone());
        if inner.by_canonical.contains_key(&key) {
            return Err(StorageError::UniqueViolation {
                constraint: format!("entity.canonical_id={}", row.canonical_id),
            });
        }

        let id = Uuid::new_v4();
        let record = EntityRecord {
            id,
            knowledge_base: row.knowledge_base,
            display_name: row.display_name,
            normalized_name: row.normalized_name,
            canonical_id: row.canonical_id,
            description: row.description,
            embedding: row.embedding,
            metadata: row.metadata,
            created_at: Utc::now(),
        };
        inner.by_canonical.insert(key, id);
        inner.entities.insert(id, record);
        Ok(id)
    }

    async fn entity_by_canonical_id(
        &self,
        knowledge_base: &str,
        canonical_id: &str,
    ) -> Result<Option<EntityRecord>, StorageError> {
        let inner = self.inner.read();
        let key = (knowledge_base.to_string(), canonical_id.to_string());
        Ok(inner
            .by_canonical
            .get(&key)
            .and_then(|id| inner.entities.get(id))
            .cloned())
    }

    async fn entity_by_id(&self, id: EntityId) -> Result<Option<EntityRecord>, StorageError> {
        Ok(self.inner.read().entities.get(&id).cloned())
    }

    async fn merge_entity_metadata(
        &self,
        id: EntityId,
        aliases: Vec<String>,
        covariates: BTreeMap<String, serde_json::Value>,
        provenance: Option<Provenance>,
    ) -> Result<EntityMetadata, StorageError> {
        let mut inner = self.inner.write();
        let record = inner
            .entities
            .get_mut(&id)
            .ok_or(StorageError::EntityNotFound(id))?;

        for alias in aliases {
            if !record.metadata.aliases.iter().any(|a| a == &alias) {
                record.metadata.aliases.push(alias);
            }
        }
        for (key, value) in covariates {
            record.metadata.covariates.entry(key).or_insert(value);
        }
        if let Some(p) = provenance {
            if !record.metadata.provenance.contains(&p) {
                record.metadata.provenance.push(p);
            }
        }
        Ok(record.metadata.clone())
    }

    async fn nearest_entities(
        &self,
        knowledge_base: &str,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<(EntityRecord, f32)>, StorageError> {
        let inner = self.inner.read();
        let mut scored: Vec<(EntityRecord, f32)> = inner
            .entities
            .values()
            .filter(|e| e.knowledge_base == knowledge_base)
            .map(|e| (e.clone(), cosine_similarity(embedding, &e.embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn insert_relationship(
        &self,
        row: NewRelationship,
    ) -> Result<Option<RelationshipId>, StorageError> {
        let mut inner = self.inner.write();
        let triple = (row.source_id, row.target_id, row.relationship_type);
        if !inner.entities.contains_key(&row.source_id) {
            return Err(StorageError::EntityNotFound(row.source_id));
        }
        if !inner.entities.contains_key(&row.target_id) {
            return Err(StorageError::EntityNotFound(row.target_id));
        }
        if inner.triples.contains(&triple) {
            return Ok(None);
        }

        let id = Uuid::new_v4();
        inner.triples.insert(triple);
        *inner.outgoing.entry(row.source_id).or_insert(0) += 1;
        inner.relationships.push(RelationshipRecord {
            id,
            source_id: row.source_id,
            target_id: row.target_id,
            relationship_type: row.relationship_type,
            confidence: row.confidence,
            weight: row.weight,
            description: row.description,
            metadata: row.metadata,
            created_at: Utc::now(),
        });
        Ok(Some(id))
    }

    async fn count_outgoing(&self, entity: EntityId) -> Result<usize, StorageError> {
        Ok(self.inner.read().outgoing.get(&entity).copied().unwrap_or(0))
    }

    async fn apply_migration(&self, migration: &Migration) -> Result<(), StorageError> {
        // The reference backend natively stores the enhanced schema, so
        // applying a migration only records it (idempotently).
        let mut inner = self.inner.write();
        inner.applied_migrations.insert(migration.id.clone());
        Ok(())
    }

    async fn entity_count(&self, knowledge_base: &str) -> Result<usize, StorageError> {
        Ok(self
            .inner
            .read()
            .entities
            .values()
            .filter(|e| e.knowledge_base == knowledge_base)
            .count())
    }

    async fn relationship_count(&self) -> Result<usize, StorageError> {
        Ok(self.inner.read().relationships.len())
    }

    async fn all_entities(&self, knowledge_base: &str) -> Result<Vec<EntityRecord>, StorageError> {
        Ok(self
            .inner
            .read()
            .entities
            .values()
            .filter(|e| e.knowledge_base == knowledge_base)
            .cloned()
            .collect())
    }

    async fn all_relationships(&self) -> Result<Vec<RelationshipRecord>, StorageError> {
        Ok(self.inner.read().relationships.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn entity(kb: &str, name: &str, cid: &str, embedding: Vec<f32>) -> NewEntity {
        NewEntity {
            knowledge_base: kb.to_string(),
            display_name: name.to_string(),
            normalized_name: name.to_lowercase(),
            canonical_id: cid.to_string(),
            description: String::new(),
            embedding,
            metadata: EntityMetadata::default(),
        }
    }

    fn edge(source: EntityId, target: EntityId, ty: RelationshipType) -> NewRelationship {
        NewRelationship {
            source_id: source,
            target_id: target,
            relationship_type: ty,
            confidence: 0.9,
            weight: 9.0,
            description: String::new(),
            metadata: RelationshipMetadata::default(),
        }
    }

    #[tokio::test]
    async fn canonical_id_is_unique_per_knowledge_base() {
        let db = MemoryGraph::new();
        db.insert_entity(entity("kb", "A", "cid1", vec![1.0])).await.unwrap();

        let err = db
            .insert_entity(entity("kb", "B", "cid1", vec![1.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UniqueViolation { .. }));

        // Same canonical id in another knowledge base is fine.
        db.insert_entity(entity("other", "A", "cid1", vec![1.0])).await.unwrap();
    }

    #[tokio::test]
    async fn relationship_insert_is_idempotent_on_triple() {
        let db = MemoryGraph::new();
        let a = db.insert_entity(entity("kb", "A", "a", vec![1.0])).await.unwrap();
        let b = db.insert_entity(entity("kb", "B", "b", vec![0.5])).await.unwrap();

        assert!(db
            .insert_relationship(edge(a, b, RelationshipType::Causal))
            .await
            .unwrap()
            .is_some());
        assert!(db
            .insert_relationship(edge(a, b, RelationshipType::Causal))
            .await
            .unwrap()
            .is_none());
        // A different type is a different edge.
        assert!(db
            .insert_relationship(edge(a, b, RelationshipType::Temporal))
            .await
            .unwrap()
            .is_some());

        assert_eq!(db.count_outgoing(a).await.unwrap(), 2);
        assert_eq!(db.count_outgoing(b).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn relationship_requires_existing_endpoints() {
        let db = MemoryGraph::new();
        let a = db.insert_entity(entity("kb", "A", "a", vec![1.0])).await.unwrap();
        let err = db
            .insert_relationship(edge(a, Uuid::new_v4(), RelationshipType::Generic))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::EntityNotFound(_)));
    }

    #[tokio::test]
    async fn nearest_entities_orders_by_cosine_within_namespace() {
        let db = MemoryGraph::new();
        let close = db
            .insert_entity(entity("kb", "close", "c1", vec![1.0, 0.1, 0.0]))
            .await
            .unwrap();
        db.insert_entity(entity("kb", "far", "c2", vec![0.0, 0.0, 1.0]))
            .await
            .unwrap();
        db.insert_entity(entity("other", "decoy", "c3", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();

        let hits = db.nearest_entities("kb", &[1.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.id, close);
        assert!(hits[0].1 > hits[1].1);
    }

    #[tokio::test]
    async fn metadata_merge_dedupes_and_preserves_existing() {
        let db = MemoryGraph::new();
        let id = db.insert_entity(entity("kb", "MAP", "cid", vec![1.0])).await.unwrap();

        let mut covariates = BTreeMap::new();
        covariates.insert("entity_type".to_string(), serde_json::json!("measurement"));
        let merged = db
            .merge_entity_metadata(id, vec!["m.a.p.".to_string()], covariates, None)
            .await
            .unwrap();
        assert_eq!(merged.aliases, vec!["m.a.p.".to_string()]);

        // Second merge: duplicate alias dropped, conflicting covariate keeps
        // the existing value.
        let mut update = BTreeMap::new();
        update.insert("entity_type".to_string(), serde_json::json!("other"));
        update.insert("domain".to_string(), serde_json::json!("hemodynamics"));
        let merged = db
            .merge_entity_metadata(id, vec!["m.a.p.".to_string()], update, None)
            .await
            .unwrap();
        assert_eq!(merged.aliases.len(), 1);
        assert_eq!(merged.covariates["entity_type"], serde_json::json!("measurement"));
        assert_eq!(merged.covariates["domain"], serde_json::json!("hemodynamics"));
    }

    #[test]
    fn cosine_similarity_handles_degenerate_inputs() {
        assert_relative_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_relative_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
