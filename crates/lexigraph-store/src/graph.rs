//! The graph store: entity resolution, relationship weighting, symmetric
//! synthesis, and the degree-explosion guardrail.
//!
//! Concurrency model: steps that read-then-insert an entity run under a
//! striped per-canonical-id mutex, so two workers introducing the same
//! entity serialize on the insert. The database's unique constraint is the
//! backstop: a worker that still loses the race re-reads the winner.

use crate::cache::{CachedEntity, EntityCache};
use crate::config::PipelineConfig;
use crate::database::{Embedder, GraphDatabase, NewEntity, NewRelationship};
use crate::migration::Migration;
use crate::normalize::Normalizer;
use crate::{
    EntityId, EntityMetadata, EntityRecord, Extraction, Provenance, RelationshipId,
    RelationshipMetadata, RelationshipType, StorageError,
};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const LOCK_STRIPES: usize = 64;

/// What `add` did with one chunk's extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkGraphSummary {
    pub entities_resolved: usize,
    pub relationships_created: usize,
    /// Suppressed as (source, target, type) duplicates.
    pub relationships_duplicate: usize,
    /// Rejected by the degree cap (primary or synthesized inverse).
    pub relationships_capped: usize,
    /// Dropped because an endpoint name did not resolve.
    pub relationships_skipped: usize,
}

/// Monotonic counters, exposed for the benchmark reporter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphMetrics {
    pub entities_created: u64,
    pub entities_merged: u64,
    pub resolution_races_lost: u64,
    pub relationships_created: u64,
    pub relationships_capped: u64,
}

#[derive(Default)]
struct Counters {
    entities_created: AtomicU64,
    entities_merged: AtomicU64,
    races_lost: AtomicU64,
    relationships_created: AtomicU64,
    relationships_capped: AtomicU64,
}

/// Shared, thread-safe store over one knowledge base.
pub struct GraphStore {
    db: Arc<dyn GraphDatabase>,
    embedder: Arc<dyn Embedder>,
    config: PipelineConfig,
    normalizer: Normalizer,
    cache: EntityCache,
    knowledge_base: String,
    stripes: Vec<tokio::sync::Mutex<()>>,
    counters: Counters,
}

impl GraphStore {
    /// Build a store over `knowledge_base`, applying the additive schema
    /// migration when enhancements are enabled.
    pub async fn open(
        db: Arc<dyn GraphDatabase>,
        embedder: Arc<dyn Embedder>,
        config: PipelineConfig,
        knowledge_base: impl Into<String>,
    ) -> Result<Self, StorageError> {
        if config.enable_enhanced_kg {
            db.apply_migration(&Migration::enhanced_kg()).await?;
        }
        let normalizer = Normalizer::new(config.canonicalization());
        let cache = EntityCache::new(config.cache_capacity());
        let stripes = (0..LOCK_STRIPES).map(|_| tokio::sync::Mutex::new(())).collect();
        Ok(Self {
            db,
            embedder,
            config,
            normalizer,
            cache,
            knowledge_base: knowledge_base.into(),
            stripes,
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn database(&self) -> Arc<dyn GraphDatabase> {
        Arc::clone(&self.db)
    }

    pub fn knowledge_base(&self) -> &str {
        &self.knowledge_base
    }

    pub fn metrics(&self) -> GraphMetrics {
        GraphMetrics {
            entities_created: self.counters.entities_created.load(Ordering::Relaxed),
            entities_merged: self.counters.entities_merged.load(Ordering::Relaxed),
            resolution_races_lost: self.counters.races_lost.load(Ordering::Relaxed),
            relationships_created: self.counters.relationships_created.load(Ordering::Relaxed),
            relationships_capped: self.counters.relationships_capped.load(Ordering::Relaxed),
        }
    }

    fn stripe(&self, canonical_id: &str) -> &tokio::sync::Mutex<()> {
        let mut hasher = DefaultHasher::new();
        canonical_id.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % LOCK_STRIPES]
    }

    // ========================================================================
    // Entity resolution
    // ========================================================================

    /// Resolve a surface form to an entity id, creating the entity if no
    /// duplicate exists. Idempotent by canonical id, with an
    /// embedding-similarity fallback for near-duplicates.
    pub async fn find_or_create_entity(
        &self,
        name: &str,
        description: &str,
        covariates: BTreeMap<String, serde_json::Value>,
        provenance: Option<Provenance>,
    ) -> Result<EntityId, StorageError> {
        let canonical_id = self.normalizer.canonical_id(name, description);

        // Fast path: cache. Duplicate observations may still carry a new
        // surface form or covariates, which must not be lost.
        if let Some(cached) = self.cache.get(&canonical_id) {
            let id = cached.id;
            self.merge_into(&canonical_id, &cached, name, covariates, provenance)
                .await?;
            self.counters.entities_merged.fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }

        // Slow path: serialize per canonical id so concurrent workers
        // cannot double-insert.
        let _guard = self.stripe(&canonical_id).lock().await;

        if let Some(existing) = self
            .db
            .entity_by_canonical_id(&self.knowledge_base, &canonical_id)
            .await?
        {
            let cached = CachedEntity::from(&existing);
            let id = cached.id;
            self.merge_into(&canonical_id, &cached, name, covariates, provenance)
                .await?;
            self.counters.entities_merged.fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }

        let embedding_input = self.normalizer.embedding_input(name, description);
        let embedding = self.embedder.embed(&embedding_input).await?;

        if let Some((nearest, similarity)) = self
            .db
            .nearest_entities(&self.knowledge_base, &embedding, 1)
            .await?
            .into_iter()
            .next()
        {
            // Merge at the threshold, not only above it.
            if similarity >= self.config.distance_threshold() {
                debug!(
                    entity = %nearest.display_name,
                    similarity,
                    threshold = self.config.distance_threshold(),
                    "merging near-duplicate entity"
                );
                let cached = CachedEntity::from(&nearest);
                let id = cached.id;
                self.merge_into(&canonical_id, &cached, name, covariates, provenance)
                    .await?;
                self.counters.entities_merged.fetch_add(1, Ordering::Relaxed);
                return Ok(id);
            }
        }

        let mut metadata = EntityMetadata {
            aliases: Vec::new(),
            covariates,
            provenance: provenance.into_iter().collect(),
        };
        metadata.covariates.retain(|_, v| !v.is_null());

        let row = NewEntity {
            knowledge_base: self.knowledge_base.clone(),
            display_name: name.to_string(),
            normalized_name: self.normalizer.normalize_name(name),
            canonical_id: canonical_id.clone(),
            description: description.to_string(),
            embedding,
            metadata: metadata.clone(),
        };

        match self.db.insert_entity(row).await {
            Ok(id) => {
                self.counters.entities_created.fetch_add(1, Ordering::Relaxed);
                self.cache.put(
                    &canonical_id,
                    CachedEntity {
                        id,
                        display_name: name.to_string(),
                        metadata,
                    },
                );
                Ok(id)
            }
            Err(StorageError::UniqueViolation { .. }) => {
                // Another worker won between our lookup and insert: re-read
                // the winner and merge into it.
                self.counters.races_lost.fetch_add(1, Ordering::Relaxed);
                debug!(%canonical_id, "lost entity insert race, re-reading winner");
                let winner = self
                    .db
                    .entity_by_canonical_id(&self.knowledge_base, &canonical_id)
                    .await?
                    .ok_or_else(|| StorageError::Backend(
                        format!("entity vanished after unique violation: {canonical_id}"),
                    ))?;
                let cached = CachedEntity::from(&winner);
                let id = cached.id;
                self.merge_into(
                    &canonical_id,
                    &cached,
                    name,
                    metadata.covariates.clone(),
                    metadata.provenance.first().cloned(),
                )
                .await?;
                Ok(id)
            }
            Err(e) => Err(e),
        }
    }

    /// Fold a duplicate observation into an existing entity: alias-append
    /// when the surface form differs from the stored display name, covariate
    /// union, provenance append. Refreshes the cache afterwards.
    async fn merge_into(
        &self,
        canonical_id: &str,
        existing: &CachedEntity,
        surface: &str,
        covariates: BTreeMap<String, serde_json::Value>,
        provenance: Option<Provenance>,
    ) -> Result<(), StorageError> {
        let mut aliases = Vec::new();
        if self.config.alias_tracking()
            && surface != existing.display_name
            && !existing.metadata.aliases.iter().any(|a| a == surface)
        {
            aliases.push(surface.to_string());
        }

        let new_covariates: BTreeMap<String, serde_json::Value> = covariates
            .into_iter()
            .filter(|(k, v)| !v.is_null() && !existing.metadata.covariates.contains_key(k))
            .collect();

        let provenance = provenance.filter(|p| !existing.metadata.provenance.contains(p));

        if aliases.is_empty() && new_covariates.is_empty() && provenance.is_none() {
            // Nothing to write; just keep the cache warm.
            self.cache.put(canonical_id, existing.clone());
            return Ok(());
        }

        let merged = self
            .db
            .merge_entity_metadata(existing.id, aliases, new_covariates, provenance)
            .await?;
        self.cache.put(
            canonical_id,
            CachedEntity {
                id: existing.id,
                display_name: existing.display_name.clone(),
                metadata: merged,
            },
        );
        Ok(())
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    /// Insert one weighted edge. Idempotent on (source, target, type);
    /// enforces the degree cap; synthesizes the inverse for symmetric types
    /// when enabled.
    ///
    /// Returns `Ok(None)` when the triple already existed.
    pub async fn create_relationship(
        &self,
        source_id: EntityId,
        target_id: EntityId,
        relationship_type: RelationshipType,
        confidence: f32,
        description: &str,
        provenance: Option<Provenance>,
        raw: Option<serde_json::Value>,
    ) -> Result<Option<RelationshipId>, StorageError> {
        let (relationship_type, confidence, weight) = self.weigh(relationship_type, confidence);

        self.guard_degree(source_id).await?;

        let inserted = self
            .db
            .insert_relationship(NewRelationship {
                source_id,
                target_id,
                relationship_type,
                confidence,
                weight,
                description: description.to_string(),
                metadata: RelationshipMetadata {
                    provenance: provenance.clone(),
                    raw,
                },
            })
            .await?;
        if inserted.is_some() {
            self.counters.relationships_created.fetch_add(1, Ordering::Relaxed);
        }

        if self.config.symmetric_relationships() && relationship_type.is_symmetric() {
            self.synthesize_inverse(
                source_id,
                target_id,
                relationship_type,
                confidence,
                weight,
                description,
                provenance,
            )
            .await?;
        }

        Ok(inserted)
    }

    /// Apply the weighting rules: legacy edges are untyped with weight 0,
    /// enhanced edges carry `clamp(confidence) × base × 10`.
    fn weigh(&self, ty: RelationshipType, confidence: f32) -> (RelationshipType, f32, f32) {
        let confidence = confidence.clamp(0.0, 1.0);
        if self.config.typed_relationships() {
            (ty, confidence, crate::edge_weight(ty, confidence))
        } else {
            (RelationshipType::Generic, confidence, 0.0)
        }
    }

    async fn guard_degree(&self, source: EntityId) -> Result<(), StorageError> {
        let outgoing = self.db.count_outgoing(source).await?;
        if outgoing >= self.config.max_edges_per_entity {
            self.counters.relationships_capped.fetch_add(1, Ordering::Relaxed);
            warn!(
                entity = %source,
                outgoing,
                cap = self.config.max_edges_per_entity,
                "relationship rejected: degree cap"
            );
            return Err(StorageError::DegreeCapped {
                entity: source,
                cap: self.config.max_edges_per_entity,
            });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn synthesize_inverse(
        &self,
        source_id: EntityId,
        target_id: EntityId,
        relationship_type: RelationshipType,
        confidence: f32,
        weight: f32,
        description: &str,
        provenance: Option<Provenance>,
    ) -> Result<(), StorageError> {
        // The inverse originates at the target, so the target's cap applies;
        // a capped inverse is dropped without disturbing the primary edge.
        match self.guard_degree(target_id).await {
            Ok(()) => {}
            Err(StorageError::DegreeCapped { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }

        let inserted = self
            .db
            .insert_relationship(NewRelationship {
                source_id: target_id,
                target_id: source_id,
                relationship_type,
                confidence,
                weight,
                description: format!("[inverse] {description}"),
                metadata: RelationshipMetadata {
                    provenance,
                    raw: None,
                },
            })
            .await?;
        if inserted.is_some() {
            self.counters.relationships_created.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    // ========================================================================
    // Chunk persistence
    // ========================================================================

    /// Persist one chunk's extraction: every entity candidate is resolved
    /// before any relationship is inserted. Edge-level rejections
    /// (degree cap, duplicates, unresolved endpoints) are counted, not
    /// raised; replaying the same extraction yields the same graph state.
    pub async fn add(
        &self,
        extraction: &Extraction,
        provenance: &Provenance,
    ) -> Result<ChunkGraphSummary, StorageError> {
        let mut summary = ChunkGraphSummary::default();
        let mut resolved: HashMap<String, EntityId> = HashMap::new();

        for candidate in &extraction.entities {
            let id = self
                .find_or_create_entity(
                    &candidate.name,
                    &candidate.description,
                    candidate.covariates.clone(),
                    Some(provenance.clone()),
                )
                .await?;
            resolved.insert(candidate.name.clone(), id);
            summary.entities_resolved += 1;
        }

        for rel in &extraction.relationships {
            let (source, target) = match (
                resolved.get(&rel.source_name),
                resolved.get(&rel.target_name),
            ) {
                (Some(s), Some(t)) => (*s, *t),
                _ => {
                    summary.relationships_skipped += 1;
                    continue;
                }
            };

            let raw = serde_json::to_value(rel).ok();
            match self
                .create_relationship(
                    source,
                    target,
                    rel.relationship_type,
                    rel.confidence,
                    &rel.description,
                    Some(provenance.clone()),
                    raw,
                )
                .await
            {
                Ok(Some(_)) => summary.relationships_created += 1,
                Ok(None) => summary.relationships_duplicate += 1,
                Err(StorageError::DegreeCapped { .. }) => summary.relationships_capped += 1,
                Err(e) => return Err(e),
            }
        }

        Ok(summary)
    }

    /// Resolution-only variant of the public contract.
    pub async fn resolve_entity(
        &self,
        name: &str,
        description: &str,
    ) -> Result<EntityId, StorageError> {
        self.find_or_create_entity(name, description, BTreeMap::new(), None)
            .await
    }

    pub async fn entity(&self, id: EntityId) -> Result<Option<EntityRecord>, StorageError> {
        self.db.entity_by_id(id).await
    }
}
