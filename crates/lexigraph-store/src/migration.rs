//! Additive schema migration.
//!
//! Shared, serializable description of the one-shot schema changes the
//! enhanced pipeline needs. Backends apply the catalog idempotently; legacy
//! rows are never rewritten (no backfill), the new columns carry defaults
//! that keep them queryable.

use serde::{Deserialize, Serialize};

/// One additive change to the persisted schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchemaChange {
    AddColumn {
        table: String,
        column: String,
        /// SQL-ish type tag; backends map it onto their own type system.
        column_type: String,
        nullable: bool,
        default: Option<serde_json::Value>,
    },
    AddIndex {
        table: String,
        column: String,
        descending: bool,
    },
}

/// A named, ordered batch of additive changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    /// Stable identifier backends use to record application.
    pub id: String,
    pub changes: Vec<SchemaChange>,
}

impl Migration {
    /// The enhanced knowledge-graph schema: canonical ids and normalized
    /// names on entities; type, confidence, and weight on relationships.
    pub fn enhanced_kg() -> Self {
        Self {
            id: "enhanced_kg_v1".to_string(),
            changes: vec![
                SchemaChange::AddColumn {
                    table: "entities".to_string(),
                    column: "canonical_id".to_string(),
                    column_type: "text".to_string(),
                    nullable: true,
                    default: None,
                },
                SchemaChange::AddColumn {
                    table: "entities".to_string(),
                    column: "normalized_name".to_string(),
                    column_type: "text".to_string(),
                    nullable: true,
                    default: None,
                },
                SchemaChange::AddColumn {
                    table: "relationships".to_string(),
                    column: "relationship_type".to_string(),
                    column_type: "text".to_string(),
                    nullable: false,
                    default: Some(serde_json::json!("generic")),
                },
                SchemaChange::AddColumn {
                    table: "relationships".to_string(),
                    column: "confidence".to_string(),
                    column_type: "real".to_string(),
                    nullable: false,
                    default: Some(serde_json::json!(0.8)),
                },
                SchemaChange::AddColumn {
                    table: "relationships".to_string(),
                    column: "weight".to_string(),
                    column_type: "real".to_string(),
                    nullable: false,
                    default: Some(serde_json::json!(0.0)),
                },
                SchemaChange::AddIndex {
                    table: "entities".to_string(),
                    column: "canonical_id".to_string(),
                    descending: false,
                },
                SchemaChange::AddIndex {
                    table: "relationships".to_string(),
                    column: "relationship_type".to_string(),
                    descending: false,
                },
                SchemaChange::AddIndex {
                    table: "relationships".to_string(),
                    column: "weight".to_string(),
                    descending: true,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enhanced_kg_is_purely_additive() {
        let migration = Migration::enhanced_kg();
        assert_eq!(migration.id, "enhanced_kg_v1");
        // Five columns, three indexes, nothing destructive by construction.
        let columns = migration
            .changes
            .iter()
            .filter(|c| matches!(c, SchemaChange::AddColumn { .. }))
            .count();
        let indexes = migration
            .changes
            .iter()
            .filter(|c| matches!(c, SchemaChange::AddIndex { .. }))
            .count();
        assert_eq!(columns, 5);
        assert_eq!(indexes, 3);
    }

    #[test]
    fn relationship_columns_carry_legacy_defaults() {
        let migration = Migration::enhanced_kg();
        let default_of = |name: &str| {
            migration.changes.iter().find_map(|c| match c {
                SchemaChange::AddColumn {
                    column, default, ..
                } if column == name => Some(default.clone()),
                _ => None,
            })
        };
        assert_eq!(default_of("relationship_type"), Some(Some(serde_json::json!("generic"))));
        assert_eq!(default_of("confidence"), Some(Some(serde_json::json!(0.8))));
        assert_eq!(default_of("weight"), Some(Some(serde_json::json!(0.0))));
    }

    #[test]
    fn serializes_for_out_of_band_application() {
        let migration = Migration::enhanced_kg();
        let json = serde_json::to_string(&migration).unwrap();
        let back: Migration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, migration);
    }
}
