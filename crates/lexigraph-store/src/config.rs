//! Pipeline configuration.
//!
//! Read once at construction (optionally from the environment) and passed by
//! value to every component; nothing reads the environment after that.
//! `enable_enhanced_kg` is the master switch: with it off, every other
//! enhancement resolves to legacy behavior regardless of its own flag.

use serde::{Deserialize, Serialize};

/// Similarity floor used when enhancements are enabled.
pub const ENHANCED_DISTANCE_THRESHOLD: f32 = 0.85;
/// Similarity floor used in legacy mode.
pub const LEGACY_DISTANCE_THRESHOLD: f32 = 0.1;

/// Fatal configuration error. Raised at construction time only.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{field} out of range: {value} (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },
}

/// Immutable pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Master switch. When false all other enhancements behave as legacy.
    pub enable_enhanced_kg: bool,
    pub canonicalization_enabled: bool,
    pub typed_relationships_enabled: bool,
    pub alias_tracking_enabled: bool,
    pub parallel_processing_enabled: bool,
    pub create_symmetric_relationships: bool,
    /// Cosine-similarity floor for entity merge. `None` means mode default
    /// (0.85 enhanced, 0.1 legacy).
    pub entity_distance_threshold: Option<f32>,
    pub entity_cache_size: usize,
    pub max_workers: usize,
    pub chunk_timeout_seconds: u64,
    pub min_relationship_confidence: f32,
    pub max_edges_per_entity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_enhanced_kg: false,
            canonicalization_enabled: true,
            typed_relationships_enabled: true,
            alias_tracking_enabled: true,
            parallel_processing_enabled: true,
            create_symmetric_relationships: true,
            entity_distance_threshold: None,
            entity_cache_size: 1000,
            max_workers: default_max_workers(),
            chunk_timeout_seconds: 30,
            min_relationship_confidence: 0.3,
            max_edges_per_entity: 50,
        }
    }
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        + 4
}

impl PipelineConfig {
    /// All enhancements on.
    pub fn enhanced() -> Self {
        Self {
            enable_enhanced_kg: true,
            ..Self::default()
        }
    }

    /// Legacy pipeline: untyped edges, no cache, sequential, threshold 0.1.
    pub fn legacy() -> Self {
        Self::default()
    }

    /// Read overrides from the environment, once.
    ///
    /// Recognized variables: `ENABLE_ENHANCED_KG`,
    /// `KG_ENTITY_DISTANCE_THRESHOLD`, `ENTITY_CACHE_SIZE`, `KG_MAX_WORKERS`,
    /// `KG_CHUNK_TIMEOUT`, `KG_MIN_RELATIONSHIP_CONFIDENCE`,
    /// `KG_MAX_EDGES_PER_ENTITY`. Malformed values are fatal.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = read_env("ENABLE_ENHANCED_KG") {
            config.enable_enhanced_kg = parse_bool("ENABLE_ENHANCED_KG", &v)?;
        }
        if let Some(v) = read_env("KG_ENTITY_DISTANCE_THRESHOLD") {
            config.entity_distance_threshold =
                Some(parse_num::<f32>("KG_ENTITY_DISTANCE_THRESHOLD", &v)?);
        }
        if let Some(v) = read_env("ENTITY_CACHE_SIZE") {
            config.entity_cache_size = parse_num("ENTITY_CACHE_SIZE", &v)?;
        }
        if let Some(v) = read_env("KG_MAX_WORKERS") {
            config.max_workers = parse_num("KG_MAX_WORKERS", &v)?;
        }
        if let Some(v) = read_env("KG_CHUNK_TIMEOUT") {
            config.chunk_timeout_seconds = parse_num("KG_CHUNK_TIMEOUT", &v)?;
        }
        if let Some(v) = read_env("KG_MIN_RELATIONSHIP_CONFIDENCE") {
            config.min_relationship_confidence =
                parse_num("KG_MIN_RELATIONSHIP_CONFIDENCE", &v)?;
        }
        if let Some(v) = read_env("KG_MAX_EDGES_PER_ENTITY") {
            config.max_edges_per_entity = parse_num("KG_MAX_EDGES_PER_ENTITY", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(t) = self.entity_distance_threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(ConfigError::OutOfRange {
                    field: "entity_distance_threshold",
                    value: t as f64,
                    expected: "[0, 1]",
                });
            }
        }
        if !(0.0..=1.0).contains(&self.min_relationship_confidence) {
            return Err(ConfigError::OutOfRange {
                field: "min_relationship_confidence",
                value: self.min_relationship_confidence as f64,
                expected: "[0, 1]",
            });
        }
        if self.max_workers == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_workers",
                value: 0.0,
                expected: ">= 1",
            });
        }
        if self.chunk_timeout_seconds == 0 {
            return Err(ConfigError::OutOfRange {
                field: "chunk_timeout_seconds",
                value: 0.0,
                expected: ">= 1",
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Resolved views. These implement the master switch: callers never
    // consult the raw flags directly.
    // ------------------------------------------------------------------

    pub fn canonicalization(&self) -> bool {
        self.enable_enhanced_kg && self.canonicalization_enabled
    }

    pub fn typed_relationships(&self) -> bool {
        self.enable_enhanced_kg && self.typed_relationships_enabled
    }

    pub fn alias_tracking(&self) -> bool {
        self.enable_enhanced_kg && self.alias_tracking_enabled
    }

    pub fn parallel_processing(&self) -> bool {
        self.enable_enhanced_kg && self.parallel_processing_enabled
    }

    pub fn symmetric_relationships(&self) -> bool {
        self.enable_enhanced_kg && self.create_symmetric_relationships
    }

    /// Merge floor: explicit override in enhanced mode, else mode default.
    pub fn distance_threshold(&self) -> f32 {
        if self.enable_enhanced_kg {
            self.entity_distance_threshold
                .unwrap_or(ENHANCED_DISTANCE_THRESHOLD)
        } else {
            LEGACY_DISTANCE_THRESHOLD
        }
    }

    /// Cache capacity; zero in legacy mode (cache disabled).
    pub fn cache_capacity(&self) -> usize {
        if self.enable_enhanced_kg {
            self.entity_cache_size
        } else {
            0
        }
    }

    /// Worker count; one in legacy mode (sequential).
    pub fn effective_workers(&self) -> usize {
        if self.parallel_processing() {
            self.max_workers
        } else {
            1
        }
    }

    pub fn chunk_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.chunk_timeout_seconds)
    }
}

fn read_env(var: &'static str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "expected boolean".to_string(),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_option_table() {
        let c = PipelineConfig::default();
        assert!(!c.enable_enhanced_kg);
        assert!(c.canonicalization_enabled);
        assert!(c.typed_relationships_enabled);
        assert!(c.alias_tracking_enabled);
        assert!(c.parallel_processing_enabled);
        assert!(c.create_symmetric_relationships);
        assert_eq!(c.entity_cache_size, 1000);
        assert_eq!(c.chunk_timeout_seconds, 30);
        assert_eq!(c.min_relationship_confidence, 0.3);
        assert_eq!(c.max_edges_per_entity, 50);
        assert!(c.max_workers >= 5);
    }

    #[test]
    fn master_switch_forces_legacy_behavior() {
        let c = PipelineConfig::legacy();
        assert!(!c.canonicalization());
        assert!(!c.typed_relationships());
        assert!(!c.alias_tracking());
        assert!(!c.parallel_processing());
        assert!(!c.symmetric_relationships());
        assert_eq!(c.distance_threshold(), LEGACY_DISTANCE_THRESHOLD);
        assert_eq!(c.cache_capacity(), 0);
        assert_eq!(c.effective_workers(), 1);
    }

    #[test]
    fn enhanced_resolves_enhancement_defaults() {
        let c = PipelineConfig::enhanced();
        assert!(c.canonicalization());
        assert!(c.typed_relationships());
        assert!(c.symmetric_relationships());
        assert_eq!(c.distance_threshold(), ENHANCED_DISTANCE_THRESHOLD);
        assert_eq!(c.cache_capacity(), 1000);
        assert!(c.effective_workers() >= 5);
    }

    #[test]
    fn explicit_threshold_only_applies_when_enhanced() {
        let mut c = PipelineConfig::enhanced();
        c.entity_distance_threshold = Some(0.7);
        assert_eq!(c.distance_threshold(), 0.7);

        c.enable_enhanced_kg = false;
        assert_eq!(c.distance_threshold(), LEGACY_DISTANCE_THRESHOLD);
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let mut c = PipelineConfig::enhanced();
        c.entity_distance_threshold = Some(1.5);
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::enhanced();
        c.min_relationship_confidence = -0.1;
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::enhanced();
        c.max_workers = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn env_overrides_are_read_once_and_validated() {
        std::env::set_var("ENABLE_ENHANCED_KG", "true");
        std::env::set_var("KG_ENTITY_DISTANCE_THRESHOLD", "0.9");
        std::env::set_var("ENTITY_CACHE_SIZE", "10");
        std::env::set_var("KG_MAX_WORKERS", "3");
        std::env::set_var("KG_CHUNK_TIMEOUT", "5");
        std::env::set_var("KG_MIN_RELATIONSHIP_CONFIDENCE", "0.4");
        std::env::set_var("KG_MAX_EDGES_PER_ENTITY", "7");

        let c = PipelineConfig::from_env().unwrap();
        assert!(c.enable_enhanced_kg);
        assert_eq!(c.distance_threshold(), 0.9);
        assert_eq!(c.cache_capacity(), 10);
        assert_eq!(c.max_workers, 3);
        assert_eq!(c.chunk_timeout_seconds, 5);
        assert_eq!(c.min_relationship_confidence, 0.4);
        assert_eq!(c.max_edges_per_entity, 7);

        std::env::set_var("KG_MAX_WORKERS", "not a number");
        assert!(PipelineConfig::from_env().is_err());

        for var in [
            "ENABLE_ENHANCED_KG",
            "KG_ENTITY_DISTANCE_THRESHOLD",
            "ENTITY_CACHE_SIZE",
            "KG_MAX_WORKERS",
            "KG_CHUNK_TIMEOUT",
            "KG_MIN_RELATIONSHIP_CONFIDENCE",
            "KG_MAX_EDGES_PER_ENTITY",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn parse_helpers_accept_common_forms() {
        assert!(parse_bool("X", "true").unwrap());
        assert!(parse_bool("X", " 1 ").unwrap());
        assert!(!parse_bool("X", "off").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
        assert_eq!(parse_num::<usize>("X", "42").unwrap(), 42);
        assert!(parse_num::<f32>("X", "0.85").unwrap() > 0.8);
        assert!(parse_num::<usize>("X", "4.5").is_err());
    }
}
