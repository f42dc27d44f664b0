//! Pure name canonicalization.
//!
//! Deterministic by construction: the same inputs always produce
//! byte-identical outputs, which is what makes the canonical id a safe
//! dedup key across workers and across runs.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// How many description characters participate in the canonical id.
const CANONICAL_DESCRIPTION_PREFIX: usize = 100;
/// Hex characters kept from the SHA-256 digest.
const CANONICAL_ID_LEN: usize = 16;

/// Name normalizer. With `enabled == false` every operation degrades to the
/// legacy passthrough behavior.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    enabled: bool,
}

impl Normalizer {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Canonicalize a surface form: NFKC, lowercase, trim, keep only
    /// letters/digits/whitespace/hyphen, collapse internal whitespace.
    pub fn normalize_name(&self, name: &str) -> String {
        if !self.enabled {
            return name.to_string();
        }

        let folded: String = name
            .nfkc()
            .flat_map(char::to_lowercase)
            .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-')
            .collect();

        let mut out = String::with_capacity(folded.len());
        for word in folded.split_whitespace() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(word);
        }
        out
    }

    /// Derive the 16-hex canonical id from normalized name + description
    /// prefix. Disabled: the raw name is its own id.
    pub fn canonical_id(&self, name: &str, description: &str) -> String {
        if !self.enabled {
            return name.to_string();
        }

        let prefix: String = description.chars().take(CANONICAL_DESCRIPTION_PREFIX).collect();
        let seed = format!("{}::{}", self.normalize_name(name), prefix);

        let digest = Sha256::digest(seed.as_bytes());
        let mut hex = String::with_capacity(CANONICAL_ID_LEN);
        for byte in digest.iter() {
            if hex.len() >= CANONICAL_ID_LEN {
                break;
            }
            hex.push_str(&format!("{byte:02x}"));
        }
        hex.truncate(CANONICAL_ID_LEN);
        hex
    }

    /// Text handed to the embedding model for this entity.
    pub fn embedding_input(&self, name: &str, description: &str) -> String {
        if !self.enabled {
            return name.to_string();
        }
        let normalized = self.normalize_name(name);
        if description.is_empty() {
            normalized
        } else {
            format!("{normalized} {description}")
        }
    }
}
