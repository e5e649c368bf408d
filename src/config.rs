//! Engine configuration, read from `.qralph/qralph.toml`.
//!
//! # Configuration File Format
//!
//! ```toml
//! [research]
//! detected = ["context7", "tavily"]
//!
//! [pricing]
//! haiku_per_mtok = 0.25
//! sonnet_per_mtok = 3.0
//! opus_per_mtok = 15.0
//! ```
//!
//! A missing file yields the defaults; a malformed file is a bootstrap
//! error. Pricing is a cost-model assumption, not an engine invariant, so
//! it lives here rather than in the circuit-breaker code.

use crate::store::ModelTier;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Research tools available to plan-phase agents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchConfig {
    /// Detected MCP research tools, e.g. `context7`, `tavily`, `brave_search`.
    #[serde(default)]
    pub detected: Vec<String>,
}

/// USD per million tokens for each model tier, blended input/output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_haiku_per_mtok")]
    pub haiku_per_mtok: f64,
    #[serde(default = "default_sonnet_per_mtok")]
    pub sonnet_per_mtok: f64,
    #[serde(default = "default_opus_per_mtok")]
    pub opus_per_mtok: f64,
}

fn default_haiku_per_mtok() -> f64 {
    0.25
}

fn default_sonnet_per_mtok() -> f64 {
    3.0
}

fn default_opus_per_mtok() -> f64 {
    15.0
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            haiku_per_mtok: default_haiku_per_mtok(),
            sonnet_per_mtok: default_sonnet_per_mtok(),
            opus_per_mtok: default_opus_per_mtok(),
        }
    }
}

impl PricingConfig {
    pub fn per_mtok(&self, tier: ModelTier) -> f64 {
        match tier {
            ModelTier::Haiku => self.haiku_per_mtok,
            ModelTier::Sonnet => self.sonnet_per_mtok,
            ModelTier::Opus => self.opus_per_mtok,
        }
    }

    /// Estimated USD cost for a token count at the given tier.
    pub fn estimate_cost(&self, tokens: u64, tier: ModelTier) -> f64 {
        (tokens as f64 / 1_000_000.0) * self.per_mtok(tier)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QralphConfig {
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
}

impl QralphConfig {
    /// Load from `path`. A missing file yields defaults; a malformed file
    /// is an error (bootstrap failure at the CLI boundary).
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Malformed config at {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = QralphConfig::load(&dir.path().join("qralph.toml")).unwrap();
        assert!(config.research.detected.is_empty());
        assert_eq!(config.pricing.sonnet_per_mtok, 3.0);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("qralph.toml");
        std::fs::write(&path, "[research]\ndetected = [\"context7\"]\n").unwrap();
        let config = QralphConfig::load(&path).unwrap();
        assert_eq!(config.research.detected, vec!["context7"]);
        assert_eq!(config.pricing.opus_per_mtok, 15.0);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("qralph.toml");
        std::fs::write(&path, "not [valid toml").unwrap();
        assert!(QralphConfig::load(&path).is_err());
    }

    #[test]
    fn test_estimate_cost_per_tier() {
        let pricing = PricingConfig::default();
        assert_eq!(pricing.estimate_cost(1_000_000, ModelTier::Sonnet), 3.0);
        assert_eq!(pricing.estimate_cost(500_000, ModelTier::Haiku), 0.125);
        assert_eq!(pricing.estimate_cost(2_000_000, ModelTier::Opus), 30.0);
    }
}
