//! Run configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config. The
//! training subsystem hands its per-category match radii over through
//! [`PipelineConfig::match_radii`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core_modules::blob_splitter::SplitterKind;
use crate::core_modules::exclusion::ExclusionRule;
use crate::error::ConfigError;

/// Depth-0 pure blobs a category needs before its model is trusted.
pub const DEFAULT_MIN_VIABLE_SAMPLES: usize = 8;
/// Hard cap on the erosion sweep, independent of the data.
pub const DEFAULT_MAX_EROSION_DEPTH: usize = 64;
/// About this many images per run get a debug image, whatever the batch size.
pub const DEFAULT_DEBUG_SAMPLE_TARGET: usize = 10;

/// Configuration for the calibration, post-processing and reconciliation phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker count of every phase's pool.
    pub threads: usize,
    /// Minimum number of depth-0 pure blobs required to calibrate a category.
    pub min_viable_samples: usize,
    /// The erosion sweep never goes deeper than this.
    pub max_erosion_depth: usize,
    /// Target number of debug images per run. Zero disables them.
    pub debug_sample_target: usize,
    /// Seed for picking the debug subset. `None` draws from the thread RNG.
    pub debug_seed: Option<u64>,
    /// Strategy used for blobs above the top cutoff.
    pub splitter: SplitterKind,
    /// Cross-category suppression rules.
    pub exclusion_rules: Vec<ExclusionRule>,
    /// Maximum match distance per category, in pixels.
    pub match_radii: BTreeMap<String, f64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            min_viable_samples: DEFAULT_MIN_VIABLE_SAMPLES,
            max_erosion_depth: DEFAULT_MAX_EROSION_DEPTH,
            debug_sample_target: DEFAULT_DEBUG_SAMPLE_TARGET,
            debug_seed: None,
            splitter: SplitterKind::default(),
            exclusion_rules: Vec::new(),
            match_radii: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Parses and validates a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::Invalid("threads must be at least 1".into()));
        }
        if self.min_viable_samples == 0 {
            return Err(ConfigError::Invalid(
                "min_viable_samples must be at least 1".into(),
            ));
        }
        for rule in &self.exclusion_rules {
            if rule.trigger == rule.suppressed {
                return Err(ConfigError::Invalid(format!(
                    "exclusion rule on '{}' suppresses its own trigger",
                    rule.trigger
                )));
            }
        }
        for (category, radius) in &self.match_radii {
            if !radius.is_finite() || *radius < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "match radius for '{category}' must be a non-negative number, got {radius}"
                )));
            }
        }
        if let SplitterKind::KMeans { iterations } = self.splitter {
            if iterations == 0 {
                return Err(ConfigError::Invalid(
                    "k-means splitter needs at least one iteration".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = PipelineConfig::from_json_str("{}").unwrap();
        assert_eq!(config.min_viable_samples, 8);
        assert_eq!(config.max_erosion_depth, 64);
        assert_eq!(config.debug_sample_target, 10);
        assert!(config.threads >= 1);
        assert_eq!(config.splitter, SplitterKind::Erosion);
    }

    #[test]
    fn parses_rules_radii_and_splitter() {
        let json = r#"{
            "threads": 2,
            "splitter": { "kind": "k_means", "iterations": 12 },
            "exclusion_rules": [
                { "trigger": "dead", "suppressed": "live", "radius": 4 }
            ],
            "match_radii": { "live": 6.5, "dead": 5.0 }
        }"#;
        let config = PipelineConfig::from_json_str(json).unwrap();
        assert_eq!(config.threads, 2);
        assert_eq!(config.splitter, SplitterKind::KMeans { iterations: 12 });
        assert_eq!(config.exclusion_rules.len(), 1);
        assert_eq!(config.exclusion_rules[0].radius, 4);
        assert_eq!(config.match_radii["live"], 6.5);
    }

    #[test]
    fn rejects_self_suppressing_rule() {
        let json = r#"{ "exclusion_rules": [ { "trigger": "a", "suppressed": "a", "radius": 1 } ] }"#;
        assert!(matches!(
            PipelineConfig::from_json_str(json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_zero_threads_and_negative_radius() {
        assert!(PipelineConfig::from_json_str(r#"{ "threads": 0 }"#).is_err());
        assert!(PipelineConfig::from_json_str(r#"{ "match_radii": { "a": -1.0 } }"#).is_err());
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            PipelineConfig::from_json_str("{ threads: "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            PipelineConfig::from_path("/definitely/not/here.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
