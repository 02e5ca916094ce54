//! Decoder configuration.
//!
//! All search parameters are grouped in one serde tree that can be layered
//! from built-in defaults, `lextree.toml`, `lextree.yaml` and `LEXTREE_`
//! environment variables (`__` separates nested keys, e.g.
//! `LEXTREE_PRUNING__ACOUSTIC_PRUNING=180`).

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::constants::{files, lookahead, search};
use crate::error::{DecoderError, Result};
use crate::logging::LoggingConfig;
use crate::types::{Depth, Score};

// Default value functions for serde defaults
fn default_true() -> bool { true }
fn default_history_limit() -> u32 { lookahead::DEFAULT_HISTORY_LIMIT }
fn default_tree_cutoff() -> Depth { Depth::MAX }
fn default_minimum_representation() -> u32 { lookahead::DEFAULT_MINIMUM_REPRESENTATION }
fn default_acoustic_pruning() -> Score { search::DEFAULT_ACOUSTIC_PRUNING }
fn default_lm_pruning() -> Score { search::DEFAULT_LM_PRUNING }
fn default_bins() -> u32 { search::DEFAULT_PRUNING_BINS }
fn default_unbounded() -> u32 { u32::MAX }
fn default_max_pruning_relaxations() -> u32 { search::DEFAULT_MAX_PRUNING_RELAXATIONS }
fn default_relaxation_factor() -> Score { search::DEFAULT_RELAXATION_FACTOR }
fn default_rescale_interval() -> u32 { search::DEFAULT_RESCALE_INTERVAL }
fn default_trace_gc_interval() -> u32 { search::DEFAULT_TRACE_GC_INTERVAL }

/// Search algorithm selected by the factory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchAlgorithmKind {
    #[default]
    WordConditionedTreeSearch,
}

/// Post-processing applied to word-end siblings when building lattices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LatticeOptimization {
    None,
    #[default]
    Simple,
}

/// State tree construction and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateTreeConfig {
    /// Persisted tree image; rebuilt and rewritten when stale.
    pub file: Option<PathBuf>,

    /// Build second-order successor batches for skip transitions.
    #[serde(default = "default_true")]
    pub skip_transitions: bool,

    /// Allow context-independent phonemes to cross word boundaries
    /// through the main root.
    #[serde(default = "default_true")]
    pub ci_cross_word_transitions: bool,

    /// Keep fan-in paths of different phonemes apart.
    pub enforce_path_recombination_in_fan_in: bool,
}

impl Default for StateTreeConfig {
    fn default() -> Self {
        Self {
            file: None,
            skip_transitions: true,
            ci_cross_word_transitions: true,
            enforce_path_recombination_in_fan_in: false,
        }
    }
}

/// Language model lookahead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookaheadConfig {
    pub enabled: bool,

    /// Number of most recent history tokens a table is keyed by.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,

    /// Tree states deeper than this share their ancestor's node.
    #[serde(default = "default_tree_cutoff")]
    pub tree_cutoff: Depth,

    /// Nodes representing fewer tree states are merged into their parent.
    #[serde(default = "default_minimum_representation")]
    pub minimum_representation: u32,

    /// Below this many tables a new one is always allocated.
    pub cache_size_low: u32,

    /// Above this many tables released ones are evicted.
    pub cache_size_high: u32,

    /// Tree copies with at most this many state hypotheses only use
    /// tables already in the cache.
    pub laziness: u32,
}

impl Default for LookaheadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            history_limit: default_history_limit(),
            tree_cutoff: default_tree_cutoff(),
            minimum_representation: default_minimum_representation(),
            cache_size_low: 0,
            cache_size_high: 0,
            laziness: 0,
        }
    }
}

/// Beam and histogram pruning parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruningConfig {
    /// Beam applied before acoustic scores are added. Disabled when absent.
    pub acoustic_prepruning: Option<Score>,

    #[serde(default = "default_acoustic_pruning")]
    pub acoustic_pruning: Score,

    #[serde(default = "default_unbounded")]
    pub acoustic_pruning_limit: u32,

    #[serde(default = "default_bins")]
    pub acoustic_pruning_bins: u32,

    #[serde(default = "default_lm_pruning")]
    pub lm_pruning: Score,

    #[serde(default = "default_unbounded")]
    pub lm_pruning_limit: u32,

    #[serde(default = "default_bins")]
    pub lm_pruning_bins: u32,

    /// Beam over word ends kept for lattices. Defaults to `lm_pruning`.
    pub lattice_pruning: Option<Score>,

    /// Word-end limit kept for lattices. Defaults to `lm_pruning_limit`.
    pub lattice_pruning_limit: Option<u32>,

    /// Prune with the lookahead score of the target state while expanding.
    pub anticipated_lm_lookahead_pruning: bool,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            acoustic_prepruning: None,
            acoustic_pruning: default_acoustic_pruning(),
            acoustic_pruning_limit: default_unbounded(),
            acoustic_pruning_bins: default_bins(),
            lm_pruning: default_lm_pruning(),
            lm_pruning_limit: default_unbounded(),
            lm_pruning_bins: default_bins(),
            lattice_pruning: None,
            lattice_pruning_limit: None,
            anticipated_lm_lookahead_pruning: false,
        }
    }
}

impl PruningConfig {
    pub fn effective_lattice_pruning(&self) -> Score {
        self.lattice_pruning.unwrap_or(self.lm_pruning)
    }

    pub fn effective_lattice_pruning_limit(&self) -> u32 {
        self.lattice_pruning_limit.unwrap_or(self.lm_pruning_limit)
    }
}

/// Search driver parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub algorithm: SearchAlgorithmKind,

    /// Frames an empty tree copy is kept before it is reclaimed.
    pub tree_deletion_latency: u32,

    pub create_lattice: bool,

    pub optimize_lattice: LatticeOptimization,

    /// Accept a sentence end inside a word when no word end survived.
    #[serde(default = "default_true")]
    pub sentence_end_fallback: bool,

    /// Pre-pruning retries before the search space is declared empty.
    #[serde(default = "default_max_pruning_relaxations")]
    pub max_pruning_relaxations: u32,

    #[serde(default = "default_relaxation_factor")]
    pub relaxation_factor: Score,

    pub relaxation_offset: Score,

    #[serde(default = "default_rescale_interval")]
    pub rescale_interval: u32,

    #[serde(default = "default_trace_gc_interval")]
    pub trace_gc_interval: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            algorithm: SearchAlgorithmKind::default(),
            tree_deletion_latency: 0,
            create_lattice: false,
            optimize_lattice: LatticeOptimization::default(),
            sentence_end_fallback: true,
            max_pruning_relaxations: default_max_pruning_relaxations(),
            relaxation_factor: default_relaxation_factor(),
            relaxation_offset: 0.0,
            rescale_interval: default_rescale_interval(),
            trace_gc_interval: default_trace_gc_interval(),
        }
    }
}

/// Complete decoder configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub search: SearchConfig,
    pub state_tree: StateTreeConfig,
    pub lm_lookahead: LookaheadConfig,
    pub pruning: PruningConfig,
    pub logging: LoggingConfig,
}

impl DecoderConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest priority)
    /// 2. lextree.yaml (if exists)
    /// 3. lextree.toml (if exists)
    /// 4. Built-in defaults (lowest priority)
    pub fn load() -> Result<Self> {
        Self::extract(
            Self::default_figment()
                .merge(Toml::file(files::CONFIG_TOML))
                .merge(Yaml::file(files::CONFIG_YAML))
                .merge(Env::prefixed(files::ENV_PREFIX).split("__")),
        )
    }

    /// Parse a TOML document layered over the defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Self::extract(Self::default_figment().merge(Toml::string(source)))
    }

    /// Parse a YAML document layered over the defaults.
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        Self::extract(Self::default_figment().merge(Yaml::string(source)))
    }

    fn default_figment() -> Figment {
        Figment::from(Serialized::defaults(DecoderConfig::default()))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: DecoderConfig = figment.extract().map_err(|e| {
            DecoderError::Configuration(format!("Failed to load configuration: {}", e))
        })?;
        config.validate()?;
        debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// Check parameter ranges and cross-parameter constraints.
    pub fn validate(&self) -> Result<()> {
        let p = &self.pruning;
        if let Some(pre) = p.acoustic_prepruning {
            check_beam("pruning.acoustic_prepruning", pre)?;
        }
        check_beam("pruning.acoustic_pruning", p.acoustic_pruning)?;
        check_beam("pruning.lm_pruning", p.lm_pruning)?;
        check_beam("pruning.lattice_pruning", p.effective_lattice_pruning())?;
        check_at_least("pruning.acoustic_pruning_bins", p.acoustic_pruning_bins, 2)?;
        check_at_least("pruning.lm_pruning_bins", p.lm_pruning_bins, 2)?;
        check_at_least("pruning.acoustic_pruning_limit", p.acoustic_pruning_limit, 1)?;
        check_at_least("pruning.lm_pruning_limit", p.lm_pruning_limit, 1)?;
        check_at_least(
            "pruning.lattice_pruning_limit",
            p.effective_lattice_pruning_limit(),
            1,
        )?;

        if p.effective_lattice_pruning() < p.lm_pruning {
            warn!(
                lattice = p.effective_lattice_pruning(),
                lm = p.lm_pruning,
                "lattice pruning is tighter than lm pruning and has no effect"
            );
        }

        let la = &self.lm_lookahead;
        check_at_least(
            "lm_lookahead.minimum_representation",
            la.minimum_representation,
            1,
        )?;
        if la.tree_cutoff < 0 {
            return Err(DecoderError::Configuration(
                "lm_lookahead.tree_cutoff must not be negative".to_string(),
            ));
        }

        if p.anticipated_lm_lookahead_pruning {
            if !la.enabled {
                return Err(DecoderError::Configuration(
                    "anticipated lm lookahead pruning requires lm_lookahead.enabled".to_string(),
                ));
            }
            if la.laziness > 0 {
                return Err(DecoderError::Configuration(
                    "anticipated lm lookahead pruning is incompatible with lookahead laziness"
                        .to_string(),
                ));
            }
        }

        let s = &self.search;
        if !s.relaxation_factor.is_finite() || s.relaxation_factor < 1.0 {
            return Err(DecoderError::Configuration(format!(
                "search.relaxation_factor must be at least 1.0, got {}",
                s.relaxation_factor
            )));
        }
        check_beam("search.relaxation_offset", s.relaxation_offset)?;
        check_at_least("search.rescale_interval", s.rescale_interval, 1)?;
        check_at_least("search.trace_gc_interval", s.trace_gc_interval, 1)?;

        Ok(())
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DecoderError::Configuration(format!("TOML export failed: {}", e)))
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| DecoderError::Configuration(format!("YAML export failed: {}", e)))
    }
}

fn check_beam(name: &str, value: Score) -> Result<()> {
    if value.is_nan() || value < 0.0 {
        return Err(DecoderError::Configuration(format!(
            "{} must be a non-negative number, got {}",
            name, value
        )));
    }
    Ok(())
}

fn check_at_least(name: &str, value: u32, min: u32) -> Result<()> {
    if value < min {
        return Err(DecoderError::Configuration(format!(
            "{} must be at least {}, got {}",
            name, min, value
        )));
    }
    Ok(())
}
