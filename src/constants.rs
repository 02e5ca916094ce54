//! Domain constants for the decoder.
//!
//! This module contains compile-time constants used throughout the crate.
//! These are separated from runtime configuration to provide clear distinction
//! between values that never change and those that can be configured.

/// State tree persistence format.
pub mod persistence {
    /// Leading magic bytes of a state tree file.
    pub const MAGIC: &[u8; 8] = b"LXTREE\0\0";

    /// Current format version. Files with any other version are rebuilt.
    pub const FORMAT_VERSION: u32 = 3;

    /// Size of the fixed header: magic, version, dependency block offset.
    pub const HEADER_SIZE: usize = 8 + 4 + 8;
}

/// Transition model table layout.
pub mod transition {
    use crate::types::Score;

    /// Entry model of the non-emitting roots (single forward step, no loop).
    pub const ENTRY_M1: u8 = 0;

    /// Entry model allowing a skip out of the root.
    pub const ENTRY_M2: u8 = 1;

    /// Silence model.
    pub const SILENCE: u8 = 2;

    /// First sub state of a phoneme.
    pub const PHONE0: u8 = 3;

    /// Further sub states of a phoneme.
    pub const PHONE1: u8 = 4;

    /// Number of transition models in the table.
    pub const N_TRANSITION_MODELS: usize = 5;

    /// Default loop penalty.
    pub const DEFAULT_LOOP: Score = 3.0;

    /// Default forward penalty.
    pub const DEFAULT_FORWARD: Score = 0.0;

    /// Default skip penalty.
    pub const DEFAULT_SKIP: Score = 3.0;

    /// Default word exit penalty.
    pub const DEFAULT_EXIT: Score = 0.0;
}

/// Search defaults.
pub mod search {
    use crate::types::Score;

    /// Default acoustic beam.
    pub const DEFAULT_ACOUSTIC_PRUNING: Score = 1000.0;

    /// Default LM beam.
    pub const DEFAULT_LM_PRUNING: Score = 1000.0;

    /// Default histogram resolution.
    pub const DEFAULT_PRUNING_BINS: u32 = 100;

    /// Scores are shifted every this many frames.
    pub const DEFAULT_RESCALE_INTERVAL: u32 = 10;

    /// Unreachable traces are collected every this many frames.
    pub const DEFAULT_TRACE_GC_INTERVAL: u32 = 10;

    /// Pre-pruning retries before the search space is declared empty.
    pub const DEFAULT_MAX_PRUNING_RELAXATIONS: u32 = 3;

    /// Factor applied to a beam on each relaxation.
    pub const DEFAULT_RELAXATION_FACTOR: Score = 2.0;
}

/// LM lookahead defaults.
pub mod lookahead {
    /// Default history length used to key lookahead tables.
    pub const DEFAULT_HISTORY_LIMIT: u32 = 1;

    /// Default minimum number of tree states a lookahead node represents.
    pub const DEFAULT_MINIMUM_REPRESENTATION: u32 = 1;
}

/// Configuration file locations.
pub mod files {
    /// TOML configuration file.
    pub const CONFIG_TOML: &str = "lextree.toml";

    /// YAML configuration file.
    pub const CONFIG_YAML: &str = "lextree.yaml";

    /// Prefix of configuration environment variables.
    pub const ENV_PREFIX: &str = "LEXTREE_";
}
