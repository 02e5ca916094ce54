//! The `lextree_decoder` core library.
//!
//! This crate provides word-conditioned tree search for HMM-based speech
//! recognition: a lexical prefix tree of HMM states shared by all words,
//! one copy of it per language model history, beam and histogram pruning,
//! and cached language model lookahead.

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod search;
pub mod statistics;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::DecoderConfig;
pub use error::{DecoderError, Result};
pub use models::ModelCombination;
pub use search::{create_search_algorithm, SearchAlgorithm, Traceback, WordConditionedTreeSearch};
