//! The decoder contract every search strategy implements.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::traceback::{Traceback, WordLattice};
use super::wcts::WordConditionedTreeSearch;
use crate::config::{DecoderConfig, PruningConfig, SearchAlgorithmKind};
use crate::error::Result;
use crate::models::{FrameScorer, LanguageModel, ModelCombination};
use crate::types::{Score, TimeframeIndex};

/// Snapshot of the pruning parameters of a search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PruningDescriptor {
    pub acoustic_prepruning: Option<Score>,
    pub acoustic_pruning: Score,
    pub acoustic_pruning_limit: u32,
    pub lm_pruning: Score,
    pub lm_pruning_limit: u32,
    pub lattice_pruning: Score,
    pub lattice_pruning_limit: u32,
}

impl PruningDescriptor {
    pub fn from_config(config: &PruningConfig) -> Self {
        Self {
            acoustic_prepruning: config.acoustic_prepruning,
            acoustic_pruning: config.acoustic_pruning,
            acoustic_pruning_limit: config.acoustic_pruning_limit,
            lm_pruning: config.lm_pruning,
            lm_pruning_limit: config.lm_pruning_limit,
            lattice_pruning: config.effective_lattice_pruning(),
            lattice_pruning_limit: config.effective_lattice_pruning_limit(),
        }
    }

    /// Beams scaled by `factor` and widened by `offset`; limits scaled by
    /// `factor`, saturating at unbounded.
    pub fn relaxed(&self, factor: Score, offset: Score) -> Self {
        let beam = |b: Score| b * factor + offset;
        let limit = |l: u32| {
            let scaled = (l as f64 * factor as f64).ceil();
            if scaled >= u32::MAX as f64 {
                u32::MAX
            } else {
                scaled as u32
            }
        };
        Self {
            acoustic_prepruning: self.acoustic_prepruning.map(beam),
            acoustic_pruning: beam(self.acoustic_pruning),
            acoustic_pruning_limit: limit(self.acoustic_pruning_limit),
            lm_pruning: beam(self.lm_pruning),
            lm_pruning_limit: limit(self.lm_pruning_limit),
            lattice_pruning: beam(self.lattice_pruning),
            lattice_pruning_limit: limit(self.lattice_pruning_limit),
        }
    }
}

impl fmt::Display for PruningDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "acoustic {}/{}, lm {}/{}, lattice {}/{}",
            self.acoustic_pruning,
            self.acoustic_pruning_limit,
            self.lm_pruning,
            self.lm_pruning_limit,
            self.lattice_pruning,
            self.lattice_pruning_limit
        )?;
        if let Some(pre) = self.acoustic_prepruning {
            write!(f, ", prepruning {}", pre)?;
        }
        Ok(())
    }
}

/// Lifecycle of a time-synchronous decoder.
///
/// Models are bound once, then every utterance runs `restart`, one `feed`
/// per frame and a final `finalize` (or any of the result queries).
pub trait SearchAlgorithm: Send + fmt::Debug {
    /// Bind lexicon, acoustic and language model. Not allowed while feeding.
    fn set_model_combination(&mut self, models: &ModelCombination) -> Result<()>;

    /// Replace the language model by a grammar. Not allowed while feeding.
    fn set_grammar(&mut self, grammar: Arc<dyn LanguageModel>) -> Result<()>;

    /// Start a new utterance.
    fn restart(&mut self) -> Result<()>;

    /// Process the emission scores of one frame.
    fn feed(&mut self, scores: &dyn FrameScorer) -> Result<()>;

    /// Best sentence hypothesis given the frames fed so far.
    fn get_current_best_sentence(&mut self) -> Result<Traceback>;

    /// Words all surviving hypotheses agree on and that were not returned
    /// by a previous call.
    fn get_partial_sentence(&mut self) -> Result<Traceback>;

    fn get_current_word_lattice(&mut self) -> Result<WordLattice>;

    fn describe_pruning(&self) -> PruningDescriptor;

    /// Loosen pruning. Returns false when nothing changed.
    fn relax_pruning(&mut self, factor: Score, offset: Score) -> bool;

    fn reset_pruning(&mut self, descriptor: &PruningDescriptor);

    /// End the utterance and return its best sentence.
    fn finalize(&mut self) -> Result<Traceback>;

    /// Number of frames fed since the last restart.
    fn time(&self) -> TimeframeIndex;

    fn reset_statistics(&mut self);

    fn log_statistics(&self);
}

/// Create the configured search strategy.
pub fn create_search_algorithm(config: &DecoderConfig) -> Result<Box<dyn SearchAlgorithm>> {
    config.validate()?;
    match config.search.algorithm {
        SearchAlgorithmKind::WordConditionedTreeSearch => {
            Ok(Box::new(WordConditionedTreeSearch::new(config.clone())?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_from_config() {
        let config = PruningConfig {
            lm_pruning: 12.0,
            ..PruningConfig::default()
        };
        let d = PruningDescriptor::from_config(&config);
        assert_eq!(d.lm_pruning, 12.0);
        assert_eq!(d.lattice_pruning, 12.0);
        assert_eq!(d.acoustic_pruning_limit, u32::MAX);
        assert_eq!(d.acoustic_prepruning, None);
    }

    #[test]
    fn test_relaxed() {
        let d = PruningDescriptor {
            acoustic_prepruning: Some(10.0),
            acoustic_pruning: 100.0,
            acoustic_pruning_limit: 50,
            lm_pruning: 20.0,
            lm_pruning_limit: u32::MAX,
            lattice_pruning: 20.0,
            lattice_pruning_limit: 7,
        };
        let r = d.relaxed(2.0, 1.0);
        assert_eq!(r.acoustic_prepruning, Some(21.0));
        assert_eq!(r.acoustic_pruning, 201.0);
        assert_eq!(r.acoustic_pruning_limit, 100);
        assert_eq!(r.lm_pruning_limit, u32::MAX);
        assert_eq!(r.lattice_pruning_limit, 14);
        assert_eq!(d.relaxed(1.0, 0.0), d);
    }

    #[test]
    fn test_factory() {
        let algorithm = create_search_algorithm(&DecoderConfig::default()).unwrap();
        assert_eq!(algorithm.time(), 0);
        assert_eq!(
            algorithm.describe_pruning(),
            PruningDescriptor::from_config(&PruningConfig::default())
        );
    }

    #[test]
    fn test_factory_rejects_invalid_config() {
        let mut config = DecoderConfig::default();
        config.pruning.acoustic_pruning_bins = 1;
        assert!(create_search_algorithm(&config).is_err());
    }
}
