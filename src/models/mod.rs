//! Models the search consumes: lexicon, acoustic model, language model.
//!
//! These are collaborator interfaces plus small in-memory implementations;
//! reading model files is left to the embedding application.

pub mod acoustic;
pub mod language_model;
pub mod lexicon;

pub use acoustic::{
    AcousticModel, Allophone, FrameScorer, FrameScores, HmmAcousticModel, StateTransitionModel,
    TransitionType,
};
pub use language_model::{History, LanguageModel, NgramLanguageModel, WordGrammar};
pub use lexicon::{Lexicon, LexiconBuilder, SILENCE_LEMMA};

use std::sync::Arc;

use crate::types::Score;

/// The set of models a search is bound to.
#[derive(Debug, Clone)]
pub struct ModelCombination {
    pub lexicon: Arc<Lexicon>,
    pub acoustic_model: Arc<dyn AcousticModel>,
    pub language_model: Arc<dyn LanguageModel>,
    /// Weight of pronunciation scores.
    pub pronunciation_scale: Score,
}

impl ModelCombination {
    pub fn new(
        lexicon: Arc<Lexicon>,
        acoustic_model: Arc<dyn AcousticModel>,
        language_model: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            lexicon,
            acoustic_model,
            language_model,
            pronunciation_scale: 1.0,
        }
    }

    pub fn with_pronunciation_scale(mut self, scale: Score) -> Self {
        self.pronunciation_scale = scale;
        self
    }
}
