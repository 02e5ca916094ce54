//! Toy models shared by the unit tests.
//!
//! The lexicon has three words over the context-dependent phonemes `a b c`
//! plus silence: "ab" = `a b`, "ac" = `a c`, "b" = `b`. "ab" and "ac" share
//! the states of `a` in the tree.

use std::sync::Arc;

use crate::models::{
    AcousticModel, HmmAcousticModel, LanguageModel, Lexicon, LexiconBuilder, ModelCombination,
    NgramLanguageModel, SILENCE_LEMMA,
};
use crate::types::{Score, WordId};

pub const AB: WordId = WordId(0);
pub const AC: WordId = WordId(1);
pub const B: WordId = WordId(2);

/// Emission score of the expected state in a synthetic frame.
pub const MATCH: Score = 0.0;
/// Emission score of every other state.
pub const MISMATCH: Score = 10.0;

fn builder() -> LexiconBuilder {
    let mut b = LexiconBuilder::new();
    b.add_phoneme("si", false).unwrap();
    b.add_phoneme("a", true).unwrap();
    b.add_phoneme("b", true).unwrap();
    b.add_phoneme("c", true).unwrap();
    let sil = b.add_lemma("[SILENCE]", None);
    b.add_pronunciation(sil, "si", 0.0).unwrap();
    b.set_special_lemma(SILENCE_LEMMA, sil);
    let ab = b.add_lemma("ab", Some(AB));
    b.add_pronunciation(ab, "a b", 0.0).unwrap();
    let ac = b.add_lemma("ac", Some(AC));
    b.add_pronunciation(ac, "a c", 0.0).unwrap();
    let w = b.add_lemma("b", Some(B));
    b.add_pronunciation(w, "b", 0.0).unwrap();
    b
}

pub fn prefix_lexicon() -> Lexicon {
    builder().build().unwrap()
}

/// [`prefix_lexicon`] plus an empty pronunciation without LM token.
pub fn lexicon_with_epsilon() -> Lexicon {
    let mut b = builder();
    let eps = b.add_lemma("<eps>", None);
    b.add_pronunciation(eps, "", 0.0).unwrap();
    b.build().unwrap()
}

/// Three-state HMMs; across-word models use triphone emissions.
pub fn acoustic_model(lexicon: &Lexicon, across_word: bool) -> HmmAcousticModel {
    HmmAcousticModel::builder(lexicon)
        .triphones(across_word)
        .across_word(across_word)
        .build()
}

/// Bigram favouring "ab b".
pub fn prefix_bigram(_lexicon: &Lexicon) -> NgramLanguageModel {
    NgramLanguageModel::builder(2)
        .ngram(&[AB], 2.0, 0.0)
        .ngram(&[AC], 2.0, 0.0)
        .ngram(&[B], 2.0, 0.0)
        .ngram(&[WordId::SENTENCE_END], 2.0, 0.0)
        .ngram(&[WordId::SENTENCE_BEGIN, AB], 0.5, 0.0)
        .ngram(&[AB, B], 0.5, 0.0)
        .ngram(&[B, WordId::SENTENCE_END], 0.5, 0.0)
        .build()
        .unwrap()
}

pub fn model_combination(across_word: bool) -> ModelCombination {
    let lexicon = prefix_lexicon();
    let am = acoustic_model(&lexicon, across_word);
    let lm: Arc<dyn LanguageModel> = Arc::new(prefix_bigram(&lexicon));
    ModelCombination::new(Arc::new(lexicon), Arc::new(am), lm)
}

/// Monophone score frames spending `frames_per_state` frames in every
/// state of `phonemes`, in order.
pub fn score_stream(
    lexicon: &Lexicon,
    am: &HmmAcousticModel,
    phonemes: &[&str],
    frames_per_state: usize,
) -> Vec<Vec<Score>> {
    let mut states = Vec::new();
    for symbol in phonemes {
        let phoneme = lexicon.phoneme_id(symbol).unwrap();
        for state in 0..am.n_phone_states(phoneme) {
            states.push((*symbol, state));
        }
    }
    state_stream(lexicon, am, &states, frames_per_state)
}

/// Monophone score frames matching the given `(phoneme, phone state)`
/// sequence, `frames_per_state` frames each.
pub fn state_stream(
    lexicon: &Lexicon,
    am: &HmmAcousticModel,
    states: &[(&str, u8)],
    frames_per_state: usize,
) -> Vec<Vec<Score>> {
    let mut frames = Vec::new();
    for &(symbol, state) in states {
        let phoneme = lexicon.phoneme_id(symbol).unwrap();
        let mut frame = vec![MISMATCH; am.n_emissions() as usize];
        frame[am.monophone_emission(phoneme, state) as usize] = MATCH;
        for _ in 0..frames_per_state {
            frames.push(frame.clone());
        }
    }
    frames
}

/// Frames of "ab b" with two frames per state.
pub fn ab_b_stream(lexicon: &Lexicon, am: &HmmAcousticModel) -> Vec<Vec<Score>> {
    score_stream(lexicon, am, &["a", "b", "b"], 2)
}

/// Best score of "ab b" on [`ab_b_stream`]: one loop per state and the
/// three bigram scores.
pub const AB_B_SCORE: Score = 9.0 * 3.0 + 3.0 * 0.5;
