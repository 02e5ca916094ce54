//! Acoustic model interface and an HMM topology implementation.
//!
//! The search only needs the topology (how many HMM states a phoneme has,
//! which emission model and transition model each state uses) and, per
//! frame, a score for every emission model.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::{Index, IndexMut};

use crate::constants::transition;
use crate::models::lexicon::Lexicon;
use crate::types::{EmissionIndex, Fingerprint, PhonemeId, Score};

/// Position of an allophone inside its word.
pub mod boundary {
    pub const INTRA_WORD: u8 = 0;
    pub const INITIAL_PHONE: u8 = 1;
    pub const FINAL_PHONE: u8 = 2;
}

/// A phoneme in its left and right phonetic context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allophone {
    pub phoneme: PhonemeId,
    pub history: Option<PhonemeId>,
    pub future: Option<PhonemeId>,
    /// Combination of [`boundary`] flags.
    pub boundary: u8,
}

/// HMM transition kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionType {
    Loop = 0,
    Forward = 1,
    Skip = 2,
    Exit = 3,
}

/// Penalties for leaving an HMM state by each transition kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateTransitionModel {
    scores: [Score; 4],
}

impl StateTransitionModel {
    pub fn new(loop_score: Score, forward: Score, skip: Score, exit: Score) -> Self {
        Self {
            scores: [loop_score, forward, skip, exit],
        }
    }

    /// Model of a non-emitting entry state: a single forward step.
    pub fn entry() -> Self {
        Self::new(Score::INFINITY, 0.0, Score::INFINITY, 0.0)
    }
}

impl Index<TransitionType> for StateTransitionModel {
    type Output = Score;

    fn index(&self, t: TransitionType) -> &Score {
        &self.scores[t as usize]
    }
}

impl IndexMut<TransitionType> for StateTransitionModel {
    fn index_mut(&mut self, t: TransitionType) -> &mut Score {
        &mut self.scores[t as usize]
    }
}

/// Topology and emission mapping of an acoustic model.
pub trait AcousticModel: Send + Sync + fmt::Debug {
    /// Size of the per-frame emission score vector.
    fn n_emissions(&self) -> u32;

    fn n_phone_states(&self, phoneme: PhonemeId) -> u8;

    fn n_sub_states(&self, phoneme: PhonemeId, phone_state: u8) -> u8;

    /// Whether allophones depend on the neighbouring word's phonemes.
    fn is_across_word_model_enabled(&self) -> bool;

    fn emission_index(&self, allophone: &Allophone, phone_state: u8) -> EmissionIndex;

    fn transition_model_index(&self, allophone: &Allophone, phone_state: u8, sub_state: u8) -> u8;

    /// Transition model table indexed by [`AcousticModel::transition_model_index`].
    /// Index [`transition::ENTRY_M1`] must be the non-emitting entry model.
    fn transition_models(&self) -> &[StateTransitionModel];

    fn fingerprint(&self) -> Fingerprint;
}

/// Per-frame emission scores.
pub trait FrameScorer {
    fn n_emissions(&self) -> u32;

    fn score(&self, emission: EmissionIndex) -> Score;
}

/// Borrowed emission score vector.
#[derive(Debug, Clone, Copy)]
pub struct FrameScores<'a>(pub &'a [Score]);

impl FrameScorer for FrameScores<'_> {
    fn n_emissions(&self) -> u32 {
        self.0.len() as u32
    }

    fn score(&self, emission: EmissionIndex) -> Score {
        self.0[emission as usize]
    }
}

impl FrameScorer for Vec<Score> {
    fn n_emissions(&self) -> u32 {
        self.len() as u32
    }

    fn score(&self, emission: EmissionIndex) -> Score {
        self[emission as usize]
    }
}

/// Left-to-right HMM model with monophone or triphone emissions.
///
/// Monophone emissions occupy `phoneme * S + state`; triphone emissions of
/// context-dependent phonemes follow, indexed by (phoneme, history, future)
/// where a missing context counts as an extra symbol.
#[derive(Debug, Clone)]
pub struct HmmAcousticModel {
    context_dependent: Vec<bool>,
    silence: Option<PhonemeId>,
    phone_states: u8,
    sub_states: u8,
    across_word: bool,
    triphones: bool,
    transition_models: Vec<StateTransitionModel>,
}

impl HmmAcousticModel {
    pub fn builder(lexicon: &Lexicon) -> HmmAcousticModelBuilder {
        HmmAcousticModelBuilder::new(lexicon)
    }

    fn n_phonemes(&self) -> u32 {
        self.context_dependent.len() as u32
    }

    fn is_silence(&self, phoneme: PhonemeId) -> bool {
        self.silence == Some(phoneme)
    }

    fn uses_triphone(&self, phoneme: PhonemeId) -> bool {
        self.triphones && self.context_dependent[phoneme.index()]
    }

    pub fn monophone_emission(&self, phoneme: PhonemeId, phone_state: u8) -> EmissionIndex {
        phoneme.0 as u32 * self.phone_states as u32 + phone_state as u32
    }
}

impl AcousticModel for HmmAcousticModel {
    fn n_emissions(&self) -> u32 {
        let n = self.n_phonemes();
        let s = self.phone_states as u32;
        let mono = n * s;
        if self.triphones {
            mono + n * (n + 1) * (n + 1) * s
        } else {
            mono
        }
    }

    fn n_phone_states(&self, phoneme: PhonemeId) -> u8 {
        if self.is_silence(phoneme) {
            1
        } else {
            self.phone_states
        }
    }

    fn n_sub_states(&self, phoneme: PhonemeId, _phone_state: u8) -> u8 {
        if self.is_silence(phoneme) {
            1
        } else {
            self.sub_states
        }
    }

    fn is_across_word_model_enabled(&self) -> bool {
        self.across_word
    }

    fn emission_index(&self, allophone: &Allophone, phone_state: u8) -> EmissionIndex {
        if !self.uses_triphone(allophone.phoneme) {
            return self.monophone_emission(allophone.phoneme, phone_state);
        }
        let n = self.n_phonemes();
        let context = |p: Option<PhonemeId>| p.map_or(0, |p| p.0 as u32 + 1);
        let s = self.phone_states as u32;
        let triphone = (allophone.phoneme.0 as u32 * (n + 1) + context(allophone.history)) * (n + 1)
            + context(allophone.future);
        n * s + triphone * s + phone_state as u32
    }

    fn transition_model_index(&self, allophone: &Allophone, _phone_state: u8, sub_state: u8) -> u8 {
        if self.is_silence(allophone.phoneme) {
            transition::SILENCE
        } else if sub_state == 0 {
            transition::PHONE0
        } else {
            transition::PHONE1
        }
    }

    fn transition_models(&self) -> &[StateTransitionModel] {
        &self.transition_models
    }

    fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(b"hmm-acoustic-model");
        hasher.update((self.context_dependent.len() as u32).to_le_bytes());
        for &cd in &self.context_dependent {
            hasher.update([cd as u8]);
        }
        hasher.update(self.silence.map_or(u32::MAX, |p| p.0 as u32).to_le_bytes());
        hasher.update([
            self.phone_states,
            self.sub_states,
            self.across_word as u8,
            self.triphones as u8,
        ]);
        Fingerprint(hasher.finalize().into())
    }
}

/// Builder for [`HmmAcousticModel`].
#[derive(Debug, Clone)]
pub struct HmmAcousticModelBuilder {
    model: HmmAcousticModel,
}

impl HmmAcousticModelBuilder {
    fn new(lexicon: &Lexicon) -> Self {
        let context_dependent = (0..lexicon.n_phonemes())
            .map(|i| lexicon.is_context_dependent(PhonemeId(i as u16)))
            .collect();
        let phone = StateTransitionModel::new(
            transition::DEFAULT_LOOP,
            transition::DEFAULT_FORWARD,
            transition::DEFAULT_SKIP,
            transition::DEFAULT_EXIT,
        );
        let mut entry_m2 = StateTransitionModel::entry();
        entry_m2[TransitionType::Skip] = transition::DEFAULT_SKIP;
        let silence = StateTransitionModel::new(
            transition::DEFAULT_LOOP,
            transition::DEFAULT_FORWARD,
            Score::INFINITY,
            transition::DEFAULT_EXIT,
        );

        let mut transition_models = vec![phone; transition::N_TRANSITION_MODELS];
        transition_models[transition::ENTRY_M1 as usize] = StateTransitionModel::entry();
        transition_models[transition::ENTRY_M2 as usize] = entry_m2;
        transition_models[transition::SILENCE as usize] = silence;

        Self {
            model: HmmAcousticModel {
                context_dependent,
                silence: lexicon.silence_phoneme(),
                phone_states: 3,
                sub_states: 1,
                across_word: false,
                triphones: false,
                transition_models,
            },
        }
    }

    pub fn phone_states(mut self, n: u8) -> Self {
        self.model.phone_states = n.max(1);
        self
    }

    pub fn sub_states(mut self, n: u8) -> Self {
        self.model.sub_states = n.max(1);
        self
    }

    /// Use triphone emissions for context-dependent phonemes.
    pub fn triphones(mut self, enabled: bool) -> Self {
        self.model.triphones = enabled;
        self
    }

    /// Model phonetic context across word boundaries.
    pub fn across_word(mut self, enabled: bool) -> Self {
        self.model.across_word = enabled;
        self
    }

    pub fn transition_model(mut self, index: u8, model: StateTransitionModel) -> Self {
        if let Some(slot) = self.model.transition_models.get_mut(index as usize) {
            *slot = model;
        }
        self
    }

    pub fn build(self) -> HmmAcousticModel {
        self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::lexicon::{LexiconBuilder, SILENCE_LEMMA};
    use crate::types::WordId;

    fn lexicon() -> Lexicon {
        let mut b = LexiconBuilder::new();
        b.add_phoneme("si", false).unwrap();
        b.add_phoneme("a", true).unwrap();
        b.add_phoneme("b", true).unwrap();
        let sil = b.add_lemma("[SILENCE]", None);
        b.add_pronunciation(sil, "si", 0.0).unwrap();
        b.set_special_lemma(SILENCE_LEMMA, sil);
        let w = b.add_lemma("ab", Some(WordId(0)));
        b.add_pronunciation(w, "a b", 0.0).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn test_monophone_layout() {
        let lex = lexicon();
        let am = HmmAcousticModel::builder(&lex).phone_states(2).build();
        assert_eq!(am.n_emissions(), 6);
        assert_eq!(am.n_phone_states(PhonemeId(0)), 1);
        assert_eq!(am.n_phone_states(PhonemeId(1)), 2);

        let a = Allophone {
            phoneme: PhonemeId(1),
            history: Some(PhonemeId(2)),
            future: None,
            boundary: boundary::INITIAL_PHONE,
        };
        assert_eq!(am.emission_index(&a, 1), 3);
        assert_eq!(am.transition_model_index(&a, 1, 0), transition::PHONE0);
    }

    #[test]
    fn test_triphone_layout_distinguishes_contexts() {
        let lex = lexicon();
        let am = HmmAcousticModel::builder(&lex).triphones(true).build();
        let left = Allophone {
            phoneme: PhonemeId(1),
            history: None,
            future: Some(PhonemeId(2)),
            boundary: boundary::INITIAL_PHONE,
        };
        let right = Allophone {
            history: Some(PhonemeId(0)),
            ..left
        };
        let e1 = am.emission_index(&left, 0);
        let e2 = am.emission_index(&right, 0);
        assert_ne!(e1, e2);
        assert!(e1 < am.n_emissions() && e2 < am.n_emissions());

        // context-independent phonemes ignore context
        let sil = Allophone {
            phoneme: PhonemeId(0),
            history: Some(PhonemeId(1)),
            future: None,
            boundary: 0,
        };
        assert_eq!(am.emission_index(&sil, 0), 0);
        assert_eq!(am.transition_model_index(&sil, 0, 0), transition::SILENCE);
    }

    #[test]
    fn test_transition_table() {
        let lex = lexicon();
        let am = HmmAcousticModel::builder(&lex)
            .transition_model(transition::PHONE0, StateTransitionModel::new(1.0, 2.0, 3.0, 4.0))
            .build();
        let tm = &am.transition_models()[transition::PHONE0 as usize];
        assert_eq!(tm[TransitionType::Exit], 4.0);
        let entry = &am.transition_models()[transition::ENTRY_M1 as usize];
        assert!(entry[TransitionType::Loop].is_infinite());
        assert_eq!(entry[TransitionType::Forward], 0.0);
    }

    #[test]
    fn test_fingerprint_tracks_topology() {
        let lex = lexicon();
        let a = HmmAcousticModel::builder(&lex).build();
        let b = HmmAcousticModel::builder(&lex).across_word(true).build();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), HmmAcousticModel::builder(&lex).build().fingerprint());
    }

    #[test]
    fn test_frame_scores() {
        let scores = vec![1.0, 2.0];
        let view = FrameScores(&scores);
        assert_eq!(view.n_emissions(), 2);
        assert_eq!(view.score(1), 2.0);
        assert_eq!(scores.score(0), 1.0);
    }
}
