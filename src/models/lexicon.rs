//! Pronunciation lexicon.
//!
//! Phoneme sequences are stored once and shared by every lemma that uses
//! them; a [`PronunciationId`] names one (lemma, phoneme sequence) pairing
//! together with its pronunciation score.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{DecoderError, Result};
use crate::types::{Fingerprint, LemmaId, PhonemeId, PronunciationId, Score, WordId};

/// Name of the special lemma used for silence.
pub const SILENCE_LEMMA: &str = "silence";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phoneme {
    pub symbol: String,
    /// Whether the acoustic realisation depends on neighbouring phonemes.
    pub context_dependent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lemma {
    pub orth: String,
    /// Token scored by the language model. Lemmas without a token (silence,
    /// noises) only contribute their pronunciation score.
    pub lm_token: Option<WordId>,
    pub pronunciations: Vec<PronunciationId>,
}

/// A phoneme sequence and the lemmas it realises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pronunciation {
    pub phonemes: Vec<PhonemeId>,
    pub lemma_pronunciations: Vec<PronunciationId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LemmaPronunciation {
    pub lemma: LemmaId,
    /// Index of the shared phoneme sequence.
    pub pronunciation: u32,
    pub score: Score,
}

/// Immutable lexicon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lexicon {
    phonemes: Vec<Phoneme>,
    lemmas: Vec<Lemma>,
    pronunciations: Vec<Pronunciation>,
    lemma_pronunciations: Vec<LemmaPronunciation>,
    special_lemmas: BTreeMap<String, LemmaId>,
}

impl Lexicon {
    pub fn n_phonemes(&self) -> usize {
        self.phonemes.len()
    }

    pub fn phoneme(&self, id: PhonemeId) -> &Phoneme {
        &self.phonemes[id.index()]
    }

    pub fn is_context_dependent(&self, id: PhonemeId) -> bool {
        self.phonemes[id.index()].context_dependent
    }

    pub fn phoneme_id(&self, symbol: &str) -> Option<PhonemeId> {
        self.phonemes
            .iter()
            .position(|p| p.symbol == symbol)
            .map(|i| PhonemeId(i as u16))
    }

    pub fn n_lemmas(&self) -> usize {
        self.lemmas.len()
    }

    pub fn lemma(&self, id: LemmaId) -> &Lemma {
        &self.lemmas[id.index()]
    }

    pub fn lemma_by_orth(&self, orth: &str) -> Option<LemmaId> {
        self.lemmas
            .iter()
            .position(|l| l.orth == orth)
            .map(|i| LemmaId(i as u32))
    }

    pub fn special_lemma(&self, name: &str) -> Option<LemmaId> {
        self.special_lemmas.get(name).copied()
    }

    /// Number of distinct phoneme sequences.
    pub fn n_pronunciations(&self) -> usize {
        self.pronunciations.len()
    }

    pub fn pronunciation(&self, index: u32) -> &Pronunciation {
        &self.pronunciations[index as usize]
    }

    pub fn pronunciations(&self) -> impl Iterator<Item = (u32, &Pronunciation)> {
        self.pronunciations
            .iter()
            .enumerate()
            .map(|(i, p)| (i as u32, p))
    }

    pub fn n_lemma_pronunciations(&self) -> usize {
        self.lemma_pronunciations.len()
    }

    pub fn lemma_pronunciation(&self, id: PronunciationId) -> &LemmaPronunciation {
        &self.lemma_pronunciations[id.index()]
    }

    pub fn lemma_pronunciations(&self) -> impl Iterator<Item = (PronunciationId, &LemmaPronunciation)> {
        self.lemma_pronunciations
            .iter()
            .enumerate()
            .map(|(i, lp)| (PronunciationId(i as u32), lp))
    }

    /// Phonemes of a lemma pronunciation.
    pub fn phonemes_of(&self, id: PronunciationId) -> &[PhonemeId] {
        &self.pronunciations[self.lemma_pronunciation(id).pronunciation as usize].phonemes
    }

    /// Language model token of a lemma pronunciation's lemma.
    pub fn lm_token(&self, id: PronunciationId) -> Option<WordId> {
        self.lemma(self.lemma_pronunciation(id).lemma).lm_token
    }

    pub fn orth(&self, id: PronunciationId) -> &str {
        &self.lemma(self.lemma_pronunciation(id).lemma).orth
    }

    /// Distinct first phonemes of all non-empty pronunciations, ascending.
    pub fn initial_phonemes(&self) -> Vec<PhonemeId> {
        self.pronunciations
            .iter()
            .filter_map(|p| p.phonemes.first().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Distinct context-dependent last phonemes, ascending. Only these
    /// need coarticulated word boundaries.
    pub fn final_phonemes(&self) -> Vec<PhonemeId> {
        self.pronunciations
            .iter()
            .filter_map(|p| p.phonemes.last().copied())
            .filter(|&p| self.is_context_dependent(p))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// The phoneme realising silence: the silence lemma's single phoneme,
    /// otherwise the first context-independent phoneme.
    pub fn silence_phoneme(&self) -> Option<PhonemeId> {
        self.special_lemma(SILENCE_LEMMA)
            .and_then(|lemma| {
                self.lemma(lemma)
                    .pronunciations
                    .iter()
                    .map(|&lp| self.phonemes_of(lp))
                    .find(|phonemes| phonemes.len() == 1)
                    .map(|phonemes| phonemes[0])
            })
            .or_else(|| {
                self.phonemes
                    .iter()
                    .position(|p| !p.context_dependent)
                    .map(|i| PhonemeId(i as u16))
            })
    }

    /// Content digest used to detect stale persisted trees.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(b"lexicon");
        hasher.update((self.phonemes.len() as u32).to_le_bytes());
        for phoneme in &self.phonemes {
            hasher.update(phoneme.symbol.as_bytes());
            hasher.update([0, phoneme.context_dependent as u8]);
        }
        hasher.update((self.pronunciations.len() as u32).to_le_bytes());
        for pron in &self.pronunciations {
            hasher.update((pron.phonemes.len() as u32).to_le_bytes());
            for p in &pron.phonemes {
                hasher.update(p.0.to_le_bytes());
            }
        }
        hasher.update((self.lemma_pronunciations.len() as u32).to_le_bytes());
        for lp in &self.lemma_pronunciations {
            hasher.update(lp.lemma.0.to_le_bytes());
            hasher.update(lp.pronunciation.to_le_bytes());
        }
        Fingerprint(hasher.finalize().into())
    }
}

/// Incremental lexicon construction.
#[derive(Debug, Default)]
pub struct LexiconBuilder {
    phonemes: Vec<Phoneme>,
    phoneme_index: HashMap<String, PhonemeId>,
    lemmas: Vec<Lemma>,
    pronunciations: Vec<Pronunciation>,
    pronunciation_index: HashMap<Vec<PhonemeId>, u32>,
    lemma_pronunciations: Vec<LemmaPronunciation>,
    special_lemmas: BTreeMap<String, LemmaId>,
}

impl LexiconBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_phoneme(&mut self, symbol: &str, context_dependent: bool) -> Result<PhonemeId> {
        if symbol.is_empty() || symbol.contains(char::is_whitespace) {
            return Err(DecoderError::Lexicon(format!(
                "invalid phoneme symbol {:?}",
                symbol
            )));
        }
        if self.phoneme_index.contains_key(symbol) {
            return Err(DecoderError::Lexicon(format!(
                "duplicate phoneme {:?}",
                symbol
            )));
        }
        if self.phonemes.len() >= u16::MAX as usize {
            return Err(DecoderError::Lexicon("phoneme inventory too large".to_string()));
        }
        let id = PhonemeId(self.phonemes.len() as u16);
        self.phonemes.push(Phoneme {
            symbol: symbol.to_string(),
            context_dependent,
        });
        self.phoneme_index.insert(symbol.to_string(), id);
        Ok(id)
    }

    pub fn add_lemma(&mut self, orth: &str, lm_token: Option<WordId>) -> LemmaId {
        let id = LemmaId(self.lemmas.len() as u32);
        self.lemmas.push(Lemma {
            orth: orth.to_string(),
            lm_token,
            pronunciations: Vec::new(),
        });
        id
    }

    /// Add a whitespace-separated phoneme string as a pronunciation of
    /// `lemma`. An empty string adds an epsilon pronunciation.
    pub fn add_pronunciation(
        &mut self,
        lemma: LemmaId,
        phonemes: &str,
        score: Score,
    ) -> Result<PronunciationId> {
        if lemma.index() >= self.lemmas.len() {
            return Err(DecoderError::Lexicon(format!("unknown {}", lemma)));
        }
        if !score.is_finite() {
            return Err(DecoderError::Lexicon(format!(
                "pronunciation score of {} must be finite",
                self.lemmas[lemma.index()].orth
            )));
        }
        let sequence = phonemes
            .split_whitespace()
            .map(|symbol| {
                self.phoneme_index.get(symbol).copied().ok_or_else(|| {
                    DecoderError::Lexicon(format!("unknown phoneme {:?}", symbol))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if sequence.len() > i16::MAX as usize {
            return Err(DecoderError::Lexicon("pronunciation too long".to_string()));
        }

        let pron = match self.pronunciation_index.get(&sequence) {
            Some(&index) => index,
            None => {
                let index = self.pronunciations.len() as u32;
                self.pronunciations.push(Pronunciation {
                    phonemes: sequence.clone(),
                    lemma_pronunciations: Vec::new(),
                });
                self.pronunciation_index.insert(sequence, index);
                index
            }
        };
        if self.pronunciations[pron as usize]
            .lemma_pronunciations
            .iter()
            .any(|lp| self.lemma_pronunciations[lp.index()].lemma == lemma)
        {
            return Err(DecoderError::Lexicon(format!(
                "duplicate pronunciation {:?} for {}",
                phonemes, self.lemmas[lemma.index()].orth
            )));
        }

        let id = PronunciationId(self.lemma_pronunciations.len() as u32);
        self.lemma_pronunciations.push(LemmaPronunciation {
            lemma,
            pronunciation: pron,
            score,
        });
        self.pronunciations[pron as usize].lemma_pronunciations.push(id);
        self.lemmas[lemma.index()].pronunciations.push(id);
        Ok(id)
    }

    pub fn set_special_lemma(&mut self, name: &str, lemma: LemmaId) {
        self.special_lemmas.insert(name.to_string(), lemma);
    }

    pub fn build(self) -> Result<Lexicon> {
        if self.phonemes.is_empty() {
            return Err(DecoderError::Lexicon("empty phoneme inventory".to_string()));
        }
        if self.lemma_pronunciations.is_empty() {
            return Err(DecoderError::Lexicon("lexicon has no pronunciations".to_string()));
        }
        Ok(Lexicon {
            phonemes: self.phonemes,
            lemmas: self.lemmas,
            pronunciations: self.pronunciations,
            lemma_pronunciations: self.lemma_pronunciations,
            special_lemmas: self.special_lemmas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_lexicon() -> Lexicon {
        let mut b = LexiconBuilder::new();
        b.add_phoneme("si", false).unwrap();
        b.add_phoneme("a", true).unwrap();
        b.add_phoneme("b", true).unwrap();
        let sil = b.add_lemma("[SILENCE]", None);
        b.add_pronunciation(sil, "si", 0.0).unwrap();
        b.set_special_lemma(SILENCE_LEMMA, sil);
        let ab = b.add_lemma("ab", Some(WordId(0)));
        b.add_pronunciation(ab, "a b", 0.0).unwrap();
        let abb = b.add_lemma("abb", Some(WordId(1)));
        b.add_pronunciation(abb, "a b", 0.5).unwrap();
        let ba = b.add_lemma("ba", Some(WordId(2)));
        b.add_pronunciation(ba, "b a", 0.0).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn test_shared_phoneme_sequences() {
        let lex = small_lexicon();
        assert_eq!(lex.n_lemma_pronunciations(), 4);
        assert_eq!(lex.n_pronunciations(), 3);
        let shared = lex.lemma_pronunciation(PronunciationId(1)).pronunciation;
        assert_eq!(lex.pronunciation(shared).lemma_pronunciations.len(), 2);
        assert_eq!(lex.lm_token(PronunciationId(2)), Some(WordId(1)));
        assert_eq!(lex.lm_token(PronunciationId(0)), None);
        assert_eq!(lex.orth(PronunciationId(3)), "ba");
    }

    #[test]
    fn test_boundary_phonemes() {
        let lex = small_lexicon();
        let si = lex.phoneme_id("si").unwrap();
        let a = lex.phoneme_id("a").unwrap();
        let b = lex.phoneme_id("b").unwrap();
        assert_eq!(lex.initial_phonemes(), vec![si, a, b]);
        assert_eq!(lex.final_phonemes(), vec![a, b]);
        assert_eq!(lex.silence_phoneme(), Some(si));
    }

    #[test]
    fn test_builder_rejects_bad_input() {
        let mut b = LexiconBuilder::new();
        b.add_phoneme("a", true).unwrap();
        assert!(b.add_phoneme("a", false).is_err());
        let w = b.add_lemma("w", None);
        assert!(b.add_pronunciation(w, "a x", 0.0).is_err());
        b.add_pronunciation(w, "a", 0.0).unwrap();
        assert!(b.add_pronunciation(w, "a", 1.0).is_err());
        assert!(b.add_pronunciation(LemmaId(9), "a", 0.0).is_err());
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = small_lexicon();
        let b = small_lexicon();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut builder = LexiconBuilder::new();
        builder.add_phoneme("a", true).unwrap();
        let w = builder.add_lemma("w", None);
        builder.add_pronunciation(w, "a", 0.0).unwrap();
        assert_ne!(a.fingerprint(), builder.build().unwrap().fingerprint());
    }
}
