//! Strong typing with newtypes for domain concepts.
//!
//! This module provides type-safe wrappers around the integer identifiers
//! that flow between the lexicon, the acoustic model, the language model and
//! the search, so that a phoneme can never be passed where a lemma is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Negative log-probability. Lower is better.
pub type Score = f32;

/// Index of a feature frame.
pub type TimeframeIndex = u32;

/// Node of the state tree.
pub type StateId = u32;

/// Distance of a tree node from its root.
pub type Depth = i16;

/// Index into the acoustic model's emission score vector.
pub type EmissionIndex = u32;

/// Phoneme identifier in the lexicon's inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhonemeId(pub u16);

impl PhonemeId {
    /// Get the phoneme index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PhonemeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phoneme_{}", self.0)
    }
}

/// Lemma (dictionary entry) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LemmaId(pub u32);

impl LemmaId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LemmaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lemma_{}", self.0)
    }
}

/// A (lemma, phoneme sequence) pairing, the unit a word end refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PronunciationId(pub u32);

impl PronunciationId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PronunciationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pron_{}", self.0)
    }
}

/// Language model token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WordId(pub u32);

impl WordId {
    /// Sentence begin marker used to pad short histories.
    pub const SENTENCE_BEGIN: Self = Self(u32::MAX - 1);

    /// Sentence end marker.
    pub const SENTENCE_END: Self = Self(u32::MAX - 2);

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for WordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SENTENCE_BEGIN => write!(f, "<s>"),
            Self::SENTENCE_END => write!(f, "</s>"),
            Self(id) => write!(f, "word_{}", id),
        }
    }
}

/// Score split into its acoustic and language model parts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreVector {
    pub acoustic: Score,
    pub lm: Score,
}

impl ScoreVector {
    pub fn new(acoustic: Score, lm: Score) -> Self {
        Self { acoustic, lm }
    }

    /// Combined score used for all comparisons.
    pub fn total(self) -> Score {
        self.acoustic + self.lm
    }
}

impl Add for ScoreVector {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.acoustic + rhs.acoustic, self.lm + rhs.lm)
    }
}

impl AddAssign for ScoreVector {
    fn add_assign(&mut self, rhs: Self) {
        self.acoustic += rhs.acoustic;
        self.lm += rhs.lm;
    }
}

impl Sub for ScoreVector {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.acoustic - rhs.acoustic, self.lm - rhs.lm)
    }
}

impl fmt::Display for ScoreVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3} (am {:.3}, lm {:.3})", self.total(), self.acoustic, self.lm)
    }
}

/// Phonetic context across a word boundary: the final phoneme of the
/// previous word and the initial phoneme of the next one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transit {
    pub final_phoneme: Option<PhonemeId>,
    pub initial_phoneme: Option<PhonemeId>,
}

impl Transit {
    pub fn new(final_phoneme: Option<PhonemeId>, initial_phoneme: Option<PhonemeId>) -> Self {
        Self {
            final_phoneme,
            initial_phoneme,
        }
    }

    /// True for the context-free boundary.
    pub fn is_unconstrained(self) -> bool {
        self.final_phoneme.is_none() && self.initial_phoneme.is_none()
    }
}

/// SHA-256 digest identifying a model's content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_vector_arithmetic() {
        let a = ScoreVector::new(1.5, 2.0);
        let b = ScoreVector::new(0.5, 1.0);
        assert_eq!((a + b).total(), 5.0);
        assert_eq!((a - b), ScoreVector::new(1.0, 1.0));

        let mut c = a;
        c += b;
        assert_eq!(c, ScoreVector::new(2.0, 3.0));
    }

    #[test]
    fn test_word_id_markers() {
        assert_eq!(WordId::SENTENCE_BEGIN.to_string(), "<s>");
        assert_eq!(WordId::SENTENCE_END.to_string(), "</s>");
        assert_eq!(WordId(7).to_string(), "word_7");
        assert_ne!(WordId::SENTENCE_BEGIN, WordId::SENTENCE_END);
    }

    #[test]
    fn test_transit() {
        assert!(Transit::default().is_unconstrained());
        let t = Transit::new(Some(PhonemeId(1)), Some(PhonemeId(2)));
        assert!(!t.is_unconstrained());
    }

    #[test]
    fn test_fingerprint_display() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[1] = 0x01;
        assert_eq!(Fingerprint(bytes).to_string(), "ab01000000000000");
    }
}
