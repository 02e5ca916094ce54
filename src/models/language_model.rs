//! Language model interface, a back-off n-gram model and a word grammar.

use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{DecoderError, Result};
use crate::types::{Score, WordId};

/// Immutable word history. Cheap to clone and usable as a map key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct History(Arc<[WordId]>);

impl History {
    pub fn new(tokens: Vec<WordId>) -> Self {
        Self(tokens.into())
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn tokens(&self) -> &[WordId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep the `limit` most recent tokens, padding short histories at the
    /// front with the sentence begin marker.
    pub fn truncated(&self, limit: u32) -> Self {
        let limit = limit as usize;
        if self.0.len() == limit {
            return self.clone();
        }
        let mut tokens = Vec::with_capacity(limit);
        if self.0.len() < limit {
            tokens.resize(limit - self.0.len(), WordId::SENTENCE_BEGIN);
            tokens.extend_from_slice(&self.0);
        } else {
            tokens.extend_from_slice(&self.0[self.0.len() - limit..]);
        }
        Self::new(tokens)
    }
}

impl fmt::Debug for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "History({})", self)
    }
}

impl fmt::Display for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, w) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", w)?;
        }
        Ok(())
    }
}

/// Scores words given a history.
pub trait LanguageModel: Send + Sync + fmt::Debug {
    fn start_history(&self) -> History;

    fn extended_history(&self, history: &History, word: WordId) -> History;

    /// History reduced to its `limit` most recent words.
    fn reduced_history(&self, history: &History, limit: u32) -> History {
        history.truncated(limit)
    }

    /// Unscaled negative log-probability of `word` following `history`.
    fn score(&self, history: &History, word: WordId) -> Score;

    /// Unscaled score of ending the sentence after `history`.
    fn sentence_end_score(&self, history: &History) -> Score {
        self.score(history, WordId::SENTENCE_END)
    }

    /// Weight applied to every LM score by the search.
    fn scale(&self) -> Score;
}

#[derive(Debug, Clone, Copy)]
struct NgramEntry {
    score: Score,
    backoff: Score,
}

/// Back-off n-gram model held in memory.
#[derive(Debug, Clone)]
pub struct NgramLanguageModel {
    order: u8,
    scale: Score,
    unknown_score: Score,
    entries: FxHashMap<Vec<WordId>, NgramEntry>,
}

impl NgramLanguageModel {
    pub fn builder(order: u8) -> NgramLanguageModelBuilder {
        NgramLanguageModelBuilder {
            model: NgramLanguageModel {
                order: order.max(1),
                scale: 1.0,
                unknown_score: 99.0,
                entries: FxHashMap::default(),
            },
        }
    }

    pub fn order(&self) -> u8 {
        self.order
    }

    fn context_length(&self) -> usize {
        self.order as usize - 1
    }
}

impl LanguageModel for NgramLanguageModel {
    fn start_history(&self) -> History {
        History::new(vec![WordId::SENTENCE_BEGIN; self.context_length()])
    }

    fn extended_history(&self, history: &History, word: WordId) -> History {
        let mut tokens = history.tokens().to_vec();
        tokens.push(word);
        History::new(tokens).truncated(self.context_length() as u32)
    }

    fn score(&self, history: &History, word: WordId) -> Score {
        let context = history.tokens();
        let mut backoff = 0.0;
        for k in (0..=context.len().min(self.context_length())).rev() {
            let suffix = &context[context.len() - k..];
            let mut key = suffix.to_vec();
            key.push(word);
            if let Some(entry) = self.entries.get(&key) {
                return backoff + entry.score;
            }
            if k > 0 {
                if let Some(entry) = self.entries.get(suffix) {
                    backoff += entry.backoff;
                }
            }
        }
        backoff + self.unknown_score
    }

    fn scale(&self) -> Score {
        self.scale
    }
}

/// Builder for [`NgramLanguageModel`].
#[derive(Debug, Clone)]
pub struct NgramLanguageModelBuilder {
    model: NgramLanguageModel,
}

impl NgramLanguageModelBuilder {
    pub fn scale(mut self, scale: Score) -> Self {
        self.model.scale = scale;
        self
    }

    /// Score of words not covered by any unigram.
    pub fn unknown_score(mut self, score: Score) -> Self {
        self.model.unknown_score = score;
        self
    }

    /// Add an n-gram with its score and back-off weight.
    pub fn ngram(mut self, words: &[WordId], score: Score, backoff: Score) -> Self {
        self.model
            .entries
            .insert(words.to_vec(), NgramEntry { score, backoff });
        self
    }

    pub fn build(self) -> Result<NgramLanguageModel> {
        let order = self.model.order as usize;
        if let Some(words) = self.model.entries.keys().find(|k| k.is_empty() || k.len() > order) {
            return Err(DecoderError::Configuration(format!(
                "n-gram of length {} does not fit a model of order {}",
                words.len(),
                order
            )));
        }
        if !self.model.scale.is_finite() || self.model.scale < 0.0 {
            return Err(DecoderError::Configuration(format!(
                "invalid language model scale {}",
                self.model.scale
            )));
        }
        Ok(self.model)
    }
}

/// Finite-state word grammar. The history is the grammar state.
///
/// Words without an arc from the current state score infinity; lemmas
/// without an LM token (silence, noise) are unaffected by the grammar.
#[derive(Debug, Clone)]
pub struct WordGrammar {
    initial: u32,
    arcs: Vec<BTreeMap<WordId, (u32, Score)>>,
    finals: Vec<Option<Score>>,
    scale: Score,
}

const DEAD_STATE: WordId = WordId(u32::MAX);

impl WordGrammar {
    pub fn new(n_states: u32, initial: u32) -> Result<Self> {
        if initial >= n_states {
            return Err(DecoderError::Configuration(format!(
                "grammar initial state {} out of range",
                initial
            )));
        }
        Ok(Self {
            initial,
            arcs: vec![BTreeMap::new(); n_states as usize],
            finals: vec![None; n_states as usize],
            scale: 1.0,
        })
    }

    pub fn with_scale(mut self, scale: Score) -> Self {
        self.scale = scale;
        self
    }

    pub fn add_arc(&mut self, from: u32, word: WordId, to: u32, score: Score) -> Result<()> {
        let n = self.arcs.len() as u32;
        if from >= n || to >= n {
            return Err(DecoderError::Configuration(format!(
                "grammar arc {} -> {} out of range",
                from, to
            )));
        }
        self.arcs[from as usize].insert(word, (to, score));
        Ok(())
    }

    pub fn set_final(&mut self, state: u32, score: Score) -> Result<()> {
        let slot = self.finals.get_mut(state as usize).ok_or_else(|| {
            DecoderError::Configuration(format!("grammar final state {} out of range", state))
        })?;
        *slot = Some(score);
        Ok(())
    }

    fn state_of(history: &History) -> Option<usize> {
        match history.tokens().last() {
            Some(&DEAD_STATE) | None => None,
            Some(w) => Some(w.0 as usize),
        }
    }
}

impl LanguageModel for WordGrammar {
    fn start_history(&self) -> History {
        History::new(vec![WordId(self.initial)])
    }

    fn extended_history(&self, history: &History, word: WordId) -> History {
        let next = Self::state_of(history)
            .and_then(|s| self.arcs[s].get(&word))
            .map_or(DEAD_STATE, |&(to, _)| WordId(to));
        History::new(vec![next])
    }

    fn reduced_history(&self, history: &History, _limit: u32) -> History {
        history.clone()
    }

    fn score(&self, history: &History, word: WordId) -> Score {
        Self::state_of(history)
            .and_then(|s| self.arcs[s].get(&word))
            .map_or(Score::INFINITY, |&(_, score)| score)
    }

    fn sentence_end_score(&self, history: &History) -> Score {
        Self::state_of(history)
            .and_then(|s| self.finals[s])
            .unwrap_or(Score::INFINITY)
    }

    fn scale(&self) -> Score {
        self.scale
    }
}
