//! Recognition output: best path and word lattice.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::trace::{TraceArena, TraceId};
use crate::error::{DecoderError, Result};
use crate::models::Lexicon;
use crate::types::{PronunciationId, ScoreVector, TimeframeIndex, Transit};

/// One word boundary of a path. The first item is the sentence begin and
/// the last one the sentence end; both carry no pronunciation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracebackItem {
    pub pronunciation: Option<PronunciationId>,
    /// Frame at which the word ends.
    pub time: TimeframeIndex,
    /// Accumulated score up to this boundary.
    pub score: ScoreVector,
    pub transit: Transit,
}

/// Ordered word sequence with accumulated scores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Traceback {
    pub items: Vec<TracebackItem>,
}

impl Traceback {
    /// Follow predecessors from `end` back to the sentence begin.
    pub fn from_trace(traces: &TraceArena, end: TraceId) -> Self {
        let mut items: Vec<TracebackItem> = traces
            .ancestors(end)
            .map(|t| {
                let trace = traces.get(t);
                TracebackItem {
                    pronunciation: trace.pronunciation,
                    time: trace.time,
                    score: trace.score,
                    transit: trace.transit,
                }
            })
            .collect();
        items.reverse();
        Self { items }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn last(&self) -> Option<&TracebackItem> {
        self.items.last()
    }

    /// Pronunciations along the path, without sentence boundaries.
    pub fn pronunciations(&self) -> impl Iterator<Item = PronunciationId> + '_ {
        self.items.iter().filter_map(|i| i.pronunciation)
    }

    /// Orthographies of all words on the path.
    pub fn words<'a>(&'a self, lexicon: &'a Lexicon) -> Vec<&'a str> {
        self.pronunciations().map(|p| lexicon.orth(p)).collect()
    }

    /// Words joined by blanks, skipping lemmas without LM token such as
    /// silence.
    pub fn transcript(&self, lexicon: &Lexicon) -> String {
        self.pronunciations()
            .filter(|&p| lexicon.lm_token(p).is_some())
            .map(|p| lexicon.orth(p))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Total score at the end of the path.
    pub fn score(&self) -> Option<ScoreVector> {
        self.items.last().map(|i| i.score)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WordBoundary {
    pub time: TimeframeIndex,
    pub transit: Transit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatticeArc {
    pub from: usize,
    pub to: usize,
    /// `None` on the arc into the final state.
    pub pronunciation: Option<PronunciationId>,
    /// Score of this arc alone.
    pub score: ScoreVector,
}

/// Acyclic word graph. State 0 is initial, state 1 final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordLattice {
    pub boundaries: Vec<WordBoundary>,
    pub arcs: Vec<LatticeArc>,
}

impl WordLattice {
    pub const INITIAL: usize = 0;
    pub const FINAL: usize = 1;

    /// Lattice of all word ends reachable from the sentence end `end`,
    /// alternatives included through sibling links.
    pub fn from_trace(traces: &TraceArena, end: TraceId) -> Result<Self> {
        let mut lattice = Self {
            boundaries: vec![
                WordBoundary {
                    time: 0,
                    transit: Transit::default(),
                };
                2
            ],
            arcs: Vec::new(),
        };
        let mut state_of: FxHashMap<TraceId, usize> = FxHashMap::default();
        state_of.insert(end, Self::FINAL);
        let mut stack = vec![end];
        let mut initial = None;

        while let Some(tt) = stack.pop() {
            let target = state_of[&tt];
            let trace = traces.get(tt);
            lattice.boundaries[target] = WordBoundary {
                time: trace.time,
                transit: trace.transit,
            };
            for st in std::iter::once(tt).chain(traces.siblings(tt)) {
                let alternative = traces.get(st);
                let Some(pt) = alternative.predecessor else {
                    return Err(DecoderError::ContractViolation(format!(
                        "lattice arc into trace {} has no predecessor",
                        st
                    )));
                };
                let predecessor = traces.get(pt);
                let source = if predecessor.predecessor.is_some() {
                    *state_of.entry(pt).or_insert_with(|| {
                        lattice.boundaries.push(WordBoundary {
                            time: predecessor.time,
                            transit: predecessor.transit,
                        });
                        stack.push(pt);
                        lattice.boundaries.len() - 1
                    })
                } else {
                    initial = Some(pt);
                    Self::INITIAL
                };
                lattice.arcs.push(LatticeArc {
                    from: source,
                    to: target,
                    pronunciation: alternative.pronunciation,
                    score: alternative.score - predecessor.score,
                });
            }
        }

        let initial = initial.ok_or_else(|| {
            DecoderError::ContractViolation("lattice does not reach the sentence begin".to_string())
        })?;
        let trace = traces.get(initial);
        lattice.boundaries[Self::INITIAL] = WordBoundary {
            time: trace.time,
            transit: trace.transit,
        };
        Ok(lattice)
    }

    pub fn n_states(&self) -> usize {
        self.boundaries.len()
    }

    /// JSON export of the word graph.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Read a word graph written by [`WordLattice::to_json`]. Arcs must
    /// refer to existing boundaries.
    pub fn from_json(json: &str) -> Result<Self> {
        let lattice: Self = serde_json::from_str(json)?;
        let n = lattice.n_states();
        if n < 2 {
            return Err(DecoderError::ContractViolation(format!(
                "word lattice has {} states",
                n
            )));
        }
        if let Some(arc) = lattice.arcs.iter().find(|a| a.from >= n || a.to >= n) {
            return Err(DecoderError::ContractViolation(format!(
                "lattice arc {} -> {} outside {} states",
                arc.from, arc.to, n
            )));
        }
        Ok(lattice)
    }

    /// Whether the lattice is a single path.
    pub fn is_linear(&self) -> bool {
        let mut out_degree = vec![0u32; self.n_states()];
        let mut in_degree = vec![0u32; self.n_states()];
        for arc in &self.arcs {
            out_degree[arc.from] += 1;
            in_degree[arc.to] += 1;
        }
        out_degree.iter().all(|&d| d <= 1) && in_degree.iter().all(|&d| d <= 1)
    }

    /// The path of a linear lattice. Lattices with alternatives are
    /// rejected.
    pub fn linear_traceback(&self) -> Result<Traceback> {
        if !self.is_linear() {
            return Err(DecoderError::ContractViolation(
                "word lattice is not linear".to_string(),
            ));
        }
        let mut next: Vec<Option<&LatticeArc>> = vec![None; self.n_states()];
        for arc in &self.arcs {
            next[arc.from] = Some(arc);
        }
        let mut items = vec![TracebackItem {
            pronunciation: None,
            time: self.boundaries[Self::INITIAL].time,
            score: ScoreVector::default(),
            transit: self.boundaries[Self::INITIAL].transit,
        }];
        let mut score = ScoreVector::default();
        let mut state = Self::INITIAL;
        while let Some(arc) = next[state] {
            score += arc.score;
            items.push(TracebackItem {
                pronunciation: arc.pronunciation,
                time: self.boundaries[arc.to].time,
                score,
                transit: self.boundaries[arc.to].transit,
            });
            state = arc.to;
        }
        if state != Self::FINAL {
            return Err(DecoderError::ContractViolation(format!(
                "linear lattice path ends in state {}",
                state
            )));
        }
        Ok(Traceback { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::trace::Trace;

    fn arena() -> (TraceArena, TraceId) {
        // begin -> w0 -> w1 -> end
        let mut traces = TraceArena::new();
        let t = Transit::default();
        let begin = traces.insert(Trace::new(None, None, 0, ScoreVector::default(), t));
        let w0 = traces.insert(Trace::new(
            Some(begin),
            Some(PronunciationId(0)),
            3,
            ScoreVector::new(3.0, 1.0),
            t,
        ));
        let w1 = traces.insert(Trace::new(
            Some(w0),
            Some(PronunciationId(1)),
            7,
            ScoreVector::new(8.0, 2.0),
            t,
        ));
        let end = traces.insert(Trace::new(Some(w1), None, 8, ScoreVector::new(8.0, 3.0), t));
        (traces, end)
    }

    #[test]
    fn test_traceback_order() {
        let (traces, end) = arena();
        let tb = Traceback::from_trace(&traces, end);
        assert_eq!(tb.len(), 4);
        assert_eq!(tb.items[0].pronunciation, None);
        assert_eq!(
            tb.pronunciations().collect::<Vec<_>>(),
            vec![PronunciationId(0), PronunciationId(1)]
        );
        assert_eq!(tb.score(), Some(ScoreVector::new(8.0, 3.0)));
        let times: Vec<_> = tb.items.iter().map(|i| i.time).collect();
        assert_eq!(times, vec![0, 3, 7, 8]);
    }

    #[test]
    fn test_lattice_of_single_path_is_linear() {
        let (traces, end) = arena();
        let lattice = WordLattice::from_trace(&traces, end).unwrap();
        assert_eq!(lattice.n_states(), 4);
        assert_eq!(lattice.arcs.len(), 3);
        assert!(lattice.is_linear());
        let tb = lattice.linear_traceback().unwrap();
        assert_eq!(tb, Traceback::from_trace(&traces, end));
    }

    #[test]
    fn test_alternatives_make_lattice_non_linear() {
        let (mut traces, end) = arena();
        let w1 = traces.get(end).predecessor.unwrap();
        let w0 = traces.get(w1).predecessor.unwrap();
        let alternative = traces.insert(Trace::new(
            Some(w0),
            Some(PronunciationId(2)),
            7,
            ScoreVector::new(9.0, 2.0),
            Transit::default(),
        ));
        traces.get_mut(w1).sibling = Some(alternative);

        let lattice = WordLattice::from_trace(&traces, end).unwrap();
        assert_eq!(lattice.arcs.len(), 4);
        assert!(!lattice.is_linear());
        assert!(matches!(
            lattice.linear_traceback(),
            Err(DecoderError::ContractViolation(_))
        ));
        let alternative_arc = lattice
            .arcs
            .iter()
            .find(|a| a.pronunciation == Some(PronunciationId(2)))
            .unwrap();
        assert_eq!(alternative_arc.score, ScoreVector::new(6.0, 1.0));
    }

    #[test]
    fn test_lattice_json_export() {
        let (traces, end) = arena();
        let lattice = WordLattice::from_trace(&traces, end).unwrap();
        let json = lattice.to_json().unwrap();
        assert_eq!(WordLattice::from_json(&json).unwrap(), lattice);

        assert!(matches!(WordLattice::from_json("{"), Err(DecoderError::Json(_))));

        let mut dangling = lattice.clone();
        dangling.arcs[0].to = lattice.n_states();
        assert!(matches!(
            WordLattice::from_json(&dangling.to_json().unwrap()),
            Err(DecoderError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_traceback_serializes() {
        let (traces, end) = arena();
        let tb = Traceback::from_trace(&traces, end);
        let json = serde_json::to_string(&tb).unwrap();
        let back: Traceback = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tb);
    }
}
