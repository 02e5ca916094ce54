//! Hypotheses of one decoding session.
//!
//! State hypotheses live in one flat vector, grouped by tree copy: every
//! active copy owns the contiguous range `begin..end`. Expansion writes the
//! successor hypotheses of all copies into a second vector and swaps.
//! Word-end hypotheses are rebuilt every frame from the states carrying
//! exits and start or update the tree copy of their new LM history at the
//! next frame.

use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tracing::debug;

use crate::models::{FrameScorer, History, LanguageModel, Lexicon, TransitionType};
use crate::search::histogram::Histogram;
use crate::search::lookahead::{ContextLookahead, LanguageModelLookahead, LookaheadHandle};
use crate::search::state_tree::{StateTree, INVALID_ACOUSTIC_MODEL};
use crate::search::trace::{Trace, TraceArena, TraceId};
use crate::types::{LemmaId, PronunciationId, Score, ScoreVector, StateId, TimeframeIndex};

/// Index into the trace list of a tree copy.
type EntryTrace = u32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct StateHypothesis {
    pub state: StateId,
    pub trace: EntryTrace,
    pub score: Score,
    /// Score plus lookahead; the pruning criterion.
    pub prospect: Score,
}

#[derive(Debug, Clone)]
struct LmCacheItem {
    score: Score,
    history: History,
}

/// A tree copy: the hypotheses sharing one LM history.
#[derive(Debug)]
struct TreeInstance {
    history: History,
    lookahead: Option<LookaheadHandle>,
    lm_cache: FxHashMap<PronunciationId, LmCacheItem>,
    traces: Vec<TraceId>,
    entries: Vec<StateHypothesis>,
    begin: usize,
    end: usize,
    /// Frame at which the copy lost its last hypothesis.
    empty_since: Option<TimeframeIndex>,
}

impl TreeInstance {
    fn new(history: History) -> Self {
        Self {
            history,
            lookahead: None,
            lm_cache: FxHashMap::default(),
            traces: Vec::new(),
            entries: Vec::new(),
            begin: 0,
            end: 0,
            empty_since: None,
        }
    }

    fn n_state_hypotheses(&self) -> usize {
        self.end - self.begin + self.entries.len()
    }

    fn enter(&mut self, trace: TraceId, entry: StateId, score: Score) {
        self.entries.push(StateHypothesis {
            state: entry,
            trace: self.traces.len() as EntryTrace,
            score,
            prospect: score,
        });
        self.traces.push(trace);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct WordEndHypothesis {
    pub history: History,
    pub transit_entry: StateId,
    pub pronunciation: Option<PronunciationId>,
    pub score: ScoreVector,
    pub trace: TraceId,
}

/// Scores the search needs beyond the tree.
#[derive(Debug, Clone)]
pub(crate) struct LmScorer {
    pub lexicon: Arc<Lexicon>,
    pub lm: Arc<dyn LanguageModel>,
    pub pronunciation_scale: Score,
}

impl LmScorer {
    /// LM and pronunciation score of `pronunciation` after `history`, and
    /// the extended history. Lemmas without LM token keep the history.
    fn extension(&self, history: &History, pronunciation: PronunciationId) -> (Score, History) {
        let mut score =
            self.pronunciation_scale * self.lexicon.lemma_pronunciation(pronunciation).score;
        match self.lexicon.lm_token(pronunciation) {
            Some(token) => {
                score += self.lm.scale() * self.lm.score(history, token);
                (score, self.lm.extended_history(history, token))
            }
            None => (score, history.clone()),
        }
    }

    fn sentence_end_score(&self, history: &History) -> Score {
        self.lm.scale() * self.lm.sentence_end_score(history)
    }
}

impl WordEndHypothesis {
    fn add_lm_score(&mut self, scorer: &LmScorer) {
        if let Some(p) = self.pronunciation {
            let (score, history) = scorer.extension(&self.history, p);
            self.score.lm += score;
            self.history = history;
        }
    }

    fn add_lm_score_cached(
        &mut self,
        scorer: &LmScorer,
        cache: &mut FxHashMap<PronunciationId, LmCacheItem>,
    ) {
        let Some(p) = self.pronunciation else {
            return;
        };
        let item = match cache.entry(p) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let (score, history) = scorer.extension(&self.history, p);
                e.insert(LmCacheItem { score, history })
            }
        };
        self.score.lm += item.score;
        self.history = item.history.clone();
    }
}

/// Hypothesis expansion of one frame.
struct Expansion<'a> {
    tree: &'a StateTree,
    hyps: &'a mut Vec<StateHypothesis>,
    state_index: &'a mut [u32],
    /// First hypothesis of the tree copy being expanded.
    first_new: usize,
    lookahead: Option<ContextLookahead<'a>>,
    anticipated: bool,
    beam: Score,
    best: Score,
    threshold: Score,
}

impl Expansion<'_> {
    fn activate_or_update(&mut self, state: StateId, trace: EntryTrace, score: Score) {
        let mut prospect = score;
        if self.anticipated {
            if let Some(la) = &self.lookahead {
                prospect += la.score(state);
            }
            if prospect > self.threshold {
                return;
            }
        }
        let shi = self.state_index[state as usize] as usize;
        if shi >= self.hyps.len() || shi < self.first_new || self.hyps[shi].state != state {
            self.state_index[state as usize] = self.hyps.len() as u32;
            self.hyps.push(StateHypothesis {
                state,
                trace,
                score,
                prospect,
            });
        } else {
            let sh = &mut self.hyps[shi];
            // ties go to the earlier entry
            if score < sh.score || (score == sh.score && trace < sh.trace) {
                sh.score = score;
                sh.prospect = prospect;
                sh.trace = trace;
            }
        }
        if self.anticipated && prospect < self.best {
            self.best = prospect;
            self.threshold = prospect + self.beam;
        }
    }

    fn expand_state(&mut self, sh: &StateHypothesis) {
        let tdp = *self.tree.transition_model(sh.state);

        let score = sh.score + tdp[TransitionType::Loop];
        if score < Score::INFINITY {
            self.activate_or_update(sh.state, sh.trace, score);
        }

        let score = sh.score + tdp[TransitionType::Forward];
        if score < Score::INFINITY {
            for s in self.tree.successors(sh.state) {
                self.activate_or_update(s, sh.trace, score);
            }
        }

        let score = sh.score + tdp[TransitionType::Skip];
        if score < Score::INFINITY {
            for s in self.tree.successors2(sh.state) {
                self.activate_or_update(s, sh.trace, score);
            }
        }
    }
}

fn best_index(scores: impl Iterator<Item = Score>) -> Option<usize> {
    let mut best: Option<(usize, Score)> = None;
    for (i, s) in scores.enumerate() {
        if best.map_or(true, |(_, b)| s < b) {
            best = Some((i, s));
        }
    }
    best.map(|(i, _)| i)
}

fn context_lookahead<'a>(
    lookahead: Option<&'a LanguageModelLookahead>,
    handle: Option<&LookaheadHandle>,
) -> Option<ContextLookahead<'a>> {
    match (lookahead, handle) {
        (Some(la), Some(h)) => Some(la.table(h)),
        _ => None,
    }
}

#[derive(Debug)]
pub(crate) struct SearchSpace {
    tree: Arc<StateTree>,
    scorer: LmScorer,
    lookahead: Option<LanguageModelLookahead>,
    traces: TraceArena,
    /// Total amount subtracted from state scores by rescaling.
    global_score_offset: f64,

    hyps: Vec<StateHypothesis>,
    new_hyps: Vec<StateHypothesis>,
    best: Option<usize>,
    state_index: Vec<u32>,

    active: Vec<TreeInstance>,
    tree_map: FxHashMap<History, usize>,
    tree_deletion_latency: u32,

    word_ends: Vec<WordEndHypothesis>,
    /// Word ends of the previous frame; valid until the frame completes.
    previous_word_ends: Vec<WordEndHypothesis>,
    recombination: FxHashMap<(History, StateId), usize>,

    state_histogram: Histogram,
    word_end_histogram: Histogram,
    pruning_threshold: Score,
    anticipated_pruning: bool,
}

impl SearchSpace {
    pub fn new(
        tree: Arc<StateTree>,
        scorer: LmScorer,
        lookahead: Option<LanguageModelLookahead>,
        state_histogram_bins: u32,
        word_end_histogram_bins: u32,
    ) -> Self {
        let n_states = tree.n_states() as usize;
        Self {
            tree,
            scorer,
            lookahead,
            traces: TraceArena::new(),
            global_score_offset: 0.0,
            hyps: Vec::new(),
            new_hyps: Vec::new(),
            best: None,
            state_index: vec![u32::MAX; n_states],
            active: Vec::new(),
            tree_map: FxHashMap::default(),
            tree_deletion_latency: 0,
            word_ends: Vec::new(),
            previous_word_ends: Vec::new(),
            recombination: FxHashMap::default(),
            state_histogram: Histogram::new(state_histogram_bins),
            word_end_histogram: Histogram::new(word_end_histogram_bins),
            pruning_threshold: Score::INFINITY,
            anticipated_pruning: false,
        }
    }

    pub fn set_pruning_threshold(&mut self, threshold: Score) {
        self.pruning_threshold = threshold;
    }

    pub fn set_anticipated_lookahead_pruning(&mut self, enabled: bool) {
        self.anticipated_pruning = enabled;
    }

    pub fn set_tree_deletion_latency(&mut self, latency: u32) {
        self.tree_deletion_latency = latency;
    }

    /// Drop all hypotheses and traces. Lookahead tables go back to the
    /// cache.
    pub fn clear(&mut self) {
        for at in self.active.drain(..) {
            if let (Some(la), Some(handle)) = (self.lookahead.as_mut(), at.lookahead) {
                la.release(handle);
            }
        }
        self.tree_map.clear();
        self.global_score_offset = 0.0;
        self.hyps.clear();
        self.new_hyps.clear();
        self.best = None;
        self.word_ends.clear();
        self.previous_word_ends.clear();
        self.recombination.clear();
        self.state_histogram.clear();
        self.word_end_histogram.clear();
        self.traces.clear();
    }

    /// Rebind the language model. Clears the search space.
    pub fn set_language_model(&mut self, lm: Arc<dyn LanguageModel>) -> crate::error::Result<()> {
        self.clear();
        if let Some(la) = self.lookahead.as_mut() {
            la.set_language_model(Arc::clone(&lm))?;
        }
        self.scorer.lm = lm;
        Ok(())
    }

    pub fn n_state_hypotheses(&self) -> usize {
        self.hyps.len()
    }

    pub fn n_word_end_hypotheses(&self) -> usize {
        self.word_ends.len()
    }

    pub fn n_active_trees(&self) -> usize {
        self.active.len()
    }

    pub fn traces(&self) -> &TraceArena {
        &self.traces
    }

    pub fn lookahead(&self) -> Option<&LanguageModelLookahead> {
        self.lookahead.as_ref()
    }

    pub fn lookahead_mut(&mut self) -> Option<&mut LanguageModelLookahead> {
        self.lookahead.as_mut()
    }

    fn offset_score(&self, mut score: ScoreVector) -> ScoreVector {
        score.acoustic += self.global_score_offset as Score;
        score
    }

    fn activate_or_update_tree(
        &mut self,
        trace: TraceId,
        history: &History,
        entry: StateId,
        score: Score,
    ) {
        let index = match self.tree_map.get(history) {
            Some(&index) => index,
            None => {
                self.active.push(TreeInstance::new(history.clone()));
                let index = self.active.len() - 1;
                self.tree_map.insert(history.clone(), index);
                index
            }
        };
        self.active[index].enter(trace, entry, score);
    }

    /// Whether the copy at `index` is to be dropped. Empty copies stay for
    /// the deletion latency and lose their traces meanwhile.
    fn may_deactivate_tree(&mut self, index: usize, time: TimeframeIndex) -> bool {
        let latency = self.tree_deletion_latency;
        let at = &mut self.active[index];
        if at.n_state_hypotheses() > 0 {
            at.empty_since = None;
            return false;
        }
        let since = *at.empty_since.get_or_insert(time);
        if time - since < latency {
            at.traces.clear();
            return false;
        }
        if let (Some(la), Some(handle)) = (self.lookahead.as_mut(), at.lookahead.take()) {
            la.release(handle);
        }
        self.tree_map.remove(&at.history);
        true
    }

    /// Start or update tree copies for the word ends of the last frame.
    pub fn start_new_trees(&mut self) {
        let word_ends = std::mem::take(&mut self.word_ends);
        for weh in &word_ends {
            self.activate_or_update_tree(
                weh.trace,
                &weh.history,
                weh.transit_entry,
                weh.score.total(),
            );
        }
        self.word_ends = word_ends;
    }

    /// Expand all hypotheses of all tree copies by one frame.
    pub fn expand(&mut self) {
        std::mem::swap(&mut self.word_ends, &mut self.previous_word_ends);
        self.word_ends.clear();
        self.new_hyps.clear();

        let Self {
            tree,
            lookahead,
            active,
            hyps,
            new_hyps,
            state_index,
            pruning_threshold,
            anticipated_pruning,
            ..
        } = self;
        let lookahead = lookahead.as_ref();
        let mut expansion = Expansion {
            tree: tree.as_ref(),
            hyps: new_hyps,
            state_index,
            first_new: 0,
            lookahead: None,
            anticipated: *anticipated_pruning,
            beam: *pruning_threshold,
            best: Score::INFINITY,
            threshold: Score::INFINITY,
        };
        for at in active.iter_mut() {
            expansion.first_new = expansion.hyps.len();
            expansion.lookahead = context_lookahead(lookahead, at.lookahead.as_ref());
            for sh in at.entries.drain(..) {
                expansion.expand_state(&sh);
            }
            for sh in &hyps[at.begin..at.end] {
                expansion.expand_state(sh);
            }
            at.begin = expansion.first_new;
            at.end = expansion.hyps.len();
        }
        std::mem::swap(hyps, new_hyps);
        self.best = None;
    }

    pub fn add_acoustic_scores(&mut self, scorer: &dyn FrameScorer) {
        let tree = self.tree.as_ref();
        for sh in &mut self.hyps {
            let emission = tree.state_desc(sh.state).acoustic_model;
            debug_assert_ne!(emission, INVALID_ACOUSTIC_MODEL);
            let s = scorer.score(emission);
            sh.score += s;
            sh.prospect += s;
        }
        self.best = best_index(self.hyps.iter().map(|sh| sh.prospect));
    }

    /// Attach lookahead tables to copies lacking one. Copies with at most
    /// `laziness` hypotheses only take tables that are already cached.
    pub fn activate_lm_lookahead(&mut self, laziness: u32) {
        let Some(la) = self.lookahead.as_mut() else {
            return;
        };
        for at in self.active.iter_mut().filter(|at| at.lookahead.is_none()) {
            at.lookahead = if at.n_state_hypotheses() > laziness as usize {
                Some(la.get_lookahead(&at.history))
            } else {
                la.try_to_get_lookahead(&at.history)
            };
        }
    }

    /// Set prospects to score plus lookahead and find the best hypothesis.
    pub fn determine_pruning_criterion(&mut self) {
        if self.anticipated_pruning {
            // prospects were set during expansion
            self.best = None;
            return;
        }
        let lookahead = self.lookahead.as_ref();
        for at in &self.active {
            let table = context_lookahead(lookahead, at.lookahead.as_ref());
            for sh in &mut self.hyps[at.begin..at.end] {
                sh.prospect = sh.score + table.map_or(0.0, |t| t.score(sh.state));
            }
        }
        self.best = best_index(self.hyps.iter().map(|sh| sh.prospect));
    }

    pub fn best_state_hypothesis(&mut self) -> Option<StateHypothesis> {
        if self.best.is_none() {
            self.best = best_index(self.hyps.iter().map(|sh| sh.prospect));
        }
        self.best.map(|i| self.hyps[i])
    }

    pub fn minimum_state_score(&mut self) -> Score {
        self.best_state_hypothesis()
            .map_or(Score::INFINITY, |sh| sh.prospect)
    }

    /// Threshold keeping about `n` hypotheses with prospect in `[min, max]`.
    pub fn quantile_state_score(&mut self, min: Score, max: Score, n: u32) -> Score {
        self.state_histogram.clear();
        self.state_histogram.set_limits(min, max);
        for sh in &self.hyps {
            self.state_histogram.insert(sh.prospect);
        }
        self.state_histogram.quantile(n)
    }

    pub fn count_states_within(&self, threshold: Score) -> usize {
        self.hyps.iter().filter(|sh| sh.prospect <= threshold).count()
    }

    /// Remove hypotheses with prospect above `threshold` and retire empty
    /// tree copies.
    pub fn prune_states(&mut self, threshold: Score, time: TimeframeIndex) {
        let mut hyp_out = 0;
        let mut tree_out = 0;
        for tree_in in 0..self.active.len() {
            let (begin, end) = (self.active[tree_in].begin, self.active[tree_in].end);
            debug_assert!(begin >= hyp_out);
            let first = hyp_out;
            for i in begin..end {
                if self.hyps[i].prospect <= threshold {
                    self.hyps[hyp_out] = self.hyps[i];
                    hyp_out += 1;
                }
            }
            self.active[tree_in].begin = first;
            self.active[tree_in].end = hyp_out;
            if self.may_deactivate_tree(tree_in, time) {
                continue;
            }
            if tree_out != tree_in {
                self.active.swap(tree_out, tree_in);
                if let Some(index) = self.tree_map.get_mut(&self.active[tree_out].history) {
                    *index = tree_out;
                }
            }
            tree_out += 1;
        }
        self.hyps.truncate(hyp_out);
        self.active.truncate(tree_out);
        self.best = None;
    }

    /// Subtract `offset` from all state scores.
    pub fn rescale(&mut self, offset: Score) {
        debug_assert!(self.word_ends.is_empty());
        for sh in &mut self.hyps {
            sh.score -= offset;
        }
        self.global_score_offset += offset as f64;
        self.best = None;
    }

    /// Create word-end hypotheses for all exits of active states.
    pub fn find_word_ends(&mut self) {
        debug_assert!(self.word_ends.is_empty());
        let Self {
            tree,
            scorer,
            active,
            hyps,
            traces,
            word_ends,
            ..
        } = self;
        for at in active.iter_mut() {
            for sh in &hyps[at.begin..at.end] {
                let exits = tree.word_ends(sh.state);
                if exits.is_empty() {
                    continue;
                }
                let trace = at.traces[sh.trace as usize];
                let lm = traces.get(trace).score.lm;
                let exit_score = tree.transition_model(sh.state)[TransitionType::Exit];
                for exit in exits {
                    let mut weh = WordEndHypothesis {
                        history: at.history.clone(),
                        transit_entry: exit.transit_entry,
                        pronunciation: Some(exit.pronunciation),
                        score: ScoreVector::new(sh.score - lm + exit_score, lm),
                        trace,
                    };
                    weh.add_lm_score_cached(scorer, &mut at.lm_cache);
                    word_ends.push(weh);
                }
            }
        }
    }

    pub fn minimum_word_end_score(&self) -> Score {
        self.word_ends
            .iter()
            .map(|weh| weh.score.total())
            .fold(Score::INFINITY, Score::min)
    }

    pub fn quantile_word_end_score(&mut self, min: Score, max: Score, n: u32) -> Score {
        self.word_end_histogram.clear();
        self.word_end_histogram.set_limits(min, max);
        for weh in &self.word_ends {
            self.word_end_histogram.insert(weh.score.total());
        }
        self.word_end_histogram.quantile(n)
    }

    pub fn prune_word_ends(&mut self, threshold: Score) {
        self.word_ends.retain(|weh| weh.score.total() <= threshold);
    }

    /// Record a trace for every word end.
    pub fn create_traces(&mut self, time: TimeframeIndex) {
        let offset = self.global_score_offset as Score;
        for weh in &mut self.word_ends {
            let mut score = weh.score;
            score.acoustic += offset;
            weh.trace = self.traces.insert(Trace::new(
                Some(weh.trace),
                weh.pronunciation,
                time,
                score,
                self.tree.describe_root_state(weh.transit_entry),
            ));
        }
    }

    /// Add word ends for empty pronunciations at the transit entries of the
    /// current word ends. Returns the number added.
    pub fn hypothesize_epsilon_pronunciations(&mut self, threshold: Score) -> usize {
        let tree = Arc::clone(&self.tree);
        let n = self.word_ends.len();
        for w in 0..n {
            let state = self.word_ends[w].transit_entry;
            let exit_score = tree.transition_model(state)[TransitionType::Exit];
            for exit in tree.word_ends(state) {
                let mut weh = self.word_ends[w].clone();
                weh.pronunciation = Some(exit.pronunciation);
                weh.add_lm_score(&self.scorer);
                weh.score.acoustic += exit_score;
                if weh.score.total() > threshold {
                    continue;
                }
                let time = self.traces.get(weh.trace).time;
                let score = self.offset_score(weh.score);
                weh.trace = self.traces.insert(Trace::new(
                    Some(weh.trace),
                    weh.pronunciation,
                    time,
                    score,
                    tree.describe_root_state(weh.transit_entry),
                ));
                self.word_ends.push(weh);
            }
        }
        self.word_ends.len() - n
    }

    /// Keep the best word end per (history, transit entry). With lattices
    /// the losers are chained as siblings of the winner's trace.
    pub fn recombine_word_ends(&mut self, create_lattice: bool) {
        self.recombination.clear();
        let mut out = 0;
        for i in 0..self.word_ends.len() {
            let key = (
                self.word_ends[i].history.clone(),
                self.word_ends[i].transit_entry,
            );
            match self.recombination.get(&key) {
                Some(&j) => {
                    let (head, tail) = self.word_ends.split_at_mut(i);
                    let a = &tail[0];
                    let b = &mut head[j];
                    debug_assert!(self.traces.get(a.trace).sibling.is_none());
                    if b.score.total() > a.score.total() {
                        if create_lattice {
                            self.traces.get_mut(a.trace).sibling = Some(b.trace);
                        }
                        b.pronunciation = a.pronunciation;
                        b.score = a.score;
                        b.trace = a.trace;
                    } else if create_lattice {
                        let sibling = self.traces.get(b.trace).sibling;
                        self.traces.get_mut(a.trace).sibling = sibling;
                        self.traces.get_mut(b.trace).sibling = Some(a.trace);
                    }
                }
                None => {
                    self.word_ends.swap(out, i);
                    self.recombination.insert(key, out);
                    out += 1;
                }
            }
        }
        self.word_ends.truncate(out);
    }

    /// Drop silence alternatives from the sibling chains of all word ends.
    /// The best hypothesis is kept even when it ends in silence.
    pub fn optimize_silence_in_word_lattice(&mut self, silence: LemmaId) {
        let lexicon = &self.scorer.lexicon;
        for weh in &self.word_ends {
            let mut t = weh.trace;
            while let Some(s) = self.traces.get(t).sibling {
                let sibling = self.traces.get(s);
                let is_silence = sibling
                    .pronunciation
                    .is_some_and(|p| lexicon.lemma_pronunciation(p).lemma == silence);
                if is_silence {
                    let next = sibling.sibling;
                    self.traces.get_mut(t).sibling = next;
                } else {
                    t = s;
                }
            }
        }
    }

    /// The empty word end every utterance starts from.
    pub fn add_startup_word_end_hypothesis(&mut self, history: History, time: TimeframeIndex) {
        let root = self.tree.root();
        let score = ScoreVector::default();
        let recorded = self.offset_score(score);
        let trace = self.traces.insert(Trace::new(
            None,
            None,
            time,
            recorded,
            self.tree.describe_root_state(root),
        ));
        self.word_ends.push(WordEndHypothesis {
            history,
            transit_entry: root,
            pronunciation: None,
            score,
            trace,
        });
    }

    fn chain_sentence_end(&mut self, best: &mut Option<TraceId>, t: TraceId, create_lattice: bool) {
        match *best {
            Some(b) if self.traces.get(b).score.total() <= self.traces.get(t).score.total() => {
                if create_lattice {
                    let sibling = self.traces.get(b).sibling;
                    self.traces.get_mut(t).sibling = sibling;
                    self.traces.get_mut(b).sibling = Some(t);
                }
            }
            previous => {
                if create_lattice {
                    self.traces.get_mut(t).sibling = previous;
                }
                *best = Some(t);
            }
        }
    }

    /// Best sentence end over the word ends entering a non-coarticulated
    /// root. With `previous` the word ends of the last completed frame are
    /// used instead of the current ones.
    pub fn sentence_end(
        &mut self,
        time: TimeframeIndex,
        create_lattice: bool,
        previous: bool,
    ) -> Option<TraceId> {
        let word_ends = if previous {
            std::mem::take(&mut self.previous_word_ends)
        } else {
            std::mem::take(&mut self.word_ends)
        };
        let mut best = None;
        for weh in &word_ends {
            if !self.tree.is_uncoarticulated_root(weh.transit_entry) {
                continue;
            }
            let mut score = self.offset_score(weh.score);
            score.lm += self.scorer.sentence_end_score(&weh.history);
            let t = self.traces.insert(Trace::new(
                Some(weh.trace),
                None,
                time,
                score,
                self.tree.describe_root_state(weh.transit_entry),
            ));
            self.chain_sentence_end(&mut best, t, create_lattice);
        }
        if previous {
            self.previous_word_ends = word_ends;
        } else {
            self.word_ends = word_ends;
        }
        best
    }

    /// Sentence end through the best state of every tree copy, for when no
    /// word end survived.
    pub fn sentence_end_fallback(
        &mut self,
        time: TimeframeIndex,
        create_lattice: bool,
    ) -> Option<TraceId> {
        let mut candidates = Vec::new();
        for at in &self.active {
            let hyps = &self.hyps[at.begin..at.end];
            let Some(b) = best_index(hyps.iter().map(|sh| sh.score)) else {
                continue;
            };
            candidates.push((hyps[b], at.traces[hyps[b].trace as usize], at.history.clone()));
        }
        let mut best = None;
        for (sh, pre, history) in candidates {
            let lm = self.traces.get(pre).score.lm;
            let score = ScoreVector::new(
                self.global_score_offset as Score + sh.score - lm,
                lm + self.scorer.sentence_end_score(&history),
            );
            let t = self.traces.insert(Trace::new(
                Some(pre),
                None,
                time,
                score,
                self.tree.describe_root_state(sh.state),
            ));
            self.chain_sentence_end(&mut best, t, create_lattice);
        }
        best
    }

    /// Most recent trace shared by every live hypothesis.
    pub fn last_unambiguous_trace(&self) -> Option<TraceId> {
        let mut pending: Vec<TraceId> = self
            .word_ends
            .iter()
            .map(|weh| weh.trace)
            .chain(self.active.iter().flat_map(|at| {
                self.hyps[at.begin..at.end]
                    .iter()
                    .map(|sh| at.traces[sh.trace as usize])
            }))
            .collect();
        let last = pending.pop()?;

        // 0: unseen, 1: visited, n >= 2: position n - 2 on the chain of `last`
        let mut marks: FxHashMap<TraceId, usize> = FxHashMap::default();
        let mut chain = Vec::new();
        for t in self.traces.ancestors(last) {
            marks.insert(t, 2 + chain.len());
            chain.push(t);
        }

        let mut limit = 2;
        while let Some(start) = pending.pop() {
            for t in self.traces.ancestors(start) {
                match marks.insert(t, 1) {
                    Some(1) => break,
                    Some(mark) => {
                        limit = limit.max(mark);
                        break;
                    }
                    None => {}
                }
            }
        }
        chain.get(limit - 2).copied()
    }

    /// Cut `t` loose from its history so it acts as a new sentence begin.
    pub fn kill_trace(&mut self, t: TraceId) {
        let trace = self.traces.get_mut(t);
        trace.predecessor = None;
        trace.sibling = None;
        trace.pronunciation = None;
    }

    /// Drop entry traces no state hypothesis refers to. Keeps the order of
    /// the remaining ones.
    fn compact_entry_traces(&mut self) {
        let mut remap: Vec<EntryTrace> = Vec::new();
        for at in &mut self.active {
            debug_assert!(at.entries.is_empty());
            remap.clear();
            remap.resize(at.traces.len(), EntryTrace::MAX);
            for sh in &self.hyps[at.begin..at.end] {
                remap[sh.trace as usize] = 0;
            }
            let mut n = 0;
            for (i, r) in remap.iter_mut().enumerate() {
                if *r != EntryTrace::MAX {
                    at.traces[n] = at.traces[i];
                    *r = n as EntryTrace;
                    n += 1;
                }
            }
            at.traces.truncate(n);
            for sh in &mut self.hyps[at.begin..at.end] {
                sh.trace = remap[sh.trace as usize];
            }
        }
    }

    /// Reclaim traces unreachable from live hypotheses and `extra` roots.
    pub fn collect_garbage(&mut self, extra: &[TraceId]) -> usize {
        self.compact_entry_traces();
        let roots = self
            .word_ends
            .iter()
            .map(|weh| weh.trace)
            .chain(self.active.iter().flat_map(|at| at.traces.iter().copied()))
            .chain(extra.iter().copied());
        let reclaimed = self.traces.collect(roots);
        debug!(reclaimed, live = self.traces.len(), "trace garbage collection");
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LookaheadConfig, StateTreeConfig};
    use crate::search::lookahead::LookaheadStructure;
    use crate::testutil;

    fn search_space() -> (SearchSpace, History) {
        let lexicon = Arc::new(testutil::prefix_lexicon());
        let am = testutil::acoustic_model(&lexicon, false);
        let tree = Arc::new(StateTree::build(&lexicon, &am, &StateTreeConfig::default()).unwrap());
        let config = LookaheadConfig {
            enabled: true,
            cache_size_high: 10,
            ..LookaheadConfig::default()
        };
        let structure = Arc::new(LookaheadStructure::build(&tree, &lexicon, &config, 1.0).unwrap());
        let lm: Arc<dyn LanguageModel> = Arc::new(testutil::prefix_bigram(&lexicon));
        let start = lm.start_history();
        let lookahead = LanguageModelLookahead::new(&config, structure, Arc::clone(&lm));
        let scorer = LmScorer {
            lexicon,
            lm,
            pronunciation_scale: 1.0,
        };
        (SearchSpace::new(tree, scorer, Some(lookahead), 100, 100), start)
    }

    /// Start the copy of `history` and expand its root.
    fn enter(ss: &mut SearchSpace, history: &History, time: TimeframeIndex) {
        ss.add_startup_word_end_hypothesis(history.clone(), time);
        ss.start_new_trees();
        ss.expand();
    }

    fn table_id(ss: &SearchSpace) -> Option<usize> {
        ss.active[0].lookahead.as_ref().map(LookaheadHandle::table_id)
    }

    #[test]
    fn test_empty_copy_kept_within_latency() {
        let (mut ss, start) = search_space();
        ss.set_tree_deletion_latency(3);
        enter(&mut ss, &start, 0);
        ss.activate_lm_lookahead(0);
        let table = table_id(&ss);
        assert!(table.is_some());

        ss.prune_states(Score::NEG_INFINITY, 1);
        assert_eq!(ss.n_active_trees(), 1);
        assert_eq!(ss.n_state_hypotheses(), 0);
        assert!(ss.active[0].traces.is_empty());

        enter(&mut ss, &start, 2);
        ss.prune_states(Score::INFINITY, 2);
        assert_eq!(ss.n_active_trees(), 1);
        assert!(ss.n_state_hypotheses() > 0);
        // the copy kept its table, nothing was looked up again
        assert_eq!(table_id(&ss), table);
        let la = ss.lookahead().unwrap();
        assert_eq!(la.statistics().misses, 1);
        assert_eq!(la.statistics().free_hits, 0);
        assert_eq!(la.n_free_tables(), 0);
    }

    #[test]
    fn test_empty_copy_released_after_latency() {
        for latency in [0, 3] {
            let (mut ss, start) = search_space();
            ss.set_tree_deletion_latency(latency);
            enter(&mut ss, &start, 0);
            ss.activate_lm_lookahead(0);

            for time in 1..=latency + 1 {
                ss.prune_states(Score::NEG_INFINITY, time);
                let expired = time == latency + 1;
                assert_eq!(ss.n_active_trees(), usize::from(!expired), "time {}", time);
            }
            assert_eq!(ss.lookahead().unwrap().n_free_tables(), 1);

            enter(&mut ss, &start, latency + 2);
            assert_eq!(table_id(&ss), None);
            ss.activate_lm_lookahead(0);
            assert!(table_id(&ss).is_some());
            let stats = ss.lookahead().unwrap().statistics();
            assert_eq!(stats.misses, 1);
            assert_eq!(stats.free_hits, 1);
        }
    }

    #[test]
    fn test_lazy_copies_only_take_cached_tables() {
        let (mut ss, start) = search_space();
        enter(&mut ss, &start, 0);
        let n = ss.n_state_hypotheses() as u32;
        assert!(n > 0);

        // small copies do without a table, scores are not anticipated
        ss.activate_lm_lookahead(n);
        assert_eq!(table_id(&ss), None);
        assert_eq!(ss.lookahead().unwrap().n_tables(), 0);
        ss.determine_pruning_criterion();
        assert!(ss.hyps.iter().all(|sh| sh.prospect == sh.score));

        ss.activate_lm_lookahead(n - 1);
        assert!(table_id(&ss).is_some());
        ss.determine_pruning_criterion();
        assert!(ss.hyps.iter().any(|sh| sh.prospect > sh.score));
        assert!(ss.hyps.iter().all(|sh| sh.prospect >= sh.score));

        // a cached table is used regardless of the copy size
        ss.clear();
        enter(&mut ss, &start, 0);
        ss.activate_lm_lookahead(u32::MAX);
        assert!(table_id(&ss).is_some());
        let stats = ss.lookahead().unwrap().statistics();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.free_hits, 1);
    }
}
