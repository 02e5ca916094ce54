//! Word-conditioned tree search.
//!
//! One copy of the lexical prefix tree is kept per (reduced) LM history.
//! Each frame expands all copies, prunes with the lookahead-augmented score,
//! adds acoustic scores and prunes again, then turns states carrying exits
//! into word ends that enter the copy of their extended history at the next
//! frame.

mod search_space;

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use self::search_space::{LmScorer, SearchSpace};
use super::algorithm::{PruningDescriptor, SearchAlgorithm};
use super::lookahead::{LanguageModelLookahead, LookaheadStructure};
use super::state_tree::{StateTree, TreeDependencies};
use super::state_tree_io;
use super::trace::TraceId;
use super::traceback::{Traceback, WordLattice};
use crate::config::{DecoderConfig, LatticeOptimization};
use crate::error::{DecoderError, Result};
use crate::metrics::{self, MetricsTimer, PruningStage};
use crate::models::{
    AcousticModel, FrameScorer, LanguageModel, Lexicon, ModelCombination, SILENCE_LEMMA,
};
use crate::statistics::SearchSpaceStatistics;
use crate::types::{LemmaId, Score, TimeframeIndex};

/// Lifecycle of a search session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No models bound.
    Unbound,
    /// Models bound, waiting for `restart`.
    Idle,
    Feeding,
    /// The search space ran empty; further frames are ignored and the
    /// results come from the sentence-end candidate recorded at that point.
    Exhausted,
    /// The search space ran empty without fallback. Needs a `restart`.
    Failed,
}

#[derive(Debug, Clone)]
struct BoundModels {
    lexicon: Arc<Lexicon>,
    acoustic_model: Arc<dyn AcousticModel>,
    lm: Arc<dyn LanguageModel>,
    pronunciation_scale: Score,
    tree: Arc<StateTree>,
    lookahead_structure: Option<Arc<LookaheadStructure>>,
    silence: Option<LemmaId>,
}

#[derive(Debug)]
pub struct WordConditionedTreeSearch {
    config: DecoderConfig,
    pruning: PruningDescriptor,
    models: Option<BoundModels>,
    search_space: Option<SearchSpace>,
    state: SessionState,
    time: TimeframeIndex,
    /// Sentence end of the current frame, once computed.
    sentence_end: Option<TraceId>,
    statistics: SearchSpaceStatistics,
}

impl WordConditionedTreeSearch {
    pub fn new(config: DecoderConfig) -> Result<Self> {
        config.validate()?;
        metrics::register_metrics();
        let mut pruning = PruningDescriptor::from_config(&config.pruning);
        if !config.search.create_lattice {
            if pruning.lattice_pruning != pruning.lm_pruning
                || pruning.lattice_pruning_limit != pruning.lm_pruning_limit
            {
                info!("no lattice is created, lattice pruning follows lm pruning");
            }
            pruning.lattice_pruning = pruning.lm_pruning;
            pruning.lattice_pruning_limit = pruning.lm_pruning_limit;
        }
        Ok(Self {
            config,
            pruning,
            models: None,
            search_space: None,
            state: SessionState::Unbound,
            time: 0,
            sentence_end: None,
            statistics: SearchSpaceStatistics::default(),
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn statistics(&self) -> &SearchSpaceStatistics {
        &self.statistics
    }

    /// The bound tree, for sharing with further sessions.
    pub fn state_tree(&self) -> Option<&Arc<StateTree>> {
        self.models.as_ref().map(|m| &m.tree)
    }

    pub fn lexicon(&self) -> Option<&Arc<Lexicon>> {
        self.models.as_ref().map(|m| &m.lexicon)
    }

    pub fn n_state_hypotheses(&self) -> usize {
        self.search_space
            .as_ref()
            .map_or(0, |ss| ss.n_state_hypotheses())
    }

    pub fn n_active_trees(&self) -> usize {
        self.search_space.as_ref().map_or(0, |ss| ss.n_active_trees())
    }

    /// Bind models using a tree built elsewhere, e.g. by another session.
    /// The tree must have been built from the same lexicon, acoustic model
    /// and tree configuration.
    pub fn set_model_combination_with_tree(
        &mut self,
        models: &ModelCombination,
        tree: Arc<StateTree>,
    ) -> Result<()> {
        self.check_not_feeding("set_model_combination_with_tree")?;
        let expected = TreeDependencies::new(
            &models.lexicon,
            models.acoustic_model.as_ref(),
            &self.config.state_tree,
        );
        if *tree.dependencies() != expected {
            return Err(DecoderError::Configuration(
                "shared state tree was built from different models".to_string(),
            ));
        }
        self.bind(models, tree)
    }

    fn check_not_feeding(&self, operation: &str) -> Result<()> {
        if self.state == SessionState::Feeding {
            return Err(DecoderError::InvalidState(format!(
                "{} is not allowed while feeding",
                operation
            )));
        }
        Ok(())
    }

    fn bind(&mut self, models: &ModelCombination, tree: Arc<StateTree>) -> Result<()> {
        let silence = models.lexicon.special_lemma(SILENCE_LEMMA);
        if silence.is_none() {
            debug!("lexicon has no silence lemma");
        }
        let lookahead_structure = if self.config.lm_lookahead.enabled {
            Some(Arc::new(LookaheadStructure::build(
                &tree,
                &models.lexicon,
                &self.config.lm_lookahead,
                models.pronunciation_scale,
            )?))
        } else {
            None
        };
        info!(
            states = tree.n_states(),
            lookahead = lookahead_structure.is_some(),
            "models bound"
        );
        self.models = Some(BoundModels {
            lexicon: Arc::clone(&models.lexicon),
            acoustic_model: Arc::clone(&models.acoustic_model),
            lm: Arc::clone(&models.language_model),
            pronunciation_scale: models.pronunciation_scale,
            tree,
            lookahead_structure,
            silence,
        });
        self.search_space = None;
        self.sentence_end = None;
        self.time = 0;
        self.state = SessionState::Idle;
        Ok(())
    }

    fn models(&self) -> Result<&BoundModels> {
        self.models
            .as_ref()
            .ok_or(DecoderError::MissingBinding("model combination"))
    }

    fn create_search_space(&self, models: &BoundModels) -> SearchSpace {
        let lookahead = models.lookahead_structure.as_ref().map(|structure| {
            LanguageModelLookahead::new(
                &self.config.lm_lookahead,
                Arc::clone(structure),
                Arc::clone(&models.lm),
            )
        });
        let scorer = LmScorer {
            lexicon: Arc::clone(&models.lexicon),
            lm: Arc::clone(&models.lm),
            pronunciation_scale: models.pronunciation_scale,
        };
        let mut ss = SearchSpace::new(
            Arc::clone(&models.tree),
            scorer,
            lookahead,
            self.config.pruning.acoustic_pruning_bins,
            self.config.pruning.lm_pruning_bins,
        );
        ss.set_tree_deletion_latency(self.config.search.tree_deletion_latency);
        ss.set_anticipated_lookahead_pruning(self.config.pruning.anticipated_lm_lookahead_pruning);
        ss
    }

    fn search_space_mut(&mut self) -> Result<&mut SearchSpace> {
        self.search_space
            .as_mut()
            .ok_or_else(|| DecoderError::InvalidState("search was not restarted".to_string()))
    }

    fn check_results_available(&self) -> Result<()> {
        match self.state {
            SessionState::Feeding | SessionState::Exhausted => Ok(()),
            SessionState::Unbound => Err(DecoderError::MissingBinding("model combination")),
            SessionState::Idle => Err(DecoderError::InvalidState(
                "search was not restarted".to_string(),
            )),
            SessionState::Failed => Err(DecoderError::InvalidState(
                "search failed, restart required".to_string(),
            )),
        }
    }

    /// Sentence end of the current frame. Falls back to the best state of
    /// every tree copy when no word end reaches a non-coarticulated root.
    fn sentence_end(&mut self) -> Result<TraceId> {
        self.check_results_available()?;
        if let Some(t) = self.sentence_end {
            return Ok(t);
        }
        let frame = self.time;
        if self.state == SessionState::Exhausted {
            return Err(DecoderError::NoSentenceEnd { frame });
        }
        let create_lattice = self.config.search.create_lattice;
        let fallback = self.config.search.sentence_end_fallback;
        let ss = self.search_space_mut()?;
        let t = match ss.sentence_end(frame, create_lattice, false) {
            Some(t) => Some(t),
            None => {
                warn!(frame, "no word end at a sentence boundary");
                if fallback {
                    info!(frame, "using sentence end fallback");
                    ss.sentence_end_fallback(frame, create_lattice)
                } else {
                    None
                }
            }
        };
        let t = t.ok_or(DecoderError::NoSentenceEnd { frame })?;
        self.sentence_end = Some(t);
        Ok(t)
    }

    /// Pre-pruning on prospects before acoustic scores are added, relaxing
    /// the beam while nothing would survive.
    fn prune_before_scoring(&mut self, scorer: &dyn FrameScorer, beam: Score) -> Result<()> {
        let max_relaxations = self.config.search.max_pruning_relaxations;
        let factor = self.config.search.relaxation_factor;
        let offset = self.config.search.relaxation_offset;
        let time = self.time;
        let tree = Arc::clone(&self.models()?.tree);
        let ss = self.search_space.as_mut().ok_or_else(|| {
            DecoderError::InvalidState("search was not restarted".to_string())
        })?;
        let Some(best) = ss.best_state_hypothesis() else {
            return Ok(());
        };
        let emission = tree.state_desc(best.state).acoustic_model;
        let reference = best.prospect + scorer.score(emission);

        let mut beam = beam;
        let mut threshold = (reference + beam).min(Score::MAX);
        let mut relaxations = 0;
        while ss.count_states_within(threshold) == 0 && relaxations < max_relaxations {
            beam = beam * factor + offset;
            threshold = (reference + beam).min(Score::MAX);
            relaxations += 1;
            warn!(frame = time, beam, "pre-pruning removes every hypothesis, relaxing");
            metrics::record_pruning_relaxation();
            self.statistics.pruning_relaxations += 1;
        }
        ss.prune_states(threshold, time);
        Ok(())
    }

    fn prune_states(&mut self) -> Result<()> {
        let beam = self.pruning.acoustic_pruning;
        let limit = self.pruning.acoustic_pruning_limit;
        let time = self.time;
        let ss = self.search_space_mut()?;
        let min = ss.minimum_state_score();
        let threshold = (min + beam).min(Score::MAX);
        ss.prune_states(threshold, time);
        if ss.n_state_hypotheses() > limit as usize && min < threshold {
            let quantile = ss.quantile_state_score(min, threshold, limit);
            ss.prune_states(quantile, time);
            self.statistics
                .acoustic_histogram_pruning
                .record((quantile - min) as f64);
            metrics::record_histogram_threshold("acoustic", quantile - min);
        }
        Ok(())
    }

    /// Beam and histogram pruning of word ends.
    fn prune_word_ends(&mut self, beam: Score, limit: u32) -> Result<()> {
        let ss = self.search_space_mut()?;
        let min = ss.minimum_word_end_score();
        if !min.is_finite() {
            return Ok(());
        }
        let threshold = (min + beam).min(Score::MAX);
        ss.prune_word_ends(threshold);
        if ss.n_word_end_hypotheses() > limit as usize && min < threshold {
            let quantile = ss.quantile_word_end_score(min, threshold, limit);
            ss.prune_word_ends(quantile);
            self.statistics.lm_histogram_pruning.record((quantile - min) as f64);
            metrics::record_histogram_threshold("lm", quantile - min);
        }
        Ok(())
    }

    fn record_states(&mut self, stage: PruningStage) {
        let (hyps, trees) = self
            .search_space
            .as_ref()
            .map_or((0, 0), |ss| (ss.n_state_hypotheses(), ss.n_active_trees()));
        let (h, t) = match stage {
            PruningStage::BeforePruning => (
                &mut self.statistics.states_before_pruning,
                &mut self.statistics.trees_before_pruning,
            ),
            PruningStage::AfterPrePruning => (
                &mut self.statistics.states_after_pre_pruning,
                &mut self.statistics.trees_after_pre_pruning,
            ),
            _ => (
                &mut self.statistics.states_after_pruning,
                &mut self.statistics.trees_after_pruning,
            ),
        };
        h.record(hyps as f64);
        t.record(trees as f64);
        metrics::record_state_hypotheses(stage, hyps, trees);
    }

    /// Every hypothesis is gone. With fallback the best word end of the
    /// last frame becomes the sentence end.
    fn handle_empty_search_space(&mut self) -> Result<()> {
        let frame = self.time;
        metrics::record_empty_search_space();
        if !self.config.search.sentence_end_fallback {
            self.state = SessionState::Failed;
            error!(frame, "search space is empty");
            return Err(DecoderError::EmptySearchSpace { frame });
        }
        let create_lattice = self.config.search.create_lattice;
        let ss = self.search_space_mut()?;
        let candidate = ss.sentence_end(frame, create_lattice, true);
        self.sentence_end = candidate;
        self.state = SessionState::Exhausted;
        warn!(
            frame,
            candidate = candidate.is_some(),
            "search space is empty, keeping the last sentence end"
        );
        Ok(())
    }

    fn feed_frame(&mut self, scorer: &dyn FrameScorer) -> Result<()> {
        let _timer = MetricsTimer::new("decoder_feed_duration_seconds");
        let anticipated = self.config.pruning.anticipated_lm_lookahead_pruning;
        let lookahead_enabled = self.config.lm_lookahead.enabled;
        let laziness = self.config.lm_lookahead.laziness;
        let acoustic_pruning = self.pruning.acoustic_pruning;

        self.sentence_end = None;
        {
            let ss = self.search_space_mut()?;
            ss.start_new_trees();
            if anticipated {
                ss.activate_lm_lookahead(0);
                ss.set_pruning_threshold(acoustic_pruning);
            }
            ss.expand();
        }
        self.time += 1;
        self.record_states(PruningStage::BeforePruning);

        {
            let ss = self.search_space_mut()?;
            if lookahead_enabled && !anticipated {
                ss.activate_lm_lookahead(laziness);
            }
            ss.determine_pruning_criterion();
        }

        if let Some(beam) = self.pruning.acoustic_prepruning {
            self.prune_before_scoring(scorer, beam)?;
            self.record_states(PruningStage::AfterPrePruning);
        }

        self.search_space_mut()?.add_acoustic_scores(scorer);
        self.prune_states()?;
        self.record_states(PruningStage::AfterPruning);

        if self.search_space_mut()?.n_state_hypotheses() == 0 {
            return self.handle_empty_search_space();
        }

        let time = self.time;
        if time % self.config.search.rescale_interval == 0 {
            let ss = self.search_space_mut()?;
            if let Some(best) = ss.best_state_hypothesis() {
                if best.score.is_finite() {
                    ss.rescale(best.score);
                }
            }
        }

        self.search_space_mut()?.find_word_ends();
        let n = self.search_space_mut()?.n_word_end_hypotheses();
        self.statistics.word_ends_before_pruning.record(n as f64);
        metrics::record_word_ends(PruningStage::BeforePruning, n);

        self.prune_word_ends(self.pruning.lattice_pruning, self.pruning.lattice_pruning_limit)?;
        let lm_pruning = self.pruning.lm_pruning;
        let ss = self.search_space_mut()?;
        let n = ss.n_word_end_hypotheses();
        ss.create_traces(time);
        let threshold = ss.minimum_word_end_score() + lm_pruning;
        let added = ss.hypothesize_epsilon_pronunciations(threshold);
        self.statistics.word_ends_after_pruning.record(n as f64);
        self.statistics.epsilon_word_ends_added.record(added as f64);
        metrics::record_word_ends(PruningStage::AfterPruning, n);

        let create_lattice = self.config.search.create_lattice;
        let optimize = self.config.search.optimize_lattice == LatticeOptimization::Simple;
        let silence = self.models()?.silence;
        let ss = self.search_space_mut()?;
        ss.recombine_word_ends(create_lattice);
        if create_lattice && optimize {
            if let Some(silence) = silence {
                ss.optimize_silence_in_word_lattice(silence);
            }
        }
        let n = ss.n_word_end_hypotheses();
        self.statistics.word_ends_after_recombination.record(n as f64);
        metrics::record_word_ends(PruningStage::AfterRecombination, n);

        if self.pruning.lm_pruning < self.pruning.lattice_pruning
            || self.pruning.lm_pruning_limit < self.pruning.lattice_pruning_limit
        {
            self.prune_word_ends(self.pruning.lm_pruning, self.pruning.lm_pruning_limit)?;
        }
        let gc = time % self.config.search.trace_gc_interval == 0;
        let ss = self.search_space_mut()?;
        let n = ss.n_word_end_hypotheses();
        if let Some(la) = ss.lookahead_mut() {
            la.collect_statistics();
        }
        if gc {
            ss.collect_garbage(&[]);
        }
        let live = ss.traces().len();
        self.statistics.word_ends_after_second_pruning.record(n as f64);
        self.statistics.live_traces.record(live as f64);
        metrics::record_frame();
        debug!(frame = time, word_ends = n, traces = live, "frame done");
        Ok(())
    }
}

impl SearchAlgorithm for WordConditionedTreeSearch {
    fn set_model_combination(&mut self, models: &ModelCombination) -> Result<()> {
        self.check_not_feeding("set_model_combination")?;
        self.config.validate()?;
        let (tree, source) = state_tree_io::load_or_build(
            &models.lexicon,
            models.acoustic_model.as_ref(),
            &self.config.state_tree,
        )?;
        info!(source = source.as_str(), "state tree ready");
        self.bind(models, Arc::new(tree))
    }

    fn set_grammar(&mut self, grammar: Arc<dyn LanguageModel>) -> Result<()> {
        self.check_not_feeding("set_grammar")?;
        let models = self
            .models
            .as_mut()
            .ok_or(DecoderError::MissingBinding("model combination"))?;
        models.lm = Arc::clone(&grammar);
        if let Some(ss) = self.search_space.as_mut() {
            ss.set_language_model(grammar)?;
        }
        self.sentence_end = None;
        self.state = SessionState::Idle;
        info!("grammar bound");
        Ok(())
    }

    fn restart(&mut self) -> Result<()> {
        let models = self.models()?.clone();
        let mut ss = match self.search_space.take() {
            Some(mut ss) => {
                ss.clear();
                ss
            }
            None => self.create_search_space(&models),
        };
        ss.add_startup_word_end_hypothesis(models.lm.start_history(), 0);
        let threshold = ss.minimum_word_end_score() + self.pruning.lm_pruning;
        ss.hypothesize_epsilon_pronunciations(threshold);
        self.search_space = Some(ss);
        self.time = 0;
        self.sentence_end = None;
        self.state = SessionState::Feeding;
        debug!("search restarted");
        Ok(())
    }

    fn feed(&mut self, scores: &dyn FrameScorer) -> Result<()> {
        match self.state {
            SessionState::Feeding => {}
            SessionState::Exhausted => {
                self.time += 1;
                return Ok(());
            }
            SessionState::Unbound => return Err(DecoderError::MissingBinding("model combination")),
            SessionState::Idle => {
                return Err(DecoderError::InvalidState(
                    "feed requires a restart first".to_string(),
                ))
            }
            SessionState::Failed => {
                return Err(DecoderError::InvalidState(
                    "search failed, restart required".to_string(),
                ))
            }
        }
        let required = self.models()?.acoustic_model.n_emissions();
        if scores.n_emissions() < required {
            let message = format!(
                "frame provides {} emission scores, acoustic model needs {}",
                scores.n_emissions(),
                required
            );
            error!("{}", message);
            return Err(DecoderError::ContractViolation(message));
        }
        self.feed_frame(scores)
    }

    fn get_current_best_sentence(&mut self) -> Result<Traceback> {
        let end = self.sentence_end()?;
        let ss = self.search_space_mut()?;
        Ok(Traceback::from_trace(ss.traces(), end))
    }

    fn get_partial_sentence(&mut self) -> Result<Traceback> {
        if self.config.search.create_lattice {
            let message = "partial sentences are not available when creating lattices";
            error!("{}", message);
            return Err(DecoderError::ContractViolation(message.to_string()));
        }
        self.check_results_available()?;
        let ss = self.search_space_mut()?;
        let Some(t) = ss.last_unambiguous_trace() else {
            return Ok(Traceback::default());
        };
        let traceback = Traceback::from_trace(ss.traces(), t);
        ss.kill_trace(t);
        self.sentence_end = None;
        Ok(traceback)
    }

    fn get_current_word_lattice(&mut self) -> Result<WordLattice> {
        let end = self.sentence_end()?;
        let ss = self.search_space_mut()?;
        WordLattice::from_trace(ss.traces(), end)
    }

    fn describe_pruning(&self) -> PruningDescriptor {
        self.pruning
    }

    fn relax_pruning(&mut self, factor: Score, offset: Score) -> bool {
        let relaxed = self.pruning.relaxed(factor, offset);
        if relaxed == self.pruning {
            return false;
        }
        info!(from = %self.pruning, to = %relaxed, "pruning relaxed");
        self.pruning = relaxed;
        metrics::record_pruning_relaxation();
        true
    }

    fn reset_pruning(&mut self, descriptor: &PruningDescriptor) {
        self.pruning = *descriptor;
    }

    fn finalize(&mut self) -> Result<Traceback> {
        let traceback = self.get_current_best_sentence()?;
        self.state = SessionState::Idle;
        debug!(frames = self.time, words = traceback.len(), "utterance finalized");
        Ok(traceback)
    }

    fn time(&self) -> TimeframeIndex {
        self.time
    }

    fn reset_statistics(&mut self) {
        self.statistics.reset();
        if let Some(la) = self.search_space.as_mut().and_then(|ss| ss.lookahead_mut()) {
            la.reset_statistics();
        }
    }

    fn log_statistics(&self) {
        self.statistics.log();
        if let Some(la) = self.search_space.as_ref().and_then(|ss| ss.lookahead()) {
            la.log_statistics();
        }
    }
}
