//! Lexical prefix tree of HMM states.
//!
//! Every pronunciation of the lexicon is unrolled into HMM sub states; states
//! with identical acoustic realisation and identical continuation are shared,
//! which turns the lexicon into a DAG entered through one or more root
//! states. Word ends are marked by exits naming the pronunciation and the
//! root through which the next word is entered.
//!
//! The tree is frozen into flat arrays: states, batch boundaries (a batch is
//! a contiguous range of state ids, the successors of a state are one batch)
//! and optionally second-order batches covering the successors of all
//! states of a batch, used for skip transitions.

use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Write};
use std::ops::Range;
use tracing::{debug, info, warn};

use crate::config::StateTreeConfig;
use crate::constants::transition;
use crate::error::{DecoderError, Result};
use crate::models::acoustic::{boundary, AcousticModel, Allophone, StateTransitionModel};
use crate::models::lexicon::Lexicon;
use crate::types::{Depth, EmissionIndex, Fingerprint, PhonemeId, PronunciationId, StateId, Transit};

pub type BatchId = u32;

/// Emission index of non-emitting states.
pub const INVALID_ACOUSTIC_MODEL: EmissionIndex = EmissionIndex::MAX;

pub(super) const INVALID_BATCH: BatchId = BatchId::MAX;

/// Acoustic identity of a tree state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateDesc {
    pub acoustic_model: EmissionIndex,
    pub transition_model_index: u8,
}

impl StateDesc {
    fn entry() -> Self {
        Self {
            acoustic_model: INVALID_ACOUSTIC_MODEL,
            transition_model_index: transition::ENTRY_M1,
        }
    }
}

/// Word end: taking it completes `pronunciation` and continues in
/// `transit_entry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub pronunciation: PronunciationId,
    pub transit_entry: StateId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub desc: StateDesc,
    pub depth: Depth,
    pub exits: Vec<Exit>,
    pub(super) successors: BatchId,
}

/// Construction switches a tree was built with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeFlags {
    pub across_word: bool,
    pub skip_transitions: bool,
    pub ci_cross_word_transitions: bool,
    pub path_recombination_in_fan_in: bool,
}

impl TreeFlags {
    pub fn new(config: &StateTreeConfig, acoustic_model: &dyn AcousticModel) -> Self {
        Self {
            across_word: acoustic_model.is_across_word_model_enabled(),
            skip_transitions: config.skip_transitions,
            ci_cross_word_transitions: config.ci_cross_word_transitions,
            path_recombination_in_fan_in: config.enforce_path_recombination_in_fan_in,
        }
    }

    pub(super) fn bits(self) -> u8 {
        (self.across_word as u8)
            | (self.skip_transitions as u8) << 1
            | (self.ci_cross_word_transitions as u8) << 2
            | (self.path_recombination_in_fan_in as u8) << 3
    }

    pub(super) fn from_bits(bits: u8) -> Self {
        Self {
            across_word: bits & 1 != 0,
            skip_transitions: bits & 2 != 0,
            ci_cross_word_transitions: bits & 4 != 0,
            path_recombination_in_fan_in: bits & 8 != 0,
        }
    }
}

/// Everything a built tree depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeDependencies {
    pub acoustic_model: Fingerprint,
    pub lexicon: Fingerprint,
    pub flags: TreeFlags,
}

impl TreeDependencies {
    pub fn new(lexicon: &Lexicon, acoustic_model: &dyn AcousticModel, config: &StateTreeConfig) -> Self {
        Self {
            acoustic_model: acoustic_model.fingerprint(),
            lexicon: lexicon.fingerprint(),
            flags: TreeFlags::new(config, acoustic_model),
        }
    }
}

/// Root states per (final phoneme, initial phoneme) word boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct CoarticulationStructure {
    pub initial_phonemes: Vec<PhonemeId>,
    pub final_phonemes: Vec<PhonemeId>,
    pub(super) roots: Vec<StateId>,
}

impl CoarticulationStructure {
    fn new(lexicon: &Lexicon) -> Self {
        Self {
            initial_phonemes: lexicon.initial_phonemes(),
            final_phonemes: lexicon.final_phonemes(),
            roots: Vec::new(),
        }
    }

    /// Root entered after a word ending in `final_phoneme` when the next
    /// word starts with `initial_phoneme`.
    pub fn root(&self, final_phoneme: PhonemeId, initial_phoneme: PhonemeId) -> Option<StateId> {
        let l = self.final_phonemes.binary_search(&final_phoneme).ok()?;
        let r = self.initial_phonemes.binary_search(&initial_phoneme).ok()?;
        self.roots.get(l * self.initial_phonemes.len() + r).copied()
    }
}

/// The frozen state tree.
#[derive(Debug, Clone)]
pub struct StateTree {
    pub(super) states: Vec<State>,
    pub(super) batches: Vec<StateId>,
    pub(super) successor_batches: Vec<BatchId>,
    pub(super) empty_batch: BatchId,
    pub(super) root: StateId,
    pub(super) ci_root: StateId,
    pub(super) root_transits: Vec<Transit>,
    pub(super) coarticulation: Option<CoarticulationStructure>,
    pub(super) transition_models: Vec<StateTransitionModel>,
    pub(super) dependencies: TreeDependencies,
}

impl StateTree {
    /// Build the tree for a lexicon and acoustic model.
    pub fn build(
        lexicon: &Lexicon,
        acoustic_model: &dyn AcousticModel,
        config: &StateTreeConfig,
    ) -> Result<Self> {
        let dependencies = TreeDependencies::new(lexicon, acoustic_model, config);
        let builder = TreeBuilder::new(lexicon, acoustic_model, dependencies.flags);
        let tree = builder.build(dependencies)?;
        tree.log_statistics();
        Ok(tree)
    }

    pub fn n_states(&self) -> u32 {
        self.states.len() as u32
    }

    /// Main entry point; sentence begin and context-free word boundaries.
    pub fn root(&self) -> StateId {
        self.root
    }

    /// Entry for words starting with a context-independent phoneme when
    /// such transitions may not pass through the main root.
    pub fn ci_root(&self) -> StateId {
        self.ci_root
    }

    pub fn is_uncoarticulated_root(&self, s: StateId) -> bool {
        s == self.root || s == self.ci_root
    }

    pub fn state(&self, s: StateId) -> &State {
        &self.states[s as usize]
    }

    pub fn state_desc(&self, s: StateId) -> StateDesc {
        self.states[s as usize].desc
    }

    pub fn depth(&self, s: StateId) -> Depth {
        self.states[s as usize].depth
    }

    pub fn transition_model(&self, s: StateId) -> &StateTransitionModel {
        &self.transition_models[self.states[s as usize].desc.transition_model_index as usize]
    }

    pub(super) fn batch(&self, b: BatchId) -> Range<StateId> {
        self.batches[b as usize]..self.batches[b as usize + 1]
    }

    pub fn successors(&self, s: StateId) -> Range<StateId> {
        self.batch(self.states[s as usize].successors)
    }

    /// Successors of the successors of `s`, targets of skip transitions.
    pub fn successors2(&self, s: StateId) -> Range<StateId> {
        if self.successor_batches.is_empty() {
            return 0..0;
        }
        let b = self.states[s as usize].successors;
        self.batch(self.successor_batches[b as usize])
    }

    pub fn has_successor_batches(&self) -> bool {
        !self.successor_batches.is_empty()
    }

    pub fn word_ends(&self, s: StateId) -> &[Exit] {
        &self.states[s as usize].exits
    }

    pub fn coarticulation(&self) -> Option<&CoarticulationStructure> {
        self.coarticulation.as_ref()
    }

    pub fn dependencies(&self) -> &TreeDependencies {
        &self.dependencies
    }

    pub fn n_batches(&self) -> usize {
        self.batches.len().saturating_sub(1)
    }

    /// Word boundary context of a root state. Non-root states have none.
    pub fn describe_root_state(&self, s: StateId) -> Transit {
        match self.root_transits.get(s as usize) {
            Some(&t) => t,
            None => {
                debug!(state = s, "boundary of a non-root state requested");
                Transit::default()
            }
        }
    }

    /// States ordered so that every state precedes its predecessors.
    pub fn reverse_topological(&self) -> impl Iterator<Item = StateId> {
        (0..self.n_states()).rev()
    }

    /// Check that every second-order batch equals the concatenated
    /// successors of the first-order batch it belongs to.
    pub fn is_consistent(&self) -> bool {
        if self.successor_batches.is_empty() {
            return true;
        }
        let mut result = true;
        for s in 0..self.n_states() {
            let ss2 = self.successors2(s);
            if ss2.is_empty() {
                continue;
            }
            let mut cursor = ss2.start;
            for ss in self.successors(s) {
                for sss in self.successors(ss) {
                    if sss != cursor {
                        warn!(s, ss, sss, ss2 = cursor, "inconsistent second order structure");
                        result = false;
                    }
                    cursor += 1;
                }
            }
            if cursor != ss2.end {
                warn!(s, ss2 = cursor, ss2_end = ss2.end, "inconsistent second order structure");
                result = false;
            }
        }
        result
    }

    pub fn log_statistics(&self) {
        let mut per_depth: BTreeMap<Depth, (u32, u32)> = BTreeMap::new();
        for state in &self.states {
            let entry = per_depth.entry(state.depth).or_default();
            entry.0 += 1;
            entry.1 += state.exits.len() as u32;
        }
        let n_exits: usize = self.states.iter().map(|s| s.exits.len()).sum();
        info!(
            states = self.states.len(),
            batches = self.n_batches(),
            exits = n_exits,
            roots = self.root_transits.len(),
            skip = self.has_successor_batches(),
            "state tree"
        );
        for (depth, (states, exits)) in per_depth {
            debug!(depth, states, exits, "state tree level");
        }
    }

    /// Graphviz rendering for inspection.
    pub fn write_dot<W: Write>(&self, out: &mut W, lexicon: &Lexicon) -> io::Result<()> {
        writeln!(out, "digraph \"state tree\" {{")?;
        writeln!(out, "ranksep = 1.0;")?;
        writeln!(out, "rankdir = LR;")?;
        writeln!(out, "node [fontname=\"Helvetica\"]")?;
        for (si, state) in self.states.iter().enumerate() {
            write!(out, "n{} [label=\"{}\\nd={}", si, si, state.depth)?;
            if state.desc.acoustic_model != INVALID_ACOUSTIC_MODEL {
                write!(out, "\\nm={}", state.desc.acoustic_model)?;
            }
            write!(out, "\\nt={}", state.desc.transition_model_index)?;
            for exit in &state.exits {
                write!(out, "\\n{} -> {}", lexicon.orth(exit.pronunciation), exit.transit_entry)?;
            }
            writeln!(out, "\"]")?;
            for ss in self.successors(si as StateId) {
                writeln!(out, "n{} -> n{}", si, ss)?;
            }
            for exit in &state.exits {
                writeln!(out, "n{} -> n{} [style=dashed]", si, exit.transit_entry)?;
            }
        }
        writeln!(out, "}}")
    }
}

// ---------------------------------------------------------------------------
// construction

/// Remainder of a pronunciation from a given HMM sub state on.
#[derive(Debug, Clone, Copy)]
struct PronunciationSuffix {
    pron: u32,
    predecessor: Option<PhonemeId>,
    successor: Option<PhonemeId>,
    /// -1 before the first phoneme (the root).
    phoneme: i16,
    phone_state: u8,
    sub_state: u8,
}

impl PronunciationSuffix {
    fn new(pron: u32, predecessor: Option<PhonemeId>) -> Self {
        Self {
            pron,
            predecessor,
            successor: None,
            phoneme: -1,
            phone_state: 0,
            sub_state: 0,
        }
    }
}

/// Total order identifying suffixes with the same future states.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct SuffixKey {
    pron: u32,
    successor: Option<PhonemeId>,
    phone_state: u8,
    sub_state: u8,
    remaining: Vec<PhonemeId>,
    emissions: Vec<EmissionIndex>,
}

#[derive(Debug, Clone, Default)]
struct SuffixSet {
    items: Vec<(SuffixKey, PronunciationSuffix)>,
}

impl SuffixSet {
    fn keys(&self) -> Vec<SuffixKey> {
        self.items.iter().map(|(k, _)| k.clone()).collect()
    }
}

#[derive(Debug)]
struct BatchRequest {
    depth: Depth,
    states: Vec<StateId>,
    suffixes: SuffixSet,
    parents: Vec<SuffixKey>,
}

type RequestKey = (Vec<SuffixKey>, Vec<SuffixKey>);

/// Pending batch requests. The recombining variant merges requests with
/// identical suffix sets so that their states share one successor batch.
enum RequestQueue {
    Straight(VecDeque<BatchRequest>),
    Recombining {
        by_depth: BTreeMap<Depth, VecDeque<usize>>,
        pending: Vec<Option<(RequestKey, BatchRequest)>>,
        index: FxHashMap<RequestKey, usize>,
    },
}

impl RequestQueue {
    fn new(recombining: bool) -> Self {
        if recombining {
            RequestQueue::Recombining {
                by_depth: BTreeMap::new(),
                pending: Vec::new(),
                index: FxHashMap::default(),
            }
        } else {
            RequestQueue::Straight(VecDeque::new())
        }
    }

    fn submit(&mut self, request: BatchRequest) {
        match self {
            RequestQueue::Straight(queue) => queue.push_back(request),
            RequestQueue::Recombining {
                by_depth,
                pending,
                index,
            } => {
                let key = (request.suffixes.keys(), request.parents.clone());
                if let Some(&i) = index.get(&key) {
                    if let Some((_, existing)) = pending[i].as_mut() {
                        existing.states.extend_from_slice(&request.states);
                        return;
                    }
                }
                let i = pending.len();
                by_depth.entry(request.depth).or_default().push_back(i);
                index.insert(key.clone(), i);
                pending.push(Some((key, request)));
            }
        }
    }

    fn pop(&mut self) -> Option<BatchRequest> {
        match self {
            RequestQueue::Straight(queue) => queue.pop_front(),
            RequestQueue::Recombining {
                by_depth,
                pending,
                index,
            } => loop {
                let mut entry = by_depth.first_entry()?;
                let Some(i) = entry.get_mut().pop_front() else {
                    entry.remove();
                    continue;
                };
                if entry.get().is_empty() {
                    entry.remove();
                }
                if let Some((key, request)) = pending[i].take() {
                    index.remove(&key);
                    return Some(request);
                }
            },
        }
    }
}

struct TreeBuilder<'a> {
    lexicon: &'a Lexicon,
    am: &'a dyn AcousticModel,
    flags: TreeFlags,
    states: Vec<State>,
    batches: Vec<StateId>,
    empty_batch: BatchId,
    root: StateId,
    ci_root: StateId,
    root_transits: Vec<Transit>,
    coarticulation: Option<CoarticulationStructure>,
    queue: RequestQueue,
}

impl<'a> TreeBuilder<'a> {
    fn new(lexicon: &'a Lexicon, am: &'a dyn AcousticModel, flags: TreeFlags) -> Self {
        Self {
            lexicon,
            am,
            flags,
            states: Vec::new(),
            batches: Vec::new(),
            empty_batch: 0,
            root: 0,
            ci_root: 0,
            root_transits: Vec::new(),
            coarticulation: flags.across_word.then(|| CoarticulationStructure::new(lexicon)),
            queue: RequestQueue::new(flags.across_word),
        }
    }

    fn phonemes(&self, s: &PronunciationSuffix) -> &'a [PhonemeId] {
        &self.lexicon.pronunciation(s.pron).phonemes
    }

    fn current_phoneme(&self, s: &PronunciationSuffix) -> PhonemeId {
        self.phonemes(s)[s.phoneme as usize]
    }

    fn n_phone_states(&self, s: &PronunciationSuffix) -> u8 {
        if s.phoneme < 0 {
            0
        } else {
            self.am.n_phone_states(self.current_phoneme(s))
        }
    }

    fn n_sub_states(&self, s: &PronunciationSuffix) -> u8 {
        if s.phoneme < 0 {
            0
        } else {
            self.am.n_sub_states(self.current_phoneme(s), s.phone_state)
        }
    }

    fn advance_sub_state(&self, s: &mut PronunciationSuffix) -> bool {
        s.sub_state += 1;
        if s.sub_state >= self.n_sub_states(s) {
            s.sub_state = 0;
            return true;
        }
        false
    }

    fn advance_phone_state(&self, s: &mut PronunciationSuffix) -> bool {
        s.phone_state += 1;
        if s.phone_state >= self.n_phone_states(s) {
            s.phone_state = 0;
            return true;
        }
        false
    }

    fn allophone(&self, s: &PronunciationSuffix) -> Allophone {
        let phonemes = self.phonemes(s);
        let i = s.phoneme as usize;
        let phoneme = phonemes[i];
        let mut flags = 0;
        if i == 0 {
            flags |= boundary::INITIAL_PHONE;
        }
        if i + 1 == phonemes.len() {
            flags |= boundary::FINAL_PHONE;
        }
        let (history, future) = if self.lexicon.is_context_dependent(phoneme) {
            let history = if i > 0 { Some(phonemes[i - 1]) } else { s.predecessor };
            let future = if i + 1 < phonemes.len() {
                Some(phonemes[i + 1])
            } else {
                s.successor
            };
            (history, future)
        } else {
            (None, None)
        };
        Allophone {
            phoneme,
            history,
            future,
            boundary: flags,
        }
    }

    fn head(&self, s: &PronunciationSuffix) -> StateDesc {
        if s.phoneme < 0 {
            return StateDesc::entry();
        }
        let allophone = self.allophone(s);
        StateDesc {
            acoustic_model: self.am.emission_index(&allophone, s.phone_state),
            transition_model_index: self
                .am
                .transition_model_index(&allophone, s.phone_state, s.sub_state),
        }
    }

    fn key(&self, s: &PronunciationSuffix) -> SuffixKey {
        let phonemes = self.phonemes(s);
        let emissions = if s.phoneme >= 0 {
            let allophone = self.allophone(s);
            (s.phone_state..self.n_phone_states(s))
                .map(|ps| self.am.emission_index(&allophone, ps))
                .collect()
        } else {
            Vec::new()
        };
        SuffixKey {
            pron: s.pron,
            successor: s.successor,
            phone_state: s.phone_state,
            sub_state: s.sub_state,
            remaining: phonemes[s.phoneme.max(0) as usize..].to_vec(),
            emissions,
        }
    }

    fn sorted_set(&self, items: Vec<PronunciationSuffix>) -> SuffixSet {
        let mut items: Vec<_> = items.into_iter().map(|s| (self.key(&s), s)).collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items.dedup_by(|a, b| a.0 == b.0);
        SuffixSet { items }
    }

    /// Step every suffix to its next sub state. Pronunciations that end are
    /// collected in `ends`; final context-dependent phonemes fan out over all
    /// initial phonemes when across-word modelling is on.
    fn advance(
        &self,
        s: &PronunciationSuffix,
        out: &mut Vec<PronunciationSuffix>,
        ends: &mut Vec<PronunciationSuffix>,
    ) {
        let mut s = *s;
        let length = self.phonemes(&s).len() as i16;
        if self.advance_sub_state(&mut s) {
            let must_advance_phoneme = self.advance_phone_state(&mut s);
            if must_advance_phoneme {
                s.phoneme += 1;
                if s.phoneme >= length {
                    ends.push(s);
                    return;
                }
                if s.phoneme > 0 {
                    s.predecessor = None;
                }
            }
            if self.flags.across_word && must_advance_phoneme && s.phoneme == length - 1 {
                if self.lexicon.is_context_dependent(self.current_phoneme(&s)) {
                    if let Some(cs) = &self.coarticulation {
                        for &initial in &cs.initial_phonemes {
                            out.push(PronunciationSuffix {
                                successor: Some(initial),
                                ..s
                            });
                        }
                    }
                }
                s.successor = None;
            }
        }
        out.push(s);
    }

    fn transit_entry(&self, s: &PronunciationSuffix) -> Result<StateId> {
        let final_phoneme = self.phonemes(s).last().copied();
        match s.successor {
            None => {
                let final_cd = final_phoneme.map_or(false, |p| self.lexicon.is_context_dependent(p));
                if self.flags.ci_cross_word_transitions || !final_cd {
                    Ok(self.root)
                } else {
                    Ok(self.ci_root)
                }
            }
            Some(initial) => final_phoneme
                .zip(self.coarticulation.as_ref())
                .and_then(|(fin, cs)| cs.root(fin, initial))
                .ok_or_else(|| {
                    DecoderError::ContractViolation(format!(
                        "no coarticulated root for boundary {:?} / {}",
                        final_phoneme, initial
                    ))
                }),
        }
    }

    fn create_exits(&self, ends: &[PronunciationSuffix]) -> Result<Vec<Exit>> {
        let mut exits = Vec::new();
        for s in ends {
            let transit_entry = self.transit_entry(s)?;
            for &pronunciation in &self.lexicon.pronunciation(s.pron).lemma_pronunciations {
                exits.push(Exit {
                    pronunciation,
                    transit_entry,
                });
            }
        }
        Ok(exits)
    }

    fn build_root(&mut self, suffixes: Vec<PronunciationSuffix>, transit: Transit) -> Result<StateId> {
        let id = self.states.len() as StateId;
        debug_assert_eq!(self.root_transits.len(), id as usize);
        self.root_transits.push(transit);

        let mut next = Vec::new();
        let mut ends = Vec::new();
        for s in &suffixes {
            self.advance(s, &mut next, &mut ends);
        }
        let exits = self.create_exits(&ends)?;
        let successors = if next.is_empty() {
            self.empty_batch
        } else {
            let suffixes = self.sorted_set(next);
            self.queue.submit(BatchRequest {
                depth: 1,
                states: vec![id],
                suffixes,
                parents: Vec::new(),
            });
            INVALID_BATCH
        };
        self.states.push(State {
            desc: StateDesc::entry(),
            depth: 0,
            exits,
            successors,
        });
        Ok(id)
    }

    fn build_roots(&mut self) -> Result<()> {
        let lexicon = self.lexicon;
        self.root = self.states.len() as StateId;
        self.ci_root = self.root;
        let all = lexicon
            .pronunciations()
            .map(|(i, _)| PronunciationSuffix::new(i, None))
            .collect();
        self.build_root(all, Transit::default())?;

        let Some(cs) = self.coarticulation.clone() else {
            return Ok(());
        };

        if !self.flags.ci_cross_word_transitions {
            self.ci_root = self.states.len() as StateId;
            let suffixes = lexicon
                .pronunciations()
                .filter(|(_, p)| {
                    p.phonemes
                        .first()
                        .map_or(true, |&first| !lexicon.is_context_dependent(first))
                })
                .map(|(i, _)| PronunciationSuffix::new(i, None))
                .collect();
            self.build_root(suffixes, Transit::new(None, lexicon.silence_phoneme()))?;
        }

        let mut roots = Vec::with_capacity(cs.final_phonemes.len() * cs.initial_phonemes.len());
        for &final_phoneme in &cs.final_phonemes {
            for &initial_phoneme in &cs.initial_phonemes {
                let suffixes = lexicon
                    .pronunciations()
                    .filter(|(_, p)| p.phonemes.first().map_or(true, |&first| first == initial_phoneme))
                    .map(|(i, _)| PronunciationSuffix::new(i, Some(final_phoneme)))
                    .collect();
                let root = self.build_root(
                    suffixes,
                    Transit::new(Some(final_phoneme), Some(initial_phoneme)),
                )?;
                roots.push(root);
            }
        }
        if let Some(cs) = self.coarticulation.as_mut() {
            cs.roots = roots;
        }
        Ok(())
    }

    /// Split a suffix set by head state, keeping first-appearance order.
    fn partition(&self, set: &SuffixSet) -> Vec<(StateDesc, SuffixSet)> {
        let mut parts: Vec<(StateDesc, SuffixSet)> = Vec::new();
        let mut index: FxHashMap<(StateDesc, Option<PhonemeId>), usize> = FxHashMap::default();
        for (key, s) in &set.items {
            let head = self.head(s);
            let fan_in = if self.flags.path_recombination_in_fan_in
                && ((s.phoneme == 0
                    && s.sub_state + 1 == self.n_sub_states(s)
                    && s.phone_state + 1 == self.n_phone_states(s))
                    || (s.phoneme == 1 && s.sub_state == 0 && s.phone_state == 0))
            {
                Some(self.current_phoneme(s))
            } else {
                None
            };
            let i = *index.entry((head, fan_in)).or_insert_with(|| {
                parts.push((head, SuffixSet::default()));
                parts.len() - 1
            });
            parts[i].1.items.push((key.clone(), *s));
        }
        parts
    }

    fn create_batch(&mut self, request: &BatchRequest) -> Result<BatchId> {
        let batch = (self.batches.len() - 1) as BatchId;
        debug_assert_eq!(self.batches[batch as usize] as usize, self.states.len());
        let parents = request.suffixes.keys();
        let child_depth = request.depth.checked_add(1).ok_or_else(|| {
            DecoderError::Lexicon("pronunciation too long for the state tree".to_string())
        })?;

        for (desc, part) in self.partition(&request.suffixes) {
            let mut next = Vec::new();
            let mut ends = Vec::new();
            for (_, s) in &part.items {
                self.advance(s, &mut next, &mut ends);
            }
            let exits = self.create_exits(&ends)?;
            let id = self.states.len() as StateId;
            let successors = if next.is_empty() {
                self.empty_batch
            } else {
                let suffixes = self.sorted_set(next);
                self.queue.submit(BatchRequest {
                    depth: child_depth,
                    states: vec![id],
                    suffixes,
                    parents: parents.clone(),
                });
                INVALID_BATCH
            };
            self.states.push(State {
                desc,
                depth: request.depth,
                exits,
                successors,
            });
        }
        self.batches.push(self.states.len() as StateId);
        Ok(batch)
    }

    /// Second-order batch per first-order batch. Batches whose successors'
    /// successors do not form one contiguous range get no skip targets.
    fn create_second_order_batches(&mut self) -> Vec<BatchId> {
        let n_first_order = self.batches.len() - 1;
        let mut successor_batches = Vec::with_capacity(n_first_order);
        let mut inexact = 0usize;
        for b in 0..n_first_order {
            let range = self.batches[b]..self.batches[b + 1];
            let b2 = match range.len() {
                0 => self.empty_batch,
                1 => self.states[range.start as usize].successors,
                _ => {
                    let mut begin = None;
                    let mut cursor: Option<StateId> = None;
                    let mut contiguous = true;
                    for s in range {
                        let child = self.states[s as usize].successors as usize;
                        let (cb, ce) = (self.batches[child], self.batches[child + 1]);
                        if cb == ce {
                            continue;
                        }
                        match cursor {
                            None => begin = Some(cb),
                            Some(c) if c != cb => contiguous = false,
                            _ => {}
                        }
                        cursor = Some(ce);
                    }
                    match (begin, cursor) {
                        (Some(begin), Some(end)) if contiguous => self.second_order_batch(begin, end),
                        (Some(_), Some(_)) => {
                            inexact += 1;
                            self.empty_batch
                        }
                        _ => self.empty_batch,
                    }
                }
            };
            successor_batches.push(b2);
        }
        if inexact > 0 {
            warn!(batches = inexact, "skip transitions disabled for non-contiguous batches");
        }
        successor_batches
    }

    fn second_order_batch(&mut self, begin: StateId, end: StateId) -> BatchId {
        let n = self.batches.len();
        if begin == self.batches[n - 2] && end == self.batches[n - 1] {
            (n - 2) as BatchId
        } else if begin == self.batches[n - 1] {
            self.batches.push(end);
            (n - 1) as BatchId
        } else {
            self.batches.push(begin);
            self.batches.push(end);
            n as BatchId
        }
    }

    fn build(mut self, dependencies: TreeDependencies) -> Result<StateTree> {
        self.empty_batch = 0;
        self.build_roots()?;
        self.batches.push(self.states.len() as StateId);
        self.batches.push(self.states.len() as StateId);

        while let Some(request) = self.queue.pop() {
            let batch = self.create_batch(&request)?;
            for &s in &request.states {
                self.states[s as usize].successors = batch;
            }
        }

        let successor_batches = if self.flags.skip_transitions {
            self.create_second_order_batches()
        } else {
            Vec::new()
        };

        let transition_models = self.am.transition_models().to_vec();
        if let Some(bad) = self
            .states
            .iter()
            .find(|s| s.desc.transition_model_index as usize >= transition_models.len())
        {
            return Err(DecoderError::Configuration(format!(
                "acoustic model has no transition model {}",
                bad.desc.transition_model_index
            )));
        }

        let tree = StateTree {
            states: self.states,
            batches: self.batches,
            successor_batches,
            empty_batch: self.empty_batch,
            root: self.root,
            ci_root: self.ci_root,
            root_transits: self.root_transits,
            coarticulation: self.coarticulation,
            transition_models,
            dependencies,
        };
        if !tree.is_consistent() {
            return Err(DecoderError::ContractViolation(
                "state tree second order structure is inconsistent".to_string(),
            ));
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use std::collections::BTreeSet;

    fn successor_set(tree: &StateTree, s: StateId) -> BTreeSet<StateId> {
        tree.successors(s).collect()
    }

    fn assert_same_depth_successors_equal_or_disjoint(tree: &StateTree) {
        for a in 0..tree.n_states() {
            for b in (a + 1)..tree.n_states() {
                if tree.depth(a) != tree.depth(b) {
                    continue;
                }
                let sa = successor_set(tree, a);
                let sb = successor_set(tree, b);
                assert!(
                    sa == sb || sa.is_disjoint(&sb),
                    "states {} and {} share part of their successors",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_prefix_sharing() {
        let lexicon = testutil::prefix_lexicon();
        let am = testutil::acoustic_model(&lexicon, false);
        let tree = StateTree::build(&lexicon, &am, &StateTreeConfig::default()).unwrap();

        // "a b" and "a c" share the states of "a"
        let root = tree.root();
        let first: Vec<_> = tree.successors(root).collect();
        let a = lexicon.phoneme_id("a").unwrap();
        let shared: Vec<_> = first
            .iter()
            .filter(|&&s| tree.state_desc(s).acoustic_model == am.monophone_emission(a, 0))
            .collect();
        assert_eq!(shared.len(), 1);
        assert_eq!(tree.depth(*shared[0]), 1);
        assert!(tree.is_consistent());
        assert_eq!(tree.describe_root_state(root), Transit::default());
    }

    #[test]
    fn test_every_pronunciation_has_an_exit() {
        let lexicon = testutil::prefix_lexicon();
        let am = testutil::acoustic_model(&lexicon, false);
        let tree = StateTree::build(&lexicon, &am, &StateTreeConfig::default()).unwrap();

        let mut seen = BTreeSet::new();
        for s in 0..tree.n_states() {
            for exit in tree.word_ends(s) {
                assert_eq!(exit.transit_entry, tree.root());
                seen.insert(exit.pronunciation);
            }
        }
        assert_eq!(seen.len(), lexicon.n_lemma_pronunciations());
    }

    #[test]
    fn test_word_path_length_matches_topology() {
        let lexicon = testutil::prefix_lexicon();
        let am = testutil::acoustic_model(&lexicon, false);
        let tree = StateTree::build(&lexicon, &am, &StateTreeConfig::default()).unwrap();

        // two phonemes with three states each
        let ab = lexicon.lemma_by_orth("ab").unwrap();
        let pron = lexicon.lemma(ab).pronunciations[0];
        let exit_state = (0..tree.n_states())
            .find(|&s| tree.word_ends(s).iter().any(|e| e.pronunciation == pron))
            .unwrap();
        assert_eq!(tree.depth(exit_state), 6);
    }

    #[test]
    fn test_same_depth_successors_equal_or_disjoint() {
        for across_word in [false, true] {
            let lexicon = testutil::prefix_lexicon();
            let am = testutil::acoustic_model(&lexicon, across_word);
            let tree = StateTree::build(&lexicon, &am, &StateTreeConfig::default()).unwrap();
            assert_same_depth_successors_equal_or_disjoint(&tree);
        }
    }

    #[test]
    fn test_successors_follow_topological_order() {
        let lexicon = testutil::prefix_lexicon();
        let am = testutil::acoustic_model(&lexicon, true);
        let tree = StateTree::build(&lexicon, &am, &StateTreeConfig::default()).unwrap();
        for s in 0..tree.n_states() {
            for ss in tree.successors(s) {
                assert!(ss > s);
                assert_eq!(tree.depth(ss), tree.depth(s) + 1);
            }
        }
    }

    #[test]
    fn test_skip_structure() {
        let lexicon = testutil::prefix_lexicon();
        let am = testutil::acoustic_model(&lexicon, false);
        let tree = StateTree::build(&lexicon, &am, &StateTreeConfig::default()).unwrap();
        assert!(tree.has_successor_batches());
        let mut any = false;
        for s in 0..tree.n_states() {
            let grandchildren: Vec<StateId> = tree
                .successors(s)
                .flat_map(|ss| tree.successors(ss))
                .collect();
            let skip: Vec<StateId> = tree.successors2(s).collect();
            if !skip.is_empty() {
                assert_eq!(skip, grandchildren);
                any = true;
            }
        }
        assert!(any);

        let config = StateTreeConfig {
            skip_transitions: false,
            ..StateTreeConfig::default()
        };
        let tree = StateTree::build(&lexicon, &am, &config).unwrap();
        assert!(!tree.has_successor_batches());
        assert!(tree.successors2(tree.root()).is_empty());
    }

    #[test]
    fn test_coarticulated_roots() {
        let lexicon = testutil::prefix_lexicon();
        let am = testutil::acoustic_model(&lexicon, true);
        let tree = StateTree::build(&lexicon, &am, &StateTreeConfig::default()).unwrap();
        let cs = tree.coarticulation().unwrap();
        assert!(!cs.final_phonemes.is_empty());

        for &fin in &cs.final_phonemes {
            for &init in &cs.initial_phonemes {
                let root = cs.root(fin, init).unwrap();
                assert_eq!(tree.describe_root_state(root), Transit::new(Some(fin), Some(init)));
                assert_eq!(tree.depth(root), 0);
            }
        }

        // words ending in a context-dependent phoneme can exit into
        // coarticulated roots as well as into the main root
        let mut coarticulated_exits = 0;
        for s in 0..tree.n_states() {
            for exit in tree.word_ends(s) {
                if !tree.is_uncoarticulated_root(exit.transit_entry) {
                    coarticulated_exits += 1;
                }
            }
        }
        assert!(coarticulated_exits > 0);
    }

    #[test]
    fn test_ci_root_when_ci_cross_word_disabled() {
        let lexicon = testutil::prefix_lexicon();
        let am = testutil::acoustic_model(&lexicon, true);
        let config = StateTreeConfig {
            ci_cross_word_transitions: false,
            ..StateTreeConfig::default()
        };
        let tree = StateTree::build(&lexicon, &am, &config).unwrap();
        assert_ne!(tree.ci_root(), tree.root());
        assert!(tree.is_uncoarticulated_root(tree.ci_root()));
        assert_eq!(
            tree.describe_root_state(tree.ci_root()).initial_phoneme,
            lexicon.silence_phoneme()
        );
    }

    #[test]
    fn test_empty_pronunciation_exits_at_root() {
        let lexicon = testutil::lexicon_with_epsilon();
        let am = testutil::acoustic_model(&lexicon, false);
        let tree = StateTree::build(&lexicon, &am, &StateTreeConfig::default()).unwrap();
        let exits = tree.word_ends(tree.root());
        assert_eq!(exits.len(), 1);
        assert_eq!(lexicon.orth(exits[0].pronunciation), "<eps>");
    }

    #[test]
    fn test_dot_output() {
        let lexicon = testutil::prefix_lexicon();
        let am = testutil::acoustic_model(&lexicon, false);
        let tree = StateTree::build(&lexicon, &am, &StateTreeConfig::default()).unwrap();
        let mut out = Vec::new();
        tree.write_dot(&mut out, &lexicon).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("digraph"));
        assert!(text.contains("style=dashed"));
    }

    /// Acoustic model whose phoneme `from` borrows the emissions of `to`.
    #[derive(Debug)]
    struct TiedModel {
        inner: crate::models::HmmAcousticModel,
        from: PhonemeId,
        to: PhonemeId,
    }

    impl AcousticModel for TiedModel {
        fn n_emissions(&self) -> u32 {
            self.inner.n_emissions()
        }

        fn n_phone_states(&self, phoneme: PhonemeId) -> u8 {
            self.inner.n_phone_states(phoneme)
        }

        fn n_sub_states(&self, phoneme: PhonemeId, phone_state: u8) -> u8 {
            self.inner.n_sub_states(phoneme, phone_state)
        }

        fn is_across_word_model_enabled(&self) -> bool {
            self.inner.is_across_word_model_enabled()
        }

        fn emission_index(&self, allophone: &Allophone, phone_state: u8) -> EmissionIndex {
            let mut tied = *allophone;
            if tied.phoneme == self.from {
                tied.phoneme = self.to;
            }
            self.inner.emission_index(&tied, phone_state)
        }

        fn transition_model_index(&self, allophone: &Allophone, phone_state: u8, sub_state: u8) -> u8 {
            self.inner.transition_model_index(allophone, phone_state, sub_state)
        }

        fn transition_models(&self) -> &[StateTransitionModel] {
            self.inner.transition_models()
        }

        fn fingerprint(&self) -> Fingerprint {
            self.inner.fingerprint()
        }
    }

    fn exit_state(tree: &StateTree, pronunciation: PronunciationId) -> StateId {
        (0..tree.n_states())
            .find(|&s| tree.word_ends(s).iter().any(|e| e.pronunciation == pronunciation))
            .unwrap()
    }

    #[test]
    fn test_fan_in_recombination_splits_tied_phonemes() {
        let lexicon = testutil::prefix_lexicon();
        let am = TiedModel {
            inner: testutil::acoustic_model(&lexicon, false),
            from: lexicon.phoneme_id("c").unwrap(),
            to: lexicon.phoneme_id("b").unwrap(),
        };
        let pronunciation =
            |orth: &str| lexicon.lemma(lexicon.lemma_by_orth(orth).unwrap()).pronunciations[0];
        let (ab, ac) = (pronunciation("ab"), pronunciation("ac"));

        // "a b" and "a c" emit identically and end in one state
        let merged = StateTree::build(&lexicon, &am, &StateTreeConfig::default()).unwrap();
        assert_eq!(exit_state(&merged, ab), exit_state(&merged, ac));

        let config = StateTreeConfig {
            enforce_path_recombination_in_fan_in: true,
            ..StateTreeConfig::default()
        };
        let separated = StateTree::build(&lexicon, &am, &config).unwrap();
        assert_ne!(exit_state(&separated, ab), exit_state(&separated, ac));
        // the three states of the second phoneme exist once per word
        assert_eq!(separated.n_states(), merged.n_states() + 3);
        assert!(separated.is_consistent());
        assert_same_depth_successors_equal_or_disjoint(&separated);
    }

    #[test]
    fn test_flags_roundtrip_bits() {
        let flags = TreeFlags {
            across_word: true,
            skip_transitions: false,
            ci_cross_word_transitions: true,
            path_recombination_in_fan_in: true,
        };
        assert_eq!(TreeFlags::from_bits(flags.bits()), flags);
    }
}
