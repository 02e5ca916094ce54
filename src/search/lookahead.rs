//! Language model lookahead.
//!
//! Before a word end is reached the identity of the word is unknown, but the
//! set of words still reachable from a tree state is. The lookahead assigns
//! every tree state the best LM score over that set, for a given history.
//!
//! The static part is a compressed lookahead tree: tree states with the same
//! reachable words share a node, chains without branches collapse, and nodes
//! that are too deep or represent too few states are merged into their
//! parents. The dynamic part is a cache of per-history score tables with
//! reference counting and a least-recently-freed reuse list.

use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{debug, info};

use super::state_tree::StateTree;
use crate::config::LookaheadConfig;
use crate::error::{DecoderError, Result};
use crate::metrics::{self, LookaheadEvent};
use crate::models::{History, LanguageModel, Lexicon};
use crate::statistics::CacheStatistics;
use crate::types::{Depth, PronunciationId, Score, StateId, WordId};

pub type LookaheadId = u32;

#[derive(Debug, Clone)]
struct ConstructionNode {
    valid: bool,
    depth_min: Depth,
    depth_max: Depth,
    represents: Vec<StateId>,
    ends: Vec<PronunciationId>,
    successors: Vec<usize>,
}

impl ConstructionNode {
    fn new(ends: Vec<PronunciationId>, successors: Vec<usize>) -> Self {
        let mut node = Self {
            valid: true,
            depth_min: Depth::MAX,
            depth_max: Depth::MIN,
            represents: Vec::new(),
            ends,
            successors,
        };
        node.make_unique();
        node
    }

    fn make_unique(&mut self) {
        self.ends.sort_unstable();
        self.ends.dedup();
        self.successors.sort_unstable();
        self.successors.dedup();
    }
}

/// Intermediate lookahead tree. Successors always have lower indices
/// than their parents.
struct ConstructionTree {
    nodes: Vec<ConstructionNode>,
}

impl ConstructionTree {
    fn build(tree: &StateTree) -> Self {
        let mut nodes: Vec<ConstructionNode> = Vec::new();
        let mut dominees: Vec<Vec<PronunciationId>> = Vec::new();
        let mut by_dominees: FxHashMap<Vec<PronunciationId>, usize> = FxHashMap::default();
        let mut node_of = vec![usize::MAX; tree.n_states() as usize];

        for si in tree.reverse_topological() {
            let exits = tree.word_ends(si);
            let successors = tree.successors(si);
            let ci = if successors.len() == 1 && exits.is_empty() {
                node_of[successors.start as usize]
            } else {
                let ends = exits.iter().map(|e| e.pronunciation).collect();
                let succ = successors.map(|s| node_of[s as usize]).collect();
                let node = ConstructionNode::new(ends, succ);
                let mut dominated = node.ends.clone();
                for &s in &node.successors {
                    dominated.extend_from_slice(&dominees[s]);
                }
                dominated.sort_unstable();
                dominated.dedup();
                match by_dominees.get(&dominated) {
                    Some(&existing) => existing,
                    None => {
                        let id = nodes.len();
                        nodes.push(node);
                        dominees.push(dominated.clone());
                        by_dominees.insert(dominated, id);
                        id
                    }
                }
            };
            node_of[si as usize] = ci;
            let depth = tree.depth(si);
            let node = &mut nodes[ci];
            node.depth_min = node.depth_min.min(depth);
            node.depth_max = node.depth_max.max(depth);
            node.represents.push(si);
        }
        debug_assert!(Self::is_well_ordered(&nodes));
        Self { nodes }
    }

    fn is_well_ordered(nodes: &[ConstructionNode]) -> bool {
        nodes.iter().enumerate().all(|(i, n)| {
            !n.valid || n.successors.iter().all(|&s| s < i && nodes[s].valid)
        })
    }

    /// Merge nodes that are too deep or too small into their parents.
    fn prune(&mut self, cutoff: Depth, minimum_representation: u32) {
        let should_prune = |n: &ConstructionNode| {
            n.depth_min > cutoff || (n.represents.len() as u32) < minimum_representation
        };
        for ci in 0..self.nodes.len() {
            let successors = std::mem::take(&mut self.nodes[ci].successors);
            let mut kept = Vec::with_capacity(successors.len());
            for si in successors {
                let sn = &self.nodes[si];
                if !sn.valid || should_prune(sn) {
                    let sn = sn.clone();
                    let cn = &mut self.nodes[ci];
                    cn.ends.extend_from_slice(&sn.ends);
                    kept.extend_from_slice(&sn.successors);
                    cn.represents.extend_from_slice(&sn.represents);
                    cn.depth_min = cn.depth_min.min(sn.depth_min);
                    cn.depth_max = cn.depth_max.max(sn.depth_max);
                    self.nodes[si].valid = false;
                } else {
                    kept.push(si);
                }
            }
            let cn = &mut self.nodes[ci];
            cn.successors = kept;
            cn.make_unique();
        }
        debug_assert!(Self::is_well_ordered(&self.nodes));
    }

    /// Drop merged nodes and renumber the rest.
    fn purge(&mut self) {
        let mut new_id = vec![usize::MAX; self.nodes.len()];
        let mut next = 0;
        for (i, node) in self.nodes.iter().enumerate() {
            if node.valid {
                new_id[i] = next;
                next += 1;
            }
        }
        self.nodes.retain(|n| n.valid);
        for node in &mut self.nodes {
            for s in &mut node.successors {
                *s = new_id[*s];
            }
        }
        debug_assert!(Self::is_well_ordered(&self.nodes));
    }

    fn log_statistics(&self) {
        let mut levels: BTreeMap<Depth, (u32, u32, u32)> = BTreeMap::new();
        for node in &self.nodes {
            let level = levels.entry(node.depth_min).or_default();
            level.0 += 1;
            level.1 += node.successors.len() as u32;
            level.2 += node.ends.len() as u32;
        }
        for (depth, (nodes, successors, ends)) in levels {
            debug!(
                depth,
                nodes,
                branching = successors as f32 / nodes as f32,
                ends,
                "lookahead tree level"
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Node {
    first_end: u32,
    first_successor: u32,
}

#[derive(Debug, Clone, Copy)]
struct Request {
    node: LookaheadId,
    token: Option<WordId>,
    offset: Score,
}

/// Compressed lookahead tree shared by all tables.
#[derive(Debug, Clone)]
pub struct LookaheadStructure {
    /// One more than there are entries; the last node is a sentinel.
    nodes: Vec<Node>,
    ends: Vec<PronunciationId>,
    successors: Vec<LookaheadId>,
    node_of_state: Vec<LookaheadId>,
    requests: Vec<Request>,
}

impl LookaheadStructure {
    pub fn build(
        tree: &StateTree,
        lexicon: &Lexicon,
        config: &LookaheadConfig,
        pronunciation_scale: Score,
    ) -> Result<Self> {
        let mut ct = ConstructionTree::build(tree);
        info!(nodes = ct.nodes.len(), "full lookahead tree");
        ct.prune(config.tree_cutoff, config.minimum_representation);
        ct.purge();
        info!(nodes = ct.nodes.len(), "reduced lookahead tree");
        ct.log_statistics();

        let mut nodes = Vec::with_capacity(ct.nodes.len() + 1);
        let mut ends = Vec::new();
        let mut successors = Vec::new();
        let mut node_of_state = vec![LookaheadId::MAX; tree.n_states() as usize];
        for (ci, cn) in ct.nodes.iter().enumerate() {
            nodes.push(Node {
                first_end: ends.len() as u32,
                first_successor: successors.len() as u32,
            });
            ends.extend_from_slice(&cn.ends);
            successors.extend(cn.successors.iter().map(|&s| s as LookaheadId));
            for &si in &cn.represents {
                node_of_state[si as usize] = ci as LookaheadId;
            }
        }
        if let Some(orphan) = node_of_state.iter().position(|&n| n == LookaheadId::MAX) {
            return Err(DecoderError::ContractViolation(format!(
                "tree state {} has no lookahead node",
                orphan
            )));
        }
        nodes.push(Node {
            first_end: ends.len() as u32,
            first_successor: successors.len() as u32,
        });

        let mut structure = Self {
            nodes,
            ends,
            successors,
            node_of_state,
            requests: Vec::new(),
        };
        structure.requests = structure.compile_requests(lexicon, pronunciation_scale);
        info!(
            entries = structure.n_entries(),
            table_bytes = structure.n_entries() * std::mem::size_of::<Score>(),
            "lookahead structure"
        );
        Ok(structure)
    }

    fn compile_requests(&self, lexicon: &Lexicon, pronunciation_scale: Score) -> Vec<Request> {
        let mut requests = Vec::with_capacity(self.ends.len());
        for n in 0..self.n_entries() {
            for &end in self.node_ends(n as LookaheadId) {
                requests.push(Request {
                    node: n as LookaheadId,
                    token: lexicon.lm_token(end),
                    offset: pronunciation_scale * lexicon.lemma_pronunciation(end).score,
                });
            }
        }
        requests
    }

    pub fn n_entries(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn node_of(&self, state: StateId) -> LookaheadId {
        self.node_of_state[state as usize]
    }

    fn node_ends(&self, n: LookaheadId) -> &[PronunciationId] {
        let n = n as usize;
        &self.ends[self.nodes[n].first_end as usize..self.nodes[n + 1].first_end as usize]
    }

    fn node_successors(&self, n: LookaheadId) -> &[LookaheadId] {
        let n = n as usize;
        &self.successors
            [self.nodes[n].first_successor as usize..self.nodes[n + 1].first_successor as usize]
    }

    /// Fill `scores` with the best LM score below every node.
    fn compute_scores(&self, lm: &dyn LanguageModel, history: &History, scores: &mut Vec<Score>) {
        scores.clear();
        scores.resize(self.n_entries(), Score::MAX);
        let scale = lm.scale();
        for request in &self.requests {
            let score = request.offset
                + request
                    .token
                    .map_or(0.0, |token| scale * lm.score(history, token));
            let slot = &mut scores[request.node as usize];
            if score < *slot {
                *slot = score;
            }
        }
        for n in 0..self.n_entries() {
            let mut best = scores[n];
            for &s in self.node_successors(n as LookaheadId) {
                debug_assert!((s as usize) < n);
                best = best.min(scores[s as usize]);
            }
            scores[n] = best;
        }
    }

    pub fn write_dot<W: Write>(&self, out: &mut W, lexicon: &Lexicon) -> io::Result<()> {
        writeln!(out, "digraph \"lm lookahead\" {{")?;
        writeln!(out, "ranksep = 1.5")?;
        writeln!(out, "rankdir = LR")?;
        writeln!(out, "node [fontname=\"Helvetica\"]")?;
        for n in 0..self.n_entries() as LookaheadId {
            write!(out, "n{} [label=\"{}\\n", n, n)?;
            for (si, _) in self.node_of_state.iter().enumerate().filter(|(_, &m)| m == n) {
                write!(out, "{} ", si)?;
            }
            for &end in self.node_ends(n) {
                write!(out, "\\n{}", lexicon.orth(end))?;
            }
            writeln!(out, "\"]")?;
            for &s in self.node_successors(n) {
                writeln!(out, "n{} -> n{}", n, s)?;
            }
        }
        writeln!(out, "}}")
    }
}

/// Shared reference to a lookahead table. Must be returned through
/// [`LanguageModelLookahead::release`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "lookahead handles must be released"]
pub struct LookaheadHandle {
    slot: usize,
}

impl LookaheadHandle {
    /// Identity of the underlying table.
    pub fn table_id(&self) -> usize {
        self.slot
    }
}

#[derive(Debug)]
struct Table {
    history: History,
    scores: Vec<Score>,
    ref_count: u32,
    /// Position on the free list while unreferenced.
    freed_at: Option<u64>,
}

/// Read access to one table.
#[derive(Debug, Clone, Copy)]
pub struct ContextLookahead<'a> {
    structure: &'a LookaheadStructure,
    table: &'a Table,
}

impl<'a> ContextLookahead<'a> {
    /// Optimistic LM score of all words reachable from `state`.
    pub fn score(&self, state: StateId) -> Score {
        self.table.scores[self.structure.node_of(state) as usize]
    }

    pub fn history(&self) -> &'a History {
        &self.table.history
    }
}

/// Per-session cache of lookahead tables.
#[derive(Debug)]
pub struct LanguageModelLookahead {
    structure: Arc<LookaheadStructure>,
    lm: Arc<dyn LanguageModel>,
    history_limit: u32,
    cache_size_low: usize,
    cache_size_high: usize,
    tables: Vec<Option<Table>>,
    vacant: Vec<usize>,
    map: FxHashMap<History, usize>,
    free: BTreeMap<u64, usize>,
    free_stamp: u64,
    n_tables: usize,
    statistics: CacheStatistics,
}

impl LanguageModelLookahead {
    pub fn new(
        config: &LookaheadConfig,
        structure: Arc<LookaheadStructure>,
        lm: Arc<dyn LanguageModel>,
    ) -> Self {
        info!(
            history_limit = config.history_limit,
            "lookahead history limit (usually means {}-gram lookahead)",
            config.history_limit + 1
        );
        Self {
            structure,
            lm,
            history_limit: config.history_limit,
            cache_size_low: config.cache_size_low as usize,
            cache_size_high: config.cache_size_high as usize,
            tables: Vec::new(),
            vacant: Vec::new(),
            map: FxHashMap::default(),
            free: BTreeMap::new(),
            free_stamp: 0,
            n_tables: 0,
            statistics: CacheStatistics::default(),
        }
    }

    pub fn structure(&self) -> &LookaheadStructure {
        &self.structure
    }

    /// Tables in memory, active or free.
    pub fn n_tables(&self) -> usize {
        self.n_tables
    }

    pub fn n_active_tables(&self) -> usize {
        self.n_tables - self.free.len()
    }

    pub fn n_free_tables(&self) -> usize {
        self.free.len()
    }

    /// Switch the language model. Cached tables are discarded, which
    /// requires that no handle is outstanding.
    pub fn set_language_model(&mut self, lm: Arc<dyn LanguageModel>) -> Result<()> {
        if self.n_active_tables() > 0 {
            return Err(DecoderError::InvalidState(format!(
                "{} lookahead tables still in use",
                self.n_active_tables()
            )));
        }
        self.lm = lm;
        self.tables.clear();
        self.vacant.clear();
        self.map.clear();
        self.free.clear();
        self.n_tables = 0;
        Ok(())
    }

    fn reduce(&self, history: &History) -> History {
        self.lm.reduced_history(history, self.history_limit)
    }

    fn table_mut(&mut self, slot: usize) -> &mut Table {
        match self.tables[slot].as_mut() {
            Some(table) => table,
            None => unreachable!("lookahead slot {} is vacant", slot),
        }
    }

    fn cached(&mut self, history: &History) -> Option<usize> {
        let slot = *self.map.get(history)?;
        let freed_at = self.table_mut(slot).freed_at.take();
        let event = match freed_at {
            Some(stamp) => {
                self.free.remove(&stamp);
                self.statistics.free_hits += 1;
                LookaheadEvent::FreeHit
            }
            None => {
                self.statistics.share_hits += 1;
                LookaheadEvent::ShareHit
            }
        };
        metrics::record_lookahead_event(event);
        self.table_mut(slot).ref_count += 1;
        Some(slot)
    }

    fn acquire(&mut self, history: History) -> usize {
        if self.n_tables < self.cache_size_low || self.free.is_empty() {
            let table = Table {
                history,
                scores: Vec::new(),
                ref_count: 0,
                freed_at: None,
            };
            self.n_tables += 1;
            match self.vacant.pop() {
                Some(slot) => {
                    self.tables[slot] = Some(table);
                    slot
                }
                None => {
                    self.tables.push(Some(table));
                    self.tables.len() - 1
                }
            }
        } else {
            let Some((_, slot)) = self.free.pop_first() else {
                unreachable!("free list checked above")
            };
            let table = self.table_mut(slot);
            let old = std::mem::replace(&mut table.history, history);
            table.freed_at = None;
            self.map.remove(&old);
            slot
        }
    }

    /// Table for `history`, computing it when not cached.
    pub fn get_lookahead(&mut self, history: &History) -> LookaheadHandle {
        let history = self.reduce(history);
        if let Some(slot) = self.cached(&history) {
            return LookaheadHandle { slot };
        }
        self.statistics.misses += 1;
        metrics::record_lookahead_event(LookaheadEvent::Miss);

        let slot = self.acquire(history.clone());
        let structure = Arc::clone(&self.structure);
        let lm = Arc::clone(&self.lm);
        let table = self.table_mut(slot);
        structure.compute_scores(lm.as_ref(), &history, &mut table.scores);
        table.ref_count = 1;
        self.map.insert(history, slot);
        LookaheadHandle { slot }
    }

    /// Table for `history` only if it is already cached.
    pub fn try_to_get_lookahead(&mut self, history: &History) -> Option<LookaheadHandle> {
        let history = self.reduce(history);
        self.cached(&history).map(|slot| LookaheadHandle { slot })
    }

    /// Return a handle. Unreferenced tables go to the free list, or are
    /// evicted oldest-freed-first while the cache is above its high mark.
    pub fn release(&mut self, handle: LookaheadHandle) {
        let slot = handle.slot;
        let table = self.table_mut(slot);
        debug_assert!(table.ref_count > 0 && table.freed_at.is_none());
        table.ref_count -= 1;
        if table.ref_count > 0 {
            return;
        }
        if self.n_tables > self.cache_size_high {
            let victim = match self.free.pop_first() {
                Some((_, oldest)) => {
                    self.push_free(slot);
                    oldest
                }
                None => slot,
            };
            self.evict(victim);
        } else {
            self.push_free(slot);
        }
    }

    fn push_free(&mut self, slot: usize) {
        let stamp = self.free_stamp;
        self.free_stamp += 1;
        self.table_mut(slot).freed_at = Some(stamp);
        self.free.insert(stamp, slot);
    }

    fn evict(&mut self, slot: usize) {
        if let Some(table) = self.tables[slot].take() {
            if self.map.get(&table.history) == Some(&slot) {
                self.map.remove(&table.history);
            }
            self.vacant.push(slot);
            self.n_tables -= 1;
        }
    }

    pub fn table(&self, handle: &LookaheadHandle) -> ContextLookahead<'_> {
        match self.tables[handle.slot].as_ref() {
            Some(table) => ContextLookahead {
                structure: &self.structure,
                table,
            },
            None => unreachable!("handle refers to an evicted table"),
        }
    }

    pub fn collect_statistics(&mut self) {
        self.statistics.tables.record(self.n_tables as f64);
        self.statistics.active_tables.record(self.n_active_tables() as f64);
        metrics::record_lookahead_tables(self.n_tables, self.n_active_tables());
    }

    pub fn statistics(&self) -> &CacheStatistics {
        &self.statistics
    }

    pub fn reset_statistics(&mut self) {
        self.statistics.reset();
    }

    pub fn log_statistics(&self) {
        self.statistics.log();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateTreeConfig;
    use crate::testutil;

    fn setup(low: u32, high: u32) -> (StateTree, Arc<Lexicon>, LanguageModelLookahead) {
        let lexicon = Arc::new(testutil::prefix_lexicon());
        let am = testutil::acoustic_model(&lexicon, false);
        let tree = StateTree::build(&lexicon, &am, &StateTreeConfig::default()).unwrap();
        let config = LookaheadConfig {
            enabled: true,
            cache_size_low: low,
            cache_size_high: high,
            ..LookaheadConfig::default()
        };
        let structure = Arc::new(LookaheadStructure::build(&tree, &lexicon, &config, 1.0).unwrap());
        let lm: Arc<dyn LanguageModel> = Arc::new(testutil::prefix_bigram(&lexicon));
        let la = LanguageModelLookahead::new(&config, structure, lm);
        (tree, lexicon, la)
    }

    fn history(lexicon: &Lexicon, orth: &str) -> History {
        let lemma = lexicon.lemma_by_orth(orth).unwrap();
        History::new(vec![lexicon.lemma(lemma).lm_token.unwrap()])
    }

    #[test]
    fn test_scores_are_optimistic() {
        let (tree, lexicon, mut la) = setup(0, 10);
        let lm = testutil::prefix_bigram(&lexicon);
        let h = lm.start_history();
        let handle = la.get_lookahead(&h);
        let table = la.table(&handle);

        for s in 0..tree.n_states() {
            for exit in tree.word_ends(s) {
                let lp = lexicon.lemma_pronunciation(exit.pronunciation);
                let exact = lexicon
                    .lm_token(exit.pronunciation)
                    .map_or(0.0, |t| lm.scale() * lm.score(&h, t))
                    + lp.score;
                assert!(table.score(s) <= exact + 1e-4);
            }
            // a state is never more optimistic than its successors allow
            for ss in tree.successors(s) {
                assert!(table.score(s) <= table.score(ss) + 1e-4);
            }
        }
        la.release(handle);
    }

    #[test]
    fn test_same_history_shares_table() {
        let (_, lexicon, mut la) = setup(0, 10);
        let h = history(&lexicon, "ab");
        let a = la.get_lookahead(&h);
        let b = la.get_lookahead(&h);
        assert_eq!(a.table_id(), b.table_id());
        assert_eq!(la.statistics().misses, 1);
        assert_eq!(la.statistics().share_hits, 1);
        assert_eq!(la.n_tables(), 1);

        la.release(a);
        la.release(b);
        // storage is kept on the free list
        assert_eq!(la.n_tables(), 1);
        assert_eq!(la.n_free_tables(), 1);

        let c = la.try_to_get_lookahead(&h).unwrap();
        assert_eq!(la.statistics().free_hits, 1);
        assert_eq!(la.n_free_tables(), 0);
        la.release(c);
    }

    #[test]
    fn test_try_to_get_does_not_compute() {
        let (_, lexicon, mut la) = setup(0, 10);
        assert!(la.try_to_get_lookahead(&history(&lexicon, "ab")).is_none());
        assert_eq!(la.n_tables(), 0);
        assert_eq!(la.statistics().misses, 0);
    }

    #[test]
    fn test_free_tables_are_reused_oldest_first() {
        let (_, lexicon, mut la) = setup(0, 10);
        let ha = history(&lexicon, "ab");
        let hb = history(&lexicon, "ac");
        let hc = history(&lexicon, "b");

        let a = la.get_lookahead(&ha);
        let b = la.get_lookahead(&hb);
        let (slot_a, slot_b) = (a.table_id(), b.table_id());
        la.release(a);
        la.release(b);

        // above the low mark a free table is relabelled instead of allocating
        let c = la.get_lookahead(&hc);
        assert_eq!(c.table_id(), slot_a);
        assert_eq!(la.n_tables(), 2);
        assert!(la.try_to_get_lookahead(&ha).is_none());
        let b = la.try_to_get_lookahead(&hb).unwrap();
        assert_eq!(b.table_id(), slot_b);
        la.release(b);
        la.release(c);
    }

    #[test]
    fn test_high_mark_bounds_tables() {
        let (_, lexicon, mut la) = setup(0, 1);
        let histories: Vec<History> = ["ab", "ac", "b"].iter().map(|o| history(&lexicon, o)).collect();

        // three tables in use at once exceed the mark
        let handles: Vec<_> = histories.iter().map(|h| la.get_lookahead(h)).collect();
        assert_eq!(la.n_tables(), 3);
        for handle in handles {
            la.release(handle);
            assert!(la.n_tables() <= 3);
        }
        assert!(la.n_tables() <= 1);

        for h in &histories {
            let handle = la.get_lookahead(h);
            assert!(la.n_tables() <= 2);
            la.release(handle);
            assert!(la.n_tables() <= 1);
        }
    }

    #[test]
    fn test_low_mark_allocates() {
        let (_, lexicon, mut la) = setup(2, 10);
        let a = la.get_lookahead(&history(&lexicon, "ab"));
        la.release(a);
        let b = la.get_lookahead(&history(&lexicon, "ac"));
        // still below the low mark, so a new table was created
        assert_eq!(la.n_tables(), 2);
        la.release(b);
    }

    #[test]
    fn test_short_history_is_padded() {
        let (_, lexicon, mut la) = setup(0, 10);
        let a = la.get_lookahead(&History::empty());
        let b = la.get_lookahead(&History::new(vec![WordId::SENTENCE_BEGIN]));
        assert_eq!(a.table_id(), b.table_id());
        la.release(a);
        la.release(b);
        let _ = lexicon;
    }

    #[test]
    fn test_pruned_structure_still_covers_all_states() {
        let lexicon = testutil::prefix_lexicon();
        let am = testutil::acoustic_model(&lexicon, false);
        let tree = StateTree::build(&lexicon, &am, &StateTreeConfig::default()).unwrap();
        let full = LookaheadStructure::build(&tree, &lexicon, &LookaheadConfig::default(), 1.0).unwrap();
        let config = LookaheadConfig {
            tree_cutoff: 2,
            minimum_representation: 2,
            ..LookaheadConfig::default()
        };
        let reduced = LookaheadStructure::build(&tree, &lexicon, &config, 1.0).unwrap();
        assert!(reduced.n_entries() < full.n_entries());
        for s in 0..tree.n_states() {
            assert!((reduced.node_of(s) as usize) < reduced.n_entries());
        }

        let mut out = Vec::new();
        reduced.write_dot(&mut out, &lexicon).unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("digraph"));
    }

    #[test]
    fn test_set_language_model_requires_released_tables() {
        let (_, lexicon, mut la) = setup(0, 10);
        let handle = la.get_lookahead(&history(&lexicon, "ab"));
        let lm: Arc<dyn LanguageModel> = Arc::new(testutil::prefix_bigram(&lexicon));
        assert!(la.set_language_model(Arc::clone(&lm)).is_err());
        la.release(handle);
        la.set_language_model(lm).unwrap();
        assert_eq!(la.n_tables(), 0);
    }
}
