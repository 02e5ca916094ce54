//! Back-pointer arena.
//!
//! Every word boundary the search commits to becomes a trace: the words up
//! to that boundary are found by following predecessor indices. Alternative
//! word ends recombined into the same trace are chained through `sibling`
//! and only matter for lattices.

use crate::types::{PronunciationId, ScoreVector, TimeframeIndex, Transit};

pub type TraceId = u32;

#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub predecessor: Option<TraceId>,
    pub sibling: Option<TraceId>,
    /// `None` for the sentence begin and for sentence ends.
    pub pronunciation: Option<PronunciationId>,
    pub time: TimeframeIndex,
    pub score: ScoreVector,
    pub transit: Transit,
}

impl Trace {
    pub fn new(
        predecessor: Option<TraceId>,
        pronunciation: Option<PronunciationId>,
        time: TimeframeIndex,
        score: ScoreVector,
        transit: Transit,
    ) -> Self {
        Self {
            predecessor,
            sibling: None,
            pronunciation,
            time,
            score,
            transit,
        }
    }
}

/// Index arena of traces with mark-and-sweep reclamation.
#[derive(Debug, Default)]
pub struct TraceArena {
    slots: Vec<Option<Trace>>,
    vacant: Vec<TraceId>,
    live: usize,
    marks: Vec<bool>,
    stack: Vec<TraceId>,
}

impl TraceArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, trace: Trace) -> TraceId {
        self.live += 1;
        match self.vacant.pop() {
            Some(id) => {
                self.slots[id as usize] = Some(trace);
                id
            }
            None => {
                self.slots.push(Some(trace));
                (self.slots.len() - 1) as TraceId
            }
        }
    }

    pub fn get(&self, id: TraceId) -> &Trace {
        match &self.slots[id as usize] {
            Some(trace) => trace,
            None => unreachable!("trace {} was reclaimed", id),
        }
    }

    pub fn get_mut(&mut self, id: TraceId) -> &mut Trace {
        match &mut self.slots[id as usize] {
            Some(trace) => trace,
            None => unreachable!("trace {} was reclaimed", id),
        }
    }

    pub fn contains(&self, id: TraceId) -> bool {
        matches!(self.slots.get(id as usize), Some(Some(_)))
    }

    /// Number of traces in use.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.vacant.clear();
        self.live = 0;
    }

    /// Walk predecessors from `id` back to the sentence begin.
    pub fn ancestors(&self, id: TraceId) -> impl Iterator<Item = TraceId> + '_ {
        std::iter::successors(Some(id), move |&t| self.get(t).predecessor)
    }

    /// Siblings chained behind `id`, excluding `id` itself.
    pub fn siblings(&self, id: TraceId) -> impl Iterator<Item = TraceId> + '_ {
        std::iter::successors(self.get(id).sibling, move |&t| self.get(t).sibling)
    }

    /// Reclaim every trace not reachable from `roots` through predecessor
    /// or sibling links. Returns the number of reclaimed traces.
    pub fn collect<I: IntoIterator<Item = TraceId>>(&mut self, roots: I) -> usize {
        self.marks.clear();
        self.marks.resize(self.slots.len(), false);
        self.stack.clear();
        self.stack.extend(roots);
        while let Some(id) = self.stack.pop() {
            let i = id as usize;
            if self.marks[i] {
                continue;
            }
            self.marks[i] = true;
            if let Some(trace) = &self.slots[i] {
                self.stack.extend(trace.predecessor);
                self.stack.extend(trace.sibling);
            }
        }

        let mut reclaimed = 0;
        // pushed in descending order so the lowest free slot is reused first
        for i in (0..self.slots.len()).rev() {
            if !self.marks[i] && self.slots[i].is_some() {
                self.slots[i] = None;
                self.vacant.push(i as TraceId);
                reclaimed += 1;
            }
        }
        self.live -= reclaimed;
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(predecessor: Option<TraceId>, time: TimeframeIndex) -> Trace {
        Trace::new(predecessor, None, time, ScoreVector::default(), Transit::default())
    }

    #[test]
    fn test_ancestors() {
        let mut arena = TraceArena::new();
        let a = arena.insert(trace(None, 0));
        let b = arena.insert(trace(Some(a), 3));
        let c = arena.insert(trace(Some(b), 5));
        assert_eq!(arena.ancestors(c).collect::<Vec<_>>(), vec![c, b, a]);
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn test_collect_keeps_reachable() {
        let mut arena = TraceArena::new();
        let root = arena.insert(trace(None, 0));
        let kept = arena.insert(trace(Some(root), 2));
        let dead = arena.insert(trace(Some(root), 2));
        let sibling = arena.insert(trace(Some(dead), 4));
        arena.get_mut(kept).sibling = Some(sibling);

        let orphan = arena.insert(trace(None, 1));
        assert_eq!(arena.collect([kept]), 1);
        assert!(!arena.contains(orphan));
        assert!(arena.contains(dead));
        assert!(arena.contains(root));
        assert_eq!(arena.siblings(kept).collect::<Vec<_>>(), vec![sibling]);

        // reclaimed slots are reused
        let fresh = arena.insert(trace(None, 9));
        assert_eq!(fresh, orphan);
        assert_eq!(arena.len(), 5);
    }

    #[test]
    fn test_collect_everything() {
        let mut arena = TraceArena::new();
        let a = arena.insert(trace(None, 0));
        arena.insert(trace(Some(a), 1));
        assert_eq!(arena.collect(std::iter::empty()), 2);
        assert!(arena.is_empty());
    }
}
