//! Time-synchronous search over a lexical prefix tree.
//!
//! - [`state_tree`] and [`state_tree_io`]: the HMM state network of the
//!   lexicon and its persisted image.
//! - [`lookahead`]: optimistic LM scores per tree state, cached per history.
//! - [`wcts`]: the word-conditioned tree search driving both per frame.
//! - [`algorithm`]: the decoder contract and factory.

pub mod algorithm;
pub mod histogram;
pub mod lookahead;
pub mod state_tree;
pub mod state_tree_io;
pub mod trace;
pub mod traceback;
pub mod wcts;


pub use algorithm::{create_search_algorithm, PruningDescriptor, SearchAlgorithm};
pub use histogram::Histogram;
pub use lookahead::{LanguageModelLookahead, LookaheadHandle, LookaheadStructure};
pub use state_tree::StateTree;
pub use traceback::{Traceback, TracebackItem, WordLattice};
pub use wcts::{SessionState, WordConditionedTreeSearch};
