//! In-process search statistics, logged on demand.

use std::fmt;
use tracing::info;

/// Count, extrema and mean of an observed quantity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningStatistic {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl RunningStatistic {
    pub fn record(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for RunningStatistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mean() {
            Some(mean) => write!(
                f,
                "n={} min={:.1} avg={:.2} max={:.1}",
                self.count, self.min, mean, self.max
            ),
            None => write!(f, "n=0"),
        }
    }
}

/// Per-frame search space sizes.
#[derive(Debug, Clone, Default)]
pub struct SearchSpaceStatistics {
    pub trees_before_pruning: RunningStatistic,
    pub trees_after_pre_pruning: RunningStatistic,
    pub trees_after_pruning: RunningStatistic,
    pub states_before_pruning: RunningStatistic,
    pub states_after_pre_pruning: RunningStatistic,
    pub states_after_pruning: RunningStatistic,
    pub word_ends_before_pruning: RunningStatistic,
    pub word_ends_after_pruning: RunningStatistic,
    pub epsilon_word_ends_added: RunningStatistic,
    pub word_ends_after_recombination: RunningStatistic,
    pub word_ends_after_second_pruning: RunningStatistic,
    pub acoustic_histogram_pruning: RunningStatistic,
    pub lm_histogram_pruning: RunningStatistic,
    pub live_traces: RunningStatistic,
    pub pruning_relaxations: u64,
}

impl SearchSpaceStatistics {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn log(&self) {
        info!(target: "lextree::statistics", "trees before pruning: {}", self.trees_before_pruning);
        info!(target: "lextree::statistics", "trees after pre-pruning: {}", self.trees_after_pre_pruning);
        info!(target: "lextree::statistics", "trees after pruning: {}", self.trees_after_pruning);
        info!(target: "lextree::statistics", "states before pruning: {}", self.states_before_pruning);
        info!(target: "lextree::statistics", "states after pre-pruning: {}", self.states_after_pre_pruning);
        info!(target: "lextree::statistics", "states after pruning: {}", self.states_after_pruning);
        info!(target: "lextree::statistics", "word ends before pruning: {}", self.word_ends_before_pruning);
        info!(target: "lextree::statistics", "word ends after pruning: {}", self.word_ends_after_pruning);
        info!(target: "lextree::statistics", "epsilon word ends added: {}", self.epsilon_word_ends_added);
        info!(target: "lextree::statistics", "word ends after recombination: {}", self.word_ends_after_recombination);
        info!(target: "lextree::statistics", "word ends after second pruning: {}", self.word_ends_after_second_pruning);
        info!(target: "lextree::statistics", "acoustic histogram pruning: {}", self.acoustic_histogram_pruning);
        info!(target: "lextree::statistics", "lm histogram pruning: {}", self.lm_histogram_pruning);
        info!(target: "lextree::statistics", "live traces: {}", self.live_traces);
        info!(target: "lextree::statistics", "pruning relaxations: {}", self.pruning_relaxations);
    }
}

/// Lookahead cache behaviour.
#[derive(Debug, Clone, Default)]
pub struct CacheStatistics {
    pub share_hits: u64,
    pub free_hits: u64,
    pub misses: u64,
    pub tables: RunningStatistic,
    pub active_tables: RunningStatistic,
}

impl CacheStatistics {
    pub fn requests(&self) -> u64 {
        self.share_hits + self.free_hits + self.misses
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn log(&self) {
        info!(
            target: "lextree::statistics",
            share_hits = self.share_hits,
            free_hits = self.free_hits,
            misses = self.misses,
            "lookahead cache requests: {}",
            self.requests()
        );
        info!(target: "lextree::statistics", "lookahead tables: {}", self.tables);
        info!(target: "lextree::statistics", "active lookahead tables: {}", self.active_tables);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_statistic() {
        let mut stat = RunningStatistic::default();
        assert_eq!(stat.mean(), None);
        assert_eq!(stat.to_string(), "n=0");

        stat.record(4.0);
        stat.record(2.0);
        stat.record(6.0);
        assert_eq!(stat.count(), 3);
        assert_eq!(stat.min(), Some(2.0));
        assert_eq!(stat.max(), Some(6.0));
        assert_eq!(stat.mean(), Some(4.0));

        stat.reset();
        assert_eq!(stat.count(), 0);
    }

    #[test]
    fn test_cache_statistics() {
        let mut stats = CacheStatistics::default();
        stats.share_hits = 2;
        stats.misses = 1;
        assert_eq!(stats.requests(), 3);
        stats.log();
        stats.reset();
        assert_eq!(stats.requests(), 0);
    }
}
