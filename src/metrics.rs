//! Decoder metrics.
//!
//! Metrics are emitted through the `metrics` facade; whichever recorder the
//! embedding application installs receives them. Without a recorder every
//! call is a no-op.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use std::time::Instant;
use tracing::debug;

static REGISTERED: OnceCell<()> = OnceCell::new();

/// Register all metrics with their descriptions. Safe to call repeatedly.
pub fn register_metrics() {
    REGISTERED.get_or_init(|| {
        describe_counter!("decoder_frames_total", "Total number of frames fed to the search");
        describe_histogram!(
            "decoder_feed_duration_seconds",
            "Duration of one search step in seconds"
        );
        describe_histogram!(
            "decoder_state_hypotheses",
            "State hypotheses per frame, labelled by pruning stage"
        );
        describe_histogram!(
            "decoder_active_trees",
            "Active tree copies per frame, labelled by pruning stage"
        );
        describe_histogram!(
            "decoder_word_ends",
            "Word-end hypotheses per frame, labelled by pruning stage"
        );
        describe_histogram!(
            "decoder_pruning_threshold",
            "Histogram pruning thresholds relative to the best score"
        );
        describe_counter!(
            "decoder_pruning_relaxations_total",
            "Number of times pre-pruning was relaxed to keep the search alive"
        );
        describe_counter!(
            "decoder_empty_search_space_total",
            "Number of frames at which the search space became empty"
        );
        describe_counter!(
            "lookahead_requests_total",
            "LM lookahead table requests, labelled share_hit, free_hit or miss"
        );
        describe_gauge!("lookahead_tables", "Number of allocated lookahead tables");
        describe_gauge!("lookahead_active_tables", "Number of referenced lookahead tables");
        describe_counter!(
            "state_tree_source_total",
            "State tree acquisitions, labelled loaded, built or rebuilt"
        );
    });
}

/// Pruning stage label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruningStage {
    BeforePruning,
    AfterPrePruning,
    AfterPruning,
    AfterRecombination,
}

impl PruningStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PruningStage::BeforePruning => "before_pruning",
            PruningStage::AfterPrePruning => "after_pre_pruning",
            PruningStage::AfterPruning => "after_pruning",
            PruningStage::AfterRecombination => "after_recombination",
        }
    }
}

/// Timer for measuring operation durations.
pub struct MetricsTimer {
    name: &'static str,
    start: Instant,
}

impl MetricsTimer {
    /// Create a new timer for the given metric.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            let duration = self.start.elapsed();
            histogram!(self.name).record(duration.as_secs_f64());
            debug!("Recorded metric '{}': {}us", self.name, duration.as_micros());
        }
    }
}

pub fn record_frame() {
    counter!("decoder_frames_total").increment(1);
}

pub fn record_state_hypotheses(stage: PruningStage, hypotheses: usize, trees: usize) {
    histogram!("decoder_state_hypotheses", "stage" => stage.as_str()).record(hypotheses as f64);
    histogram!("decoder_active_trees", "stage" => stage.as_str()).record(trees as f64);
}

pub fn record_word_ends(stage: PruningStage, word_ends: usize) {
    histogram!("decoder_word_ends", "stage" => stage.as_str()).record(word_ends as f64);
}

pub fn record_histogram_threshold(kind: &'static str, relative_threshold: f32) {
    histogram!("decoder_pruning_threshold", "kind" => kind).record(relative_threshold as f64);
}

pub fn record_pruning_relaxation() {
    counter!("decoder_pruning_relaxations_total").increment(1);
}

pub fn record_empty_search_space() {
    counter!("decoder_empty_search_space_total").increment(1);
}

/// Lookahead cache event label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookaheadEvent {
    ShareHit,
    FreeHit,
    Miss,
}

impl LookaheadEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            LookaheadEvent::ShareHit => "share_hit",
            LookaheadEvent::FreeHit => "free_hit",
            LookaheadEvent::Miss => "miss",
        }
    }
}

pub fn record_lookahead_event(event: LookaheadEvent) {
    counter!("lookahead_requests_total", "event" => event.as_str()).increment(1);
}

pub fn record_lookahead_tables(total: usize, active: usize) {
    gauge!("lookahead_tables").set(total as f64);
    gauge!("lookahead_active_tables").set(active as f64);
}

pub fn record_state_tree_source(source: &'static str) {
    counter!("state_tree_source_total", "source" => source).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        // Recording without an installed recorder must not panic.
        register_metrics();
        register_metrics();
        record_frame();
        record_state_hypotheses(PruningStage::AfterPruning, 10, 2);
        record_word_ends(PruningStage::AfterRecombination, 3);
        record_histogram_threshold("acoustic", 12.5);
        record_pruning_relaxation();
        record_empty_search_space();
        record_lookahead_event(LookaheadEvent::FreeHit);
        record_lookahead_tables(4, 1);
        record_state_tree_source("built");
        let _timer = MetricsTimer::new("decoder_feed_duration_seconds");
    }

    #[test]
    fn test_labels() {
        assert_eq!(LookaheadEvent::ShareHit.as_str(), "share_hit");
        assert_eq!(PruningStage::AfterPrePruning.as_str(), "after_pre_pruning");
    }
}
