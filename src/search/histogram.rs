//! Fixed-bin score histogram for rank-limited pruning.
//!
//! Converting "keep the best K hypotheses" into a score threshold by
//! binning instead of sorting keeps histogram pruning O(n + bins).

use crate::types::Score;

#[derive(Debug, Clone)]
pub struct Histogram {
    bins: Vec<u32>,
    lower: Score,
    upper: Score,
    scale: Score,
    total: u32,
}

impl Histogram {
    /// Create a histogram with `n_bins` bins over the range `[0, 1)`.
    pub fn new(n_bins: u32) -> Self {
        assert!(n_bins > 0, "histogram needs at least one bin");
        Self {
            bins: vec![0; n_bins as usize],
            lower: 0.0,
            upper: 1.0,
            scale: n_bins as Score,
            total: 0,
        }
    }

    pub fn n_bins(&self) -> usize {
        self.bins.len()
    }

    pub fn clear(&mut self) {
        self.bins.iter_mut().for_each(|b| *b = 0);
        self.total = 0;
    }

    /// Set the covered score range. Does not clear the counts.
    pub fn set_limits(&mut self, lower: Score, upper: Score) {
        assert!(
            lower < upper,
            "histogram limits must satisfy lower < upper ({} >= {})",
            lower,
            upper
        );
        self.lower = lower;
        self.upper = upper;
        self.scale = self.bins.len() as Score / (upper - lower);
    }

    pub fn limits(&self) -> (Score, Score) {
        (self.lower, self.upper)
    }

    fn bin_of(&self, score: Score) -> usize {
        debug_assert!(score >= self.lower, "score {} below histogram range", score);
        // negative offsets saturate to bin 0
        let bin = ((score - self.lower) * self.scale) as usize;
        bin.min(self.bins.len() - 1)
    }

    /// Count one score. Scores at or above the upper limit land in the last bin.
    pub fn insert(&mut self, score: Score) {
        let bin = self.bin_of(score);
        self.bins[bin] += 1;
        self.total += 1;
    }

    /// Threshold keeping at least `rank` scores.
    ///
    /// Scans from the best bin until the cumulative count reaches `rank` and
    /// returns the upper edge of that boundary bin, which is the start of the
    /// following bin. Pruning keeps `score <= threshold`, so the whole
    /// boundary bin survives and ties never cut the kept set below `rank`;
    /// the lower edge of the boundary bin would drop scores the rank still
    /// counts. The last bin maps to the upper limit.
    pub fn quantile(&self, rank: u32) -> Score {
        let mut sum = 0;
        for (i, &count) in self.bins.iter().enumerate() {
            sum += count;
            if sum >= rank {
                return self.bin_start(i + 1);
            }
        }
        self.upper
    }

    fn bin_start(&self, bin: usize) -> Score {
        if bin >= self.bins.len() {
            self.upper
        } else {
            self.lower + bin as Score / self.scale
        }
    }

    /// Number of scores in bins up to and including the bin of `score`.
    pub fn offset(&self, score: Score) -> u32 {
        let bin = self.bin_of(score);
        self.bins[..=bin].iter().sum()
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_score_counted_once() {
        for &(lower, upper, bins) in &[(0.0, 10.0, 10u32), (-5.0, 5.0, 7), (100.0, 101.0, 100)] {
            let mut h = Histogram::new(bins);
            h.set_limits(lower, upper);
            let n = 50;
            for i in 0..n {
                h.insert(lower + (upper - lower) * (i as Score + 0.5) / n as Score);
            }
            assert_eq!(h.total(), n);
            assert_eq!(h.offset(upper), n);
        }
    }

    #[test]
    fn test_quantile_keeps_rank() {
        let mut h = Histogram::new(20);
        h.set_limits(0.0, 20.0);
        let scores: Vec<Score> = (0..40).map(|i| (i % 20) as Score + 0.5).collect();
        for &s in &scores {
            h.insert(s);
        }

        let mut previous = Score::NEG_INFINITY;
        for k in 1..=h.total() {
            let theta = h.quantile(k);
            let kept = scores.iter().filter(|&&s| s < theta).count() as u32;
            assert!(kept >= k, "rank {} kept only {}", k, kept);
            assert!(theta >= previous, "quantile not monotonic at {}", k);
            previous = theta;
        }
    }

    #[test]
    fn test_quantile_boundaries() {
        let mut h = Histogram::new(4);
        h.set_limits(0.0, 4.0);
        h.insert(0.5);
        h.insert(0.7);
        h.insert(2.5);
        assert_eq!(h.quantile(1), 1.0);
        assert_eq!(h.quantile(2), 1.0);
        assert_eq!(h.quantile(3), 3.0);
        assert_eq!(h.quantile(10), 4.0);
    }

    #[test]
    fn test_quantile_keeps_whole_boundary_bin() {
        let mut h = Histogram::new(4);
        h.set_limits(0.0, 4.0);
        let scores = [0.2, 0.4, 0.9, 1.5];
        for &s in &scores {
            h.insert(s);
        }
        let theta = h.quantile(1);
        assert_eq!(theta, 1.0);
        // the lower edge of bin 0 would keep nothing
        assert_eq!(scores.iter().filter(|&&s| s <= theta).count(), 3);
    }

    #[test]
    fn test_overflow_lands_in_last_bin() {
        let mut h = Histogram::new(4);
        h.set_limits(0.0, 4.0);
        h.insert(100.0);
        assert_eq!(h.offset(3.5), 1);
        assert_eq!(h.offset(2.5), 0);
        assert_eq!(h.quantile(1), 4.0);
    }

    #[test]
    fn test_clear_and_reuse() {
        let mut h = Histogram::new(3);
        h.set_limits(0.0, 3.0);
        h.insert(1.5);
        h.clear();
        assert_eq!(h.total(), 0);
        h.set_limits(10.0, 13.0);
        h.insert(10.1);
        assert_eq!(h.quantile(1), 11.0);
    }

    #[test]
    #[should_panic]
    fn test_rejects_empty_range() {
        let mut h = Histogram::new(3);
        h.set_limits(1.0, 1.0);
    }

    #[test]
    #[should_panic]
    fn test_rejects_zero_bins() {
        let _ = Histogram::new(0);
    }
}
