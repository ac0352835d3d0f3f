//! Node scoring for the `score` placement policy.
//!
//! Evaluates candidates using a weighted combination of:
//! - **Load**: prefer nodes with a low 15-minute load average
//! - **Memory**: prefer nodes with more available memory
//! - **Swap**: prefer nodes with more available swap
//!
//! Scores range over `0.0..=100.0`, higher is better.

use crate::candidate::Candidate;

/// Weights for the scoring components.
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub load: f64,
    pub mem: f64,
    pub swap: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            load: 0.5,
            mem: 0.3,
            swap: 0.2,
        }
    }
}

/// Score a single candidate.
pub fn score_candidate(c: &Candidate, weights: &ScoringWeights) -> f64 {
    let load = 100.0 / (1.0 + c.load_15m.max(0.0));
    let mem = c.mem_avail.clamp(0.0, 100.0);
    let swap = c.swap_avail.clamp(0.0, 100.0);

    let total = weights.load + weights.mem + weights.swap;
    if total <= 0.0 {
        return 0.0;
    }
    (weights.load * load + weights.mem * mem + weights.swap * swap) / total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_node_scores_full() {
        let c = Candidate::new("n1", 0);
        let score = score_candidate(&c, &ScoringWeights::default());
        assert!((score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn load_lowers_score() {
        let idle = Candidate::new("n1", 0);
        let mut busy = Candidate::new("n2", 1);
        busy.load_15m = 3.0;
        let weights = ScoringWeights::default();
        assert!(score_candidate(&idle, &weights) > score_candidate(&busy, &weights));
    }

    #[test]
    fn weights_select_components() {
        let mut low_mem = Candidate::new("n1", 0);
        low_mem.mem_avail = 10.0;
        low_mem.load_15m = 9.0;
        let weights = ScoringWeights {
            load: 0.0,
            mem: 1.0,
            swap: 0.0,
        };
        assert!((score_candidate(&low_mem, &weights) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn zero_weights_score_zero() {
        let weights = ScoringWeights {
            load: 0.0,
            mem: 0.0,
            swap: 0.0,
        };
        assert_eq!(score_candidate(&Candidate::new("n1", 0), &weights), 0.0);
    }
}
