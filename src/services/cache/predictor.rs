use std::collections::VecDeque;
use std::time::{Duration, Instant};

const MAX_ACCESS_HISTORY: usize = 32;

/// Given an access pattern (recent access timestamps for one fingerprint),
/// produce a recommended TTL and a [0,1] "likelihood of near-future re-access"
/// score. Implementations must be deterministic functions of the observed
/// access history — no hidden randomness.
pub trait PredictionEngine: Send + Sync {
    fn recommend_ttl(&self, history: &AccessHistory, min_ttl: Duration, max_ttl: Duration) -> Duration;
    fn predict_score(&self, history: &AccessHistory) -> f64;
}

/// Bounded ring of recent access instants for one fingerprint.
#[derive(Debug, Clone, Default)]
pub struct AccessHistory {
    accesses: VecDeque<Instant>,
}

impl AccessHistory {
    pub fn record_access(&mut self, at: Instant) {
        if self.accesses.len() >= MAX_ACCESS_HISTORY {
            self.accesses.pop_front();
        }
        self.accesses.push_back(at);
    }

    pub fn access_count(&self) -> usize {
        self.accesses.len()
    }

    /// Mean interval between consecutive accesses, if at least two exist.
    fn mean_interval(&self) -> Option<Duration> {
        if self.accesses.len() < 2 {
            return None;
        }
        let mut total = Duration::ZERO;
        let mut count = 0u32;
        for pair in self.accesses.iter().collect::<Vec<_>>().windows(2) {
            total += pair[1].duration_since(*pair[0]);
            count += 1;
        }
        Some(total / count.max(1))
    }
}

/// A frequency-weighted predictor: entries accessed more often, and more
/// recently, get a higher re-access score and a longer recommended TTL
/// (clamped to [min_ttl, max_ttl]). Entries with a single observed access
/// get the midpoint TTL and a neutral 0.5 score.
pub struct FrequencyWeightedPredictor;

impl PredictionEngine for FrequencyWeightedPredictor {
    fn recommend_ttl(&self, history: &AccessHistory, min_ttl: Duration, max_ttl: Duration) -> Duration {
        match history.mean_interval() {
            Some(interval) => interval.clamp(min_ttl, max_ttl),
            None => {
                let midpoint = (min_ttl.as_millis() + max_ttl.as_millis()) / 2;
                Duration::from_millis(midpoint as u64).clamp(min_ttl, max_ttl)
            }
        }
    }

    fn predict_score(&self, history: &AccessHistory) -> f64 {
        match history.access_count() {
            0 => 0.0,
            1 => 0.5,
            n => {
                // More accesses and a tighter interval both push the score up.
                let frequency_component = (n as f64 / MAX_ACCESS_HISTORY as f64).min(1.0);
                let recency_bonus = match history.mean_interval() {
                    Some(interval) if interval < Duration::from_secs(5) => 0.3,
                    Some(interval) if interval < Duration::from_secs(60) => 0.15,
                    _ => 0.0,
                };
                (0.5 + 0.5 * frequency_component + recency_bonus).min(1.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_access_is_neutral() {
        let mut history = AccessHistory::default();
        history.record_access(Instant::now());
        let predictor = FrequencyWeightedPredictor;
        assert_eq!(predictor.predict_score(&history), 0.5);
    }

    #[test]
    fn test_no_access_has_zero_score() {
        let history = AccessHistory::default();
        let predictor = FrequencyWeightedPredictor;
        assert_eq!(predictor.predict_score(&history), 0.0);
    }

    #[test]
    fn test_ttl_is_clamped() {
        let history = AccessHistory::default();
        let predictor = FrequencyWeightedPredictor;
        let ttl = predictor.recommend_ttl(&history, Duration::from_secs(1), Duration::from_secs(600));
        assert!(ttl >= Duration::from_secs(1) && ttl <= Duration::from_secs(600));
    }
}
