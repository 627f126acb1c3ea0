//! Weighted moving average over recent delay observations
//!
//! The newest observation gets weight 1, the i-th newest weight 1/i.

use std::collections::VecDeque;

use crate::constants::DELAY_HISTORY_CAPACITY;

/// Bounded history of delay observations, oldest first
#[derive(Debug, Clone)]
pub struct DelaySmoother {
    history: VecDeque<f64>,
    capacity: usize,
}

impl DelaySmoother {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add an observation (seconds) and return the smoothed delay
    pub fn push(&mut self, observation: f64) -> f64 {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(observation);
        self.weighted_average()
    }

    /// Smoothed delay over the current window, `None` before the first push
    pub fn current(&self) -> Option<f64> {
        (!self.history.is_empty()).then(|| self.weighted_average())
    }

    fn weighted_average(&self) -> f64 {
        let mut sum = 0.0;
        let mut weights = 0.0;
        for (i, value) in self.history.iter().rev().enumerate() {
            let weight = 1.0 / (i + 1) as f64;
            sum += value * weight;
            weights += weight;
        }
        if weights > 0.0 {
            sum / weights
        } else {
            0.0
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DelaySmoother {
    fn default() -> Self {
        Self::new(DELAY_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_observation_is_returned() {
        let mut smoother = DelaySmoother::default();
        assert_eq!(smoother.current(), None);
        assert_eq!(smoother.push(0.25), 0.25);
    }

    #[test]
    fn test_weights_follow_harmonic_series() {
        let mut smoother = DelaySmoother::default();
        smoother.push(0.3);
        let smoothed = smoother.push(0.6);
        // (0.6 / 1 + 0.3 / 2) / (1 + 1/2)
        assert!((smoothed - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_ramp_lands_between_mean_and_newest() {
        let mut smoother = DelaySmoother::default();
        let values: Vec<f64> = (1..=20).map(|i| i as f64 * 10.0).collect();
        let mut last = 0.0;
        for v in &values {
            last = smoother.push(*v);
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        assert!(last > mean, "{} should exceed mean {}", last, mean);
        assert!(last < 200.0);

        let mut replay = DelaySmoother::default();
        let mut again = 0.0;
        for v in &values {
            again = replay.push(*v);
        }
        assert_eq!(last, again);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut noisy = DelaySmoother::default();
        let mut clean = DelaySmoother::default();
        for _ in 0..5 {
            noisy.push(1000.0);
        }
        let mut a = 0.0;
        let mut b = 0.0;
        for i in 0..20 {
            a = noisy.push(i as f64);
            b = clean.push(i as f64);
        }
        assert_eq!(noisy.len(), 20);
        assert_eq!(a, b);
    }

    #[test]
    fn test_reset_empties_window() {
        let mut smoother = DelaySmoother::new(4);
        for i in 0..10 {
            smoother.push(i as f64);
        }
        assert_eq!(smoother.len(), 4);
        smoother.reset();
        assert!(smoother.is_empty());
        assert_eq!(smoother.push(2.0), 2.0);
    }
}
