use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::training::lit_agent::StepMetrics;

/// Rolling-window view over recent training steps.
pub struct TrainingMetrics {
    steps: VecDeque<StepMetrics>,
    capacity: usize,
    total_steps: usize, // lifetime count, never capped
    window_start: Instant,
    window_steps: usize,
    window_overhead: Duration, // checkpoint time excluded from throughput
}

impl TrainingMetrics {
    pub fn with_capacity(capacity: usize) -> Self {
        TrainingMetrics {
            steps: VecDeque::with_capacity(capacity),
            capacity,
            total_steps: 0,
            window_start: Instant::now(),
            window_steps: 0,
            window_overhead: Duration::ZERO,
        }
    }

    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    pub fn record_step(&mut self, step: StepMetrics) {
        self.total_steps += 1;
        self.window_steps += 1;
        self.steps.push_back(step);
        if self.steps.len() > self.capacity {
            self.steps.pop_front();
        }
    }

    /// Time spent outside training steps, excluded from `steps_per_sec`.
    pub fn record_overhead(&mut self, d: Duration) {
        self.window_overhead += d;
    }

    fn average(&self, last_n: usize, field: impl Fn(&StepMetrics) -> f32) -> f32 {
        let n = self.steps.len().min(last_n);
        if n == 0 {
            return 0.0;
        }
        let sum: f32 = self.steps.iter().rev().take(n).map(field).sum();
        sum / n as f32
    }

    pub fn average_reward(&self, last_n: usize) -> f32 {
        self.average(last_n, |s| s.mean_reward)
    }

    pub fn average_kl(&self, last_n: usize) -> f32 {
        self.average(last_n, |s| s.mean_kl)
    }

    pub fn average_loss(&self, last_n: usize) -> f32 {
        self.average(last_n, |s| s.loss)
    }

    pub fn average_objective(&self, last_n: usize) -> f32 {
        self.average(last_n, |s| s.objective)
    }

    pub fn average_response_len(&self, last_n: usize) -> f32 {
        self.average(last_n, |s| s.response_len)
    }

    pub fn average_rollout_entropy(&self, last_n: usize) -> f32 {
        self.average(last_n, |s| s.rollout_entropy)
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Steps per second since the last `reset_window` call.
    pub fn steps_per_sec(&self) -> f32 {
        let net = self.window_start.elapsed().saturating_sub(self.window_overhead);
        if net.is_zero() {
            return 0.0;
        }
        self.window_steps as f32 / net.as_secs_f32()
    }

    /// Reset the throughput window (call after each log interval).
    pub fn reset_window(&mut self) {
        self.window_start = Instant::now();
        self.window_steps = 0;
        self.window_overhead = Duration::ZERO;
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(reward: f32, kl: f32, loss: f32) -> StepMetrics {
        StepMetrics {
            mean_reward: reward,
            mean_kl: kl,
            loss,
            ..Default::default()
        }
    }

    #[test]
    fn test_rolling_averages() {
        let mut m = TrainingMetrics::new();
        m.record_step(step(1.0, 0.1, 2.0));
        m.record_step(step(3.0, 0.3, 4.0));
        assert!((m.average_reward(10) - 2.0).abs() < 1e-6);
        assert!((m.average_kl(10) - 0.2).abs() < 1e-6);
        assert!((m.average_loss(10) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_rollout_entropy_average() {
        let mut m = TrainingMetrics::new();
        for e in [0.5, 1.5] {
            m.record_step(StepMetrics {
                rollout_entropy: e,
                ..Default::default()
            });
        }
        assert!((m.average_rollout_entropy(10) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_average_uses_last_n() {
        let mut m = TrainingMetrics::new();
        for r in [0.0, 0.0, 5.0] {
            m.record_step(step(r, 0.0, 0.0));
        }
        assert!((m.average_reward(1) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_capacity_caps_window_not_total() {
        let mut m = TrainingMetrics::with_capacity(2);
        for r in [10.0, 1.0, 3.0] {
            m.record_step(step(r, 0.0, 0.0));
        }
        assert_eq!(m.total_steps(), 3);
        assert!((m.average_reward(100) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_metrics_are_zero() {
        let m = TrainingMetrics::new();
        assert_eq!(m.average_loss(10), 0.0);
        assert_eq!(m.average_rollout_entropy(10), 0.0);
        assert_eq!(m.total_steps(), 0);
    }

    #[test]
    fn test_overhead_excluded_from_steps_per_sec() {
        let mut m = TrainingMetrics::new();
        m.record_step(StepMetrics::default());
        m.record_overhead(Duration::from_secs(9999));
        assert_eq!(m.steps_per_sec(), 0.0);

        m.reset_window();
        m.record_step(StepMetrics::default());
        std::thread::sleep(Duration::from_millis(5));
        assert!(m.steps_per_sec() > 0.0);
    }
}
