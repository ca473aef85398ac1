//! Tier 3: adaptive profile with canary promotion
//!
//! Health samples flow into a sliding window; once enough samples exist the
//! window average either promotes the adaptive profile one level or rolls it
//! back to a fallback tier.

use serde::Serialize;
use std::collections::VecDeque;

use crate::config::{CanaryConfig, FallbackTier, Tier3Config};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier3Status {
    Active,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CanaryAction {
    None,
    Promote,
    Rollback,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanarySample {
    pub score: f64,
    pub has_challenge: bool,
    pub challenge_count: u32,
    pub rotation_count: u32,
}

#[derive(Debug)]
pub struct CanaryWindow {
    pub level: u32,
    pub average_score: f64,
    pub last_action: CanaryAction,
    samples: VecDeque<CanarySample>,
    config: CanaryConfig,
}

impl CanaryWindow {
    fn new(config: CanaryConfig) -> Self {
        Self {
            level: 0,
            average_score: 0.0,
            last_action: CanaryAction::None,
            samples: VecDeque::new(),
            config,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn push(&mut self, sample: CanarySample) {
        if self.samples.len() >= self.config.window_size.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.average_score =
            self.samples.iter().map(|s| s.score).sum::<f64>() / self.samples.len() as f64;
    }

    fn decide(&mut self) -> CanaryAction {
        // Decisions are only meaningful with enough samples.
        if self.samples.len() < self.config.min_samples.max(1) {
            return CanaryAction::None;
        }
        if self.average_score >= self.config.promote_threshold {
            self.level += 1;
            self.last_action = CanaryAction::Promote;
            self.samples.clear();
            CanaryAction::Promote
        } else if self.average_score <= self.config.rollback_threshold {
            self.last_action = CanaryAction::Rollback;
            self.samples.clear();
            CanaryAction::Rollback
        } else {
            CanaryAction::None
        }
    }
}

#[derive(Debug)]
pub struct Tier3State {
    pub enabled: bool,
    pub status: Tier3Status,
    pub adapter_name: String,
    pub fallback_tier: FallbackTier,
    pub fallback_reason: Option<String>,
    pub canary: CanaryWindow,
    config: Tier3Config,
}

impl Tier3State {
    pub fn new(config: Tier3Config) -> Self {
        Self {
            enabled: config.enabled,
            status: Tier3Status::Active,
            adapter_name: "canary-adaptive".to_string(),
            fallback_tier: config.fallback_tier,
            fallback_reason: None,
            canary: CanaryWindow::new(config.canary.clone()),
            config,
        }
    }

    pub fn continuous_signals(&self) -> bool {
        self.config.continuous_signals
    }

    pub fn promote_threshold(&self) -> f64 {
        self.config.canary.promote_threshold
    }

    pub fn rollback_threshold(&self) -> f64 {
        self.config.canary.rollback_threshold
    }

    /// Feed one sample; a rollback flips the tier into fallback and reports
    /// which lower tier takes over.
    pub fn apply_sample(&mut self, sample: CanarySample) -> CanaryAction {
        if !self.enabled || self.status == Tier3Status::Fallback {
            return CanaryAction::None;
        }
        self.canary.push(sample);
        let action = self.canary.decide();
        if action == CanaryAction::Rollback {
            self.status = Tier3Status::Fallback;
            self.fallback_reason =
                Some(format!("canary average {:.1} at or below rollback threshold", self.canary.average_score));
        }
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(window: usize, min: usize, promote: f64, rollback: f64) -> Tier3Config {
        Tier3Config {
            enabled: true,
            canary: CanaryConfig {
                window_size: window,
                min_samples: min,
                promote_threshold: promote,
                rollback_threshold: rollback,
            },
            ..Default::default()
        }
    }

    fn sample(score: f64) -> CanarySample {
        CanarySample { score, has_challenge: false, challenge_count: 0, rotation_count: 0 }
    }

    #[test]
    fn no_decision_below_min_samples() {
        let mut state = Tier3State::new(config(10, 3, 75.0, 35.0));
        assert_eq!(state.apply_sample(sample(100.0)), CanaryAction::None);
        assert_eq!(state.apply_sample(sample(100.0)), CanaryAction::None);
    }

    #[test]
    fn high_average_promotes() {
        let mut state = Tier3State::new(config(10, 2, 75.0, 35.0));
        state.apply_sample(sample(90.0));
        let action = state.apply_sample(sample(80.0));
        assert_eq!(action, CanaryAction::Promote);
        assert_eq!(state.canary.level, 1);
        assert_eq!(state.status, Tier3Status::Active);
    }

    #[test]
    fn low_average_rolls_back_into_fallback() {
        let mut state = Tier3State::new(config(2, 1, 75.0, 40.0));
        let action = state.apply_sample(sample(5.0));
        assert_eq!(action, CanaryAction::Rollback);
        assert_eq!(state.status, Tier3Status::Fallback);
        assert!(state.fallback_reason.is_some());
    }

    #[test]
    fn fallback_state_ignores_further_samples() {
        let mut state = Tier3State::new(config(2, 1, 75.0, 40.0));
        state.apply_sample(sample(5.0));
        assert_eq!(state.apply_sample(sample(100.0)), CanaryAction::None);
        assert_eq!(state.status, Tier3Status::Fallback);
    }
}
