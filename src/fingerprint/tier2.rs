//! Tier 2: adaptive runtime profile
//!
//! Tracks a health score per persona. Challenge traffic drains the score;
//! clean traffic recovers it. In adaptive mode an unhealthy or stale persona
//! is rotated out.

use serde::Serialize;
use std::collections::VecDeque;
use uuid::Uuid;

use crate::config::{Tier2Config, Tier2Mode};

/// HTTP statuses treated as challenge responses.
const CHALLENGE_STATUSES: [i64; 3] = [403, 429, 451];

pub const MAX_HEALTH: u32 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeProfile {
    pub id: String,
    pub health_score: u32,
    pub challenge_count: u32,
    pub rotation_count: u32,
}

impl RuntimeProfile {
    fn fresh() -> Self {
        Self { id: profile_id(), health_score: MAX_HEALTH, challenge_count: 0, rotation_count: 0 }
    }
}

fn profile_id() -> String {
    let full = Uuid::new_v4().simple().to_string();
    format!("fp-{}", &full[..12])
}

#[derive(Debug, Clone, Serialize)]
pub struct ChallengeEvent {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    pub at_ms: u64,
}

/// Outcome of applying one network event to the tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tier2Outcome {
    pub applied: bool,
    pub challenged: bool,
    pub rotated: bool,
}

#[derive(Debug)]
pub struct Tier2State {
    pub enabled: bool,
    pub mode: Tier2Mode,
    pub profile: RuntimeProfile,
    pub challenge_events: VecDeque<ChallengeEvent>,
    pub last_rotation_ms: u64,
    config: Tier2Config,
}

impl Tier2State {
    pub fn new(config: Tier2Config, now_ms: u64) -> Self {
        Self {
            enabled: config.enabled,
            mode: config.mode,
            profile: RuntimeProfile::fresh(),
            challenge_events: VecDeque::new(),
            last_rotation_ms: now_ms,
            config,
        }
    }

    pub fn config(&self) -> &Tier2Config {
        &self.config
    }

    /// Continuous-signal gating for this tier.
    pub fn continuous_signals(&self) -> bool {
        self.config.continuous_signals
    }

    /// Apply one observed URL/status pair.
    pub fn apply_event(&mut self, url: &str, status: Option<i64>, now_ms: u64) -> Tier2Outcome {
        if !self.enabled {
            return Tier2Outcome::default();
        }

        let challenged = self.is_challenge(url, status);
        if challenged {
            if self.challenge_events.len() >= self.config.max_challenge_events.max(1) {
                self.challenge_events.pop_front();
            }
            self.challenge_events.push_back(ChallengeEvent {
                url: url.to_string(),
                status,
                at_ms: now_ms,
            });
            self.profile.health_score =
                self.profile.health_score.saturating_sub(self.config.score_penalty);
            self.profile.challenge_count += 1;
        } else {
            self.profile.health_score =
                (self.profile.health_score + self.config.score_recovery).min(MAX_HEALTH);
        }

        let rotated = self.maybe_rotate(now_ms);
        Tier2Outcome { applied: true, challenged, rotated }
    }

    fn is_challenge(&self, url: &str, status: Option<i64>) -> bool {
        let url_lower = url.to_ascii_lowercase();
        if self.config.challenge_patterns.iter().any(|p| url_lower.contains(&p.to_ascii_lowercase()))
        {
            return true;
        }
        status.is_some_and(|s| CHALLENGE_STATUSES.contains(&s))
    }

    fn maybe_rotate(&mut self, now_ms: u64) -> bool {
        if self.mode != Tier2Mode::Adaptive {
            return false;
        }
        let unhealthy = self.profile.health_score < self.config.rotation_health_threshold;
        let stale = now_ms.saturating_sub(self.last_rotation_ms) >= self.config.rotation_interval_ms;
        if !unhealthy && !stale {
            return false;
        }

        self.profile.id = profile_id();
        self.profile.health_score = MAX_HEALTH;
        self.profile.rotation_count += 1;
        self.last_rotation_ms = now_ms;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adaptive_config() -> Tier2Config {
        Tier2Config {
            mode: Tier2Mode::Adaptive,
            challenge_patterns: vec!["challenge".to_string()],
            score_penalty: 95,
            rotation_health_threshold: 40,
            rotation_interval_ms: u64::MAX,
            ..Default::default()
        }
    }

    #[test]
    fn challenge_drains_and_rotates_when_unhealthy() {
        let mut state = Tier2State::new(adaptive_config(), 1_000);
        let before = state.profile.id.clone();
        let outcome = state.apply_event("https://example.com/challenge", Some(200), 2_000);
        assert!(outcome.challenged);
        assert!(outcome.rotated);
        assert_ne!(state.profile.id, before);
        assert_eq!(state.profile.health_score, MAX_HEALTH);
        assert_eq!(state.profile.rotation_count, 1);
        assert_eq!(state.profile.challenge_count, 1);
    }

    #[test]
    fn clean_traffic_recovers_score() {
        let mut config = adaptive_config();
        config.score_penalty = 30;
        config.rotation_health_threshold = 0;
        let mut state = Tier2State::new(config, 0);
        state.apply_event("https://example.com/challenge", None, 1);
        assert_eq!(state.profile.health_score, 70);
        state.apply_event("https://example.com/ok", Some(200), 2);
        assert_eq!(state.profile.health_score, 72);
    }

    #[test]
    fn deterministic_mode_never_rotates() {
        let mut config = adaptive_config();
        config.mode = Tier2Mode::Deterministic;
        let mut state = Tier2State::new(config, 0);
        let outcome = state.apply_event("https://example.com/challenge", Some(403), 1);
        assert!(outcome.challenged);
        assert!(!outcome.rotated);
    }

    #[test]
    fn challenge_status_counts_without_pattern() {
        let state_cfg = Tier2Config::default();
        let mut state = Tier2State::new(state_cfg, 0);
        let outcome = state.apply_event("https://example.com/plain", Some(429), 1);
        assert!(outcome.challenged);
    }

    #[test]
    fn challenge_ring_is_bounded() {
        let mut config = adaptive_config();
        config.mode = Tier2Mode::Deterministic;
        config.max_challenge_events = 2;
        let mut state = Tier2State::new(config, 0);
        for i in 0..5 {
            state.apply_event(&format!("https://example.com/challenge/{i}"), None, i);
        }
        assert_eq!(state.challenge_events.len(), 2);
        assert!(state.challenge_events[0].url.ends_with("/3"));
    }
}
