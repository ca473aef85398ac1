//! Fingerprint coherence and adaptation pipeline
//!
//! Three tiers: a one-shot launch coherence check, a runtime health profile,
//! and an adaptive canary. Network events advance tiers 2 and 3 behind a
//! sequence watermark so the continuous subscription and the debug-trace
//! path can share one apply function without double-counting.

mod tier1;
mod tier2;
mod tier3;

pub use tier1::{
    DerivedEnvironment, Tier1Issue, Tier1IssueKind, Tier1Report, evaluate_coherence,
};
pub use tier2::{ChallengeEvent, MAX_HEALTH, RuntimeProfile, Tier2Outcome, Tier2State};
pub use tier3::{CanaryAction, CanarySample, CanaryWindow, Tier3State, Tier3Status};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{FallbackTier, FingerprintConfig};
use crate::ids::SessionId;
use crate::request_id::{RequestId, now_ms};
use crate::trackers::{NetworkEvent, TrackedEvent};

/// Where a batch of network events came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalSource {
    DebugTrace,
    Continuous,
}

/// Coarse classification of the traffic that produced a canary decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetClass {
    Disabled,
    ErrorSurface,
    HighFriction,
    Standard,
}

#[derive(Debug)]
pub struct FingerprintState {
    pub tier1: Tier1Report,
    pub tier2: Tier2State,
    pub tier3: Tier3State,
    pub last_applied_network_seq: u64,
}

impl FingerprintState {
    /// Initialize all tiers from session config and the concrete launch flags.
    pub fn initialize(config: &FingerprintConfig, launch_flags: &[String]) -> Self {
        let derived = DerivedEnvironment::from_flags(launch_flags);
        let tier1 = evaluate_coherence(&config.tier1, &derived);
        for warning in &tier1.warnings {
            warn!("{warning}");
        }
        Self {
            tier1,
            tier2: Tier2State::new(config.tier2.clone(), now_ms()),
            tier3: Tier3State::new(config.tier3.clone()),
            last_applied_network_seq: 0,
        }
    }

    /// Apply a batch of tracked network events in seq order.
    ///
    /// Events at or below the watermark are skipped, making re-application
    /// with the same batch a no-op. The watermark only advances past events
    /// the pipeline actually consumed: a continuous event gated by the
    /// opt-in flags is left below the watermark so the debug-trace path can
    /// still pick it up. Returns how many events were consumed.
    pub fn apply_network_events(
        &mut self,
        events: &[TrackedEvent<NetworkEvent>],
        source: SignalSource,
        request_id: &RequestId,
        session_id: SessionId,
    ) -> usize {
        let mut applied = 0;
        for event in events {
            if event.seq <= self.last_applied_network_seq {
                continue;
            }
            if self.apply_one(event, source, request_id, session_id) {
                self.last_applied_network_seq = event.seq;
                applied += 1;
            }
        }
        applied
    }

    /// Returns true when the event was consumed.
    fn apply_one(
        &mut self,
        event: &TrackedEvent<NetworkEvent>,
        source: SignalSource,
        request_id: &RequestId,
        session_id: SessionId,
    ) -> bool {
        if source == SignalSource::Continuous && !self.tier2.continuous_signals() {
            // Gated, not consumed: the event stays available to debug traces.
            return false;
        }
        if !self.tier2.enabled {
            // A disabled tier will never apply this event on any path.
            return true;
        }

        let now = now_ms();
        let outcome = self.tier2.apply_event(&event.payload.url, event.payload.status, now);
        if !outcome.applied {
            return true;
        }

        if outcome.rotated {
            info!(
                kind = "fingerprint.tier2.rotate",
                request_id = %request_id,
                session_id = %session_id,
                profile = %self.tier2.profile.id,
                rotation_count = self.tier2.profile.rotation_count,
                reason = if outcome.challenged { "health" } else { "interval" },
                source = ?source,
                "rotated runtime fingerprint profile"
            );
        }

        let tier3_gated =
            source == SignalSource::Continuous && !self.tier3.continuous_signals();
        if !self.tier3.enabled || tier3_gated {
            return true;
        }

        let sample = CanarySample {
            score: self.tier2.profile.health_score as f64,
            has_challenge: outcome.challenged,
            challenge_count: self.tier2.profile.challenge_count,
            rotation_count: self.tier2.profile.rotation_count,
        };
        let action = self.tier3.apply_sample(sample);
        let target_class = self.derive_target_class(outcome.challenged, event.payload.status);

        match action {
            CanaryAction::Promote => {
                info!(
                    kind = "fingerprint.tier3.promote",
                    request_id = %request_id,
                    session_id = %session_id,
                    action = "promote",
                    reason = "canary average above promote threshold",
                    score = self.tier2.profile.health_score,
                    canary_level = self.tier3.canary.level,
                    canary_average = self.tier3.canary.average_score,
                    sample_count = self.tier3.canary.sample_count(),
                    promote_threshold = self.tier3.promote_threshold(),
                    rollback_threshold = self.tier3.rollback_threshold(),
                    target_class = ?target_class,
                    source = ?source,
                    "promoted adaptive fingerprint profile"
                );
            }
            CanaryAction::Rollback => {
                // Rollback to tier1 means the runtime tier is switched off
                // entirely; rollback to tier2 keeps it running undecorated.
                if self.tier3.fallback_tier == FallbackTier::Tier1 {
                    self.tier2.enabled = false;
                }
                warn!(
                    kind = "fingerprint.tier3.rollback",
                    request_id = %request_id,
                    session_id = %session_id,
                    action = "rollback",
                    reason = self
                        .tier3
                        .fallback_reason
                        .as_deref()
                        .unwrap_or("canary average at or below rollback threshold"),
                    score = self.tier2.profile.health_score,
                    canary_level = self.tier3.canary.level,
                    canary_average = self.tier3.canary.average_score,
                    sample_count = self.tier3.canary.sample_count(),
                    promote_threshold = self.tier3.promote_threshold(),
                    rollback_threshold = self.tier3.rollback_threshold(),
                    fallback_tier = ?self.tier3.fallback_tier,
                    target_class = ?target_class,
                    source = ?source,
                    "rolled back adaptive fingerprint profile"
                );
            }
            CanaryAction::None => {}
        }
        true
    }

    fn derive_target_class(&self, challenged: bool, status: Option<i64>) -> TargetClass {
        if !self.tier2.enabled {
            TargetClass::Disabled
        } else if status.is_some_and(|s| s >= 500) {
            TargetClass::ErrorSurface
        } else if challenged || self.tier2.profile.health_score < 50 {
            TargetClass::HighFriction
        } else {
            TargetClass::Standard
        }
    }

    /// Serializable snapshot for operation results and debug bundles.
    pub fn meta(&self) -> FingerprintMeta {
        FingerprintMeta {
            tier1: Tier1Meta {
                enabled: self.tier1.enabled,
                ok: self.tier1.ok,
                warnings: self.tier1.warnings.clone(),
            },
            tier2: Tier2Meta {
                enabled: self.tier2.enabled,
                mode: format!("{:?}", self.tier2.mode).to_lowercase(),
                profile: self.tier2.profile.clone(),
            },
            tier3: Tier3Meta {
                enabled: self.tier3.enabled,
                status: self.tier3.status,
                adapter_name: self.tier3.adapter_name.clone(),
                fallback_reason: self.tier3.fallback_reason.clone(),
                canary: CanaryMeta {
                    level: self.tier3.canary.level,
                    average_score: self.tier3.canary.average_score,
                    sample_count: self.tier3.canary.sample_count(),
                    last_action: self.tier3.canary.last_action,
                },
            },
            last_applied_network_seq: self.last_applied_network_seq,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintMeta {
    pub tier1: Tier1Meta,
    pub tier2: Tier2Meta,
    pub tier3: Tier3Meta,
    pub last_applied_network_seq: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tier1Meta {
    pub enabled: bool,
    pub ok: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tier2Meta {
    pub enabled: bool,
    pub mode: String,
    pub profile: RuntimeProfile,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tier3Meta {
    pub enabled: bool,
    pub status: Tier3Status,
    pub adapter_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub canary: CanaryMeta,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryMeta {
    pub level: u32,
    pub average_score: f64,
    pub sample_count: usize,
    pub last_action: CanaryAction,
}
