//! Blocker finite-state machine
//!
//! Per-session states: clear, active, resolving. Transitions are driven by
//! explicit reconciliation records so no verifier state hides inside
//! operation plumbing. Detections never fail operations; while a blocker is
//! active or resolving, results carry [`BlockerMeta`].

use serde::Serialize;
use tracing::{debug, info};

use super::classifier::{Blocker, EvidenceStrength, EvidenceSource, NavEvidence, classify};
use crate::request_id::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockerState {
    Clear,
    Active,
    Resolving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Resolved,
    Unresolved,
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionReason {
    VerifierPassed,
    VerificationTimeout,
    VerifierFailed,
    EnvLimited,
    ManualClear,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Resolution {
    pub status: ResolutionStatus,
    pub reason: ResolutionReason,
    pub updated_at: u64,
}

/// Metadata attached to operation results while a blocker is live.
#[derive(Debug, Clone, Serialize)]
pub struct BlockerMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocker: Option<Blocker>,
    pub state: BlockerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

/// Reconciliation input: evidence from the just-finished operation plus
/// whether that operation counts as a verifier.
#[derive(Debug, Clone)]
pub struct ReconcileRecord {
    pub evidence: Option<NavEvidence>,
    /// The operation completed successfully and is verification-grade
    /// (navigation, waitForLoad, waitForRef).
    pub verifier: bool,
    pub source: EvidenceSource,
}

#[derive(Debug)]
pub struct BlockerFsm {
    state: BlockerState,
    blocker: Option<Blocker>,
    target_key: Option<String>,
    activated_at_ms: Option<u64>,
    last_detected_at_ms: Option<u64>,
    updated_at_ms: Option<u64>,
    resolution: Option<Resolution>,
    /// Consecutive weak detections per target key, gated by the threshold.
    weak_streak: u32,
    weak_key: Option<String>,
    detection_threshold: u32,
    resolution_timeout_ms: u64,
}

impl BlockerFsm {
    pub fn new(detection_threshold: u32, resolution_timeout_ms: u64) -> Self {
        Self {
            state: BlockerState::Clear,
            blocker: None,
            target_key: None,
            activated_at_ms: None,
            last_detected_at_ms: None,
            updated_at_ms: None,
            resolution: None,
            weak_streak: 0,
            weak_key: None,
            detection_threshold: detection_threshold.max(1),
            resolution_timeout_ms,
        }
    }

    pub fn state(&self) -> BlockerState {
        self.state
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    pub fn target_key(&self) -> Option<&str> {
        self.target_key.as_deref()
    }

    /// A verifier-grade operation is starting.
    pub fn begin_verifier(&mut self) {
        if self.state == BlockerState::Active {
            self.state = BlockerState::Resolving;
            self.resolution = None;
            self.touch();
            debug!(target_key = ?self.target_key, "blocker verification started");
        }
    }

    /// Apply one reconciliation record. Returns the meta to attach to the
    /// operation result, when any blocker state is live.
    pub fn reconcile(
        &mut self,
        record: &ReconcileRecord,
        active_target_key: Option<&str>,
    ) -> Option<BlockerMeta> {
        let classified = record.evidence.as_ref().and_then(classify);

        match classified {
            Some((blocker, strength)) => {
                if strength == EvidenceStrength::Weak {
                    if self.weak_key.as_deref() != active_target_key {
                        self.weak_streak = 0;
                        self.weak_key = active_target_key.map(|k| k.to_string());
                    }
                    self.weak_streak += 1;
                    if self.state == BlockerState::Clear
                        && self.weak_streak < self.detection_threshold
                    {
                        return self.meta();
                    }
                } else {
                    self.weak_streak = 0;
                    self.weak_key = None;
                }
                self.detect(blocker, active_target_key);
            }
            None => {
                self.weak_streak = 0;
                self.weak_key = None;
                self.observe_clear(record.verifier);
            }
        }

        self.meta()
    }

    /// Explicit verification failure from the caller.
    pub fn mark_verification_failure(&mut self, env_limited: bool) {
        if self.state == BlockerState::Clear {
            return;
        }
        self.state = BlockerState::Active;
        self.resolution = Some(Resolution {
            status: if env_limited {
                ResolutionStatus::Deferred
            } else {
                ResolutionStatus::Unresolved
            },
            reason: if env_limited {
                ResolutionReason::EnvLimited
            } else {
                ResolutionReason::VerifierFailed
            },
            updated_at: self.touch(),
        });
        info!(
            target_key = ?self.target_key,
            env_limited, "blocker verification failed"
        );
    }

    /// Operator override: drop the blocker regardless of state.
    pub fn clear_blocker(&mut self) {
        let updated_at = self.touch();
        self.state = BlockerState::Clear;
        self.blocker = None;
        self.resolution = Some(Resolution {
            status: ResolutionStatus::Resolved,
            reason: ResolutionReason::ManualClear,
            updated_at,
        });
        self.weak_streak = 0;
        info!(target_key = ?self.target_key, "blocker manually cleared");
        self.target_key = None;
    }

    /// Current meta while active or resolving, `None` when clear.
    pub fn meta(&self) -> Option<BlockerMeta> {
        match self.state {
            BlockerState::Clear => None,
            _ => Some(BlockerMeta {
                blocker: self.blocker.clone(),
                state: self.state,
                updated_at: self.updated_at_ms,
                resolution: self.resolution,
            }),
        }
    }

    /// Meta including the terminal clear transition, for the operation that
    /// resolved the blocker.
    pub fn meta_with_resolution(&self) -> Option<BlockerMeta> {
        if self.state == BlockerState::Clear && self.resolution.is_some() {
            return Some(BlockerMeta {
                blocker: None,
                state: BlockerState::Clear,
                updated_at: self.updated_at_ms,
                resolution: self.resolution,
            });
        }
        self.meta()
    }

    fn detect(&mut self, blocker: Blocker, active_target_key: Option<&str>) {
        let now = self.touch();
        self.last_detected_at_ms = Some(now);
        match self.state {
            BlockerState::Clear => {
                self.state = BlockerState::Active;
                self.activated_at_ms = Some(now);
                self.resolution = None;
                self.target_key = active_target_key.map(|k| k.to_string());
                info!(
                    kind = ?blocker.kind,
                    target_key = ?self.target_key,
                    "blocker detected"
                );
            }
            BlockerState::Active | BlockerState::Resolving => {
                // Re-detection during verification drops back to active.
                self.state = BlockerState::Active;
                self.target_key = active_target_key.map(|k| k.to_string());
            }
        }
        self.blocker = Some(blocker);
    }

    fn observe_clear(&mut self, verifier: bool) {
        match self.state {
            BlockerState::Clear => {}
            BlockerState::Active | BlockerState::Resolving => {
                let now = now_ms();
                if verifier || self.state == BlockerState::Resolving {
                    let updated_at = self.touch();
                    self.state = BlockerState::Clear;
                    self.blocker = None;
                    self.resolution = Some(Resolution {
                        status: ResolutionStatus::Resolved,
                        reason: ResolutionReason::VerifierPassed,
                        updated_at,
                    });
                    info!(target_key = ?self.target_key, "blocker resolved");
                    self.target_key = None;
                } else if self
                    .last_detected_at_ms
                    .is_some_and(|t| now.saturating_sub(t) >= self.resolution_timeout_ms)
                {
                    self.state = BlockerState::Active;
                    self.resolution = Some(Resolution {
                        status: ResolutionStatus::Unresolved,
                        reason: ResolutionReason::VerificationTimeout,
                        updated_at: self.touch(),
                    });
                    debug!(target_key = ?self.target_key, "blocker verification timed out");
                }
            }
        }
    }

    /// Stamp updated_at, monotonically non-decreasing.
    fn touch(&mut self) -> u64 {
        let now = now_ms().max(self.updated_at_ms.unwrap_or(0));
        self.updated_at_ms = Some(now);
        now
    }
}

/// Build the canonical "targetId:hostname" key.
pub fn target_key(target_id: &str, hostname: Option<&str>) -> Option<String> {
    hostname.map(|h| format!("{target_id}:{h}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocker::classifier::NavEvidence;

    fn record(evidence: Option<NavEvidence>, verifier: bool) -> ReconcileRecord {
        ReconcileRecord { evidence, verifier, source: EvidenceSource::Navigation }
    }

    fn login_evidence() -> NavEvidence {
        let mut e = NavEvidence::navigation("https://x.com/i/flow/login");
        e.title = Some("Log in to X / X".to_string());
        e
    }

    fn clear_evidence() -> NavEvidence {
        let mut e = NavEvidence::navigation("https://example.com");
        e.title = Some("Example Domain".to_string());
        e
    }

    #[test]
    fn detect_then_verifier_resolves() {
        let mut fsm = BlockerFsm::new(2, 180_000);
        let meta = fsm
            .reconcile(&record(Some(login_evidence()), true), Some("t1:x.com"))
            .expect("login should produce blocker meta");
        assert_eq!(meta.state, BlockerState::Active);

        fsm.begin_verifier();
        assert_eq!(fsm.state(), BlockerState::Resolving);

        assert!(fsm.reconcile(&record(Some(clear_evidence()), true), Some("t1:example.com")).is_none());
        assert_eq!(fsm.state(), BlockerState::Clear);
        let resolution = fsm.resolution().expect("resolution should be recorded");
        assert_eq!(resolution.status, ResolutionStatus::Resolved);
        assert_eq!(resolution.reason, ResolutionReason::VerifierPassed);
    }

    #[test]
    fn weak_evidence_respects_threshold() {
        let mut fsm = BlockerFsm::new(2, 180_000);
        let mut weak = NavEvidence::navigation("https://example.com");
        weak.network_hosts = vec!["datadome.co".to_string()];

        assert!(fsm.reconcile(&record(Some(weak.clone()), false), Some("t1:example.com")).is_none());
        assert_eq!(fsm.state(), BlockerState::Clear);

        let meta = fsm
            .reconcile(&record(Some(weak), false), Some("t1:example.com"))
            .expect("second weak detection should activate");
        assert_eq!(meta.state, BlockerState::Active);
    }

    #[test]
    fn timeout_marks_unresolved() {
        let mut fsm = BlockerFsm::new(1, 0);
        fsm.reconcile(&record(Some(login_evidence()), false), Some("t1:x.com"));
        // No verifier: with a zero timeout, the next clear observation
        // times the verification out instead of resolving.
        fsm.reconcile(&record(Some(clear_evidence()), false), Some("t1:x.com"));
        assert_eq!(fsm.state(), BlockerState::Active);
        let resolution = fsm.resolution().expect("timeout resolution");
        assert_eq!(resolution.status, ResolutionStatus::Unresolved);
        assert_eq!(resolution.reason, ResolutionReason::VerificationTimeout);
    }

    #[test]
    fn verification_failure_and_env_limited() {
        let mut fsm = BlockerFsm::new(1, 180_000);
        fsm.reconcile(&record(Some(login_evidence()), false), Some("t1:x.com"));

        fsm.mark_verification_failure(false);
        let r = fsm.resolution().expect("failure resolution");
        assert_eq!(r.status, ResolutionStatus::Unresolved);
        assert_eq!(r.reason, ResolutionReason::VerifierFailed);

        fsm.mark_verification_failure(true);
        let r = fsm.resolution().expect("deferred resolution");
        assert_eq!(r.status, ResolutionStatus::Deferred);
        assert_eq!(r.reason, ResolutionReason::EnvLimited);
    }

    #[test]
    fn manual_clear_resolves_from_any_state() {
        let mut fsm = BlockerFsm::new(1, 180_000);
        fsm.reconcile(&record(Some(login_evidence()), false), Some("t1:x.com"));
        fsm.begin_verifier();
        fsm.clear_blocker();
        assert_eq!(fsm.state(), BlockerState::Clear);
        let r = fsm.resolution().expect("manual resolution");
        assert_eq!(r.reason, ResolutionReason::ManualClear);
    }

    #[test]
    fn updated_at_is_monotone() {
        let mut fsm = BlockerFsm::new(1, 180_000);
        fsm.reconcile(&record(Some(login_evidence()), false), Some("t1:x.com"));
        let first = fsm.meta().and_then(|m| m.updated_at).expect("updated_at set");
        fsm.begin_verifier();
        let second = fsm.meta().and_then(|m| m.updated_at).expect("updated_at still set");
        assert!(second >= first);
    }

    #[test]
    fn target_key_formats() {
        assert_eq!(target_key("t1", Some("x.com")).as_deref(), Some("t1:x.com"));
        assert_eq!(target_key("t1", None), None);
    }
}
