//! Debug trace snapshots
//!
//! One call drains all three trackers from caller-held cursors, advances
//! the fingerprint pipeline over the pending network events, reconciles
//! the blocker FSM, and returns an annotated bundle. Artifacts ride along
//! only while a blocker is live and only when asked for.

use serde::Serialize;
use std::time::Instant;

use super::{OpOutcome, SessionBroker};
use crate::blocker::{
    BlockerArtifacts, BlockerMeta, EvidenceSource, NavEvidence, ReconcileRecord, build_artifacts,
    target_key,
};
use crate::error::Result;
use crate::fingerprint::{FingerprintMeta, SignalSource};
use crate::ids::SessionId;
use crate::request_id::RequestId;
use crate::trackers::{ConsoleEvent, ExceptionEvent, NetworkEvent, NetworkPhase, PollResult};

const DEFAULT_POLL_MAX: usize = 200;

/// Caller-held tracker cursors; zero means "from the beginning of the ring".
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceCursors {
    pub console_seq: u64,
    pub network_seq: u64,
    pub exception_seq: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugTraceBundle {
    pub session_id: SessionId,
    pub console: PollResult<ConsoleEvent>,
    pub network: PollResult<NetworkEvent>,
    pub exceptions: PollResult<ExceptionEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocker: Option<BlockerMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<BlockerArtifacts>,
    pub fingerprint: FingerprintMeta,
}

impl SessionBroker {
    /// Poll trackers, advance the fingerprint watermark, reconcile the
    /// blocker, and bundle it all up.
    pub async fn debug_trace_snapshot(
        &self,
        session_id: SessionId,
        cursors: TraceCursors,
        include_artifacts: bool,
    ) -> Result<OpOutcome<DebugTraceBundle>> {
        let session = self.session(session_id)?;
        let request_id = RequestId::new();
        let started = Instant::now();

        let console = session.console.poll(cursors.console_seq, DEFAULT_POLL_MAX);
        let network = session.network.poll(cursors.network_seq, DEFAULT_POLL_MAX);
        let exceptions = session.exceptions.poll(cursors.exception_seq, DEFAULT_POLL_MAX);

        session.fingerprint.lock().apply_network_events(
            &network.events,
            SignalSource::DebugTrace,
            &request_id,
            session_id,
        );

        // Reconcile only when there is fresh evidence; an empty trace must
        // not masquerade as a clean navigation.
        if !network.events.is_empty() {
            let evidence = evidence_from_network(&network.events, &session);
            let key = session
                .targets
                .active()
                .and_then(|t| target_key(&t.to_string(), evidence.hostname().as_deref()));
            session.blocker.lock().reconcile(
                &ReconcileRecord {
                    evidence: Some(evidence),
                    verifier: false,
                    source: EvidenceSource::DebugTrace,
                },
                key.as_deref(),
            );
        }

        let blocker = session.blocker.lock().meta_with_resolution();
        let live = blocker
            .as_ref()
            .is_some_and(|m| m.state != crate::blocker::BlockerState::Clear);
        let artifacts = if include_artifacts && live {
            Some(build_artifacts(
                &network.events,
                &console.events,
                &exceptions.events,
                &session.config.blocker_artifact_caps,
                session.config.devtools.show_full_urls,
                session.config.devtools.show_full_console,
                session.config.security.prompt_injection_guard.enabled,
            ))
        } else {
            None
        };

        let fingerprint = session.fingerprint.lock().meta();

        Ok(OpOutcome {
            value: DebugTraceBundle {
                session_id,
                console,
                network,
                exceptions,
                blocker: blocker.clone(),
                artifacts,
                fingerprint,
            },
            elapsed_ms: started.elapsed().as_millis() as u64,
            request_id,
            blocker,
        })
    }
}

fn evidence_from_network(
    events: &[crate::trackers::TrackedEvent<NetworkEvent>],
    session: &super::Session,
) -> NavEvidence {
    let document_response = events
        .iter()
        .rev()
        .find(|e| {
            e.payload.phase == NetworkPhase::Response
                && e.payload.resource_type.as_deref() == Some("document")
        })
        .map(|e| &e.payload);

    let url = document_response
        .map(|p| p.url.clone())
        .or_else(|| events.last().map(|e| e.payload.url.clone()))
        .unwrap_or_default();

    let mut evidence = NavEvidence::navigation(url);
    evidence.source = EvidenceSource::DebugTrace;
    evidence.status = document_response.and_then(|p| p.status);
    evidence.prompt_guard_enabled = session.config.security.prompt_injection_guard.enabled;

    let mut hosts = Vec::new();
    for event in events {
        if let Some(host) = &event.payload.host
            && !hosts.contains(host)
        {
            hosts.push(host.clone());
        }
    }
    evidence.network_hosts = hosts;

    let patterns = session.fingerprint.lock().tier2.config().challenge_patterns.clone();
    let mut matched: Vec<String> = events
        .iter()
        .filter_map(|e| {
            let url_lower = e.payload.url.to_ascii_lowercase();
            patterns.iter().find(|p| url_lower.contains(&p.to_ascii_lowercase())).cloned()
        })
        .collect();
    matched.dedup();
    evidence.matched_patterns = matched;

    evidence
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    use crate::blocker::BlockerFsm;
    use crate::config::{BrokerConfig, CanaryConfig, FallbackTier, Tier2Mode, Tier3Config};
    use crate::fingerprint::{FingerprintState, Tier3Status};
    use crate::refs::RefStore;
    use crate::session::{Session, SessionMode};
    use crate::targets::TargetRegistry;
    use crate::trackers::{EventTracker, NetworkEvent, NetworkPhase};

    fn rollback_config() -> BrokerConfig {
        let mut config = BrokerConfig::default();
        config.fingerprint.tier2.enabled = true;
        config.fingerprint.tier2.mode = Tier2Mode::Adaptive;
        config.fingerprint.tier2.continuous_signals = false;
        config.fingerprint.tier2.challenge_patterns = vec!["challenge".to_string()];
        config.fingerprint.tier2.score_penalty = 95;
        config.fingerprint.tier2.rotation_health_threshold = 0;
        config.fingerprint.tier2.rotation_interval_ms = u64::MAX;
        config.fingerprint.tier3 = Tier3Config {
            enabled: true,
            continuous_signals: false,
            fallback_tier: FallbackTier::Tier1,
            canary: CanaryConfig {
                window_size: 2,
                min_samples: 1,
                promote_threshold: 1_000.0,
                rollback_threshold: 40.0,
            },
        };
        config
    }

    /// A session with all broker-side state but no driver attached; the
    /// debug-trace path never touches the browser handle.
    fn browserless_session(config: &BrokerConfig) -> Arc<Session> {
        Arc::new(Session {
            id: crate::ids::SessionId::new(),
            mode: SessionMode::CdpConnect,
            extension_legacy_cdp: false,
            config: config.clone(),
            browser: Mutex::new(None),
            handler_task: PlMutex::new(None),
            targets: TargetRegistry::new(),
            refs: RefStore::new(),
            console: Arc::new(EventTracker::new("console", 100)),
            network: Arc::new(EventTracker::new("network", 100)),
            exceptions: Arc::new(EventTracker::new("exception", 100)),
            blocker: PlMutex::new(BlockerFsm::new(
                config.blocker_detection_threshold,
                config.blocker_resolution_timeout_ms,
            )),
            fingerprint: PlMutex::new(FingerprintState::initialize(&config.fingerprint, &[])),
            profile_dir: None,
            owns_profile_dir: false,
            listener_tasks: PlMutex::new(Vec::new()),
            network_signal: PlMutex::new(None),
            ops_client: None,
            ops_event_task: PlMutex::new(None),
        })
    }

    fn challenge_response() -> NetworkEvent {
        NetworkEvent {
            phase: NetworkPhase::Response,
            url: "https://example.com/challenge".to_string(),
            host: Some("example.com".to_string()),
            method: None,
            status: Some(200),
            resource_type: Some("document".to_string()),
        }
    }

    #[tokio::test]
    async fn debug_trace_applies_events_the_continuous_path_left_gated() {
        let config = rollback_config();
        let broker = SessionBroker::new(config.clone());
        let session = browserless_session(&config);
        let session_id = session.id;

        // Wire the session exactly as the broker does at connect time: the
        // continuous subscription sees every pushed network event.
        crate::session::listeners::attach_network_signal(&session);
        broker.insert_session_for_tests(Arc::clone(&session));

        session.network.push(challenge_response());

        // Continuous signals are opted out, so the event must still be
        // below the watermark when the trace runs.
        assert_eq!(session.fingerprint.lock().last_applied_network_seq, 0);

        let outcome = broker
            .debug_trace_snapshot(session_id, TraceCursors::default(), true)
            .await
            .expect("debug trace should succeed");

        let fingerprint = &outcome.value.fingerprint;
        assert_eq!(fingerprint.tier3.status, Tier3Status::Fallback);
        assert!(!fingerprint.tier2.enabled);
        assert_eq!(fingerprint.last_applied_network_seq, 1);
        assert_eq!(session.fingerprint.lock().last_applied_network_seq, 1);
    }

    #[tokio::test]
    async fn continuous_optin_applies_events_before_the_trace() {
        let mut config = rollback_config();
        config.fingerprint.tier2.continuous_signals = true;
        config.fingerprint.tier3.continuous_signals = true;
        let broker = SessionBroker::new(config.clone());
        let session = browserless_session(&config);
        let session_id = session.id;

        crate::session::listeners::attach_network_signal(&session);
        broker.insert_session_for_tests(Arc::clone(&session));

        session.network.push(challenge_response());

        // Opted in: the subscription consumed the event as it was recorded.
        assert_eq!(session.fingerprint.lock().last_applied_network_seq, 1);
        assert_eq!(session.fingerprint.lock().tier3.status, Tier3Status::Fallback);

        // The trace re-poll is a no-op for the pipeline.
        let outcome = broker
            .debug_trace_snapshot(session_id, TraceCursors::default(), true)
            .await
            .expect("debug trace should succeed");
        assert_eq!(outcome.value.fingerprint.last_applied_network_seq, 1);
        assert!(!outcome.value.fingerprint.tier2.enabled);
    }
}
