//! Bounded debug artifacts attached to trace snapshots
//!
//! While a blocker is live, debug traces carry a capped slice of recent
//! network activity, unique hosts, and console/exception excerpts so the
//! caller can see what tripped the classifier without an unbounded dump.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::config::BlockerArtifactCaps;
use crate::trackers::{ConsoleEvent, ExceptionEvent, NetworkEvent, TrackedEvent};

const CONSOLE_EXCERPT_CAP: usize = 10;
const EXCEPTION_EXCERPT_CAP: usize = 5;
const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct BlockerArtifacts {
    pub network: Vec<NetworkEvent>,
    pub hosts: Vec<String>,
    pub console_excerpts: Vec<String>,
    pub exception_excerpts: Vec<String>,
    pub sanitization: SanitizationSummary,
    pub prompt_guard_enabled: bool,
}

/// What was withheld or trimmed while building the artifact bundle.
#[derive(Debug, Clone, Serialize)]
pub struct SanitizationSummary {
    pub network_truncated: bool,
    pub hosts_truncated: bool,
    pub urls_sanitized: bool,
    pub console_redacted: bool,
}

pub fn build_artifacts(
    network: &[TrackedEvent<NetworkEvent>],
    console: &[TrackedEvent<ConsoleEvent>],
    exceptions: &[TrackedEvent<ExceptionEvent>],
    caps: &BlockerArtifactCaps,
    show_full_urls: bool,
    show_full_console: bool,
    prompt_guard_enabled: bool,
) -> BlockerArtifacts {
    // Newest events are the interesting ones; take from the tail.
    let network_slice: Vec<NetworkEvent> = network
        .iter()
        .rev()
        .take(caps.max_network_events)
        .map(|e| e.payload.clone())
        .collect();

    let mut hosts = BTreeSet::new();
    let mut hosts_truncated = false;
    for event in network.iter().rev() {
        if let Some(host) = &event.payload.host {
            if hosts.len() >= caps.max_hosts && !hosts.contains(host) {
                hosts_truncated = true;
                continue;
            }
            hosts.insert(host.clone());
        }
    }

    let console_excerpts: Vec<String> = console
        .iter()
        .rev()
        .take(CONSOLE_EXCERPT_CAP)
        .map(|e| excerpt(&format!("[{}] {}", e.payload.level, e.payload.text)))
        .collect();

    let exception_excerpts: Vec<String> = exceptions
        .iter()
        .rev()
        .take(EXCEPTION_EXCERPT_CAP)
        .map(|e| excerpt(&format!("{}: {}", e.payload.name, e.payload.message)))
        .collect();

    BlockerArtifacts {
        sanitization: SanitizationSummary {
            network_truncated: network.len() > caps.max_network_events,
            hosts_truncated,
            urls_sanitized: !show_full_urls,
            console_redacted: !show_full_console,
        },
        network: network_slice,
        hosts: hosts.into_iter().collect(),
        console_excerpts,
        exception_excerpts,
        prompt_guard_enabled,
    }
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= EXCERPT_CHARS {
        text.to_string()
    } else {
        text.chars().take(EXCERPT_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trackers::NetworkPhase;

    fn net_event(url: &str, host: &str) -> TrackedEvent<NetworkEvent> {
        TrackedEvent {
            seq: 1,
            ts: 0,
            payload: NetworkEvent {
                phase: NetworkPhase::Response,
                url: url.to_string(),
                host: Some(host.to_string()),
                method: None,
                status: Some(200),
                resource_type: None,
            },
        }
    }

    #[test]
    fn caps_are_enforced() {
        let caps = BlockerArtifactCaps { max_network_events: 2, max_hosts: 1 };
        let events: Vec<_> = (0..5)
            .map(|i| net_event(&format!("https://h{i}.com/x"), &format!("h{i}.com")))
            .collect();
        let artifacts = build_artifacts(&events, &[], &[], &caps, false, false, true);
        assert_eq!(artifacts.network.len(), 2);
        assert_eq!(artifacts.hosts.len(), 1);
        assert!(artifacts.sanitization.network_truncated);
        assert!(artifacts.sanitization.hosts_truncated);
    }
}
