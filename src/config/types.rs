//! Broker configuration types
//!
//! Nested sections mirror the on-disk JSONC document. Every field carries a
//! serde default so partial documents deserialize into a fully-populated
//! config; unknown keys are ignored.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    /// Named persistent profile; `None` uses a fresh temp profile.
    pub profile: Option<String>,
    #[serde(default = "default_true")]
    pub headless: bool,
    pub persist_profile: bool,
    /// Explicit Chrome executable path; overrides discovery.
    pub chrome_path: Option<PathBuf>,
    /// Extra Chrome launch flags, forwarded verbatim.
    pub flags: Vec<String>,

    pub snapshot: SnapshotConfig,
    pub security: SecurityConfig,
    pub devtools: DevtoolsConfig,
    pub export: ExportConfig,
    pub fingerprint: FingerprintConfig,
    pub canary: CanaryTargetsConfig,

    pub relay_port: Option<u16>,
    /// 32-byte hex token, or `false` in JSON to disable auth entirely.
    pub relay_token: TokenSetting,
    pub daemon_port: Option<u16>,
    pub daemon_token: TokenSetting,

    #[serde(default = "default_blocker_detection_threshold")]
    pub blocker_detection_threshold: u32,
    #[serde(default = "default_blocker_resolution_timeout_ms")]
    pub blocker_resolution_timeout_ms: u64,
    pub blocker_artifact_caps: BlockerArtifactCaps,

    pub parallelism: ParallelismConfig,

    pub trackers: TrackerConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            profile: None,
            headless: true,
            persist_profile: false,
            chrome_path: None,
            flags: Vec::new(),
            snapshot: SnapshotConfig::default(),
            security: SecurityConfig::default(),
            devtools: DevtoolsConfig::default(),
            export: ExportConfig::default(),
            fingerprint: FingerprintConfig::default(),
            canary: CanaryTargetsConfig::default(),
            relay_port: None,
            relay_token: TokenSetting::Unset,
            daemon_port: None,
            daemon_token: TokenSetting::Unset,
            blocker_detection_threshold: default_blocker_detection_threshold(),
            blocker_resolution_timeout_ms: default_blocker_resolution_timeout_ms(),
            blocker_artifact_caps: BlockerArtifactCaps::default(),
            parallelism: ParallelismConfig::default(),
            trackers: TrackerConfig::default(),
        }
    }
}

/// A secret token setting: absent (generate on first persist), an explicit
/// value, or `false` to disable.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(untagged)]
pub enum TokenSetting {
    #[default]
    #[serde(skip)]
    Unset,
    Disabled(bool),
    Value(String),
}

impl Serialize for TokenSetting {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unset => serializer.serialize_none(),
            Self::Disabled(b) => serializer.serialize_bool(*b),
            Self::Value(s) => serializer.serialize_str(s),
        }
    }
}

impl TokenSetting {
    pub fn as_token(&self) -> Option<&str> {
        match self {
            Self::Value(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled(false))
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset | Self::Disabled(true))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotConfig {
    pub max_chars: usize,
    pub max_nodes: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { max_chars: 60_000, max_nodes: 2_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    pub allow_raw_cdp: bool,
    pub allow_non_local_cdp: bool,
    pub allow_unsafe_export: bool,
    pub prompt_injection_guard: PromptGuardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptGuardConfig {
    pub enabled: bool,
}

impl Default for PromptGuardConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DevtoolsConfig {
    /// Skip console redaction when set.
    pub show_full_console: bool,
    /// Skip network URL sanitization when set.
    pub show_full_urls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportConfig {
    pub max_nodes: usize,
    pub inline_styles: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self { max_nodes: 4_000, inline_styles: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FingerprintConfig {
    pub tier1: Tier1Config,
    pub tier2: Tier2Config,
    pub tier3: Tier3Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tier1Config {
    pub enabled: bool,
    /// Mismatches produce warnings instead of failing the launch.
    pub warn_only: bool,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub languages: Vec<String>,
    pub require_proxy: bool,
    pub geolocation_required: bool,
    pub geolocation: Option<GeolocationConfig>,
}

impl Default for Tier1Config {
    fn default() -> Self {
        Self {
            enabled: true,
            warn_only: true,
            locale: None,
            timezone: None,
            languages: Vec::new(),
            require_proxy: false,
            geolocation_required: false,
            geolocation: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GeolocationConfig {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tier2Config {
    pub enabled: bool,
    /// "deterministic" keeps one persona; "adaptive" rotates under pressure.
    pub mode: Tier2Mode,
    /// Apply network events as they stream in, not only on debug traces.
    pub continuous_signals: bool,
    pub rotation_interval_ms: u64,
    pub challenge_patterns: Vec<String>,
    pub max_challenge_events: usize,
    pub score_penalty: u32,
    pub score_recovery: u32,
    pub rotation_health_threshold: u32,
}

impl Default for Tier2Config {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: Tier2Mode::Deterministic,
            continuous_signals: false,
            rotation_interval_ms: 900_000,
            challenge_patterns: vec![
                "/challenge".into(),
                "captcha".into(),
                "cf-chl".into(),
                "__cf_chl".into(),
                "/cdn-cgi/challenge-platform".into(),
                "perimeterx".into(),
                "px-captcha".into(),
                "datadome".into(),
                "geo.captcha-delivery.com".into(),
            ],
            max_challenge_events: 32,
            score_penalty: 25,
            score_recovery: 2,
            rotation_health_threshold: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier2Mode {
    #[default]
    Deterministic,
    Adaptive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tier3Config {
    pub enabled: bool,
    pub continuous_signals: bool,
    /// Tier to fall back to when the canary rolls back.
    pub fallback_tier: FallbackTier,
    pub canary: CanaryConfig,
}

impl Default for Tier3Config {
    fn default() -> Self {
        Self {
            enabled: false,
            continuous_signals: false,
            fallback_tier: FallbackTier::Tier2,
            canary: CanaryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FallbackTier {
    Tier1,
    #[default]
    Tier2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CanaryConfig {
    pub window_size: usize,
    pub min_samples: usize,
    pub promote_threshold: f64,
    pub rollback_threshold: f64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            min_samples: 5,
            promote_threshold: 75.0,
            rollback_threshold: 35.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CanaryTargetsConfig {
    pub targets: CanaryTargetsEnabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CanaryTargetsEnabled {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockerArtifactCaps {
    pub max_network_events: usize,
    pub max_hosts: usize,
}

impl Default for BlockerArtifactCaps {
    fn default() -> Self {
        Self { max_network_events: 20, max_hosts: 12 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParallelismConfig {
    /// Never admit fewer than this many concurrent operations.
    pub floor: usize,
    pub backpressure_timeout_ms: u64,
    pub sample_interval_ms: u64,
    /// Consecutive healthy samples required before raising the cap by one.
    pub recovery_stable_windows: u32,
    pub host_free_mem_medium_pct: f64,
    pub host_free_mem_high_pct: f64,
    pub host_free_mem_critical_pct: f64,
    pub rss_budget_mb: u64,
    pub rss_soft_pct: f64,
    pub rss_high_pct: f64,
    pub rss_critical_pct: f64,
    pub queue_age_high_ms: u64,
    pub queue_age_critical_ms: u64,
    pub mode_caps: ModeCaps,
}

impl Default for ParallelismConfig {
    fn default() -> Self {
        Self {
            floor: 1,
            backpressure_timeout_ms: 30_000,
            sample_interval_ms: 5_000,
            recovery_stable_windows: 3,
            host_free_mem_medium_pct: 25.0,
            host_free_mem_high_pct: 15.0,
            host_free_mem_critical_pct: 8.0,
            rss_budget_mb: 4_096,
            rss_soft_pct: 60.0,
            rss_high_pct: 75.0,
            rss_critical_pct: 90.0,
            queue_age_high_ms: 10_000,
            queue_age_critical_ms: 30_000,
            mode_caps: ModeCaps::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModeCaps {
    pub managed_headed: usize,
    pub managed_headless: usize,
    pub cdp_connect_headed: usize,
    pub cdp_connect_headless: usize,
    pub extension_ops_headed: usize,
    pub extension_legacy_cdp_headed: usize,
}

impl Default for ModeCaps {
    fn default() -> Self {
        Self {
            managed_headed: 4,
            managed_headless: 8,
            cdp_connect_headed: 4,
            cdp_connect_headless: 8,
            extension_ops_headed: 2,
            extension_legacy_cdp_headed: 2,
        }
    }
}

/// Ring capacities for the per-session event trackers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerConfig {
    pub console_capacity: usize,
    pub network_capacity: usize,
    pub exception_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { console_capacity: 500, network_capacity: 1000, exception_capacity: 200 }
    }
}

fn default_true() -> bool {
    true
}

fn default_blocker_detection_threshold() -> u32 {
    2
}

fn default_blocker_resolution_timeout_ms() -> u64 {
    180_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_full_defaults() {
        let config: BrokerConfig =
            serde_json::from_str("{}").expect("empty object should deserialize");
        assert!(config.headless);
        assert!(!config.persist_profile);
        assert_eq!(config.snapshot.max_nodes, 2_000);
        assert_eq!(config.parallelism.mode_caps.managed_headless, 8);
        assert_eq!(config.blocker_detection_threshold, 2);
        assert!(config.fingerprint.tier1.warn_only);
        assert!(config.relay_token.is_unset());
    }

    #[test]
    fn token_false_disables_auth() {
        let config: BrokerConfig = serde_json::from_str(r#"{"relayToken": false}"#)
            .expect("token=false should deserialize");
        assert!(config.relay_token.is_disabled());
    }

    #[test]
    fn token_string_round_trips() {
        let config: BrokerConfig = serde_json::from_str(r#"{"relayToken": "abc123"}"#)
            .expect("token string should deserialize");
        assert_eq!(config.relay_token.as_token(), Some("abc123"));
    }
}
