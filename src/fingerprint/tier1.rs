//! Tier 1: launch-time fingerprint coherence
//!
//! One-shot evaluation at session start. Expected locale/timezone/languages/
//! proxy/geolocation from config are compared against what the launch flags
//! actually configure; mismatches become issues and human-readable warnings.

use serde::Serialize;

use crate::config::Tier1Config;

/// Environment as derived from the concrete launch flags.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DerivedEnvironment {
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub languages: Vec<String>,
    pub proxy_server: Option<String>,
}

impl DerivedEnvironment {
    /// Parse `--lang`, `--timezone[-for-testing]` and `--proxy-server`
    /// out of a raw flag list.
    pub fn from_flags(flags: &[String]) -> Self {
        let mut derived = Self::default();
        for flag in flags {
            if let Some(value) = flag_value(flag, "--lang") {
                derived.languages = value.split(',').map(|s| s.trim().to_string()).collect();
                derived.locale = derived.languages.first().cloned();
            } else if let Some(value) = flag_value(flag, "--timezone-for-testing") {
                derived.timezone = Some(value);
            } else if let Some(value) = flag_value(flag, "--timezone") {
                derived.timezone = Some(value);
            } else if let Some(value) = flag_value(flag, "--proxy-server") {
                derived.proxy_server = Some(value);
            }
        }
        derived
    }
}

fn flag_value(flag: &str, name: &str) -> Option<String> {
    let rest = flag.strip_prefix(name)?;
    let value = rest.strip_prefix('=')?;
    Some(value.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier1IssueKind {
    LocaleMismatch,
    TimezoneMismatch,
    LanguagesMismatch,
    ProxyMissing,
    GeolocationMissing,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tier1Issue {
    pub kind: Tier1IssueKind,
    pub expected: String,
    pub actual: String,
}

/// Result of the one-shot coherence evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct Tier1Report {
    pub enabled: bool,
    pub ok: bool,
    pub issues: Vec<Tier1Issue>,
    pub warnings: Vec<String>,
}

impl Tier1Report {
    pub fn disabled() -> Self {
        Self { enabled: false, ok: true, issues: Vec::new(), warnings: Vec::new() }
    }
}

/// Evaluate expected-vs-derived coherence.
pub fn evaluate_coherence(config: &Tier1Config, derived: &DerivedEnvironment) -> Tier1Report {
    if !config.enabled {
        return Tier1Report::disabled();
    }

    let mut issues = Vec::new();

    if let Some(expected) = &config.locale {
        let actual = derived.locale.as_deref().unwrap_or("<unset>");
        if !actual.eq_ignore_ascii_case(expected) {
            issues.push(Tier1Issue {
                kind: Tier1IssueKind::LocaleMismatch,
                expected: expected.clone(),
                actual: actual.to_string(),
            });
        }
    }

    if let Some(expected) = &config.timezone {
        let actual = derived.timezone.as_deref().unwrap_or("<unset>");
        if actual != expected {
            issues.push(Tier1Issue {
                kind: Tier1IssueKind::TimezoneMismatch,
                expected: expected.clone(),
                actual: actual.to_string(),
            });
        }
    }

    if !config.languages.is_empty() && config.languages != derived.languages {
        issues.push(Tier1Issue {
            kind: Tier1IssueKind::LanguagesMismatch,
            expected: config.languages.join(","),
            actual: derived.languages.join(","),
        });
    }

    if config.require_proxy && derived.proxy_server.is_none() {
        issues.push(Tier1Issue {
            kind: Tier1IssueKind::ProxyMissing,
            expected: "proxy-server flag".to_string(),
            actual: "<unset>".to_string(),
        });
    }

    if config.geolocation_required && config.geolocation.is_none() {
        issues.push(Tier1Issue {
            kind: Tier1IssueKind::GeolocationMissing,
            expected: "geolocation coordinates".to_string(),
            actual: "<unset>".to_string(),
        });
    }

    let warnings = issues
        .iter()
        .map(|issue| {
            format!(
                "fingerprint coherence: {:?} expected '{}' but launch flags give '{}'",
                issue.kind, issue.expected, issue.actual
            )
        })
        .collect();

    Tier1Report { enabled: true, ok: issues.is_empty(), issues, warnings }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse_into_environment() {
        let flags = vec![
            "--lang=en-US,en".to_string(),
            "--timezone-for-testing=America/New_York".to_string(),
            "--proxy-server=socks5://127.0.0.1:1080".to_string(),
            "--disable-gpu".to_string(),
        ];
        let derived = DerivedEnvironment::from_flags(&flags);
        assert_eq!(derived.locale.as_deref(), Some("en-US"));
        assert_eq!(derived.timezone.as_deref(), Some("America/New_York"));
        assert_eq!(derived.languages, vec!["en-US", "en"]);
        assert!(derived.proxy_server.is_some());
    }

    #[test]
    fn mismatches_become_issues_and_warnings() {
        let config = Tier1Config {
            locale: Some("fr-FR".to_string()),
            timezone: Some("Europe/Paris".to_string()),
            require_proxy: true,
            ..Default::default()
        };
        let derived = DerivedEnvironment::from_flags(&["--lang=en-US".to_string()]);
        let report = evaluate_coherence(&config, &derived);
        assert!(!report.ok);
        assert_eq!(report.issues.len(), 3);
        assert_eq!(report.warnings.len(), 3);
    }

    #[test]
    fn coherent_launch_is_ok() {
        let config = Tier1Config {
            locale: Some("en-US".to_string()),
            ..Default::default()
        };
        let derived = DerivedEnvironment::from_flags(&["--lang=en-US".to_string()]);
        assert!(evaluate_coherence(&config, &derived).ok);
    }

    #[test]
    fn disabled_tier_reports_ok() {
        let config = Tier1Config { enabled: false, ..Default::default() };
        let report = evaluate_coherence(&config, &DerivedEnvironment::default());
        assert!(report.ok);
        assert!(!report.enabled);
    }
}
