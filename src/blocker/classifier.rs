//! Blocker classification
//!
//! Turns navigation/network evidence into a classified obstacle: an
//! authentication wall, an anti-bot challenge, or an upstream block.
//! Classification is pure; the FSM decides what a detection means.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerKind {
    AuthRequired,
    BotChallenge,
    UpstreamBlocked,
}

/// A classified obstacle on the active target.
#[derive(Debug, Clone, Serialize)]
pub struct Blocker {
    #[serde(rename = "type")]
    pub kind: BlockerKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub detail: String,
}

/// How confident a single observation is. Weak evidence needs repeated
/// observations before the FSM activates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceStrength {
    Strong,
    Weak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvidenceSource {
    Navigation,
    Network,
    Console,
    DebugTrace,
}

/// Evidence gathered around one operation.
#[derive(Debug, Clone)]
pub struct NavEvidence {
    pub source: EvidenceSource,
    pub url: String,
    pub final_url: Option<String>,
    pub title: Option<String>,
    pub status: Option<i64>,
    pub provider_error_code: Option<String>,
    pub message: Option<String>,
    pub network_hosts: Vec<String>,
    pub matched_patterns: Vec<String>,
    pub prompt_guard_enabled: bool,
}

impl NavEvidence {
    pub fn navigation(url: impl Into<String>) -> Self {
        Self {
            source: EvidenceSource::Navigation,
            url: url.into(),
            final_url: None,
            title: None,
            status: None,
            provider_error_code: None,
            message: None,
            network_hosts: Vec::new(),
            matched_patterns: Vec::new(),
            prompt_guard_enabled: true,
        }
    }

    /// Hostname of the landing URL, falling back to the requested URL.
    pub fn hostname(&self) -> Option<String> {
        let effective = self.final_url.as_deref().unwrap_or(&self.url);
        Url::parse(effective).ok().and_then(|u| u.host_str().map(|h| h.to_string()))
    }
}

lazy_static! {
    static ref AUTH_TITLE: Regex = Regex::new(
        r"(?i)^(log ?in|sign ?in)\b|\b(log ?in|sign ?in) (to|required)\b|verify (it'?s|its) you"
    )
    .expect("auth title pattern compiles");
    static ref AUTH_URL_PATH: Regex = Regex::new(
        r"(?i)/(login|signin|sign-in|log-in|i/flow/login|accounts/(login|signin)|oauth2?/(auth|authorize)|sso)([/?#]|$)"
    )
    .expect("auth url pattern compiles");
    static ref CHALLENGE_TITLE: Regex = Regex::new(
        r"(?i)just a moment|attention required|checking your browser|verify you are (a )?human|are you a robot|access denied"
    )
    .expect("challenge title pattern compiles");
}

const CHALLENGE_HOSTS: [&str; 6] = [
    "challenges.cloudflare.com",
    "geo.captcha-delivery.com",
    "hcaptcha.com",
    "recaptcha.net",
    "perimeterx.net",
    "datadome.co",
];

/// Classify evidence into a blocker, or `None` when the page looks clear.
pub fn classify(evidence: &NavEvidence) -> Option<(Blocker, EvidenceStrength)> {
    let effective_url = evidence.final_url.as_deref().unwrap_or(&evidence.url);
    let title = evidence.title.as_deref().unwrap_or("");

    // Auth walls: title or landing path names a login flow.
    if AUTH_TITLE.is_match(title) || AUTH_URL_PATH.is_match(effective_url) {
        return Some((
            Blocker {
                kind: BlockerKind::AuthRequired,
                provider: evidence.hostname(),
                detail: if title.is_empty() {
                    format!("landed on a login flow at {effective_url}")
                } else {
                    format!("page presents a login wall: {title}")
                },
            },
            EvidenceStrength::Strong,
        ));
    }

    // Anti-bot challenges: interstitial titles, 403s from challenge
    // providers, or configured challenge patterns observed on the wire.
    if CHALLENGE_TITLE.is_match(title) {
        return Some((
            Blocker {
                kind: BlockerKind::BotChallenge,
                provider: challenge_provider(&evidence.network_hosts),
                detail: format!("challenge interstitial: {title}"),
            },
            EvidenceStrength::Strong,
        ));
    }
    if evidence.status == Some(403) && challenge_provider(&evidence.network_hosts).is_some() {
        return Some((
            Blocker {
                kind: BlockerKind::BotChallenge,
                provider: challenge_provider(&evidence.network_hosts),
                detail: "403 with challenge provider traffic".to_string(),
            },
            EvidenceStrength::Strong,
        ));
    }
    if !evidence.matched_patterns.is_empty() {
        return Some((
            Blocker {
                kind: BlockerKind::BotChallenge,
                provider: challenge_provider(&evidence.network_hosts),
                detail: format!("challenge patterns matched: {}", evidence.matched_patterns.join(", ")),
            },
            EvidenceStrength::Weak,
        ));
    }
    if challenge_provider(&evidence.network_hosts).is_some() {
        return Some((
            Blocker {
                kind: BlockerKind::BotChallenge,
                provider: challenge_provider(&evidence.network_hosts),
                detail: "challenge provider traffic observed".to_string(),
            },
            EvidenceStrength::Weak,
        ));
    }

    // Upstream blocks: provider error codes and throttling statuses.
    if let Some(code) = &evidence.provider_error_code {
        return Some((
            Blocker {
                kind: BlockerKind::UpstreamBlocked,
                provider: evidence.hostname(),
                detail: format!("provider error {code}"),
            },
            EvidenceStrength::Strong,
        ));
    }
    if matches!(evidence.status, Some(429) | Some(503)) {
        let detail = match &evidence.message {
            Some(m) => format!("upstream returned {}: {m}", evidence.status.unwrap_or_default()),
            None => format!("upstream returned {}", evidence.status.unwrap_or_default()),
        };
        return Some((
            Blocker {
                kind: BlockerKind::UpstreamBlocked,
                provider: evidence.hostname(),
                detail,
            },
            EvidenceStrength::Weak,
        ));
    }

    None
}

fn challenge_provider(hosts: &[String]) -> Option<String> {
    hosts.iter().find_map(|host| {
        CHALLENGE_HOSTS
            .iter()
            .find(|known| host == *known || host.ends_with(&format!(".{known}")))
            .map(|known| (*known).to_string())
    })
}
