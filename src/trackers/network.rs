//! Network event capture
//!
//! Requests and responses are recorded as separate events. URLs are stored
//! sanitized (query/fragment stripped, token-like path segments replaced)
//! unless show-full-urls is set; the host is kept alongside for blocker and
//! fingerprint consumers.

use chromiumoxide_cdp::cdp::browser_protocol::network::{
    EventRequestWillBeSent, EventResponseReceived,
};
use serde::Serialize;
use url::Url;

use super::redact::sanitize_url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPhase {
    Request,
    Response,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkEvent {
    pub phase: NetworkPhase,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
}

pub fn request_event_from_cdp(event: &EventRequestWillBeSent, show_full: bool) -> NetworkEvent {
    let raw_url = event.request.url.as_str();
    NetworkEvent {
        phase: NetworkPhase::Request,
        url: stored_url(raw_url, show_full),
        host: host_of(raw_url),
        method: Some(event.request.method.clone()),
        status: None,
        resource_type: event.r#type.as_ref().map(|t| format!("{t:?}").to_lowercase()),
    }
}

pub fn response_event_from_cdp(event: &EventResponseReceived, show_full: bool) -> NetworkEvent {
    let raw_url = event.response.url.as_str();
    NetworkEvent {
        phase: NetworkPhase::Response,
        url: stored_url(raw_url, show_full),
        host: host_of(raw_url),
        method: None,
        status: Some(event.response.status),
        resource_type: Some(format!("{:?}", event.r#type).to_lowercase()),
    }
}

fn stored_url(raw: &str, show_full: bool) -> String {
    if show_full { raw.to_string() } else { sanitize_url(raw) }
}

fn host_of(raw: &str) -> Option<String> {
    Url::parse(raw).ok().and_then(|u| u.host_str().map(|h| h.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://example.com/a?b=1"), Some("example.com".to_string()));
        assert_eq!(host_of("not a url"), None);
    }
}
