//! CDP endpoint validation
//!
//! Every CDP-like URL that reaches the broker, including WebSocket URLs
//! returned by the driver's own `/json/version`, is validated here before
//! any connection attempt. Hosts are matched exactly against the loopback
//! set so `127.0.0.1.evil.com`-style suffix tricks fail.

use url::Url;

use crate::error::{BrokerError, Result};

const ALLOWED_SCHEMES: [&str; 4] = ["ws", "wss", "http", "https"];

const LOCAL_HOSTS: [&str; 4] = ["localhost", "127.0.0.1", "::1", "[::1]"];

/// Validate a CDP endpoint URL.
///
/// Returns the parsed URL on success. Non-local hosts are rejected unless
/// `allow_non_local` is set. Unparsable input is `invalid_input`.
pub fn validate_cdp_endpoint(raw: &str, allow_non_local: bool) -> Result<Url> {
    let parsed = Url::parse(raw)
        .map_err(|e| BrokerError::InvalidInput(format!("unparsable endpoint '{raw}': {e}")))?;

    let scheme = parsed.scheme();
    if !ALLOWED_SCHEMES.contains(&scheme) {
        return Err(BrokerError::DisallowedProtocol(scheme.to_string()));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| BrokerError::InvalidInput(format!("endpoint '{raw}' has no host")))?;

    if !is_local_host(host) && !allow_non_local {
        return Err(BrokerError::NonLocalEndpoint(host.to_string()));
    }

    Ok(parsed)
}

/// Exact, case-insensitive membership in the loopback host set.
pub fn is_local_host(host: &str) -> bool {
    let normalized = host.to_ascii_lowercase();
    LOCAL_HOSTS.contains(&normalized.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_loopback_endpoints() {
        for raw in [
            "ws://127.0.0.1:9222/devtools/browser/abc",
            "ws://localhost:9222",
            "http://[::1]:9222/json/version",
            "wss://LOCALHOST:9222/cdp",
        ] {
            assert!(validate_cdp_endpoint(raw, false).is_ok(), "{raw}");
        }
    }

    #[test]
    fn rejects_suffix_tricks_and_bad_protocols() {
        for raw in [
            "ws://127.0.0.1.evil.com",
            "ws://localhost.evil.com",
            "ws://evil.com?host=127.0.0.1",
            "ftp://127.0.0.1/cdp",
            "not-a-url",
        ] {
            assert!(validate_cdp_endpoint(raw, false).is_err(), "{raw}");
        }
    }

    #[test]
    fn non_local_requires_opt_in() {
        assert!(validate_cdp_endpoint("ws://10.0.0.5:9222", false).is_err());
        assert!(validate_cdp_endpoint("ws://10.0.0.5:9222", true).is_ok());
    }

    #[test]
    fn ftp_is_protocol_error_even_for_loopback() {
        match validate_cdp_endpoint("ftp://127.0.0.1/cdp", true) {
            Err(BrokerError::DisallowedProtocol(p)) => assert_eq!(p, "ftp"),
            other => panic!("expected protocol rejection, got {other:?}"),
        }
    }
}
