//! CDP endpoint validation corpus.

use tabmux::BrokerError;
use tabmux::validate_cdp_endpoint;

#[test]
fn hostile_and_malformed_endpoints_are_rejected() {
    let corpus = [
        "ws://127.0.0.1.evil.com",
        "ws://localhost.evil.com",
        "ws://evil.com?host=127.0.0.1",
        "ftp://127.0.0.1/cdp",
        "not-a-url",
    ];
    for raw in corpus {
        assert!(validate_cdp_endpoint(raw, false).is_err(), "{raw} must be rejected");
    }
}

#[test]
fn loopback_endpoints_pass() {
    for raw in [
        "ws://localhost:9222/devtools/browser/0b54ae9e",
        "ws://127.0.0.1:9222",
        "wss://127.0.0.1:9222/cdp",
        "http://localhost:9222/json/version",
        "https://[::1]:9222",
        "ws://LocalHost:9222",
    ] {
        assert!(validate_cdp_endpoint(raw, false).is_ok(), "{raw} must pass");
    }
}

#[test]
fn error_kinds_distinguish_protocol_from_host() {
    match validate_cdp_endpoint("ftp://localhost/cdp", false) {
        Err(BrokerError::DisallowedProtocol(_)) => {}
        other => panic!("expected disallowed_protocol, got {other:?}"),
    }
    match validate_cdp_endpoint("ws://192.168.1.4:9222", false) {
        Err(BrokerError::NonLocalEndpoint(host)) => assert_eq!(host, "192.168.1.4"),
        other => panic!("expected non_local_endpoint, got {other:?}"),
    }
}

#[test]
fn non_local_opt_in_is_honored_but_protocol_still_enforced() {
    assert!(validate_cdp_endpoint("ws://build-host.internal:9222", true).is_ok());
    assert!(validate_cdp_endpoint("ftp://build-host.internal:9222", true).is_err());
}
