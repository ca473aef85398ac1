//! Broker error taxonomy and driver error classification
//!
//! Driver-surface failures arrive as strings. Pattern matching on those
//! strings is isolated here; the rest of the crate switches on the tagged
//! [`BrokerError`] variants instead of re-testing substrings.

use thiserror::Error;

/// Errors surfaced by broker operations.
///
/// Every variant carries a message suitable for displaying to the user.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Bad ref, missing required field, invalid cookie, invalid URL.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Ref was cleared by navigation or never existed.
    #[error("unknown ref '{0}': refs are invalidated by navigation; take a new snapshot and retry")]
    UnknownRef(String),

    /// No tab is active in the session.
    #[error("no active target: open or select a tab first")]
    NoActiveTarget,

    /// The session was disconnected while the operation was pending.
    #[error("session terminated")]
    SessionTerminated,

    /// Unknown session id.
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// CDP endpoint did not resolve to a local address.
    #[error("non-local endpoint '{0}': pass allow_non_local_cdp to permit remote endpoints")]
    NonLocalEndpoint(String),

    /// CDP endpoint used a protocol outside the allow-list.
    #[error("disallowed protocol '{0}': expected ws, wss, http or https")]
    DisallowedProtocol(String),

    #[error("relay rejected credentials: check the relay token and pairing state")]
    RelayUnauthorized,

    #[error("relay unavailable: {0}")]
    RelayUnavailable(String),

    #[error("relay pairing mismatch: the relay restarted since pairing; re-pair and retry")]
    RelayPairingMismatch,

    #[error("relay requires pairing but returned no token")]
    RelayPairingTokenMissing,

    /// The extension denied tab creation.
    #[error("extension does not permit opening new targets; reusing the active tab instead")]
    ExtensionTargetNotAllowed,

    #[error("timed out after {0} ms waiting for the extension tab to become ready")]
    ExtensionTargetReadyTimeout(u64),

    #[error("extension tab closed before it became ready")]
    ExtensionTargetReadyClosed,

    /// Frame detached mid-operation. Retried once internally before surfacing.
    #[error("frame detached during operation: {0}")]
    DetachedFrame(String),

    /// Governor slot was not acquired within the backpressure timeout.
    #[error("operation rejected after {waited_ms} ms of backpressure (effective cap {cap})")]
    BackpressureTimeout { waited_ms: u64, cap: usize },

    /// Chrome singleton profile lock conflict.
    #[error(
        "browser profile is locked by another instance; use `--profile <name>` or `--persist-profile false` to run an isolated profile"
    )]
    ProfileLocked,

    /// One or more teardown steps failed. The original error, when present,
    /// is first in the list.
    #[error("cleanup failed: {}", .errors.join("; "))]
    CleanupFailed { errors: Vec<String> },

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("operation cancelled")]
    Cancelled,

    /// Driver error that matched no known pattern. Surfaced as-is.
    #[error("{0}")]
    Driver(String),
}

impl BrokerError {
    /// Stable machine-readable kind, used in structured logs and RPC errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::UnknownRef(_) => "unknown_ref",
            Self::NoActiveTarget => "no_active_target",
            Self::SessionTerminated => "session_terminated",
            Self::InvalidSession(_) => "invalid_session",
            Self::NonLocalEndpoint(_) => "non_local_endpoint",
            Self::DisallowedProtocol(_) => "disallowed_protocol",
            Self::RelayUnauthorized => "relay_unauthorized",
            Self::RelayUnavailable(_) => "relay_unavailable",
            Self::RelayPairingMismatch => "relay_pairing_mismatch",
            Self::RelayPairingTokenMissing => "relay_pairing_token_missing",
            Self::ExtensionTargetNotAllowed => "extension_target_not_allowed",
            Self::ExtensionTargetReadyTimeout(_) => "extension_target_ready_timeout",
            Self::ExtensionTargetReadyClosed => "extension_target_ready_closed",
            Self::DetachedFrame(_) => "detached_frame",
            Self::BackpressureTimeout { .. } => "backpressure_timeout",
            Self::ProfileLocked => "profile_locked",
            Self::CleanupFailed { .. } => "cleanup_failed",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Driver(_) => "driver",
        }
    }

    /// True when re-snapshotting or retrying may clear the failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UnknownRef(_) | Self::DetachedFrame(_) | Self::BackpressureTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Tagged classification of a raw driver error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    ProfileLocked,
    DetachedFrame,
    StaleExtensionTab,
    ExtensionNotReady,
    TargetCreationNotAllowed,
    Unauthorized,
    Other,
}

/// Classify a driver error message into a tagged kind.
///
/// Chrome and the relay both report failures as free text; the substrings
/// matched here are the stable fragments observed across driver versions.
pub fn classify_driver_error(message: &str) -> DriverErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("singletonlock")
        || lower.contains("profile is already in use")
        || lower.contains("process_singleton")
        || lower.contains("failed to create a processsingleton")
    {
        DriverErrorKind::ProfileLocked
    } else if lower.contains("detached") && lower.contains("frame") {
        DriverErrorKind::DetachedFrame
    } else if lower.contains("no tab with given id") || lower.contains("tab was discarded") {
        DriverErrorKind::StaleExtensionTab
    } else if lower.contains("cannot access") && lower.contains("extension") {
        DriverErrorKind::ExtensionNotReady
    } else if lower.contains("not allowed to create") || lower.contains("targets are not permitted")
    {
        DriverErrorKind::TargetCreationNotAllowed
    } else if lower.contains("401") || lower.contains("unauthorized") {
        DriverErrorKind::Unauthorized
    } else {
        DriverErrorKind::Other
    }
}

/// Translate a raw driver error into the broker taxonomy.
///
/// Unmatched messages pass through as [`BrokerError::Driver`]; non-`Error`
/// values thrown by the driver should be stringified before reaching here.
pub fn translate_driver_error(message: impl Into<String>) -> BrokerError {
    let message = message.into();
    match classify_driver_error(&message) {
        DriverErrorKind::ProfileLocked => BrokerError::ProfileLocked,
        DriverErrorKind::DetachedFrame => BrokerError::DetachedFrame(message),
        DriverErrorKind::Unauthorized => BrokerError::RelayUnauthorized,
        DriverErrorKind::TargetCreationNotAllowed => BrokerError::ExtensionTargetNotAllowed,
        _ => BrokerError::Driver(message),
    }
}
