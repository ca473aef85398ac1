//! Request correlation ids
//!
//! Every broker operation is stamped with a short correlation id that flows
//! through structured log events and into debug-trace bundles.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque correlation id for one broker operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Mint a fresh id. Uses the first uuid segment; long enough to be
    /// unique within a process lifetime, short enough for log lines.
    pub fn new() -> Self {
        let full = Uuid::new_v4().simple().to_string();
        Self(format!("req-{}", &full[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the unix epoch, as used throughout blocker and
/// fingerprint timestamps.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
