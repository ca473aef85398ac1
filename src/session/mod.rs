//! Session manager
//!
//! A session is one live automation context bound to one browser
//! connection. It composes the target registry, ref store, event trackers,
//! blocker FSM, fingerprint pipeline, and the per-session governor state,
//! and exposes the broker's public operation surface.

mod broker;
mod cookies;
mod debug_trace;
mod listeners;
mod ops;

pub use broker::{ConnectOpts, LaunchOpts, RelayConnectOpts, SessionBroker};
pub use cookies::{
    CookieImportReport, CookieInfo, CookieRecord, CookieRejection, NormalizedCookie,
    validate_cookie,
};
pub use debug_trace::{DebugTraceBundle, TraceCursors};
pub use ops::{GotoResult, SnapshotResult};

use chromiumoxide::Browser;
use parking_lot::Mutex as PlMutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::blocker::{BlockerFsm, BlockerMeta};
use crate::config::BrokerConfig;
use crate::fingerprint::FingerprintState;
use crate::ids::SessionId;
use crate::refs::RefStore;
use crate::relay::OpsClient;
use crate::request_id::RequestId;
use crate::targets::TargetRegistry;
use crate::trackers::{
    ConsoleEvent, EventTracker, ExceptionEvent, NetworkEvent, Subscription,
};

/// Operating mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    /// We launched the browser and own its lifetime.
    Managed,
    /// Attached to an externally launched browser over CDP.
    CdpConnect,
    /// Attached through the extension relay.
    ExtensionRelay,
}

/// Success record common to every operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpOutcome<T> {
    pub value: T,
    pub elapsed_ms: u64,
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocker: Option<BlockerMeta>,
}

/// One live automation context.
pub struct Session {
    pub id: SessionId,
    pub mode: SessionMode,
    /// Extension relay over the legacy CDP path instead of ops.
    pub extension_legacy_cdp: bool,
    pub(crate) config: BrokerConfig,
    pub(crate) browser: Mutex<Option<Browser>>,
    pub(crate) handler_task: PlMutex<Option<JoinHandle<()>>>,
    pub(crate) targets: TargetRegistry,
    pub(crate) refs: RefStore,
    pub(crate) console: Arc<EventTracker<ConsoleEvent>>,
    pub(crate) network: Arc<EventTracker<NetworkEvent>>,
    pub(crate) exceptions: Arc<EventTracker<ExceptionEvent>>,
    pub(crate) blocker: PlMutex<BlockerFsm>,
    pub(crate) fingerprint: PlMutex<FingerprintState>,
    pub(crate) profile_dir: Option<PathBuf>,
    /// Ephemeral profile dirs are removed on disconnect.
    pub(crate) owns_profile_dir: bool,
    pub(crate) listener_tasks: PlMutex<Vec<JoinHandle<()>>>,
    pub(crate) network_signal: PlMutex<Option<Subscription<NetworkEvent>>>,
    pub(crate) ops_client: Option<Arc<OpsClient>>,
    pub(crate) ops_event_task: PlMutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Blocker meta for attaching to an operation result, including the
    /// terminal resolution of an operation that just cleared the blocker.
    pub(crate) fn blocker_meta(&self) -> Option<BlockerMeta> {
        self.blocker.lock().meta_with_resolution()
    }
}
