pub mod blocker;
pub mod browser_profile;
pub mod browser_setup;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fingerprint;
pub mod governor;
pub mod ids;
pub mod refs;
pub mod relay;
pub mod request_id;
pub mod scheduler;
pub mod session;
pub mod targets;
pub mod trackers;

pub use blocker::{Blocker, BlockerKind, BlockerMeta, BlockerState, NavEvidence};
pub use config::{BrokerConfig, load_config, load_or_init_config, parse_config};
pub use endpoint::validate_cdp_endpoint;
pub use error::{BrokerError, Result};
pub use fingerprint::{FingerprintMeta, FingerprintState, SignalSource};
pub use governor::{GovernorState, ModeVariant, Pressure, PressureSample};
pub use ids::{SessionId, TargetId};
pub use refs::{RefEntry, RefStore};
pub use request_id::RequestId;
pub use scheduler::TargetScheduler;
pub use session::{
    ConnectOpts, CookieRecord, DebugTraceBundle, LaunchOpts, OpOutcome, RelayConnectOpts,
    Session, SessionBroker, SessionMode, TraceCursors,
};
pub use targets::{TargetInfo, TargetRegistry};
pub use trackers::{
    ConsoleEvent, EventTracker, ExceptionEvent, NetworkEvent, PollResult, TrackedEvent,
};
