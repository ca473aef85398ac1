//! Broker configuration: nested JSONC document, defaults, token persistence.

mod loader;
mod types;

pub use loader::{generate_token, load_config, load_or_init_config, parse_config, persist_config};
pub use types::{
    BlockerArtifactCaps, BrokerConfig, CanaryConfig, CanaryTargetsConfig, CanaryTargetsEnabled,
    DevtoolsConfig, ExportConfig, FallbackTier, FingerprintConfig, GeolocationConfig, ModeCaps,
    ParallelismConfig, PromptGuardConfig, SecurityConfig, SnapshotConfig, Tier1Config,
    Tier2Config, Tier2Mode, Tier3Config, TokenSetting, TrackerConfig,
};
