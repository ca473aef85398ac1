//! Blocker detection and resolution
//!
//! A per-session state machine classifies authentication walls, anti-bot
//! challenges, and upstream blocks from navigation and network evidence,
//! then tracks verifier-driven recovery.

mod artifacts;
mod classifier;
mod fsm;

pub use artifacts::{BlockerArtifacts, SanitizationSummary, build_artifacts};
pub use classifier::{
    Blocker, BlockerKind, EvidenceSource, EvidenceStrength, NavEvidence, classify,
};
pub use fsm::{
    BlockerFsm, BlockerMeta, BlockerState, ReconcileRecord, Resolution, ResolutionReason,
    ResolutionStatus, target_key,
};
