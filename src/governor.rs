//! Per-session parallelism governor
//!
//! Computes the instantaneous concurrency cap from host pressure. Caps drop
//! immediately under pressure and recover one slot at a time, only after a
//! run of consecutive healthy samples.

use serde::Serialize;
use sysinfo::System;
use tracing::{debug, warn};

use crate::config::ParallelismConfig;
use crate::request_id::now_ms;

/// Session mode and headedness variant, selecting the static cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ModeVariant {
    ManagedHeaded,
    ManagedHeadless,
    CdpConnectHeaded,
    CdpConnectHeadless,
    ExtensionOpsHeaded,
    ExtensionLegacyCdpHeaded,
}

/// Host pressure classification, most severe first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pressure {
    Healthy,
    Medium,
    High,
    Critical,
}

/// One pressure observation fed to the governor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PressureSample {
    pub host_free_mem_pct: f64,
    pub rss_usage_pct: f64,
    pub queue_age_ms: u64,
    pub queue_depth: usize,
    pub discarded_signals: u32,
    pub frozen_signals: u32,
}

/// Governor state for one session.
#[derive(Debug, Clone, Serialize)]
pub struct GovernorState {
    pub mode_variant: ModeVariant,
    pub static_cap: usize,
    pub effective_cap: usize,
    pub healthy_windows: u32,
    pub last_sample_at: u64,
    pub last_pressure: Pressure,
}

impl GovernorState {
    pub fn new(mode_variant: ModeVariant, policy: &ParallelismConfig) -> Self {
        let static_cap = mode_cap(mode_variant, policy).max(policy.floor);
        Self {
            mode_variant,
            static_cap,
            effective_cap: static_cap,
            healthy_windows: 0,
            last_sample_at: 0,
            last_pressure: Pressure::Healthy,
        }
    }

    /// Apply one sample: classify, penalize, and run the hysteresis rules.
    pub fn apply_sample(&mut self, sample: &PressureSample, policy: &ParallelismConfig) {
        let pressure = classify_pressure(sample, policy);
        self.last_pressure = pressure;
        self.last_sample_at = now_ms();

        if pressure == Pressure::Healthy {
            self.healthy_windows = self.healthy_windows.saturating_add(1);
        } else {
            self.healthy_windows = 0;
        }

        let target = self.target_cap(sample, pressure, policy);

        if target < self.effective_cap {
            debug!(
                from = self.effective_cap,
                to = target,
                pressure = ?pressure,
                "governor lowering effective cap"
            );
            self.effective_cap = target;
            self.healthy_windows = 0;
        } else if target > self.effective_cap
            && self.healthy_windows >= policy.recovery_stable_windows
        {
            self.effective_cap += 1;
            self.healthy_windows = 0;
            debug!(to = self.effective_cap, "governor recovered one slot");
        }
    }

    fn target_cap(
        &self,
        sample: &PressureSample,
        pressure: Pressure,
        policy: &ParallelismConfig,
    ) -> usize {
        if pressure == Pressure::Critical {
            return policy.floor;
        }
        let base_penalty: usize = match pressure {
            Pressure::Healthy => 0,
            Pressure::Medium => 1,
            Pressure::High => 2,
            Pressure::Critical => unreachable!(),
        };
        let lifecycle_penalty = (sample.discarded_signals + sample.frozen_signals) as usize;
        self.static_cap
            .saturating_sub(base_penalty)
            .saturating_sub(lifecycle_penalty)
            .clamp(policy.floor, self.static_cap)
    }
}

/// First-match classification of a sample against the policy thresholds.
pub fn classify_pressure(sample: &PressureSample, policy: &ParallelismConfig) -> Pressure {
    if sample.host_free_mem_pct <= policy.host_free_mem_critical_pct
        || sample.rss_usage_pct >= policy.rss_critical_pct
        || sample.queue_age_ms >= policy.queue_age_critical_ms
    {
        Pressure::Critical
    } else if sample.host_free_mem_pct <= policy.host_free_mem_high_pct
        || sample.rss_usage_pct >= policy.rss_high_pct
        || sample.queue_age_ms >= policy.queue_age_high_ms
        || sample.discarded_signals > 0
    {
        Pressure::High
    } else if sample.host_free_mem_pct <= policy.host_free_mem_medium_pct
        || sample.rss_usage_pct >= policy.rss_soft_pct
        || sample.frozen_signals > 0
    {
        Pressure::Medium
    } else {
        Pressure::Healthy
    }
}

fn mode_cap(variant: ModeVariant, policy: &ParallelismConfig) -> usize {
    let caps = &policy.mode_caps;
    match variant {
        ModeVariant::ManagedHeaded => caps.managed_headed,
        ModeVariant::ManagedHeadless => caps.managed_headless,
        ModeVariant::CdpConnectHeaded => caps.cdp_connect_headed,
        ModeVariant::CdpConnectHeadless => caps.cdp_connect_headless,
        ModeVariant::ExtensionOpsHeaded => caps.extension_ops_headed,
        ModeVariant::ExtensionLegacyCdpHeaded => caps.extension_legacy_cdp_headed,
    }
}

/// Samples host free memory and this process's RSS against the budget.
pub struct HostSampler {
    system: System,
    rss_budget_mb: u64,
}

impl HostSampler {
    pub fn new(rss_budget_mb: u64) -> Self {
        Self { system: System::new(), rss_budget_mb: rss_budget_mb.max(1) }
    }

    /// Refresh and produce the memory half of a [`PressureSample`]; queue
    /// fields are filled in by the scheduler.
    pub fn sample(&mut self) -> (f64, f64) {
        self.system.refresh_memory();
        let total = self.system.total_memory().max(1);
        let available = self.system.available_memory();
        let host_free_mem_pct = (available as f64 / total as f64) * 100.0;

        let rss_usage_pct = match sysinfo::get_current_pid() {
            Ok(pid) => {
                self.system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
                match self.system.process(pid) {
                    Some(process) => {
                        let rss_mb = process.memory() / (1024 * 1024);
                        (rss_mb as f64 / self.rss_budget_mb as f64) * 100.0
                    }
                    None => 0.0,
                }
            }
            Err(e) => {
                warn!(error = %e, "could not resolve current pid for rss sampling");
                0.0
            }
        };

        (host_free_mem_pct, rss_usage_pct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParallelismConfig;

    fn policy() -> ParallelismConfig {
        ParallelismConfig::default()
    }

    fn healthy_sample() -> PressureSample {
        PressureSample { host_free_mem_pct: 60.0, rss_usage_pct: 10.0, ..Default::default() }
    }

    #[test]
    fn static_cap_respects_floor() {
        let mut p = policy();
        p.floor = 3;
        p.mode_caps.extension_ops_headed = 2;
        let state = GovernorState::new(ModeVariant::ExtensionOpsHeaded, &p);
        assert_eq!(state.static_cap, 3);
    }

    #[test]
    fn critical_forces_floor_immediately() {
        let p = policy();
        let mut state = GovernorState::new(ModeVariant::ManagedHeadless, &p);
        assert_eq!(state.effective_cap, 8);
        state.apply_sample(
            &PressureSample { host_free_mem_pct: 5.0, rss_usage_pct: 0.0, ..Default::default() },
            &p,
        );
        assert_eq!(state.effective_cap, p.floor);
        assert_eq!(state.last_pressure, Pressure::Critical);
    }

    #[test]
    fn discarded_signals_imply_high_pressure() {
        let p = policy();
        let sample = PressureSample { discarded_signals: 1, ..healthy_sample() };
        assert_eq!(classify_pressure(&sample, &p), Pressure::High);
    }

    #[test]
    fn recovery_takes_stable_windows_and_steps_by_one() {
        let p = policy();
        let mut state = GovernorState::new(ModeVariant::ManagedHeadless, &p);
        state.apply_sample(
            &PressureSample { host_free_mem_pct: 5.0, ..Default::default() },
            &p,
        );
        assert_eq!(state.effective_cap, 1);

        // Two healthy samples: not yet enough (recovery_stable_windows = 3).
        state.apply_sample(&healthy_sample(), &p);
        state.apply_sample(&healthy_sample(), &p);
        assert_eq!(state.effective_cap, 1);

        // Third consecutive healthy sample raises by exactly one.
        state.apply_sample(&healthy_sample(), &p);
        assert_eq!(state.effective_cap, 2);
        assert_eq!(state.healthy_windows, 0);
    }

    #[test]
    fn non_healthy_resets_recovery_progress() {
        let p = policy();
        let mut state = GovernorState::new(ModeVariant::ManagedHeadless, &p);
        state.apply_sample(
            &PressureSample { host_free_mem_pct: 5.0, ..Default::default() },
            &p,
        );
        state.apply_sample(&healthy_sample(), &p);
        state.apply_sample(&healthy_sample(), &p);
        // Medium pressure wipes the streak.
        state.apply_sample(
            &PressureSample { host_free_mem_pct: 20.0, ..Default::default() },
            &p,
        );
        assert_eq!(state.healthy_windows, 0);
        state.apply_sample(&healthy_sample(), &p);
        assert_eq!(state.effective_cap, 1);
    }
}
