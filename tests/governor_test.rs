//! Governor pressure classification and hysteresis.

use tabmux::config::ParallelismConfig;
use tabmux::governor::{GovernorState, ModeVariant, Pressure, PressureSample, classify_pressure};

fn policy() -> ParallelismConfig {
    ParallelismConfig::default()
}

fn sample(free_mem: f64, rss: f64) -> PressureSample {
    PressureSample { host_free_mem_pct: free_mem, rss_usage_pct: rss, ..Default::default() }
}

fn healthy() -> PressureSample {
    sample(70.0, 10.0)
}

#[test]
fn classification_table() {
    let p = policy();

    assert_eq!(classify_pressure(&healthy(), &p), Pressure::Healthy);

    // Memory thresholds, most severe first.
    assert_eq!(classify_pressure(&sample(7.0, 0.0), &p), Pressure::Critical);
    assert_eq!(classify_pressure(&sample(12.0, 0.0), &p), Pressure::High);
    assert_eq!(classify_pressure(&sample(20.0, 0.0), &p), Pressure::Medium);

    // RSS thresholds.
    assert_eq!(classify_pressure(&sample(70.0, 95.0), &p), Pressure::Critical);
    assert_eq!(classify_pressure(&sample(70.0, 80.0), &p), Pressure::High);
    assert_eq!(classify_pressure(&sample(70.0, 65.0), &p), Pressure::Medium);

    // Queue age thresholds.
    let queue_high = PressureSample { queue_age_ms: 15_000, ..healthy() };
    assert_eq!(classify_pressure(&queue_high, &p), Pressure::High);
    let queue_critical = PressureSample { queue_age_ms: 40_000, ..healthy() };
    assert_eq!(classify_pressure(&queue_critical, &p), Pressure::Critical);

    // Lifecycle signals.
    let discarded = PressureSample { discarded_signals: 1, ..healthy() };
    assert_eq!(classify_pressure(&discarded, &p), Pressure::High);
    let frozen = PressureSample { frozen_signals: 1, ..healthy() };
    assert_eq!(classify_pressure(&frozen, &p), Pressure::Medium);
}

#[test]
fn mode_variants_pick_their_caps() {
    let p = policy();
    let cases = [
        (ModeVariant::ManagedHeaded, 4),
        (ModeVariant::ManagedHeadless, 8),
        (ModeVariant::CdpConnectHeaded, 4),
        (ModeVariant::CdpConnectHeadless, 8),
        (ModeVariant::ExtensionOpsHeaded, 2),
        (ModeVariant::ExtensionLegacyCdpHeaded, 2),
    ];
    for (variant, expected) in cases {
        let state = GovernorState::new(variant, &p);
        assert_eq!(state.static_cap, expected, "{variant:?}");
        assert_eq!(state.effective_cap, expected, "{variant:?}");
    }
}

#[test]
fn penalties_lower_the_target_cap() {
    let p = policy();
    let mut state = GovernorState::new(ModeVariant::ManagedHeadless, &p);

    // Medium pressure: -1.
    state.apply_sample(&sample(20.0, 0.0), &p);
    assert_eq!(state.effective_cap, 7);

    // High pressure: -2 off the static cap.
    state.apply_sample(&sample(12.0, 0.0), &p);
    assert_eq!(state.effective_cap, 6);
}

#[test]
fn lifecycle_penalty_stacks_with_base_penalty() {
    let p = policy();
    let mut state = GovernorState::new(ModeVariant::ManagedHeadless, &p);
    // Frozen signal alone forces Medium, so: 8 - 1 (medium) - 2 (lifecycle).
    let s = PressureSample { frozen_signals: 2, ..healthy() };
    state.apply_sample(&s, &p);
    assert_eq!(state.effective_cap, 5);
}

#[test]
fn critical_drops_straight_to_floor() {
    let p = policy();
    let mut state = GovernorState::new(ModeVariant::ManagedHeadless, &p);
    state.apply_sample(&sample(5.0, 0.0), &p);
    assert_eq!(state.effective_cap, p.floor);
    assert_eq!(state.healthy_windows, 0);
}

#[test]
fn recovery_is_one_slot_per_stable_window_run() {
    let p = policy();
    let mut state = GovernorState::new(ModeVariant::ManagedHeadless, &p);
    state.apply_sample(&sample(5.0, 0.0), &p);
    assert_eq!(state.effective_cap, 1);

    // recovery_stable_windows = 3: two healthy samples are not enough.
    state.apply_sample(&healthy(), &p);
    state.apply_sample(&healthy(), &p);
    assert_eq!(state.effective_cap, 1);
    assert_eq!(state.healthy_windows, 2);

    state.apply_sample(&healthy(), &p);
    assert_eq!(state.effective_cap, 2);
    assert_eq!(state.healthy_windows, 0);

    // The next recovery needs a fresh run of healthy windows.
    state.apply_sample(&healthy(), &p);
    state.apply_sample(&healthy(), &p);
    assert_eq!(state.effective_cap, 2);
    state.apply_sample(&healthy(), &p);
    assert_eq!(state.effective_cap, 3);
}

#[test]
fn unhealthy_sample_resets_the_healthy_run() {
    let p = policy();
    let mut state = GovernorState::new(ModeVariant::ManagedHeadless, &p);
    state.apply_sample(&sample(5.0, 0.0), &p);
    state.apply_sample(&healthy(), &p);
    state.apply_sample(&healthy(), &p);
    state.apply_sample(&sample(20.0, 0.0), &p);
    assert_eq!(state.healthy_windows, 0);
    // Two more healthy samples still are not enough after the reset.
    state.apply_sample(&healthy(), &p);
    state.apply_sample(&healthy(), &p);
    assert_eq!(state.effective_cap, 1);
}

#[test]
fn floor_is_respected_when_mode_cap_is_below_it() {
    let mut p = policy();
    p.floor = 3;
    let state = GovernorState::new(ModeVariant::ExtensionOpsHeaded, &p);
    assert_eq!(state.static_cap, 3);
}
