//! Property tests for the core data structures: the percentile filter,
//! the monotonic report rule, the debouncer, the offset search, and the
//! state machine's reachability envelope.

use batcharge::app::ports::AdapterState;
use batcharge::config::ChargeConfig;
use batcharge::control::current::CvOffsetSearch;
use batcharge::control::debounce::Debouncer;
use batcharge::fsm::context::ChargeContext;
use batcharge::fsm::states::build_state_table;
use batcharge::fsm::{Fsm, StateId};
use batcharge::sensors::voltage::{capacity_percent, VoltageReport, VoltageSampler};
use proptest::prelude::*;

// ── Percentile filter ─────────────────────────────────────────

proptest! {
    /// The filtered value is always one of the window's samples and never
    /// the window maximum (for windows with distinct values the top ~20 %
    /// is rejected by construction).
    #[test]
    fn percentile_is_a_member_within_bounds(
        samples in proptest::collection::vec(2200u16..=4800, 10..=30),
    ) {
        let mut s = VoltageSampler::new();
        for &v in &samples {
            s.push(v);
        }
        let picked = s.windowed_percentile(1).unwrap();
        let window = &samples[samples.len() - 10..];
        let min = u32::from(*window.iter().min().unwrap());
        let max = u32::from(*window.iter().max().unwrap());
        prop_assert!(picked >= min && picked <= max);
        prop_assert!(window.iter().any(|&v| u32::from(v) == picked));
        // Rank 7 of 10: at least two window samples sit at or above it.
        let at_or_above = window.iter().filter(|&&v| u32::from(v) >= picked).count();
        prop_assert!(at_or_above >= 2);
    }

    /// Out-of-range conversions never enter the ring.
    #[test]
    fn percentile_output_is_always_plausible(
        samples in proptest::collection::vec(0u16..=u16::MAX, 10..=60),
    ) {
        let mut s = VoltageSampler::new();
        for &v in &samples {
            s.push(v);
        }
        if let Some(mv) = s.windowed_percentile(1) {
            prop_assert!((2200..=4800).contains(&mv));
        }
    }
}

// ── Monotonic report rule ─────────────────────────────────────

proptest! {
    /// While a charge session runs (battery present) the report never
    /// falls; while discharging it never rises.
    #[test]
    fn report_is_monotonic_per_direction(
        candidates in proptest::collection::vec(2200u32..=4800, 1..=50),
        charging in any::<bool>(),
    ) {
        let mut r = VoltageReport::new();
        let mut prev = None;
        for &c in &candidates {
            let v = r.accept(c, charging, true);
            if let Some(p) = prev {
                if charging {
                    prop_assert!(v >= p);
                } else {
                    prop_assert!(v <= p);
                }
            }
            prev = Some(v);
        }
    }

    /// Capacity mapping is total and bounded for any report value.
    #[test]
    fn capacity_is_bounded(mv in 0u32..=6000) {
        let table = ChargeConfig::default().level_table;
        prop_assert!(capacity_percent(mv, &table) <= 100);
    }
}

// ── Debouncer ─────────────────────────────────────────────────

proptest! {
    /// An accepted change is only ever reported after `depth` consecutive
    /// agreeing raw observations.
    #[test]
    fn debouncer_needs_consecutive_agreement(
        raw in proptest::collection::vec(any::<bool>(), 1..=100),
        depth in 1usize..=8,
    ) {
        let mut d: Debouncer<bool, 8> = Debouncer::new(depth, false);
        let mut history: Vec<bool> = Vec::new();
        for &v in &raw {
            history.push(v);
            if let Some(accepted) = d.update(v) {
                prop_assert!(history.len() >= depth);
                prop_assert!(
                    history[history.len() - depth..].iter().all(|&h| h == accepted),
                    "accepted {accepted} without {depth} agreeing samples"
                );
            }
        }
    }
}

// ── Offset search ─────────────────────────────────────────────

proptest! {
    /// For any measurement sequence the search terminates within its step
    /// ceiling and the offset stays within the hardware field.
    #[test]
    fn offset_search_is_bounded(
        measured in proptest::collection::vec(2200u32..=4800, 17..=40),
        target in 4000u32..=4400,
    ) {
        let mut s = CvOffsetSearch::new();
        for &mv in &measured {
            let off = s.step(target, mv);
            prop_assert!(off.abs() <= 16);
        }
        prop_assert!(s.completed(), "16+ iterations must complete the search");
    }
}

// ── FSM reachability ──────────────────────────────────────────

fn arb_adapter() -> impl Strategy<Value = AdapterState> {
    prop_oneof![
        Just(AdapterState::Unknown),
        Just(AdapterState::Absent),
        Just(AdapterState::Present),
    ]
}

proptest! {
    /// Arbitrary input sequences never drive the machine to an invalid
    /// state, and every requested charge current is nonzero.
    #[test]
    fn fsm_stays_within_valid_states(
        inputs in proptest::collection::vec(
            (arb_adapter(), proptest::option::of(2200u32..=4800), any::<bool>(), 0u16..=300),
            1..=200,
        ),
    ) {
        let mut fsm = Fsm::new(build_state_table(), StateId::Init);
        let mut ctx = ChargeContext::new(ChargeConfig::default());
        fsm.start(&mut ctx);

        let valid = [
            StateId::Init,
            StateId::Low,
            StateId::Precharge,
            StateId::Normal,
            StateId::Charging,
            StateId::Full,
        ];

        let mut now = 0u64;
        for (adapter, sample, cc_mode, current) in inputs {
            now += 50;
            ctx.now_ms = now;
            ctx.adapter = adapter;
            ctx.volt_sample = sample;
            if let Some(mv) = sample {
                ctx.reported_mv = mv;
            }
            ctx.charger.cc_mode = cc_mode;
            ctx.charger.charge_current_ma = current;
            fsm.tick(&mut ctx);

            prop_assert!(valid.contains(&fsm.current_state()));
            if let Some(ma) = ctx.requests.start_charge.take() {
                prop_assert!(ma > 0);
            }
            ctx.requests.stop_charge = false;
            ctx.requests.declare_full = false;
            ctx.requests.volt_check_sec = None;
            ctx.requests.cv_offset = None;
            ctx.requests.events.clear();
        }
    }
}
