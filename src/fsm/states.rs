//! Concrete state handler functions and table builder.
//!
//! Each state is defined by three plain `fn` pointers — no closures, no
//! dynamic dispatch, no heap.  This is the classic embedded C FSM pattern
//! expressed in safe Rust.
//!
//! ```text
//!          ┌──────[measurement classifies]──────┐
//!          │                                     ▼
//!        INIT ──▶ LOW ──[adapter in]──▶ PRECHARGE ──[came up]──▶ NORMAL
//!          │       ▲                        │                      │
//!          │       └───[adapter out / bad]──┘        [adapter in]  │
//!          │                                                       ▼
//!          │                FULL ◀──[stop satisfied + window]── CHARGING
//!          │                  │                                    ▲
//!          │                  └──────[recharge hysteresis]─────────┘
//!          │
//!  Any fault ──▶ INIT (latched; retried after cooldown or adapter edge)
//! ```

use log::{info, warn};

use super::context::{ChargeContext, TICKS_PER_SEC};
use super::{StateDescriptor, StateId};
use crate::app::events::BatteryEvent;
use crate::app::ports::AdapterState;
use crate::config::{ChargeMode, StopCurrent, StopMode};

// ═══════════════════════════════════════════════════════════════════════════
//  Table builder
// ═══════════════════════════════════════════════════════════════════════════

/// Build the static state table.  Called once at startup.
pub fn build_state_table() -> [StateDescriptor; StateId::COUNT] {
    [
        // Index 0 — Init
        StateDescriptor {
            id: StateId::Init,
            name: "Init",
            on_enter: Some(init_enter),
            on_exit: None,
            on_update: init_update,
        },
        // Index 1 — Low
        StateDescriptor {
            id: StateId::Low,
            name: "Low",
            on_enter: Some(low_enter),
            on_exit: None,
            on_update: low_update,
        },
        // Index 2 — Precharge
        StateDescriptor {
            id: StateId::Precharge,
            name: "Precharge",
            on_enter: Some(precharge_enter),
            on_exit: None,
            on_update: precharge_update,
        },
        // Index 3 — Normal
        StateDescriptor {
            id: StateId::Normal,
            name: "Normal",
            on_enter: Some(normal_enter),
            on_exit: None,
            on_update: normal_update,
        },
        // Index 4 — Charging
        StateDescriptor {
            id: StateId::Charging,
            name: "Charging",
            on_enter: Some(charging_enter),
            on_exit: None,
            on_update: charging_update,
        },
        // Index 5 — Full
        StateDescriptor {
            id: StateId::Full,
            name: "Full",
            on_enter: Some(full_enter),
            on_exit: None,
            on_update: full_update,
        },
    ]
}

// ═══════════════════════════════════════════════════════════════════════════
//  Shared helpers
// ═══════════════════════════════════════════════════════════════════════════

/// Idle-state periodic re-check: count up and schedule a real-voltage
/// measurement when the period elapses.
fn periodic_check(ctx: &mut ChargeContext, period_sec: u16) {
    ctx.state_timer_ticks += 1;
    if ctx.state_timer_ticks >= ctx.period_ticks(period_sec) {
        ctx.state_timer_ticks = 0;
        ctx.request_volt_check(ctx.config.volt_check_sample_sec);
    }
}

/// Whether the averaged charge current has tapered to the stop threshold.
fn current_below_stop(ctx: &ChargeContext) -> bool {
    let avg = u32::from(ctx.charge_current_ma);
    if avg == 0 {
        return false;
    }
    let threshold = match ctx.config.stop_current {
        StopCurrent::PercentOfCc(p) => {
            u32::from(ctx.config.charge_current_ma) * u32::from(p) / 100
        }
        StopCurrent::MilliAmps(ma) => u32::from(ma),
    };
    avg <= threshold
}

/// Evaluate the configured stop mode against a completed measurement.
///
/// All modes are gated on CV stage 2 having begun and the offset search
/// having completed: terminating before the taper is real risks calling
/// a warm pack full.
fn stop_satisfied(ctx: &ChargeContext, mv: u32) -> bool {
    if !ctx.cv_search.completed() {
        return false;
    }
    if ctx.cv.stage2_since().is_none() {
        return false;
    }
    let volt_ok = mv >= u32::from(ctx.config.charge_stop_mv);
    match ctx.config.stop_mode {
        StopMode::ByVoltage => volt_ok,
        StopMode::ByCurrent => current_below_stop(ctx),
        StopMode::ByVoltageAndCurrent => volt_ok && current_below_stop(ctx),
    }
}

/// Re-command the prevailing charge tier after a measurement window.
fn resume_charge(ctx: &mut ChargeContext) {
    let level = if ctx.fast_stage {
        ctx.config.fast_charge.current_ma
    } else {
        ctx.ramp.level()
    };
    ctx.request_start(level);
}

/// Terminate the session as full.
fn finish_full(ctx: &mut ChargeContext) -> StateId {
    info!("CHARGING: battery full at {} mv", ctx.reported_mv);
    ctx.requests.declare_full = true;
    ctx.emit(BatteryEvent::ChargeFull);
    ctx.near_full = false;
    ctx.fast_stage = false;
    ctx.cv.reset();
    StateId::Full
}

// ═══════════════════════════════════════════════════════════════════════════
//  INIT state — classify the pack from a fresh measurement
// ═══════════════════════════════════════════════════════════════════════════

fn init_enter(ctx: &mut ChargeContext) {
    ctx.state_timer_ticks = 0;
    info!("INIT: waiting for a voltage measurement");
}

fn init_update(ctx: &mut ChargeContext) -> Option<StateId> {
    // A latched fault holds the machine here until the cooldown elapses
    // or a fresh adapter edge invites a retry.
    if ctx.err_latched {
        let cooldown_ms = u64::from(ctx.config.err_retry_cooldown_min) * 60_000;
        if ctx.adapter_edge_since_err
            || ctx.now_ms.saturating_sub(ctx.err_since_ms) >= cooldown_ms
        {
            info!("INIT: fault latch released, re-measuring");
            ctx.err_latched = false;
            ctx.restart_from_err = true;
            ctx.request_volt_check(1);
        }
        return None;
    }

    if let Some(mv) = ctx.volt_sample {
        ctx.state_timer_ticks = 0;
        if ctx.config.precharge.enabled && mv <= u32::from(ctx.config.precharge.stop_mv) {
            return Some(StateId::Low);
        }
        if mv >= u32::from(ctx.config.charge_stop_mv) && ctx.config.mode == ChargeMode::Front {
            return Some(StateId::Full);
        }
        return Some(StateId::Normal);
    }

    // Re-request if the measurement never lands (ADC trouble).
    ctx.state_timer_ticks += 1;
    if ctx.state_timer_ticks >= ctx.period_ticks(5) {
        ctx.state_timer_ticks = 0;
        ctx.request_volt_check(1);
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════
//  LOW state — pack below the precharge threshold
// ═══════════════════════════════════════════════════════════════════════════

fn low_enter(ctx: &mut ChargeContext) {
    ctx.state_timer_ticks = 0;
    warn!(
        "LOW: pack at/below precharge threshold ({} mv reported)",
        ctx.reported_mv
    );
}

fn low_update(ctx: &mut ChargeContext) -> Option<StateId> {
    if ctx.adapter == AdapterState::Present {
        if ctx.config.precharge.enabled {
            ctx.request_start(ctx.config.precharge.current_ma);
            return Some(StateId::Precharge);
        }
        return Some(StateId::Normal);
    }
    let period = ctx.config.battery_check_period_sec;
    periodic_check(ctx, period);
    None
}

// ═══════════════════════════════════════════════════════════════════════════
//  PRECHARGE state — trickle a deeply discharged pack
// ═══════════════════════════════════════════════════════════════════════════

/// Below-threshold time after which the battery is flagged as bad.
const PRECHARGE_ERROR_SEC: u32 = 1800;

fn precharge_enter(ctx: &mut ChargeContext) {
    ctx.state_timer_ticks = 0;
    info!(
        "PRECHARGE: trickle at {} mA",
        ctx.config.precharge.current_ma
    );
}

fn precharge_update(ctx: &mut ChargeContext) -> Option<StateId> {
    if ctx.adapter != AdapterState::Present {
        ctx.request_stop();
        ctx.battery_present = true;
        // The 30 min ceiling is per continuous attempt; a fresh plug
        // cycle gets a fresh allowance.
        ctx.precharge_time_sec = 0;
        ctx.request_volt_check(ctx.config.volt_check_sample_sec);
        return Some(StateId::Low);
    }

    ctx.state_timer_ticks += 1;
    if ctx.state_timer_ticks >= ctx.period_ticks(ctx.config.precharge_check_period_sec) {
        ctx.state_timer_ticks = 0;
        ctx.precharge_time_sec += u32::from(ctx.config.precharge_check_period_sec);
        ctx.request_volt_check(ctx.config.volt_check_sample_sec);
        return None;
    }

    if let Some(mv) = ctx.volt_sample {
        if mv > u32::from(ctx.config.precharge.stop_mv) {
            // Pack came up; hand over to the normal charge path.
            ctx.battery_present = true;
            ctx.precharge_time_sec = 0;
            return Some(StateId::Normal);
        }
        if ctx.precharge_time_sec >= PRECHARGE_ERROR_SEC {
            warn!("PRECHARGE: no response after {} s, battery may be absent or bad", ctx.precharge_time_sec);
            ctx.battery_error = true;
            ctx.precharge_time_sec = 0;
            ctx.request_stop();
            return Some(StateId::Low);
        }
        // Still below threshold: keep trickling.
        ctx.request_start(ctx.config.precharge.current_ma);
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════
//  NORMAL state — healthy pack, not charging
// ═══════════════════════════════════════════════════════════════════════════

fn normal_enter(ctx: &mut ChargeContext) {
    ctx.state_timer_ticks = 0;
    info!("NORMAL: monitoring ({} mv reported)", ctx.reported_mv);
}

fn normal_update(ctx: &mut ChargeContext) -> Option<StateId> {
    if ctx.adapter == AdapterState::Present {
        let cc = ctx.config.charge_current_ma;
        let fast = ctx.config.fast_charge;
        if fast.enabled && fast.current_ma > cc && ctx.reported_mv < fast.threshold_mv() {
            ctx.fast_stage = true;
            ctx.request_start(fast.current_ma);
        } else {
            ctx.fast_stage = false;
            ctx.ramp.plan(cc, false);
            ctx.request_start(ctx.ramp.level());
        }
        ctx.near_full = false;
        return Some(StateId::Charging);
    }
    let period = ctx.config.battery_check_period_sec;
    periodic_check(ctx, period);
    None
}

// ═══════════════════════════════════════════════════════════════════════════
//  CHARGING state — the main charge loop
// ═══════════════════════════════════════════════════════════════════════════

fn charging_enter(ctx: &mut ChargeContext) {
    ctx.state_timer_ticks = 0;
    info!(
        "CHARGING: session begins ({} tier)",
        if ctx.fast_stage { "fast" } else { "normal" }
    );
}

fn charging_update(ctx: &mut ChargeContext) -> Option<StateId> {
    if ctx.adapter != AdapterState::Present {
        ctx.request_stop();
        ctx.cv.reset();
        ctx.cv_search.reset();
        ctx.fast_stage = false;
        ctx.near_full = false;
        ctx.request_volt_check(ctx.config.volt_check_sample_sec);
        return Some(StateId::Normal);
    }

    // Demote from the fast tier once the pack has come up.
    if ctx.fast_stage && ctx.reported_mv >= ctx.config.fast_charge.threshold_mv() {
        info!("CHARGING: fast tier exit at {} mv", ctx.reported_mv);
        ctx.fast_stage = false;
        ctx.ramp.plan(ctx.config.charge_current_ma, ctx.cv.stage() >= 1);
        ctx.request_start(ctx.ramp.level());
    }

    ctx.state_timer_ticks += 1;

    // CV machinery on the 1 s cadence, only while current actually flows.
    if ctx.charger_enabled && ctx.state_timer_ticks % TICKS_PER_SEC == 0 {
        let stage = ctx.cv.update(
            ctx.now_ms,
            ctx.charger.cc_mode,
            ctx.charger.charge_current_ma,
            ctx.config.charge_current_ma,
        );
        if stage >= 1 && !ctx.cv_search.completed() {
            let offset = ctx
                .cv_search
                .step(u32::from(ctx.config.charge_stop_mv), ctx.reported_mv);
            ctx.requests.cv_offset = Some(offset);
        }
    }

    // Periodic stop-check measurement.  Near full, the shorter
    // continuation window drives the cadence.
    let period_sec = if ctx.near_full {
        ctx.config.full_continue_sec
    } else {
        ctx.config.charge_check_period_sec
    };
    if ctx.state_timer_ticks >= ctx.period_ticks(period_sec) {
        ctx.state_timer_ticks = 0;
        ctx.request_volt_check(ctx.config.volt_check_sample_sec);
        return None;
    }

    if let Some(mv) = ctx.volt_sample {
        if ctx.near_full {
            // The continuation window has run its course.
            return Some(finish_full(ctx));
        }
        if ctx.cv.stage2_over_limit(ctx.now_ms) {
            info!("CHARGING: stage 2 time cap reached, terminating");
            return Some(finish_full(ctx));
        }
        if stop_satisfied(ctx, mv) {
            if ctx.config.full_continue_sec == 0 {
                return Some(finish_full(ctx));
            }
            info!(
                "CHARGING: stop condition met, continuing {} s near full",
                ctx.config.full_continue_sec
            );
            ctx.near_full = true;
            ctx.state_timer_ticks = 0;
            resume_charge(ctx);
        } else if let Some(next) = ctx.ramp.advance() {
            // Pack absorbed the re-check fine: take the next ramp step.
            ctx.request_start(next);
        } else {
            resume_charge(ctx);
        }
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════
//  FULL state — charge terminated; watch for unplug, re-plug, recharge
// ═══════════════════════════════════════════════════════════════════════════

fn full_enter(ctx: &mut ChargeContext) {
    ctx.state_timer_ticks = 0;
    ctx.full_adapter = ctx.adapter;
    ctx.battery_full_sent = false;
    info!("FULL: terminated at {} mv", ctx.reported_mv);
}

fn full_update(ctx: &mut ChargeContext) -> Option<StateId> {
    if ctx.adapter != ctx.full_adapter {
        let previous = ctx.full_adapter;
        ctx.full_adapter = ctx.adapter;
        ctx.state_timer_ticks = 0;
        match ctx.adapter {
            AdapterState::Present => {
                if !ctx.battery_full_sent {
                    ctx.emit(BatteryEvent::BatteryFull);
                    ctx.battery_full_sent = true;
                }
            }
            AdapterState::Absent | AdapterState::Unknown => {
                ctx.battery_full_sent = false;
                if previous == AdapterState::Present {
                    ctx.emit(BatteryEvent::ChargeStop);
                }
                if ctx.config.mode == ChargeMode::Back {
                    return Some(StateId::Normal);
                }
            }
        }
        return None;
    }

    // Full keeps re-checking even with the adapter attached: it is the
    // one state where recharge hysteresis must be observed.
    let period = ctx.config.battery_check_period_sec;
    periodic_check(ctx, period);

    if let Some(mv) = ctx.volt_sample {
        if mv <= u32::from(ctx.config.precharge.stop_mv) {
            warn!("FULL: pack collapsed to {} mv, flagging battery error", mv);
            ctx.battery_error = true;
            return Some(StateId::Low);
        }
        let recharge_mv = u32::from(ctx.config.ntc.band(ctx.temp_band).recharge_mv);
        if mv < recharge_mv {
            info!("FULL: {} mv below recharge threshold {} mv", mv, recharge_mv);
            return Some(StateId::Normal);
        }
    }
    None
}
