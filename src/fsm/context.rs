//! Shared mutable context threaded through every FSM handler.
//!
//! `ChargeContext` is the single struct that state handlers read from
//! and write to: the latest debounced inputs, charge-session flags, the
//! control blocks (CV tracker, ramp, offset search), and the request
//! block the service drains after each FSM tick.  Think of it as the
//! "blackboard" in a blackboard architecture.

use heapless::Vec;

use crate::app::events::BatteryEvent;
use crate::app::ports::{AdapterState, ChargerStatus, TempBand};
use crate::config::ChargeConfig;
use crate::control::current::{CurrentRamp, CvOffsetSearch};
use crate::control::cv_stage::CvTracker;

/// One control tick.
pub const TICK_MS: u32 = 50;
/// Ticks per second at the control cadence.
pub const TICKS_PER_SEC: u32 = 1000 / TICK_MS;

// ---------------------------------------------------------------------------
// Requests (written by state handlers; drained by the service)
// ---------------------------------------------------------------------------

/// Actions a state handler asks the service to perform after the tick.
///
/// Handlers never touch ports; they record intent here and the service
/// translates it into port calls (respecting the delayed-enable arm and
/// any in-flight measurement).
#[derive(Debug, Default)]
pub struct TickRequests {
    /// Start (or retune) charging at this CC level (mA).
    pub start_charge: Option<u16>,
    /// End the session without reaching full.
    pub stop_charge: bool,
    /// End the session as full (no ChargeStop; handler queues ChargeFull).
    pub declare_full: bool,
    /// Begin a real-voltage measurement over this many relaxed seconds.
    pub volt_check_sec: Option<u16>,
    /// Program a CV setpoint correction (hardware steps).
    pub cv_offset: Option<i8>,
    /// Events to emit this tick.
    pub events: Vec<BatteryEvent, 4>,
}

// ---------------------------------------------------------------------------
// ChargeContext
// ---------------------------------------------------------------------------

/// The shared context passed to every state handler function.
pub struct ChargeContext {
    // -- Configuration --
    pub config: ChargeConfig,

    // -- Timing --
    /// Monotonic time at the top of this tick (ms).
    pub now_ms: u64,
    /// Ticks elapsed since the current state was entered.
    pub ticks_in_state: u64,
    /// Monotonic total tick count.
    pub total_ticks: u64,
    /// Intra-state period counter; handlers reset it when a period fires.
    pub state_timer_ticks: u32,

    // -- Inputs (refreshed by the service before each FSM tick) --
    /// Debounced adapter presence.
    pub adapter: AdapterState,
    /// Debounced temperature band (Normal when the NTC is disabled).
    pub temp_band: TempBand,
    /// Status snapshot read at the top of the tick.
    pub charger: ChargerStatus,
    /// True while the service has the charge path enabled.
    pub charger_enabled: bool,
    /// Averaged charge current (mA).
    pub charge_current_ma: u16,
    /// Completed real-voltage measurement, present for exactly one tick.
    pub volt_sample: Option<u32>,
    /// Last accepted voltage report (0 until the first measurement).
    pub reported_mv: u32,

    // -- Battery beliefs --
    pub battery_present: bool,
    /// Battery may be absent or bad (precharge never came up).  Latched;
    /// detection keeps running.
    pub battery_error: bool,

    // -- Charge session bookkeeping --
    /// A session is running (ChargeStart emitted, no stop/full yet).
    pub session_active: bool,
    /// First stop check satisfied; riding the continuation window.
    pub near_full: bool,
    /// Currently on the fast-charge tier.
    pub fast_stage: bool,

    // -- Fault latch --
    pub err_latched: bool,
    pub err_since_ms: u64,
    /// A debounced adapter edge arrived after the latch was set.
    pub adapter_edge_since_err: bool,
    /// Set on latch release so the service reseeds the fault clocks.
    pub restart_from_err: bool,

    // -- Precharge --
    /// Accumulated time spent precharging below the threshold (seconds).
    pub precharge_time_sec: u32,

    // -- Full-state bookkeeping --
    /// Adapter state recorded when Full was entered / last edge handled.
    pub full_adapter: AdapterState,
    /// BatteryFull already emitted for the current plug cycle.
    pub battery_full_sent: bool,

    // -- Control blocks --
    pub cv: CvTracker,
    pub ramp: CurrentRamp,
    pub cv_search: CvOffsetSearch,

    // -- Outgoing --
    pub requests: TickRequests,
}

impl ChargeContext {
    /// Create a new context with the given configuration.
    pub fn new(config: ChargeConfig) -> Self {
        Self {
            config,
            now_ms: 0,
            ticks_in_state: 0,
            total_ticks: 0,
            state_timer_ticks: 0,
            adapter: AdapterState::Unknown,
            temp_band: TempBand::Normal,
            charger: ChargerStatus::default(),
            charger_enabled: false,
            charge_current_ma: 0,
            volt_sample: None,
            reported_mv: 0,
            battery_present: true,
            battery_error: false,
            session_active: false,
            near_full: false,
            fast_stage: false,
            err_latched: false,
            err_since_ms: 0,
            adapter_edge_since_err: false,
            restart_from_err: false,
            precharge_time_sec: 0,
            full_adapter: AdapterState::Unknown,
            battery_full_sent: false,
            cv: CvTracker::new(),
            ramp: CurrentRamp::new(),
            cv_search: CvOffsetSearch::new(),
            requests: TickRequests::default(),
        }
    }

    /// Ticks in a config period expressed in seconds.
    pub fn period_ticks(&self, seconds: u16) -> u32 {
        u32::from(seconds) * TICKS_PER_SEC
    }

    // ── Request helpers (handlers only) ───────────────────────────

    pub fn request_start(&mut self, ma: u16) {
        self.requests.start_charge = Some(ma);
    }

    pub fn request_stop(&mut self) {
        self.requests.stop_charge = true;
    }

    pub fn request_volt_check(&mut self, seconds: u16) {
        self.requests.volt_check_sec = Some(seconds);
    }

    pub fn emit(&mut self, event: BatteryEvent) {
        let _ = self.requests.events.push(event);
    }
}
