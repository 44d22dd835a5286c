//! Charge service — the hexagonal core.
//!
//! [`ChargeService`] owns the FSM, the voltage pipeline, the debouncers
//! and the fault tracker, and exposes a clean, hardware-agnostic API.
//! All I/O flows through port traits injected at call sites, making the
//! entire service testable with mock adapters.
//!
//! ```text
//!   AdcPort ───▶ ┌────────────────────────────┐ ──▶ EventSink
//!  TempSense ──▶ │       ChargeService        │
//! ChargerPort ◀──│  FSM · Faults · Sampler    │ ◀─▶ PersistPort
//!                └────────────────────────────┘
//! ```
//!
//! Call [`tick`](ChargeService::tick) every 50 ms.  Within a tick the
//! pipeline is: status snapshot → debounce → sample → finish any pending
//! measurement → fault evaluation → FSM → drain handler requests into
//! port calls.

use core::mem;

use log::{error, info, warn};

use crate::config::ChargeConfig;
use crate::control::current::snap_level;
use crate::control::debounce::Debouncer;
use crate::fsm::context::{ChargeContext, TICK_MS, TICKS_PER_SEC};
use crate::fsm::states::build_state_table;
use crate::fsm::{Fsm, StateId};
use crate::safety::FaultTracker;
use crate::sensors::current::CurrentMonitor;
use crate::sensors::voltage::{capacity_percent, raw_to_mv, VoltageReport, VoltageSampler};

use super::events::BatteryEvent;
use super::ports::{
    AdapterState, AdcPort, ChargerPort, Clock, EventSink, PersistPort, PersistedVoltage,
    TempBand, TempSensePort,
};

/// Adapter presence debounce capacity (ticks); config picks the depth.
const ADAPTER_DEBOUNCE_SLOTS: usize = 20;

/// Temperature band debounce capacity (1 s samples).
const BAND_DEBOUNCE_SLOTS: usize = 8;

/// An in-flight real-voltage measurement window.
struct VoltCheck {
    /// Ticks until the window closes.
    remaining: u32,
    /// Window length handed to the percentile filter (seconds).
    window_sec: u16,
}

// ───────────────────────────────────────────────────────────────
// ChargeService
// ───────────────────────────────────────────────────────────────

/// The charge controller core.  Owns all domain state; hardware access
/// happens only through the ports passed into each call.
pub struct ChargeService {
    fsm: Fsm,
    ctx: ChargeContext,

    // Voltage pipeline
    sampler: VoltageSampler,
    report: VoltageReport,
    current_mon: CurrentMonitor,

    // Input debouncers
    adapter_deb: Debouncer<AdapterState, ADAPTER_DEBOUNCE_SLOTS>,
    band_deb: Debouncer<TempBand, BAND_DEBOUNCE_SLOTS>,

    faults: FaultTracker,

    // Measurement and charger gating
    volt_check: Option<VoltCheck>,
    /// When the delayed post-plug enable fires, if scheduled.
    enable_due_ms: Option<u64>,
    /// The delayed enable has fired; starts may be applied.
    charger_armed: bool,
    /// Commanded CC level waiting for (or holding) the charge path.
    pending_start: Option<u16>,
    /// Charge path currently enabled.
    charger_on: bool,

    suspended: bool,
    tick_count: u64,

    // Reporting
    persist_seed: Option<PersistedVoltage>,
    report_dirty: bool,
    last_published_mv: u32,
    last_published_pct: u8,
    low_sent: bool,
    low_ex_sent: bool,
    too_low_sent: bool,
}

impl ChargeService {
    /// Construct the service from a validated configuration.
    ///
    /// Does **not** start the FSM — call [`start`](Self::start) next.
    pub fn new(config: ChargeConfig) -> crate::error::Result<Self> {
        config.validate()?;

        let adapter_depth = (u32::from(config.adapter_debounce_ms) / TICK_MS) as usize;
        let band_depth = (config.ntc.debounce_ms / 1000) as usize;

        let fsm = Fsm::new(build_state_table(), StateId::Init);
        let ctx = ChargeContext::new(config);

        // The band debouncer starts at Normal; its limit applies from the
        // first charge session, not only after a band change.
        let mut faults = FaultTracker::new();
        faults.set_band_limit(ctx.config.ntc.band(TempBand::Normal).limit_min);

        Ok(Self {
            fsm,
            ctx,
            sampler: VoltageSampler::new(),
            report: VoltageReport::new(),
            current_mon: CurrentMonitor::new(),
            adapter_deb: Debouncer::new(adapter_depth, AdapterState::Unknown),
            band_deb: Debouncer::new(band_depth, TempBand::Normal),
            faults,
            volt_check: None,
            enable_due_ms: None,
            charger_armed: false,
            pending_start: None,
            charger_on: false,
            suspended: false,
            tick_count: 0,
            persist_seed: None,
            report_dirty: false,
            last_published_mv: 0,
            last_published_pct: 0,
            low_sent: false,
            low_ex_sent: false,
            too_low_sent: false,
        })
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Load the persisted voltage seed and start the FSM in `Init`.
    /// The first measurement is scheduled immediately.
    pub fn start(&mut self, persist: &impl PersistPort) {
        if let Some(raw) = persist.load() {
            let seed = PersistedVoltage::from_raw(raw);
            info!(
                "boot seed: {} mv (fast_charge={})",
                seed.millivolts, seed.fast_charge
            );
            self.persist_seed = Some(seed);
        }
        self.fsm.start(&mut self.ctx);
        self.begin_volt_check(1);
    }

    /// Stop charging and freeze the controller (system suspend).
    pub fn suspend(&mut self, hw: &mut impl ChargerPort) {
        hw.disable();
        self.charger_on = false;
        self.charger_armed = false;
        self.pending_start = None;
        self.enable_due_ms = None;
        self.volt_check = None;
        self.ctx.session_active = false;
        self.faults.note_charge_end();
        self.suspended = true;
        info!("charge controller suspended");
    }

    /// Resume after suspend: every ring and debouncer is stale, so drop
    /// them all, fall back to `Init` and re-measure.
    pub fn resume(&mut self) {
        self.suspended = false;
        self.sampler.reset();
        self.current_mon.reset();
        self.adapter_deb.reset();
        self.band_deb.reset();
        self.ctx.volt_sample = None;
        // The adapter has been stable across the suspend; a still-present
        // one needs no fresh settle delay.
        self.charger_armed = self.adapter_deb.value() == AdapterState::Present;
        self.fsm.force_transition(StateId::Init, &mut self.ctx);
        self.begin_volt_check(1);
        info!("charge controller resumed");
    }

    // ── Per-tick orchestration ────────────────────────────────

    /// Run one full control cycle.
    ///
    /// The `hw` parameter satisfies all three hardware-facing ports —
    /// this avoids a double mutable borrow while keeping the port
    /// boundary explicit.
    pub fn tick(
        &mut self,
        hw: &mut (impl ChargerPort + AdcPort + TempSensePort),
        clock: &impl Clock,
        sink: &mut impl EventSink,
    ) {
        if self.suspended {
            return;
        }
        self.tick_count += 1;
        let now = clock.now_ms();
        let status = hw.status();

        // A completed measurement is visible to the FSM for one tick only.
        self.ctx.volt_sample = None;

        // 1. Adapter presence debounce (every tick).
        let raw_adapter = if status.vbus_present {
            AdapterState::Present
        } else {
            AdapterState::Absent
        };
        let prev_adapter = self.adapter_deb.value();
        if let Some(accepted) = self.adapter_deb.update(raw_adapter) {
            self.on_adapter_change(prev_adapter, accepted, now, hw, sink);
        }

        // 2. Temperature band debounce (1 s cadence).
        if self.tick_count % u64::from(TICKS_PER_SEC) == 0 {
            let raw_band = if self.ctx.config.ntc.enabled {
                hw.band()
            } else {
                TempBand::Normal
            };
            if let Some(band) = self.band_deb.update(raw_band) {
                info!("temperature band -> {:?}", band);
                let limit = self.ctx.config.ntc.band(band).limit_min;
                self.faults.on_band_change(limit, now);
            }
        }

        // 3. Battery ADC sample (every 2nd tick).
        if self.tick_count % 2 == 0 {
            match hw.read_battery_raw() {
                Ok(raw) => self.sampler.push(raw_to_mv(raw) as u16),
                Err(e) => warn!("battery ADC read failed: {e}"),
            }
        }

        // 4. Charge current sample (1 s cadence, only while flowing).
        if self.charger_on && self.tick_count % u64::from(TICKS_PER_SEC) == 0 {
            self.current_mon.push(status.charge_current_ma);
        }

        // 5. Refresh the context inputs.
        self.ctx.now_ms = now;
        self.ctx.charger = status;
        self.ctx.charger_enabled = self.charger_on;
        self.ctx.charge_current_ma = self.current_mon.average();
        self.ctx.adapter = self.adapter_deb.value();
        self.ctx.temp_band = self.band_deb.value();

        // 6. Close an in-flight measurement window.
        if let Some(check) = &mut self.volt_check {
            check.remaining -= 1;
            if check.remaining == 0 {
                let window_sec = check.window_sec;
                self.volt_check = None;
                self.finish_volt_check(window_sec, sink);
            }
        }

        // 7. Delayed charger enable after a debounced plug-in.
        if self.enable_due_ms.is_some_and(|due| now >= due) {
            self.enable_due_ms = None;
            self.charger_armed = true;
            self.try_apply_start(hw);
        }

        // 8. Fault latch release bookkeeping (set by the Init handler).
        if self.ctx.restart_from_err {
            self.ctx.restart_from_err = false;
            self.faults.clear();
            self.faults.reseed(now);
        }

        // 9. Fault evaluation.
        if !self.ctx.err_latched {
            let ovp_mv = self.ctx.config.ntc.band(self.ctx.temp_band).ovp_mv;
            let total_limit = self.ctx.config.charge_total_limit_min;
            if let Some(flags) =
                self.faults
                    .evaluate(now, &status, self.charger_on, ovp_mv, total_limit, hw)
            {
                error!("charge fault, stopping: flags=0b{:06b}", flags);
                self.stop_charger(hw, sink, true);
                self.charger_armed = false;
                self.ctx.err_latched = true;
                self.ctx.err_since_ms = now;
                self.ctx.adapter_edge_since_err = false;
                self.fsm.force_transition(StateId::Init, &mut self.ctx);
            }
        }

        // 10. FSM tick (pure state logic).
        self.fsm.tick(&mut self.ctx);

        // 11. Drain handler requests into port calls.
        self.apply_requests(hw, sink);

        // 12. Re-apply the commanded tier if a measurement window (or the
        // enable gate) had the path off and nothing blocks it now.
        if !self.charger_on {
            self.try_apply_start(hw);
        }
    }

    // ── Persistence ───────────────────────────────────────────

    /// Write the voltage record when the report changed since the last
    /// save.  Call at whatever cadence the platform finds cheap.  Returns
    /// `Ok(true)` when a write happened; on a storage error the record
    /// stays dirty and a later call retries.
    pub fn persist_if_needed(
        &mut self,
        persist: &mut impl PersistPort,
    ) -> crate::error::Result<bool> {
        if !self.report_dirty || self.last_published_mv == 0 {
            return Ok(false);
        }
        let rec = PersistedVoltage {
            millivolts: self.last_published_mv,
            fast_charge: self.ctx.fast_stage,
        };
        persist.save(rec.to_raw())?;
        self.report_dirty = false;
        Ok(true)
    }

    // ── Queries ───────────────────────────────────────────────

    /// Current FSM state.
    pub fn state(&self) -> StateId {
        self.fsm.current_state()
    }

    /// Active fault bitmask (0 = no faults).
    pub fn fault_flags(&self) -> u8 {
        self.faults.flags()
    }

    /// Last reported battery voltage, once a measurement has completed.
    pub fn last_voltage_mv(&self) -> Option<u32> {
        self.report.current()
    }

    /// Derived capacity of the last report (percent).
    pub fn capacity(&self) -> u8 {
        self.last_published_pct
    }

    /// The battery failed to respond to precharge (latched belief).
    pub fn battery_error(&self) -> bool {
        self.ctx.battery_error
    }

    /// Clone of the live configuration.
    pub fn config(&self) -> ChargeConfig {
        self.ctx.config.clone()
    }

    // ── Internal: input edges ─────────────────────────────────

    fn on_adapter_change(
        &mut self,
        previous: AdapterState,
        accepted: AdapterState,
        now: u64,
        hw: &mut impl ChargerPort,
        sink: &mut impl EventSink,
    ) {
        self.ctx.adapter_edge_since_err = true;
        match accepted {
            AdapterState::Present => {
                info!("adapter in");
                sink.emit(&BatteryEvent::AdapterIn);
                // A fresh plug cycle resets the discharge warnings.
                self.low_sent = false;
                self.low_ex_sent = false;
                self.too_low_sent = false;
                self.enable_due_ms = Some(now + u64::from(self.ctx.config.enable_delay_ms));
            }
            AdapterState::Absent | AdapterState::Unknown => {
                self.enable_due_ms = None;
                self.charger_armed = false;
                if self.charger_on {
                    hw.disable();
                    self.charger_on = false;
                }
                // Boot-time settle from Unknown is not an unplug.
                if previous == AdapterState::Present {
                    info!("adapter out");
                    sink.emit(&BatteryEvent::AdapterOut);
                }
            }
        }
    }

    // ── Internal: measurement ─────────────────────────────────

    /// Open a relaxed-pack measurement window: gate the charge path off
    /// and let the sampler fill with honest samples.
    fn begin_volt_check(&mut self, window_sec: u16) {
        self.volt_check = Some(VoltCheck {
            remaining: u32::from(window_sec) * TICKS_PER_SEC,
            window_sec,
        });
    }

    fn finish_volt_check(&mut self, window_sec: u16, sink: &mut impl EventSink) {
        let Some(measured) = self.sampler.windowed_percentile(window_sec) else {
            warn!("measurement window closed without enough samples");
            return;
        };
        // The boot seed competes with the very first real measurement.
        let candidate = match self.persist_seed.take() {
            Some(seed) => VoltageReport::reconcile_seed(seed.millivolts, measured),
            None => measured,
        };
        let accepted =
            self.report
                .accept(candidate, self.ctx.session_active, self.ctx.battery_present);
        self.publish_report(accepted, sink);
        self.ctx.volt_sample = Some(accepted);
        self.ctx.reported_mv = accepted;
    }

    fn publish_report(&mut self, mv: u32, sink: &mut impl EventSink) {
        if mv != self.last_published_mv {
            sink.emit(&BatteryEvent::VoltageChanged(mv));
            self.last_published_mv = mv;
            self.report_dirty = true;
        }

        // Hold 100 % back until the FSM agrees the pack is full.
        let mut pct = capacity_percent(mv, &self.ctx.config.level_table);
        if self.fsm.current_state() != StateId::Full {
            pct = pct.min(99);
        }
        if pct != self.last_published_pct {
            sink.emit(&BatteryEvent::CapacityChanged(pct));
            self.last_published_pct = pct;
        }

        // Discharge warnings, each latched once per plug cycle.
        if self.ctx.adapter != AdapterState::Present {
            let lv = &self.ctx.config.low_voltage;
            if mv <= u32::from(lv.too_low_mv) && !self.too_low_sent {
                self.too_low_sent = true;
                sink.emit(&BatteryEvent::BatteryTooLow);
            }
            if mv <= u32::from(lv.low_ex_mv) && !self.low_ex_sent {
                self.low_ex_sent = true;
                sink.emit(&BatteryEvent::BatteryLowEx);
            }
            if mv <= u32::from(lv.low_mv) && !self.low_sent {
                self.low_sent = true;
                sink.emit(&BatteryEvent::BatteryLow);
            }
        }
    }

    // ── Internal: request drain ───────────────────────────────

    fn apply_requests(&mut self, hw: &mut impl ChargerPort, sink: &mut impl EventSink) {
        let reqs = mem::take(&mut self.ctx.requests);

        for event in &reqs.events {
            sink.emit(event);
        }

        if let Some(sec) = reqs.volt_check_sec {
            // Relaxed measurement: silently gate the path off; the tier
            // is re-applied when the window closes.
            if self.charger_on {
                hw.disable();
                self.charger_on = false;
            }
            self.begin_volt_check(sec);
        }

        if reqs.stop_charge {
            self.stop_charger(hw, sink, true);
        }

        if reqs.declare_full {
            hw.disable();
            self.charger_on = false;
            self.pending_start = None;
            self.ctx.session_active = false;
            self.faults.note_charge_end();
            // The full-state record (with the fast flag) is worth keeping.
            self.report_dirty = true;
            if self.last_published_pct != 100 {
                self.last_published_pct = 100;
                sink.emit(&BatteryEvent::CapacityChanged(100));
            }
        }

        if let Some(ma) = reqs.start_charge {
            self.start_charge(ma, hw, sink);
        }

        if let Some(steps) = reqs.cv_offset {
            hw.set_cv_offset(steps);
        }
    }

    fn start_charge(&mut self, ma: u16, hw: &mut impl ChargerPort, sink: &mut impl EventSink) {
        let level = snap_level(ma);
        if !self.ctx.session_active {
            self.ctx.session_active = true;
            self.ctx.cv.reset();
            self.ctx.cv_search.reset();
            self.current_mon.reset();
            self.faults.note_charge_begin(self.ctx.now_ms);
            sink.emit(&BatteryEvent::ChargeStart);
        }
        self.pending_start = Some(level);
        self.try_apply_start(hw);
    }

    /// Apply the pending CC level if nothing gates the charge path.
    fn try_apply_start(&mut self, hw: &mut impl ChargerPort) {
        let Some(level) = self.pending_start else {
            return;
        };
        let gated = self.volt_check.is_some()
            || !self.charger_armed
            || self.ctx.adapter != AdapterState::Present
            || self.ctx.err_latched;
        if gated {
            return;
        }
        hw.set_charge_current(level);
        hw.enable();
        self.charger_on = true;
    }

    fn stop_charger(&mut self, hw: &mut impl ChargerPort, sink: &mut impl EventSink, emit: bool) {
        hw.disable();
        self.charger_on = false;
        self.pending_start = None;
        self.current_mon.reset();
        self.faults.note_charge_end();
        if self.ctx.session_active {
            self.ctx.session_active = false;
            if emit {
                sink.emit(&BatteryEvent::ChargeStop);
            }
        }
    }
}
