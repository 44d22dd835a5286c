//! Charge fault tracker.
//!
//! Runs **every tick before the FSM** and accumulates a fault bitmask.
//! Any trip makes the service disable the charger, latch an error-stop
//! and force the FSM back to `Init`; recovery is time- or adapter-edge
//! driven (see the `Init` handler).
//!
//! Watched conditions:
//!
//! 1. Chip-reported flags (overvoltage, die temperature, safety timer).
//! 2. An independent raw ADC overvoltage check every 10 s, compared
//!    against the OVP threshold of the current temperature band.  This
//!    deliberately bypasses the percentile filter: a real overvoltage
//!    must not be averaged away.
//! 3. Total charge time limit (config, 0 = disabled).
//! 4. Continuous time within the current temperature band.

use log::{error, warn};

use crate::app::ports::{AdcPort, ChargerStatus};
use crate::error::ChargeFault;
use crate::sensors::voltage::raw_to_mv;

/// Raw OVP check cadence.
const OVP_CHECK_PERIOD_MS: u64 = 10_000;

pub struct FaultTracker {
    /// Accumulated fault bitmask (see `ChargeFault::mask()`).
    flags: u8,
    /// When the current charge session began, if one is running.
    charge_begin_ms: Option<u64>,
    /// When the pack entered the current temperature band.
    band_begin_ms: Option<u64>,
    /// Time limit for the current band (minutes, 0 = unlimited).
    band_limit_min: u16,
    last_ovp_check_ms: u64,
}

impl Default for FaultTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultTracker {
    pub fn new() -> Self {
        Self {
            flags: 0,
            charge_begin_ms: None,
            band_begin_ms: None,
            band_limit_min: 0,
            last_ovp_check_ms: 0,
        }
    }

    /// A charge session is starting: seed the total-time clock (and the
    /// band clock if this is the first band observation).
    pub fn note_charge_begin(&mut self, now_ms: u64) {
        self.charge_begin_ms = Some(now_ms);
        self.band_begin_ms.get_or_insert(now_ms);
    }

    pub fn note_charge_end(&mut self) {
        self.charge_begin_ms = None;
    }

    /// Recovery from a latched fault: restart both clocks so the retry
    /// gets a full allowance.
    pub fn reseed(&mut self, now_ms: u64) {
        if self.charge_begin_ms.is_some() {
            self.charge_begin_ms = Some(now_ms);
        }
        self.band_begin_ms = Some(now_ms);
    }

    /// Apply the limit of the band the controller booted into.  The band
    /// clock stays untouched; it starts with the charge session.
    pub fn set_band_limit(&mut self, limit_min: u16) {
        self.band_limit_min = limit_min;
    }

    /// An accepted temperature band change restarts the band clock.
    pub fn on_band_change(&mut self, limit_min: u16, now_ms: u64) {
        self.band_limit_min = limit_min;
        self.band_begin_ms = Some(now_ms);
    }

    /// Evaluate all fault conditions.  Returns the bitmask when anything
    /// is tripped; the caller latches and handles the transition.
    pub fn evaluate(
        &mut self,
        now_ms: u64,
        status: &ChargerStatus,
        charging: bool,
        ovp_mv: u16,
        total_limit_min: u16,
        adc: &mut impl AdcPort,
    ) -> Option<u8> {
        if !charging {
            return None;
        }

        self.eval_fault(ChargeFault::ChipOvervoltage, status.overvoltage);
        self.eval_fault(
            ChargeFault::ChipTemperature,
            status.overtemp || status.undertemp,
        );
        self.eval_fault(ChargeFault::SafetyTimer, status.safety_timer_expired);

        // ── Independent raw OVP check ─────────────────────────────
        if now_ms.saturating_sub(self.last_ovp_check_ms) >= OVP_CHECK_PERIOD_MS {
            self.last_ovp_check_ms = now_ms;
            match adc.read_battery_raw() {
                Ok(raw) => {
                    self.eval_fault(ChargeFault::AdcOvervoltage, raw_to_mv(raw) > u32::from(ovp_mv));
                }
                Err(e) => warn!("OVP check skipped: {e}"),
            }
        }

        // ── Time limits ───────────────────────────────────────────
        let total_expired = total_limit_min > 0
            && self
                .charge_begin_ms
                .is_some_and(|t| now_ms.saturating_sub(t) >= u64::from(total_limit_min) * 60_000);
        self.eval_fault(ChargeFault::TotalTimeout, total_expired);

        let band_expired = self.band_limit_min > 0
            && self
                .band_begin_ms
                .is_some_and(|t| now_ms.saturating_sub(t) >= u64::from(self.band_limit_min) * 60_000);
        self.eval_fault(ChargeFault::BandTimeout, band_expired);

        if self.flags != 0 { Some(self.flags) } else { None }
    }

    /// Current fault bitmask.
    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn has_faults(&self) -> bool {
        self.flags != 0
    }

    /// Drop all accumulated faults (latch released).
    pub fn clear(&mut self) {
        self.flags = 0;
    }

    // ── Internal ──────────────────────────────────────────────────

    /// Set or clear a fault bit based on a boolean condition.
    fn eval_fault(&mut self, fault: ChargeFault, condition: bool) {
        if condition {
            if self.flags & fault.mask() == 0 {
                error!("CHARGE FAULT SET: {fault}");
            }
            self.flags |= fault.mask();
        } else {
            self.flags &= !fault.mask();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SensorError;
    use crate::sensors::voltage::mv_to_raw;

    struct FakeAdc {
        mv: u32,
        fail: bool,
        reads: usize,
    }

    impl AdcPort for FakeAdc {
        fn read_battery_raw(&mut self) -> Result<u16, SensorError> {
            self.reads += 1;
            if self.fail {
                Err(SensorError::AdcReadFailed)
            } else {
                Ok(mv_to_raw(self.mv))
            }
        }
    }

    fn quiet_status() -> ChargerStatus {
        ChargerStatus {
            vbus_present: true,
            cc_mode: true,
            charge_current_ma: 200,
            ..Default::default()
        }
    }

    #[test]
    fn nothing_trips_while_not_charging() {
        let mut t = FaultTracker::new();
        let mut adc = FakeAdc {
            mv: 5000,
            fail: false,
            reads: 0,
        };
        let status = ChargerStatus {
            overvoltage: true,
            ..quiet_status()
        };
        assert_eq!(t.evaluate(0, &status, false, 4350, 0, &mut adc), None);
        assert_eq!(adc.reads, 0);
    }

    #[test]
    fn chip_overvoltage_trips_immediately() {
        let mut t = FaultTracker::new();
        let mut adc = FakeAdc {
            mv: 3800,
            fail: false,
            reads: 0,
        };
        let status = ChargerStatus {
            overvoltage: true,
            ..quiet_status()
        };
        let flags = t.evaluate(0, &status, true, 4350, 0, &mut adc).unwrap();
        assert_ne!(flags & ChargeFault::ChipOvervoltage.mask(), 0);
    }

    #[test]
    fn adc_ovp_checks_on_its_own_cadence() {
        let mut t = FaultTracker::new();
        let mut adc = FakeAdc {
            mv: 4400,
            fail: false,
            reads: 0,
        };
        let status = quiet_status();
        // First evaluation runs a check (cadence timer starts at 0).
        assert!(t.evaluate(OVP_CHECK_PERIOD_MS, &status, true, 4350, 0, &mut adc).is_some());
        assert_eq!(adc.reads, 1);
        // Within the cadence window no further raw reads happen.
        let _ = t.evaluate(OVP_CHECK_PERIOD_MS + 1000, &status, true, 4350, 0, &mut adc);
        assert_eq!(adc.reads, 1);
    }

    #[test]
    fn adc_read_failure_skips_the_check() {
        let mut t = FaultTracker::new();
        let mut adc = FakeAdc {
            mv: 4400,
            fail: true,
            reads: 0,
        };
        assert_eq!(
            t.evaluate(OVP_CHECK_PERIOD_MS, &quiet_status(), true, 4350, 0, &mut adc),
            None
        );
    }

    #[test]
    fn total_time_limit_trips_and_zero_disables() {
        let mut t = FaultTracker::new();
        let mut adc = FakeAdc {
            mv: 3800,
            fail: false,
            reads: 0,
        };
        t.note_charge_begin(0);
        let status = quiet_status();
        // Disabled limit never trips.
        assert_eq!(t.evaluate(100 * 60_000, &status, true, 4350, 0, &mut adc), None);
        // 90 minute limit, 90 minutes elapsed.
        let flags = t.evaluate(90 * 60_000, &status, true, 4350, 90, &mut adc).unwrap();
        assert_ne!(flags & ChargeFault::TotalTimeout.mask(), 0);
    }

    #[test]
    fn boot_band_limit_trips_without_a_band_change() {
        let mut t = FaultTracker::new();
        let mut adc = FakeAdc {
            mv: 3800,
            fail: false,
            reads: 0,
        };
        // Limit applied at construction time; the band never changes.
        t.set_band_limit(60);
        t.note_charge_begin(0);
        let status = quiet_status();
        assert_eq!(t.evaluate(30 * 60_000, &status, true, 4350, 0, &mut adc), None);
        let flags = t.evaluate(60 * 60_000, &status, true, 4350, 0, &mut adc).unwrap();
        assert_ne!(flags & ChargeFault::BandTimeout.mask(), 0);
    }

    #[test]
    fn band_change_restarts_the_band_clock() {
        let mut t = FaultTracker::new();
        let mut adc = FakeAdc {
            mv: 3800,
            fail: false,
            reads: 0,
        };
        t.note_charge_begin(0);
        t.on_band_change(60, 0);
        let status = quiet_status();
        // Band clock restarted at 30 min: no trip at 60 min.
        t.on_band_change(60, 30 * 60_000);
        assert_eq!(t.evaluate(60 * 60_000, &status, true, 4350, 0, &mut adc), None);
        let flags = t.evaluate(90 * 60_000, &status, true, 4350, 0, &mut adc).unwrap();
        assert_ne!(flags & ChargeFault::BandTimeout.mask(), 0);
    }

    #[test]
    fn clear_releases_all_flags() {
        let mut t = FaultTracker::new();
        let mut adc = FakeAdc {
            mv: 3800,
            fail: false,
            reads: 0,
        };
        let status = ChargerStatus {
            safety_timer_expired: true,
            ..quiet_status()
        };
        assert!(t.evaluate(0, &status, true, 4350, 0, &mut adc).is_some());
        t.clear();
        assert!(!t.has_faults());
    }
}
