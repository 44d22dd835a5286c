//! Charge controller configuration.
//!
//! All tunable parameters for the charge pipeline.  The firmware ships a
//! binary blob (postcard) in its settings partition; [`ChargeConfig::from_postcard`]
//! decodes and validates it once at construction.  Anything that fails
//! validation rejects the whole blob rather than being silently clamped.

use serde::{Deserialize, Serialize};

use crate::app::ports::{ConfigError, TempBand};

/// Whether the product charges before first use (front) or is charged by
/// the end user after depletion (back).  Affects how a full battery is
/// classified at boot and what happens when the adapter is removed while
/// full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeMode {
    Back,
    Front,
}

/// How charge termination is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopMode {
    ByVoltage,
    ByCurrent,
    ByVoltageAndCurrent,
}

/// Taper-current threshold for current-based termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCurrent {
    /// Percent of the configured CC setpoint.
    PercentOfCc(u8),
    /// Absolute threshold in mA.
    MilliAmps(u16),
}

/// Precharge (trickle) stage parameters for deeply discharged packs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrechargeConfig {
    pub enabled: bool,
    /// Voltage at or below which the pack needs precharging (mv).
    pub stop_mv: u16,
    /// Precharge current (mA).
    pub current_ma: u16,
}

/// Optional high-current tier used while the pack is deeply discharged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastChargeConfig {
    pub enabled: bool,
    /// Fast-tier current (mA); only used when above the normal CC.
    pub current_ma: u16,
    /// Exit threshold code: threshold_mv = 3400 + 100 * code.
    pub threshold_code: u8,
}

impl FastChargeConfig {
    /// Voltage at which the fast tier demotes to the normal CC (mv).
    pub const fn threshold_mv(&self) -> u32 {
        3400 + 100 * self.threshold_code as u32
    }
}

/// Per temperature-band limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandLimits {
    /// OVP trip threshold for the independent raw ADC check (mv).
    pub ovp_mv: u16,
    /// Recharge hysteresis threshold while Full (mv).
    pub recharge_mv: u16,
    /// Maximum continuous time in this band while charging (minutes,
    /// 0 = unlimited).
    pub limit_min: u16,
}

/// NTC temperature sensing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NtcConfig {
    pub enabled: bool,
    /// Band change debounce window (ms, sampled at 1 s cadence).
    pub debounce_ms: u16,
    /// Indexed by [`TempBand::index`].
    pub bands: [BandLimits; TempBand::COUNT],
}

impl NtcConfig {
    pub fn band(&self, band: TempBand) -> &BandLimits {
        &self.bands[band.index()]
    }
}

/// Discharge warning thresholds, each latched once per discharge cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowVoltageConfig {
    pub low_mv: u16,
    pub low_ex_mv: u16,
    pub too_low_mv: u16,
}

/// Core charge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeConfig {
    // --- Charge ---
    pub mode: ChargeMode,
    /// CC setpoint (mA); snapped to the hardware current table.
    pub charge_current_ma: u16,
    /// Target / termination voltage (mv).
    pub charge_stop_mv: u16,
    pub stop_mode: StopMode,
    pub stop_current: StopCurrent,
    /// Continuation window after the first satisfied stop check (seconds,
    /// 0 = declare full immediately).
    pub full_continue_sec: u16,

    // --- Precharge ---
    pub precharge: PrechargeConfig,

    // --- Fast charge ---
    pub fast_charge: FastChargeConfig,

    // --- Adapter ---
    /// Presence debounce window (ms, sampled every tick).
    pub adapter_debounce_ms: u16,
    /// Delay between debounced plug-in and charger enable (ms).
    pub enable_delay_ms: u16,

    // --- Measurement periods ---
    /// Idle-state re-check period (seconds).
    pub battery_check_period_sec: u16,
    /// Charging-state stop-check period (seconds).
    pub charge_check_period_sec: u16,
    /// Precharge-state re-check period (seconds).
    pub precharge_check_period_sec: u16,
    /// Relaxation window before a real-voltage measurement (seconds).
    pub volt_check_sample_sec: u16,

    // --- Limits ---
    /// Total charge time limit (minutes, 0 = disabled).
    pub charge_total_limit_min: u16,
    /// Cooldown before retrying after a latched fault (minutes).
    pub err_retry_cooldown_min: u16,

    // --- NTC ---
    pub ntc: NtcConfig,

    // --- Low-voltage warnings ---
    pub low_voltage: LowVoltageConfig,

    // --- Capacity ---
    /// Voltage at 0, 10, .. 100 percent (mv, strictly increasing).
    pub level_table: [u16; 11],
}

impl Default for ChargeConfig {
    fn default() -> Self {
        Self {
            // Charge
            mode: ChargeMode::Back,
            charge_current_ma: 240,
            charge_stop_mv: 4200,
            stop_mode: StopMode::ByVoltage,
            stop_current: StopCurrent::PercentOfCc(20),
            full_continue_sec: 60,

            // Precharge
            precharge: PrechargeConfig {
                enabled: true,
                stop_mv: 3000,
                current_ma: 30,
            },

            // Fast charge (off by default; product-specific)
            fast_charge: FastChargeConfig {
                enabled: false,
                current_ma: 240,
                threshold_code: 2, // 3600 mv
            },

            // Adapter
            adapter_debounce_ms: 300,
            enable_delay_ms: 500,

            // Periods
            battery_check_period_sec: 300,
            charge_check_period_sec: 300,
            precharge_check_period_sec: 300,
            volt_check_sample_sec: 3,

            // Limits
            charge_total_limit_min: 0,
            err_retry_cooldown_min: 10,

            // NTC
            ntc: NtcConfig {
                enabled: false,
                debounce_ms: 5000,
                bands: [
                    // LowEx
                    BandLimits {
                        ovp_mv: 4250,
                        recharge_mv: 3900,
                        limit_min: 120,
                    },
                    // Low
                    BandLimits {
                        ovp_mv: 4300,
                        recharge_mv: 4000,
                        limit_min: 0,
                    },
                    // Normal
                    BandLimits {
                        ovp_mv: 4350,
                        recharge_mv: 4100,
                        limit_min: 0,
                    },
                    // High
                    BandLimits {
                        ovp_mv: 4300,
                        recharge_mv: 4000,
                        limit_min: 0,
                    },
                    // HighEx
                    BandLimits {
                        ovp_mv: 4250,
                        recharge_mv: 3900,
                        limit_min: 120,
                    },
                ],
            },

            // Low-voltage warnings
            low_voltage: LowVoltageConfig {
                low_mv: 3300,
                low_ex_mv: 3200,
                too_low_mv: 3000,
            },

            // Capacity: 0% .. 100% in 10% segments
            level_table: [
                3100, 3300, 3450, 3550, 3620, 3680, 3740, 3800, 3870, 3950, 4050,
            ],
        }
    }
}

impl ChargeConfig {
    /// Decode the binary settings blob and validate it.
    pub fn from_postcard(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = postcard::from_bytes(bytes).map_err(|_| ConfigError::Corrupted)?;
        config.validate()?;
        Ok(config)
    }

    /// Range and consistency checks, run once at construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.charge_current_ma == 0 {
            return Err(ConfigError::ValidationFailed("charge_current_ma is zero"));
        }
        if self.charge_stop_mv <= self.precharge.stop_mv {
            return Err(ConfigError::ValidationFailed(
                "charge_stop_mv must exceed precharge stop_mv",
            ));
        }
        if self.volt_check_sample_sec == 0 || self.volt_check_sample_sec > 3 {
            return Err(ConfigError::ValidationFailed(
                "volt_check_sample_sec outside 1..=3 (sample ring holds 3 s)",
            ));
        }
        if self.adapter_debounce_ms == 0 {
            return Err(ConfigError::ValidationFailed("adapter_debounce_ms is zero"));
        }
        if !self.level_table.is_sorted() || self.level_table.windows(2).any(|w| w[0] == w[1]) {
            return Err(ConfigError::ValidationFailed(
                "level_table must be strictly increasing",
            ));
        }
        let lv = &self.low_voltage;
        if !(lv.too_low_mv <= lv.low_ex_mv && lv.low_ex_mv <= lv.low_mv) {
            return Err(ConfigError::ValidationFailed(
                "low-voltage thresholds must satisfy too_low <= low_ex <= low",
            ));
        }
        if let StopCurrent::PercentOfCc(p) = self.stop_current {
            if p == 0 || p > 100 {
                return Err(ConfigError::ValidationFailed(
                    "stop_current percent outside 1..=100",
                ));
            }
        }
        for band in &self.ntc.bands {
            if band.ovp_mv <= self.charge_stop_mv {
                return Err(ConfigError::ValidationFailed(
                    "band OVP threshold must exceed charge_stop_mv",
                ));
            }
        }
        Ok(())
    }
}
