//! Port traits — the hexagonal boundary between domain logic and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ ChargeService (domain)
//! ```
//!
//! Driven adapters (charger IC driver, battery ADC, NTC lookup, NVS)
//! implement these traits.  The [`ChargeService`](super::service::ChargeService)
//! consumes them via generics, so the domain core never touches hardware
//! directly.

use crate::error::SensorError;

// ───────────────────────────────────────────────────────────────
// Shared port data types
// ───────────────────────────────────────────────────────────────

/// Debounced adapter (DC-in) presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterState {
    /// Not yet debounced to a stable value (boot, post-resume).
    #[default]
    Unknown,
    Absent,
    Present,
}

/// Temperature band reported by the NTC lookup.
///
/// When the NTC is disabled in config the controller treats the band as
/// [`Normal`](TempBand::Normal) everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TempBand {
    LowEx = 0,
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    HighEx = 4,
}

impl TempBand {
    pub const COUNT: usize = 5;

    /// Index into per-band config tables.
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Atomic snapshot of the charger chip's status registers.
///
/// The adapter is responsible for reading the registers coherently (or
/// applying interrupt-driven updates atomically); the service reads one
/// snapshot at the top of each tick and never re-reads mid-tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChargerStatus {
    /// VBUS (adapter) rail present, raw and undebounced.
    pub vbus_present: bool,
    /// Chip is in constant-current regulation (false = constant-voltage).
    pub cc_mode: bool,
    /// Instantaneous charge current into the battery (mA).
    pub charge_current_ma: u16,
    /// Chip-reported battery overvoltage.
    pub overvoltage: bool,
    /// Chip die over-temperature.
    pub overtemp: bool,
    /// Chip die under-temperature.
    pub undertemp: bool,
    /// Chip internal safety timer expired.
    pub safety_timer_expired: bool,
}

// ───────────────────────────────────────────────────────────────
// Charger port (driven adapter: domain → charger IC)
// ───────────────────────────────────────────────────────────────

/// Write-side port: the domain calls this to command the charger chip.
///
/// Register-level access lives entirely in the adapter; the domain only
/// speaks in millivolts, milliamps and offset steps.
pub trait ChargerPort {
    /// Read the current status snapshot.
    fn status(&mut self) -> ChargerStatus;

    /// Enable the charge path at the last programmed current.
    fn enable(&mut self);

    /// Disable the charge path immediately.
    fn disable(&mut self);

    /// Program the constant-current setpoint (mA, snapped by the caller
    /// to a level the hardware supports).
    fn set_charge_current(&mut self, ma: u16);

    /// Apply a signed correction to the CV setpoint, in hardware steps.
    fn set_cv_offset(&mut self, steps: i8);
}

// ───────────────────────────────────────────────────────────────
// Battery ADC port (driven adapter: hardware → domain)
// ───────────────────────────────────────────────────────────────

/// Read-side port for the battery voltage ADC channel.
pub trait AdcPort {
    /// One raw conversion of the battery channel (ADC counts).
    fn read_battery_raw(&mut self) -> Result<u16, SensorError>;
}

// ───────────────────────────────────────────────────────────────
// NTC port (driven adapter: thermistor lookup → domain)
// ───────────────────────────────────────────────────────────────

/// Temperature band lookup.  Adapters map the thermistor reading to a
/// band; boards without an NTC simply never get asked (config gate).
pub trait TempSensePort {
    fn band(&mut self) -> TempBand;
}

// ───────────────────────────────────────────────────────────────
// Clock port
// ───────────────────────────────────────────────────────────────

/// Monotonic millisecond clock.  Never goes backwards; wrap is not a
/// practical concern at u64 width.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

// ───────────────────────────────────────────────────────────────
// Persistence port (driven adapter: domain ↔ NVS)
// ───────────────────────────────────────────────────────────────

/// Persists the single [`PersistedVoltage`] record across reboots.
pub trait PersistPort {
    /// Load the stored record, if any.
    fn load(&self) -> Option<u32>;

    /// Store the record.  Implementations must write atomically.
    fn save(&mut self, raw: u32) -> Result<(), StorageError>;
}

/// The persisted record: last reported voltage plus a flag noting that
/// the session used the fast-charge tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedVoltage {
    /// Last reported battery voltage (mv), 31 bits.
    pub millivolts: u32,
    /// Bit 31: the charge session ran on the fast-charge tier.
    pub fast_charge: bool,
}

impl PersistedVoltage {
    const FAST_CHARGE_BIT: u32 = 1 << 31;

    pub const fn to_raw(self) -> u32 {
        let mut raw = self.millivolts & !Self::FAST_CHARGE_BIT;
        if self.fast_charge {
            raw |= Self::FAST_CHARGE_BIT;
        }
        raw
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self {
            millivolts: raw & !Self::FAST_CHARGE_BIT,
            fast_charge: raw & Self::FAST_CHARGE_BIT != 0,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Event sink port (driven adapter: domain → message bus)
// ───────────────────────────────────────────────────────────────

/// The domain emits structured [`BatteryEvent`](super::events::BatteryEvent)s
/// through this port.  Adapters decide where they go (system bus, charge
/// LED driver, serial log).
pub trait EventSink {
    fn emit(&mut self, event: &super::events::BatteryEvent);
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from configuration loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Stored config blob failed deserialization.
    Corrupted,
    /// A config field failed range validation.
    /// The `&'static str` describes which field and why.
    ValidationFailed(&'static str),
}

/// Errors from [`PersistPort`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Requested key does not exist.
    NotFound,
    /// Storage partition is full.
    Full,
    /// Generic I/O error.
    IoError,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
        }
    }
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Full => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}
