//! Error types for the charge controller.
//!
//! Transient port errors (a failed ADC conversion) are handled where they
//! occur: the tick logs and carries the previous value forward.  Charge
//! faults are accumulated as a [`ChargeFault`] bitmask by the fault
//! tracker rather than propagated.  What remains fallible at the crate
//! surface is construction (config validation) and persistence, and both
//! funnel into [`Error`].  All variants are `Copy`.

use core::fmt;

use crate::app::ports::{ConfigError, StorageError};

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// The error returned by the crate's fallible entry points
/// ([`ChargeService::new`](crate::app::service::ChargeService::new) and
/// [`persist_if_needed`](crate::app::service::ChargeService::persist_if_needed)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Configuration is invalid or could not be loaded.
    Config(ConfigError),
    /// Persistent storage failed.
    Storage(StorageError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

// ---------------------------------------------------------------------------
// Sensor errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    /// ADC read returned an error or timed out.
    AdcReadFailed,
    /// Reading is outside the physically plausible range.
    OutOfRange,
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdcReadFailed => write!(f, "ADC read failed"),
            Self::OutOfRange => write!(f, "reading out of range"),
        }
    }
}

// ---------------------------------------------------------------------------
// Charge faults
// ---------------------------------------------------------------------------

/// Charge faults are a special category: any trip disables the charger,
/// latches an error-stop, and forces the FSM back to `Init`.  They are
/// accumulated in a bitfield by the fault tracker so that multiple
/// simultaneous faults can be tracked and reported together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChargeFault {
    /// Independent raw ADC reading exceeded the OVP threshold of the
    /// current temperature band.
    AdcOvervoltage = 0b0000_0001,
    /// Charger chip reports battery overvoltage.
    ChipOvervoltage = 0b0000_0010,
    /// Charger chip reports die over/under temperature.
    ChipTemperature = 0b0000_0100,
    /// Charger chip's internal safety timer expired.
    SafetyTimer = 0b0000_1000,
    /// Total charge time exceeded the configured limit.
    TotalTimeout = 0b0001_0000,
    /// Time within the current temperature band exceeded its limit.
    BandTimeout = 0b0010_0000,
}

impl ChargeFault {
    /// Return the bitmask for this fault.
    pub const fn mask(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ChargeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdcOvervoltage => write!(f, "battery overvoltage (ADC)"),
            Self::ChipOvervoltage => write!(f, "battery overvoltage (chip)"),
            Self::ChipTemperature => write!(f, "charger chip temperature"),
            Self::SafetyTimer => write!(f, "charger safety timer expired"),
            Self::TotalTimeout => write!(f, "total charge time limit"),
            Self::BandTimeout => write!(f, "temperature band time limit"),
        }
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
