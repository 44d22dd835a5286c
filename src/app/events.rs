//! Outbound application events.
//!
//! The [`ChargeService`](super::service::ChargeService) emits these through
//! the [`EventSink`](super::ports::EventSink) port.  Adapters on the other
//! side decide what to do with them: post to the system message bus, drive
//! the charge LED, wake the UI, etc.

/// Structured events emitted by the charge controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryEvent {
    /// Adapter presence debounced to Present.
    AdapterIn,
    /// Adapter presence debounced to Absent.
    AdapterOut,
    /// A new charge session started.
    ChargeStart,
    /// The charge session ended before the battery was full.
    ChargeStop,
    /// Charge terminated normally; the battery is full.
    ChargeFull,
    /// Adapter re-plugged while the battery is already full
    /// (at most once per plug cycle).
    BatteryFull,
    /// Reported voltage fell below the low threshold while discharging.
    BatteryLow,
    /// Reported voltage fell below the extra-low threshold.
    BatteryLowEx,
    /// Reported voltage fell below the critical threshold.
    BatteryTooLow,
    /// The accepted battery voltage changed (millivolts).
    VoltageChanged(u32),
    /// The derived battery capacity changed (percent, 0..=100).
    CapacityChanged(u8),
}
