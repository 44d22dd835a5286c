//! Battery charge-management controller core.
//!
//! Hexagonal architecture: all hardware access flows through the port
//! traits in [`app::ports`], so the whole controller runs unchanged on
//! the target and on the host test harness.
//!
//! The consuming firmware owns the adapters (charger IC register driver,
//! ADC, NTC lookup, NVS) and calls [`app::service::ChargeService::tick`]
//! every 50 ms.

#![deny(unused_must_use)]

pub mod app;
pub mod config;
pub mod control;
pub mod error;
pub mod fsm;
pub mod safety;
pub mod sensors;
