//! Application core — pure domain logic, zero I/O.
//!
//! This module contains the business rules for the charge controller:
//! FSM orchestration, voltage filtering, adaptive current control and
//! fault supervision.  All interaction with hardware happens through
//! **port traits** defined in [`ports`], keeping this layer fully
//! testable without real peripherals.

pub mod events;
pub mod ports;
pub mod service;
