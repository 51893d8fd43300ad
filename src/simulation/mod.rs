//! # Site Simulation
//!
//! Stands in for the metering and battery hardware of a site when the crate
//! runs without real devices. Household load and PV follow
//! the reference profiles, storages follow their committed schedules, and
//! the averaged readings feed the real-time adapter.

pub mod site;

pub use site::SimulatedSite;
