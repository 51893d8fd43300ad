//! Flexibility-constrained scheduling of site batteries.
//!
//! Devices offer daily flexibilities through their schedule stores; the site
//! scheduler turns forecasts and those flexibilities into committed power
//! profiles that follow an agreed target schedule.

pub mod clock;
pub mod config;
pub mod controller;
pub mod domain;
pub mod forecast;
pub mod optimizer;
pub mod rpc;
pub mod simulation;
pub mod store;
pub mod telemetry;
