//! Forecast contract consumed by the optimizers.
//!
//! Forecasters report average power per slot on their own grid; the
//! [`ForecastEngine`] brings everything onto the optimizer grid as Wh.

pub mod engine;
pub mod profiles;
pub mod resample;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub use engine::ForecastEngine;
pub use profiles::{ConsumptionProfileForecaster, SolarProfileForecaster};
pub use resample::resample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ForecastKind {
    Consumption,
    Production,
}

/// Average power in W per slot starting at `starting_time`. Production is
/// negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerForecast {
    pub starting_time: i64,
    pub slot_length: i64,
    pub values: Vec<f64>,
}

impl PowerForecast {
    pub fn end(&self) -> i64 {
        self.starting_time + self.slot_length * self.values.len() as i64
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Forecaster: Send + Sync {
    /// Forecast covering at least `[from, to)`.
    async fn forecast(&self, kind: ForecastKind, from: i64, to: i64) -> Result<PowerForecast>;
}
