use anyhow::{Context, Result};
use tracing::debug;

use super::{resample, ForecastKind, Forecaster};

/// Sums the forecasts of all configured meters on the optimizer grid.
pub struct ForecastEngine {
    consumption: Vec<Box<dyn Forecaster>>,
    production: Vec<Box<dyn Forecaster>>,
}

impl ForecastEngine {
    pub fn new(consumption: Vec<Box<dyn Forecaster>>, production: Vec<Box<dyn Forecaster>>) -> Self {
        Self { consumption, production }
    }

    /// Expected demand in Wh per slot, zeros without consumption forecasters.
    pub async fn demand(&self, from: i64, slot_length: i64, slots: usize) -> Result<Vec<i32>> {
        Self::energy(&self.consumption, ForecastKind::Consumption, from, slot_length, slots).await
    }

    /// Expected production in Wh per slot (negative).
    pub async fn production(&self, from: i64, slot_length: i64, slots: usize) -> Result<Vec<i32>> {
        Self::energy(&self.production, ForecastKind::Production, from, slot_length, slots).await
    }

    async fn energy(
        forecasters: &[Box<dyn Forecaster>],
        kind: ForecastKind,
        from: i64,
        slot_length: i64,
        slots: usize,
    ) -> Result<Vec<i32>> {
        let to = from + slot_length * slots as i64;
        let mut watts = vec![0.0; slots];
        for forecaster in forecasters {
            let forecast = forecaster
                .forecast(kind, from, to)
                .await
                .with_context(|| format!("{kind} forecast for {from}..{to} failed"))?;
            if forecast.slot_length != slot_length {
                debug!(%kind, source = forecast.slot_length, target = slot_length, "resampling forecast");
            }
            for (sum, value) in watts.iter_mut().zip(resample(&forecast, from, slot_length, slots)) {
                *sum += value;
            }
        }
        Ok(watts
            .into_iter()
            .map(|w| (w * slot_length as f64 / 3600.0).round() as i32)
            .collect())
    }
}
