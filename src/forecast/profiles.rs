//! Reference load and PV shapes used when no external forecast service is
//! wired in.

use anyhow::{ensure, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Timelike};
use chrono_tz::Tz;

use super::{ForecastKind, Forecaster, PowerForecast};
use crate::clock::slot_start;

const HOUR: i64 = 3600;

fn local_hour(tz: &Tz, epoch: i64) -> f64 {
    tz.timestamp_opt(epoch, 0)
        .single()
        .map(|dt| dt.hour() as f64)
        .unwrap_or(0.0)
}

fn hourly_series(tz: &Tz, from: i64, to: i64, value: impl Fn(f64) -> f64) -> PowerForecast {
    let starting_time = slot_start(tz, from, HOUR);
    let hours = ((to - starting_time) + HOUR - 1).div_euclid(HOUR).max(0);
    let values = (0..hours)
        .map(|h| value(local_hour(tz, starting_time + h * HOUR)))
        .collect();
    PowerForecast { starting_time, slot_length: HOUR, values }
}

/// Household load: base load plus a morning and an evening peak.
#[derive(Debug, Clone)]
pub struct ConsumptionProfileForecaster {
    pub tz: Tz,
    pub base_w: f64,
}

impl ConsumptionProfileForecaster {
    pub fn new(tz: Tz, base_w: f64) -> Self {
        Self { tz, base_w }
    }
}

fn bump(x: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma.max(0.01);
    (-0.5 * z * z).exp()
}

#[async_trait]
impl Forecaster for ConsumptionProfileForecaster {
    async fn forecast(&self, kind: ForecastKind, from: i64, to: i64) -> Result<PowerForecast> {
        ensure!(kind == ForecastKind::Consumption, "consumption profile cannot forecast {kind}");
        Ok(hourly_series(&self.tz, from, to, |h| {
            let morning = bump(h, 7.5, 1.5) * 1000.0;
            let evening = bump(h, 18.5, 2.0) * 1600.0;
            (self.base_w + morning + evening).max(200.0)
        }))
    }
}

/// Clear-sky PV bell between sunrise and sunset, reduced by a cloud factor.
#[derive(Debug, Clone)]
pub struct SolarProfileForecaster {
    pub tz: Tz,
    pub peak_w: f64,
    pub sunrise: f64,
    pub sunset: f64,
    pub cloud_factor: f64,
}

impl SolarProfileForecaster {
    pub fn new(tz: Tz, peak_w: f64) -> Self {
        Self {
            tz,
            peak_w,
            sunrise: 8.0,
            sunset: 16.0,
            cloud_factor: 0.75,
        }
    }
}

#[async_trait]
impl Forecaster for SolarProfileForecaster {
    async fn forecast(&self, kind: ForecastKind, from: i64, to: i64) -> Result<PowerForecast> {
        ensure!(kind == ForecastKind::Production, "solar profile cannot forecast {kind}");
        Ok(hourly_series(&self.tz, from, to, |h| {
            if h < self.sunrise || h > self.sunset {
                return 0.0;
            }
            let day_len = (self.sunset - self.sunrise).max(0.01);
            let x = (h - self.sunrise) / day_len;
            -(std::f64::consts::PI * x).sin().max(0.0) * self.peak_w * self.cloud_factor
        }))
    }
}
