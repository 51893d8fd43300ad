//! Simulated site: household load and PV from the reference profiles, plus
//! storages that follow the power committed in their schedule stores.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::controller::{MonitoringSource, Scheduler};
use crate::domain::{EnergyStorage, MonitoringData, SimulatedStorage};
use crate::forecast::{ConsumptionProfileForecaster, ForecastKind, Forecaster, SolarProfileForecaster};
use crate::store::DeviceScheduleStore;

/// Energy in Ws accumulated since the last sample.
#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    consumption: f64,
    production: f64,
    battery: f64,
    schedule: f64,
    seconds: f64,
}

pub struct SimulatedSite {
    clock: Arc<dyn Clock>,
    load: ConsumptionProfileForecaster,
    pv: SolarProfileForecaster,
    devices: Vec<(Arc<SimulatedStorage>, Arc<DeviceScheduleStore>)>,
    scheduler: Arc<Scheduler>,
    accumulated: Mutex<Accumulator>,
}

impl SimulatedSite {
    pub fn new(
        clock: Arc<dyn Clock>,
        load: ConsumptionProfileForecaster,
        pv: SolarProfileForecaster,
        devices: Vec<(Arc<SimulatedStorage>, Arc<DeviceScheduleStore>)>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            clock,
            load,
            pv,
            devices,
            scheduler,
            accumulated: Mutex::new(Accumulator::default()),
        }
    }

    async fn power_now(forecaster: &dyn Forecaster, kind: ForecastKind, now: i64) -> Result<f64> {
        let forecast = forecaster.forecast(kind, now, now + 1).await?;
        forecast
            .values
            .first()
            .copied()
            .with_context(|| format!("empty {kind} profile at {now}"))
    }

    /// Agreed site power at `now` in W, 0 without a target.
    fn schedule_power(&self, now: i64) -> f64 {
        let Some(target) = self.scheduler.target_in_force(now) else {
            return 0.0;
        };
        let slot = (now - target.starting_time).div_euclid(target.slot_length.max(1));
        let wh = usize::try_from(slot).ok().and_then(|i| target.net(i)).unwrap_or(0);
        wh as f64 * 3600.0 / target.slot_length.max(1) as f64
    }

    /// Advances the site by `seconds`: every storage runs at its committed
    /// setpoint and the resulting powers are accumulated.
    pub async fn tick(&self, seconds: u64) -> Result<()> {
        let now = self.clock.now();
        let seconds = seconds as f64;
        let consumption = Self::power_now(&self.load, ForecastKind::Consumption, now).await?;
        let production = Self::power_now(&self.pv, ForecastKind::Production, now).await?;

        let mut battery = 0.0;
        for (storage, store) in &self.devices {
            let setpoint = store.scheduled_power(now).await;
            storage.apply_power(setpoint as f64, seconds).await;
            battery += storage.read_state().await?.power_w;
        }
        let schedule = self.schedule_power(now);
        debug!(consumption, production, battery, schedule, "site tick");

        let mut acc = self.accumulated.lock();
        acc.consumption += consumption * seconds;
        acc.production += production * seconds;
        acc.battery += battery * seconds;
        acc.schedule += schedule * seconds;
        acc.seconds += seconds;
        Ok(())
    }

    pub async fn run(self: Arc<Self>, tick_seconds: u64) {
        let tick_seconds = tick_seconds.max(1);
        let mut ticker = interval(Duration::from_secs(tick_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_seconds, devices = self.devices.len(), "site simulation started");
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick(tick_seconds).await {
                warn!(error = %e, "site simulation tick failed");
            }
        }
    }
}

#[async_trait]
impl MonitoringSource for SimulatedSite {
    async fn sample(&self) -> Result<MonitoringData> {
        let acc = std::mem::take(&mut *self.accumulated.lock());
        if acc.seconds <= 0.0 {
            bail!("no site measurements since the last sample");
        }
        Ok(MonitoringData {
            consumption: acc.consumption / acc.seconds,
            production: acc.production / acc.seconds,
            battery: acc.battery / acc.seconds,
            schedule: acc.schedule / acc.seconds,
        })
    }
}
