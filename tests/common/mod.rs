//! Shared test fixtures for integration tests.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveTime;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use flex_scheduler::clock::ManualClock;
use flex_scheduler::config::{DeviceConfig, SchedulerConfig};
use flex_scheduler::controller::{PublicationKind, SchedulePublisher};
use flex_scheduler::domain::{PublicFlexibility, PublicSchedule, SimulatedStorage, StorageCapabilities};
use flex_scheduler::forecast::{ForecastKind, Forecaster, PowerForecast};
use flex_scheduler::store::DeviceScheduleStore;

/// 2023-11-14T00:00:00Z
pub const DAY: i64 = 1_699_920_000;

pub const BATTERY: Uuid = Uuid::from_u128(0x8d1f);

/// 6 kWh battery, 10..90 % usable, 2 kW both ways, 100 Wh buffer.
pub fn device_config(dir: &Path, uuid: Uuid) -> DeviceConfig {
    DeviceConfig {
        uuid,
        state_file: dir.join(format!("{uuid}.json")).to_string_lossy().into_owned(),
        nominal_capacity: 6000,
        min_state_of_charge: 10,
        max_state_of_charge: 90,
        max_flexibility_charge: 2000,
        max_flexibility_discharge: 2000,
        flexibility_energy_buffer: 100,
        maintenance_period_seconds: 9,
    }
}

/// UTC scheduler with 15 minute slots and no adaptation buffer.
pub fn scheduler_config(dir: &Path, providers: Vec<Uuid>) -> SchedulerConfig {
    SchedulerConfig {
        state_file: dir.join("scheduler.json").to_string_lossy().into_owned(),
        timezone: chrono_tz::UTC,
        flexibility_providers: providers,
        consumption_meters: Vec::new(),
        production_meters: Vec::new(),
        slot_length: 900,
        flexibility_adaption_horizon: 80,
        adaption_interval_seconds: 60,
        minimum_compliance_optimization_interval: 900,
        minimum_schedule_update_publication_interval: 300,
        schedule_deviation_reporting_threshold: 250,
        flexibility_adaption_buffer: 0,
        optimization_time_buffer: 1,
        publication_retry_interval: 300,
        publication_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        rpc_timeout_seconds: 1,
        max_concurrent_requests: 4,
    }
}

pub fn battery_store(
    dir: &Path,
    clock: Arc<ManualClock>,
    soc_percent: f64,
) -> (Arc<DeviceScheduleStore>, Arc<SimulatedStorage>) {
    let storage = Arc::new(SimulatedStorage::new(
        soc_percent,
        StorageCapabilities { capacity_wh: 6000.0, max_charge_w: 2000.0, max_discharge_w: 2000.0 },
    ));
    let store = Arc::new(DeviceScheduleStore::new(
        device_config(dir, BATTERY),
        chrono_tz::UTC,
        storage.clone(),
        clock,
    ));
    (store, storage)
}

/// Flat forecast on a 15 minute grid.
pub struct ConstantForecaster {
    pub kind: ForecastKind,
    pub watts: f64,
}

#[async_trait]
impl Forecaster for ConstantForecaster {
    async fn forecast(&self, kind: ForecastKind, from: i64, to: i64) -> Result<PowerForecast> {
        anyhow::ensure!(kind == self.kind, "unexpected {kind} request");
        let slots = ((to - from) + 899) / 900;
        Ok(PowerForecast {
            starting_time: from,
            slot_length: 900,
            values: vec![self.watts; slots.max(0) as usize],
        })
    }
}

/// Keeps every publication for inspection.
#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<(PublicationKind, PublicSchedule)>>,
}

#[async_trait]
impl SchedulePublisher for RecordingPublisher {
    async fn publish(
        &self,
        schedule: &PublicSchedule,
        _flexibility: &PublicFlexibility,
        kind: PublicationKind,
    ) -> Result<()> {
        self.published.lock().push((kind, schedule.clone()));
        Ok(())
    }
}
