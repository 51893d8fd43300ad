use anyhow::{Context, Result};
use flex_scheduler::{clock, config, controller, domain, forecast, rpc, simulation, store, telemetry};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{info, warn};

use clock::{Clock, SystemClock};
use config::Config;
use controller::{forward_store_events, spawn_scheduler_tasks, LoggingPublisher, Scheduler};
use domain::{SimulatedStorage, StorageCapabilities};
use forecast::{ConsumptionProfileForecaster, ForecastEngine, Forecaster, SolarProfileForecaster};
use rpc::LocalTransport;
use store::DeviceScheduleStore;
use telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::load().context("loading configuration")?;
    init_tracing(&cfg.logging)?;
    let tz = cfg.scheduler.timezone;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut handles = Vec::new();

    let mut devices = Vec::new();
    for device in &cfg.devices {
        if !cfg.scheduler.flexibility_providers.contains(&device.uuid) {
            warn!(device = %device.uuid, "device is not listed as flexibility provider");
        }
        let storage = Arc::new(SimulatedStorage::new(
            cfg.simulation.initial_soc_percent,
            StorageCapabilities {
                capacity_wh: device.nominal_capacity as f64,
                max_charge_w: device.max_flexibility_charge as f64,
                max_discharge_w: device.max_flexibility_discharge as f64,
            },
        ));
        let store = Arc::new(DeviceScheduleStore::new(device.clone(), tz, storage.clone(), clock.clone()));
        handles.push(tokio::spawn(store.clone().run()));
        devices.push((storage, store));
    }

    let consumption: Vec<Box<dyn Forecaster>> = cfg
        .scheduler
        .consumption_meters
        .iter()
        .map(|_| Box::new(ConsumptionProfileForecaster::new(tz, cfg.simulation.base_load_w)) as Box<dyn Forecaster>)
        .collect();
    let production: Vec<Box<dyn Forecaster>> = cfg
        .scheduler
        .production_meters
        .iter()
        .map(|_| Box::new(SolarProfileForecaster::new(tz, cfg.simulation.pv_peak_w)) as Box<dyn Forecaster>)
        .collect();

    let transport = Arc::new(LocalTransport::new(devices.iter().map(|(_, store)| store.clone())));
    let scheduler = Arc::new(Scheduler::new(
        cfg.scheduler.clone(),
        clock.clone(),
        transport,
        Arc::new(ForecastEngine::new(consumption, production)),
        Arc::new(LoggingPublisher),
        Handle::current(),
    ));
    for (_, store) in &devices {
        handles.push(forward_store_events(scheduler.clone(), store.subscribe()));
    }

    let site = Arc::new(simulation::SimulatedSite::new(
        clock.clone(),
        ConsumptionProfileForecaster::new(tz, cfg.simulation.base_load_w),
        SolarProfileForecaster::new(tz, cfg.simulation.pv_peak_w),
        devices,
        scheduler.clone(),
    ));
    handles.push(tokio::spawn(site.clone().run(cfg.simulation.tick_seconds)));
    let (tasks, periodic) = spawn_scheduler_tasks(scheduler, site);
    handles.extend(periodic);

    info!(
        devices = cfg.devices.len(),
        providers = cfg.scheduler.flexibility_providers.len(),
        timezone = %tz,
        "flexibility scheduler running"
    );

    let signal = telemetry::shutdown_signal().await;
    for handle in handles {
        handle.abort();
    }
    tasks.log_statuses().await;
    warn!(%signal, "shutdown complete");
    Ok(())
}
