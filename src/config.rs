use anyhow::Result;
use chrono::NaiveTime;
use chrono_tz::Tz;
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;
use strum::Display;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    Json,
    /// Single-line human readable output.
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directives, overridden by `RUST_LOG`.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info,flex_scheduler=info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

/// Settings of the site-level scheduler. Times are seconds, energies Wh
/// unless the field says otherwise.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub state_file: String,
    pub timezone: Tz,
    /// Devices offering flexibilities; iteration order is allocation order.
    pub flexibility_providers: Vec<Uuid>,
    #[serde(default)]
    pub consumption_meters: Vec<Uuid>,
    #[serde(default)]
    pub production_meters: Vec<Uuid>,
    pub slot_length: i64,
    pub flexibility_adaption_horizon: i32,
    pub adaption_interval_seconds: u64,
    pub minimum_compliance_optimization_interval: i64,
    pub minimum_schedule_update_publication_interval: i64,
    pub schedule_deviation_reporting_threshold: i32,
    /// Safety margin on energy corridors, in Ws.
    pub flexibility_adaption_buffer: i32,
    pub optimization_time_buffer: i64,
    pub publication_retry_interval: u64,
    /// Local time of day at which the next day's schedule is published.
    pub publication_time: NaiveTime,
    pub rpc_timeout_seconds: u64,
    pub max_concurrent_requests: usize,
}

/// A storage device whose schedule store runs in this process.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub uuid: Uuid,
    pub state_file: String,
    /// Wh
    pub nominal_capacity: i32,
    /// percent
    pub min_state_of_charge: i32,
    /// percent
    pub max_state_of_charge: i32,
    /// W
    pub max_flexibility_charge: i32,
    /// W
    pub max_flexibility_discharge: i32,
    /// Wh
    pub flexibility_energy_buffer: i32,
    pub maintenance_period_seconds: u64,
}

impl DeviceConfig {
    pub fn min_energy_wh(&self) -> i64 {
        self.min_state_of_charge as i64 * self.nominal_capacity as i64 / 100
    }

    pub fn max_energy_wh(&self) -> i64 {
        self.max_state_of_charge as i64 * self.nominal_capacity as i64 / 100
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    pub initial_soc_percent: f64,
    pub base_load_w: f64,
    pub pv_peak_w: f64,
    pub tick_seconds: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("FLEX__").split("__"));
        Ok(figment.extract()?)
    }
}
