use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Live measurement of an energy storage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    pub soc_percent: f64,
    /// Positive while charging.
    pub power_w: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageCapabilities {
    pub capacity_wh: f64,
    pub max_charge_w: f64,
    pub max_discharge_w: f64,
}

/// Device whose schedule a store manages.
#[async_trait]
pub trait EnergyStorage: Send + Sync {
    async fn read_state(&self) -> Result<StorageState>;
    fn capabilities(&self) -> StorageCapabilities;
}

/// Ideal battery integrating the power it is told to run at.
#[derive(Debug, Clone)]
pub struct SimulatedStorage {
    state: Arc<RwLock<StorageState>>,
    caps: StorageCapabilities,
}

impl SimulatedStorage {
    pub fn new(soc_percent: f64, caps: StorageCapabilities) -> Self {
        Self {
            state: Arc::new(RwLock::new(StorageState { soc_percent, power_w: 0.0 })),
            caps,
        }
    }

    fn clamp_soc(soc: f64) -> f64 {
        soc.clamp(0.0, 100.0)
    }

    /// Runs the storage at `watts` for `seconds`, limited by its ratings.
    pub async fn apply_power(&self, watts: f64, seconds: f64) {
        let watts = watts.clamp(-self.caps.max_discharge_w, self.caps.max_charge_w);
        let mut state = self.state.write().await;
        let delta_wh = watts * seconds / 3600.0;
        state.soc_percent = Self::clamp_soc(state.soc_percent + delta_wh / self.caps.capacity_wh * 100.0);
        state.power_w = watts;
    }

    pub async fn set_soc(&self, soc_percent: f64) {
        self.state.write().await.soc_percent = Self::clamp_soc(soc_percent);
    }
}

#[async_trait]
impl EnergyStorage for SimulatedStorage {
    async fn read_state(&self) -> Result<StorageState> {
        Ok(*self.state.read().await)
    }

    fn capabilities(&self) -> StorageCapabilities {
        self.caps.clone()
    }
}
