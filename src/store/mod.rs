//! Per-device schedule store.
//!
//! Owns one device's flexibilities, tasks and committed power timeline.
//! Every mutation goes through the state mutex. The new state is encoded
//! while the lock is held and written to the device's snapshot file after
//! it is released.

pub mod persistence;
pub mod state;

use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::DeviceConfig;
use crate::domain::{EnergyStorage, Flexibility, PowerProfile, ScheduleSummary, SchedulingResult, Task};
pub use persistence::{PersistenceError, SnapshotFile, SnapshotStatus, StagedSnapshot};
pub use state::{StoreState, MAX_SCHEDULE_RANGE};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("requested range {from}..{to} exceeds two days")]
    RangeTooLong { from: i64, to: i64 },
    #[error("requested range {from}..{to} ends before it starts")]
    EmptyRange { from: i64, to: i64 },
    #[error("storage state unavailable: {0}")]
    Storage(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Committed power from `from` on was changed by the store itself.
    ScheduleChanged { device: Uuid, from: i64 },
}

pub struct DeviceScheduleStore {
    uuid: Uuid,
    cfg: DeviceConfig,
    tz: Tz,
    storage: Arc<dyn EnergyStorage>,
    clock: Arc<dyn Clock>,
    snapshot: SnapshotFile,
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl DeviceScheduleStore {
    /// Restores the device snapshot from `cfg.state_file`, starting empty if
    /// it is missing or unreadable.
    pub fn new(cfg: DeviceConfig, tz: Tz, storage: Arc<dyn EnergyStorage>, clock: Arc<dyn Clock>) -> Self {
        let snapshot = SnapshotFile::new(&cfg.state_file);
        let (state, status) = snapshot.load::<StoreState>();
        info!(
            device = %cfg.uuid,
            ?status,
            tasks = state.tasks.len(),
            "device schedule store ready"
        );
        let (events, _) = broadcast::channel(16);
        Self {
            uuid: cfg.uuid,
            cfg,
            tz,
            storage,
            clock,
            snapshot,
            state: Mutex::new(state),
            events,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.cfg
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Live state of charge in percent and stored energy in Wh.
    async fn stored_energy(&self) -> Result<(f64, i64), StoreError> {
        let state = self
            .storage
            .read_state()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let wh = (state.soc_percent * self.cfg.nominal_capacity as f64 / 100.0).round() as i64;
        Ok((state.soc_percent, wh))
    }

    /// Encodes `state`; call with the state lock held.
    fn stage(&self, state: &StoreState) -> Option<StagedSnapshot> {
        self.snapshot
            .stage(state)
            .map_err(|e| error!(device = %self.uuid, error = %e, "failed to encode device state"))
            .ok()
    }

    /// Writes a staged snapshot; call after the state lock is released.
    async fn persist(&self, staged: Option<StagedSnapshot>) {
        let Some(staged) = staged else { return };
        if let Err(e) = self.snapshot.commit(staged).await {
            error!(device = %self.uuid, error = %e, "failed to persist device state");
        }
    }

    pub async fn get_schedule(&self, from: i64, to: i64) -> Result<ScheduleSummary, StoreError> {
        let (_, current_wh) = self.stored_energy().await?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let summary = state.get_schedule(self.uuid, from, to, now, current_wh, &self.tz, &self.cfg)?;
        let staged = self.stage(&state);
        drop(state);
        self.persist(staged).await;
        Ok(summary)
    }

    pub async fn get_flexibility(&self, id: i32) -> Option<Flexibility> {
        self.state.lock().await.flexibilities.get(&id).cloned()
    }

    pub async fn get_task(&self, id: i32) -> Option<Task> {
        self.state.lock().await.tasks.get(&id).cloned()
    }

    pub async fn scheduled_tasks(&self) -> Vec<Task> {
        self.state.lock().await.tasks.values().cloned().collect()
    }

    /// Setpoint committed for `time`, 0 W if nothing is scheduled.
    pub async fn scheduled_power(&self, time: i64) -> i32 {
        self.state.lock().await.scheduled_power_at(time)
    }

    pub async fn expected_stored_energy(&self, time: i64) -> Result<i64, StoreError> {
        let (_, current_wh) = self.stored_energy().await?;
        let now = self.clock.now();
        Ok(self.state.lock().await.expected_stored_energy(now, time, current_wh))
    }

    pub async fn schedule_flexibility(&self, id: i32, starting_time: i64, power: PowerProfile) -> SchedulingResult {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let result = state.schedule_flexibility(id, starting_time, power, now);
        let staged = result.is_ok().then(|| self.stage(&state)).flatten();
        drop(state);
        self.persist(staged).await;
        result
    }

    pub async fn adapt_scheduled_flexibility(&self, id: i32, power: &PowerProfile) -> SchedulingResult {
        let mut state = self.state.lock().await;
        let result = state.adapt_scheduled_flexibility(id, power);
        let staged = result.is_ok().then(|| self.stage(&state)).flatten();
        drop(state);
        if result.is_ok() {
            self.persist(staged).await;
        } else {
            debug!(device = %self.uuid, flexibility = id, %result, "adaptation refused");
        }
        result
    }

    pub async fn unschedule_flexibility(&self, id: i32) -> SchedulingResult {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let result = state.unschedule_flexibility(id, now);
        let staged = result.is_ok().then(|| self.stage(&state)).flatten();
        drop(state);
        self.persist(staged).await;
        result
    }

    /// Repairs the committed timeline against the device's energy limits.
    /// Returns the earliest changed time, 0 if nothing changed.
    pub async fn fix_schedule(&self, stored_wh: i64, min_wh: i64, max_wh: i64) -> i64 {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let changed = state.fix_schedule(now, stored_wh, min_wh, max_wh);
        let staged = (changed != 0).then(|| self.stage(&state)).flatten();
        drop(state);
        self.persist(staged).await;
        changed
    }

    /// Drives the device to `soc` percent by `time` and blocks the
    /// flexibility offer until then.
    pub async fn set_target_soc(&self, soc: i32, time: i64) -> Result<(), StoreError> {
        let (current_soc, _) = self.stored_energy().await?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.apply_target_soc(soc, time, now, current_soc, &self.cfg);
        let staged = self.stage(&state);
        drop(state);
        self.persist(staged).await;
        Ok(())
    }

    /// One maintenance pass: prune expired entries, then either re-plan an
    /// active state-of-charge target or repair the timeline against the live
    /// stored energy. Subscribers are told when the
    /// timeline changed.
    pub async fn run_maintenance(&self) -> Result<(), StoreError> {
        let (current_soc, current_wh) = self.stored_energy().await?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let pruned = state.prune(now);
        let changed = if state.target_soc_active(now) {
            let (soc, time) = (state.target_soc, state.target_soc_time);
            state.apply_target_soc(soc, time, now, current_soc, &self.cfg);
            0
        } else {
            state.fix_schedule(now, current_wh, self.cfg.min_energy_wh(), self.cfg.max_energy_wh())
        };
        let reapplied = state.target_soc_active(now);
        let staged = (pruned > 0 || changed != 0 || reapplied)
            .then(|| self.stage(&state))
            .flatten();
        drop(state);
        self.persist(staged).await;

        if changed != 0 {
            warn!(device = %self.uuid, from = changed, "schedule violated energy limits and was repaired");
            // No receivers is fine.
            let _ = self.events.send(StoreEvent::ScheduleChanged { device: self.uuid, from: changed });
        }
        Ok(())
    }

    /// Maintenance loop, runs until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let period = Duration::from_secs(self.cfg.maintenance_period_seconds.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(device = %self.uuid, period_secs = period.as_secs(), "store maintenance started");
        loop {
            interval.tick().await;
            if let Err(e) = self.run_maintenance().await {
                warn!(device = %self.uuid, error = %e, "store maintenance failed");
            }
        }
    }
}
