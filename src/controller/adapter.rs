//! Real-time correction of running adaptable tasks.
//!
//! Called on every monitoring tick. It never waits: the adaptable index is
//! only tried, device calls are spawned, and anything that goes wrong is
//! rolled back and left to the optimization queue.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::index::AdaptableIndex;
use super::queue::OptimizationQueue;
use crate::clock::Clock;
use crate::domain::{MonitoringData, PowerProfile, SchedulingResult, StepMap};
use crate::rpc::DeviceTransport;

/// What one monitoring tick did.
#[derive(Debug, Default)]
pub struct AdaptationRound {
    pub adjusted: usize,
    pub rejected: usize,
    /// Pending device confirmations.
    pub confirmations: Vec<JoinHandle<()>>,
}

pub struct RealTimeAdapter {
    index: Arc<Mutex<AdaptableIndex>>,
    transport: Arc<dyn DeviceTransport>,
    queue: Arc<OptimizationQueue>,
    clock: Arc<dyn Clock>,
    /// Seconds
    horizon: i32,
    runtime: Handle,
}

impl RealTimeAdapter {
    pub fn new(
        index: Arc<Mutex<AdaptableIndex>>,
        transport: Arc<dyn DeviceTransport>,
        queue: Arc<OptimizationQueue>,
        clock: Arc<dyn Clock>,
        horizon: i32,
        runtime: Handle,
    ) -> Self {
        Self {
            index,
            transport,
            queue,
            clock,
            horizon: horizon.max(1),
            runtime,
        }
    }

    /// Splits the measured deviation evenly over all running adaptable
    /// tasks for the next `horizon` seconds.
    pub fn adapt(&self, data: &MonitoringData) -> AdaptationRound {
        let mut round = AdaptationRound::default();
        let Some(mut index) = self.index.try_lock() else {
            debug!("adaptable index busy, skipping tick");
            return round;
        };

        let now = self.clock.now();
        let difference = data.difference();
        let running = index.running(now);
        if running.is_empty() {
            return round;
        }
        debug!(difference, tasks = running.len(), "adapting running tasks");
        let share = difference / running.len() as f64;

        for (device, flexibility_id) in running {
            let Some(entry) = index.get_mut(device, flexibility_id) else {
                continue;
            };
            let backup = entry.task.power.clone();
            let relative_now = (now - entry.task.starting_time) as i32;
            let end = backup.keys().next_back().copied().unwrap_or(entry.task.running_time);
            let boundary = (relative_now + self.horizon).min(end);
            let restore_value = backup.floor_value(boundary).copied().unwrap_or(0);

            let mut power = backup.clone();
            power.retain(|offset, _| *offset < relative_now || *offset > boundary);

            let current = backup.floor_value(relative_now).copied().unwrap_or(0);
            let mut target = (current as f64 + share) as i32;
            if let Some(bound) = entry.flexibility.power_corridor.floor_value(relative_now) {
                target = target.clamp(bound.min, bound.max);
            }
            if let Some(residual) = entry.flexibility.residual_energy_constraint(&power, relative_now) {
                let energy = target as i64 * (boundary - relative_now) as i64;
                if (target > 0 && residual.max <= energy) || (target < 0 && residual.min >= energy) {
                    debug!(device = %device, flexibility = flexibility_id, target, "energy corridor reached, holding 0 W");
                    target = 0;
                }
            }

            power.insert(relative_now, target);
            power.insert(boundary, restore_value);
            if let Err(e) = entry.flexibility.validate(entry.task.starting_time, &power) {
                info!(device = %device, flexibility = flexibility_id, error = %e, "adaptation not valid");
                round.rejected += 1;
                self.queue.queue_target_optimization(false);
                continue;
            }

            let update: PowerProfile = power.range(relative_now..=boundary).map(|(k, v)| (*k, *v)).collect();
            entry.task.power = power.clone();
            round.adjusted += 1;
            round
                .confirmations
                .push(self.confirm(device, flexibility_id, update, power, backup));
        }
        round
    }

    /// Sends the adaptation to the device and rolls the index back if the
    /// device does not take it. The rollback only applies while the index
    /// still holds `adapted`; a task replanned in the meantime is kept.
    fn confirm(
        &self,
        device: Uuid,
        flexibility_id: i32,
        update: PowerProfile,
        adapted: PowerProfile,
        backup: PowerProfile,
    ) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let index = self.index.clone();
        let queue = self.queue.clone();
        self.runtime.spawn(async move {
            let reason = match transport.adapt_flexibility(device, flexibility_id, update).await {
                Ok(SchedulingResult::Ok) => return,
                Ok(result) => result.to_string(),
                Err(e) => e.to_string(),
            };
            info!(device = %device, flexibility = flexibility_id, %reason, "adaptation refused, restoring task");
            match index.lock().get_mut(device, flexibility_id) {
                Some(entry) if entry.task.power == adapted => entry.task.power = backup,
                Some(_) => debug!(device = %device, flexibility = flexibility_id, "task replanned since adaptation, keeping it"),
                None => warn!(device = %device, flexibility = flexibility_id, "adapted task left the index"),
            }
            queue.queue_target_optimization(false);
        })
    }
}
