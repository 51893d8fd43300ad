//! Collapses the residual flexibility of planned tasks into one per-slot
//! envelope for publication.

use tracing::{error, trace};

use super::allocation::AllocationWindow;
use super::types::{Schedules, TaskPlan};
use crate::domain::{saturate, IntInterval, PublicFlexibility, StepMap};

/// Running sum of a bound in Ws that turns unbounded once any summand is.
#[derive(Debug, Clone, Copy)]
enum EnergySum {
    Finite(i64),
    Unbounded,
}

impl EnergySum {
    fn add(self, value: i64, unbounded: bool) -> Self {
        match self {
            EnergySum::Finite(sum) if !unbounded => EnergySum::Finite(sum + value),
            _ => EnergySum::Unbounded,
        }
    }

    fn to_wh(self, unbounded: i32) -> i32 {
        match self {
            EnergySum::Finite(ws) => saturate(ws / 3600),
            EnergySum::Unbounded => unbounded,
        }
    }
}

/// Sums per slot the power slack (time-weighted average, W) and the energy
/// slack at slot end (Wh) of every planned task. Energy slack is narrowed by
/// the adaptation buffer but always keeps 0, the committed plan itself. A
/// trailing partial slot only contributes power slack.
pub fn aggregate(
    window: &AllocationWindow,
    slots: usize,
    plan: &TaskPlan,
    schedules: &Schedules,
    timestamp: i64,
) -> PublicFlexibility {
    let slot_length = window.slot_length;
    let buffer = window.buffer as i64;
    let mut power_min = vec![0.0_f64; slots];
    let mut power_max = vec![0.0_f64; slots];
    let mut energy_min = vec![EnergySum::Finite(0); slots];
    let mut energy_max = vec![EnergySum::Finite(0); slots];

    for (device, tasks) in plan {
        trace!(device = %device, tasks = tasks.len(), "aggregating task flexibility");
        for task in tasks {
            let Some(flexibility) = schedules
                .get(device)
                .and_then(|data| data.flexibility(task.flexibility_id))
            else {
                error!(device = %device, flexibility = task.flexibility_id, "task without flexibility, ignoring it");
                continue;
            };
            let residual = flexibility.determine_task_flexibility(task);

            let start = window.from.max(task.starting_time);
            let mut relative = (start - task.starting_time) as i32;
            let mut slot = ((start - window.origin) / slot_length).max(0) as usize;
            let mut next_slot_begin = window.origin + (slot as i64 + 1) * slot_length - task.starting_time;
            let end = (window.to - task.starting_time).min(task.running_time as i64);

            while (relative as i64) < end && slot < slots {
                let mut next = next_slot_begin.min(end);
                if let Some(key) = residual.power_corridor.higher_key(relative) {
                    next = next.min(key as i64);
                }
                if let Some(key) = residual.energy_corridor.higher_key(relative) {
                    next = next.min(key as i64);
                }
                let step = (next - relative as i64) as f64;

                let power = residual
                    .power_corridor
                    .floor_value(relative)
                    .copied()
                    .unwrap_or(IntInterval::ZERO);
                power_min[slot] += power.min as f64 * step / slot_length as f64;
                power_max[slot] += power.max as f64 * step / slot_length as f64;

                relative = next as i32;
                // energy slack is only reported at full slot ends; a slot the
                // task or window leaves early keeps [0, 0]
                if next == next_slot_begin {
                    let energy = residual
                        .energy_constraint(relative)
                        .unwrap_or(IntInterval::UNBOUNDED);
                    let min = (energy.min as i64 + buffer).min(0);
                    let max = (energy.max as i64 - buffer).max(0);
                    energy_min[slot] = energy_min[slot].add(min, energy.min == i32::MIN);
                    energy_max[slot] = energy_max[slot].add(max, energy.max == i32::MAX);
                    slot += 1;
                    next_slot_begin += slot_length;
                }
            }
        }
    }

    PublicFlexibility {
        timestamp,
        starting_time: window.origin,
        slot_length,
        power_corridor: power_min
            .iter()
            .zip(&power_max)
            .map(|(min, max)| IntInterval::new(*min as i32, *max as i32))
            .collect(),
        energy_corridor: energy_min
            .iter()
            .zip(&energy_max)
            .map(|(min, max)| IntInterval::new(min.to_wh(i32::MIN), max.to_wh(i32::MAX)))
            .collect(),
    }
}
