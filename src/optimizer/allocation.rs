//! Greedy slot allocation shared by both optimizers.
//!
//! Devices are visited in map order and flexibilities in id order; each one
//! takes what it can towards the per-slot target before the next is asked.
//! The result depends on that order.

use std::collections::BTreeMap;
use tracing::{debug, error};
use uuid::Uuid;

use super::types::{Schedules, TaskPlan};
use crate::domain::{
    compress_profile, Flexibility, IntInterval, PowerProfile, ScheduleData, StepMap, Task,
    UNREGISTERED_TASK,
};

/// Time frame of one allocation run.
#[derive(Debug, Clone, Copy)]
pub struct AllocationWindow {
    /// Start of slot 0.
    pub origin: i64,
    pub from: i64,
    pub to: i64,
    pub slot_length: i64,
    /// Tasks starting before this are only replanned when adaptable.
    pub earliest_modifiable: i64,
    /// Ws
    pub buffer: i32,
}

/// Runs the allocation over all devices. `target` and `total` are Wh per
/// slot counted from `origin`; `total` is updated in place with every
/// planned task. Slots without a target are steered towards 0 W.
pub fn allocate(
    window: &AllocationWindow,
    target: &[Option<i64>],
    total: &mut [i64],
    schedules: &Schedules,
) -> TaskPlan {
    let mut plan = TaskPlan::new();
    for (uuid, data) in schedules {
        let mut tasks = Vec::new();
        for (flexibility, task) in relevant_flexibilities(data, window.earliest_modifiable) {
            let task = match task {
                Some(t) => t.clone(),
                None => {
                    debug!(device = %uuid, flexibility = flexibility.id, "deriving task for free flexibility");
                    derive_task(flexibility, window.from)
                }
            };
            tasks.push(plan_task(uuid, flexibility, &task, window, target, total));
        }
        plan.insert(*uuid, tasks);
    }
    plan
}

/// Flexibilities worth planning, in id order, paired with their task.
fn relevant_flexibilities(data: &ScheduleData, earliest_modifiable: i64) -> Vec<(&Flexibility, Option<&Task>)> {
    let mut relevant: BTreeMap<i32, (&Flexibility, Option<&Task>)> = BTreeMap::new();
    for task in &data.tasks {
        if task.flexibility_id < 0 || !(task.adaptable || task.starting_time >= earliest_modifiable) {
            continue;
        }
        if let Some(flexibility) = data.flexibility(task.flexibility_id) {
            relevant.insert(flexibility.id, (flexibility, Some(task)));
        }
    }
    for flexibility in &data.flexibilities {
        if flexibility.is_free() && flexibility.latest_start() >= earliest_modifiable {
            relevant.entry(flexibility.id).or_insert((flexibility, None));
        }
    }
    relevant.into_values().collect()
}

/// Task for a free flexibility: starts as early as allowed but not before
/// `from`, runs as long as allowed but ends in time.
pub(crate) fn derive_task(flexibility: &Flexibility, from: i64) -> Task {
    let start = flexibility.earliest_start().max(from);
    let mut running_time = flexibility.running_time.max as i64;
    if start + running_time > flexibility.stopping_time.max {
        running_time = (flexibility.stopping_time.max - start).max(flexibility.running_time.min as i64);
    }
    Task::idle(
        UNREGISTERED_TASK,
        flexibility.id,
        flexibility.adaptable,
        start,
        running_time as i32,
    )
}

/// Tightens an energy bound by `buffer` on both sides if it stays non-empty.
pub(crate) fn buffered(bound: IntInterval, buffer: i32) -> IntInterval {
    let min = match bound.min {
        i32::MIN => i32::MIN,
        m => m.saturating_add(buffer),
    };
    let max = match bound.max {
        i32::MAX => i32::MAX,
        m => m.saturating_sub(buffer),
    };
    if min > max {
        bound
    } else {
        IntInterval::new(min, max)
    }
}

fn div_floor(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

fn div_ceil(a: i64, b: i64) -> i64 {
    -div_floor(-a, b)
}

/// Ws to Wh, rounded to the nearest Wh.
pub(crate) fn to_wh(ws: i64) -> i64 {
    let half = if ws >= 0 { 1800 } else { -1800 };
    (ws + half) / 3600
}

/// Walks one task from the window start, choosing per step the admissible
/// power closest to the slot's remaining target.
fn plan_task(
    device: &Uuid,
    flexibility: &Flexibility,
    task: &Task,
    window: &AllocationWindow,
    target: &[Option<i64>],
    total: &mut [i64],
) -> Task {
    let running_time = task.running_time;
    let start = window.from.max(task.starting_time);
    let slot_length = window.slot_length;

    let mut relative = (start - task.starting_time) as i32;
    let mut slot = ((start - window.origin) / slot_length).max(0) as usize;
    let mut next_slot_begin = window.origin + (slot as i64 + 1) * slot_length - task.starting_time;
    let end = (window.to - task.starting_time).min(running_time as i64);

    let mut power = PowerProfile::new();
    power.insert(0, 0);
    let mut energy: i64 = 0;
    let mut slot_energy: i64 = 0;

    while (relative as i64) < end && slot < total.len() {
        let mut next = next_slot_begin.min(end);
        if let Some(key) = flexibility.power_corridor.higher_key(relative) {
            next = next.min(key as i64);
        }
        if let Some(key) = flexibility.energy_corridor.higher_key(relative) {
            next = next.min(key as i64);
        }
        let step = next - relative as i64;

        let corridor = flexibility
            .power_corridor
            .floor_value(relative)
            .copied()
            .unwrap_or(IntInterval::ZERO);
        let energy_bound = buffered(
            flexibility
                .energy_constraint(next as i32)
                .unwrap_or(IntInterval::UNBOUNDED),
            window.buffer,
        );

        let mut min = corridor.min as i64;
        let mut max = corridor.max as i64;
        if energy_bound.min != i32::MIN {
            min = min.max(div_ceil(energy_bound.min as i64 - energy, step));
        }
        if energy_bound.max != i32::MAX {
            max = max.min(div_floor(energy_bound.max as i64 - energy, step));
        }
        if max < min {
            error!(
                device = %device,
                flexibility = flexibility.id,
                offset = relative,
                power_corridor = %corridor,
                energy_corridor = %energy_bound,
                energy,
                "no admissible power, idling"
            );
            min = 0;
            max = 0;
        }

        let desired = match target.get(slot).copied().flatten() {
            Some(goal) => (goal - total[slot]) * 3600 / slot_length,
            None => 0,
        };
        let value = desired.clamp(min, max) as i32;

        power.insert(relative, value);
        energy += value as i64 * step;
        slot_energy += value as i64 * step;
        relative = next as i32;

        if next == next_slot_begin {
            total[slot] += to_wh(slot_energy);
            slot_energy = 0;
            slot += 1;
            next_slot_begin += slot_length;
        }
    }
    if slot_energy != 0 && slot < total.len() {
        total[slot] += to_wh(slot_energy);
    }
    // idle past the window
    if relative < running_time {
        power.insert(relative, 0);
    }
    power.insert(running_time, 0);
    compress_profile(&mut power, running_time);

    Task { power, ..task.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LongInterval;

    fn flexibility(power: IntInterval, energy: IntInterval, start: i64, running: i32) -> Flexibility {
        Flexibility {
            id: 3,
            task_id: -1,
            adaptable: false,
            stopping_time: LongInterval::new(start + running as i64, start + running as i64),
            running_time: IntInterval::new(running, running),
            power_corridor: [(0, power)].into_iter().collect(),
            energy_corridor: [(0, energy)].into_iter().collect(),
        }
    }

    fn window(from: i64, to: i64) -> AllocationWindow {
        AllocationWindow { origin: from, from, to, slot_length: 900, earliest_modifiable: from, buffer: 0 }
    }

    fn schedules(flexibility: Flexibility) -> Schedules {
        [(
            Uuid::from_u128(1),
            ScheduleData { uuid: Uuid::from_u128(1), flexibilities: vec![flexibility], ..Default::default() },
        )]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_offsets_demand_within_corridor() {
        let flex = flexibility(IntInterval::new(-2000, 2000), IntInterval::UNBOUNDED, 0, 3600);
        let mut total = vec![500, 250, 600, 0];
        let plan = allocate(&window(0, 3600), &[Some(0); 4], &mut total, &schedules(flex.clone()));

        assert_eq!(total, vec![0, 0, 100, 0]);
        let task = &plan[&Uuid::from_u128(1)][0];
        assert_eq!(task.id, UNREGISTERED_TASK);
        assert_eq!(task.power_at(0), -2000);
        assert_eq!(task.power_at(900), -1000);
        assert_eq!(task.power_at(1800), -2000);
        assert_eq!(task.power_at(2700), 0);
        assert!(flex.check_validity(task.starting_time, &task.power));
    }

    #[test]
    fn test_energy_bound_limits_discharge() {
        // at most 1000 Wh may leave the device
        let flex = flexibility(
            IntInterval::new(-2000, 2000),
            IntInterval::new(-1000 * 3600, i32::MAX),
            0,
            3600,
        );
        let mut total = vec![500; 4];
        let plan = allocate(&window(0, 3600), &[Some(0); 4], &mut total, &schedules(flex.clone()));
        let task = &plan[&Uuid::from_u128(1)][0];
        assert_eq!(total, vec![0, 0, 500, 500]);
        assert!(flex.check_validity(task.starting_time, &task.power));
    }

    #[test]
    fn test_idles_after_window() {
        let flex = flexibility(IntInterval::new(-2000, 2000), IntInterval::UNBOUNDED, 0, 3600);
        let mut total = vec![500, 500];
        let plan = allocate(&window(0, 1800), &[Some(0); 2], &mut total, &schedules(flex));
        let task = &plan[&Uuid::from_u128(1)][0];
        assert_eq!(task.power_at(900), -2000);
        assert_eq!(task.power_at(1800), 0);
        assert_eq!(task.power_at(3000), 0);
    }

    #[test]
    fn test_late_task_books_into_its_own_slot() {
        let flex = flexibility(IntInterval::new(-2000, 2000), IntInterval::UNBOUNDED, 1800, 900);
        let mut total = vec![500, 500, 500, 500];
        let plan = allocate(&window(0, 3600), &[Some(0); 4], &mut total, &schedules(flex));
        assert_eq!(total, vec![500, 500, 0, 500]);
        assert_eq!(plan[&Uuid::from_u128(1)][0].starting_time, 1800);
    }

    #[test]
    fn test_buffer_is_skipped_without_room() {
        assert_eq!(buffered(IntInterval::new(-10, 10), 20), IntInterval::new(-10, 10));
        assert_eq!(buffered(IntInterval::new(-100, 100), 20), IntInterval::new(-80, 80));
        assert_eq!(buffered(IntInterval::UNBOUNDED, 20), IntInterval::UNBOUNDED);
    }

    #[test]
    fn test_rounding_helpers() {
        assert_eq!(div_floor(-7, 2), -4);
        assert_eq!(div_ceil(-7, 2), -3);
        assert_eq!(div_ceil(7, 2), 4);
        assert_eq!(to_wh(1799), 0);
        assert_eq!(to_wh(-1800), -1);
    }
}
