use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::task::Task;
use super::types::{Corridor, IntInterval, LongInterval, PowerProfile, StepMap};

/// Reason a power profile does not fit a flexibility.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidityError {
    #[error("profile has no value at offset 0")]
    MissingStart,
    #[error("profile must end with 0 W, found {0} W")]
    OpenEnd(i32),
    #[error("profile ends at {end}s, maximum running time is {max}s")]
    TooLong { end: i32, max: i32 },
    #[error("stopping time {stop} outside [{min}, {max}]")]
    StoppingTime { stop: i64, min: i64, max: i64 },
    #[error("no corridor in force at offset {0}s")]
    MissingCorridor(i32),
    #[error("{power} W at offset {at}s outside power corridor {bound}")]
    Power { at: i32, power: i32, bound: IntInterval },
    #[error("{energy} Ws at offset {at}s outside energy corridor {bound}")]
    Energy { at: i32, energy: i64, bound: IntInterval },
}

/// Operating envelope offered by a device.
///
/// Offsets in both corridors are seconds since the task start. The power
/// corridor is a step function in W, the energy corridor bounds the running
/// energy integral in Ws and is interpolated linearly between its keys.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flexibility {
    pub id: i32,
    /// Id of the derived task, negative while the flexibility is free.
    pub task_id: i32,
    pub adaptable: bool,
    /// Admissible end of the task, epoch seconds.
    pub stopping_time: LongInterval,
    /// Admissible duration, seconds.
    pub running_time: IntInterval,
    pub power_corridor: Corridor,
    pub energy_corridor: Corridor,
}

impl Flexibility {
    pub fn is_free(&self) -> bool {
        self.task_id < 0
    }

    /// Earliest start that still lets a maximum-length task end in time.
    pub fn earliest_start(&self) -> i64 {
        self.stopping_time.min - self.running_time.max as i64
    }

    /// Latest start that still allows the minimum running time.
    pub fn latest_start(&self) -> i64 {
        self.stopping_time.max - self.running_time.min as i64
    }

    pub fn check_validity(&self, starting_time: i64, power: &PowerProfile) -> bool {
        self.validate(starting_time, power).is_ok()
    }

    /// Single correctness gate for every profile a device accepts.
    pub fn validate(&self, starting_time: i64, power: &PowerProfile) -> Result<(), ValidityError> {
        if !power.contains_key(&0) {
            return Err(ValidityError::MissingStart);
        }
        let (&end, &last) = power.iter().next_back().ok_or(ValidityError::MissingStart)?;
        if last != 0 {
            return Err(ValidityError::OpenEnd(last));
        }
        if end > self.running_time.max {
            return Err(ValidityError::TooLong { end, max: self.running_time.max });
        }
        let stop = starting_time + end as i64;
        if !self.stopping_time.contains(stop) {
            return Err(ValidityError::StoppingTime {
                stop,
                min: self.stopping_time.min,
                max: self.stopping_time.max,
            });
        }
        self.check_power(power)?;
        self.check_energy(power)
    }

    fn check_power(&self, power: &PowerProfile) -> Result<(), ValidityError> {
        let mut time = 0;
        loop {
            let Some(next) = next_breakpoint(&[power.higher_key(time), self.power_corridor.higher_key(time)])
            else {
                return Ok(());
            };
            let value = power.floor_value(time).copied().unwrap_or(0);
            let bound = *self
                .power_corridor
                .floor_value(time)
                .ok_or(ValidityError::MissingCorridor(time))?;
            if !bound.contains(value as i64) {
                return Err(ValidityError::Power { at: time, power: value, bound });
            }
            time = next;
        }
    }

    fn check_energy(&self, power: &PowerProfile) -> Result<(), ValidityError> {
        let mut time = 0;
        let mut energy: i64 = 0;
        loop {
            let Some(next) = next_breakpoint(&[power.higher_key(time), self.energy_corridor.higher_key(time)])
            else {
                return Ok(());
            };
            let value = power.floor_value(time).copied().unwrap_or(0);
            energy += value as i64 * (next - time) as i64;
            let bound = self
                .energy_constraint(next)
                .ok_or(ValidityError::MissingCorridor(next))?;
            if !bound.contains(energy) {
                return Err(ValidityError::Energy { at: next, energy, bound });
            }
            time = next;
        }
    }

    /// Energy bound at `time`, interpolated between the bracketing keys and
    /// held flat past the last one. `None` before the first key.
    pub fn energy_constraint(&self, time: i32) -> Option<IntInterval> {
        let (floor_time, floor) = self.energy_corridor.floor_entry(time)?;
        let Some((higher_time, higher)) = self.energy_corridor.higher_entry(time) else {
            return Some(*floor);
        };
        let factor = (time - floor_time) as f64 / (higher_time - floor_time) as f64;
        let lerp = |a: i32, b: i32| ((1.0 - factor) * a as f64 + factor * b as f64) as i32;
        Some(IntInterval::new(lerp(floor.min, higher.min), lerp(floor.max, higher.max)))
    }

    /// Energy still available at `time` once `power` has run up to it.
    pub fn residual_energy_constraint(&self, power: &PowerProfile, time: i32) -> Option<LongInterval> {
        let bound = self.energy_constraint(time)?;
        let energy = integrate(power, time);
        Some(LongInterval::new(bound.min as i64 - energy, bound.max as i64 - energy))
    }

    /// Slack left around a committed task, expressed as a flexibility whose
    /// corridors are relative to the task's own power and energy.
    pub fn determine_task_flexibility(&self, task: &Task) -> Flexibility {
        let end = task.end();
        let mut result = Flexibility {
            id: self.id,
            task_id: task.id,
            adaptable: self.adaptable,
            stopping_time: LongInterval::new(end, end),
            running_time: IntInterval::new(task.running_time, task.running_time),
            power_corridor: Corridor::new(),
            energy_corridor: Corridor::new(),
        };

        let mut time = 0;
        let mut energy: i64 = 0;
        loop {
            let value = task.power.floor_value(time).copied().unwrap_or(0);
            let power_bound = self
                .power_corridor
                .floor_value(time)
                .copied()
                .unwrap_or(IntInterval::ZERO);
            let energy_bound = self.energy_constraint(time).unwrap_or(IntInterval::UNBOUNDED);
            result.power_corridor.insert(time, power_bound.shifted(-(value as i64)));
            result.energy_corridor.insert(time, energy_bound.shifted(-energy));

            let Some(next) = next_breakpoint(&[
                task.power.higher_key(time),
                self.power_corridor.higher_key(time),
                self.energy_corridor.higher_key(time),
            ]) else {
                break;
            };
            energy += value as i64 * (next - time) as i64;
            time = next;
        }
        result
    }
}

fn next_breakpoint(candidates: &[Option<i32>]) -> Option<i32> {
    candidates.iter().flatten().min().copied()
}

/// Energy in Ws delivered by `power` over `[0, until)`.
pub fn integrate(power: &PowerProfile, until: i32) -> i64 {
    let mut time = 0;
    let mut energy: i64 = 0;
    while time < until {
        let value = power.floor_value(time).copied().unwrap_or(0);
        let next = power.higher_key(time).map_or(until, |k| k.min(until));
        energy += value as i64 * (next - time) as i64;
        time = next;
    }
    energy
}
