use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{PublicFlexibility, PublicSchedule, ScheduleData, Task};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptimizerError {
    #[error("slot length must be positive, got {0}")]
    InvalidSlotLength(i64),
    #[error("target schedule uses {target} s slots, problem uses {problem} s")]
    SlotLengthMismatch { problem: i64, target: i64 },
    #[error("forecast lengths differ: demand {demand}, production {production}")]
    ForecastLength { demand: usize, production: usize },
    #[error("optimization window {from}..{to} is empty")]
    EmptyWindow { from: i64, to: i64 },
}

/// Device schedules keyed by device. Iteration order is allocation order.
pub type Schedules = BTreeMap<Uuid, ScheduleData>;
pub type TaskPlan = BTreeMap<Uuid, Vec<Task>>;

/// Input of a self-consumption run. `from` is a slot start, forecasts hold
/// one Wh value per slot from `from` on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulingProblem {
    pub from: i64,
    pub to: i64,
    pub slot_length: i64,
    /// Wh per slot, positive.
    pub electricity_demand: Vec<i32>,
    /// Wh per slot, negative.
    pub electricity_production: Vec<i32>,
    pub schedules: Schedules,
    /// Ws kept free on both sides of every energy corridor.
    pub flexibility_adaption_buffer: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulingSolution {
    pub from: i64,
    pub to: i64,
    pub tasks: TaskPlan,
    pub schedule: PublicSchedule,
    pub flexibility: PublicFlexibility,
    /// Wh
    pub expected_electricity_bought: i64,
    /// Wh
    pub expected_electricity_sold: i64,
}

/// Input of a target-compliance run. Forecasts start at
/// `current_slot_begin`; allocation starts at `from`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetScheduleProblem {
    pub from: i64,
    pub to: i64,
    pub current_slot_begin: i64,
    pub slot_length: i64,
    pub electricity_demand: Vec<i32>,
    pub electricity_production: Vec<i32>,
    pub schedules: Schedules,
    pub target_schedule: PublicSchedule,
    /// Only tasks starting at or after `from + optimization_time_buffer` are
    /// replanned unless adaptable.
    pub optimization_time_buffer: i64,
    pub flexibility_adaption_buffer: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetScheduleSolution {
    pub from: i64,
    pub to: i64,
    pub tasks: TaskPlan,
    /// Sum of absolute per-slot deviations, Wh.
    pub expected_cumulative_deviation: i64,
    /// Per-slot deviation with the largest magnitude, sign kept, Wh.
    pub expected_maximum_deviation: i64,
}

pub(crate) fn check_forecasts(demand: &[i32], production: &[i32]) -> Result<(), OptimizerError> {
    if demand.len() != production.len() {
        return Err(OptimizerError::ForecastLength {
            demand: demand.len(),
            production: production.len(),
        });
    }
    Ok(())
}
