use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::flexibility::Flexibility;
use super::task::Task;
use super::types::IntInterval;

/// Outcome of a schedule mutation on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum SchedulingResult {
    Ok,
    /// Not permitted in the task's current phase.
    Illegal,
    /// Profile does not fit the flexibility.
    InvalidData,
    /// Reserved; no current code path produces it.
    Conflict,
    UnknownFlexibility,
    UnknownTask,
    Fail,
}

impl SchedulingResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, SchedulingResult::Ok)
    }
}

/// Identifiers a device reports for a requested time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSummary {
    pub uuid: Uuid,
    pub from: i64,
    pub to: i64,
    pub task_ids: Vec<i32>,
    pub flexibility_ids: Vec<i32>,
    pub constraints: Vec<String>,
}

/// Snapshot of one device's tasks and flexibilities, assembled from a
/// [`ScheduleSummary`] and the objects it references.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScheduleData {
    pub uuid: Uuid,
    pub from: i64,
    pub to: i64,
    pub tasks: Vec<Task>,
    pub flexibilities: Vec<Flexibility>,
    pub constraints: Vec<String>,
}

impl ScheduleData {
    pub fn flexibility(&self, id: i32) -> Option<&Flexibility> {
        self.flexibilities.iter().find(|f| f.id == id)
    }
}

/// Net site schedule in Wh per slot. Consumption is positive, production
/// negative.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PublicSchedule {
    pub timestamp: i64,
    pub starting_time: i64,
    pub slot_length: i64,
    pub consumption: Vec<i32>,
    pub production: Vec<i32>,
    pub flexible_consumption: Vec<i32>,
    pub flexible_production: Vec<i32>,
}

impl PublicSchedule {
    /// Schedule of `slots` zero slots, used as a self-consumption target.
    pub fn zero(timestamp: i64, starting_time: i64, slot_length: i64, slots: usize) -> Self {
        Self {
            timestamp,
            starting_time,
            slot_length,
            consumption: vec![0; slots],
            production: vec![0; slots],
            flexible_consumption: vec![0; slots],
            flexible_production: vec![0; slots],
        }
    }

    pub fn slots(&self) -> usize {
        self.consumption.len()
    }

    pub fn end(&self) -> i64 {
        self.starting_time + self.slot_length * self.slots() as i64
    }

    /// Net target of slot `i` summed over all four series.
    pub fn net(&self, i: usize) -> Option<i32> {
        let pick = |series: &Vec<i32>| series.get(i).copied().unwrap_or(0);
        (i < self.slots()).then(|| {
            pick(&self.consumption)
                + pick(&self.production)
                + pick(&self.flexible_consumption)
                + pick(&self.flexible_production)
        })
    }
}

/// Aggregated residual flexibility of the site, one entry per slot.
/// Power in W, energy in Wh.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PublicFlexibility {
    pub timestamp: i64,
    pub starting_time: i64,
    pub slot_length: i64,
    pub power_corridor: Vec<IntInterval>,
    pub energy_corridor: Vec<IntInterval>,
}

/// Average values in W since the previous monitoring tick.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MonitoringData {
    pub consumption: f64,
    pub production: f64,
    pub battery: f64,
    pub schedule: f64,
}

impl MonitoringData {
    /// Positive when the site should consume more.
    pub fn difference(&self) -> f64 {
        self.schedule - (self.consumption + self.production + self.battery)
    }
}
