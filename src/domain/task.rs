use serde::{Deserialize, Serialize};

use super::types::{PowerProfile, StepMap};

/// Id of a task that was derived by an optimizer and is not yet known to
/// the device.
pub const UNREGISTERED_TASK: i32 = -1;

/// Concrete power profile chosen for a flexibility.
///
/// `power` maps seconds since `starting_time` to W. Its last key marks the
/// end of the profile and the value stored there carries no meaning.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Task {
    pub id: i32,
    pub flexibility_id: i32,
    pub adaptable: bool,
    pub starting_time: i64,
    pub running_time: i32,
    pub power: PowerProfile,
}

impl Task {
    /// A task that keeps the device idle for its whole running time.
    pub fn idle(id: i32, flexibility_id: i32, adaptable: bool, starting_time: i64, running_time: i32) -> Self {
        Self {
            id,
            flexibility_id,
            adaptable,
            starting_time,
            running_time,
            power: idle_profile(running_time),
        }
    }

    pub fn end(&self) -> i64 {
        self.starting_time + self.running_time as i64
    }

    pub fn has_started(&self, now: i64) -> bool {
        self.starting_time < now
    }

    pub fn is_running(&self, now: i64) -> bool {
        self.starting_time <= now && now < self.end()
    }

    pub fn power_at(&self, offset: i32) -> i32 {
        self.power.floor_value(offset).copied().unwrap_or(0)
    }

    /// Drops interior breakpoints that repeat the previous value. Key `0`,
    /// the running-time key and the last key always survive.
    pub fn compress(&mut self) {
        compress_profile(&mut self.power, self.running_time);
    }
}

pub fn idle_profile(running_time: i32) -> PowerProfile {
    let mut power = PowerProfile::new();
    power.insert(0, 0);
    power.insert(running_time, 0);
    power
}

pub fn compress_profile(power: &mut PowerProfile, running_time: i32) {
    let last = power.keys().next_back().copied();
    let mut previous: Option<i32> = None;
    power.retain(|&key, value| {
        let keep = key == 0 || key == running_time || Some(key) == last || previous != Some(*value);
        previous = Some(*value);
        keep
    });
}
