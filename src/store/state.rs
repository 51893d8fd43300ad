//! Persisted per-device scheduling state and the rules that mutate it.
//!
//! Everything here is synchronous and takes the current time and measured
//! stored energy as arguments; [`super::DeviceScheduleStore`] supplies them
//! under its mutex.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::StoreError;
use crate::clock::{start_of_day, start_of_next_day};
use crate::config::DeviceConfig;
use crate::domain::{
    idle_profile, saturate, Flexibility, IntInterval, LongInterval, PowerProfile, PowerTimeline,
    ScheduleSummary, SchedulingResult, StepMap, Task,
};

/// Longest window `get_schedule` serves.
pub const MAX_SCHEDULE_RANGE: i64 = 2 * 86_400;
/// Age after which committed setpoints are dropped from the timeline.
const TIMELINE_RETENTION: i64 = 86_400;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreState {
    pub id_counter: i32,
    /// Requested state of charge in percent, 0 when unset.
    pub target_soc: i32,
    pub target_soc_time: i64,
    pub flexibilities: BTreeMap<i32, Flexibility>,
    pub tasks: BTreeMap<i32, Task>,
    /// Committed setpoints of the device, union of all tasks.
    pub scheduled_power: PowerTimeline,
}

impl StoreState {
    pub fn target_soc_active(&self, now: i64) -> bool {
        self.target_soc > 0 && now < self.target_soc_time
    }

    pub fn task_id_for_time(&self, time: i64, end_inclusive: bool) -> Option<i32> {
        self.tasks
            .values()
            .find(|t| {
                t.starting_time <= time && (time < t.end() || (end_inclusive && time == t.end()))
            })
            .map(|t| t.id)
    }

    pub fn scheduled_power_at(&self, time: i64) -> i32 {
        self.scheduled_power.floor_value(time).copied().unwrap_or(0)
    }

    /// Stored energy in Wh expected at `time` when the committed timeline is
    /// followed from `now` on, starting from `current_wh`.
    pub fn expected_stored_energy(&self, now: i64, time: i64, current_wh: i64) -> i64 {
        let mut t = now;
        let mut energy_ws: i64 = 0;
        while t < time {
            let next = self.scheduled_power.higher_key(t).map_or(time, |k| k.min(time));
            energy_ws += self.scheduled_power_at(t) as i64 * (next - t);
            t = next;
        }
        current_wh + energy_ws / 3600
    }

    fn next_id(&mut self) -> i32 {
        loop {
            let id = self.id_counter;
            self.id_counter = if id == i32::MAX { 0 } else { id + 1 };
            if !self.flexibilities.contains_key(&id) && !self.tasks.contains_key(&id) {
                return id;
            }
        }
    }

    /// Creates the flexibility and idle task covering `[day_start, day_end)`
    /// unless one exists already. Returns the task id.
    pub fn add_flexibility_for_day(&mut self, day_start: i64, day_end: i64, stored_wh: i64, cfg: &DeviceConfig) -> i32 {
        if let Some(id) = self.task_id_for_time(day_start, false) {
            return id;
        }

        let id = self.next_id();
        let running_time = (day_end - day_start) as i32;
        let flexibility = Flexibility {
            id,
            task_id: id,
            adaptable: true,
            stopping_time: LongInterval::new(day_end, day_end),
            running_time: IntInterval::new(running_time, running_time),
            power_corridor: [(0, power_range(cfg))].into_iter().collect(),
            energy_corridor: [(0, energy_window(stored_wh, cfg))].into_iter().collect(),
        };
        let task = Task::idle(id, id, true, day_start, running_time);

        self.scheduled_power.entry(day_start).or_insert(0);
        self.flexibilities.insert(id, flexibility);
        self.tasks.insert(id, task);
        info!(flexibility = id, day_start, day_end, "created daily flexibility");
        id
    }

    /// Re-derives the corridors of a task that has already started: nothing
    /// before now (or before an active state-of-charge target) is offered,
    /// energy from then on is bounded by the live stored energy.
    fn refresh_started(&mut self, task_id: i32, now: i64, current_wh: i64, cfg: &DeviceConfig) {
        let Some(task) = self.tasks.get(&task_id) else { return };
        let offer_from = if self.target_soc_active(now) { self.target_soc_time } else { now };
        let relative = (offer_from - task.starting_time).clamp(0, task.running_time as i64) as i32;
        let stored = self.expected_stored_energy(now, offer_from, current_wh);
        let flexibility_id = task.flexibility_id;

        let Some(flexibility) = self.flexibilities.get_mut(&flexibility_id) else { return };
        flexibility.power_corridor.clear();
        flexibility.power_corridor.insert(0, IntInterval::ZERO);
        flexibility.power_corridor.insert(relative, power_range(cfg));

        flexibility.energy_corridor.clear();
        flexibility.energy_corridor.insert(0, IntInterval::UNBOUNDED);
        flexibility.energy_corridor.insert((relative - 1).max(0), IntInterval::UNBOUNDED);
        flexibility.energy_corridor.insert(relative, energy_window(stored, cfg));
    }

    /// Re-derives the corridors of a task that lies in the future from the
    /// energy expected at its start.
    fn refresh_future(&mut self, task_id: i32, now: i64, current_wh: i64, cfg: &DeviceConfig) {
        let Some(task) = self.tasks.get(&task_id) else { return };
        let start = task.starting_time;
        let running_time = task.running_time as i64;
        let stored = self.expected_stored_energy(now, start, current_wh);
        let blocked_until = (self.target_soc_active(now) && start < self.target_soc_time)
            .then(|| (self.target_soc_time - start).clamp(0, running_time) as i32);
        let flexibility_id = task.flexibility_id;

        let Some(flexibility) = self.flexibilities.get_mut(&flexibility_id) else { return };
        flexibility.power_corridor.clear();
        match blocked_until {
            Some(relative) => {
                flexibility.power_corridor.insert(0, IntInterval::ZERO);
                flexibility.power_corridor.insert(relative, power_range(cfg));
            }
            None => {
                flexibility.power_corridor.insert(0, power_range(cfg));
            }
        }
        flexibility.energy_corridor.clear();
        flexibility.energy_corridor.insert(0, energy_window(stored, cfg));
    }

    /// Ids of the daily task(s) covering `[from, to]`, creating missing days
    /// and refreshing their corridors against the live state.
    #[allow(clippy::too_many_arguments)]
    pub fn get_schedule(
        &mut self,
        uuid: Uuid,
        from: i64,
        to: i64,
        now: i64,
        current_wh: i64,
        tz: &Tz,
        cfg: &DeviceConfig,
    ) -> Result<ScheduleSummary, StoreError> {
        if to < from {
            return Err(StoreError::EmptyRange { from, to });
        }
        if to - from > MAX_SCHEDULE_RANGE {
            return Err(StoreError::RangeTooLong { from, to });
        }

        let first = match self.task_id_for_time(from, false) {
            Some(id) => id,
            None => {
                let day_start = start_of_day(tz, from);
                let stored = self.expected_stored_energy(now, day_start, current_wh);
                self.add_flexibility_for_day(day_start, start_of_next_day(tz, from), stored, cfg)
            }
        };
        let last = match self.task_id_for_time(to, true) {
            Some(id) => id,
            None => {
                let day_start = start_of_day(tz, to);
                let stored = self.expected_stored_energy(now, day_start, current_wh);
                self.add_flexibility_for_day(day_start, start_of_next_day(tz, to), stored, cfg)
            }
        };

        let mut task_ids = vec![first];
        if last != first {
            task_ids.push(last);
        }

        let mut flexibility_ids = Vec::with_capacity(task_ids.len());
        for &id in &task_ids {
            let Some(task) = self.tasks.get(&id) else { continue };
            flexibility_ids.push(task.flexibility_id);
            if task.starting_time <= now {
                self.refresh_started(id, now, current_wh, cfg);
            } else {
                self.refresh_future(id, now, current_wh, cfg);
            }
        }

        Ok(ScheduleSummary {
            uuid,
            from,
            to,
            task_ids,
            flexibility_ids,
            constraints: Vec::new(),
        })
    }

    pub fn schedule_flexibility(&mut self, id: i32, starting_time: i64, power: PowerProfile, now: i64) -> SchedulingResult {
        let Some(flexibility) = self.flexibilities.get(&id) else {
            return SchedulingResult::UnknownFlexibility;
        };
        let Some(task) = self.tasks.get_mut(&flexibility.task_id) else {
            return SchedulingResult::UnknownTask;
        };
        if task.has_started(now) {
            return SchedulingResult::Illegal;
        }
        if let Err(e) = flexibility.validate(starting_time, &power) {
            warn!(flexibility = id, error = %e, "rejected schedule");
            return SchedulingResult::InvalidData;
        }

        clear_window(&mut self.scheduled_power, task.starting_time, task.end());
        task.starting_time = starting_time;
        task.running_time = power.keys().next_back().copied().unwrap_or(task.running_time);
        task.power = power;
        task.compress();
        write_profile(&mut self.scheduled_power, task);
        info!(flexibility = id, starting_time, "flexibility scheduled");
        SchedulingResult::Ok
    }

    /// Substitutes the `[first, last]` window of a running adaptable task.
    /// The value at `last` is restored from the current profile; the merged
    /// profile is validated as a whole before anything is committed.
    pub fn adapt_scheduled_flexibility(&mut self, id: i32, update: &PowerProfile) -> SchedulingResult {
        let Some(flexibility) = self.flexibilities.get(&id) else {
            return SchedulingResult::UnknownFlexibility;
        };
        if !flexibility.adaptable {
            return SchedulingResult::Illegal;
        }
        let Some(task) = self.tasks.get_mut(&flexibility.task_id) else {
            return SchedulingResult::UnknownTask;
        };
        let (Some(&first), Some(&last)) = (update.keys().next(), update.keys().next_back()) else {
            return SchedulingResult::InvalidData;
        };

        let mut update = update.clone();
        update.insert(last, task.power_at(last));

        let mut merged = task.power.clone();
        merged.retain(|k, _| *k < first || *k > last);
        merged.extend(update.iter().map(|(k, v)| (*k, *v)));

        if let Err(e) = flexibility.validate(task.starting_time, &merged) {
            debug!(flexibility = id, error = %e, "rejected adaptation");
            return SchedulingResult::InvalidData;
        }

        let start = task.starting_time;
        let end = task.end();
        clear_window(&mut self.scheduled_power, start + first as i64, start + last as i64);
        for (&offset, &value) in &update {
            let at = start + offset as i64;
            if at >= end {
                self.scheduled_power.entry(at).or_insert(value);
            } else {
                self.scheduled_power.insert(at, value);
            }
        }
        task.power = merged;
        task.compress();
        SchedulingResult::Ok
    }

    pub fn unschedule_flexibility(&mut self, id: i32, now: i64) -> SchedulingResult {
        let Some(flexibility) = self.flexibilities.get(&id) else {
            return SchedulingResult::UnknownFlexibility;
        };
        let Some(task) = self.tasks.get_mut(&flexibility.task_id) else {
            return SchedulingResult::UnknownTask;
        };
        if task.has_started(now) {
            return SchedulingResult::Illegal;
        }

        clear_window(&mut self.scheduled_power, task.starting_time, task.end());
        self.scheduled_power.insert(task.starting_time, 0);
        task.power = idle_profile(task.running_time);
        info!(flexibility = id, "flexibility unscheduled");
        SchedulingResult::Ok
    }

    /// Follows the timeline from `now`, integrating stored energy (Wh). The
    /// first breakpoint at which charging would exceed `max_wh` or
    /// discharging would undercut `min_wh` is set to 0 W in the timeline and
    /// in the owning task, and further violations are repaired the same way.
    /// Returns the earliest repaired breakpoint, 0 if nothing changed.
    pub fn fix_schedule(&mut self, now: i64, mut stored_wh: i64, min_wh: i64, max_wh: i64) -> i64 {
        let mut result = 0;
        let mut time = now;
        while let Some(next) = self.scheduled_power.higher_key(time) {
            let power = self.scheduled_power_at(time);
            let before = stored_wh;
            stored_wh += (next - time) * power as i64 / 3600;

            if (stored_wh > max_wh && power > 0) || (stored_wh < min_wh && power < 0) {
                self.scheduled_power.insert(time, 0);
                match self.task_id_for_time(time, false).and_then(|id| self.tasks.get_mut(&id)) {
                    Some(task) => {
                        task.power.insert((time - task.starting_time) as i32, 0);
                    }
                    None => warn!(time, "scheduled power without task"),
                }
                stored_wh = before;
                if result == 0 {
                    result = time;
                }
            }
            time = next;
        }

        if let Some(task) = self.task_id_for_time(now, false).and_then(|id| self.tasks.get_mut(&id)) {
            task.compress();
        }
        result
    }

    /// Drops finished tasks with their flexibilities and timeline entries
    /// older than a day. The setpoint in force at `now` is kept.
    pub fn prune(&mut self, now: i64) -> usize {
        let expired: Vec<(i32, i32)> = self
            .tasks
            .values()
            .filter(|t| now > t.end())
            .map(|t| (t.id, t.flexibility_id))
            .collect();
        for (task_id, flexibility_id) in &expired {
            debug!(task = task_id, "removing finished task and flexibility");
            self.tasks.remove(task_id);
            self.flexibilities.remove(flexibility_id);
        }
        self.flexibilities
            .retain(|_, f| !(f.is_free() && f.stopping_time.max < now));

        let in_force = self.scheduled_power.floor_entry(now).map(|(k, _)| k);
        self.scheduled_power
            .retain(|&k, _| k + TIMELINE_RETENTION >= now || Some(k) == in_force);
        expired.len()
    }

    /// Replaces the timeline between `now` and `time` with a constant
    /// charge or discharge that reaches `soc` percent, then idles.
    pub fn apply_target_soc(&mut self, soc: i32, time: i64, now: i64, current_soc: f64, cfg: &DeviceConfig) {
        self.target_soc = soc;
        self.target_soc_time = time;
        if time <= now {
            return;
        }

        let duration = time - now;
        let change_ws = ((soc as f64 - current_soc) * cfg.nominal_capacity as f64 * 36.0) as i64;
        let average = change_ws / duration;
        let power = round_away_from_zero(average, 100)
            .clamp(-(cfg.max_flexibility_discharge as i64), cfg.max_flexibility_charge as i64);

        clear_window(&mut self.scheduled_power, now, time);
        self.scheduled_power.insert(now, power as i32);
        if power != 0 {
            let needed = (change_ws.abs() + power.abs() - 1) / power.abs();
            if now + needed < time {
                self.scheduled_power.insert(now + needed, 0);
            }
        }
        self.scheduled_power.entry(time).or_insert(0);
        info!(soc, time, power, "state of charge target applied");
    }
}

fn power_range(cfg: &DeviceConfig) -> IntInterval {
    IntInterval::new(-cfg.max_flexibility_discharge, cfg.max_flexibility_charge)
}

/// Energy corridor bound in Ws for a device holding `stored_wh`. Always
/// contains 0.
fn energy_window(stored_wh: i64, cfg: &DeviceConfig) -> IntInterval {
    let buffer = cfg.flexibility_energy_buffer as i64;
    let available_energy = stored_wh - cfg.min_energy_wh() - buffer;
    let available_storage = cfg.max_energy_wh() - stored_wh - buffer;
    IntInterval::new(
        saturate((-available_energy * 3600).min(0)),
        saturate((available_storage * 3600).max(0)),
    )
}

fn round_away_from_zero(value: i64, step: i64) -> i64 {
    match value {
        v if v > 0 => (v + step - 1) / step * step,
        v if v < 0 => -((-v + step - 1) / step * step),
        _ => 0,
    }
}

/// Removes timeline entries in `[from, to)`.
fn clear_window(timeline: &mut PowerTimeline, from: i64, to: i64) {
    if from >= to {
        return;
    }
    let keys: Vec<i64> = timeline
        .range((Included(from), Excluded(to)))
        .map(|(k, _)| *k)
        .collect();
    for key in keys {
        timeline.remove(&key);
    }
}

/// Writes a task's profile into the timeline. The end marker never
/// overwrites a breakpoint that is already there.
fn write_profile(timeline: &mut PowerTimeline, task: &Task) {
    let last = task.power.keys().next_back().copied();
    for (&offset, &value) in &task.power {
        let at = task.starting_time + offset as i64;
        if Some(offset) == last {
            timeline.entry(at).or_insert(value);
        } else {
            timeline.insert(at, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::UTC;

    const DAY: i64 = 1_699_920_000; // 2023-11-14T00:00:00Z

    fn cfg() -> DeviceConfig {
        DeviceConfig {
            uuid: Uuid::nil(),
            state_file: String::new(),
            nominal_capacity: 6000,
            min_state_of_charge: 10,
            max_state_of_charge: 90,
            max_flexibility_charge: 2000,
            max_flexibility_discharge: 2000,
            flexibility_energy_buffer: 100,
            maintenance_period_seconds: 9,
        }
    }

    #[test]
    fn test_get_schedule_creates_one_task_per_day() {
        let mut state = StoreState::default();
        let now = DAY + 3600;
        let summary = state
            .get_schedule(Uuid::nil(), now, now + 7200, now, 3000, &UTC, &cfg())
            .unwrap();
        assert_eq!(summary.task_ids.len(), 1);
        let task = &state.tasks[&summary.task_ids[0]];
        assert_eq!(task.starting_time, DAY);
        assert_eq!(task.running_time, 86_400);
        assert_eq!(state.scheduled_power.get(&DAY), Some(&0));

        let summary = state
            .get_schedule(Uuid::nil(), now, DAY + 86_400 + 600, now, 3000, &UTC, &cfg())
            .unwrap();
        assert_eq!(summary.task_ids.len(), 2);
        assert_eq!(state.tasks.len(), 2);
    }

    #[test]
    fn test_get_schedule_rejects_long_range() {
        let mut state = StoreState::default();
        let err = state
            .get_schedule(Uuid::nil(), DAY, DAY + MAX_SCHEDULE_RANGE + 1, DAY, 3000, &UTC, &cfg())
            .unwrap_err();
        assert!(matches!(err, StoreError::RangeTooLong { .. }));
    }

    #[test]
    fn test_started_day_corridors_collapse_past() {
        let mut state = StoreState::default();
        let now = DAY + 3600;
        let summary = state
            .get_schedule(Uuid::nil(), now, now + 900, now, 3000, &UTC, &cfg())
            .unwrap();
        let flex = &state.flexibilities[&summary.flexibility_ids[0]];
        assert_eq!(flex.power_corridor[&0], IntInterval::ZERO);
        assert_eq!(flex.power_corridor[&3600], IntInterval::new(-2000, 2000));
        assert_eq!(flex.energy_corridor[&3599], IntInterval::UNBOUNDED);
        // 3000 Wh stored, 600 Wh floor, 5400 Wh ceiling, 100 Wh buffer
        assert_eq!(
            flex.energy_corridor[&3600],
            IntInterval::new(-2300 * 3600, 2300 * 3600)
        );
    }

    #[test]
    fn test_schedule_requires_unstarted_task() {
        let mut state = StoreState::default();
        let now = DAY + 3600;
        state
            .get_schedule(Uuid::nil(), now, DAY + 86_400 + 10, now, 3000, &UTC, &cfg())
            .unwrap();
        let today = state.task_id_for_time(now, false).unwrap();
        let tomorrow = state.task_id_for_time(DAY + 86_400, false).unwrap();

        let power: PowerProfile = [(0, 500), (3600, 0), (86_400, 0)].into_iter().collect();
        assert_eq!(
            state.schedule_flexibility(today, DAY, power.clone(), now),
            SchedulingResult::Illegal
        );
        assert_eq!(
            state.schedule_flexibility(99, DAY, power.clone(), now),
            SchedulingResult::UnknownFlexibility
        );
        assert_eq!(
            state.schedule_flexibility(tomorrow, DAY + 86_400, power, now),
            SchedulingResult::Ok
        );
        assert_eq!(state.scheduled_power_at(DAY + 86_400 + 10), 500);
        assert_eq!(state.scheduled_power_at(DAY + 86_400 + 3600), 0);
        assert_eq!(state.tasks[&tomorrow].power.len(), 3);
    }

    #[test]
    fn test_schedule_rejects_invalid_profile() {
        let mut state = StoreState::default();
        let now = DAY + 3600;
        state
            .get_schedule(Uuid::nil(), now, DAY + 86_400 + 10, now, 3000, &UTC, &cfg())
            .unwrap();
        let tomorrow = state.task_id_for_time(DAY + 86_400, false).unwrap();
        let power: PowerProfile = [(0, 2500), (86_400, 0)].into_iter().collect();
        assert_eq!(
            state.schedule_flexibility(tomorrow, DAY + 86_400, power, now),
            SchedulingResult::InvalidData
        );
        assert_eq!(state.scheduled_power_at(DAY + 86_400 + 10), 0);
    }

    #[test]
    fn test_adapt_is_all_or_nothing() {
        let mut state = StoreState::default();
        let now = DAY + 3600;
        let summary = state
            .get_schedule(Uuid::nil(), now, now + 900, now, 3000, &UTC, &cfg())
            .unwrap();
        let id = summary.flexibility_ids[0];

        let update: PowerProfile = [(3600, 1000), (3680, 0)].into_iter().collect();
        assert_eq!(state.adapt_scheduled_flexibility(id, &update), SchedulingResult::Ok);
        assert_eq!(state.tasks[&id].power_at(3600), 1000);
        assert_eq!(state.tasks[&id].power_at(3680), 0);
        assert_eq!(state.scheduled_power_at(now + 10), 1000);
        assert_eq!(state.scheduled_power_at(now + 80), 0);

        // before now the corridor is [0, 0]
        let before = state.tasks[&id].clone();
        let update: PowerProfile = [(100, 1000), (180, 0)].into_iter().collect();
        assert_eq!(
            state.adapt_scheduled_flexibility(id, &update),
            SchedulingResult::InvalidData
        );
        assert_eq!(state.tasks[&id], before);
    }

    #[test]
    fn test_adapt_refused_for_fixed_flexibility() {
        let mut state = StoreState::default();
        let now = DAY + 3600;
        let summary = state
            .get_schedule(Uuid::nil(), now, now + 900, now, 3000, &UTC, &cfg())
            .unwrap();
        let id = summary.flexibility_ids[0];
        state.flexibilities.get_mut(&id).unwrap().adaptable = false;
        let before = state.clone();

        let update: PowerProfile = [(3600, 1000), (3680, 0)].into_iter().collect();
        assert_eq!(state.adapt_scheduled_flexibility(id, &update), SchedulingResult::Illegal);
        assert_eq!(state, before);
    }

    #[test]
    fn test_unschedule_resets_profile() {
        let mut state = StoreState::default();
        let now = DAY + 3600;
        state
            .get_schedule(Uuid::nil(), now, DAY + 86_400 + 10, now, 3000, &UTC, &cfg())
            .unwrap();
        let tomorrow = state.task_id_for_time(DAY + 86_400, false).unwrap();
        let power: PowerProfile = [(0, 500), (3600, 0), (86_400, 0)].into_iter().collect();
        state.schedule_flexibility(tomorrow, DAY + 86_400, power, now);

        assert_eq!(state.unschedule_flexibility(tomorrow, now), SchedulingResult::Ok);
        assert_eq!(state.tasks[&tomorrow].power, idle_profile(86_400));
        assert_eq!(state.scheduled_power_at(DAY + 86_400 + 10), 0);

        let today = state.task_id_for_time(now, false).unwrap();
        assert_eq!(state.unschedule_flexibility(today, now), SchedulingResult::Illegal);
    }

    #[test]
    fn test_fix_schedule_repairs_first_overcharge() {
        let mut state = StoreState::default();
        let now = DAY + 3600;
        state
            .get_schedule(Uuid::nil(), now, now + 10, now, 3000, &UTC, &cfg())
            .unwrap();
        let id = state.task_id_for_time(now, false).unwrap();
        // charge 2000 W for two hours starting at now + 1 h
        state.scheduled_power.insert(now + 3600, 2000);
        state.scheduled_power.insert(now + 3 * 3600, 0);
        state.tasks.get_mut(&id).unwrap().power.insert(7200, 2000);
        state.tasks.get_mut(&id).unwrap().power.insert(14_400, 0);

        // 4000 Wh stored, 5400 Wh max: the 2 h charge overshoots
        let repaired = state.fix_schedule(now, 4000, 600, 5400);
        assert_eq!(repaired, now + 3600);
        assert_eq!(state.scheduled_power_at(now + 3600), 0);
        assert_eq!(state.tasks[&id].power_at(7200), 0);

        assert_eq!(state.fix_schedule(now, 4000, 600, 5400), 0);
    }

    #[test]
    fn test_fix_schedule_repairs_first_deep_discharge() {
        let mut state = StoreState::default();
        let now = DAY + 3600;
        state
            .get_schedule(Uuid::nil(), now, now + 10, now, 1000, &UTC, &cfg())
            .unwrap();
        let id = state.task_id_for_time(now, false).unwrap();
        // -300 W for an hour, then -2000 W for an hour
        for (offset, power) in [(3600, -300), (7200, -2000), (10_800, 0)] {
            state.scheduled_power.insert(now + offset, power);
            state.tasks.get_mut(&id).unwrap().power.insert((3600 + offset) as i32, power);
        }

        // 1000 Wh stored, 600 Wh min: 700 Wh after the first hour, the second would go negative
        let repaired = state.fix_schedule(now, 1000, 600, 5400);
        assert_eq!(repaired, now + 7200);
        assert_eq!(state.scheduled_power_at(now + 3600), -300);
        assert_eq!(state.scheduled_power_at(now + 7200), 0);
        assert_eq!(state.tasks[&id].power_at(7200), -300);
        assert_eq!(state.tasks[&id].power_at(10_800), 0);

        assert_eq!(state.fix_schedule(now, 1000, 600, 5400), 0);
    }

    #[test]
    fn test_expected_stored_energy_follows_timeline() {
        let mut state = StoreState::default();
        state.scheduled_power.insert(0, 0);
        state.scheduled_power.insert(3600, -1000);
        state.scheduled_power.insert(5400, 0);
        assert_eq!(state.expected_stored_energy(0, 1800, 2000), 2000);
        assert_eq!(state.expected_stored_energy(0, 7200, 2000), 1500);
        assert_eq!(state.expected_stored_energy(0, 4500, 2000), 1750);
        assert_eq!(state.expected_stored_energy(9000, 100, 2000), 2000);
    }

    #[test]
    fn test_prune_drops_finished_days() {
        let mut state = StoreState::default();
        let now = DAY + 3600;
        state
            .get_schedule(Uuid::nil(), now, now + 10, now, 3000, &UTC, &cfg())
            .unwrap();
        state.scheduled_power.insert(DAY + 7200, 300);

        let later = DAY + 3 * 86_400;
        assert_eq!(state.prune(later), 1);
        assert!(state.tasks.is_empty());
        assert!(state.flexibilities.is_empty());
        assert_eq!(state.scheduled_power.len(), 1);
        assert_eq!(state.scheduled_power_at(later), 300);
    }

    #[test]
    fn test_target_soc_blocks_offer_and_schedules_charge() {
        let mut state = StoreState::default();
        let now = DAY + 3600;
        // 50 % -> 60 % of 6000 Wh = 600 Wh within 2 h
        state.apply_target_soc(60, now + 7200, now, 50.0, &cfg());
        assert_eq!(state.scheduled_power_at(now), 300);
        assert_eq!(state.scheduled_power_at(now + 7199), 300);
        assert_eq!(state.scheduled_power_at(now + 7200), 0);

        let summary = state
            .get_schedule(Uuid::nil(), now, now + 10, now, 3000, &UTC, &cfg())
            .unwrap();
        let flex = &state.flexibilities[&summary.flexibility_ids[0]];
        assert_eq!(flex.power_corridor.floor_value(3600 + 7199), Some(&IntInterval::ZERO));
        assert_eq!(flex.power_corridor[&(3600 + 7200)], IntInterval::new(-2000, 2000));
    }

    #[test]
    fn test_round_away_from_zero() {
        assert_eq!(round_away_from_zero(1, 100), 100);
        assert_eq!(round_away_from_zero(-101, 100), -200);
        assert_eq!(round_away_from_zero(300, 100), 300);
        assert_eq!(round_away_from_zero(0, 100), 0);
    }
}
