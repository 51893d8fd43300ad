use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::publish::PublicationRequest;
use crate::domain::{PublicSchedule, StepMap};

/// Persisted part of the site scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Agreed target schedules by starting time.
    pub target_schedules: BTreeMap<i64, PublicSchedule>,
    pub most_recent_target_optimization: i64,
    /// End of the window covered by the latest accepted initial schedule.
    pub latest_initial_publication: i64,
    pub latest_update_publication: i64,
    pub incomplete_publications: Vec<PublicationRequest>,
}

impl SchedulerState {
    /// Target schedule covering `now`, if any.
    pub fn target_in_force(&self, now: i64) -> Option<&PublicSchedule> {
        self.target_schedules
            .floor_value(now)
            .filter(|schedule| schedule.end() > now)
    }

    pub fn add_target(&mut self, schedule: PublicSchedule) {
        self.target_schedules.insert(schedule.starting_time, schedule);
    }

    /// Drops targets that ended before `now`. Returns how many were removed.
    pub fn prune_targets(&mut self, now: i64) -> usize {
        let before = self.target_schedules.len();
        self.target_schedules.retain(|_, schedule| schedule.end() > now);
        before - self.target_schedules.len()
    }

    pub fn mark_incomplete(&mut self, request: PublicationRequest) {
        if !self.incomplete_publications.contains(&request) {
            self.incomplete_publications.push(request);
        }
    }

    pub fn mark_complete(&mut self, request: &PublicationRequest) {
        self.incomplete_publications.retain(|r| r != request);
    }

    /// Incomplete publications that still cover a future window; expired
    /// ones are dropped.
    pub fn retryable_publications(&mut self, now: i64) -> Vec<PublicationRequest> {
        self.incomplete_publications.retain(|r| r.to > now);
        self.incomplete_publications.clone()
    }
}
