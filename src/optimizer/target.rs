use tracing::info;

use super::allocation::{allocate, AllocationWindow};
use super::types::{check_forecasts, OptimizerError, TargetScheduleProblem, TargetScheduleSolution};

/// Steers the site towards an externally agreed schedule. Slot 0 of the
/// forecasts is the slot containing `from`, which is mapped onto the target
/// schedule's own grid.
#[derive(Debug, Default, Clone, Copy)]
pub struct TargetComplianceOptimizer;

impl TargetComplianceOptimizer {
    pub fn solve(&self, problem: &TargetScheduleProblem) -> Result<TargetScheduleSolution, OptimizerError> {
        let slot_length = problem.slot_length;
        if slot_length <= 0 {
            return Err(OptimizerError::InvalidSlotLength(slot_length));
        }
        if problem.target_schedule.slot_length != slot_length {
            return Err(OptimizerError::SlotLengthMismatch {
                problem: slot_length,
                target: problem.target_schedule.slot_length,
            });
        }
        if problem.to <= problem.from {
            return Err(OptimizerError::EmptyWindow { from: problem.from, to: problem.to });
        }
        check_forecasts(&problem.electricity_demand, &problem.electricity_production)?;

        let target_slot_offset =
            (problem.current_slot_begin - problem.target_schedule.starting_time).div_euclid(slot_length);
        info!(
            from = problem.from,
            to = problem.to,
            target_slot_offset,
            devices = problem.schedules.len(),
            "starting target schedule optimization"
        );

        let mut total: Vec<i64> = problem
            .electricity_demand
            .iter()
            .zip(&problem.electricity_production)
            .map(|(d, p)| *d as i64 + *p as i64)
            .collect();
        let target: Vec<Option<i64>> = (0..total.len())
            .map(|i| {
                let index = i as i64 + target_slot_offset;
                usize::try_from(index)
                    .ok()
                    .and_then(|index| problem.target_schedule.net(index))
                    .map(i64::from)
            })
            .collect();

        let window = AllocationWindow {
            origin: problem.current_slot_begin,
            from: problem.from,
            to: problem.to,
            slot_length,
            earliest_modifiable: problem.from + problem.optimization_time_buffer,
            buffer: problem.flexibility_adaption_buffer,
        };
        let tasks = allocate(&window, &target, &mut total, &problem.schedules);

        // both figures describe the planned net exchange over the whole window
        let mut expected_cumulative_deviation = 0;
        let mut expected_maximum_deviation: i64 = 0;
        for net in &total {
            expected_cumulative_deviation += net.abs();
            if net.abs() > expected_maximum_deviation.abs() {
                expected_maximum_deviation = *net;
            }
        }

        info!(
            cumulative_deviation_wh = expected_cumulative_deviation,
            maximum_deviation_wh = expected_maximum_deviation,
            "finished target schedule optimization"
        );
        Ok(TargetScheduleSolution {
            from: problem.from,
            to: problem.to,
            tasks,
            expected_cumulative_deviation,
            expected_maximum_deviation,
        })
    }
}
