use tracing::info;

use super::aggregate::aggregate;
use super::allocation::{allocate, AllocationWindow};
use super::types::{check_forecasts, OptimizerError, SchedulingProblem, SchedulingSolution};
use crate::domain::PublicSchedule;

/// Steers the site's net exchange towards zero in every slot, using the
/// flexibilities in device order.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfConsumptionOptimizer;

impl SelfConsumptionOptimizer {
    pub fn solve(&self, problem: &SchedulingProblem, timestamp: i64) -> Result<SchedulingSolution, OptimizerError> {
        if problem.slot_length <= 0 {
            return Err(OptimizerError::InvalidSlotLength(problem.slot_length));
        }
        if problem.to <= problem.from {
            return Err(OptimizerError::EmptyWindow { from: problem.from, to: problem.to });
        }
        check_forecasts(&problem.electricity_demand, &problem.electricity_production)?;
        info!(
            from = problem.from,
            to = problem.to,
            devices = problem.schedules.len(),
            "starting self-consumption optimization"
        );

        let mut total: Vec<i64> = problem
            .electricity_demand
            .iter()
            .zip(&problem.electricity_production)
            .map(|(d, p)| *d as i64 + *p as i64)
            .collect();
        let target = vec![Some(0); total.len()];

        let window = AllocationWindow {
            origin: problem.from,
            from: problem.from,
            to: problem.to,
            slot_length: problem.slot_length,
            earliest_modifiable: problem.from,
            buffer: problem.flexibility_adaption_buffer,
        };
        let tasks = allocate(&window, &target, &mut total, &problem.schedules);

        let mut schedule = PublicSchedule::zero(timestamp, problem.from, problem.slot_length, total.len());
        for (i, net) in total.iter().enumerate() {
            let production = problem.electricity_production[i];
            schedule.consumption[i] = (net - production as i64) as i32;
            schedule.production[i] = production;
        }

        let expected_electricity_bought = total.iter().filter(|v| **v > 0).sum();
        let expected_electricity_sold = total.iter().filter(|v| **v < 0).map(|v| -v).sum();

        let flexibility = aggregate(
            &window,
            total.len(),
            &tasks,
            &problem.schedules,
            timestamp,
        );

        info!(
            bought_wh = expected_electricity_bought,
            sold_wh = expected_electricity_sold,
            "finished self-consumption optimization"
        );
        Ok(SchedulingSolution {
            from: problem.from,
            to: problem.to,
            tasks,
            schedule,
            flexibility,
            expected_electricity_bought,
            expected_electricity_sold,
        })
    }
}
