//! Site-level scheduler.
//!
//! Pulls device schedules, runs the optimizers, commits the resulting tasks
//! and publishes the site schedule. Optimizations only ever run on the
//! [`OptimizationQueue`] worker; everything else just queues work.

pub mod adapter;
pub mod index;
pub mod publish;
pub mod queue;
pub mod scheduler;
pub mod state;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{ceil_to_slot, next_local_time, slot_start, start_of_next_day, Clock};
use crate::config::SchedulerConfig;
use crate::domain::{MonitoringData, PublicSchedule, SchedulingResult};
use crate::forecast::ForecastEngine;
use crate::optimizer::{
    SchedulingProblem, Schedules, SelfConsumptionOptimizer, TargetComplianceOptimizer, TargetScheduleProblem,
    TargetScheduleSolution, TaskPlan,
};
use crate::rpc::{retrieve_schedules, DeviceTransport};
use crate::store::SnapshotFile;

pub use adapter::{AdaptationRound, RealTimeAdapter};
pub use index::{AdaptableEntry, AdaptableIndex};
pub use publish::{LoggingPublisher, PublicationKind, PublicationRequest, SchedulePublisher};
pub use queue::{Job, JobHandler, OptimizationQueue};
pub use scheduler::{
    forward_store_events, spawn_scheduler_tasks, MonitoringSource, PeriodicTaskConfig, TaskScheduler, TaskStatus,
};
pub use state::SchedulerState;

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// Newly agreed target schedule.
    TargetSchedule(PublicSchedule),
    Monitoring(MonitoringData),
    /// A device changed its committed schedule on its own.
    FlexibilitiesChanged { device: Uuid },
    /// Request to bring a storage to `soc` percent by `time`.
    TargetBatteryCharge { device: Uuid, soc: i32, time: i64 },
}

pub struct Scheduler {
    cfg: SchedulerConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn DeviceTransport>,
    forecasts: Arc<ForecastEngine>,
    publisher: Arc<dyn SchedulePublisher>,
    queue: Arc<OptimizationQueue>,
    adapter: RealTimeAdapter,
    index: Arc<Mutex<AdaptableIndex>>,
    snapshot: Arc<SnapshotFile>,
    state: Mutex<SchedulerState>,
    runtime: Handle,
    optimization: tokio::sync::Mutex<()>,
}

impl Scheduler {
    pub fn new(
        cfg: SchedulerConfig,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn DeviceTransport>,
        forecasts: Arc<ForecastEngine>,
        publisher: Arc<dyn SchedulePublisher>,
        runtime: Handle,
    ) -> Self {
        let snapshot = SnapshotFile::new(&cfg.state_file);
        let (state, status) = snapshot.load::<SchedulerState>();
        info!(
            ?status,
            targets = state.target_schedules.len(),
            incomplete = state.incomplete_publications.len(),
            "scheduler state ready"
        );

        let queue = Arc::new(OptimizationQueue::new(
            clock.clone(),
            cfg.minimum_compliance_optimization_interval,
            cfg.minimum_schedule_update_publication_interval,
        ));
        queue.restore_last_target_run(state.most_recent_target_optimization);

        let index = Arc::new(Mutex::new(AdaptableIndex::default()));
        let adapter = RealTimeAdapter::new(
            index.clone(),
            transport.clone(),
            queue.clone(),
            clock.clone(),
            cfg.flexibility_adaption_horizon,
            runtime.clone(),
        );

        Self {
            cfg,
            clock,
            transport,
            forecasts,
            publisher,
            queue,
            adapter,
            index,
            snapshot: Arc::new(snapshot),
            state: Mutex::new(state),
            runtime,
            optimization: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    pub fn queue(&self) -> &Arc<OptimizationQueue> {
        &self.queue
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn state(&self) -> SchedulerState {
        self.state.lock().clone()
    }

    pub fn adaptable_tasks(&self) -> usize {
        self.index.lock().len()
    }

    pub fn target_in_force(&self, now: i64) -> Option<PublicSchedule> {
        self.state.lock().target_in_force(now).cloned()
    }

    pub fn has_target(&self, now: i64) -> bool {
        self.state.lock().target_in_force(now).is_some()
    }

    fn update_state<R>(&self, f: impl FnOnce(&mut SchedulerState) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        self.persist(&state);
        result
    }

    /// Encodes `state` under the caller's lock and writes it in the
    /// background.
    fn persist(&self, state: &SchedulerState) {
        let staged = match self.snapshot.stage(state) {
            Ok(staged) => staged,
            Err(e) => {
                error!(error = %e, "failed to encode scheduler state");
                return;
            }
        };
        let snapshot = self.snapshot.clone();
        self.runtime.spawn(async move {
            if let Err(e) = snapshot.commit(staged).await {
                error!(error = %e, "failed to persist scheduler state");
            }
        });
    }

    pub async fn handle_event(&self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::TargetSchedule(schedule) => {
                info!(
                    starting_time = schedule.starting_time,
                    slots = schedule.slots(),
                    "target schedule received"
                );
                let now = self.clock.now();
                self.update_state(|state| {
                    state.prune_targets(now);
                    state.add_target(schedule);
                });
                self.queue.queue_target_optimization(true);
            }
            SchedulerEvent::Monitoring(data) => {
                let round = self.adapter.adapt(&data);
                if round.adjusted + round.rejected > 0 {
                    debug!(adjusted = round.adjusted, rejected = round.rejected, "adaptation round");
                }
            }
            SchedulerEvent::FlexibilitiesChanged { device } => {
                debug!(device = %device, "device flexibilities changed");
                self.queue.queue_target_optimization(false);
            }
            SchedulerEvent::TargetBatteryCharge { device, soc, time } => {
                match self.transport.set_target_soc(device, soc, time).await {
                    Ok(()) => {
                        info!(device = %device, soc, time, "battery charge target set");
                        self.queue.queue_target_optimization(false);
                    }
                    Err(e) => warn!(device = %device, error = %e, "could not set battery charge target"),
                }
            }
        }
    }

    async fn forecasts(&self, origin: i64, slots: usize) -> Result<(Vec<i32>, Vec<i32>)> {
        let demand = self.forecasts.demand(origin, self.cfg.slot_length, slots).await?;
        let production = self.forecasts.production(origin, self.cfg.slot_length, slots).await?;
        Ok((demand, production))
    }

    async fn schedules(&self, from: i64, to: i64) -> Schedules {
        retrieve_schedules(
            self.transport.as_ref(),
            &self.cfg.flexibility_providers,
            from,
            to,
            Duration::from_secs(self.cfg.rpc_timeout_seconds),
            self.cfg.max_concurrent_requests,
        )
        .await
    }

    fn slots_between(&self, from: i64, to: i64) -> usize {
        let slot_length = self.cfg.slot_length.max(1);
        ((to - from).max(0) + slot_length - 1).div_euclid(slot_length) as usize
    }

    /// Re-plans all flexibilities towards the target in force, or towards
    /// zero exchange until midnight without one. Returns `None` when nothing
    /// is left to plan.
    pub async fn optimize_target_schedule_compliance(&self) -> Result<Option<TargetScheduleSolution>> {
        let now = self.clock.now();
        let tz = self.cfg.timezone;
        let slot_length = self.cfg.slot_length;
        let from = now + self.cfg.optimization_time_buffer;
        let current_slot_begin = slot_start(&tz, from, slot_length);

        let target = {
            let mut state = self.state.lock();
            if state.prune_targets(now) > 0 {
                self.persist(&state);
            }
            state.target_in_force(from).cloned()
        };
        let (target_schedule, to) = match target {
            Some(target) => {
                let end = target.end();
                (target, end)
            }
            None => {
                let end = start_of_next_day(&tz, from);
                let slots = self.slots_between(current_slot_begin, end);
                debug!("no target schedule in force, optimizing for self-consumption");
                (PublicSchedule::zero(now, current_slot_begin, slot_length, slots), end)
            }
        };
        if to <= from {
            debug!(from, to, "optimization window already over");
            return Ok(None);
        }

        let slots = self.slots_between(current_slot_begin, to);
        let (demand, production) = self.forecasts(current_slot_begin, slots).await?;
        let schedules = self.schedules(from, to).await;

        let problem = TargetScheduleProblem {
            from,
            to,
            current_slot_begin,
            slot_length,
            electricity_demand: demand,
            electricity_production: production,
            schedules,
            target_schedule,
            optimization_time_buffer: self.cfg.optimization_time_buffer,
            flexibility_adaption_buffer: self.cfg.flexibility_adaption_buffer,
        };
        let solution = TargetComplianceOptimizer
            .solve(&problem)
            .context("target schedule optimization failed")?;
        self.schedule_tasks(&solution.tasks, &problem.schedules).await;
        self.update_state(|state| state.most_recent_target_optimization = now);

        info!(
            cumulative_deviation_wh = solution.expected_cumulative_deviation,
            maximum_deviation_wh = solution.expected_maximum_deviation,
            "target schedule optimization committed"
        );
        if solution.expected_maximum_deviation.abs() > self.cfg.schedule_deviation_reporting_threshold as i64 {
            self.queue.queue_schedule_publication(PublicationRequest {
                kind: PublicationKind::ScheduleUpdate,
                from,
                to,
            });
        }
        Ok(Some(solution))
    }

    /// Optimizes the requested window for self-consumption, commits it and
    /// publishes it. Updates are only sent when they leave the agreed target
    /// by more than the reporting threshold. Failed publications are kept
    /// for retry.
    pub async fn publish_schedule(&self, request: PublicationRequest) -> Result<()> {
        let now = self.clock.now();
        let slot_length = self.cfg.slot_length;
        let from = ceil_to_slot(&self.cfg.timezone, request.from.max(now), slot_length);
        let to = request.to;
        if to <= from {
            debug!(kind = %request.kind, from, to, "publication window already over");
            self.update_state(|state| state.mark_complete(&request));
            return Ok(());
        }

        let slots = self.slots_between(from, to);
        let (demand, production) = self.forecasts(from, slots).await?;
        let schedules = self.schedules(from, to).await;
        let problem = SchedulingProblem {
            from,
            to,
            slot_length,
            electricity_demand: demand,
            electricity_production: production,
            schedules,
            flexibility_adaption_buffer: self.cfg.flexibility_adaption_buffer,
        };
        let solution = SelfConsumptionOptimizer
            .solve(&problem, now)
            .context("self-consumption optimization failed")?;
        self.schedule_tasks(&solution.tasks, &problem.schedules).await;

        if request.kind == PublicationKind::ScheduleUpdate && !self.deviates_from_target(&solution.schedule) {
            debug!(from, to, "schedule within target, update not published");
            return Ok(());
        }

        if let Err(e) = self
            .publisher
            .publish(&solution.schedule, &solution.flexibility, request.kind)
            .await
        {
            warn!(kind = %request.kind, from, to, error = %e, "publication failed, will retry");
            self.update_state(|state| state.mark_incomplete(request));
            return Err(e.context("schedule publication failed"));
        }

        self.update_state(|state| {
            state.mark_complete(&request);
            match request.kind {
                PublicationKind::InitialSchedule => {
                    state.latest_initial_publication = state.latest_initial_publication.max(to);
                    state.add_target(solution.schedule.clone());
                }
                PublicationKind::ScheduleUpdate => state.latest_update_publication = now,
            }
        });
        info!(kind = %request.kind, from, to, "schedule publication complete");
        Ok(())
    }

    /// True when a slot of `schedule` differs from the target in force by
    /// more than the reporting threshold.
    fn deviates_from_target(&self, schedule: &PublicSchedule) -> bool {
        let Some(target) = self.target_in_force(schedule.starting_time) else {
            debug!("no target in force to compare the update with");
            return false;
        };
        let threshold = self.cfg.schedule_deviation_reporting_threshold as i64;
        (0..schedule.slots()).any(|i| {
            let time = schedule.starting_time + i as i64 * schedule.slot_length;
            let offset = (time - target.starting_time).div_euclid(target.slot_length.max(1));
            let planned = schedule.net(i).unwrap_or(0) as i64;
            usize::try_from(offset)
                .ok()
                .and_then(|j| target.net(j))
                .is_some_and(|agreed| (planned - agreed as i64).abs() > threshold)
        })
    }

    /// Commits a solution to the devices. Tasks that have not started are
    /// scheduled, running adaptable ones adapted. Adaptable tasks are
    /// recorded for the real-time adapter.
    pub async fn schedule_tasks(&self, plan: &TaskPlan, schedules: &Schedules) {
        let now = self.clock.now();
        let pruned = self.index.lock().prune(now);
        if pruned > 0 {
            debug!(pruned, "expired adaptable tasks removed");
        }

        for (device, tasks) in plan {
            for task in tasks {
                let result = if task.starting_time > now + 1 {
                    self.transport
                        .schedule_flexibility(*device, task.flexibility_id, task.starting_time, task.power.clone())
                        .await
                } else if task.adaptable {
                    self.transport
                        .adapt_flexibility(*device, task.flexibility_id, task.power.clone())
                        .await
                } else {
                    warn!(device = %device, flexibility = task.flexibility_id, "task already started and not adaptable");
                    continue;
                };

                match result {
                    Ok(SchedulingResult::Ok) => {
                        debug!(device = %device, flexibility = task.flexibility_id, "task committed");
                        if !task.adaptable {
                            continue;
                        }
                        match schedules.get(device).and_then(|d| d.flexibility(task.flexibility_id)) {
                            Some(flexibility) => self.index.lock().record(*device, task.clone(), flexibility.clone()),
                            None => warn!(device = %device, flexibility = task.flexibility_id, "flexibility of adaptable task unknown"),
                        }
                    }
                    Ok(result) => {
                        warn!(device = %device, flexibility = task.flexibility_id, %result, "device refused task");
                    }
                    Err(e) => {
                        error!(device = %device, flexibility = task.flexibility_id, error = %e, "could not commit task");
                        self.queue.queue_target_optimization(false);
                    }
                }
            }
        }
    }

    /// Day-ahead window whose initial schedule is due at the publication
    /// time following `now`.
    pub fn day_ahead_window(&self, now: i64) -> PublicationRequest {
        let tz = self.cfg.timezone;
        let from = start_of_next_day(&tz, now);
        PublicationRequest {
            kind: PublicationKind::InitialSchedule,
            from,
            to: start_of_next_day(&tz, from),
        }
    }

    /// Queues the startup optimization and, when today's publication time
    /// has passed without tomorrow's schedule being published, that
    /// publication.
    pub fn startup(&self) {
        let now = self.clock.now();
        self.queue.queue_target_optimization(false);

        let tz = self.cfg.timezone;
        let publication_passed = next_local_time(&tz, now, self.cfg.publication_time) >= start_of_next_day(&tz, now);
        let window = self.day_ahead_window(now);
        if publication_passed && self.state.lock().latest_initial_publication < window.to {
            info!(from = window.from, to = window.to, "initial publication overdue, catching up");
            self.queue.queue_schedule_publication(window);
        }
        self.retry_incomplete_publications();
    }

    /// Queues every incomplete publication that still covers the future.
    pub fn retry_incomplete_publications(&self) -> usize {
        let now = self.clock.now();
        let pending = self.update_state(|state| state.retryable_publications(now));
        for request in &pending {
            debug!(kind = %request.kind, from = request.from, "retrying publication");
            self.queue.queue_schedule_publication(*request);
        }
        pending.len()
    }
}

#[async_trait]
impl JobHandler for Scheduler {
    async fn handle(&self, job: Job) {
        let _running = self.optimization.lock().await;
        match job {
            Job::OptimizeTargetCompliance => {
                if let Err(e) = self.optimize_target_schedule_compliance().await {
                    error!(error = %e, "target schedule optimization failed");
                }
            }
            Job::Publish(request) => {
                if let Err(e) = self.publish_schedule(request).await {
                    error!(kind = %request.kind, error = %e, "schedule publication failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{Corridor, Flexibility, IntInterval, LongInterval, ScheduleSummary, Task};
    use crate::forecast::MockForecaster;
    use crate::rpc::{MockDeviceTransport, TransportError};
    use chrono::NaiveTime;
    use chrono_tz::UTC;
    use super::publish::MockSchedulePublisher;
    use tempfile::{tempdir, TempDir};

    // 2023-11-14T00:00:00Z
    const DAY: i64 = 1_699_920_000;
    const DEVICE: Uuid = Uuid::from_u128(5);

    fn cfg(dir: &TempDir) -> SchedulerConfig {
        SchedulerConfig {
            state_file: dir.path().join("scheduler.json").to_string_lossy().into_owned(),
            timezone: UTC,
            flexibility_providers: vec![DEVICE],
            consumption_meters: Vec::new(),
            production_meters: Vec::new(),
            slot_length: 900,
            flexibility_adaption_horizon: 80,
            adaption_interval_seconds: 60,
            minimum_compliance_optimization_interval: 900,
            minimum_schedule_update_publication_interval: 300,
            schedule_deviation_reporting_threshold: 250,
            flexibility_adaption_buffer: 0,
            optimization_time_buffer: 1,
            publication_retry_interval: 300,
            publication_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            rpc_timeout_seconds: 1,
            max_concurrent_requests: 4,
        }
    }

    fn build(
        dir: &TempDir,
        now: i64,
        transport: MockDeviceTransport,
        publisher: MockSchedulePublisher,
    ) -> (Scheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let scheduler = Scheduler::new(
            cfg(dir),
            clock.clone(),
            Arc::new(transport),
            Arc::new(ForecastEngine::new(Vec::new(), Vec::new())),
            Arc::new(publisher),
            Handle::current(),
        );
        (scheduler, clock)
    }

    fn day_flexibility(start: i64) -> Flexibility {
        Flexibility {
            id: 1,
            task_id: 1,
            adaptable: true,
            stopping_time: LongInterval::new(start + 86_400, start + 86_400),
            running_time: IntInterval::new(86_400, 86_400),
            power_corridor: Corridor::from([(0, IntInterval::new(-2000, 2000))]),
            energy_corridor: Corridor::from([(0, IntInterval::UNBOUNDED)]),
        }
    }

    fn device_transport(day: i64) -> MockDeviceTransport {
        let mut transport = MockDeviceTransport::new();
        transport.expect_get_schedule().returning(|device, from, to| {
            Ok(ScheduleSummary {
                uuid: device,
                from,
                to,
                task_ids: vec![1],
                flexibility_ids: vec![1],
                constraints: Vec::new(),
            })
        });
        transport
            .expect_get_flexibility()
            .returning(move |_, _| Ok(day_flexibility(day)));
        transport
            .expect_get_task()
            .returning(move |_, _| Ok(Task::idle(1, 1, true, day, 86_400)));
        transport
    }

    #[tokio::test]
    async fn test_target_event_forces_optimization() {
        let dir = tempdir().unwrap();
        let (scheduler, _) = build(&dir, DAY + 3600, MockDeviceTransport::new(), MockSchedulePublisher::new());
        scheduler
            .handle_event(SchedulerEvent::TargetSchedule(PublicSchedule::zero(0, DAY, 900, 96)))
            .await;
        assert!(scheduler.has_target(DAY + 3600));
        assert_eq!(scheduler.queue().pending_jobs(), 1);

        scheduler
            .handle_event(SchedulerEvent::FlexibilitiesChanged { device: DEVICE })
            .await;
        assert_eq!(scheduler.queue().pending_jobs(), 1);
    }

    /// Waits until the scheduler snapshot on disk satisfies `done`.
    async fn persisted(dir: &TempDir, done: impl Fn(&SchedulerState) -> bool) {
        let path = cfg(dir).state_file;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if std::path::Path::new(&path).exists() && done(&SnapshotFile::new(&path).load::<SchedulerState>().0) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("scheduler state not written");
    }

    #[tokio::test]
    async fn test_event_handling_does_not_wait_for_state_writes() {
        let dir = tempdir().unwrap();
        let now = DAY + 3600;
        let (scheduler, _) = build(&dir, now, MockDeviceTransport::new(), MockSchedulePublisher::new());
        let gate = scheduler.snapshot.hold_writes().await;

        scheduler
            .handle_event(SchedulerEvent::TargetSchedule(PublicSchedule::zero(0, DAY, 900, 96)))
            .await;
        assert!(scheduler.has_target(now));
        let data = MonitoringData { consumption: 400.0, production: 0.0, battery: 0.0, schedule: 0.0 };
        scheduler.handle_event(SchedulerEvent::Monitoring(data)).await;
        assert!(!std::path::Path::new(&cfg(&dir).state_file).exists());

        drop(gate);
        persisted(&dir, |state| state.target_schedules.contains_key(&DAY)).await;
    }

    #[tokio::test]
    async fn test_expired_targets_are_dropped_from_snapshot() {
        let dir = tempdir().unwrap();
        let now = DAY + 3600;
        let mut forecaster = MockForecaster::new();
        forecaster
            .expect_forecast()
            .returning(|_, _, _| Err(anyhow::anyhow!("forecast service down")));
        let scheduler = Scheduler::new(
            cfg(&dir),
            Arc::new(ManualClock::new(now)),
            Arc::new(MockDeviceTransport::new()),
            Arc::new(ForecastEngine::new(vec![Box::new(forecaster)], Vec::new())),
            Arc::new(MockSchedulePublisher::new()),
            Handle::current(),
        );
        // yesterday's target ended at midnight
        scheduler
            .handle_event(SchedulerEvent::TargetSchedule(PublicSchedule::zero(0, DAY - 86_400, 900, 96)))
            .await;
        persisted(&dir, |state| state.target_schedules.len() == 1).await;

        assert!(scheduler.optimize_target_schedule_compliance().await.is_err());
        assert!(scheduler.state().target_schedules.is_empty());
        persisted(&dir, |state| state.target_schedules.is_empty()).await;
    }

    #[tokio::test]
    async fn test_compliance_optimization_adapts_running_task() {
        let dir = tempdir().unwrap();
        let now = DAY + 3600;
        let mut transport = device_transport(DAY);
        transport
            .expect_adapt_flexibility()
            .withf(|device, id, _| *device == DEVICE && *id == 1)
            .times(1)
            .returning(|_, _, _| Ok(SchedulingResult::Ok));
        let (scheduler, _) = build(&dir, now, transport, MockSchedulePublisher::new());

        let solution = scheduler
            .optimize_target_schedule_compliance()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(solution.to, DAY + 86_400);
        assert_eq!(solution.tasks[&DEVICE].len(), 1);
        assert_eq!(scheduler.adaptable_tasks(), 1);
        assert_eq!(scheduler.state().most_recent_target_optimization, now);
    }

    #[tokio::test]
    async fn test_failed_initial_publication_is_retried() {
        let dir = tempdir().unwrap();
        let now = DAY + 10 * 3600;
        let mut transport = MockDeviceTransport::new();
        transport
            .expect_get_schedule()
            .returning(|device, _, _| Err(TransportError::UnknownDevice(device)));
        let mut publisher = MockSchedulePublisher::new();
        let mut attempts = 0;
        publisher.expect_publish().times(2).returning(move |_, _, kind| {
            assert_eq!(kind, PublicationKind::InitialSchedule);
            attempts += 1;
            if attempts == 1 {
                Err(anyhow::anyhow!("counterparty unreachable"))
            } else {
                Ok(())
            }
        });
        let (scheduler, _) = build(&dir, now, transport, publisher);

        let request = scheduler.day_ahead_window(now);
        assert!(scheduler.publish_schedule(request).await.is_err());
        assert_eq!(scheduler.state().incomplete_publications, vec![request]);
        assert_eq!(scheduler.retry_incomplete_publications(), 1);

        scheduler.publish_schedule(request).await.unwrap();
        let state = scheduler.state();
        assert!(state.incomplete_publications.is_empty());
        assert_eq!(state.latest_initial_publication, DAY + 2 * 86_400);
        assert!(scheduler.has_target(DAY + 86_400));
    }

    #[tokio::test]
    async fn test_update_within_target_is_not_published() {
        let dir = tempdir().unwrap();
        let now = DAY + 3600;
        let mut transport = MockDeviceTransport::new();
        transport.expect_get_schedule().returning(|device, _, _| Err(TransportError::UnknownDevice(device)));
        // no expectation: publishing would panic
        let publisher = MockSchedulePublisher::new();
        let (scheduler, _) = build(&dir, now, transport, publisher);
        scheduler
            .handle_event(SchedulerEvent::TargetSchedule(PublicSchedule::zero(0, DAY, 900, 96)))
            .await;

        let request = PublicationRequest { kind: PublicationKind::ScheduleUpdate, from: now, to: now + 3600 };
        scheduler.publish_schedule(request).await.unwrap();
        assert_eq!(scheduler.state().latest_update_publication, 0);
    }

    #[tokio::test]
    async fn test_startup_catches_up_overdue_publication() {
        let dir = tempdir().unwrap();
        let (scheduler, _) = build(&dir, DAY + 10 * 3600, MockDeviceTransport::new(), MockSchedulePublisher::new());
        scheduler.startup();
        assert_eq!(scheduler.queue().pending_jobs(), 2);

        let dir = tempdir().unwrap();
        let (early, _) = build(&dir, DAY + 8 * 3600, MockDeviceTransport::new(), MockSchedulePublisher::new());
        early.startup();
        assert_eq!(early.queue().pending_jobs(), 1);
    }
}
