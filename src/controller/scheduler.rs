//! Periodic drivers of the site scheduler: day-ahead publication, the
//! forced optimization after midnight, publication retries and the
//! monitoring tick feeding the real-time adapter.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveTime;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{Scheduler, SchedulerEvent};
use crate::clock::{next_local_time, start_of_next_day};
use crate::config::SchedulerConfig;
use crate::domain::MonitoringData;
use crate::store::StoreEvent;

/// Periodic task configuration
#[derive(Debug, Clone)]
pub struct PeriodicTaskConfig {
    /// Local time at which the next day's schedule is published
    pub publication_time: NaiveTime,
    /// Publication retry interval (seconds)
    pub retry_interval_secs: u64,
    /// Monitoring tick interval (seconds)
    pub monitoring_interval_secs: u64,
}

impl PeriodicTaskConfig {
    pub fn from_scheduler(cfg: &SchedulerConfig) -> Self {
        Self {
            publication_time: cfg.publication_time,
            retry_interval_secs: cfg.publication_retry_interval,
            monitoring_interval_secs: cfg.adaption_interval_seconds,
        }
    }
}

/// Task status tracking, times are epoch seconds
#[derive(Debug, Clone, Default)]
pub struct TaskStatus {
    pub last_run: Option<i64>,
    pub last_success: Option<i64>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
}

/// Averaged site measurements since the previous call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MonitoringSource: Send + Sync {
    async fn sample(&self) -> Result<MonitoringData>;
}

/// Periodic task scheduler
pub struct TaskScheduler {
    config: PeriodicTaskConfig,
    scheduler: Arc<Scheduler>,
    source: Arc<dyn MonitoringSource>,
    publication_status: Arc<RwLock<TaskStatus>>,
    midnight_status: Arc<RwLock<TaskStatus>>,
    retry_status: Arc<RwLock<TaskStatus>>,
    monitoring_status: Arc<RwLock<TaskStatus>>,
}

impl TaskScheduler {
    pub fn new(scheduler: Arc<Scheduler>, source: Arc<dyn MonitoringSource>) -> Self {
        let config = PeriodicTaskConfig::from_scheduler(scheduler.config());
        Self::with_config(scheduler, source, config)
    }

    pub fn with_config(scheduler: Arc<Scheduler>, source: Arc<dyn MonitoringSource>, config: PeriodicTaskConfig) -> Self {
        Self {
            config,
            scheduler,
            source,
            publication_status: Arc::new(RwLock::new(TaskStatus::default())),
            midnight_status: Arc::new(RwLock::new(TaskStatus::default())),
            retry_status: Arc::new(RwLock::new(TaskStatus::default())),
            monitoring_status: Arc::new(RwLock::new(TaskStatus::default())),
        }
    }

    /// Start all periodic tasks
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let tasks = self.clone();
        handles.push(tokio::spawn(async move { tasks.run_publication_task().await }));

        let tasks = self.clone();
        handles.push(tokio::spawn(async move { tasks.run_midnight_task().await }));

        let tasks = self.clone();
        handles.push(tokio::spawn(async move { tasks.run_retry_task().await }));

        let tasks = self.clone();
        handles.push(tokio::spawn(async move { tasks.run_monitoring_task().await }));

        info!(
            publication_time = %self.config.publication_time,
            monitoring_secs = self.config.monitoring_interval_secs,
            "all periodic tasks started"
        );
        handles
    }

    async fn begin(&self, status: &RwLock<TaskStatus>) -> i64 {
        let now = self.scheduler.now();
        let mut status = status.write().await;
        status.last_run = Some(now);
        status.run_count += 1;
        now
    }

    async fn finish(&self, status: &RwLock<TaskStatus>, now: i64, result: &Result<()>) {
        let mut status = status.write().await;
        match result {
            Ok(()) => {
                status.last_success = Some(now);
                status.success_count += 1;
                status.last_error = None;
            }
            Err(e) => {
                status.error_count += 1;
                status.last_error = Some(e.to_string());
            }
        }
    }

    async fn sleep_until(&self, at: i64) {
        let wait = (at - self.scheduler.now()).max(0) as u64;
        sleep(Duration::from_secs(wait)).await;
    }

    /// Queues the initial publication of the day after `now`.
    pub async fn queue_day_ahead_publication(&self) {
        let now = self.begin(&self.publication_status).await;
        let request = self.scheduler.day_ahead_window(now);
        info!(from = request.from, to = request.to, "queueing day-ahead publication");
        self.scheduler.queue().queue_schedule_publication(request);
        self.finish(&self.publication_status, now, &Ok(())).await;
    }

    async fn run_publication_task(&self) {
        let tz = self.scheduler.config().timezone;
        loop {
            let next = next_local_time(&tz, self.scheduler.now(), self.config.publication_time);
            debug!(next, "next day-ahead publication");
            self.sleep_until(next).await;
            self.queue_day_ahead_publication().await;
        }
    }

    /// Forces a compliance optimization for the new day's target.
    pub async fn queue_midnight_optimization(&self) {
        let now = self.begin(&self.midnight_status).await;
        info!("new day, forcing target schedule optimization");
        self.scheduler.queue().queue_target_optimization(true);
        self.finish(&self.midnight_status, now, &Ok(())).await;
    }

    async fn run_midnight_task(&self) {
        let tz = self.scheduler.config().timezone;
        loop {
            let next = start_of_next_day(&tz, self.scheduler.now()) + 1;
            self.sleep_until(next).await;
            self.queue_midnight_optimization().await;
        }
    }

    async fn run_retry_task(&self) {
        let mut ticker = interval(Duration::from_secs(self.config.retry_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let now = self.begin(&self.retry_status).await;
            let retried = self.scheduler.retry_incomplete_publications();
            if retried > 0 {
                info!(retried, "incomplete publications queued again");
            }
            self.finish(&self.retry_status, now, &Ok(())).await;
        }
    }

    /// Samples the site and hands the measurement to the adapter. Nothing
    /// happens while no target schedule is in force. Returns whether a sample
    /// was taken.
    pub async fn monitoring_tick(&self) -> bool {
        let now = self.scheduler.now();
        if !self.scheduler.has_target(now) {
            return false;
        }
        let now = self.begin(&self.monitoring_status).await;
        let result = match self.source.sample().await {
            Ok(data) => {
                self.scheduler.handle_event(SchedulerEvent::Monitoring(data)).await;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "monitoring sample unavailable");
                Err(e)
            }
        };
        self.finish(&self.monitoring_status, now, &result).await;
        true
    }

    async fn run_monitoring_task(&self) {
        let mut ticker = interval(Duration::from_secs(self.config.monitoring_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.monitoring_tick().await;
        }
    }

    pub async fn get_publication_status(&self) -> TaskStatus {
        self.publication_status.read().await.clone()
    }

    pub async fn get_midnight_status(&self) -> TaskStatus {
        self.midnight_status.read().await.clone()
    }

    pub async fn get_retry_status(&self) -> TaskStatus {
        self.retry_status.read().await.clone()
    }

    pub async fn get_monitoring_status(&self) -> TaskStatus {
        self.monitoring_status.read().await.clone()
    }

    /// Status of every periodic task, by task name.
    pub async fn statuses(&self) -> Vec<(&'static str, TaskStatus)> {
        vec![
            ("publication", self.get_publication_status().await),
            ("midnight", self.get_midnight_status().await),
            ("retry", self.get_retry_status().await),
            ("monitoring", self.get_monitoring_status().await),
        ]
    }

    pub async fn log_statuses(&self) {
        for (task, status) in self.statuses().await {
            info!(
                task,
                runs = status.run_count,
                successes = status.success_count,
                errors = status.error_count,
                last_error = status.last_error.as_deref().unwrap_or(""),
                "periodic task status"
            );
        }
    }
}

/// Turns schedule changes reported by stores into coalesced optimizations.
pub fn forward_store_events(scheduler: Arc<Scheduler>, mut events: broadcast::Receiver<StoreEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StoreEvent::ScheduleChanged { device, from }) => {
                    debug!(device = %device, from, "device schedule changed");
                    scheduler
                        .handle_event(SchedulerEvent::FlexibilitiesChanged { device })
                        .await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "store events lagged");
                    scheduler.queue().queue_target_optimization(false);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Starts the queue worker, queues the startup work and spawns every
/// periodic task. The returned [`TaskScheduler`] reports their status.
pub fn spawn_scheduler_tasks(
    scheduler: Arc<Scheduler>,
    source: Arc<dyn MonitoringSource>,
) -> (Arc<TaskScheduler>, Vec<JoinHandle<()>>) {
    let mut handles = Vec::new();
    let queue = scheduler.queue().clone();
    handles.push(tokio::spawn(queue.run(scheduler.clone())));

    scheduler.startup();

    let tasks = Arc::new(TaskScheduler::new(scheduler, source));
    handles.extend(tasks.clone().start());
    (tasks, handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::controller::{Job, LoggingPublisher, PublicationKind};
    use crate::domain::PublicSchedule;
    use crate::forecast::ForecastEngine;
    use crate::rpc::LocalTransport;
    use chrono_tz::UTC;
    use tempfile::{tempdir, TempDir};
    use tokio::runtime::Handle;

    const DAY: i64 = 1_699_920_000;

    fn scheduler(dir: &TempDir, now: i64) -> Arc<Scheduler> {
        let cfg = SchedulerConfig {
            state_file: dir.path().join("scheduler.json").to_string_lossy().into_owned(),
            timezone: UTC,
            flexibility_providers: Vec::new(),
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
        };
        Arc::new(Scheduler::new(
            cfg,
            Arc::new(ManualClock::new(now)),
            Arc::new(LocalTransport::default()),
            Arc::new(ForecastEngine::new(Vec::new(), Vec::new())),
            Arc::new(LoggingPublisher),
            Handle::current(),
        ))
    }

    #[tokio::test]
    async fn test_monitoring_only_with_target() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler(&dir, DAY + 3600);
        let mut source = MockMonitoringSource::new();
        source
            .expect_sample()
            .times(1)
            .returning(|| Ok(MonitoringData::default()));
        let tasks = TaskScheduler::new(scheduler.clone(), Arc::new(source));

        assert!(!tasks.monitoring_tick().await);
        scheduler
            .handle_event(SchedulerEvent::TargetSchedule(PublicSchedule::zero(0, DAY, 900, 96)))
            .await;
        assert!(tasks.monitoring_tick().await);

        let status = tasks.get_monitoring_status().await;
        assert_eq!(status.run_count, 1);
        assert_eq!(status.success_count, 1);
    }

    #[tokio::test]
    async fn test_failed_sample_is_counted() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler(&dir, DAY + 3600);
        scheduler
            .handle_event(SchedulerEvent::TargetSchedule(PublicSchedule::zero(0, DAY, 900, 96)))
            .await;
        let mut source = MockMonitoringSource::new();
        source
            .expect_sample()
            .returning(|| Err(anyhow::anyhow!("meter offline")));
        let tasks = TaskScheduler::new(scheduler, Arc::new(source));

        assert!(tasks.monitoring_tick().await);
        let status = tasks.get_monitoring_status().await;
        assert_eq!(status.error_count, 1);
        assert_eq!(status.last_error.as_deref(), Some("meter offline"));
    }

    #[tokio::test]
    async fn test_day_ahead_and_midnight_jobs() {
        let dir = tempdir().unwrap();
        let now = DAY + 9 * 3600;
        let scheduler = scheduler(&dir, now);
        let tasks = TaskScheduler::new(scheduler.clone(), Arc::new(MockMonitoringSource::new()));

        tasks.queue_day_ahead_publication().await;
        match scheduler.queue().take_due(now) {
            Some(Job::Publish(request)) => {
                assert_eq!(request.kind, PublicationKind::InitialSchedule);
                assert_eq!(request.from, DAY + 86_400);
                assert_eq!(request.to, DAY + 2 * 86_400);
            }
            other => panic!("expected publication, got {other:?}"),
        }

        tasks.queue_midnight_optimization().await;
        assert_eq!(scheduler.queue().take_due(now), Some(Job::OptimizeTargetCompliance));
        let statuses = tasks.statuses().await;
        let runs: Vec<(&str, u64)> = statuses.iter().map(|(task, status)| (*task, status.run_count)).collect();
        assert_eq!(runs, vec![("publication", 1), ("midnight", 1), ("retry", 0), ("monitoring", 0)]);
        assert_eq!(statuses[0].1.success_count, 1);
        assert_eq!(statuses[0].1.last_success, Some(now));
    }

    #[tokio::test]
    async fn test_spawned_tasks_report_status() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler(&dir, DAY + 3600);
        let (tasks, handles) = spawn_scheduler_tasks(scheduler, Arc::new(MockMonitoringSource::new()));
        assert_eq!(handles.len(), 5);
        assert!(tasks.statuses().await.iter().all(|(_, status)| status.error_count == 0));
        tasks.log_statuses().await;
        for handle in handles {
            handle.abort();
        }
    }
}
