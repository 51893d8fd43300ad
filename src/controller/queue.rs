//! Optimization job queue.
//!
//! One worker runs every optimization and publication in order of
//! eligibility. Each job kind lives in its own time-keyed map and has its own
//! coalescing rule, so the queue is not a plain priority queue.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::publish::{PublicationKind, PublicationRequest};
use crate::clock::Clock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    OptimizeTargetCompliance,
    Publish(PublicationRequest),
}

/// Executes jobs taken from the queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job);
}

#[derive(Debug, Default)]
struct Pending {
    target: BTreeMap<i64, ()>,
    initial: BTreeMap<i64, PublicationRequest>,
    update: BTreeMap<i64, PublicationRequest>,
    last_target_run: Option<i64>,
    last_update_run: Option<i64>,
}

impl Pending {
    fn earliest(&self) -> Option<i64> {
        [
            self.initial.keys().next(),
            self.update.keys().next(),
            self.target.keys().next(),
        ]
        .into_iter()
        .flatten()
        .min()
        .copied()
    }
}

/// Earliest key at which a job may run again after `last_run`.
fn rate_limited(now: i64, last_run: Option<i64>, interval: i64) -> i64 {
    last_run.map_or(now, |last| now.max(last + interval))
}

/// Coalesced insert: skipped while a job of the same kind is pending or the
/// minimum interval since the last run has not passed.
fn coalesce(pending_empty: bool, now: i64, last_run: Option<i64>, interval: i64) -> Option<i64> {
    if !pending_empty {
        return None;
    }
    match last_run {
        Some(last) if now < last + interval => None,
        _ => Some(now),
    }
}

pub struct OptimizationQueue {
    clock: Arc<dyn Clock>,
    compliance_interval: i64,
    update_interval: i64,
    pending: Mutex<Pending>,
    wake: Notify,
}

impl OptimizationQueue {
    pub fn new(clock: Arc<dyn Clock>, compliance_interval: i64, update_interval: i64) -> Self {
        Self {
            clock,
            compliance_interval,
            update_interval,
            pending: Mutex::new(Pending::default()),
            wake: Notify::new(),
        }
    }

    /// Seeds the rate limit with the last optimization of a previous run.
    pub fn restore_last_target_run(&self, at: i64) {
        if at > 0 {
            self.pending.lock().last_target_run = Some(at);
        }
    }

    /// Returns whether a job was inserted.
    pub fn queue_target_optimization(&self, force: bool) -> bool {
        let now = self.clock.now();
        let mut pending = self.pending.lock();
        let at = if force {
            Some(rate_limited(now, pending.last_target_run, self.compliance_interval))
        } else {
            coalesce(pending.target.is_empty(), now, pending.last_target_run, self.compliance_interval)
        };
        let Some(at) = at else {
            debug!(force, "target optimization coalesced");
            return false;
        };
        pending.target.insert(at, ());
        drop(pending);
        debug!(at, force, "target optimization queued");
        self.wake.notify_one();
        true
    }

    /// Initial publications are always queued, updates are coalesced.
    pub fn queue_schedule_publication(&self, request: PublicationRequest) -> bool {
        let now = self.clock.now();
        let mut pending = self.pending.lock();
        match request.kind {
            PublicationKind::InitialSchedule => {
                let mut at = now;
                while pending.initial.contains_key(&at) {
                    at += 1;
                }
                pending.initial.insert(at, request);
            }
            PublicationKind::ScheduleUpdate => {
                let Some(at) = coalesce(pending.update.is_empty(), now, pending.last_update_run, self.update_interval)
                else {
                    debug!("schedule update publication coalesced");
                    return false;
                };
                pending.update.insert(at, request);
            }
        }
        drop(pending);
        self.wake.notify_one();
        true
    }

    /// Earliest eligible time of any pending job.
    pub fn next_wake(&self) -> Option<i64> {
        self.pending.lock().earliest()
    }

    pub fn pending_jobs(&self) -> usize {
        let pending = self.pending.lock();
        pending.target.len() + pending.initial.len() + pending.update.len()
    }

    /// Removes and returns the earliest job that is eligible at `now`. On a
    /// tie initial publications go first, then updates, then optimizations.
    pub fn take_due(&self, now: i64) -> Option<Job> {
        let mut pending = self.pending.lock();
        let earliest = pending.earliest().filter(|at| *at <= now)?;
        if let Some(request) = pending.initial.remove(&earliest) {
            return Some(Job::Publish(request));
        }
        if let Some(request) = pending.update.remove(&earliest) {
            pending.last_update_run = Some(now);
            return Some(Job::Publish(request));
        }
        pending.target.remove(&earliest)?;
        pending.last_target_run = Some(now);
        Some(Job::OptimizeTargetCompliance)
    }

    /// Worker loop, runs until the task is aborted.
    pub async fn run(self: Arc<Self>, handler: Arc<dyn JobHandler>) {
        info!("optimization queue started");
        loop {
            let now = self.clock.now();
            if let Some(job) = self.take_due(now) {
                debug!(?job, "running job");
                handler.handle(job).await;
                continue;
            }
            let notified = self.wake.notified();
            match self.next_wake() {
                Some(at) => {
                    let wait = Duration::from_secs((at - now).max(1) as u64);
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const T0: i64 = 1_700_000_000;

    fn queue() -> (OptimizationQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        (OptimizationQueue::new(clock.clone(), 900, 300), clock)
    }

    fn update(from: i64) -> PublicationRequest {
        PublicationRequest { kind: PublicationKind::ScheduleUpdate, from, to: from + 3600 }
    }

    #[test]
    fn test_non_forced_optimizations_coalesce() {
        let (queue, clock) = queue();
        assert!(queue.queue_target_optimization(false));
        clock.advance(10);
        assert!(!queue.queue_target_optimization(false));
        assert_eq!(queue.pending_jobs(), 1);

        assert_eq!(queue.take_due(clock.now()), Some(Job::OptimizeTargetCompliance));
        clock.advance(100);
        assert!(!queue.queue_target_optimization(false));

        clock.advance(900);
        assert!(queue.queue_target_optimization(false));
        assert_eq!(queue.pending_jobs(), 1);
    }

    #[test]
    fn test_forced_optimization_waits_for_interval() {
        let (queue, clock) = queue();
        assert!(queue.queue_target_optimization(true));
        assert_eq!(queue.take_due(T0), Some(Job::OptimizeTargetCompliance));

        clock.advance(60);
        assert!(queue.queue_target_optimization(true));
        assert_eq!(queue.next_wake(), Some(T0 + 900));
        assert_eq!(queue.take_due(clock.now()), None);
        assert_eq!(queue.take_due(T0 + 900), Some(Job::OptimizeTargetCompliance));
    }

    #[test]
    fn test_restored_run_limits_startup_optimization() {
        let (queue, _) = queue();
        queue.restore_last_target_run(T0 - 100);
        assert!(!queue.queue_target_optimization(false));
        queue.restore_last_target_run(T0 - 900);
        assert!(queue.queue_target_optimization(false));
    }

    #[test]
    fn test_initial_publications_always_queue_and_run_first() {
        let (queue, _) = queue();
        let initial = |from| PublicationRequest { kind: PublicationKind::InitialSchedule, from, to: from + 86_400 };
        assert!(queue.queue_target_optimization(false));
        assert!(queue.queue_schedule_publication(update(T0)));
        assert!(!queue.queue_schedule_publication(update(T0 + 60)));
        assert!(queue.queue_schedule_publication(initial(T0)));
        assert!(queue.queue_schedule_publication(initial(T0 + 86_400)));
        assert_eq!(queue.pending_jobs(), 4);

        // the second initial publication landed one second later
        assert_eq!(queue.take_due(T0), Some(Job::Publish(initial(T0))));
        assert_eq!(queue.take_due(T0), Some(Job::Publish(update(T0))));
        assert_eq!(queue.take_due(T0), Some(Job::OptimizeTargetCompliance));
        assert_eq!(queue.take_due(T0), None);
        assert_eq!(queue.take_due(T0 + 1), Some(Job::Publish(initial(T0 + 86_400))));
    }

    #[tokio::test]
    async fn test_worker_runs_queued_job() {
        let (queue, _) = queue();
        let queue = Arc::new(queue);
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = parking_lot::Mutex::new(tx);

        let mut handler = MockJobHandler::new();
        handler.expect_handle().times(1).returning(move |job| {
            let _ = tx.lock().send(job);
        });

        let worker = tokio::spawn(queue.clone().run(Arc::new(handler)));
        assert!(queue.queue_target_optimization(true));
        let job = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job, Job::OptimizeTargetCompliance);
        worker.abort();
    }
}
