use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::info;

use crate::domain::{PublicFlexibility, PublicSchedule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum PublicationKind {
    /// Day-ahead schedule, becomes the target once accepted.
    InitialSchedule,
    ScheduleUpdate,
}

/// Window of a schedule to be optimized and published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationRequest {
    pub kind: PublicationKind,
    pub from: i64,
    pub to: i64,
}

/// Channel to the flexibility management counterparty.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SchedulePublisher: Send + Sync {
    async fn publish(
        &self,
        schedule: &PublicSchedule,
        flexibility: &PublicFlexibility,
        kind: PublicationKind,
    ) -> Result<()>;
}

/// Writes publications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPublisher;

#[async_trait]
impl SchedulePublisher for LoggingPublisher {
    async fn publish(
        &self,
        schedule: &PublicSchedule,
        flexibility: &PublicFlexibility,
        kind: PublicationKind,
    ) -> Result<()> {
        let consumption: i64 = schedule.consumption.iter().map(|v| *v as i64).sum();
        let production: i64 = schedule.production.iter().map(|v| *v as i64).sum();
        info!(
            %kind,
            starting_time = schedule.starting_time,
            slots = schedule.slots(),
            consumption_wh = consumption,
            production_wh = production,
            flexibility_slots = flexibility.power_corridor.len(),
            "schedule published"
        );
        Ok(())
    }
}
