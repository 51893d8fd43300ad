//! Request/response contract between the scheduler and the devices.

pub mod fanout;
pub mod local;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Flexibility, PowerProfile, ScheduleSummary, SchedulingResult, Task};

pub use fanout::retrieve_schedules;
pub use local::LocalTransport;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("device {0} is not reachable")]
    UnknownDevice(Uuid),
    #[error("device {device} did not answer within {seconds}s")]
    Timeout { device: Uuid, seconds: u64 },
    #[error("device {device} has no {kind} {id}")]
    NotFound { device: Uuid, kind: &'static str, id: i32 },
    #[error("device {device} failed: {message}")]
    Remote { device: Uuid, message: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn get_schedule(&self, device: Uuid, from: i64, to: i64) -> Result<ScheduleSummary, TransportError>;

    async fn get_flexibility(&self, device: Uuid, id: i32) -> Result<Flexibility, TransportError>;

    async fn get_task(&self, device: Uuid, id: i32) -> Result<Task, TransportError>;

    async fn schedule_flexibility(
        &self,
        device: Uuid,
        id: i32,
        starting_time: i64,
        power: PowerProfile,
    ) -> Result<SchedulingResult, TransportError>;

    async fn adapt_flexibility(&self, device: Uuid, id: i32, power: PowerProfile) -> Result<SchedulingResult, TransportError>;

    async fn unschedule_flexibility(&self, device: Uuid, id: i32) -> Result<SchedulingResult, TransportError>;

    /// Asks a storage device to reach `soc` percent by `time`.
    async fn set_target_soc(&self, device: Uuid, soc: i32, time: i64) -> Result<(), TransportError>;
}
