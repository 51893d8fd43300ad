use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{DeviceTransport, TransportError};
use crate::domain::{Flexibility, PowerProfile, ScheduleSummary, SchedulingResult, Task};
use crate::store::DeviceScheduleStore;

/// Transport to stores living in the same process.
#[derive(Clone, Default)]
pub struct LocalTransport {
    stores: BTreeMap<Uuid, Arc<DeviceScheduleStore>>,
}

impl LocalTransport {
    pub fn new(stores: impl IntoIterator<Item = Arc<DeviceScheduleStore>>) -> Self {
        Self {
            stores: stores.into_iter().map(|s| (s.uuid(), s)).collect(),
        }
    }

    fn store(&self, device: Uuid) -> Result<&Arc<DeviceScheduleStore>, TransportError> {
        self.stores.get(&device).ok_or(TransportError::UnknownDevice(device))
    }
}

#[async_trait]
impl DeviceTransport for LocalTransport {
    async fn get_schedule(&self, device: Uuid, from: i64, to: i64) -> Result<ScheduleSummary, TransportError> {
        self.store(device)?
            .get_schedule(from, to)
            .await
            .map_err(|e| TransportError::Remote { device, message: e.to_string() })
    }

    async fn get_flexibility(&self, device: Uuid, id: i32) -> Result<Flexibility, TransportError> {
        self.store(device)?
            .get_flexibility(id)
            .await
            .ok_or(TransportError::NotFound { device, kind: "flexibility", id })
    }

    async fn get_task(&self, device: Uuid, id: i32) -> Result<Task, TransportError> {
        self.store(device)?
            .get_task(id)
            .await
            .ok_or(TransportError::NotFound { device, kind: "task", id })
    }

    async fn schedule_flexibility(
        &self,
        device: Uuid,
        id: i32,
        starting_time: i64,
        power: PowerProfile,
    ) -> Result<SchedulingResult, TransportError> {
        Ok(self.store(device)?.schedule_flexibility(id, starting_time, power).await)
    }

    async fn adapt_flexibility(&self, device: Uuid, id: i32, power: PowerProfile) -> Result<SchedulingResult, TransportError> {
        Ok(self.store(device)?.adapt_scheduled_flexibility(id, &power).await)
    }

    async fn unschedule_flexibility(&self, device: Uuid, id: i32) -> Result<SchedulingResult, TransportError> {
        Ok(self.store(device)?.unschedule_flexibility(id).await)
    }

    async fn set_target_soc(&self, device: Uuid, soc: i32, time: i64) -> Result<(), TransportError> {
        self.store(device)?
            .set_target_soc(soc, time)
            .await
            .map_err(|e| TransportError::Remote { device, message: e.to_string() })
    }
}
