use futures::stream::{self, StreamExt};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{DeviceTransport, TransportError};
use crate::domain::ScheduleData;
use crate::optimizer::Schedules;

async fn within<T>(
    device: Uuid,
    limit: Duration,
    call: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| TransportError::Timeout { device, seconds: limit.as_secs() })?
}

/// Summary of one device plus every flexibility and task it references.
/// Objects that cannot be fetched are left out.
async fn fetch_schedule(
    transport: &dyn DeviceTransport,
    device: Uuid,
    from: i64,
    to: i64,
    limit: Duration,
) -> Result<ScheduleData, TransportError> {
    let summary = within(device, limit, transport.get_schedule(device, from, to)).await?;
    debug!(
        device = %device,
        flexibilities = ?summary.flexibility_ids,
        tasks = ?summary.task_ids,
        "requesting schedule details"
    );

    let flexibilities = futures::future::join_all(
        summary
            .flexibility_ids
            .iter()
            .map(|id| within(device, limit, transport.get_flexibility(device, *id))),
    )
    .await;
    let tasks = futures::future::join_all(
        summary
            .task_ids
            .iter()
            .map(|id| within(device, limit, transport.get_task(device, *id))),
    )
    .await;

    let mut data = ScheduleData {
        uuid: summary.uuid,
        from: summary.from,
        to: summary.to,
        constraints: summary.constraints,
        ..Default::default()
    };
    for result in flexibilities {
        match result {
            Ok(flexibility) => data.flexibilities.push(flexibility),
            Err(e) => error!(device = %device, error = %e, "could not retrieve flexibility"),
        }
    }
    for result in tasks {
        match result {
            Ok(task) => data.tasks.push(task),
            Err(e) => error!(device = %device, error = %e, "could not retrieve task"),
        }
    }
    Ok(data)
}

/// Collects the schedules of all `devices` with at most `concurrency`
/// requests in flight. A device that fails or times out is only missing
/// from the result.
pub async fn retrieve_schedules(
    transport: &dyn DeviceTransport,
    devices: &[Uuid],
    from: i64,
    to: i64,
    limit: Duration,
    concurrency: usize,
) -> Schedules {
    debug!(from, to, devices = devices.len(), "retrieving schedules");
    let results: Vec<(Uuid, Result<ScheduleData, TransportError>)> = stream::iter(devices.iter().copied())
        .map(|device| async move { (device, fetch_schedule(transport, device, from, to, limit).await) })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut schedules = Schedules::new();
    for (device, result) in results {
        match result {
            Ok(data) => {
                schedules.insert(device, data);
            }
            Err(e) => error!(device = %device, error = %e, "could not retrieve schedule"),
        }
    }
    if schedules.is_empty() {
        warn!("no schedules retrieved");
    }
    schedules
}
