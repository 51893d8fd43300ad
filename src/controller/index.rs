use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::{Flexibility, Task};

/// Committed adaptable task together with the flexibility it was planned in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptableEntry {
    pub task: Task,
    pub flexibility: Flexibility,
}

/// Adaptable tasks known to the real-time adapter, keyed by device and
/// flexibility id.
#[derive(Debug, Default)]
pub struct AdaptableIndex {
    entries: BTreeMap<(Uuid, i32), AdaptableEntry>,
}

impl AdaptableIndex {
    pub fn record(&mut self, device: Uuid, task: Task, flexibility: Flexibility) {
        self.entries.insert((device, task.flexibility_id), AdaptableEntry { task, flexibility });
    }

    /// Drops entries whose task has ended. Returns how many were removed.
    pub fn prune(&mut self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.task.end() > now);
        before - self.entries.len()
    }

    pub fn get_mut(&mut self, device: Uuid, flexibility_id: i32) -> Option<&mut AdaptableEntry> {
        self.entries.get_mut(&(device, flexibility_id))
    }

    /// Keys of adaptable tasks running at `now`, in device order.
    pub fn running(&self, now: i64) -> Vec<(Uuid, i32)> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.task.adaptable && entry.task.is_running(now))
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
