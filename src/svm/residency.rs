use super::TaskCount;
use crate::memory::GraphicsAllocation;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type ResidencyContainer = Vec<GraphicsAllocation>;

/// The submission side of a device engine, as seen by residency bookkeeping.
pub trait CommandStreamReceiver: Send + Sync {
    /// Stable identity of this receiver.
    fn id(&self) -> u32;

    fn root_device_index(&self) -> u32;

    /// Make `allocation` resident for the next submission.
    fn make_resident(&self, allocation: &GraphicsAllocation);

    /// Record that `allocation` is in use until `task_count` completes.
    fn update_task_count(&self, allocation: &GraphicsAllocation, task_count: TaskCount);
}

/// Per-receiver progress of indirect allocation residency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InternalAllocationsTracker {
    pub latest_sent_task_count: TaskCount,
    pub latest_resident_object_id: u32,
}

struct ResidencyEntry {
    receiver: Arc<dyn CommandStreamReceiver>,
    tracker: InternalAllocationsTracker,
}

/// Receivers that have made indirect allocations resident, keyed by receiver id.
#[derive(Default)]
pub struct IndirectAllocationsResidency {
    entries: BTreeMap<u32, ResidencyEntry>,
}

impl std::fmt::Debug for IndirectAllocationsResidency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(id, entry)| (id, entry.tracker)))
            .finish()
    }
}

impl IndirectAllocationsResidency {
    /// Records a submission of `task_count` on `receiver` when `allocations_counter` ids exist.
    ///
    /// Returns the first allocation id that still has to be made resident, or
    /// `None` when the receiver is already up to date.
    pub fn record_submission(
        &mut self,
        receiver: &Arc<dyn CommandStreamReceiver>,
        task_count: TaskCount,
        allocations_counter: u32,
    ) -> Option<u32> {
        match self.entries.get_mut(&receiver.id()) {
            None => {
                self.entries.insert(
                    receiver.id(),
                    ResidencyEntry {
                        receiver: Arc::clone(receiver),
                        tracker: InternalAllocationsTracker {
                            latest_sent_task_count: task_count,
                            latest_resident_object_id: allocations_counter,
                        },
                    },
                );
                Some(0)
            }
            Some(entry) => {
                entry.tracker.latest_sent_task_count = task_count;
                let previous = entry.tracker.latest_resident_object_id;
                if allocations_counter > previous {
                    entry.tracker.latest_resident_object_id = allocations_counter;
                    Some(previous)
                } else {
                    None
                }
            }
        }
    }

    #[must_use]
    pub fn tracker(&self, receiver_id: u32) -> Option<InternalAllocationsTracker> {
        self.entries.get(&receiver_id).map(|entry| entry.tracker)
    }

    /// Every tracked receiver with the task count last submitted on it.
    pub fn receivers(&self) -> impl Iterator<Item = (&Arc<dyn CommandStreamReceiver>, TaskCount)> {
        self.entries
            .values()
            .map(|entry| (&entry.receiver, entry.tracker.latest_sent_task_count))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
