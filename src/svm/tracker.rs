use super::{SvmAllocationData, SvmMapOperation};
use std::collections::BTreeMap;

/// Live allocations kept in a vector sorted by base address.
///
/// Lookups accept interior pointers: the nearest record whose base does not
/// exceed the pointer is returned when the pointer falls inside it.
#[derive(Debug, Default)]
pub struct SortedAllocationTracker {
    allocations: Vec<SvmAllocationData>,
}

impl SortedAllocationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `data`, replacing any record tracked under the same base pointer.
    pub fn insert(&mut self, data: SvmAllocationData) -> Option<SvmAllocationData> {
        let address = data.address();
        let index = self.allocations.partition_point(|d| d.address() < address);

        if self.allocations.get(index).is_some_and(|d| d.address() == address) {
            return Some(std::mem::replace(&mut self.allocations[index], data));
        }
        self.allocations.insert(index, data);
        None
    }

    /// Removes the record tracked under exactly `ptr`.
    pub fn remove(&mut self, ptr: u64) -> Option<SvmAllocationData> {
        let index = self
            .allocations
            .binary_search_by_key(&ptr, SvmAllocationData::address)
            .ok()?;
        Some(self.allocations.remove(index))
    }

    #[must_use]
    pub fn get(&self, ptr: u64) -> Option<&SvmAllocationData> {
        self.index_of(ptr).map(|index| &self.allocations[index])
    }

    pub fn get_mut(&mut self, ptr: u64) -> Option<&mut SvmAllocationData> {
        self.index_of(ptr).map(|index| &mut self.allocations[index])
    }

    fn index_of(&self, ptr: u64) -> Option<usize> {
        if ptr == 0 {
            return None;
        }
        let index = self.allocations.partition_point(|d| d.address() <= ptr);
        let index = index.checked_sub(1)?;
        self.allocations[index].contains(ptr).then_some(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SvmAllocationData> {
        self.allocations.iter()
    }

    pub fn take_all(&mut self) -> Vec<SvmAllocationData> {
        std::mem::take(&mut self.allocations)
    }
}

/// Records parked for deferred free, keyed by base pointer.
#[derive(Debug, Default)]
pub struct MapBasedAllocationTracker {
    allocations: BTreeMap<u64, SvmAllocationData>,
}

impl MapBasedAllocationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, data: SvmAllocationData) -> Option<SvmAllocationData> {
        self.allocations.insert(data.address(), data)
    }

    pub fn remove(&mut self, ptr: u64) -> Option<SvmAllocationData> {
        self.allocations.remove(&ptr)
    }

    /// Same interior-pointer semantics as [`SortedAllocationTracker::get`].
    #[must_use]
    pub fn get(&self, ptr: u64) -> Option<&SvmAllocationData> {
        if ptr == 0 {
            return None;
        }
        self.allocations
            .range(..=ptr)
            .next_back()
            .map(|(_, data)| data)
            .filter(|data| data.contains(ptr))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn take_all(&mut self) -> Vec<SvmAllocationData> {
        std::mem::take(&mut self.allocations).into_values().collect()
    }
}

/// Host map operations keyed by region pointer. Exact keys, last write wins.
#[derive(Debug, Default)]
pub struct MapOperationsTracker {
    operations: BTreeMap<u64, SvmMapOperation>,
}

impl MapOperationsTracker {
    pub fn insert(&mut self, operation: SvmMapOperation) {
        self.operations.insert(operation.region_svm_ptr, operation);
    }

    pub fn remove(&mut self, region_ptr: u64) -> Option<SvmMapOperation> {
        self.operations.remove(&region_ptr)
    }

    #[must_use]
    pub fn get(&self, region_ptr: u64) -> Option<&SvmMapOperation> {
        self.operations.get(&region_ptr)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
