// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::AllocationType;
use crate::{backend::MappedPtr, DeviceSize};

/// Identifies an own allocation within its registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct OwnAllocationId(u64);

/// A dedicated allocation, made directly against the backend instead of in a block.
#[derive(Debug)]
pub(crate) struct OwnAllocation<R> {
    pub id: OwnAllocationId,
    pub size: DeviceSize,
    pub allocation_type: AllocationType,
    pub persistent_map: bool,
    pub mapped_ptr: Option<MappedPtr>,
    /// The dedicated resource backing the allocation, if it was made through
    /// [`ResourceAllocator::allocate`].
    ///
    /// [`ResourceAllocator::allocate`]: super::ResourceAllocator::allocate
    pub resource: Option<R>,
}

/// The own allocations of one memory type that are either all persistently mapped or all not,
/// sorted by ID.
#[derive(Debug)]
pub(crate) struct OwnAllocationRegistry<R> {
    allocations: Vec<OwnAllocation<R>>,
    next_id: u64,
}

impl<R> OwnAllocationRegistry<R> {
    pub const fn new() -> Self {
        OwnAllocationRegistry {
            allocations: Vec::new(),
            next_id: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn insert(
        &mut self,
        size: DeviceSize,
        allocation_type: AllocationType,
        persistent_map: bool,
        mapped_ptr: Option<MappedPtr>,
        resource: Option<R>,
    ) -> OwnAllocationId {
        let id = OwnAllocationId(self.next_id);
        self.next_id += 1;

        // IDs only ever grow, so pushing keeps the registry sorted.
        self.allocations.push(OwnAllocation {
            id,
            size,
            allocation_type,
            persistent_map,
            mapped_ptr,
            resource,
        });

        id
    }

    pub fn remove(&mut self, id: OwnAllocationId) -> Option<OwnAllocation<R>> {
        self.search(id).map(|index| self.allocations.remove(index))
    }

    pub fn get(&self, id: OwnAllocationId) -> Option<&OwnAllocation<R>> {
        self.search(id).map(|index| &self.allocations[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &OwnAllocation<R>> {
        self.allocations.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut OwnAllocation<R>> {
        self.allocations.iter_mut()
    }

    fn search(&self, id: OwnAllocationId) -> Option<usize> {
        self.allocations
            .binary_search_by_key(&id, |allocation| allocation.id)
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(registry: &mut OwnAllocationRegistry<&'static str>, size: DeviceSize) -> OwnAllocationId {
        registry.insert(size, AllocationType::Buffer, false, None, None)
    }

    #[test]
    fn stays_sorted_through_removals() {
        let mut registry = OwnAllocationRegistry::new();
        let ids: Vec<_> = (1..=5).map(|size| insert(&mut registry, size)).collect();

        assert_eq!(registry.remove(ids[2]).unwrap().size, 3);
        assert_eq!(registry.remove(ids[0]).unwrap().size, 1);
        assert!(registry.remove(ids[0]).is_none());

        let id = insert(&mut registry, 6);
        assert!(ids.iter().all(|&old| old < id));

        let sizes: Vec<_> = registry.iter().map(|allocation| allocation.size).collect();
        assert_eq!(sizes, [2, 4, 5, 6]);
        assert_eq!(registry.get(ids[3]).unwrap().size, 4);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn keeps_resource() {
        let mut registry = OwnAllocationRegistry::new();
        let id = registry.insert(64, AllocationType::ImageOptimal, true, None, Some("texture"));

        for allocation in registry.iter_mut() {
            allocation.mapped_ptr = None;
        }

        let allocation = registry.remove(id).unwrap();
        assert_eq!(allocation.resource, Some("texture"));
        assert!(allocation.persistent_map);
        assert!(registry.is_empty());
    }
}
