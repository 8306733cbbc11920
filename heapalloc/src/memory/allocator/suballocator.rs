// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Suballocation of a single heap.
//!
//! A [`Block`] owns one heap and keeps an ordered, doubly-linked list of *suballocations* that
//! tile the heap exactly: every byte belongs to exactly one suballocation, which is either free or
//! in use by one resource. Free suballocations that are large enough are additionally referenced
//! from a *free-list* that is kept sorted by size in ascending order, so that the best fit for a
//! request can be found with a binary search.
//!
//! The list nodes live in a [`host::PoolAllocator`] and refer to each other by index, which keeps
//! the list compact and lets freed nodes be reused without going through the global allocator.

use self::host::SlotId;
use super::{
    layout::{align_down, align_up, DeviceAlignment, DeviceLayout},
    AllocationStrategy, AllocationType,
};
use crate::{backend::MappedPtr, DeviceSize};
use std::{cmp, iter};

/// Free suballocations smaller than this are not put in the free-list. They still exist in the
/// suballocation list and are merged with their neighbors when those become free.
pub(crate) const MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER: DeviceSize = 16;

/// Bytes left free before and after every suballocation that isn't at the edge of the block.
const DEBUG_MARGIN: DeviceSize = 0;

/// Minimum alignment of every suballocation.
const DEBUG_ALIGNMENT: DeviceAlignment = DeviceAlignment::MIN;

/// Identifies a block within its block vector. Never reused while the vector lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockId(pub(crate) u64);

/// Tells us if a suballocation is free, and if not, what kind of resource occupies it. This is
/// needed in order to be able to respect the buffer-image granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum SuballocationType {
    Free,
    Unknown,
    Buffer,
    BufferSrvUav,
    ImageUnknown,
    ImageLinear,
    ImageOptimal,
    ImageRtvDsv,
    ImageRtvDsvShared,
    ImageRtvDsvSharedAdapter,
}

impl SuballocationType {
    pub(crate) fn name(self) -> &'static str {
        match self {
            SuballocationType::Free => "FREE",
            SuballocationType::Unknown => "UNKNOWN",
            SuballocationType::Buffer => "BUFFER",
            SuballocationType::BufferSrvUav => "BUFFER_SRV_UAV",
            SuballocationType::ImageUnknown => "IMAGE_UNKNOWN",
            SuballocationType::ImageLinear => "IMAGE_LINEAR",
            SuballocationType::ImageOptimal => "IMAGE_OPTIMAL",
            SuballocationType::ImageRtvDsv => "IMAGE_RTV_DSV",
            SuballocationType::ImageRtvDsvShared => "IMAGE_RTV_DSV_SHARED",
            SuballocationType::ImageRtvDsvSharedAdapter => "IMAGE_RTV_DSV_SHARED_ADAPTER",
        }
    }
}

impl From<AllocationType> for SuballocationType {
    #[inline]
    fn from(ty: AllocationType) -> Self {
        match ty {
            AllocationType::Unknown => SuballocationType::Unknown,
            AllocationType::Buffer => SuballocationType::Buffer,
            AllocationType::BufferSrvUav => SuballocationType::BufferSrvUav,
            AllocationType::ImageUnknown => SuballocationType::ImageUnknown,
            AllocationType::ImageLinear => SuballocationType::ImageLinear,
            AllocationType::ImageOptimal => SuballocationType::ImageOptimal,
            AllocationType::ImageRtvDsv => SuballocationType::ImageRtvDsv,
            AllocationType::ImageRtvDsvShared => SuballocationType::ImageRtvDsvShared,
            AllocationType::ImageRtvDsvSharedAdapter => {
                SuballocationType::ImageRtvDsvSharedAdapter
            }
        }
    }
}

/// Whether two suballocations of the given types must not share a page of the buffer-image
/// granularity. The relation is symmetric.
fn has_granularity_conflict(ty1: SuballocationType, ty2: SuballocationType) -> bool {
    use SuballocationType::*;

    let (ty1, ty2) = if ty1 > ty2 { (ty2, ty1) } else { (ty1, ty2) };

    match ty1 {
        Free => false,
        Unknown => true,
        Buffer => matches!(ty2, ImageUnknown | ImageOptimal),
        ImageUnknown => matches!(ty2, ImageUnknown | ImageLinear | ImageOptimal),
        ImageLinear => ty2 == ImageOptimal,
        ImageOptimal => false,
        BufferSrvUav | ImageRtvDsv | ImageRtvDsvShared | ImageRtvDsvSharedAdapter => true,
    }
}

/// Checks whether the end of A and the start of B fall on the same page.
///
/// > **Note**: Assumes `a_offset + a_size > 0` and `a_offset + a_size <= b_offset`.
fn are_blocks_on_same_page(
    a_offset: DeviceSize,
    a_size: DeviceSize,
    b_offset: DeviceSize,
    page_size: DeviceAlignment,
) -> bool {
    debug_assert!(a_offset + a_size > 0);
    debug_assert!(a_offset + a_size <= b_offset);

    let a_end = a_offset + a_size - 1;
    let a_end_page = align_down(a_end, page_size);
    let b_start_page = align_down(b_offset, page_size);

    a_end_page == b_start_page
}

/// A contiguous range of a block, as seen from the outside.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Suballocation {
    pub offset: DeviceSize,
    pub size: DeviceSize,
    pub ty: SuballocationType,
}

#[derive(Clone, Copy, Debug)]
struct SuballocationListNode {
    prev: Option<SlotId>,
    next: Option<SlotId>,
    offset: DeviceSize,
    size: DeviceSize,
    ty: SuballocationType,
}

/// A place in a block where an allocation can be made, as found by
/// [`Block::create_allocation_request`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct AllocationRequest {
    item: SlotId,
    pub offset: DeviceSize,
}

/// One heap together with the bookkeeping of its suballocations.
#[derive(Debug)]
pub(crate) struct Block<H> {
    id: BlockId,
    heap: H,
    size: DeviceSize,
    persistent_map: bool,
    mapped_ptr: Option<MappedPtr>,
    nodes: host::PoolAllocator<SuballocationListNode>,
    // The suballocation at offset 0.
    head: SlotId,
    // Free suballocations sorted by size in ascending order. Only those of at least
    // `MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER` bytes are in here.
    free_list: Vec<SlotId>,
    // Number of free suballocations, registered or not.
    free_count: u32,
    sum_free_size: DeviceSize,
}

impl<H> Block<H> {
    /// Creates a block spanning all of `heap`, which must be `size` bytes large. The block starts
    /// out as a single free suballocation.
    pub fn new(
        id: BlockId,
        heap: H,
        size: DeviceSize,
        persistent_map: bool,
        mapped_ptr: Option<MappedPtr>,
    ) -> Self {
        // Rough guess, only used to size the node pool up front.
        const AVERAGE_ALLOCATION_SIZE: DeviceSize = 64 * 1024;

        debug_assert!(size > 0);

        let capacity = usize::try_from(size / AVERAGE_ALLOCATION_SIZE).unwrap_or(usize::MAX / 2);
        let capacity = cmp::min(capacity, 4096);
        let mut nodes = host::PoolAllocator::new(capacity + 64);
        let head = nodes.allocate(SuballocationListNode {
            prev: None,
            next: None,
            offset: 0,
            size,
            ty: SuballocationType::Free,
        });

        let mut block = Block {
            id,
            heap,
            size,
            persistent_map,
            mapped_ptr,
            nodes,
            head,
            free_list: Vec::with_capacity(capacity / 16 + 16),
            free_count: 1,
            sum_free_size: size,
        };
        block.register_free(head);

        block
    }

    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[inline]
    pub fn heap(&self) -> &H {
        &self.heap
    }

    /// Consumes the block and returns the heap, so that it can be destroyed.
    #[inline]
    pub fn into_heap(self) -> H {
        self.heap
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    #[inline]
    pub fn sum_free_size(&self) -> DeviceSize {
        self.sum_free_size
    }

    #[inline]
    pub fn free_count(&self) -> u32 {
        self.free_count
    }

    #[inline]
    pub fn suballocation_count(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn mapped_ptr(&self) -> Option<MappedPtr> {
        self.mapped_ptr
    }

    #[inline]
    pub fn set_mapped_ptr(&mut self, mapped_ptr: Option<MappedPtr>) {
        debug_assert!(self.persistent_map || mapped_ptr.is_none());

        self.mapped_ptr = mapped_ptr;
    }

    /// Returns `true` if the whole block is one free suballocation.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.suballocation_count() == 1 && self.free_count == 1
    }

    /// Iterates over all suballocations in order of their offsets.
    pub fn suballocations(&self) -> impl Iterator<Item = Suballocation> + '_ {
        iter::successors(Some(self.nodes.get(self.head)), move |node| {
            node.next.map(|id| self.nodes.get(id))
        })
        .map(|node| Suballocation {
            offset: node.offset,
            size: node.size,
            ty: node.ty,
        })
    }

    /// Searches the free-list for a place where an allocation with the given layout and type
    /// could be made, without changing anything.
    ///
    /// With [`AllocationStrategy::BestFit`], the smallest free suballocation that is large enough
    /// and passes [`check_allocation`] is chosen. With [`AllocationStrategy::WorstFit`], the
    /// largest ones are tried first.
    ///
    /// [`check_allocation`]: Self::check_allocation
    pub fn create_allocation_request(
        &self,
        buffer_image_granularity: DeviceAlignment,
        layout: DeviceLayout,
        allocation_type: AllocationType,
        strategy: AllocationStrategy,
    ) -> Option<AllocationRequest> {
        let size = layout.size();
        let ty = SuballocationType::from(allocation_type);

        // There is not enough free space in total.
        if self.sum_free_size < size {
            return None;
        }

        let try_candidate = |&id: &SlotId| {
            self.check_allocation(buffer_image_granularity, layout, ty, id)
                .map(|offset| AllocationRequest { item: id, offset })
        };

        match strategy {
            AllocationStrategy::BestFit => {
                // First free suballocation with a size not less than the requested size.
                let index = self
                    .free_list
                    .partition_point(|&id| self.nodes.get(id).size < size);

                self.free_list[index..].iter().find_map(try_candidate)
            }
            AllocationStrategy::WorstFit => self.free_list.iter().rev().find_map(try_candidate),
        }
    }

    /// Checks if an allocation with the given layout and type fits into the free suballocation
    /// `item`, and if so returns the offset at which it would be placed.
    fn check_allocation(
        &self,
        buffer_image_granularity: DeviceAlignment,
        layout: DeviceLayout,
        ty: SuballocationType,
        item: SlotId,
    ) -> Option<DeviceSize> {
        let suballoc = self.nodes.get(item);
        let size = layout.size();

        debug_assert!(suballoc.ty == SuballocationType::Free);
        debug_assert!(ty != SuballocationType::Free);

        let mut offset = suballoc.offset;

        if DEBUG_MARGIN > 0 && suballoc.prev.is_some() {
            offset += DEBUG_MARGIN;
        }

        offset = align_up(offset, cmp::max(layout.alignment(), DEBUG_ALIGNMENT))?;

        // Move the allocation to the next page if a previous suballocation on the same page has a
        // conflicting type.
        if buffer_image_granularity > DeviceAlignment::MIN {
            let mut prev_id = suballoc.prev;

            while let Some(id) = prev_id {
                let prev = self.nodes.get(id);

                if !are_blocks_on_same_page(prev.offset, prev.size, offset, buffer_image_granularity)
                {
                    break;
                }

                if has_granularity_conflict(prev.ty, ty) {
                    offset = align_up(offset, buffer_image_granularity)?;
                    break;
                }

                prev_id = prev.prev;
            }
        }

        let padding_begin = offset - suballoc.offset;
        let required_end_margin = if suballoc.next.is_some() {
            DEBUG_MARGIN
        } else {
            0
        };

        if padding_begin
            .checked_add(size)?
            .checked_add(required_end_margin)?
            > suballoc.size
        {
            return None;
        }

        // A conflicting suballocation on the same page as the end of this one can't be moved out
        // of the way, so the candidate is rejected.
        if buffer_image_granularity > DeviceAlignment::MIN {
            let mut next_id = suballoc.next;

            while let Some(id) = next_id {
                let next = self.nodes.get(id);

                if !are_blocks_on_same_page(offset, size, next.offset, buffer_image_granularity) {
                    break;
                }

                if has_granularity_conflict(ty, next.ty) {
                    return None;
                }

                next_id = next.next;
            }
        }

        Some(offset)
    }

    /// Returns the request for an allocation at the very start of an empty block.
    #[inline]
    pub fn whole_block_request(&self) -> AllocationRequest {
        debug_assert!(self.is_empty());

        AllocationRequest {
            item: self.head,
            offset: 0,
        }
    }

    /// Turns the free suballocation of `request` into one of the given type and size, splitting
    /// off free suballocations at either end as needed.
    pub fn alloc(
        &mut self,
        request: AllocationRequest,
        allocation_type: AllocationType,
        size: DeviceSize,
    ) {
        let AllocationRequest { item, offset } = request;
        let node = self.nodes.get(item);

        debug_assert!(node.ty == SuballocationType::Free);
        debug_assert!(offset >= node.offset);
        debug_assert!(offset - node.offset + size <= node.size);

        // These can't overflow because the request was checked to fit inside the node.
        let padding_begin = offset - node.offset;
        let padding_end = node.size - padding_begin - size;

        self.unregister_free(item);

        {
            let node = self.nodes.get_mut(item);
            node.offset = offset;
            node.size = size;
            node.ty = allocation_type.into();
        }

        if padding_end > 0 {
            let padding_id = self.insert_after(item, offset + size, padding_end);
            self.register_free(padding_id);
        }

        if padding_begin > 0 {
            let padding_id = self.insert_before(item, offset - padding_begin, padding_begin);
            self.register_free(padding_id);
        }

        self.free_count -= 1;

        if padding_begin > 0 {
            self.free_count += 1;
        }

        if padding_end > 0 {
            self.free_count += 1;
        }

        self.sum_free_size -= size;
    }

    /// Frees the suballocation that starts at `offset`, merging it with free neighbors.
    ///
    /// # Panics
    ///
    /// - Panics if no suballocation in use starts at `offset`. This means that the allocation
    ///   doesn't belong to this block and the bookkeeping of the allocator is corrupted.
    pub fn free(&mut self, offset: DeviceSize) {
        let mut cursor = Some(self.head);

        while let Some(id) = cursor {
            let node = self.nodes.get(id);

            if node.offset == offset {
                assert!(
                    node.ty != SuballocationType::Free,
                    "attempted to free the suballocation at offset {} of block {:?}, which is \
                    already free",
                    offset,
                    self.id,
                );

                self.free_suballocation(id);

                return;
            }

            if node.offset > offset {
                break;
            }

            cursor = node.next;
        }

        panic!(
            "attempted to free a suballocation at offset {} that doesn't exist in block {:?}",
            offset, self.id,
        );
    }

    fn free_suballocation(&mut self, id: SlotId) {
        let node = self.nodes.get_mut(id);
        node.ty = SuballocationType::Free;
        let SuballocationListNode {
            prev, next, size, ..
        } = *node;

        self.free_count += 1;
        // Suballocation sizes are constrained by the size of the block, so they can't possibly
        // overflow when added up.
        self.sum_free_size += size;

        let is_free = |id: &SlotId| self.nodes.get(*id).ty == SuballocationType::Free;
        let free_next = next.filter(is_free);
        let free_prev = prev.filter(is_free);

        if let Some(next_id) = free_next {
            self.unregister_free(next_id);
            self.merge_free_with_next(id);
        }

        if let Some(prev_id) = free_prev {
            self.unregister_free(prev_id);
            self.merge_free_with_next(prev_id);
            self.register_free(prev_id);
        } else {
            self.register_free(id);
        }
    }

    /// Absorbs the (free) successor of the (free) suballocation `id` into it.
    fn merge_free_with_next(&mut self, id: SlotId) {
        let node = self.nodes.get(id);
        let Some(next_id) = node.next else {
            unreachable!("merging a suballocation that has no successor");
        };
        let next = self.nodes.get(next_id);

        debug_assert!(node.ty == SuballocationType::Free);
        debug_assert!(next.ty == SuballocationType::Free);

        let node = self.nodes.get_mut(id);
        node.size += next.size;
        node.next = next.next;

        if let Some(after_id) = next.next {
            self.nodes.get_mut(after_id).prev = Some(id);
        }

        self.nodes.free(next_id);
        self.free_count -= 1;
    }

    fn insert_before(&mut self, id: SlotId, offset: DeviceSize, size: DeviceSize) -> SlotId {
        let prev = self.nodes.get(id).prev;
        let new_id = self.nodes.allocate(SuballocationListNode {
            prev,
            next: Some(id),
            offset,
            size,
            ty: SuballocationType::Free,
        });

        match prev {
            Some(prev_id) => self.nodes.get_mut(prev_id).next = Some(new_id),
            None => self.head = new_id,
        }

        self.nodes.get_mut(id).prev = Some(new_id);

        new_id
    }

    fn insert_after(&mut self, id: SlotId, offset: DeviceSize, size: DeviceSize) -> SlotId {
        let next = self.nodes.get(id).next;
        let new_id = self.nodes.allocate(SuballocationListNode {
            prev: Some(id),
            next,
            offset,
            size,
            ty: SuballocationType::Free,
        });

        if let Some(next_id) = next {
            self.nodes.get_mut(next_id).prev = Some(new_id);
        }

        self.nodes.get_mut(id).next = Some(new_id);

        new_id
    }

    /// Inserts the free suballocation into the free-list, unless it's too small to be worth it.
    fn register_free(&mut self, id: SlotId) {
        let node = self.nodes.get(id);

        debug_assert!(node.ty == SuballocationType::Free);
        debug_assert!(node.size > 0);

        if node.size >= MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
            let index = self
                .free_list
                .partition_point(|&other| self.nodes.get(other).size < node.size);
            self.free_list.insert(index, id);
        }
    }

    /// Removes the free suballocation from the free-list, if it was registered.
    fn unregister_free(&mut self, id: SlotId) {
        let node = self.nodes.get(id);

        debug_assert!(node.ty == SuballocationType::Free);

        if node.size < MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
            return;
        }

        // There may be multiple free suballocations with the same size, so we need to find the
        // one corresponding to the target ID among them.
        let start = self
            .free_list
            .partition_point(|&other| self.nodes.get(other).size < node.size);

        for index in start..self.free_list.len() {
            let other = self.free_list[index];

            if other == id {
                self.free_list.remove(index);
                return;
            }

            if self.nodes.get(other).size != node.size {
                break;
            }
        }

        unreachable!("a registered free suballocation is missing from the free-list");
    }

    /// Recomputes all bookkeeping from the suballocation list and returns whether it matches.
    ///
    /// This walks the whole block, so it is only meant for debug assertions and tests.
    pub fn validate(&self) -> bool {
        let mut calculated_offset = 0;
        let mut calculated_free_count = 0;
        let mut calculated_sum_free_size = 0;
        let mut calculated_node_count = 0;
        let mut free_suballocations_to_register = 0;
        let mut prev_free = false;
        let mut prev_id = None;
        let mut cursor = Some(self.head);

        while let Some(id) = cursor {
            let node = self.nodes.get(id);

            if node.prev != prev_id || node.offset != calculated_offset || node.size == 0 {
                return false;
            }

            let free = node.ty == SuballocationType::Free;

            // Two adjacent free suballocations should have been merged.
            if prev_free && free {
                return false;
            }

            if free {
                calculated_sum_free_size += node.size;
                calculated_free_count += 1;

                if node.size >= MIN_FREE_SUBALLOCATION_SIZE_TO_REGISTER {
                    free_suballocations_to_register += 1;
                }
            }

            calculated_offset += node.size;
            calculated_node_count += 1;
            prev_free = free;
            prev_id = Some(id);
            cursor = node.next;
        }

        if self.free_list.len() != free_suballocations_to_register {
            return false;
        }

        let mut last_size = 0;

        for &id in &self.free_list {
            let node = self.nodes.get(id);

            if node.ty != SuballocationType::Free || node.size < last_size {
                return false;
            }

            last_size = node.size;
        }

        calculated_offset == self.size
            && calculated_sum_free_size == self.sum_free_size
            && calculated_free_count == self.free_count
            && calculated_node_count == self.nodes.len()
    }

    /// Returns whether no two suballocations with conflicting types share a page.
    #[cfg(test)]
    pub(crate) fn respects_granularity(&self, buffer_image_granularity: DeviceAlignment) -> bool {
        let used = self
            .suballocations()
            .filter(|suballoc| suballoc.ty != SuballocationType::Free)
            .collect::<Vec<_>>();

        used.iter().enumerate().all(|(i, a)| {
            used[i + 1..]
                .iter()
                .take_while(|b| {
                    are_blocks_on_same_page(a.offset, a.size, b.offset, buffer_image_granularity)
                })
                .all(|b| !has_granularity_conflict(a.ty, b.ty))
        })
    }

    #[cfg(test)]
    pub(crate) fn free_list_sizes(&self) -> Vec<DeviceSize> {
        self.free_list
            .iter()
            .map(|&id| self.nodes.get(id).size)
            .collect()
    }
}

/// Allocators for memory on the host, used to speed up the allocators for the device.
mod host {
    use std::num::NonZeroUsize;

    /// Allocates objects from a pool on the host.
    ///
    /// The allocator doesn't hand out pointers but rather IDs that are relative to the pool. Freed
    /// slots are reused before the pool grows, so a linked structure whose nodes come and go
    /// keeps a stable footprint.
    #[derive(Debug)]
    pub(super) struct PoolAllocator<T> {
        pool: Vec<T>,
        // Unsorted list of free slots.
        free_list: Vec<SlotId>,
    }

    impl<T> PoolAllocator<T> {
        pub fn new(capacity: usize) -> Self {
            debug_assert!(capacity > 0);

            PoolAllocator {
                pool: Vec::with_capacity(capacity),
                free_list: Vec::new(),
            }
        }

        /// Allocates a slot and initializes it with the provided value. Returns the ID of the slot.
        pub fn allocate(&mut self, val: T) -> SlotId {
            if let Some(id) = self.free_list.pop() {
                self.pool[id.index()] = val;

                id
            } else {
                let id = SlotId(NonZeroUsize::MIN.saturating_add(self.pool.len()));
                self.pool.push(val);

                id
            }
        }

        /// Returns the slot with the given ID to the allocator to be reused. The ID must not be
        /// used afterward.
        pub fn free(&mut self, id: SlotId) {
            debug_assert!(!self.free_list.contains(&id));

            self.free_list.push(id);
        }

        /// Returns a mutable reference to the slot with the given ID.
        pub fn get_mut(&mut self, id: SlotId) -> &mut T {
            debug_assert!(!self.free_list.contains(&id));

            &mut self.pool[id.index()]
        }

        /// Returns the number of occupied slots.
        pub fn len(&self) -> usize {
            self.pool.len() - self.free_list.len()
        }
    }

    impl<T: Copy> PoolAllocator<T> {
        /// Returns a copy of the slot with the given ID.
        pub fn get(&self, id: SlotId) -> T {
            debug_assert!(!self.free_list.contains(&id));

            self.pool[id.index()]
        }
    }

    /// ID of a slot in the pool of the `host::PoolAllocator`. This is used to limit the visibility
    /// of the actual ID to this `host` module.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(in super::super) struct SlotId(NonZeroUsize);

    impl SlotId {
        #[inline]
        fn index(self) -> usize {
            self.0.get() - 1
        }
    }
}
