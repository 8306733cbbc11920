// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    layout::{DeviceAlignment, DeviceLayout},
    suballocator::{Block, BlockId},
    AllocationStrategy, AllocationType,
};
use crate::{backend::MappedPtr, DeviceSize};

/// The blocks of one memory type that are either all persistently mapped or all not.
///
/// Blocks are kept roughly sorted by their free space in ascending order, so that searching from
/// the front fills up nearly-full blocks first and leaves the emptier ones a chance to become
/// entirely free.
#[derive(Debug)]
pub(crate) struct BlockVector<H> {
    blocks: Vec<Block<H>>,
    next_block_id: u64,
}

/// Where an allocation was placed by a [`BlockVector`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BlockAllocation<H> {
    pub block_id: BlockId,
    pub offset: DeviceSize,
    /// Whether the block was empty before the allocation was made.
    pub was_empty: bool,
    /// The heap of the block, for placing a resource in it.
    pub heap: H,
}

impl<H> BlockVector<H> {
    pub const fn new() -> Self {
        BlockVector {
            blocks: Vec::new(),
            next_block_id: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[inline]
    pub fn blocks(&self) -> &[Block<H>] {
        &self.blocks
    }

    #[inline]
    pub fn blocks_mut(&mut self) -> &mut [Block<H>] {
        &mut self.blocks
    }

    /// Returns the index of the block with the given ID.
    pub fn position(&self, block_id: BlockId) -> Option<usize> {
        self.blocks.iter().position(|block| block.id() == block_id)
    }

    /// Returns the block with the given ID.
    pub fn get(&self, block_id: BlockId) -> Option<&Block<H>> {
        self.blocks.iter().find(|block| block.id() == block_id)
    }

    /// Frees the suballocation at `offset` of the block with the given ID and returns whether the
    /// block is empty afterward.
    ///
    /// # Panics
    ///
    /// - Panics if there is no block with the given ID, or if the block has no suballocation at
    ///   `offset`.
    pub fn free(&mut self, block_id: BlockId, offset: DeviceSize) -> bool {
        let Some(block) = self.blocks.iter_mut().find(|block| block.id() == block_id) else {
            panic!("attempted to free an allocation of block {block_id:?}, which doesn't exist");
        };

        block.free(offset);
        debug_assert!(block.validate());

        block.is_empty()
    }

    /// Removes the block with the given ID from the vector.
    pub fn remove(&mut self, block_id: BlockId) -> Option<Block<H>> {
        self.position(block_id).map(|index| self.blocks.remove(index))
    }

    /// Does one step of a bubble sort by free space, stopping at the first swap.
    ///
    /// Calling this after every change keeps the blocks close to sorted without ever paying for a
    /// full sort.
    pub fn incrementally_sort_blocks(&mut self) {
        for i in 1..self.blocks.len() {
            if self.blocks[i - 1].sum_free_size() > self.blocks[i].sum_free_size() {
                self.blocks.swap(i - 1, i);
                return;
            }
        }
    }

    /// Removes all blocks from the vector.
    pub fn drain(&mut self) -> impl Iterator<Item = Block<H>> + '_ {
        self.blocks.drain(..)
    }
}

impl<H: Clone> BlockVector<H> {
    /// Tries to make the allocation in one of the existing blocks, going from the block with the
    /// least free space to the one with the most.
    pub fn allocate(
        &mut self,
        buffer_image_granularity: DeviceAlignment,
        layout: DeviceLayout,
        allocation_type: AllocationType,
        strategy: AllocationStrategy,
    ) -> Option<BlockAllocation<H>> {
        for block in &mut self.blocks {
            let Some(request) = block.create_allocation_request(
                buffer_image_granularity,
                layout,
                allocation_type,
                strategy,
            ) else {
                continue;
            };

            let was_empty = block.is_empty();
            block.alloc(request, allocation_type, layout.size());
            debug_assert!(block.validate());

            return Some(BlockAllocation {
                block_id: block.id(),
                offset: request.offset,
                was_empty,
                heap: block.heap().clone(),
            });
        }

        None
    }

    /// Adds a new block covering `heap` and makes the allocation at its start.
    ///
    /// The caller must make sure that `size` is at least `allocation_size`.
    pub fn allocate_in_new_block(
        &mut self,
        heap: H,
        size: DeviceSize,
        persistent_map: bool,
        mapped_ptr: Option<MappedPtr>,
        allocation_type: AllocationType,
        allocation_size: DeviceSize,
    ) -> BlockAllocation<H> {
        debug_assert!(size >= allocation_size);

        let block_id = BlockId(self.next_block_id);
        self.next_block_id += 1;

        let mut block = Block::new(block_id, heap.clone(), size, persistent_map, mapped_ptr);
        let request = block.whole_block_request();
        block.alloc(request, allocation_type, allocation_size);
        debug_assert!(block.validate());

        self.blocks.push(block);

        BlockAllocation {
            block_id,
            offset: request.offset,
            was_empty: true,
            heap,
        }
    }
}
