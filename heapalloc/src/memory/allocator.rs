// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The resource allocator and everything it is configured with.
//!
//! # Memory types
//!
//! Every resource is assigned one of a fixed set of [memory types] based on what kind of resource
//! it is, how it is going to be used, its size, and whether it is multisampled or shared. Each
//! memory type creates its heaps with fixed properties (storage mode, cache mode, and whether the
//! large or the small block size is used). Memory types never share heaps.
//!
//! # Blocks and own allocations
//!
//! Most resources that only the GPU accesses end up in a *block*: a heap of the preferred block
//! size, which is carved up into suballocations. Finding room in an existing block costs a binary
//! search in the block's free-list, while creating a heap is a round trip to the driver, so blocks
//! are kept around and reused. One empty block per memory type is retained even when nothing is
//! allocated from it anymore, so that an allocation that is repeatedly made and freed doesn't
//! create and destroy a heap each time.
//!
//! An allocation is made as an *own* allocation instead, bypassing the blocks, when:
//!
//! - the memory is going to be accessed by the host, as given by [`MemoryUsage`],
//! - the caller asks for it with [`AllocationCreateFlags::OWN_MEMORY`],
//! - the allocation is larger than half the preferred block size of its memory type, or
//! - no heap of the preferred size (or half or quarter of it) could be created.
//!
//! # Buffer-image granularity
//!
//! Some hardware requires that linear and non-linear resources don't share a page of a certain
//! size, called the buffer-image granularity. When a [granularity] larger than 1 is configured,
//! the allocator moves a suballocation to the next page if a neighbor on the same page is of a
//! conflicting [`AllocationType`].
//!
//! # Persistent mapping
//!
//! Allocations made with [`AllocationCreateFlags::PERSISTENT_MAP`] are kept apart from the others
//! and are mapped for their entire lifetime. Some drivers require all such mappings of the upload
//! memory types to be released temporarily, which is what
//! [`ResourceAllocator::unmap_all_persistent`] and [`ResourceAllocator::remap_all_persistent`] are
//! for.
//!
//! [memory types]: MemoryType
//! [granularity]: ResourceAllocatorCreateInfo::buffer_image_granularity

mod block_vector;
pub mod layout;
mod memory_type;
mod own;
pub mod stats;
mod suballocator;

pub use self::{
    layout::{DeviceAlignment, DeviceLayout},
    memory_type::{BlockSizeClass, HeapProperties, MemoryType},
    stats::{AllocatorStats, StatInfo},
};
use self::{
    block_vector::{BlockAllocation, BlockVector},
    own::{OwnAllocationId, OwnAllocationRegistry},
    stats::{BlockRecord, DetailedMap, OwnAllocationRecord},
    suballocator::BlockId,
};
use crate::{
    backend::{MappedPtr, MemoryBackend},
    sync::AllocatorMutex,
    DeviceSize, NonExhaustive,
};
use bitflags::bitflags;
use log::{debug, warn};
use parking_lot::Mutex;
use std::{
    any::Any,
    array,
    error::Error,
    fmt::{self, Display},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

const M: DeviceSize = 1024 * 1024;

const DEFAULT_LARGE_HEAP_BLOCK_SIZE: DeviceSize = 64 * M;
const DEFAULT_SMALL_HEAP_BLOCK_SIZE: DeviceSize = 16 * M;

/// The memory types whose persistent mappings are released by
/// [`ResourceAllocator::unmap_all_persistent`].
const UNMAPPABLE_MEMORY_TYPES: [MemoryType; 2] = [MemoryType::UploadBuffer, MemoryType::UploadUav];

/// Arbitrary data that can be attached to an allocation.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Describes what kind of resource an allocation is for.
///
/// This decides both the [memory type] of the allocation and which allocations may share a page
/// of the buffer-image granularity.
///
/// [memory type]: MemoryType
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AllocationType {
    /// The type of resource is unknown. Such an allocation conflicts with every other type, and
    /// has no memory type.
    Unknown,

    /// A plain buffer.
    Buffer,

    /// A buffer that is bound as a shader resource or for unordered access.
    BufferSrvUav,

    /// An image whose tiling is unknown.
    ImageUnknown,

    /// An image with linear tiling.
    ImageLinear,

    /// An image with optimal tiling.
    ImageOptimal,

    /// An image that is used as a render target or depth-stencil attachment.
    ImageRtvDsv,

    /// A render target that is shared with other processes.
    ImageRtvDsvShared,

    /// A render target that is shared with other adapters.
    ImageRtvDsvSharedAdapter,
}

/// Describes how the memory of an allocation is going to be used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// The memory is intended to only be used by the GPU.
    ///
    /// This is the only usage for which allocations are made in blocks.
    #[default]
    GpuOnly,

    /// The memory is intended to be written by the host and is rarely used by the GPU, like the
    /// source of a transfer.
    CpuOnly,

    /// The memory is intended for upload to the GPU, like a vertex buffer that is rewritten every
    /// frame.
    CpuToGpu,

    /// The memory is intended for download from the GPU.
    GpuToCpu,
}

bitflags! {
    /// Flags that control how an allocation is made.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AllocationCreateFlags: u32 {
        /// Always make an own allocation instead of allocating from a block.
        ///
        /// May not be combined with [`NEVER_ALLOCATE`](Self::NEVER_ALLOCATE).
        const OWN_MEMORY = 1 << 0;

        /// Never create a new heap for the allocation. If no existing block has room, the
        /// allocation fails with [`AllocatorError::CapacityExhausted`].
        const NEVER_ALLOCATE = 1 << 1;

        /// Keep the memory mapped for as long as the allocation lives.
        const PERSISTENT_MAP = 1 << 2;

        /// The resource is shared with other processes.
        const SHARED = 1 << 3;

        /// The resource is shared with other adapters.
        const SHARED_ADAPTER = 1 << 4;
    }
}

bitflags! {
    /// Flags that control the behavior of a [`ResourceAllocator`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AllocatorCreateFlags: u32 {
        /// The allocator is never used from more than one thread at a time, so it doesn't need to
        /// lock anything.
        ///
        /// This can only be passed to [`ResourceAllocator::new_unchecked`].
        const EXTERNALLY_SYNCHRONIZED = 1 << 0;
    }
}

/// How a free suballocation is chosen among those that are large enough.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AllocationStrategy {
    /// Choose the smallest free suballocation that fits, which leaves larger ones intact.
    #[default]
    BestFit,

    /// Choose the largest free suballocation first.
    WorstFit,
}

/// The memory requirements of a resource, as reported by
/// [`MemoryBackend::memory_requirements`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryRequirements {
    /// Size and alignment of the memory the resource needs.
    pub layout: DeviceLayout,

    /// What kind of resource the memory is for.
    pub allocation_type: AllocationType,

    /// Whether the resource is a multisampled image.
    pub multisampled: bool,
}

/// Parameters to create a new [`ResourceAllocator`].
#[derive(Clone, Debug)]
pub struct ResourceAllocatorCreateInfo {
    /// Flags to control the behavior of the allocator.
    ///
    /// The default value is empty.
    pub flags: AllocatorCreateFlags,

    /// The size of the heaps that memory types with [`BlockSizeClass::Large`] create. 0 means the
    /// default of 64 MiB.
    ///
    /// The default value is `0`.
    pub preferred_large_heap_block_size: DeviceSize,

    /// The size of the heaps that memory types with [`BlockSizeClass::Small`] create. 0 means the
    /// default of 16 MiB.
    ///
    /// The default value is `0`.
    pub preferred_small_heap_block_size: DeviceSize,

    /// The page size that suballocations of conflicting types may not share.
    ///
    /// The default value is [`DeviceAlignment::MIN`], which means that resources of any type can
    /// be placed next to each other.
    pub buffer_image_granularity: DeviceAlignment,

    /// How free suballocations are chosen.
    ///
    /// The default value is [`AllocationStrategy::BestFit`].
    pub allocation_strategy: AllocationStrategy,

    pub _ne: NonExhaustive,
}

impl Default for ResourceAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        ResourceAllocatorCreateInfo {
            flags: AllocatorCreateFlags::empty(),
            preferred_large_heap_block_size: 0,
            preferred_small_heap_block_size: 0,
            buffer_image_granularity: DeviceAlignment::MIN,
            allocation_strategy: AllocationStrategy::BestFit,
            _ne: NonExhaustive(()),
        }
    }
}

impl ResourceAllocatorCreateInfo {
    fn validate(&self) {
        assert!(
            !self
                .flags
                .contains(AllocatorCreateFlags::EXTERNALLY_SYNCHRONIZED),
            "`AllocatorCreateFlags::EXTERNALLY_SYNCHRONIZED` can only be used with \
            `ResourceAllocator::new_unchecked`",
        );
    }
}

/// Parameters to create a new allocation using a [`ResourceAllocator`].
#[derive(Clone, Debug)]
pub struct AllocationCreateInfo {
    /// How the memory is going to be used.
    ///
    /// The default value is [`MemoryUsage::GpuOnly`].
    pub usage: MemoryUsage,

    /// Flags to control how the allocation is made.
    ///
    /// The default value is empty.
    pub flags: AllocationCreateFlags,

    /// Data to attach to the allocation.
    ///
    /// The default value is [`None`].
    pub user_data: Option<UserData>,

    pub _ne: NonExhaustive,
}

impl Default for AllocationCreateInfo {
    #[inline]
    fn default() -> Self {
        AllocationCreateInfo {
            usage: MemoryUsage::GpuOnly,
            flags: AllocationCreateFlags::empty(),
            user_data: None,
            _ne: NonExhaustive(()),
        }
    }
}

/// Error that can be returned when creating an allocation using a [`ResourceAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocatorError {
    /// The combination of allocation type, usage and flags doesn't correspond to any memory type.
    ClassificationFailure,

    /// No existing block has room for the allocation, and creating a new one was forbidden with
    /// [`AllocationCreateFlags::NEVER_ALLOCATE`].
    CapacityExhausted,

    /// The backend failed to create the resource.
    BackendAllocationFailure,

    /// [`AllocationCreateFlags::OWN_MEMORY`] and [`AllocationCreateFlags::NEVER_ALLOCATE`] were
    /// both given.
    InvalidConfiguration,

    /// Failed to map memory.
    MemoryMapFailed,
}

impl Display for AllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::ClassificationFailure => "no memory type fits the requested allocation",
                Self::CapacityExhausted => {
                    "no block has enough free space and creating one is not allowed"
                }
                Self::BackendAllocationFailure => "the backend failed to create the resource",
                Self::InvalidConfiguration => {
                    "`OWN_MEMORY` and `NEVER_ALLOCATE` are mutually exclusive"
                }
                Self::MemoryMapFailed => "failed to map memory",
            }
        )
    }
}

impl Error for AllocatorError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum VectorType {
    Unmapped = 0,
    Mapped = 1,
}

impl VectorType {
    const ALL: [VectorType; 2] = [VectorType::Unmapped, VectorType::Mapped];

    #[inline]
    fn from_flags(flags: AllocationCreateFlags) -> Self {
        if flags.contains(AllocationCreateFlags::PERSISTENT_MAP) {
            VectorType::Mapped
        } else {
            VectorType::Unmapped
        }
    }

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug)]
struct BlockPool<H> {
    vectors: [BlockVector<H>; 2],
    // Whether one of the blocks of this memory type is empty. At most one is kept around.
    has_empty_block: bool,
}

#[derive(Debug)]
struct OwnPool<R> {
    registries: [OwnAllocationRegistry<R>; 2],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AllocParent {
    Block { block_id: BlockId, offset: DeviceSize },
    Own { id: OwnAllocationId },
}

/// Memory allocated by a [`ResourceAllocator`], together with the resource that was created in
/// it, if any.
///
/// The allocation must be given back with [`ResourceAllocator::free`]. Dropping it instead leaks
/// the memory until the allocator itself is dropped.
#[must_use = "allocations must be freed with `ResourceAllocator::free`"]
pub struct ResourceAllocation<B: MemoryBackend> {
    parent: AllocParent,
    memory_type: MemoryType,
    vector_type: VectorType,
    size: DeviceSize,
    alignment: DeviceAlignment,
    allocation_type: AllocationType,
    user_data: Option<UserData>,
    resource: Option<B::Resource>,
}

impl<B: MemoryBackend> ResourceAllocation<B> {
    /// Returns the memory type the allocation was made from.
    #[inline]
    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    /// Returns the size of the allocation in bytes.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    #[inline]
    pub fn alignment(&self) -> DeviceAlignment {
        self.alignment
    }

    #[inline]
    pub fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    /// Returns the offset of the allocation within its heap. Own allocations always start at 0.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        match self.parent {
            AllocParent::Block { offset, .. } => offset,
            AllocParent::Own { .. } => 0,
        }
    }

    /// Returns `true` if the allocation has its own memory instead of being part of a block.
    #[inline]
    pub fn is_own(&self) -> bool {
        matches!(self.parent, AllocParent::Own { .. })
    }

    /// Returns `true` if the allocation was made with [`AllocationCreateFlags::PERSISTENT_MAP`].
    #[inline]
    pub fn is_persistently_mapped(&self) -> bool {
        self.vector_type == VectorType::Mapped
    }

    #[inline]
    pub fn user_data(&self) -> Option<&UserData> {
        self.user_data.as_ref()
    }

    /// Returns the resource that was created in the allocation by [`ResourceAllocator::allocate`].
    #[inline]
    pub fn resource(&self) -> Option<&B::Resource> {
        self.resource.as_ref()
    }
}

impl<B: MemoryBackend> fmt::Debug for ResourceAllocation<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceAllocation")
            .field("parent", &self.parent)
            .field("memory_type", &self.memory_type)
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .field("allocation_type", &self.allocation_type)
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

/// Information about an allocation, as returned by [`ResourceAllocator::allocation_info`].
#[derive(Clone, Debug)]
pub struct ResourceAllocationInfo<H, R> {
    pub memory_type: MemoryType,

    /// The heap of the block the allocation is in, or [`None`] for own allocations.
    pub heap: Option<H>,

    pub resource: Option<R>,

    /// The offset of the allocation within `heap`.
    pub offset: DeviceSize,

    pub size: DeviceSize,

    /// A host pointer to the start of the allocation, if it is currently mapped.
    pub mapped_ptr: Option<MappedPtr>,

    pub user_data: Option<UserData>,
}

/// Allocates memory for resources from a set of per-memory-type block pools, falling back to own
/// allocations where pooling doesn't fit.
///
/// See the [module-level documentation] for the allocation strategy.
///
/// # Locking behavior
///
/// Every memory type has one lock for its blocks and one for its own allocations. Allocations of
/// different memory types therefore never wait on each other. Heaps that become superfluous when
/// freeing are destroyed after the lock is released.
///
/// [module-level documentation]: self
#[derive(Debug)]
pub struct ResourceAllocator<B: MemoryBackend> {
    backend: Arc<B>,
    flags: AllocatorCreateFlags,
    preferred_large_heap_block_size: DeviceSize,
    preferred_small_heap_block_size: DeviceSize,
    buffer_image_granularity: DeviceAlignment,
    allocation_strategy: AllocationStrategy,
    block_pools: [AllocatorMutex<BlockPool<B::Heap>>; MemoryType::COUNT],
    own_pools: [AllocatorMutex<OwnPool<B::Resource>>; MemoryType::COUNT],
    // Nesting depth of `unmap_all_persistent`. Always locked before any of the pools.
    unmap_counter: Mutex<u32>,
    persistent_memory_unmapped: AtomicBool,
}

impl<B: MemoryBackend> ResourceAllocator<B> {
    /// Creates a new `ResourceAllocator` that allocates through `backend`.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.flags` contains
    ///   [`AllocatorCreateFlags::EXTERNALLY_SYNCHRONIZED`].
    pub fn new(backend: Arc<B>, create_info: ResourceAllocatorCreateInfo) -> Self {
        create_info.validate();

        unsafe { Self::new_unchecked(backend, create_info) }
    }

    /// Creates a new `ResourceAllocator` without validating `create_info`.
    ///
    /// # Safety
    ///
    /// - If `create_info.flags` contains [`AllocatorCreateFlags::EXTERNALLY_SYNCHRONIZED`], the
    ///   allocator must never be used by more than one thread at a time.
    pub unsafe fn new_unchecked(backend: Arc<B>, create_info: ResourceAllocatorCreateInfo) -> Self {
        let ResourceAllocatorCreateInfo {
            flags,
            preferred_large_heap_block_size,
            preferred_small_heap_block_size,
            buffer_image_granularity,
            allocation_strategy,
            _ne: _,
        } = create_info;

        let use_mutex = !flags.contains(AllocatorCreateFlags::EXTERNALLY_SYNCHRONIZED);

        let block_pools = array::from_fn(|_| {
            let pool = BlockPool {
                vectors: [BlockVector::new(), BlockVector::new()],
                has_empty_block: false,
            };

            unsafe { allocator_mutex(pool, use_mutex) }
        });
        let own_pools = array::from_fn(|_| {
            let pool = OwnPool {
                registries: [OwnAllocationRegistry::new(), OwnAllocationRegistry::new()],
            };

            unsafe { allocator_mutex(pool, use_mutex) }
        });

        ResourceAllocator {
            backend,
            flags,
            preferred_large_heap_block_size: match preferred_large_heap_block_size {
                0 => DEFAULT_LARGE_HEAP_BLOCK_SIZE,
                size => size,
            },
            preferred_small_heap_block_size: match preferred_small_heap_block_size {
                0 => DEFAULT_SMALL_HEAP_BLOCK_SIZE,
                size => size,
            },
            buffer_image_granularity,
            allocation_strategy,
            block_pools,
            own_pools,
            unmap_counter: Mutex::new(0),
            persistent_memory_unmapped: AtomicBool::new(false),
        }
    }

    /// Returns the backend that was passed when creating the allocator.
    #[inline]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    #[inline]
    pub fn flags(&self) -> AllocatorCreateFlags {
        self.flags
    }

    /// Returns the size of the heaps that blocks of `memory_type` are created with.
    #[inline]
    pub fn preferred_block_size(&self, memory_type: MemoryType) -> DeviceSize {
        match memory_type.properties().block_size {
            BlockSizeClass::Large => self.preferred_large_heap_block_size,
            BlockSizeClass::Small => self.preferred_small_heap_block_size,
        }
    }

    /// Allocates memory for the resource described by `desc` and creates the resource in it.
    ///
    /// The memory requirements of the resource are queried from the backend. If the allocation
    /// ends up in a block, the resource is placed in the block's heap at the allocation's offset;
    /// otherwise a dedicated resource is created.
    pub fn allocate(
        &self,
        desc: &B::ResourceDesc,
        create_info: &AllocationCreateInfo,
    ) -> Result<ResourceAllocation<B>, AllocatorError> {
        validate_allocate(create_info)?;

        let requirements = self.backend.memory_requirements(desc);
        let memory_type = classify(&requirements, create_info)?;

        self.allocate_memory_of_type(memory_type, &requirements, create_info, Some(desc))
    }

    /// Allocates memory with the given requirements without creating a resource in it.
    pub fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        create_info: &AllocationCreateInfo,
    ) -> Result<ResourceAllocation<B>, AllocatorError> {
        validate_allocate(create_info)?;

        let memory_type = classify(requirements, create_info)?;

        self.allocate_memory_of_type(memory_type, requirements, create_info, None)
    }

    fn allocate_memory_of_type(
        &self,
        memory_type: MemoryType,
        requirements: &MemoryRequirements,
        create_info: &AllocationCreateInfo,
        desc: Option<&B::ResourceDesc>,
    ) -> Result<ResourceAllocation<B>, AllocatorError> {
        let &AllocationCreateInfo {
            usage,
            flags,
            user_data: _,
            _ne: _,
        } = create_info;
        let MemoryRequirements {
            layout,
            allocation_type,
            multisampled: _,
        } = *requirements;
        let size = layout.size();
        let vector_type = VectorType::from_flags(flags);
        let preferred_block_size = self.preferred_block_size(memory_type);
        let never_allocate = flags.contains(AllocationCreateFlags::NEVER_ALLOCATE);

        debug!("allocating {size} bytes of memory type {memory_type:?}");

        let own_memory = usage != MemoryUsage::GpuOnly
            || memory_type.properties().is_host_visible()
            || flags.contains(AllocationCreateFlags::OWN_MEMORY)
            || (!never_allocate && size > preferred_block_size / 2);

        if own_memory {
            if never_allocate {
                return Err(AllocatorError::CapacityExhausted);
            }

            return self.allocate_own_memory(memory_type, requirements, create_info, desc);
        }

        let mut pool = self.block_pools[memory_type.index()].lock();
        let BlockPool {
            vectors,
            has_empty_block,
        } = &mut *pool;
        let vector = &mut vectors[vector_type.index()];

        let alloc = if let Some(alloc) = vector.allocate(
            self.buffer_image_granularity,
            layout,
            allocation_type,
            self.allocation_strategy,
        ) {
            if alloc.was_empty {
                *has_empty_block = false;
            }

            debug!(
                "returned an allocation at offset {} of block {:?}",
                alloc.offset, alloc.block_id,
            );

            alloc
        } else {
            if never_allocate {
                return Err(AllocatorError::CapacityExhausted);
            }

            // None of the blocks has room, so a new one is needed.
            let properties = memory_type.properties();
            let mut block_size = preferred_block_size;
            let mut i = 0;

            let heap = loop {
                if let Some(heap) = self.backend.create_heap(
                    block_size,
                    properties.storage_mode,
                    properties.cache_mode,
                    properties.name,
                ) {
                    break Some(heap);
                }

                // Retry up to 2 more times, halving the block size each time, as long as the
                // allocation still fits.
                if i < 2 && block_size / 2 >= size {
                    block_size /= 2;
                    i += 1;
                } else {
                    break None;
                }
            };

            let Some(heap) = heap else {
                drop(pool);
                warn!(
                    "failed to create a heap for memory type {memory_type:?}, falling back to an \
                    own allocation",
                );

                return self.allocate_own_memory(memory_type, requirements, create_info, desc);
            };

            let persistent_map = vector_type == VectorType::Mapped;
            let mapped_ptr = if persistent_map && !self.starts_unmapped(memory_type) {
                self.backend.map_heap(&heap)
            } else {
                None
            };

            let alloc = vector.allocate_in_new_block(
                heap,
                block_size,
                persistent_map,
                mapped_ptr,
                allocation_type,
                size,
            );

            debug!(
                "created block {:?} of {block_size} bytes for memory type {memory_type:?} after {i} \
                shrinks, {} blocks in total",
                alloc.block_id,
                vector.len(),
            );

            alloc
        };

        drop(pool);

        let BlockAllocation {
            block_id,
            offset,
            was_empty: _,
            heap,
        } = alloc;

        let mut allocation = ResourceAllocation {
            parent: AllocParent::Block { block_id, offset },
            memory_type,
            vector_type,
            size,
            alignment: layout.alignment(),
            allocation_type,
            user_data: create_info.user_data.clone(),
            resource: None,
        };

        if let Some(desc) = desc {
            match self.backend.create_resource_in_heap(&heap, offset, desc) {
                Some(resource) => allocation.resource = Some(resource),
                None => {
                    self.free(allocation);

                    return Err(AllocatorError::BackendAllocationFailure);
                }
            }
        }

        Ok(allocation)
    }

    fn allocate_own_memory(
        &self,
        memory_type: MemoryType,
        requirements: &MemoryRequirements,
        create_info: &AllocationCreateInfo,
        desc: Option<&B::ResourceDesc>,
    ) -> Result<ResourceAllocation<B>, AllocatorError> {
        let properties = memory_type.properties();
        let vector_type = VectorType::from_flags(create_info.flags);
        let persistent_map = vector_type == VectorType::Mapped;
        let size = requirements.layout.size();

        let resource = match desc {
            Some(desc) => Some(
                self.backend
                    .create_dedicated_resource(desc, properties.storage_mode, properties.cache_mode)
                    .ok_or(AllocatorError::BackendAllocationFailure)?,
            ),
            None => None,
        };

        let mut pool = self.own_pools[memory_type.index()].lock();

        // Mapping under the lock makes sure that an unmap running concurrently either sees this
        // allocation or has already published that persistent memory is unmapped.
        let mapped_ptr = match &resource {
            Some(resource) if persistent_map && !self.starts_unmapped(memory_type) => {
                match self.backend.map_resource(resource) {
                    Some(mapped_ptr) => Some(mapped_ptr),
                    None => {
                        drop(pool);
                        self.backend.destroy_resource(resource.clone());

                        return Err(AllocatorError::MemoryMapFailed);
                    }
                }
            }
            _ => None,
        };

        let id = pool.registries[vector_type.index()].insert(
            size,
            requirements.allocation_type,
            persistent_map,
            mapped_ptr,
            resource.clone(),
        );
        drop(pool);

        debug!("made an own allocation of {size} bytes for memory type {memory_type:?}");

        Ok(ResourceAllocation {
            parent: AllocParent::Own { id },
            memory_type,
            vector_type,
            size,
            alignment: requirements.layout.alignment(),
            allocation_type: requirements.allocation_type,
            user_data: create_info.user_data.clone(),
            resource,
        })
    }

    /// Destroys the resource of `allocation`, if any, and gives its memory back.
    ///
    /// # Panics
    ///
    /// - Panics if `allocation` wasn't made by this allocator.
    pub fn free(&self, allocation: ResourceAllocation<B>) {
        let ResourceAllocation {
            parent,
            memory_type,
            vector_type,
            resource,
            ..
        } = allocation;

        if let Some(resource) = resource {
            self.backend.destroy_resource(resource);
        }

        match parent {
            AllocParent::Block { block_id, offset } => {
                self.free_block_memory(memory_type, vector_type, block_id, offset);
            }
            AllocParent::Own { id } => {
                let mut pool = self.own_pools[memory_type.index()].lock();
                let removed = pool.registries[vector_type.index()].remove(id);
                drop(pool);

                assert!(
                    removed.is_some(),
                    "attempted to free own allocation {id:?} of memory type {memory_type:?}, \
                    which doesn't exist",
                );

                debug!("freed an own allocation of memory type {memory_type:?}");
            }
        }
    }

    fn free_block_memory(
        &self,
        memory_type: MemoryType,
        vector_type: VectorType,
        block_id: BlockId,
        offset: DeviceSize,
    ) {
        let block_to_destroy = {
            let mut pool = self.block_pools[memory_type.index()].lock();
            let BlockPool {
                vectors,
                has_empty_block,
            } = &mut *pool;
            let vector = &mut vectors[vector_type.index()];

            let block_to_destroy = if vector.free(block_id, offset) {
                if *has_empty_block {
                    vector.remove(block_id)
                } else {
                    *has_empty_block = true;

                    None
                }
            } else {
                None
            };

            vector.incrementally_sort_blocks();

            block_to_destroy
        };

        debug!("freed the allocation at offset {offset} of block {block_id:?}");

        // Destroying the heap is done after releasing the lock.
        if let Some(block) = block_to_destroy {
            debug!("destroying empty block {block_id:?} of memory type {memory_type:?}");
            self.backend.destroy_heap(block.into_heap());
        }
    }

    /// Returns information about `allocation`.
    ///
    /// # Panics
    ///
    /// - Panics if `allocation` wasn't made by this allocator.
    pub fn allocation_info(
        &self,
        allocation: &ResourceAllocation<B>,
    ) -> ResourceAllocationInfo<B::Heap, B::Resource> {
        let (heap, offset, mapped_ptr) = match allocation.parent {
            AllocParent::Block { block_id, offset } => {
                let pool = self.block_pools[allocation.memory_type.index()].lock();
                let Some(block) = pool.vectors[allocation.vector_type.index()].get(block_id) else {
                    panic!("the block {block_id:?} of the allocation doesn't exist");
                };

                (
                    Some(block.heap().clone()),
                    offset,
                    block.mapped_ptr().and_then(|ptr| ptr.add(offset)),
                )
            }
            AllocParent::Own { id } => {
                let pool = self.own_pools[allocation.memory_type.index()].lock();
                let Some(own) = pool.registries[allocation.vector_type.index()].get(id) else {
                    panic!("the own allocation {id:?} doesn't exist");
                };

                (None, 0, own.mapped_ptr)
            }
        };

        ResourceAllocationInfo {
            memory_type: allocation.memory_type,
            heap,
            resource: allocation.resource.clone(),
            offset,
            size: allocation.size,
            mapped_ptr,
            user_data: allocation.user_data.clone(),
        }
    }

    /// Replaces the data attached to `allocation`.
    #[inline]
    pub fn set_allocation_user_data(
        &self,
        allocation: &mut ResourceAllocation<B>,
        user_data: Option<UserData>,
    ) {
        allocation.user_data = user_data;
    }

    #[inline]
    fn persistent_memory_unmapped(&self) -> bool {
        self.persistent_memory_unmapped.load(Ordering::Acquire)
    }

    /// Whether a new persistently mapped allocation of `memory_type` must be left unmapped, because
    /// [`remap_all_persistent`] is the one that maps it.
    ///
    /// [`remap_all_persistent`]: Self::remap_all_persistent
    #[inline]
    fn starts_unmapped(&self, memory_type: MemoryType) -> bool {
        UNMAPPABLE_MEMORY_TYPES.contains(&memory_type) && self.persistent_memory_unmapped()
    }

    /// Releases the host mappings of all persistently mapped allocations of the upload memory
    /// types.
    ///
    /// Calls nest: only the first of several consecutive calls unmaps anything, and the memory is
    /// only mapped again by the matching last call to [`remap_all_persistent`]. While unmapped,
    /// new persistently mapped allocations of the upload memory types are not mapped either. Other
    /// memory types are unaffected.
    ///
    /// [`remap_all_persistent`]: Self::remap_all_persistent
    pub fn unmap_all_persistent(&self) {
        let mut counter = self.unmap_counter.lock();

        if *counter == 0 {
            self.persistent_memory_unmapped
                .store(true, Ordering::Release);

            for memory_type in UNMAPPABLE_MEMORY_TYPES {
                let mut own_pool = self.own_pools[memory_type.index()].lock();

                for own in own_pool.registries[VectorType::Mapped.index()].iter_mut() {
                    own.mapped_ptr = None;
                }

                drop(own_pool);

                let mut block_pool = self.block_pools[memory_type.index()].lock();

                for block in block_pool.vectors[VectorType::Mapped.index()].blocks_mut() {
                    block.set_mapped_ptr(None);
                }
            }

            debug!("unmapped all persistently mapped memory");
        }

        *counter += 1;
    }

    /// Undoes one call to [`unmap_all_persistent`].
    ///
    /// When the last call is undone, every persistently mapped allocation of the upload memory
    /// types is mapped again. If any of the mappings fail, the others are still made and
    /// [`AllocatorError::MemoryMapFailed`] is returned.
    ///
    /// # Panics
    ///
    /// - Panics if there was no matching call to [`unmap_all_persistent`].
    ///
    /// [`unmap_all_persistent`]: Self::unmap_all_persistent
    pub fn remap_all_persistent(&self) -> Result<(), AllocatorError> {
        let mut counter = self.unmap_counter.lock();

        assert!(
            *counter > 0,
            "`remap_all_persistent` was called without a matching `unmap_all_persistent`",
        );

        *counter -= 1;

        if *counter > 0 {
            return Ok(());
        }

        self.persistent_memory_unmapped
            .store(false, Ordering::Release);

        let mut result = Ok(());

        for memory_type in UNMAPPABLE_MEMORY_TYPES {
            let mut own_pool = self.own_pools[memory_type.index()].lock();

            for own in own_pool.registries[VectorType::Mapped.index()].iter_mut() {
                debug_assert!(own.persistent_map);

                if let Some(resource) = &own.resource {
                    own.mapped_ptr = self.backend.map_resource(resource);

                    if own.mapped_ptr.is_none() {
                        result = Err(AllocatorError::MemoryMapFailed);
                    }
                }
            }

            drop(own_pool);

            let mut block_pool = self.block_pools[memory_type.index()].lock();

            // Blocks whose heap can't be mapped as a whole stay unmapped, as they were created.
            for block in block_pool.vectors[VectorType::Mapped.index()].blocks_mut() {
                let mapped_ptr = self.backend.map_heap(block.heap());
                block.set_mapped_ptr(mapped_ptr);
            }
        }

        debug!("remapped all persistently mapped memory");

        result
    }

    /// Gathers statistics about all blocks.
    pub fn calculate_stats(&self) -> AllocatorStats {
        let mut stats = AllocatorStats::default();

        for memory_type in MemoryType::ALL {
            let pool = self.block_pools[memory_type.index()].lock();

            for block in pool.vectors.iter().flat_map(BlockVector::blocks) {
                stats.add_block(memory_type, block);
            }
        }

        stats.postprocess();

        stats
    }

    /// Renders the statistics as a JSON document for debugging.
    ///
    /// If `detailed_map` is `true`, the document also lists every own allocation and every
    /// suballocation of every block.
    pub fn build_stats_string(&self, detailed_map: bool) -> String {
        let stats = self.calculate_stats();
        let detailed_map = detailed_map.then(|| self.detailed_map());

        stats::build_stats_string(&stats, detailed_map)
    }

    fn detailed_map(&self) -> DetailedMap {
        let mut detailed_map = DetailedMap::default();

        for memory_type in MemoryType::ALL {
            let pool = self.own_pools[memory_type.index()].lock();

            for vector_type in VectorType::ALL {
                let registry = &pool.registries[vector_type.index()];

                if !registry.is_empty() {
                    detailed_map.own_allocations.push((
                        memory_type,
                        vector_type == VectorType::Mapped,
                        registry.iter().map(OwnAllocationRecord::new).collect(),
                    ));
                }
            }
        }

        for memory_type in MemoryType::ALL {
            let pool = self.block_pools[memory_type.index()].lock();

            for vector_type in VectorType::ALL {
                let vector = &pool.vectors[vector_type.index()];

                if !vector.is_empty() {
                    detailed_map.blocks.push((
                        memory_type,
                        vector_type == VectorType::Mapped,
                        vector.blocks().iter().map(BlockRecord::new).collect(),
                    ));
                }
            }
        }

        detailed_map
    }

    /// Checks the bookkeeping of every block and returns whether it is consistent.
    pub fn validate(&self) -> bool {
        self.block_pools.iter().all(|pool| {
            pool.lock()
                .vectors
                .iter()
                .flat_map(BlockVector::blocks)
                .all(|block| block.validate())
        })
    }
}

impl<B: MemoryBackend> Drop for ResourceAllocator<B> {
    fn drop(&mut self) {
        let own_allocation_count: usize = self
            .own_pools
            .iter_mut()
            .flat_map(|pool| pool.get_mut().registries.iter())
            .map(OwnAllocationRegistry::len)
            .sum();

        if own_allocation_count > 0 {
            warn!("dropping an allocator with {own_allocation_count} own allocations still alive");
        }

        for pool in &mut self.block_pools {
            for vector in &mut pool.get_mut().vectors {
                for block in vector.drain() {
                    self.backend.destroy_heap(block.into_heap());
                }
            }
        }
    }
}

/// # Safety
///
/// - If `use_mutex` is `false`, the returned mutex must never be locked by two threads at the
///   same time.
unsafe fn allocator_mutex<T>(data: T, use_mutex: bool) -> AllocatorMutex<T> {
    if use_mutex {
        AllocatorMutex::new(data)
    } else {
        unsafe { AllocatorMutex::new_unsynchronized(data) }
    }
}

fn validate_allocate(create_info: &AllocationCreateInfo) -> Result<(), AllocatorError> {
    if create_info
        .flags
        .contains(AllocationCreateFlags::OWN_MEMORY | AllocationCreateFlags::NEVER_ALLOCATE)
    {
        return Err(AllocatorError::InvalidConfiguration);
    }

    Ok(())
}

fn classify(
    requirements: &MemoryRequirements,
    create_info: &AllocationCreateInfo,
) -> Result<MemoryType, AllocatorError> {
    MemoryType::classify(
        requirements.allocation_type,
        create_info.usage,
        requirements.layout.size(),
        requirements.multisampled,
        create_info.flags,
    )
    .ok_or(AllocatorError::ClassificationFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{CacheMode, StorageMode},
        tests::{init_logger, MockBackend, MockResourceDesc},
    };
    use crossbeam_queue::ArrayQueue;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::thread;

    const K: DeviceSize = 1024;

    fn small_blocks(block_size: DeviceSize) -> ResourceAllocatorCreateInfo {
        ResourceAllocatorCreateInfo {
            preferred_large_heap_block_size: block_size,
            preferred_small_heap_block_size: block_size,
            ..Default::default()
        }
    }

    fn flags(flags: AllocationCreateFlags) -> AllocationCreateInfo {
        AllocationCreateInfo {
            flags,
            ..Default::default()
        }
    }

    fn usage(usage: MemoryUsage, flags: AllocationCreateFlags) -> AllocationCreateInfo {
        AllocationCreateInfo {
            usage,
            flags,
            ..Default::default()
        }
    }

    #[test]
    fn large_allocation_bypasses_blocks() {
        let (backend, allocator) = dummy_allocator!(small_blocks(M));

        let allocation = allocator
            .allocate(
                &MockResourceDesc::buffer(2 * M),
                &flags(AllocationCreateFlags::OWN_MEMORY),
            )
            .unwrap();

        assert!(allocation.is_own());
        assert_eq!(allocation.offset(), 0);
        assert_eq!(allocation.memory_type(), MemoryType::DefaultBuffer);
        assert!(backend.heap_sizes().is_empty());
        assert_eq!(backend.dedicated_resources_created(), 1);

        // The same goes for allocations larger than half the block size without the flag.
        let allocation2 = allocator
            .allocate_memory(&dummy_requirements!(M / 2 + 1, 1, Buffer), &Default::default())
            .unwrap();
        assert!(allocation2.is_own());
        assert!(backend.heap_sizes().is_empty());

        allocator.free(allocation);
        allocator.free(allocation2);
        assert_eq!(backend.resources_destroyed(), 1);
        assert_eq!(allocator.calculate_stats().total.allocation_count, 0);
    }

    #[test]
    fn full_block_creates_exactly_one_new_block() {
        let (backend, allocator) = dummy_allocator!(small_blocks(M));
        let requirements = dummy_requirements!(256 * K, 256, Buffer);

        let allocations: Vec<_> = (0..4)
            .map(|_| allocator.allocate_memory(&requirements, &Default::default()).unwrap())
            .collect();
        assert_eq!(backend.heap_sizes(), [M]);

        let offsets: Vec<_> = allocations.iter().map(ResourceAllocation::offset).collect();
        assert_eq!(offsets, [0, 256 * K, 512 * K, 768 * K]);

        let extra = allocator.allocate_memory(&requirements, &Default::default()).unwrap();
        assert_eq!(backend.heap_sizes(), [M, M]);
        assert_eq!(extra.offset(), 0);
        assert!(!extra.is_own());

        let stats = allocator.calculate_stats();
        assert_eq!(stats.total.allocation_count, 2);
        assert_eq!(stats.total.used_bytes, 5 * 256 * K);
        assert_eq!(stats.memory_type[MemoryType::DefaultBuffer.index()].suballocation_count, 5);

        for allocation in allocations {
            allocator.free(allocation);
        }
        allocator.free(extra);
        assert!(allocator.validate());
    }

    #[test]
    fn only_one_empty_block_is_kept() {
        let (backend, allocator) = dummy_allocator!(small_blocks(M));
        let requirements = dummy_requirements!(512 * K, 1, Buffer);
        let allocate = || allocator.allocate_memory(&requirements, &Default::default()).unwrap();

        let a = allocate();
        let b = allocate();
        let c = allocate();
        assert_eq!(backend.heaps_created(), 2);

        // The second block becomes empty and is kept.
        allocator.free(c);
        assert_eq!(backend.heaps_destroyed(), 0);

        // Now the first one becomes empty too, which is one too many.
        allocator.free(a);
        allocator.free(b);
        assert_eq!(backend.heaps_destroyed(), 1);
        assert_eq!(allocator.calculate_stats().total.allocation_count, 1);

        // Reusing the empty block clears the flag, so that it's kept once it's empty again.
        let d = allocate();
        assert_eq!(backend.heaps_created(), 2);
        allocator.free(d);
        assert_eq!(backend.heaps_destroyed(), 1);

        drop(allocator);
        assert_eq!(backend.heaps_destroyed(), 2);
    }

    #[test]
    fn conflicting_flags_fail_before_touching_backend() {
        let (backend, allocator) = dummy_allocator!();

        let result = allocator.allocate(
            &MockResourceDesc::buffer(K),
            &flags(AllocationCreateFlags::OWN_MEMORY | AllocationCreateFlags::NEVER_ALLOCATE),
        );

        assert_eq!(result.unwrap_err(), AllocatorError::InvalidConfiguration);
        assert_eq!(backend.requirements_queried(), 0);
        assert!(backend.heap_sizes().is_empty());
        assert_eq!(backend.dedicated_resources_created(), 0);
    }

    #[test]
    fn never_allocate_without_room() {
        let (backend, allocator) = dummy_allocator!(small_blocks(M));
        let never = flags(AllocationCreateFlags::NEVER_ALLOCATE);

        let result = allocator.allocate_memory(&dummy_requirements!(K, 1, Buffer), &never);
        assert_eq!(result.unwrap_err(), AllocatorError::CapacityExhausted);

        // Too large for a block, and not allowed to be an own allocation either.
        let result = allocator.allocate_memory(&dummy_requirements!(M, 1, Buffer), &never);
        assert_eq!(result.unwrap_err(), AllocatorError::CapacityExhausted);
        assert!(backend.heap_sizes().is_empty());

        // Once a block exists, it can be used.
        let a = allocator
            .allocate_memory(&dummy_requirements!(K, 1, Buffer), &Default::default())
            .unwrap();
        let b = allocator
            .allocate_memory(&dummy_requirements!(K, 1, Buffer), &never)
            .unwrap();
        assert_eq!(b.offset(), K);
        assert_eq!(backend.heap_sizes(), [M]);

        allocator.free(a);
        allocator.free(b);
    }

    #[test]
    fn heap_creation_shrinks_before_giving_up() {
        let requirements = dummy_requirements!(K, 1, Buffer);

        for (failures, expected_heap_sizes, is_own) in [
            (1, &[64 * M, 32 * M][..], false),
            (2, &[64 * M, 32 * M, 16 * M][..], false),
            (3, &[64 * M, 32 * M, 16 * M][..], true),
        ] {
            let (backend, allocator) = dummy_allocator!();
            backend.fail_heap_creations(failures);

            let allocation = allocator.allocate_memory(&requirements, &Default::default()).unwrap();
            assert_eq!(backend.heap_sizes(), expected_heap_sizes);
            assert_eq!(allocation.is_own(), is_own);

            if !is_own {
                let stats = allocator.calculate_stats();
                let block_size = expected_heap_sizes[expected_heap_sizes.len() - 1];
                assert_eq!(stats.total.unused_bytes, block_size - K);
            }

            allocator.free(allocation);
        }
    }

    #[test]
    fn heap_creation_never_shrinks_below_request() {
        let (backend, allocator) = dummy_allocator!(small_blocks(M));
        backend.fail_heap_creations(2);

        let allocation = allocator
            .allocate_memory(&dummy_requirements!(300 * K, 1, Buffer), &Default::default())
            .unwrap();

        // A quarter of the block size is less than 300 KiB, so that isn't tried.
        assert_eq!(backend.heap_sizes(), [M, M / 2]);
        assert!(allocation.is_own());
        allocator.free(allocation);
    }

    #[test]
    fn host_visible_memory_is_always_own() {
        let (backend, allocator) = dummy_allocator!();

        for (ty, memory_usage, expected) in [
            (AllocationType::Buffer, MemoryUsage::CpuToGpu, MemoryType::UploadBuffer),
            (AllocationType::Buffer, MemoryUsage::GpuToCpu, MemoryType::ReadbackBuffer),
            (AllocationType::BufferSrvUav, MemoryUsage::CpuOnly, MemoryType::UploadUav),
        ] {
            let allocation = allocator
                .allocate(
                    &MockResourceDesc::new(64, 16, ty),
                    &usage(memory_usage, AllocationCreateFlags::empty()),
                )
                .unwrap();

            assert!(allocation.is_own());
            assert_eq!(allocation.memory_type(), expected);
            allocator.free(allocation);
        }

        assert!(backend.heap_sizes().is_empty());
    }

    #[test]
    fn unknown_types_cannot_be_classified() {
        let (backend, allocator) = dummy_allocator!();

        let result = allocator.allocate_memory(
            &dummy_requirements!(K, 1, ImageLinear),
            &Default::default(),
        );

        assert_eq!(result.unwrap_err(), AllocatorError::ClassificationFailure);
        assert!(backend.heap_sizes().is_empty());
    }

    #[test]
    fn resources_are_placed_in_blocks() {
        let (backend, allocator) = dummy_allocator!(small_blocks(M));

        let a = allocator
            .allocate(&MockResourceDesc::buffer(100), &Default::default())
            .unwrap();
        let b = allocator
            .allocate(&MockResourceDesc::new(100, 64, AllocationType::Buffer), &Default::default())
            .unwrap();

        let info = allocator.allocation_info(&b);
        let heap = info.heap.unwrap();
        let resource = info.resource.unwrap();
        assert_eq!(info.offset, 128);
        assert_eq!(info.size, 100);
        assert_eq!(resource.heap, Some(heap.id));
        assert_eq!(resource.offset, 128);
        assert_eq!(heap.size, M);
        assert_eq!(heap.storage_mode, StorageMode::Private);
        assert_eq!(heap.cache_mode, CacheMode::DefaultCache);
        assert!(info.mapped_ptr.is_none());
        assert_eq!(backend.placed_resources_created(), 2);
        assert_eq!(backend.dedicated_resources_created(), 0);

        allocator.free(a);
        allocator.free(b);
        assert_eq!(backend.resources_destroyed(), 2);
    }

    #[test]
    fn failed_resource_creation_releases_memory() {
        let (backend, allocator) = dummy_allocator!(small_blocks(M));
        backend.fail_resource_creation(true);

        let result = allocator.allocate(&MockResourceDesc::buffer(K), &Default::default());
        assert_eq!(result.unwrap_err(), AllocatorError::BackendAllocationFailure);

        let stats = allocator.calculate_stats();
        assert_eq!(stats.total.allocation_count, 1);
        assert_eq!(stats.total.used_bytes, 0);

        let result = allocator.allocate(
            &MockResourceDesc::buffer(K),
            &flags(AllocationCreateFlags::OWN_MEMORY),
        );
        assert_eq!(result.unwrap_err(), AllocatorError::BackendAllocationFailure);
        assert!(!allocator.build_stats_string(true).contains("OwnAllocations"));
    }

    #[test]
    fn persistently_mapped_blocks_expose_offset_pointers() {
        let (backend, allocator) = dummy_allocator!(small_blocks(M));
        let mapped = flags(AllocationCreateFlags::PERSISTENT_MAP);

        let a = allocator.allocate_memory(&dummy_requirements!(K, 1, Buffer), &mapped).unwrap();
        let b = allocator.allocate_memory(&dummy_requirements!(K, 1, Buffer), &mapped).unwrap();
        let unmapped = allocator
            .allocate_memory(&dummy_requirements!(K, 1, Buffer), &Default::default())
            .unwrap();

        // Mapped and unmapped allocations never share a block.
        assert_eq!(backend.heaps_created(), 2);
        assert!(a.is_persistently_mapped());

        let base = allocator.allocation_info(&a).mapped_ptr.unwrap();
        let ptr = allocator.allocation_info(&b).mapped_ptr.unwrap();
        assert_eq!(base.add(K), Some(ptr));
        assert!(allocator.allocation_info(&unmapped).mapped_ptr.is_none());

        allocator.free(a);
        allocator.free(b);
        allocator.free(unmapped);
    }

    #[test]
    fn unmapping_nests() {
        init_logger();

        let (backend, allocator) = dummy_allocator!();
        let create_info = usage(MemoryUsage::CpuToGpu, AllocationCreateFlags::PERSISTENT_MAP);

        let a = allocator.allocate(&MockResourceDesc::buffer(K), &create_info).unwrap();
        assert!(allocator.allocation_info(&a).mapped_ptr.is_some());

        allocator.unmap_all_persistent();
        allocator.unmap_all_persistent();
        assert!(allocator.allocation_info(&a).mapped_ptr.is_none());

        // Allocations made in the meantime aren't mapped either.
        let b = allocator.allocate(&MockResourceDesc::buffer(K), &create_info).unwrap();
        assert!(allocator.allocation_info(&b).mapped_ptr.is_none());

        allocator.remap_all_persistent().unwrap();
        assert!(allocator.allocation_info(&a).mapped_ptr.is_none());
        assert_eq!(backend.resources_mapped(), 1);

        allocator.remap_all_persistent().unwrap();
        assert!(allocator.allocation_info(&a).mapped_ptr.is_some());
        assert!(allocator.allocation_info(&b).mapped_ptr.is_some());
        assert_eq!(backend.resources_mapped(), 3);

        allocator.free(a);
        allocator.free(b);
    }

    #[test]
    fn unmapping_leaves_other_memory_types_mapped() {
        let (_backend, allocator) = dummy_allocator!(small_blocks(M));

        allocator.unmap_all_persistent();

        let readback = allocator
            .allocate(
                &MockResourceDesc::buffer(K),
                &usage(MemoryUsage::GpuToCpu, AllocationCreateFlags::PERSISTENT_MAP),
            )
            .unwrap();
        assert_eq!(readback.memory_type(), MemoryType::ReadbackBuffer);
        assert!(readback.is_own());

        // The block is created while unmapped.
        let pooled = allocator
            .allocate(
                &MockResourceDesc::buffer(K),
                &usage(MemoryUsage::GpuOnly, AllocationCreateFlags::PERSISTENT_MAP),
            )
            .unwrap();
        assert_eq!(pooled.memory_type(), MemoryType::DefaultBuffer);
        assert!(!pooled.is_own());

        assert!(allocator.allocation_info(&readback).mapped_ptr.is_some());
        assert!(allocator.allocation_info(&pooled).mapped_ptr.is_some());

        allocator.remap_all_persistent().unwrap();
        assert!(allocator.allocation_info(&readback).mapped_ptr.is_some());
        assert!(allocator.allocation_info(&pooled).mapped_ptr.is_some());

        allocator.free(readback);
        allocator.free(pooled);
    }

    #[test]
    fn remapping_reports_failure() {
        let (backend, allocator) = dummy_allocator!();
        let create_info = usage(MemoryUsage::CpuToGpu, AllocationCreateFlags::PERSISTENT_MAP);

        let a = allocator.allocate(&MockResourceDesc::buffer(K), &create_info).unwrap();
        allocator.unmap_all_persistent();

        backend.fail_mapping(true);
        assert_eq!(allocator.remap_all_persistent(), Err(AllocatorError::MemoryMapFailed));
        assert!(allocator.allocation_info(&a).mapped_ptr.is_none());

        let result = allocator.allocate(&MockResourceDesc::buffer(K), &create_info);
        assert_eq!(result.unwrap_err(), AllocatorError::MemoryMapFailed);
        assert_eq!(backend.resources_destroyed(), 1);

        allocator.free(a);
    }

    #[test]
    fn remapping_without_unmapping_panics() {
        let (_backend, allocator) = dummy_allocator!();

        assert_should_panic!("without a matching", {
            let _ = allocator.remap_all_persistent();
        });
    }

    #[test]
    fn externally_synchronized_requires_unchecked_constructor() {
        let create_info = ResourceAllocatorCreateInfo {
            flags: AllocatorCreateFlags::EXTERNALLY_SYNCHRONIZED,
            ..Default::default()
        };

        assert_should_panic!("new_unchecked", {
            let _ = dummy_allocator!(create_info.clone());
        });

        let backend = Arc::new(MockBackend::default());
        let allocator = unsafe { ResourceAllocator::new_unchecked(backend.clone(), create_info) };
        let allocation = allocator
            .allocate_memory(&dummy_requirements!(K, 1, Buffer), &Default::default())
            .unwrap();
        assert!(allocator.validate());
        allocator.free(allocation);
        assert_eq!(backend.heaps_created(), 1);
    }

    #[test]
    fn user_data_round_trips() {
        let (_backend, allocator) = dummy_allocator!();
        let create_info = AllocationCreateInfo {
            user_data: Some(Arc::new("vertices")),
            ..Default::default()
        };

        let mut allocation = allocator
            .allocate_memory(&dummy_requirements!(K, 1, Buffer), &create_info)
            .unwrap();

        let info = allocator.allocation_info(&allocation);
        assert_eq!(info.user_data.unwrap().downcast_ref::<&str>(), Some(&"vertices"));

        allocator.set_allocation_user_data(&mut allocation, Some(Arc::new(42u32)));
        assert_eq!(allocation.user_data().unwrap().downcast_ref::<u32>(), Some(&42));

        allocator.set_allocation_user_data(&mut allocation, None);
        assert!(allocator.allocation_info(&allocation).user_data.is_none());

        allocator.free(allocation);
    }

    #[test]
    fn stats_string_lists_everything() {
        let (_backend, allocator) = dummy_allocator!(small_blocks(M));

        let a = allocator
            .allocate(&MockResourceDesc::buffer(K), &Default::default())
            .unwrap();
        let b = allocator
            .allocate(
                &MockResourceDesc::buffer(K),
                &usage(MemoryUsage::GpuToCpu, AllocationCreateFlags::PERSISTENT_MAP),
            )
            .unwrap();

        let summary = allocator.build_stats_string(false);
        assert!(summary.contains("\"Total\""));
        assert!(!summary.contains("SuballocationList"));

        let detailed: serde_json::Value =
            serde_json::from_str(&allocator.build_stats_string(true)).unwrap();
        assert_eq!(detailed["OwnAllocations"]["Type 2 Mapped"][0]["Size"], K);
        assert_eq!(
            detailed["Allocations"]["Type 0"][0]["SuballocationList"][0]["Type"],
            "BUFFER",
        );
        assert_eq!(detailed["Heap 0"]["Stats"]["UsedBytes"], K);

        allocator.free(a);
        allocator.free(b);
    }

    #[test]
    fn worst_fit_spreads_allocations() {
        let (_backend, allocator) = dummy_allocator!(ResourceAllocatorCreateInfo {
            allocation_strategy: AllocationStrategy::WorstFit,
            ..small_blocks(M)
        });
        let requirements = dummy_requirements!(64 * K, 1, Buffer);

        let a = allocator.allocate_memory(&requirements, &Default::default()).unwrap();
        let b = allocator.allocate_memory(&requirements, &Default::default()).unwrap();
        let c = allocator.allocate_memory(&requirements, &Default::default()).unwrap();
        allocator.free(b);

        // The hole left by `b` is smaller than the rest of the block, so it's not chosen.
        let d = allocator.allocate_memory(&requirements, &Default::default()).unwrap();
        assert_eq!(d.offset(), 192 * K);

        for allocation in [a, c, d] {
            allocator.free(allocation);
        }
    }

    #[test]
    fn granularity_separates_render_targets() {
        let (_backend, allocator) = dummy_allocator!(ResourceAllocatorCreateInfo {
            buffer_image_granularity: DeviceAlignment::new(4 * K).unwrap(),
            ..small_blocks(M)
        });
        let requirements = dummy_requirements!(256, 256, ImageRtvDsv);

        let first = allocator.allocate_memory(&requirements, &Default::default()).unwrap();
        let second = allocator.allocate_memory(&requirements, &Default::default()).unwrap();

        // Render targets conflict even with each other.
        assert_eq!(first.memory_type(), MemoryType::TextureRtvDsv);
        assert_eq!(first.offset(), 0);
        assert_eq!(second.offset(), 4 * K);

        allocator.free(first);
        allocator.free(second);
        assert!(allocator.validate());
    }

    #[test]
    fn concurrent_allocations_conserve_bytes() {
        const THREADS: usize = 8;
        const ALLOCATIONS_PER_THREAD: usize = 64;

        let (backend, allocator) = dummy_allocator!(small_blocks(M));
        let queue = ArrayQueue::new(THREADS * ALLOCATIONS_PER_THREAD);
        let types = [
            AllocationType::Buffer,
            AllocationType::BufferSrvUav,
            AllocationType::ImageRtvDsv,
        ];

        thread::scope(|scope| {
            for thread_index in 0..THREADS {
                let (allocator, queue) = (&allocator, &queue);

                scope.spawn(move || {
                    for i in 0..ALLOCATIONS_PER_THREAD {
                        // Half of the threads share a memory type, the rest spread over others.
                        let ty = if thread_index % 2 == 0 {
                            AllocationType::Buffer
                        } else {
                            types[i % types.len()]
                        };
                        let size = 16 * K + 64 * (i as DeviceSize);
                        let requirements = MemoryRequirements {
                            layout: DeviceLayout::from_size_alignment(size, 1).unwrap(),
                            allocation_type: ty,
                            multisampled: false,
                        };
                        let allocation = allocator
                            .allocate_memory(&requirements, &Default::default())
                            .unwrap();
                        queue.push(allocation).unwrap();
                    }
                });
            }
        });

        let expected_used_bytes: DeviceSize = (0..THREADS * ALLOCATIONS_PER_THREAD)
            .map(|n| 16 * K + 64 * ((n % ALLOCATIONS_PER_THREAD) as DeviceSize))
            .sum();
        let stats = allocator.calculate_stats();
        assert_eq!(stats.total.used_bytes, expected_used_bytes);
        assert_eq!(
            stats.total.used_bytes + stats.total.unused_bytes,
            DeviceSize::from(stats.total.allocation_count) * M,
        );
        assert!(allocator.validate());

        thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    while let Some(allocation) = queue.pop() {
                        allocator.free(allocation);
                    }
                });
            }
        });

        let stats = allocator.calculate_stats();
        assert_eq!(stats.total.used_bytes, 0);
        assert!(stats.total.allocation_count <= 3);
        assert!(allocator.validate());

        drop(allocator);
        assert_eq!(backend.heaps_created(), backend.heaps_destroyed());
    }

    fn respects_granularity(
        allocator: &ResourceAllocator<MockBackend>,
        granularity: DeviceAlignment,
    ) -> bool {
        allocator.block_pools.iter().all(|pool| {
            pool.lock()
                .vectors
                .iter()
                .flat_map(BlockVector::blocks)
                .all(|block| block.respects_granularity(granularity))
        })
    }

    #[test]
    fn random_allocations_stay_consistent() {
        init_logger();

        let seed = rand::random();
        log::info!("seed: {seed}");
        let mut rng = StdRng::seed_from_u64(seed);

        let granularity = DeviceAlignment::new(1024).unwrap();
        let (backend, allocator) = dummy_allocator!(ResourceAllocatorCreateInfo {
            buffer_image_granularity: granularity,
            ..small_blocks(256 * K)
        });
        let types = [
            AllocationType::Buffer,
            AllocationType::BufferSrvUav,
            AllocationType::ImageOptimal,
            AllocationType::ImageRtvDsv,
        ];
        let mut allocations = Vec::new();

        for _ in 0..2000 {
            if allocations.is_empty() || rng.gen_bool(0.55) {
                let requirements = MemoryRequirements {
                    layout: DeviceLayout::from_size_alignment(
                        rng.gen_range(1..=160 * K),
                        1 << rng.gen_range(0..12),
                    )
                    .unwrap(),
                    allocation_type: types[rng.gen_range(0..types.len())],
                    multisampled: rng.gen_bool(0.1),
                };
                let create_info = flags(if rng.gen_bool(0.2) {
                    AllocationCreateFlags::PERSISTENT_MAP
                } else {
                    AllocationCreateFlags::empty()
                });

                allocations.push(allocator.allocate_memory(&requirements, &create_info).unwrap());
            } else {
                let index = rng.gen_range(0..allocations.len());
                allocator.free(allocations.swap_remove(index));
            }

            assert!(allocator.validate(), "seed: {seed}");
            assert!(respects_granularity(&allocator, granularity), "seed: {seed}");
        }

        let stats = allocator.calculate_stats();
        let pooled_bytes: DeviceSize = allocations
            .iter()
            .filter(|allocation| !allocation.is_own())
            .map(ResourceAllocation::size)
            .sum();
        assert_eq!(stats.total.used_bytes, pooled_bytes, "seed: {seed}");

        for allocation in allocations.drain(..) {
            allocator.free(allocation);
        }

        drop(allocator);
        assert_eq!(backend.heaps_created(), backend.heaps_destroyed());
    }
}
