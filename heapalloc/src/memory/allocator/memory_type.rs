// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{AllocationCreateFlags, AllocationType, MemoryUsage};
use crate::{
    backend::{CacheMode, StorageMode},
    DeviceSize,
};

/// Optimal images up to this size go to [`MemoryType::TextureSmall`].
pub(crate) const SMALL_TEXTURE_SIZE: DeviceSize = 4096;

/// A bucket of memory that all resources of a similar role are allocated from.
///
/// Every memory type has its own heaps, its own lock and its own entry in the statistics. The
/// properties of the heaps of each type are fixed, see [`MemoryType::properties`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MemoryType {
    DefaultBuffer,
    UploadBuffer,
    ReadbackBuffer,
    TextureSmall,
    TextureDefault,
    TextureMs,
    TextureRtvDsv,
    TextureRtvDsvMs,
    TextureRtvDsvShared,
    TextureRtvDsvSharedMs,
    TextureRtvDsvSharedAdapter,
    TextureRtvDsvSharedAdapterMs,
    DefaultUav,
    UploadUav,
    ReadbackUav,
}

impl MemoryType {
    /// The number of memory types.
    pub const COUNT: usize = 15;

    /// All memory types, in the order of their indices.
    pub const ALL: [MemoryType; MemoryType::COUNT] = [
        MemoryType::DefaultBuffer,
        MemoryType::UploadBuffer,
        MemoryType::ReadbackBuffer,
        MemoryType::TextureSmall,
        MemoryType::TextureDefault,
        MemoryType::TextureMs,
        MemoryType::TextureRtvDsv,
        MemoryType::TextureRtvDsvMs,
        MemoryType::TextureRtvDsvShared,
        MemoryType::TextureRtvDsvSharedMs,
        MemoryType::TextureRtvDsvSharedAdapter,
        MemoryType::TextureRtvDsvSharedAdapterMs,
        MemoryType::DefaultUav,
        MemoryType::UploadUav,
        MemoryType::ReadbackUav,
    ];

    /// Returns the index of the memory type, which is also the index of its heap.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns the properties that heaps of this memory type are created with.
    #[inline]
    pub fn properties(self) -> &'static HeapProperties {
        &HEAP_PROPERTIES[self.index()]
    }

    /// Selects the memory type for a resource.
    ///
    /// This is a pure function of its arguments. Returns [`None`] if the allocation type has no
    /// memory type, which is the case for [`AllocationType::Unknown`], [`AllocationType::ImageUnknown`]
    /// and [`AllocationType::ImageLinear`] as well as the shared render-target types, which are
    /// expressed through the [`SHARED`] and [`SHARED_ADAPTER`] flags instead.
    ///
    /// [`SHARED`]: AllocationCreateFlags::SHARED
    /// [`SHARED_ADAPTER`]: AllocationCreateFlags::SHARED_ADAPTER
    pub fn classify(
        allocation_type: AllocationType,
        usage: MemoryUsage,
        size: DeviceSize,
        multisampled: bool,
        flags: AllocationCreateFlags,
    ) -> Option<MemoryType> {
        let memory_type = match allocation_type {
            AllocationType::Buffer => match usage {
                MemoryUsage::GpuOnly => MemoryType::DefaultBuffer,
                MemoryUsage::CpuOnly | MemoryUsage::CpuToGpu => MemoryType::UploadBuffer,
                MemoryUsage::GpuToCpu => MemoryType::ReadbackBuffer,
            },
            AllocationType::BufferSrvUav => match usage {
                MemoryUsage::GpuOnly => MemoryType::DefaultUav,
                MemoryUsage::CpuOnly | MemoryUsage::CpuToGpu => MemoryType::UploadUav,
                MemoryUsage::GpuToCpu => MemoryType::ReadbackUav,
            },
            AllocationType::ImageOptimal if size <= SMALL_TEXTURE_SIZE => MemoryType::TextureSmall,
            AllocationType::ImageOptimal if multisampled => MemoryType::TextureMs,
            AllocationType::ImageOptimal => MemoryType::TextureDefault,
            AllocationType::ImageRtvDsv => {
                if flags.intersects(AllocationCreateFlags::SHARED_ADAPTER) {
                    if multisampled {
                        MemoryType::TextureRtvDsvSharedAdapterMs
                    } else {
                        MemoryType::TextureRtvDsvSharedAdapter
                    }
                } else if flags.intersects(AllocationCreateFlags::SHARED) {
                    if multisampled {
                        MemoryType::TextureRtvDsvSharedMs
                    } else {
                        MemoryType::TextureRtvDsvShared
                    }
                } else if multisampled {
                    MemoryType::TextureRtvDsvMs
                } else {
                    MemoryType::TextureRtvDsv
                }
            }
            AllocationType::Unknown
            | AllocationType::ImageUnknown
            | AllocationType::ImageLinear
            | AllocationType::ImageRtvDsvShared
            | AllocationType::ImageRtvDsvSharedAdapter => return None,
        };

        Some(memory_type)
    }
}

/// Which of the two configured block sizes heaps of a memory type are created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockSizeClass {
    /// [`ResourceAllocatorCreateInfo::preferred_large_heap_block_size`].
    ///
    /// [`ResourceAllocatorCreateInfo::preferred_large_heap_block_size`]: super::ResourceAllocatorCreateInfo::preferred_large_heap_block_size
    Large,

    /// [`ResourceAllocatorCreateInfo::preferred_small_heap_block_size`].
    ///
    /// [`ResourceAllocatorCreateInfo::preferred_small_heap_block_size`]: super::ResourceAllocatorCreateInfo::preferred_small_heap_block_size
    Small,
}

/// Properties of the heaps of one memory type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapProperties {
    pub block_size: BlockSizeClass,
    pub storage_mode: StorageMode,
    pub cache_mode: CacheMode,
    /// Human-readable name, used as the label of created heaps and in the statistics.
    pub name: &'static str,
}

impl HeapProperties {
    const fn new(
        block_size: BlockSizeClass,
        storage_mode: StorageMode,
        cache_mode: CacheMode,
        name: &'static str,
    ) -> Self {
        HeapProperties {
            block_size,
            storage_mode,
            cache_mode,
            name,
        }
    }

    const fn private(name: &'static str) -> Self {
        HeapProperties::new(
            BlockSizeClass::Large,
            StorageMode::Private,
            CacheMode::DefaultCache,
            name,
        )
    }

    /// Whether the host can access the memory of these heaps.
    #[inline]
    pub fn is_host_visible(&self) -> bool {
        self.storage_mode == StorageMode::Shared
    }
}

static HEAP_PROPERTIES: [HeapProperties; MemoryType::COUNT] = [
    HeapProperties::private("Default Buffers Heap"),
    HeapProperties::new(
        BlockSizeClass::Large,
        StorageMode::Shared,
        CacheMode::WriteCombined,
        "Upload Buffers Heap",
    ),
    HeapProperties::new(
        BlockSizeClass::Small,
        StorageMode::Shared,
        CacheMode::DefaultCache,
        "Readback Buffers Heap",
    ),
    HeapProperties::new(
        BlockSizeClass::Small,
        StorageMode::Private,
        CacheMode::DefaultCache,
        "Small Textures Heap",
    ),
    HeapProperties::private("Default Textures Heap"),
    HeapProperties::private("MSAA Textures Heap"),
    HeapProperties::private("RenderTargets Heap"),
    HeapProperties::private("MSAA RenderTargets Heap"),
    HeapProperties::private("Shared RenderTargets Heap"),
    HeapProperties::private("Shared MSAA RenderTargets Heap"),
    HeapProperties::private("Shared Adapter RenderTargets Heap"),
    HeapProperties::private("Shared Adapter MSAA RenderTargets Heap"),
    HeapProperties::private("Default UAV Buffers Heap"),
    HeapProperties::new(
        BlockSizeClass::Large,
        StorageMode::Shared,
        CacheMode::WriteCombined,
        "Upload UAV Buffers Heap",
    ),
    HeapProperties::new(
        BlockSizeClass::Large,
        StorageMode::Shared,
        CacheMode::DefaultCache,
        "Readback UAV Buffers Heap",
    ),
];
