// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The interface between the allocator and the graphics API.
//!
//! The allocator decides *where* memory comes from, but it never creates anything on the device
//! itself. Heaps, resources placed inside heaps, dedicated resources and host mappings are all
//! requested through a [`MemoryBackend`], so that the same allocation logic can sit on top of any
//! API that exposes placement of resources in heaps.

use crate::{memory::allocator::MemoryRequirements, DeviceSize};
use std::{ffi::c_void, fmt::Debug, ptr::NonNull};

/// Operations that the [`ResourceAllocator`] needs from the graphics API.
///
/// All methods report failure by returning [`None`]. The allocator reacts to a failed heap
/// creation by retrying with smaller heaps and finally falling back to a dedicated allocation; any
/// other failure is reported to the caller as [`AllocatorError::BackendAllocationFailure`] or
/// [`AllocatorError::MemoryMapFailed`].
///
/// [`ResourceAllocator`]: crate::ResourceAllocator
/// [`AllocatorError::BackendAllocationFailure`]: crate::AllocatorError::BackendAllocationFailure
/// [`AllocatorError::MemoryMapFailed`]: crate::AllocatorError::MemoryMapFailed
pub trait MemoryBackend: Send + Sync {
    /// Handle to a device heap. Cloning the handle must not create a new heap.
    type Heap: Clone + Debug + Send + Sync;

    /// Handle to a buffer or texture. Cloning the handle must not create a new resource.
    type Resource: Clone + Debug + Send + Sync;

    /// Description of a resource that is to be created.
    type ResourceDesc: ?Sized;

    /// Creates a heap of exactly `size` bytes. `label` is a human-readable name that may be
    /// attached to the heap for debugging tools.
    fn create_heap(
        &self,
        size: DeviceSize,
        storage_mode: StorageMode,
        cache_mode: CacheMode,
        label: &str,
    ) -> Option<Self::Heap>;

    /// Destroys a heap that was created with [`create_heap`]. The allocator only does this once
    /// no suballocation of the heap is in use anymore.
    ///
    /// [`create_heap`]: Self::create_heap
    fn destroy_heap(&self, heap: Self::Heap);

    /// Creates a resource that is placed in `heap` at the given byte offset.
    fn create_resource_in_heap(
        &self,
        heap: &Self::Heap,
        offset: DeviceSize,
        desc: &Self::ResourceDesc,
    ) -> Option<Self::Resource>;

    /// Creates a resource that has its own memory, not shared with any other resource.
    fn create_dedicated_resource(
        &self,
        desc: &Self::ResourceDesc,
        storage_mode: StorageMode,
        cache_mode: CacheMode,
    ) -> Option<Self::Resource>;

    /// Destroys a resource created by either [`create_resource_in_heap`] or
    /// [`create_dedicated_resource`].
    ///
    /// [`create_resource_in_heap`]: Self::create_resource_in_heap
    /// [`create_dedicated_resource`]: Self::create_dedicated_resource
    fn destroy_resource(&self, resource: Self::Resource);

    /// Returns the size, alignment and kind of memory that a resource with the given description
    /// needs.
    fn memory_requirements(&self, desc: &Self::ResourceDesc) -> MemoryRequirements;

    /// Returns a host pointer to the contents of `resource`, if it can be mapped.
    fn map_resource(&self, resource: &Self::Resource) -> Option<MappedPtr>;

    /// Returns a host pointer to the start of `heap`, if the heap can be mapped as a whole.
    ///
    /// The default implementation returns [`None`], which is correct for APIs where only
    /// individual resources can be mapped.
    #[inline]
    fn map_heap(&self, heap: &Self::Heap) -> Option<MappedPtr> {
        let _ = heap;

        None
    }
}

/// Where the memory of a heap lives and who can access it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageMode {
    /// Visible to both the host and the device.
    Shared,

    /// Only accessible by the device.
    Private,
}

impl StorageMode {
    pub(crate) fn name(self) -> &'static str {
        match self {
            StorageMode::Shared => "SHARED",
            StorageMode::Private => "PRIVATE",
        }
    }
}

/// How host accesses to a heap are cached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheMode {
    /// The default host caching behavior.
    DefaultCache,

    /// Write-combined memory, which is fast to write sequentially from the host but slow to read.
    WriteCombined,
}

impl CacheMode {
    pub(crate) fn name(self) -> &'static str {
        match self {
            CacheMode::DefaultCache => "DEFAULT_CACHE",
            CacheMode::WriteCombined => "WRITE_COMBINED",
        }
    }
}

/// A host pointer to mapped device memory.
///
/// The allocator only stores and offsets these pointers, it never dereferences them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MappedPtr(NonNull<c_void>);

// SAFETY: The pointer is never dereferenced by the allocator. It's up to the user of the pointer
// to synchronize accesses to the memory behind it.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    /// Wraps a non-null host pointer.
    #[inline]
    pub const fn new(ptr: NonNull<c_void>) -> Self {
        MappedPtr(ptr)
    }

    /// Returns the wrapped pointer.
    #[inline]
    pub const fn as_ptr(self) -> NonNull<c_void> {
        self.0
    }

    /// Returns a pointer `offset` bytes past this one.
    ///
    /// The result is computed with wrapping arithmetic and is only meaningful if `offset` stays
    /// within the mapped range.
    #[inline]
    pub fn add(self, offset: DeviceSize) -> Option<Self> {
        let ptr = self
            .0
            .as_ptr()
            .cast::<u8>()
            .wrapping_add(usize::try_from(offset).ok()?);

        NonNull::new(ptr.cast::<c_void>()).map(MappedPtr)
    }
}
