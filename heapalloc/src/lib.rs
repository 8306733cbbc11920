// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Block-based suballocator for GPU memory.
//!
//! # Brief summary
//!
//! - Creating GPU memory heaps through the driver is expensive, and drivers limit how many can
//!   exist at a time. The [`ResourceAllocator`] therefore creates a few large *blocks* (heaps) per
//!   [memory type] and carves them into many small *suballocations*, one per resource.
//!
//! - Resources that are large compared to the block size, that must be visible to the host, or
//!   that ask for it explicitly get their own *dedicated* allocation instead, which bypasses the
//!   blocks entirely.
//!
//! - The allocator never talks to a graphics API directly. Everything that has to reach the
//!   driver goes through the [`MemoryBackend`] trait, which the application implements for the API
//!   it uses.
//!
//! - Every memory type is guarded by its own lock, so that allocations of unrelated memory types
//!   never contend with each other. If you can guarantee that the allocator is only ever used from
//!   one thread at a time, the locking can be elided altogether; see
//!   [`ResourceAllocator::new_unchecked`].
//!
//! [memory type]: crate::memory::allocator::MemoryType

pub use crate::{
    backend::{CacheMode, MappedPtr, MemoryBackend, StorageMode},
    memory::allocator::{
        AllocationCreateFlags, AllocationCreateInfo, AllocationStrategy, AllocationType,
        AllocatorCreateFlags, AllocatorError, DeviceAlignment, DeviceLayout, MemoryRequirements,
        MemoryType, MemoryUsage, ResourceAllocation, ResourceAllocationInfo, ResourceAllocator,
        ResourceAllocatorCreateInfo, UserData,
    },
};
use std::num::NonZeroU64;

pub mod backend;
pub mod memory;
mod sync;

/// Represents memory size and offset values on a device.
/// Analogous to the Rust `usize` type on the host.
pub type DeviceSize = u64;

/// A [`DeviceSize`] that is known not to equal zero.
pub type NonZeroDeviceSize = NonZeroU64;

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)] // add traits as needed
pub struct NonExhaustive(pub(crate) ());
