// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! GPU memory management.
//!
//! Memory on the device comes in heaps, which are created through the [`MemoryBackend`]. A heap
//! can hold many resources, each of which occupies a range of bytes at some offset. Creating a
//! heap per resource works, but it is slow and quickly runs into driver limits, which is why the
//! [`allocator`] module suballocates resources from a small number of large heaps.
//!
//! Memory in the same heap is not necessarily interchangeable: some hardware requires that linear
//! resources (buffers) and non-linear resources (optimally tiled images) don't share a page of the
//! *buffer-image granularity*. The allocator takes care of this when placing resources next to
//! each other.
//!
//! [`MemoryBackend`]: crate::backend::MemoryBackend

pub mod allocator;
