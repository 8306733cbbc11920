// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Statistics about the memory managed by a [`ResourceAllocator`].
//!
//! [`ResourceAllocator`]: super::ResourceAllocator

use super::{
    memory_type::{HeapProperties, MemoryType},
    own::OwnAllocation,
    suballocator::{Block, SuballocationType},
};
use crate::{
    backend::{CacheMode, StorageMode},
    DeviceSize,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::cmp;

/// Aggregated statistics about a set of blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatInfo {
    /// Number of blocks.
    pub allocation_count: u32,
    /// Number of suballocations in use.
    pub suballocation_count: u32,
    /// Number of free suballocations.
    pub unused_range_count: u32,
    pub used_bytes: DeviceSize,
    pub unused_bytes: DeviceSize,
    /// Smallest suballocation in use, or [`DeviceSize::MAX`] if there is none.
    pub suballocation_size_min: DeviceSize,
    pub suballocation_size_avg: DeviceSize,
    pub suballocation_size_max: DeviceSize,
    /// Smallest free suballocation, or [`DeviceSize::MAX`] if there is none.
    pub unused_range_size_min: DeviceSize,
    pub unused_range_size_avg: DeviceSize,
    pub unused_range_size_max: DeviceSize,
}

impl Default for StatInfo {
    #[inline]
    fn default() -> Self {
        StatInfo {
            allocation_count: 0,
            suballocation_count: 0,
            unused_range_count: 0,
            used_bytes: 0,
            unused_bytes: 0,
            suballocation_size_min: DeviceSize::MAX,
            suballocation_size_avg: 0,
            suballocation_size_max: 0,
            unused_range_size_min: DeviceSize::MAX,
            unused_range_size_avg: 0,
            unused_range_size_max: 0,
        }
    }
}

impl StatInfo {
    /// Computes the statistics of a single block. Averages are left at zero until
    /// [`postprocess`] is called.
    ///
    /// [`postprocess`]: Self::postprocess
    pub(crate) fn from_block<H>(block: &Block<H>) -> Self {
        let mut info = StatInfo {
            allocation_count: 1,
            unused_range_count: block.free_count(),
            used_bytes: block.size() - block.sum_free_size(),
            unused_bytes: block.sum_free_size(),
            ..Default::default()
        };

        for suballoc in block.suballocations() {
            if suballoc.ty == SuballocationType::Free {
                info.unused_range_size_min = cmp::min(info.unused_range_size_min, suballoc.size);
                info.unused_range_size_max = cmp::max(info.unused_range_size_max, suballoc.size);
            } else {
                info.suballocation_count += 1;
                info.suballocation_size_min = cmp::min(info.suballocation_size_min, suballoc.size);
                info.suballocation_size_max = cmp::max(info.suballocation_size_max, suballoc.size);
            }
        }

        info
    }

    /// Accumulates `other` into `self`.
    pub(crate) fn add(&mut self, other: &StatInfo) {
        self.allocation_count += other.allocation_count;
        self.suballocation_count += other.suballocation_count;
        self.unused_range_count += other.unused_range_count;
        self.used_bytes += other.used_bytes;
        self.unused_bytes += other.unused_bytes;
        self.suballocation_size_min =
            cmp::min(self.suballocation_size_min, other.suballocation_size_min);
        self.suballocation_size_max =
            cmp::max(self.suballocation_size_max, other.suballocation_size_max);
        self.unused_range_size_min = cmp::min(self.unused_range_size_min, other.unused_range_size_min);
        self.unused_range_size_max = cmp::max(self.unused_range_size_max, other.unused_range_size_max);
    }

    /// Computes the averages from the totals.
    pub(crate) fn postprocess(&mut self) {
        self.suballocation_size_avg = round_div(self.used_bytes, self.suballocation_count);
        self.unused_range_size_avg = round_div(self.unused_bytes, self.unused_range_count);
    }

    fn to_json(self) -> Value {
        json!({
            "Allocations": self.allocation_count,
            "Suballocations": self.suballocation_count,
            "UnusedRanges": self.unused_range_count,
            "UsedBytes": self.used_bytes,
            "UnusedBytes": self.unused_bytes,
            "SuballocationSize": {
                "Min": self.suballocation_size_min,
                "Avg": self.suballocation_size_avg,
                "Max": self.suballocation_size_max,
            },
            "UnusedRangeSize": {
                "Min": self.unused_range_size_min,
                "Avg": self.unused_range_size_avg,
                "Max": self.unused_range_size_max,
            },
        })
    }
}

/// Divides and rounds to the nearest integer. Returns 0 when dividing by 0.
fn round_div(x: DeviceSize, y: u32) -> DeviceSize {
    if y == 0 {
        0
    } else {
        let y = DeviceSize::from(y);

        (x + y / 2) / y
    }
}

/// Statistics of all blocks of a [`ResourceAllocator`], as returned by
/// [`ResourceAllocator::calculate_stats`].
///
/// Own allocations are not part of the statistics.
///
/// [`ResourceAllocator`]: super::ResourceAllocator
/// [`ResourceAllocator::calculate_stats`]: super::ResourceAllocator::calculate_stats
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Per [`MemoryType::index`].
    pub memory_type: [StatInfo; MemoryType::COUNT],
    /// Per heap. Every memory type has its own heap with the same index.
    pub memory_heap: [StatInfo; MemoryType::COUNT],
    pub total: StatInfo,
}

impl Default for AllocatorStats {
    #[inline]
    fn default() -> Self {
        AllocatorStats {
            memory_type: [StatInfo::default(); MemoryType::COUNT],
            memory_heap: [StatInfo::default(); MemoryType::COUNT],
            total: StatInfo::default(),
        }
    }
}

impl AllocatorStats {
    pub(crate) fn add_block<H>(&mut self, memory_type: MemoryType, block: &Block<H>) {
        let info = StatInfo::from_block(block);
        self.memory_type[memory_type.index()].add(&info);
        self.memory_heap[memory_type.index()].add(&info);
        self.total.add(&info);
    }

    pub(crate) fn postprocess(&mut self) {
        self.memory_type
            .iter_mut()
            .chain(&mut self.memory_heap)
            .chain([&mut self.total])
            .for_each(StatInfo::postprocess);
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct OwnAllocationRecord {
    size: DeviceSize,
    #[serde(rename = "Type")]
    ty: &'static str,
}

impl OwnAllocationRecord {
    pub fn new<R>(allocation: &OwnAllocation<R>) -> Self {
        OwnAllocationRecord {
            size: allocation.size,
            ty: SuballocationType::from(allocation.allocation_type).name(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct BlockRecord {
    bytes: DeviceSize,
    free_bytes: DeviceSize,
    suballocations: usize,
    free_suballocations: u32,
    suballocation_list: Vec<SuballocationRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SuballocationRecord {
    #[serde(rename = "Type")]
    ty: &'static str,
    size: DeviceSize,
    offset: DeviceSize,
}

impl BlockRecord {
    pub fn new<H>(block: &Block<H>) -> Self {
        BlockRecord {
            bytes: block.size(),
            free_bytes: block.sum_free_size(),
            suballocations: block.suballocation_count(),
            free_suballocations: block.free_count(),
            suballocation_list: block
                .suballocations()
                .map(|suballoc| SuballocationRecord {
                    ty: suballoc.ty.name(),
                    size: suballoc.size,
                    offset: suballoc.offset,
                })
                .collect(),
        }
    }
}

/// Everything listed by a detailed stats string, grouped by memory type and vector type.
#[derive(Debug, Default)]
pub(crate) struct DetailedMap {
    pub own_allocations: Vec<(MemoryType, bool, Vec<OwnAllocationRecord>)>,
    pub blocks: Vec<(MemoryType, bool, Vec<BlockRecord>)>,
}

fn group_key(memory_type: MemoryType, mapped: bool) -> String {
    if mapped {
        format!("Type {} Mapped", memory_type.index())
    } else {
        format!("Type {}", memory_type.index())
    }
}

fn heap_flags(properties: &HeapProperties) -> String {
    format!(
        "{} {}",
        properties.storage_mode.name(),
        properties.cache_mode.name(),
    )
}

fn type_flags(properties: &HeapProperties) -> &'static str {
    match (properties.storage_mode, properties.cache_mode) {
        (StorageMode::Private, _) => "DEVICE_LOCAL",
        (StorageMode::Shared, CacheMode::WriteCombined) => "HOST_VISIBLE",
        (StorageMode::Shared, CacheMode::DefaultCache) => "HOST_VISIBLE HOST_CACHED",
    }
}

/// Renders the statistics, and optionally the detailed map, as pretty-printed JSON.
pub(crate) fn build_stats_string(stats: &AllocatorStats, detailed_map: Option<DetailedMap>) -> String {
    let mut root = Map::new();
    root.insert("Total".into(), stats.total.to_json());

    for memory_type in MemoryType::ALL {
        let index = memory_type.index();
        let properties = memory_type.properties();

        let mut type_object = Map::new();
        type_object.insert("Flags".into(), json!(type_flags(properties)));

        if stats.memory_type[index].allocation_count > 0 {
            type_object.insert("Stats".into(), stats.memory_type[index].to_json());
        }

        let mut heap_object = Map::new();
        heap_object.insert("Name".into(), json!(properties.name));
        heap_object.insert("Flags".into(), json!(heap_flags(properties)));

        if stats.memory_heap[index].allocation_count > 0 {
            heap_object.insert("Stats".into(), stats.memory_heap[index].to_json());
        }

        heap_object.insert(format!("Type {index}"), Value::Object(type_object));
        root.insert(format!("Heap {index}"), Value::Object(heap_object));
    }

    if let Some(detailed_map) = detailed_map {
        if !detailed_map.own_allocations.is_empty() {
            let own_allocations = detailed_map
                .own_allocations
                .into_iter()
                .map(|(memory_type, mapped, records)| (group_key(memory_type, mapped), json!(records)))
                .collect();
            root.insert("OwnAllocations".into(), Value::Object(own_allocations));
        }

        if !detailed_map.blocks.is_empty() {
            let blocks = detailed_map
                .blocks
                .into_iter()
                .map(|(memory_type, mapped, records)| (group_key(memory_type, mapped), json!(records)))
                .collect();
            root.insert("Allocations".into(), Value::Object(blocks));
        }
    }

    format!("{:#}", Value::Object(root))
}
