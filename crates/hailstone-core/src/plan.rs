//! Resource planning.
//!
//! Turns probed device limits and a memory budget into an immutable
//! [`MemoryPlan`]: per-batch buffer sizes, slot stride, slots per allocation,
//! allocations per heap, the memory type used on each side, and workgroup
//! sizing. Planning is pure; it runs before any GPU object exists and fails
//! fast when fewer than two slots fit.
//!
//! # Slot layout
//!
//! Host-visible (staging) and device-local (working) memory use the same
//! layout, so a slot's regions sit at identical offsets on both sides:
//!
//! ```text
//! allocation 0                                      allocation 1
//! ┌──────────────────────────────┬─────────────┐    ┌─────────────┐
//! │ slot 0                       │ slot 1      │    │ slot 2 ...  │
//! │ ┌────────┬─pad─┬────────┬pad┐│             │    │             │
//! │ │ input  │     │ output │   ││             │    │             │
//! │ └────────┴─────┴────────┴───┘│             │    │             │
//! └──────────────────────────────┴─────────────┘    └─────────────┘
//!   0        output_offset        slot_stride
//! ```

use std::cmp::Reverse;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::SearchConfig;
use crate::layout::{BindingStyle, ElementLayout, INPUT_ELEMENT_BYTES};
use crate::{Error, Result};

/// Minimum alignment applied to every region.
const BASE_ALIGNMENT: u64 = 16;

/// A memory heap reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryHeap {
    /// Heap size in bytes.
    pub size: u64,
    /// Heap is local to the device.
    pub device_local: bool,
}

/// A memory type reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryType {
    /// Index of the heap backing this type.
    pub heap_index: u32,
    pub device_local: bool,
    pub host_visible: bool,
    pub host_coherent: bool,
    pub host_cached: bool,
}

/// Device properties relevant to planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLimits {
    /// Device name for logs.
    pub device_name: String,
    /// Memory heaps.
    pub heaps: Vec<MemoryHeap>,
    /// Memory types.
    pub memory_types: Vec<MemoryType>,
    /// Largest single allocation.
    pub max_allocation_size: u64,
    /// Maximum number of live allocations.
    pub max_memory_allocation_count: u32,
    /// Largest storage-buffer descriptor range.
    pub max_storage_buffer_range: u64,
    /// Required alignment of storage-buffer descriptor offsets.
    pub min_storage_buffer_offset_alignment: u64,
    /// Granularity of flush/invalidate ranges on non-coherent memory.
    pub non_coherent_atom_size: u64,
    /// Maximum workgroup size in X.
    pub max_workgroup_size_x: u32,
    /// Maximum invocations per workgroup.
    pub max_workgroup_invocations: u32,
    /// Maximum workgroup count in X.
    pub max_workgroup_count_x: u32,
}

impl DeviceLimits {
    /// Limits of a discrete device with separate device and host heaps.
    pub fn discrete(device_heap: u64, host_heap: u64) -> Self {
        Self {
            device_name: "discrete".into(),
            heaps: vec![
                MemoryHeap {
                    size: device_heap,
                    device_local: true,
                },
                MemoryHeap {
                    size: host_heap,
                    device_local: false,
                },
            ],
            memory_types: vec![
                MemoryType {
                    heap_index: 0,
                    device_local: true,
                    ..Default::default()
                },
                MemoryType {
                    heap_index: 1,
                    host_visible: true,
                    host_coherent: true,
                    ..Default::default()
                },
                MemoryType {
                    heap_index: 1,
                    host_visible: true,
                    host_coherent: true,
                    host_cached: true,
                    ..Default::default()
                },
            ],
            ..Self::unified(device_heap)
        }
    }

    /// Limits of a device whose only heap is shared with the host.
    pub fn unified(heap: u64) -> Self {
        Self {
            device_name: "unified".into(),
            heaps: vec![MemoryHeap {
                size: heap,
                device_local: true,
            }],
            memory_types: vec![MemoryType {
                heap_index: 0,
                device_local: true,
                host_visible: true,
                host_coherent: true,
                host_cached: true,
            }],
            max_allocation_size: 1 << 30,
            max_memory_allocation_count: 4096,
            max_storage_buffer_range: 1 << 27,
            min_storage_buffer_offset_alignment: 256,
            non_coherent_atom_size: 64,
            max_workgroup_size_x: 1024,
            max_workgroup_invocations: 1024,
            max_workgroup_count_x: 65_535,
        }
    }

    fn select_device_type(&self) -> Option<u32> {
        self.memory_types
            .iter()
            .enumerate()
            .filter(|(_, t)| t.device_local && self.heap_exists(t.heap_index))
            .max_by_key(|(i, t)| (!t.host_visible, Reverse(*i)))
            .map(|(i, _)| i as u32)
    }

    fn select_host_type(&self) -> Option<u32> {
        self.memory_types
            .iter()
            .enumerate()
            .filter(|(_, t)| t.host_visible && self.heap_exists(t.heap_index))
            .max_by_key(|(i, t)| (t.host_coherent, t.host_cached, !t.device_local, Reverse(*i)))
            .map(|(i, _)| i as u32)
    }

    fn heap_exists(&self, index: u32) -> bool {
        (index as usize) < self.heaps.len()
    }
}

/// Planner inputs taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanRequest {
    pub budget_fraction: f64,
    pub iter_size: u32,
    pub layout: ElementLayout,
    pub binding_style: BindingStyle,
    pub max_slots: u32,
    pub preferred_workgroup_size: u32,
}

impl Default for PlanRequest {
    fn default() -> Self {
        Self::from(&SearchConfig::default())
    }
}

impl From<&SearchConfig> for PlanRequest {
    fn from(config: &SearchConfig) -> Self {
        Self {
            budget_fraction: config.memory_budget,
            iter_size: config.iter_size,
            layout: config.element_layout,
            binding_style: config.binding_style,
            max_slots: config.max_slots,
            preferred_workgroup_size: config.workgroup_size,
        }
    }
}

/// Which side of the transfer a heap serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Host-visible staging memory.
    Host,
    /// Device-local working memory.
    Device,
}

/// Per-side heap usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeapPlan {
    /// Heap index.
    pub heap_index: u32,
    /// Memory type index.
    pub memory_type_index: u32,
    /// Heap size.
    pub heap_size: u64,
    /// Bytes the plan may use on this heap.
    pub budget: u64,
    /// Device allocations on this side.
    pub allocations: u32,
    /// Host writes need no explicit flush.
    pub coherent: bool,
}

/// A byte range relative to a slot's base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Region {
    pub offset: u64,
    pub size: u64,
}

/// Where a slot lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLocation {
    /// Allocation index on either side.
    pub allocation: u32,
    /// Byte offset of the slot inside the allocation.
    pub offset: u64,
}

/// Immutable resource sizing for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryPlan {
    pub layout: ElementLayout,
    pub binding_style: BindingStyle,
    /// Values per batch.
    pub iter_size: u32,
    /// Input bytes per batch.
    pub input_bytes: u64,
    /// Output bytes per batch.
    pub output_bytes: u64,
    /// Input plus output bytes per batch.
    pub bytes_per_batch: u64,
    /// Alignment applied to region offsets and slot strides.
    pub alignment: u64,
    /// Offset of the output region from the slot base.
    pub output_offset: u64,
    /// Bytes between consecutive slots in an allocation.
    pub slot_stride: u64,
    /// Number of slots.
    pub slot_count: u32,
    /// Slots packed into one allocation.
    pub slots_per_allocation: u32,
    /// Host-visible side.
    pub host: HeapPlan,
    /// Device-local side.
    pub device: HeapPlan,
    /// Host and device sides draw from one heap.
    pub shared_heap: bool,
    /// Invocations per dispatch.
    pub invocations: u32,
    /// Invocations per workgroup.
    pub workgroup_size: u32,
    /// Workgroups per dispatch.
    pub workgroup_count: u32,
}

impl MemoryPlan {
    /// Location of a slot inside its allocation.
    pub fn slot_location(&self, slot: usize) -> SlotLocation {
        let per = self.slots_per_allocation as usize;
        SlotLocation {
            allocation: (slot / per) as u32,
            offset: (slot % per) as u64 * self.slot_stride,
        }
    }

    /// Slots living in the given allocation.
    pub fn slots_in_allocation(&self, allocation: u32) -> u32 {
        let first = allocation * self.slots_per_allocation;
        self.slot_count
            .saturating_sub(first)
            .min(self.slots_per_allocation)
    }

    /// Byte size of an allocation.
    pub fn allocation_size(&self, allocation: u32) -> u64 {
        u64::from(self.slots_in_allocation(allocation)) * self.slot_stride
    }

    /// Number of allocations per side.
    pub fn allocations_per_side(&self) -> u32 {
        self.slot_count.div_ceil(self.slots_per_allocation)
    }

    /// Input region relative to the slot base.
    pub fn input_region(&self) -> Region {
        Region {
            offset: 0,
            size: self.input_bytes,
        }
    }

    /// Output region relative to the slot base.
    pub fn output_region(&self) -> Region {
        Region {
            offset: self.output_offset,
            size: self.output_bytes,
        }
    }

    /// Total bytes charged to one side.
    pub fn side_bytes(&self) -> u64 {
        u64::from(self.slot_count) * self.slot_stride
    }

    /// Heap plan for a side.
    pub fn heap(&self, side: Side) -> &HeapPlan {
        match side {
            Side::Host => &self.host,
            Side::Device => &self.device,
        }
    }
}

impl fmt::Display for MemoryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} slots x {} values ({:?}/{:?}), stride {} B, {} slots/allocation, \
             {} allocations/side, workgroups {}x{}",
            self.slot_count,
            self.iter_size,
            self.layout,
            self.binding_style,
            self.slot_stride,
            self.slots_per_allocation,
            self.allocations_per_side(),
            self.workgroup_count,
            self.workgroup_size
        )
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn largest_power_of_two_at_most(n: u32) -> u32 {
    if n == 0 {
        1
    } else {
        1 << (31 - n.leading_zeros())
    }
}

/// Computes a memory plan for the device.
pub fn manage_memory(limits: &DeviceLimits, request: &PlanRequest) -> Result<MemoryPlan> {
    let strategy = request.layout.strategy();
    let per_invocation = strategy.values_per_invocation();

    if request.iter_size == 0 || request.iter_size % per_invocation != 0 {
        return Err(Error::config(format!(
            "iter_size {} must be a positive multiple of {}",
            request.iter_size, per_invocation
        )));
    }
    if request.budget_fraction.is_nan() || request.budget_fraction <= 0.0 {
        return Err(Error::config(format!(
            "memory budget must be positive, got {}",
            request.budget_fraction
        )));
    }
    let fraction = request.budget_fraction.min(1.0);

    let input_bytes = u64::from(request.iter_size) * INPUT_ELEMENT_BYTES;
    let output_bytes = u64::from(request.iter_size) * strategy.output_element_bytes();
    let range = input_bytes.max(output_bytes);
    if range > limits.max_storage_buffer_range {
        return Err(Error::planning(format!(
            "a {} byte region exceeds maxStorageBufferRange {}",
            range, limits.max_storage_buffer_range
        )));
    }

    let alignment = limits
        .min_storage_buffer_offset_alignment
        .max(limits.non_coherent_atom_size)
        .max(BASE_ALIGNMENT);
    let output_offset = align_up(input_bytes, alignment);
    let slot_stride = align_up(output_offset + output_bytes, alignment);

    let device_type = limits
        .select_device_type()
        .ok_or_else(|| Error::planning("no device-local memory type"))?;
    let host_type = limits
        .select_host_type()
        .ok_or_else(|| Error::planning("no host-visible memory type"))?;
    let device_mt = limits.memory_types[device_type as usize];
    let host_mt = limits.memory_types[host_type as usize];
    let device_heap = limits.heaps[device_mt.heap_index as usize];
    let host_heap = limits.heaps[host_mt.heap_index as usize];
    let shared_heap = device_mt.heap_index == host_mt.heap_index;

    let device_budget = (device_heap.size as f64 * fraction) as u64;
    let host_budget = (host_heap.size as f64 * fraction) as u64;

    let by_budget = if shared_heap {
        device_budget / (2 * slot_stride)
    } else {
        (device_budget / slot_stride).min(host_budget / slot_stride)
    };

    let max_per_allocation = limits.max_allocation_size / slot_stride;
    if max_per_allocation == 0 {
        return Err(Error::planning(format!(
            "slot stride {} exceeds maxMemoryAllocationSize {}",
            slot_stride, limits.max_allocation_size
        )));
    }
    let allocations_per_side = u64::from(limits.max_memory_allocation_count / 2);
    let by_allocations = allocations_per_side.saturating_mul(max_per_allocation);

    let available = by_budget
        .min(by_allocations)
        .min(u64::from(request.max_slots));
    if available < 2 {
        return Err(Error::InsufficientSlots { available });
    }
    let slot_count = available as u32;
    let slots_per_allocation = max_per_allocation.min(available) as u32;
    let allocations = slot_count.div_ceil(slots_per_allocation);

    let invocations = request.iter_size / per_invocation;
    let workgroup_size = largest_power_of_two_at_most(
        request
            .preferred_workgroup_size
            .min(limits.max_workgroup_size_x)
            .min(limits.max_workgroup_invocations)
            .min(invocations),
    );
    let workgroup_count = invocations.div_ceil(workgroup_size);
    if workgroup_count > limits.max_workgroup_count_x {
        return Err(Error::planning(format!(
            "{} workgroups exceed maxComputeWorkGroupCount {}",
            workgroup_count, limits.max_workgroup_count_x
        )));
    }

    Ok(MemoryPlan {
        layout: request.layout,
        binding_style: request.binding_style,
        iter_size: request.iter_size,
        input_bytes,
        output_bytes,
        bytes_per_batch: input_bytes + output_bytes,
        alignment,
        output_offset,
        slot_stride,
        slot_count,
        slots_per_allocation,
        host: HeapPlan {
            heap_index: host_mt.heap_index,
            memory_type_index: host_type,
            heap_size: host_heap.size,
            budget: host_budget,
            allocations,
            coherent: host_mt.host_coherent,
        },
        device: HeapPlan {
            heap_index: device_mt.heap_index,
            memory_type_index: device_type,
            heap_size: device_heap.size,
            budget: device_budget,
            allocations,
            coherent: true,
        },
        shared_heap,
        invocations,
        workgroup_size,
        workgroup_count,
    })
}
