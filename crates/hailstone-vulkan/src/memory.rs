//! Slot buffers and their backing allocations.
//!
//! Both sides follow the planned layout exactly: allocation `a` holds
//! `plan.slots_in_allocation(a)` slots at `slot_stride` intervals, each with
//! its input at the slot base and its output at `output_offset`. Host-side
//! allocations stay mapped for the lifetime of the context.
//!
//! With [`BindingStyle::Separate`] every slot owns an input and an output
//! buffer per side. With [`BindingStyle::Combined`] a slot owns one buffer
//! per side covering the whole stride, and the two roles are addressed by
//! offset within it.

use ash::vk;
use hailstone_core::plan::{HeapPlan, MemoryPlan, Side};
use hailstone_core::protocol::{Memory, Role};
use hailstone_core::{BindingStyle, IoKind};
use tracing::{debug, warn};

use crate::device::VulkanDevice;
use crate::error::{Result, VulkanError};

/// Required alignment of mapped host pointers.
const MAPPED_ALIGNMENT: usize = 16;

/// Buffers of one slot on one side.
#[derive(Debug, Clone, Copy)]
enum SlotBuffers {
    Separate { input: vk::Buffer, output: vk::Buffer },
    Combined(vk::Buffer),
}

impl SlotBuffers {
    fn each(&self) -> impl Iterator<Item = vk::Buffer> {
        let (a, b) = match *self {
            SlotBuffers::Separate { input, output } => (input, Some(output)),
            SlotBuffers::Combined(buffer) => (buffer, None),
        };
        std::iter::once(a).chain(b)
    }
}

/// Allocations and buffers of one side.
struct SideMemory {
    side: Side,
    allocations: Vec<vk::DeviceMemory>,
    mapped: Vec<*mut u8>,
    slots: Vec<SlotBuffers>,
    coherent: bool,
}

impl SideMemory {
    fn empty(side: Side) -> Self {
        Self {
            side,
            allocations: Vec::new(),
            mapped: Vec::new(),
            slots: Vec::new(),
            coherent: true,
        }
    }

    fn usage(&self) -> vk::BufferUsageFlags {
        match self.side {
            Side::Host => vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            Side::Device => {
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
            }
        }
    }

    fn required_flags(&self, heap: &HeapPlan) -> vk::MemoryPropertyFlags {
        match self.side {
            Side::Host if heap.coherent => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            Side::Host => vk::MemoryPropertyFlags::HOST_VISIBLE,
            Side::Device => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            for slot in self.slots.drain(..) {
                for buffer in slot.each() {
                    device.destroy_buffer(buffer, None);
                }
            }
            for (i, memory) in self.allocations.drain(..).enumerate() {
                if self.mapped.get(i).is_some_and(|ptr| !ptr.is_null()) {
                    device.unmap_memory(memory);
                }
                device.free_memory(memory, None);
            }
            self.mapped.clear();
        }
    }
}

fn create_buffer(
    device: &ash::Device,
    size: u64,
    usage: vk::BufferUsageFlags,
) -> Result<(vk::Buffer, vk::MemoryRequirements)> {
    let info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = unsafe { device.create_buffer(&info, None)? };
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
    Ok((buffer, requirements))
}

/// First memory type allowed by `bits` that has `flags` and lives on `heap_index`.
///
/// The plan budgets each side against one heap, so a replacement type on a
/// different heap is never acceptable.
fn fallback_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    bits: u32,
    flags: vk::MemoryPropertyFlags,
    heap_index: u32,
) -> Option<u32> {
    props.memory_types[..props.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(i, t)| {
            bits & (1 << i) != 0 && t.property_flags.contains(flags) && t.heap_index == heap_index
        })
        .map(|(i, _)| i as u32)
}

fn check_requirements(
    requirements: &vk::MemoryRequirements,
    reserved: u64,
    plan: &MemoryPlan,
) -> Result<()> {
    if requirements.size > reserved || plan.alignment % requirements.alignment.max(1) != 0 {
        return Err(VulkanError::PlanMismatch {
            size: requirements.size,
            alignment: requirements.alignment,
            reserved,
            planned: plan.alignment,
        });
    }
    Ok(())
}

fn check_mapping(ptr: *mut u8) -> Result<()> {
    if ptr.is_null() {
        return Err(VulkanError::Mapping {
            kind: IoKind::BadAddress,
            message: "driver returned a null mapping".into(),
        });
    }
    if ptr as usize % MAPPED_ALIGNMENT != 0 {
        return Err(VulkanError::Mapping {
            kind: IoKind::BadAlignment,
            message: format!("mapping at {:p} is not {}-byte aligned", ptr, MAPPED_ALIGNMENT),
        });
    }
    Ok(())
}

/// All slot memory for both sides.
pub struct SlotMemory {
    device: ash::Device,
    host: SideMemory,
    working: SideMemory,
    input_bytes: u64,
    output_bytes: u64,
    output_offset: u64,
    slot_stride: u64,
    alignment: u64,
    slots_per_allocation: u32,
}

impl SlotMemory {
    fn side(&self, memory: Memory) -> &SideMemory {
        match memory {
            Memory::Host => &self.host,
            Memory::Device => &self.working,
        }
    }

    fn location(&self, slot: usize) -> (usize, u64) {
        let per = self.slots_per_allocation as usize;
        (slot / per, (slot % per) as u64 * self.slot_stride)
    }

    /// Buffer and in-buffer offset of a slot region.
    pub fn buffer_region(&self, memory: Memory, role: Role, slot: usize) -> (vk::Buffer, u64) {
        match (self.side(memory).slots[slot], role) {
            (SlotBuffers::Separate { input, .. }, Role::Input) => (input, 0),
            (SlotBuffers::Separate { output, .. }, Role::Output) => (output, 0),
            (SlotBuffers::Combined(buffer), Role::Input) => (buffer, 0),
            (SlotBuffers::Combined(buffer), Role::Output) => (buffer, self.output_offset),
        }
    }

    /// Byte range a descriptor binds for a slot region.
    pub fn descriptor_range(&self, role: Role) -> u64 {
        match role {
            Role::Input => self.input_bytes,
            Role::Output => self.output_bytes,
        }
    }

    fn mapped(&self, slot: usize, offset: u64, len: u64) -> Result<*mut u8> {
        let (allocation, base) = self.location(slot);
        let ptr = self
            .host
            .mapped
            .get(allocation)
            .copied()
            .ok_or_else(|| VulkanError::Mapping {
                kind: IoKind::BadOffset,
                message: format!("slot {} has no mapped allocation", slot),
            })?;
        debug_assert!(offset + len <= self.slot_stride);
        // SAFETY: the allocation spans every slot it holds at `slot_stride`.
        Ok(unsafe { ptr.add((base + offset) as usize) })
    }

    /// Mapped staging input of a slot.
    pub fn host_input(&mut self, slot: usize) -> Result<&mut [u8]> {
        let ptr = self.mapped(slot, 0, self.input_bytes)?;
        // SAFETY: the region is inside a live mapping and `&mut self` is exclusive.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, self.input_bytes as usize) })
    }

    /// Mapped staging output of a slot.
    pub fn host_output(&self, slot: usize) -> Result<&[u8]> {
        let ptr = self.mapped(slot, self.output_offset, self.output_bytes)?;
        // SAFETY: the region is inside a live mapping.
        Ok(unsafe { std::slice::from_raw_parts(ptr, self.output_bytes as usize) })
    }

    fn host_range(&self, slot: usize, role: Role) -> vk::MappedMemoryRange<'_> {
        let (allocation, base) = self.location(slot);
        let (offset, len) = match role {
            Role::Input => (0, self.input_bytes),
            Role::Output => (self.output_offset, self.output_bytes),
        };
        vk::MappedMemoryRange::default()
            .memory(self.host.allocations[allocation])
            .offset(base + offset)
            .size(len.next_multiple_of(self.alignment))
    }

    /// Makes host writes to a slot's staging input visible to the device.
    pub fn flush_input(&self, slot: usize) -> Result<()> {
        if self.host.coherent {
            return Ok(());
        }
        let range = self.host_range(slot, Role::Input);
        unsafe { self.device.flush_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    /// Makes device writes to a slot's staging output visible to the host.
    pub fn invalidate_output(&self, slot: usize) -> Result<()> {
        if self.host.coherent {
            return Ok(());
        }
        let range = self.host_range(slot, Role::Output);
        unsafe { self.device.invalidate_mapped_memory_ranges(&[range])? };
        Ok(())
    }
}

impl Drop for SlotMemory {
    fn drop(&mut self) {
        self.host.destroy(&self.device);
        self.working.destroy(&self.device);
        debug!("slot memory released");
    }
}

/// Allocates both sides and creates every slot buffer.
pub fn create_buffers(device: &VulkanDevice, plan: &MemoryPlan) -> Result<SlotMemory> {
    let mut memory = SlotMemory {
        device: device.raw().clone(),
        host: SideMemory::empty(Side::Host),
        working: SideMemory::empty(Side::Device),
        input_bytes: plan.input_bytes,
        output_bytes: plan.output_bytes,
        output_offset: plan.output_offset,
        slot_stride: plan.slot_stride,
        alignment: plan.alignment,
        slots_per_allocation: plan.slots_per_allocation,
    };

    // On error `memory` drops and releases whatever was created so far.
    allocate_side(device, plan, &mut memory.host)?;
    allocate_side(device, plan, &mut memory.working)?;

    debug!(
        slots = plan.slot_count,
        allocations = plan.allocations_per_side(),
        stride = plan.slot_stride,
        host_coherent = memory.host.coherent,
        "slot buffers created"
    );
    Ok(memory)
}

fn allocate_side(device: &VulkanDevice, plan: &MemoryPlan, side: &mut SideMemory) -> Result<()> {
    let raw = device.raw();
    let heap = plan.heap(side.side);
    let usage = side.usage();
    side.coherent = side.side == Side::Device || heap.coherent;

    for allocation in 0..plan.allocations_per_side() {
        let first = (allocation * plan.slots_per_allocation) as usize;
        let count = plan.slots_in_allocation(allocation) as usize;

        let mut type_bits = u32::MAX;
        let mut bound = Vec::with_capacity(count * 2);
        for slot in first..first + count {
            let offset = plan.slot_location(slot).offset;
            match plan.binding_style {
                BindingStyle::Separate => {
                    let (input, req_in) = create_buffer(raw, plan.input_bytes, usage)?;
                    let (output, req_out) = match create_buffer(raw, plan.output_bytes, usage) {
                        Ok(created) => created,
                        Err(e) => {
                            unsafe { raw.destroy_buffer(input, None) };
                            return Err(e);
                        }
                    };
                    side.slots.push(SlotBuffers::Separate { input, output });
                    check_requirements(&req_in, plan.output_offset, plan)?;
                    check_requirements(&req_out, plan.slot_stride - plan.output_offset, plan)?;
                    type_bits &= req_in.memory_type_bits & req_out.memory_type_bits;
                    bound.push((input, offset));
                    bound.push((output, offset + plan.output_offset));
                }
                BindingStyle::Combined => {
                    let (buffer, req) = create_buffer(raw, plan.slot_stride, usage)?;
                    side.slots.push(SlotBuffers::Combined(buffer));
                    check_requirements(&req, plan.slot_stride, plan)?;
                    type_bits &= req.memory_type_bits;
                    bound.push((buffer, offset));
                }
            }
        }

        let type_index = if type_bits & (1 << heap.memory_type_index) != 0 {
            heap.memory_type_index
        } else {
            let props = device.instance().memory_properties();
            let flags = side.required_flags(heap);
            let fallback = fallback_memory_type(props, type_bits, flags, heap.heap_index)
                .ok_or(VulkanError::NoMemoryType {
                    what: match side.side {
                        Side::Host => "host-visible on the planned heap",
                        Side::Device => "device-local on the planned heap",
                    },
                    bits: type_bits,
                })?;
            warn!(
                planned = heap.memory_type_index,
                fallback,
                heap = heap.heap_index,
                side = ?side.side,
                "planned memory type rejected by buffers, falling back"
            );
            if side.side == Side::Host {
                side.coherent = props.memory_types[fallback as usize]
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
            }
            fallback
        };

        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(plan.allocation_size(allocation))
            .memory_type_index(type_index);
        let memory = unsafe { raw.allocate_memory(&info, None)? };
        side.allocations.push(memory);

        for (buffer, offset) in bound {
            unsafe { raw.bind_buffer_memory(buffer, memory, offset)? };
        }

        if side.side == Side::Host {
            let ptr = unsafe {
                raw.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
            } as *mut u8;
            side.mapped.push(ptr);
            check_mapping(ptr)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requirements_must_fit_reservation() {
        let plan = hailstone_core::manage_memory(
            &hailstone_core::DeviceLimits::discrete(64 << 20, 64 << 20),
            &hailstone_core::PlanRequest {
                iter_size: 128,
                ..Default::default()
            },
        )
        .unwrap();

        let fits = vk::MemoryRequirements {
            size: plan.input_bytes,
            alignment: 16,
            memory_type_bits: 1,
        };
        assert!(check_requirements(&fits, plan.output_offset, &plan).is_ok());

        let too_big = vk::MemoryRequirements {
            size: plan.output_offset + 1,
            ..fits
        };
        assert!(matches!(
            check_requirements(&too_big, plan.output_offset, &plan),
            Err(VulkanError::PlanMismatch { .. })
        ));

        let misaligned = vk::MemoryRequirements {
            alignment: plan.alignment * 2,
            ..fits
        };
        assert!(check_requirements(&misaligned, plan.output_offset, &plan).is_err());
    }

    fn memory_properties(types: &[(vk::MemoryPropertyFlags, u32)]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            memory_heap_count: 2,
            ..Default::default()
        };
        for (i, &(property_flags, heap_index)) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags,
                heap_index,
            };
        }
        props
    }

    #[test]
    fn test_fallback_stays_on_planned_heap() {
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let visible = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        // 0: planned device type, 1: system memory, 2: second device-local type.
        let props = memory_properties(&[(local, 0), (visible, 1), (local, 0)]);

        // Buffers reject type 0; type 1 is allowed but on the wrong heap.
        assert_eq!(fallback_memory_type(&props, 0b110, local, 0), Some(2));
        // Only system memory left.
        assert_eq!(fallback_memory_type(&props, 0b010, local, 0), None);
        // Without flag requirements the heap still has to match.
        let any = vk::MemoryPropertyFlags::empty();
        assert_eq!(fallback_memory_type(&props, 0b010, any, 0), None);
        assert_eq!(
            fallback_memory_type(&props, 0b010, vk::MemoryPropertyFlags::HOST_VISIBLE, 1),
            Some(1)
        );
    }

    #[test]
    fn test_device_side_requires_device_local() {
        let plan = hailstone_core::manage_memory(
            &hailstone_core::DeviceLimits::discrete(64 << 20, 64 << 20),
            &hailstone_core::PlanRequest::default(),
        )
        .unwrap();
        let working = SideMemory::empty(Side::Device);
        assert_eq!(
            working.required_flags(plan.heap(Side::Device)),
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        );
    }

    #[test]
    fn test_mapping_checks() {
        let err = check_mapping(std::ptr::null_mut()).unwrap_err();
        assert!(matches!(err, VulkanError::Mapping { kind: IoKind::BadAddress, .. }));

        let mut backing = [0u128; 2];
        let aligned = backing.as_mut_ptr() as *mut u8;
        assert!(check_mapping(aligned).is_ok());
        let err = check_mapping(unsafe { aligned.add(4) }).unwrap_err();
        assert!(matches!(err, VulkanError::Mapping { kind: IoKind::BadAlignment, .. }));
    }
}
