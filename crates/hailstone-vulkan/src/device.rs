//! Instance and device bootstrap, plus the capability probe.
//!
//! Bootstrap is split in two so planning can run between the probe and
//! logical-device creation: a [`VulkanInstance`] knows the chosen physical
//! device and its limits, and [`VulkanInstance::open_device`] turns it into
//! a [`VulkanDevice`] with one transfer and one compute queue.

use ash::vk;
use hailstone_core::plan::{MemoryHeap, MemoryType};
use hailstone_core::protocol::QueueFamilies;
use hailstone_core::DeviceLimits;
use tracing::{debug, info};

use crate::error::{Result, VulkanError};

/// Picks queue families for the transfer and compute roles.
///
/// Compute prefers a family without graphics; transfer prefers a dedicated
/// DMA family and otherwise shares the compute family.
pub fn select_queue_families(families: &[vk::QueueFamilyProperties]) -> Option<QueueFamilies> {
    let usable = |f: &vk::QueueFamilyProperties| f.queue_count > 0;
    let position = |pred: &dyn Fn(vk::QueueFlags) -> bool| {
        families
            .iter()
            .position(|f| usable(f) && pred(f.queue_flags))
            .map(|i| i as u32)
    };

    let compute = position(&|q| q.contains(vk::QueueFlags::COMPUTE) && !q.contains(vk::QueueFlags::GRAPHICS))
        .or_else(|| position(&|q| q.contains(vk::QueueFlags::COMPUTE)))?;
    let transfer = position(&|q| {
        q.contains(vk::QueueFlags::TRANSFER)
            && !q.intersects(vk::QueueFlags::COMPUTE | vk::QueueFlags::GRAPHICS)
    })
    .unwrap_or(compute);

    Some(QueueFamilies { transfer, compute })
}

fn device_rank(kind: vk::PhysicalDeviceType) -> u32 {
    match kind {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}

/// A Vulkan instance bound to one physical device.
pub struct VulkanInstance {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_properties: Vec<vk::QueueFamilyProperties>,
    max_allocation_size: u64,
    families: QueueFamilies,
}

impl VulkanInstance {
    /// Loads Vulkan and selects a physical device.
    ///
    /// Without an explicit index the highest-ranked device (discrete first)
    /// that offers a compute queue is used.
    pub fn create(device_index: Option<usize>) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"hailstone")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"hailstone")
            .api_version(vk::API_VERSION_1_1);
        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&create_info, None)? };

        match Self::select(&instance, device_index) {
            Ok((physical, families)) => Ok(Self::describe(entry, instance, physical, families)),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    fn select(
        instance: &ash::Instance,
        device_index: Option<usize>,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices()? };

        let candidates: Vec<(usize, vk::PhysicalDevice, QueueFamilies, u32)> = devices
            .iter()
            .enumerate()
            .filter_map(|(i, &pd)| {
                let props = unsafe { instance.get_physical_device_properties(pd) };
                let queues = unsafe { instance.get_physical_device_queue_family_properties(pd) };
                let families = select_queue_families(&queues)?;
                Some((i, pd, families, props.api_version))
            })
            .collect();

        let chosen = match device_index {
            Some(index) => candidates
                .iter()
                .find(|(i, ..)| *i == index)
                .ok_or(VulkanError::DeviceNotFound(index))?,
            None => candidates
                .iter()
                .max_by_key(|(i, pd, ..)| {
                    let props = unsafe { instance.get_physical_device_properties(*pd) };
                    (device_rank(props.device_type), std::cmp::Reverse(*i))
                })
                .ok_or(VulkanError::NoDevice)?,
        };

        let (_, physical, families, api_version) = *chosen;
        let (major, minor) = (vk::api_version_major(api_version), vk::api_version_minor(api_version));
        if major == 1 && minor < 1 {
            return Err(VulkanError::UnsupportedVersion { major, minor });
        }
        Ok((physical, families))
    }

    fn describe(
        entry: ash::Entry,
        instance: ash::Instance,
        physical: vk::PhysicalDevice,
        families: QueueFamilies,
    ) -> Self {
        let mut maintenance3 = vk::PhysicalDeviceMaintenance3Properties::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut maintenance3);
        unsafe { instance.get_physical_device_properties2(physical, &mut properties2) };
        let properties = properties2.properties;
        let max_allocation_size = maintenance3.max_memory_allocation_size;

        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical) };
        let queue_properties =
            unsafe { instance.get_physical_device_queue_family_properties(physical) };

        let this = Self {
            _entry: entry,
            instance,
            physical,
            properties,
            memory_properties,
            queue_properties,
            max_allocation_size,
            families,
        };
        info!(
            device = %this.name(),
            transfer_family = families.transfer,
            compute_family = families.compute,
            "selected Vulkan device"
        );
        this
    }

    /// Device name.
    pub fn name(&self) -> String {
        self.properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Queue families chosen for the two roles.
    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    /// Physical device properties.
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Physical device memory properties.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Reads the limits the planner needs.
    pub fn probe(&self) -> DeviceLimits {
        let mp = &self.memory_properties;
        let heaps = mp.memory_heaps[..mp.memory_heap_count as usize]
            .iter()
            .map(|h| MemoryHeap {
                size: h.size,
                device_local: h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL),
            })
            .collect();
        let memory_types = mp.memory_types[..mp.memory_type_count as usize]
            .iter()
            .map(|t| MemoryType {
                heap_index: t.heap_index,
                device_local: t.property_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL),
                host_visible: t.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
                host_coherent: t.property_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT),
                host_cached: t.property_flags.contains(vk::MemoryPropertyFlags::HOST_CACHED),
            })
            .collect();

        let limits = &self.properties.limits;
        let probed = DeviceLimits {
            device_name: self.name(),
            heaps,
            memory_types,
            max_allocation_size: self.max_allocation_size,
            max_memory_allocation_count: limits.max_memory_allocation_count,
            max_storage_buffer_range: u64::from(limits.max_storage_buffer_range),
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            non_coherent_atom_size: limits.non_coherent_atom_size,
            max_workgroup_size_x: limits.max_compute_work_group_size[0],
            max_workgroup_invocations: limits.max_compute_work_group_invocations,
            max_workgroup_count_x: limits.max_compute_work_group_count[0],
        };
        debug!(?probed, "probed device limits");
        probed
    }

    /// Creates the logical device and its queues.
    pub fn open_device(self) -> Result<VulkanDevice> {
        let families = self.families;
        let priorities = [1.0f32, 1.0];

        // A shared family gets a second queue when it has one to give.
        let (queue_infos, transfer_index) = if families.is_shared() {
            let available = self.queue_properties[families.compute as usize].queue_count;
            let count = available.min(2) as usize;
            (
                vec![vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(families.compute)
                    .queue_priorities(&priorities[..count])],
                (count - 1) as u32,
            )
        } else {
            (
                vec![
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(families.compute)
                        .queue_priorities(&priorities[..1]),
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(families.transfer)
                        .queue_priorities(&priorities[..1]),
                ],
                0,
            )
        };

        let create_info = vk::DeviceCreateInfo::default().queue_create_infos(&queue_infos);
        let device = unsafe {
            self.instance
                .create_device(self.physical, &create_info, None)?
        };
        let compute_queue = unsafe { device.get_device_queue(families.compute, 0) };
        let transfer_queue = unsafe { device.get_device_queue(families.transfer, transfer_index) };

        Ok(VulkanDevice {
            device,
            transfer_queue,
            compute_queue,
            instance: self,
        })
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe { self.instance.destroy_instance(None) };
        debug!("Vulkan instance destroyed");
    }
}

/// Logical device with its transfer and compute queues.
pub struct VulkanDevice {
    device: ash::Device,
    transfer_queue: vk::Queue,
    compute_queue: vk::Queue,
    // Dropped after the device.
    instance: VulkanInstance,
}

impl VulkanDevice {
    /// Raw device handle.
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    /// The instance this device was created from.
    pub fn instance(&self) -> &VulkanInstance {
        &self.instance
    }

    /// Queue families for the two roles.
    pub fn families(&self) -> QueueFamilies {
        self.instance.families
    }

    /// Queue used for uploads and readbacks.
    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    /// Queue used for dispatches.
    pub fn compute_queue(&self) -> vk::Queue {
        self.compute_queue
    }

    /// Pipeline cache identity of the physical device.
    pub fn cache_identity(&self) -> crate::cache::CacheIdentity {
        let props = &self.instance.properties;
        crate::cache::CacheIdentity {
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            uuid: props.pipeline_cache_uuid,
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
        debug!("Vulkan device destroyed");
    }
}
