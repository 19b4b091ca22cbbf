//! GPU context management.

use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::{transfer_heap_size, GpuAllocator};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) allocator: Arc<Mutex<GpuAllocator>>,

    // Queue family and queues
    pub(crate) transfer_queue_family: u32,
    pub(crate) transfer_queues: Vec<vk::Queue>,

    // Size of the host-visible device-local heap staging memory comes from
    pub(crate) transfer_heap_size: u64,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get a shared handle to the Vulkan device.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        self.device.clone()
    }

    /// Get the transfer queues opened at device creation.
    pub fn transfer_queues(&self) -> &[vk::Queue] {
        &self.transfer_queues
    }

    /// Get the transfer queue family index.
    pub fn transfer_queue_family(&self) -> u32 {
        self.transfer_queue_family
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Arc<Mutex<GpuAllocator>> {
        &self.allocator
    }

    /// Size of the heap staging memory is carved from.
    pub fn transfer_heap_size(&self) -> u64 {
        self.transfer_heap_size
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    transfer_queue_count: usize,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Hoist".to_string(),
            enable_validation: cfg!(debug_assertions),
            transfer_queue_count: 1,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Number of transfer queues to open.
    ///
    /// Clamped to what the selected queue family actually provides.
    pub fn transfer_queue_count(mut self, count: usize) -> Self {
        self.transfer_queue_count = count.max(1);
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        // Load Vulkan entry point
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        // Create Vulkan instance
        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        // Select best physical device
        let physical_device = unsafe { select_physical_device(&instance) }?;

        // Find the transfer queue family
        let family =
            unsafe { find_transfer_family(&instance, physical_device, self.transfer_queue_count) }?;

        tracing::info!(
            transfer_family = family.index,
            transfer_queue_count = family.queue_count,
            "Selected transfer queue family"
        );

        // Create logical device
        let (device, transfer_queues) =
            unsafe { create_device(&instance, physical_device, &family)? };

        let device = Arc::new(device);

        let transfer_heap = unsafe { transfer_heap_size(&instance, physical_device) };

        // Create GPU allocator
        let allocator = unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) }?;

        Ok(GpuContext {
            entry,
            instance,
            device,
            allocator: Arc::new(Mutex::new(allocator)),
            transfer_queue_family: family.index,
            transfer_queues,
            transfer_heap_size: transfer_heap,
        })
    }
}

/// The transfer queue family and the number of queues to open on it.
struct TransferFamily {
    index: u32,
    queue_count: usize,
}

/// Find the queue family transfer work runs on.
///
/// Prefers a dedicated transfer family (no graphics or compute bits) and
/// falls back to a graphics-capable family when none exists; graphics
/// queues always support transfer.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_transfer_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    requested_queues: usize,
) -> Result<TransferFamily> {
    let queue_families = instance.get_physical_device_queue_family_properties(physical_device);

    let mut graphics_family = None;
    let mut transfer_family = None;

    for (i, family) in queue_families.iter().enumerate() {
        let i = i as u32;

        // Look for dedicated transfer queue (no graphics or compute)
        if family.queue_flags.contains(vk::QueueFlags::TRANSFER)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && !family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && transfer_family.is_none()
        {
            transfer_family = Some(i);
        }

        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
            graphics_family = Some(i);
        }
    }

    let index = transfer_family
        .or(graphics_family)
        .ok_or(GpuError::NoSuitableDevice)?;

    let available = queue_families[index as usize].queue_count as usize;
    let queue_count = requested_queues.clamp(1, available);
    if queue_count < requested_queues {
        tracing::warn!(
            requested = requested_queues,
            available,
            "Transfer queue family provides fewer queues than requested"
        );
    }

    Ok(TransferFamily { index, queue_count })
}

/// Create the logical device and retrieve the transfer queues.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    family: &TransferFamily,
) -> Result<(ash::Device, Vec<vk::Queue>)> {
    // Queue priorities must outlive the create info that borrows them
    let priorities = vec![1.0_f32; family.queue_count];

    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(family.index)
        .queue_priorities(&priorities)];

    // Enable Vulkan 1.3 features
    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .maintenance4(true);

    // Chain features together
    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_3_features);

    // Create the device
    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .push_next(&mut features2);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)?;

    // Get queue handles
    let transfer_queues = (0..family.queue_count)
        .map(|i| device.get_device_queue(family.index, i as u32))
        .collect();

    Ok((device, transfer_queues))
}
