//! Headless harness: GPU context, uploader, and readback helpers.

use ash::vk;
use gpu_allocator::MemoryLocation;
use hoist_gpu::{command, CommandPool, GpuBuffer, GpuContext, GpuContextBuilder, GpuImage};
use hoist_upload::{BufferUploader, UploaderConfig};

use crate::Result;

/// A headless upload environment for integration tests.
///
/// Field order matters for drop: the uploader and the readback pool must
/// go before the context that owns the device.
pub struct UploadHarness {
    uploader: BufferUploader,
    readback_pool: Option<CommandPool>,
    context: GpuContext,
}

impl UploadHarness {
    /// Create a harness with the default uploader configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(UploaderConfig::default())
    }

    /// Create a harness with a custom uploader configuration.
    pub fn with_config(config: UploaderConfig) -> Result<Self> {
        crate::init_tracing();

        let context = GpuContextBuilder::new()
            .app_name("hoist-test")
            .validation(true)
            .transfer_queue_count(2)
            .build()?;

        let uploader = BufferUploader::new(&context, config)?;

        let readback_pool = unsafe {
            CommandPool::new(
                context.device(),
                context.transfer_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?
        };

        Ok(Self {
            uploader,
            readback_pool: Some(readback_pool),
            context,
        })
    }

    pub fn uploader(&self) -> &BufferUploader {
        &self.uploader
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    /// Create a device-local destination buffer.
    pub fn create_destination_buffer(&self, size: u64) -> Result<GpuBuffer> {
        let buffer = self.context.allocator().lock().create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::GpuOnly,
            "test destination buffer",
        )?;
        Ok(buffer)
    }

    /// Create a device-local 2D destination image.
    pub fn create_destination_image(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> Result<GpuImage> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = self.context.allocator().lock().create_image(
            &create_info,
            MemoryLocation::GpuOnly,
            "test destination image",
        )?;
        Ok(image)
    }

    /// Read back the full contents of a device-local buffer.
    pub fn read_buffer(&self, buffer: &GpuBuffer) -> Result<Vec<u8>> {
        let mut readback = self.context.allocator().lock().create_buffer(
            buffer.size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            "readback buffer",
        )?;

        let device = self.context.device();
        let queue = self.context.transfer_queues()[0];
        let pool = self.readback_pool.as_ref().expect("harness pool");

        unsafe {
            command::execute_single_time_commands(device, pool, queue, |cmd| {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: buffer.size,
                };
                unsafe {
                    device.cmd_copy_buffer(cmd, buffer.buffer, readback.buffer, &[region]);
                }
            })?;
        }

        let mut out = vec![0_u8; buffer.size as usize];
        readback.read_bytes(0, &mut out)?;
        self.context.allocator().lock().free_buffer(&mut readback)?;
        Ok(out)
    }

    /// Read back the full contents of a device-local image.
    ///
    /// `current_layout` must be the layout the image is actually in; the
    /// readback barrier uses it as the old layout, so a wrong value trips
    /// the validation layers. This is how the tests pin down the final
    /// layout contract of image uploads.
    pub fn read_image(
        &self,
        image: &GpuImage,
        current_layout: vk::ImageLayout,
        channel_count: usize,
    ) -> Result<Vec<u8>> {
        let byte_size =
            u64::from(image.extent.width) * u64::from(image.extent.height) * channel_count as u64;

        let mut readback = self.context.allocator().lock().create_buffer(
            byte_size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            "readback buffer",
        )?;

        let device = self.context.device();
        let queue = self.context.transfer_queues()[0];
        let pool = self.readback_pool.as_ref().expect("harness pool");

        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1);

        unsafe {
            command::execute_single_time_commands(device, pool, queue, |cmd| {
                let to_transfer_src = vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(vk::PipelineStageFlags2::TOP_OF_PIPE)
                    .src_access_mask(vk::AccessFlags2::NONE)
                    .dst_stage_mask(vk::PipelineStageFlags2::COPY)
                    .dst_access_mask(vk::AccessFlags2::TRANSFER_READ)
                    .old_layout(current_layout)
                    .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image.image)
                    .subresource_range(subresource_range);
                let barriers = [to_transfer_src];
                let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
                unsafe {
                    device.cmd_pipeline_barrier2(cmd, &dependency);
                }

                let region = vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D::default(),
                    image_extent: image.extent,
                };
                unsafe {
                    device.cmd_copy_image_to_buffer(
                        cmd,
                        image.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        readback.buffer,
                        &[region],
                    );
                }
            })?;
        }

        let mut out = vec![0_u8; byte_size as usize];
        readback.read_bytes(0, &mut out)?;
        self.context.allocator().lock().free_buffer(&mut readback)?;
        Ok(out)
    }

    /// Free a destination buffer created by this harness.
    pub fn free_buffer(&self, buffer: &mut GpuBuffer) -> Result<()> {
        self.context.allocator().lock().free_buffer(buffer)?;
        Ok(())
    }

    /// Free a destination image created by this harness.
    pub fn free_image(&self, image: &mut GpuImage) -> Result<()> {
        self.context.allocator().lock().free_image(image)?;
        Ok(())
    }
}

impl Drop for UploadHarness {
    fn drop(&mut self) {
        let _ = self.context.wait_idle();
        if let Some(pool) = self.readback_pool.take() {
            unsafe {
                pool.destroy(self.context.device());
            }
        }
    }
}
