//! The upload engine façade.
//!
//! Owns the staging pool, the transfer channels, and the worker pool, and
//! exposes the public upload entry points. Constructed once at startup and
//! passed by reference to whatever needs to upload; there is no global
//! instance.

use crate::channel::TransferChannels;
use crate::error::{Result, UploadError};
use crate::scheduler::{self, UploadTicket};
use crate::staging::StagingPool;
use crate::task::{BufferUploadTask, ImageUploadTask};
use ash::vk;
use hoist_gpu::{GpuAllocator, GpuContext};
use parking_lot::Mutex;
use std::sync::Arc;

/// Uploader configuration, fixed for the engine's lifetime.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Worker thread count. Defaults to the hardware thread count.
    pub thread_count: Option<usize>,
    /// Fraction of the host-visible device-local heap used for staging.
    pub budget_fraction: f64,
    /// Minimum number of image rows one chunk covers.
    ///
    /// Precondition: `row_granularity * width * channel_count` must fit
    /// one staging buffer for every image this engine will upload.
    pub row_granularity: u32,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            thread_count: None,
            budget_fraction: 0.5,
            row_granularity: 150,
        }
    }
}

/// State shared between the façade and in-flight tasks.
pub(crate) struct EngineShared {
    pub(crate) device: Arc<ash::Device>,
    pub(crate) staging: StagingPool,
    pub(crate) channels: TransferChannels,
}

/// Concurrent staged uploader for GPU buffers and images.
///
/// Lifecycle: created by [`BufferUploader::new`], torn down by
/// [`BufferUploader::destroy`] (or `Drop` as a backstop). Re-initialization
/// after destroy is unsupported. All tickets must be joined before destroy.
pub struct BufferUploader {
    shared: Arc<EngineShared>,
    allocator: Arc<Mutex<GpuAllocator>>,
    pool: rayon::ThreadPool,
    row_granularity: u32,
    destroyed: bool,
}

impl BufferUploader {
    /// Create the uploader against an existing GPU context.
    ///
    /// Allocates one staging buffer and one command pool/buffer/fence
    /// triple per worker thread. Any failure tears down what was already
    /// created and aborts; there is no partially initialized uploader.
    pub fn new(context: &GpuContext, config: UploaderConfig) -> Result<Self> {
        if !(config.budget_fraction > 0.0 && config.budget_fraction <= 1.0) {
            return Err(UploadError::InvalidUpload(format!(
                "Budget fraction {} is outside (0, 1]",
                config.budget_fraction
            )));
        }
        if config.row_granularity == 0 {
            return Err(UploadError::InvalidUpload(
                "Row granularity must be at least 1".to_string(),
            ));
        }

        let thread_count = config.thread_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        });

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(thread_count)
            .thread_name(|i| format!("hoist-upload-{i}"))
            .build()
            .map_err(|e| UploadError::ThreadPool(e.to_string()))?;

        let budget = (context.transfer_heap_size() as f64 * config.budget_fraction) as u64;
        let allocator = context.allocator().clone();
        let device = context.device_arc();

        let staging = StagingPool::new(&mut allocator.lock(), thread_count, budget)?;

        let channels = match unsafe {
            TransferChannels::new(
                &device,
                context.transfer_queue_family(),
                context.transfer_queues(),
                thread_count,
            )
        } {
            Ok(channels) => channels,
            Err(e) => {
                let mut staging = staging;
                staging.destroy(&mut allocator.lock());
                return Err(e);
            }
        };

        tracing::info!(
            thread_count,
            queue_count = context.transfer_queues().len(),
            staging_capacity = staging.capacity(),
            "Upload engine initialized"
        );

        Ok(Self {
            shared: Arc::new(EngineShared {
                device,
                staging,
                channels,
            }),
            allocator,
            pool,
            row_granularity: config.row_granularity,
            destroyed: false,
        })
    }

    /// Fixed byte capacity of each staging buffer.
    pub fn staging_capacity(&self) -> u64 {
        self.shared.staging.capacity()
    }

    /// Number of worker threads (= staging buffers = channel slots).
    pub fn worker_count(&self) -> usize {
        self.shared.channels.slot_count()
    }

    /// Upload a byte span into `destination`, starting at offset 0.
    ///
    /// Fire-and-forget: returns a ticket immediately; the destination
    /// buffer must not be used until [`UploadTicket::join`] returns `Ok`.
    /// The caller keeps the buffer alive until then.
    pub fn upload_to_buffer(
        &self,
        data: Arc<[u8]>,
        destination: vk::Buffer,
    ) -> Result<UploadTicket> {
        self.ensure_live()?;
        if data.is_empty() {
            return Err(UploadError::InvalidUpload(
                "Source span is empty".to_string(),
            ));
        }
        if destination == vk::Buffer::null() {
            return Err(UploadError::InvalidUpload(
                "Destination buffer is null".to_string(),
            ));
        }

        let task = BufferUploadTask::new(data, destination, self.shared.clone());
        Ok(scheduler::dispatch(&self.pool, Arc::new(task)))
    }

    /// Upload tightly packed pixel data into `destination`, transitioning
    /// it to `final_layout`.
    ///
    /// After a successful join the whole image holds the source pixels and
    /// its layout is `final_layout`. The extent must be 2D (`depth == 1`).
    pub fn upload_to_image(
        &self,
        data: Arc<[u8]>,
        destination: vk::Image,
        extent: vk::Extent3D,
        final_layout: vk::ImageLayout,
        channel_count: usize,
    ) -> Result<UploadTicket> {
        self.ensure_live()?;
        if data.is_empty() {
            return Err(UploadError::InvalidUpload(
                "Source span is empty".to_string(),
            ));
        }
        if destination == vk::Image::null() {
            return Err(UploadError::InvalidUpload(
                "Destination image is null".to_string(),
            ));
        }
        if extent.width == 0 || extent.height == 0 || extent.depth != 1 {
            return Err(UploadError::InvalidUpload(format!(
                "Unsupported image extent {}x{}x{}",
                extent.width, extent.height, extent.depth
            )));
        }
        if channel_count == 0 {
            return Err(UploadError::InvalidUpload(
                "Channel count must be at least 1".to_string(),
            ));
        }

        let expected = extent.width as usize * extent.height as usize * channel_count;
        if data.len() != expected {
            return Err(UploadError::InvalidUpload(format!(
                "Source span is {} bytes, extent requires {expected}",
                data.len()
            )));
        }

        let chunk_rows = u64::from(self.row_granularity.min(extent.height));
        let chunk_bytes = chunk_rows * u64::from(extent.width) * channel_count as u64;
        if chunk_bytes > self.shared.staging.capacity() {
            return Err(UploadError::InvalidUpload(format!(
                "A {chunk_rows}-row chunk ({chunk_bytes} bytes) exceeds the staging capacity of {} bytes",
                self.shared.staging.capacity()
            )));
        }

        let task = ImageUploadTask::new(
            data,
            destination,
            extent,
            final_layout,
            channel_count,
            self.row_granularity,
            self.shared.clone(),
        );
        Ok(scheduler::dispatch(&self.pool, Arc::new(task)))
    }

    /// Tear down all engine resources in reverse dependency order.
    ///
    /// Fails with [`UploadError::InFlight`] if any task still holds the
    /// engine (join every ticket first). Safe to call more than once.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }

        let shared = Arc::get_mut(&mut self.shared).ok_or(UploadError::InFlight)?;

        shared.staging.destroy(&mut self.allocator.lock());
        unsafe {
            shared.channels.destroy(&shared.device);
        }
        self.destroyed = true;

        tracing::info!("Upload engine destroyed");
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.destroyed {
            return Err(UploadError::Destroyed);
        }
        Ok(())
    }
}

impl Drop for BufferUploader {
    fn drop(&mut self) {
        if !self.destroyed {
            if let Err(e) = self.destroy() {
                tracing::warn!("Upload engine leak on drop: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = UploaderConfig::default();
        assert!(config.thread_count.is_none());
        assert!((config.budget_fraction - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.row_granularity, 150);
    }
}
