//! Partitionable upload tasks.
//!
//! A task describes a source byte span and a destination GPU resource and
//! knows how to split itself into chunks that each fit one staging buffer.
//! Buffer tasks partition by staging-buffer-sized byte chunks; image tasks
//! partition by whole rows.

use crate::error::Result;
use crate::uploader::EngineShared;
use ash::vk;
use std::ops::Range;
use std::sync::Arc;

/// A unit of work the scheduler can partition across worker threads.
///
/// Implementations must tolerate partitions executing in any order and on
/// any worker, but may assume no two partitions run concurrently on the
/// same worker slot.
pub(crate) trait UploadTask: Send + Sync {
    /// Total number of indivisible partitions.
    fn partition_count(&self) -> usize;

    /// Minimum number of partitions one execution should cover.
    fn min_granularity(&self) -> usize {
        1
    }

    /// Execute the given partition range on worker slot `worker`.
    fn run(&self, range: Range<usize>, worker: usize) -> Result<()>;
}

/// Number of staging-buffer-sized partitions for a `len`-byte source.
pub(crate) fn partition_count(len: usize, capacity: usize) -> usize {
    debug_assert!(capacity > 0);
    len.div_ceil(capacity)
}

/// Byte range covered by partition `index`.
///
/// Partitions are contiguous, non-overlapping, and exactly cover
/// `[0, len)`; the last one may be short.
pub(crate) fn partition_span(index: usize, len: usize, capacity: usize) -> Range<usize> {
    let start = index * capacity;
    let end = len.min(start + capacity);
    debug_assert!(start < end);
    start..end
}

/// Uploads a byte span into a destination buffer, one staging-buffer-sized
/// chunk per partition.
pub(crate) struct BufferUploadTask {
    data: Arc<[u8]>,
    destination: vk::Buffer,
    engine: Arc<EngineShared>,
}

impl BufferUploadTask {
    pub(crate) fn new(data: Arc<[u8]>, destination: vk::Buffer, engine: Arc<EngineShared>) -> Self {
        Self {
            data,
            destination,
            engine,
        }
    }
}

impl UploadTask for BufferUploadTask {
    fn partition_count(&self) -> usize {
        partition_count(self.data.len(), self.engine.staging.capacity() as usize)
    }

    fn run(&self, range: Range<usize>, worker: usize) -> Result<()> {
        let capacity = self.engine.staging.capacity() as usize;
        let staging = self.engine.staging.buffer(worker);
        let device = &self.engine.device;

        for i in range {
            let span = partition_span(i, self.data.len(), capacity);
            let chunk = &self.data[span.clone()];

            // The slot's previous chunk has fully completed (fence wait),
            // so the staging buffer is free for reuse.
            staging.write_bytes(0, chunk)?;

            unsafe {
                self.engine.channels.submit_and_wait(device, worker, |cmd| {
                    let region = vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: span.start as u64,
                        size: chunk.len() as u64,
                    };
                    unsafe {
                        device.cmd_copy_buffer(cmd, staging.buffer, self.destination, &[region]);
                    }
                })?;
            }
        }

        Ok(())
    }
}

/// Uploads tightly packed pixel rows into a destination image.
///
/// One partition is one row; executions cover row ranges of at least
/// `min_granularity` rows. Configuration precondition:
/// `min_granularity * width * channel_count` must not exceed one staging
/// buffer's capacity. The façade rejects tasks that violate it.
pub(crate) struct ImageUploadTask {
    data: Arc<[u8]>,
    destination: vk::Image,
    extent: vk::Extent3D,
    final_layout: vk::ImageLayout,
    channel_count: usize,
    row_granularity: u32,
    engine: Arc<EngineShared>,
}

impl ImageUploadTask {
    pub(crate) fn new(
        data: Arc<[u8]>,
        destination: vk::Image,
        extent: vk::Extent3D,
        final_layout: vk::ImageLayout,
        channel_count: usize,
        row_granularity: u32,
        engine: Arc<EngineShared>,
    ) -> Self {
        Self {
            data,
            destination,
            extent,
            final_layout,
            channel_count,
            row_granularity,
            engine,
        }
    }

    /// Bytes per tightly packed row.
    fn row_pitch(&self) -> usize {
        self.extent.width as usize * self.channel_count
    }
}

impl UploadTask for ImageUploadTask {
    fn partition_count(&self) -> usize {
        self.extent.height as usize
    }

    fn min_granularity(&self) -> usize {
        (self.row_granularity.min(self.extent.height)) as usize
    }

    fn run(&self, rows: Range<usize>, worker: usize) -> Result<()> {
        let pitch = self.row_pitch();
        let chunk = &self.data[rows.start * pitch..rows.end * pitch];
        let staging = self.engine.staging.buffer(worker);
        let device = &self.engine.device;

        debug_assert!(chunk.len() as u64 <= self.engine.staging.capacity());
        staging.write_bytes(0, chunk)?;

        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1);

        unsafe {
            self.engine.channels.submit_and_wait(device, worker, |cmd| {
                // The whole subresource must be TRANSFER_DST before any
                // copy; only this row range's texels are written.
                let to_transfer_dst = vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(vk::PipelineStageFlags2::TOP_OF_PIPE)
                    .src_access_mask(vk::AccessFlags2::NONE)
                    .dst_stage_mask(vk::PipelineStageFlags2::COPY)
                    .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(self.destination)
                    .subresource_range(subresource_range);
                let barriers = [to_transfer_dst];
                let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
                unsafe {
                    device.cmd_pipeline_barrier2(cmd, &dependency);
                }

                let copy = vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D {
                        x: 0,
                        y: rows.start as i32,
                        z: 0,
                    },
                    image_extent: vk::Extent3D {
                        width: self.extent.width,
                        height: (rows.end - rows.start) as u32,
                        depth: 1,
                    },
                };
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        staging.buffer,
                        self.destination,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[copy],
                    );
                }

                let to_final = vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(vk::PipelineStageFlags2::COPY)
                    .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                    .dst_stage_mask(vk::PipelineStageFlags2::BOTTOM_OF_PIPE)
                    .dst_access_mask(vk::AccessFlags2::NONE)
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(self.final_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(self.destination)
                    .subresource_range(subresource_range);
                let barriers = [to_final];
                let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
                unsafe {
                    device.cmd_pipeline_barrier2(cmd, &dependency);
                }
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(len: usize, capacity: usize) -> Vec<Range<usize>> {
        (0..partition_count(len, capacity))
            .map(|i| partition_span(i, len, capacity))
            .collect()
    }

    #[test]
    fn partition_count_is_ceil() {
        assert_eq!(partition_count(1, 500_000), 1);
        assert_eq!(partition_count(500_000, 500_000), 1);
        assert_eq!(partition_count(500_001, 500_000), 2);
        assert_eq!(partition_count(1_500_000, 500_000), 3);
        assert_eq!(partition_count(1_500_001, 500_000), 4);
    }

    #[test]
    fn partitions_cover_source_exactly() {
        for len in [1, 17, 499_999, 500_000, 1_234_567] {
            let spans = spans(len, 500_000);
            assert_eq!(spans[0].start, 0);
            assert_eq!(spans.last().unwrap().end, len);
            for pair in spans.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
        }
    }

    #[test]
    fn exact_multiple_has_no_empty_partition() {
        let spans = spans(1_500_000, 500_000);
        assert_eq!(spans.len(), 3);
        for span in &spans {
            assert_eq!(span.len(), 500_000);
        }
    }

    #[test]
    fn one_byte_tail_partition() {
        let spans = spans(1_500_001, 500_000);
        assert_eq!(spans.len(), 4);
        assert_eq!(spans[3].len(), 1);
        assert_eq!(spans[3], 1_500_000..1_500_001);
    }

    #[test]
    fn partitions_reconstruct_source_bytes() {
        let data: Vec<u8> = (0..10_000_u32).map(|i| (i % 251) as u8).collect();
        let capacity = 1024;

        let mut rebuilt = vec![0_u8; data.len()];
        for i in 0..partition_count(data.len(), capacity) {
            let span = partition_span(i, data.len(), capacity);
            rebuilt[span.clone()].copy_from_slice(&data[span]);
        }
        assert_eq!(rebuilt, data);
    }
}
