//! Fixed pool of per-worker staging buffers.

use crate::error::{Result, UploadError};
use ash::vk;
use gpu_allocator::MemoryLocation;
use hoist_gpu::{GpuAllocator, GpuBuffer};

/// Align `value` down to a multiple of `alignment`.
pub(crate) fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    value - value % alignment
}

/// A bounded pool of host-visible staging buffers, one per worker thread.
///
/// Every buffer has the same fixed capacity, chosen once at construction
/// as `floor(align_down(budget, thread_count) / thread_count)`. Buffers
/// are never resized. Each worker slot owns exactly one buffer; the
/// per-chunk fence wait in the transfer channel serializes reuse, so no
/// locking is needed here.
pub struct StagingPool {
    buffers: Vec<GpuBuffer>,
    capacity: u64,
}

impl StagingPool {
    /// Allocate `thread_count` staging buffers out of `budget` bytes.
    ///
    /// Buffers live in `CpuToGpu` memory (host-visible, host-coherent and
    /// device-local where the heap allows), so writes need no explicit
    /// flush. Any allocation failure tears down the buffers created so far
    /// and aborts initialization.
    pub fn new(allocator: &mut GpuAllocator, thread_count: usize, budget: u64) -> Result<Self> {
        assert!(thread_count > 0);

        let total = align_down(budget, thread_count as u64);
        let capacity = total / thread_count as u64;
        if capacity == 0 {
            return Err(UploadError::InvalidUpload(format!(
                "Transfer budget of {budget} bytes is too small for {thread_count} staging buffers"
            )));
        }

        let mut buffers = Vec::with_capacity(thread_count);
        for i in 0..thread_count {
            let name = format!("staging buffer {i}");
            match allocator.create_buffer(
                capacity,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
                &name,
            ) {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    tracing::error!("Failed to allocate {name}: {e}");
                    for mut buffer in buffers {
                        if let Err(e) = allocator.free_buffer(&mut buffer) {
                            tracing::warn!("Failed to free staging buffer during rollback: {e}");
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        tracing::info!(
            buffer_count = thread_count,
            capacity_bytes = capacity,
            "Created staging pool"
        );

        Ok(Self { buffers, capacity })
    }

    /// Fixed byte capacity of every staging buffer.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The staging buffer owned by `worker`.
    ///
    /// # Panics
    /// Panics if `worker` is not a valid worker slot index.
    pub fn buffer(&self, worker: usize) -> &GpuBuffer {
        &self.buffers[worker]
    }

    /// Free all staging buffers. Idempotent.
    pub fn destroy(&mut self, allocator: &mut GpuAllocator) {
        for buffer in &mut self.buffers {
            if let Err(e) = allocator.free_buffer(buffer) {
                tracing::warn!("Failed to free staging buffer: {e}");
            }
        }
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_down_multiples() {
        assert_eq!(align_down(100, 8), 96);
        assert_eq!(align_down(96, 8), 96);
        assert_eq!(align_down(7, 8), 0);
        assert_eq!(align_down(0, 8), 0);
    }

    #[test]
    fn capacity_splits_budget_evenly() {
        // floor(align_down(budget, n) / n), as the pool computes it
        let budget = 224_395_264_u64 / 2;
        let n = 12_u64;
        let capacity = align_down(budget, n) / n;
        assert_eq!(capacity * n, align_down(budget, n));
        assert!(capacity * n <= budget);
    }
}
