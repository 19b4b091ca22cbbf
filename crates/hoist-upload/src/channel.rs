//! Per-worker transfer channels and shared transfer queues.
//!
//! Each worker thread slot owns a {command pool, command buffer, fence}
//! triple that is reset and reused for every chunk. The hardware transfer
//! queues are the only cross-thread state; each queue handle lives behind
//! its own mutex and queues are picked round-robin per submission.

use crate::error::{Result, UploadError};
use ash::vk;
use hoist_gpu::{command, sync, CommandPool};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fence waits are effectively unbounded; a chunk is done when it is done.
const FENCE_WAIT_TIMEOUT_NS: u64 = u64::MAX;

/// A shared transfer queue. The mutex wraps the handle so submitting
/// without holding the lock is impossible.
pub(crate) struct TransferQueue {
    handle: Mutex<vk::Queue>,
}

impl TransferQueue {
    fn new(handle: vk::Queue) -> Self {
        Self {
            handle: Mutex::new(handle),
        }
    }
}

/// Command recording state exclusively owned by one worker slot.
struct PerThreadChannel {
    pool: CommandPool,
    buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

/// The pool of per-worker channels plus the shared transfer queues.
pub(crate) struct TransferChannels {
    channels: Vec<PerThreadChannel>,
    queues: Vec<TransferQueue>,
    next_queue: AtomicUsize,
}

impl TransferChannels {
    /// Create one channel per worker slot against `queue_family`.
    ///
    /// Fences start signaled so a slot's first reset is well-defined.
    /// On partial failure everything created so far is destroyed.
    ///
    /// # Safety
    /// The device must be valid; `queues` must belong to `queue_family`.
    pub(crate) unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        queues: &[vk::Queue],
        slot_count: usize,
    ) -> Result<Self> {
        assert!(!queues.is_empty());
        assert!(slot_count > 0);

        let mut channels: Vec<PerThreadChannel> = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            match Self::create_channel(device, queue_family) {
                Ok(channel) => channels.push(channel),
                Err(e) => {
                    tracing::error!("Failed to create transfer channel: {e}");
                    for channel in &channels {
                        channel.destroy(device);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            channels,
            queues: queues.iter().copied().map(TransferQueue::new).collect(),
            next_queue: AtomicUsize::new(0),
        })
    }

    unsafe fn create_channel(device: &ash::Device, queue_family: u32) -> Result<PerThreadChannel> {
        let pool = CommandPool::new(
            device,
            queue_family,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;

        let buffer = match pool.allocate_command_buffer(device, vk::CommandBufferLevel::PRIMARY) {
            Ok(buffer) => buffer,
            Err(e) => {
                pool.destroy(device);
                return Err(e.into());
            }
        };

        let fence = match sync::create_fence(device, true) {
            Ok(fence) => fence,
            Err(e) => {
                pool.destroy(device);
                return Err(e.into());
            }
        };

        Ok(PerThreadChannel {
            pool,
            buffer,
            fence,
        })
    }

    /// Number of worker slots.
    pub(crate) fn slot_count(&self) -> usize {
        self.channels.len()
    }

    /// Pick the next transfer queue, round-robin.
    pub(crate) fn next_queue(&self) -> &TransferQueue {
        let index = self.next_queue.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        &self.queues[index]
    }

    /// Run one chunk through the per-chunk submission protocol:
    /// reset the slot's fence and command buffer, record the transfer
    /// commands, submit on the next round-robin queue under its lock, and
    /// block until the fence signals.
    ///
    /// The queue lock is released as soon as the submit call returns; the
    /// fence wait happens outside it. The wait is what makes reusing the
    /// slot's staging buffer and command buffer for the next chunk safe.
    ///
    /// # Safety
    /// The device must be valid and `worker` must be a valid slot index
    /// that no other thread is concurrently executing a chunk on.
    pub(crate) unsafe fn submit_and_wait<F>(
        &self,
        device: &ash::Device,
        worker: usize,
        record: F,
    ) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let channel = &self.channels[worker];

        sync::reset_fence(device, channel.fence)?;
        device.reset_command_buffer(channel.buffer, vk::CommandBufferResetFlags::empty())?;

        command::begin_command_buffer(
            device,
            channel.buffer,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        )?;
        record(channel.buffer);
        command::end_command_buffer(device, channel.buffer)?;

        let queue = self.next_queue();
        {
            // Concurrent submission to one queue is a driver error; the
            // lock is held for the submit call only, never the wait.
            let handle = queue.handle.lock();
            let buffers = [channel.buffer];
            let submit_info = vk::SubmitInfo::default().command_buffers(&buffers);
            if let Err(e) = device.queue_submit(*handle, &[submit_info], channel.fence) {
                tracing::error!("Failed to submit transfer chunk: {e}");
                return Err(UploadError::SubmitFailed(e));
            }
        }

        match device.wait_for_fences(&[channel.fence], true, FENCE_WAIT_TIMEOUT_NS) {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(UploadError::FenceTimeout),
            Err(e) => Err(e.into()),
        }
    }

    /// Destroy all fences and command pools. Idempotent.
    ///
    /// # Safety
    /// The device must be valid and no chunk may be in flight.
    pub(crate) unsafe fn destroy(&mut self, device: &ash::Device) {
        for channel in &self.channels {
            channel.destroy(device);
        }
        self.channels.clear();
        self.queues.clear();
    }
}

impl PerThreadChannel {
    /// # Safety
    /// The device must be valid and the channel must not be in use.
    unsafe fn destroy(&self, device: &ash::Device) {
        if self.fence != vk::Fence::null() {
            device.destroy_fence(self.fence, None);
        }
        // The command buffer is freed with its pool
        self.pool.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Round-robin selection is pure index arithmetic; exercise it without
    // a device by building the queue list directly.
    fn channels_with_queues(count: usize) -> TransferChannels {
        TransferChannels {
            channels: Vec::new(),
            queues: (0..count)
                .map(|_| TransferQueue::new(vk::Queue::null()))
                .collect(),
            next_queue: AtomicUsize::new(0),
        }
    }

    #[test]
    fn round_robin_cycles_over_all_queues() {
        let channels = channels_with_queues(3);

        let mut picked = Vec::new();
        for _ in 0..6 {
            let queue = channels.next_queue();
            let index = channels
                .queues
                .iter()
                .position(|q| std::ptr::eq(q, queue))
                .unwrap();
            picked.push(index);
        }

        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn round_robin_single_queue() {
        let channels = channels_with_queues(1);
        for _ in 0..4 {
            let queue = channels.next_queue();
            assert!(std::ptr::eq(queue, &channels.queues[0]));
        }
    }
}
