//! Upload engine error types.

use ash::vk;
use hoist_gpu::GpuError;
use thiserror::Error;

/// Errors produced by the upload engine.
#[derive(Error, Debug)]
pub enum UploadError {
    /// Error from the GPU layer.
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    /// Raw Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// A queue submission was rejected by the driver.
    ///
    /// The affected chunk was not transferred; the destination resource
    /// must not be used.
    #[error("Queue submission failed: {0}")]
    SubmitFailed(vk::Result),

    /// A fence wait expired before the chunk's copy completed.
    #[error("Fence wait timed out before the transfer completed")]
    FenceTimeout,

    /// The task was rejected before scheduling.
    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    /// A partition executed outside the engine's worker pool.
    #[error("Upload partition executed outside the worker pool")]
    OutsideWorkerPool,

    /// The uploader has already been destroyed.
    #[error("Uploader has been destroyed")]
    Destroyed,

    /// Teardown was requested while upload tasks were still in flight.
    #[error("Uploads still in flight; join all tickets before destroying")]
    InFlight,

    /// Worker pool construction failed.
    #[error("Worker pool construction failed: {0}")]
    ThreadPool(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, UploadError>;
