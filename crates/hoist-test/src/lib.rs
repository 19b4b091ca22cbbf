//! Test harness for the Hoist upload engine.
//!
//! Provides a headless GPU context, an uploader instance, and readback
//! helpers for verifying destination contents after a join.

pub mod harness;

pub use harness::UploadHarness;

use hoist_gpu::GpuError;
use hoist_upload::UploadError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Install a tracing subscriber for test output. Idempotent.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic byte pattern for upload sources.
pub fn pattern(len: usize, seed: u8) -> std::sync::Arc<[u8]> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect::<Vec<u8>>()
        .into()
}
