//! Vulkan context and memory layer for the Hoist upload engine.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - Queue family discovery with dedicated-transfer preference
//! - Memory allocation via gpu-allocator
//! - Command pool and fence helpers

pub mod command;
pub mod context;
pub mod error;
pub mod instance;
pub mod memory;
pub mod sync;

pub use command::CommandPool;
pub use context::{GpuContext, GpuContextBuilder};
pub use error::{GpuError, Result};
pub use memory::{transfer_heap_size, GpuAllocator, GpuBuffer, GpuImage};
pub use sync::{create_fence, reset_fence};
