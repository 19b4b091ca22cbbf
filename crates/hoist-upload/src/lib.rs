//! Concurrent staged upload engine for the Hoist renderer stack.
//!
//! Moves bulk CPU-resident data (vertex/index buffers, image pixel data)
//! into device-local GPU memory using a bounded pool of per-thread staging
//! buffers, a work-partitioning rayon pool, and multiple hardware transfer
//! queues selected round-robin.
//!
//! Parallelism comes from overlap across worker threads and transfer
//! queues; within one thread, chunks run strictly sequentially with a
//! fence wait after each submission, which bounds in-flight command
//! buffers to one per thread.

mod channel;
pub mod error;
mod scheduler;
pub mod staging;
mod task;
pub mod uploader;

pub use error::{Result, UploadError};
pub use scheduler::UploadTicket;
pub use staging::StagingPool;
pub use uploader::{BufferUploader, UploaderConfig};
