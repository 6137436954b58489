//! Background workers draining the enrichment queue.

pub mod pool;

pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
