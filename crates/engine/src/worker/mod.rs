//! Bounded worker pool: the in-process dispatcher a wave loop runs
//! each ready step's body through.

mod pool;

pub use pool::{WorkerPool, WorkerPoolConfig};
