//! Parallel execution support for embir
//!
//! Per-method work (pass pipelines over independent graphs) is spread over
//! a bounded rayon pool.

mod executor;

pub use executor::{parallel_map, ParallelConfig};
