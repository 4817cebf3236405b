//! Parallel executor for per-method compilation
//!
//! Uses Rayon for work-stealing parallelism with a bounded pool. Items are
//! moved into the workers, so each graph is owned by exactly one thread.

use crate::error::{Error, Result};
use rayon::prelude::*;

/// Configuration for parallel execution
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    /// Maximum number of worker threads (default: num_cpus)
    pub max_parallelism: usize,
    /// Fail fast on first error vs collect all results
    pub fail_fast: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_parallelism: num_cpus::get(),
            fail_fast: false,
        }
    }
}

/// Parallel map over owned items
///
/// # Returns
/// * `Ok(results)` - one result per item, in input order
/// * `Err(Error)` - the pool could not be built, or (with `fail_fast`) an
///   item failed; remaining items may not have been processed
///
/// # Example
/// ```ignore
/// let results = parallel_map(graphs, |mut cfg| compile(&mut cfg), &ParallelConfig::default())?;
/// ```
pub fn parallel_map<T, R, F>(items: Vec<T>, mapper: F, config: &ParallelConfig) -> Result<Vec<Result<R>>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R> + Send + Sync,
{
    // Empty array fast path
    if items.is_empty() {
        return Ok(Vec::new());
    }

    // Single item - no pool needed
    if items.len() == 1 || config.max_parallelism <= 1 {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let result = mapper(item);
            if config.fail_fast {
                results.push(Ok(result?));
            } else {
                results.push(result);
            }
        }
        return Ok(results);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.max_parallelism.min(items.len()))
        .build()
        .map_err(|e| Error::ThreadPool(format!("failed to create thread pool: {}", e)))?;

    pool.install(|| {
        if config.fail_fast {
            items
                .into_par_iter()
                .map(&mapper)
                .collect::<Result<Vec<R>>>()
                .map(|values| values.into_iter().map(Ok).collect())
        } else {
            Ok(items.into_par_iter().map(&mapper).collect())
        }
    })
}
