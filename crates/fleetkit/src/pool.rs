//! Bounded per-node worker pool.

use rayon::prelude::*;

/// Default cap on concurrent per-node workers.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Pool size for `items` workers capped at `max`.
pub fn pool_size(items: usize, max: usize) -> usize {
    items.min(max).max(1)
}

/// Map `f` over `items` on a pool of at most `max` threads, preserving order.
///
/// Falls back to sequential execution if the pool cannot be built.
pub fn map_bounded<T, R, F>(items: &[T], max: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    let threads = pool_size(items.len(), max);
    if threads == 1 {
        return items.iter().map(&f).collect();
    }

    match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
        Ok(pool) => pool.install(|| items.par_iter().map(&f).collect()),
        Err(e) => {
            log::warn!("Failed to create thread pool ({e}); running sequentially");
            items.iter().map(&f).collect()
        }
    }
}
