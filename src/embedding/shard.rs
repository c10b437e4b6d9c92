//! Data-parallel fan-out over a worker pool

use crate::error::{Error, Result};
use std::marker::PhantomData;
use tracing::debug;

/// Below this much estimated work a batch runs on the calling thread
pub const MIN_COST_PER_SHARD: usize = 10_000;

/// Pool that splits `0..total` into ranges and runs `work` on each
///
/// # Safety
/// Implementations must call `work` on disjoint ranges that together cover
/// `0..total` exactly once, and must return only after every call finished.
/// [`shard_rows`] relies on this to hand out mutable rows without locking.
pub unsafe trait WorkerPool: Send + Sync {
    fn num_threads(&self) -> usize;

    /// Run `work(start, end)` over `0..total`; `unit_cost` estimates the cost of one item
    fn shard(&self, total: usize, unit_cost: usize, work: &(dyn Fn(usize, usize) + Sync));
}

/// Rayon-backed worker pool
pub struct RayonPool {
    pool: rayon::ThreadPool,
}

impl RayonPool {
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("evstore-worker-{}", i))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build worker pool: {}", e)))?;
        debug!(threads = pool.current_num_threads(), "Created worker pool");
        Ok(Self { pool })
    }
}

unsafe impl WorkerPool for RayonPool {
    fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn shard(&self, total: usize, unit_cost: usize, work: &(dyn Fn(usize, usize) + Sync)) {
        if total == 0 {
            return;
        }
        let threads = self.num_threads();
        if threads <= 1 || total.saturating_mul(unit_cost) < MIN_COST_PER_SHARD {
            work(0, total);
            return;
        }

        // a few blocks per thread to smooth out skew
        let block = total.div_ceil(threads * 4).max(1);
        self.pool.scope(|s| {
            for start in (0..total).step_by(block) {
                let end = (start + block).min(total);
                s.spawn(move |_| work(start, end));
            }
        });
    }
}

/// Disjoint rows of one output buffer, shareable across workers
struct SharedRows<'a, V> {
    ptr: *mut V,
    row_len: usize,
    rows: usize,
    _marker: PhantomData<&'a mut [V]>,
}

// SAFETY: rows are only handed out for disjoint indices
unsafe impl<V: Send> Send for SharedRows<'_, V> {}
unsafe impl<V: Send> Sync for SharedRows<'_, V> {}

impl<'a, V> SharedRows<'a, V> {
    fn new(out: &'a mut [V], row_len: usize) -> Self {
        let rows = if row_len == 0 { 0 } else { out.len() / row_len };
        Self {
            ptr: out.as_mut_ptr(),
            row_len,
            rows,
            _marker: PhantomData,
        }
    }

    /// # Safety
    /// No other reference to row `i` may be live.
    #[allow(clippy::mut_from_ref)]
    unsafe fn row_mut(&self, i: usize) -> &mut [V] {
        debug_assert!(i < self.rows);
        std::slice::from_raw_parts_mut(self.ptr.add(i * self.row_len), self.row_len)
    }
}

/// Shard over the rows of `out`, giving `work(i, row)` exclusive access to row `i`
pub fn shard_rows<V: Send>(
    pool: &dyn WorkerPool,
    out: &mut [V],
    row_len: usize,
    unit_cost: usize,
    work: &(dyn Fn(usize, &mut [V]) + Sync),
) {
    let rows = SharedRows::new(out, row_len);
    let total = rows.rows;
    pool.shard(total, unit_cost, &|start, end| {
        for i in start..end {
            // SAFETY: WorkerPool ranges are disjoint
            work(i, unsafe { rows.row_mut(i) });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_shard_covers_every_index_once() -> Result<()> {
        let pool = RayonPool::new(4)?;
        let hits: Vec<AtomicUsize> = (0..1000).map(|_| AtomicUsize::new(0)).collect();
        pool.shard(hits.len(), 100, &|start, end| {
            for h in &hits[start..end] {
                h.fetch_add(1, Ordering::Relaxed);
            }
        });
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
        Ok(())
    }

    #[test]
    fn test_cheap_batches_run_inline() -> Result<()> {
        let pool = RayonPool::new(4)?;
        let calls = AtomicUsize::new(0);
        pool.shard(10, 1, &|start, end| {
            assert_eq!((start, end), (0, 10));
            calls.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        Ok(())
    }

    #[test]
    fn test_shard_rows_writes_disjoint_rows() -> Result<()> {
        let pool = RayonPool::new(3)?;
        let mut out = vec![0.0f32; 500 * 4];
        shard_rows(&pool, &mut out, 4, 1000, &|i, row| {
            row.fill(i as f32);
        });
        for (i, row) in out.chunks(4).enumerate() {
            assert_eq!(row, &[i as f32; 4]);
        }
        Ok(())
    }
}
