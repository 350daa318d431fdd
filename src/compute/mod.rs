//! Data-parallel execution backends.
//!
//! Every build pass is a kernel launched over an index range. Kernels only
//! communicate through atomics in shared buffers, so the same pass runs on a
//! rayon pool or in a plain loop. A dispatch returns once every invocation
//! has finished, which makes the writes of one pass visible to the next.

mod buffer;

pub use buffer::{ensure_len, AtomicBuffer};
use rayon::prelude::*;

use crate::error::BuildError;

/// An executor for data-parallel kernels.
pub trait ComputeBackend: Send + Sync {
    /// Short name for log lines.
    fn name(&self) -> &'static str;

    /// Number of workers kernels are spread across.
    fn parallelism(&self) -> usize;

    /// Run `kernel(i)` once for every `i` in `0..threads`, in unspecified
    /// order.
    fn dispatch<F>(&self, threads: usize, kernel: F)
    where
        F: Fn(usize) + Sync + Send;

    /// Run `kernel(i, &mut out[i])` once per element. Each invocation owns
    /// its element exclusively.
    fn dispatch_mut<T, F>(&self, out: &mut [T], kernel: F)
    where
        T: Send,
        F: Fn(usize, &mut T) + Sync + Send;

    /// Map every task in `0..tasks` and fold the results with `merge`,
    /// starting from `identity()`.
    fn map_reduce<T, I, M, R>(
        &self,
        tasks: usize,
        identity: I,
        map: M,
        merge: R,
    ) -> T
    where
        T: Send,
        I: Fn() -> T + Sync + Send,
        M: Fn(usize) -> T + Sync + Send,
        R: Fn(T, T) -> T + Sync + Send;
}

/// Backend running kernels on a dedicated rayon thread pool.
pub struct RayonBackend {
    pool: rayon::ThreadPool,
}

impl RayonBackend {
    /// Pool with `threads` workers (0 = one per core).
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::ThreadSpawn`] if rayon cannot build the pool.
    pub fn new(threads: usize) -> Result<Self, BuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("atomgrid-compute-{i}"))
            .build()
            .map_err(|e| BuildError::ThreadSpawn(std::io::Error::other(e)))?;
        log::debug!(
            "compute pool started with {} threads",
            pool.current_num_threads()
        );
        Ok(Self { pool })
    }
}

impl ComputeBackend for RayonBackend {
    fn name(&self) -> &'static str {
        "rayon"
    }

    fn parallelism(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn dispatch<F>(&self, threads: usize, kernel: F)
    where
        F: Fn(usize) + Sync + Send,
    {
        if threads == 0 {
            return;
        }
        self.pool
            .install(|| (0..threads).into_par_iter().for_each(kernel));
    }

    fn dispatch_mut<T, F>(&self, out: &mut [T], kernel: F)
    where
        T: Send,
        F: Fn(usize, &mut T) + Sync + Send,
    {
        self.pool.install(|| {
            out.par_iter_mut()
                .enumerate()
                .for_each(|(i, item)| kernel(i, item));
        });
    }

    fn map_reduce<T, I, M, R>(
        &self,
        tasks: usize,
        identity: I,
        map: M,
        merge: R,
    ) -> T
    where
        T: Send,
        I: Fn() -> T + Sync + Send,
        M: Fn(usize) -> T + Sync + Send,
        R: Fn(T, T) -> T + Sync + Send,
    {
        self.pool.install(|| {
            (0..tasks).into_par_iter().map(map).reduce(identity, merge)
        })
    }
}

/// Backend running every kernel in index order on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialBackend;

impl ComputeBackend for SerialBackend {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn parallelism(&self) -> usize {
        1
    }

    fn dispatch<F>(&self, threads: usize, kernel: F)
    where
        F: Fn(usize) + Sync + Send,
    {
        (0..threads).for_each(kernel);
    }

    fn dispatch_mut<T, F>(&self, out: &mut [T], kernel: F)
    where
        T: Send,
        F: Fn(usize, &mut T) + Sync + Send,
    {
        for (i, item) in out.iter_mut().enumerate() {
            kernel(i, item);
        }
    }

    fn map_reduce<T, I, M, R>(
        &self,
        tasks: usize,
        identity: I,
        map: M,
        merge: R,
    ) -> T
    where
        T: Send,
        I: Fn() -> T + Sync + Send,
        M: Fn(usize) -> T + Sync + Send,
        R: Fn(T, T) -> T + Sync + Send,
    {
        (0..tasks).map(map).fold(identity(), merge)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn sums_indices<B: ComputeBackend>(backend: &B) {
        let total = AtomicU32::new(0);
        backend.dispatch(100, |i| {
            let _ = total.fetch_add(i as u32, Ordering::Relaxed);
        });
        assert_eq!(total.load(Ordering::Relaxed), 4950);

        let mut out = vec![0_u32; 10];
        backend.dispatch_mut(&mut out, |i, v| *v = i as u32 * 2);
        assert_eq!(out[9], 18);

        let sum = backend.map_reduce(10, || 0_u64, |i| i as u64, |a, b| a + b);
        assert_eq!(sum, 45);
        assert_eq!(backend.map_reduce(0, || 7_u64, |_| 1, |a, b| a + b), 7);
    }

    #[test]
    fn serial_backend_runs_every_index() {
        sums_indices(&SerialBackend);
    }

    #[test]
    fn rayon_backend_runs_every_index() {
        let backend = RayonBackend::new(2).unwrap();
        assert_eq!(backend.parallelism(), 2);
        sums_indices(&backend);
    }

    #[test]
    fn empty_dispatch_is_a_no_op() {
        let backend = RayonBackend::new(1).unwrap();
        backend.dispatch(0, |_| panic!("kernel must not run"));
    }
}
