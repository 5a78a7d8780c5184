//! Bounded fan-out/fan-in executor for analysis jobs.
//!
//! Jobs share no mutable state; each worker thread spawns and reaps its own
//! external-tool subprocess, which is where the real parallelism lives. One
//! failing job never cancels its siblings; the caller sees every per-job
//! result and decides what a failure means for the whole call.

use crate::error::{Error, Result};
use rayon::prelude::*;

pub struct WorkerPool {
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("bulksym-worker-{i}"))
            .build()
            .map_err(|e| Error::Pool(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Run every job to completion and return all results (synchronous
    /// barrier). Result order follows job order; execution order does not.
    pub fn run<J, R, F>(&self, jobs: Vec<J>, work: F) -> Vec<Result<R>>
    where
        J: Send,
        R: Send,
        F: Fn(J) -> Result<R> + Sync,
    {
        self.pool
            .install(|| jobs.into_par_iter().map(|job| work(job)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_jobs_run_despite_failures() {
        let pool = WorkerPool::new(4).unwrap();
        let results = pool.run((0..10).collect(), |n: i32| {
            if n % 3 == 0 {
                Err(Error::Pool(format!("job {n}")))
            } else {
                Ok(n * 2)
            }
        });
        assert_eq!(results.len(), 10);
        assert!(results[1].as_ref().is_ok_and(|v| *v == 2));
        assert!(results[3].is_err());
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 6);
    }

    #[test]
    fn test_single_worker_still_completes() {
        let pool = WorkerPool::new(1).unwrap();
        let results = pool.run(vec![1u64, 2, 3], Ok);
        assert!(results.iter().all(|r| r.is_ok()));
    }
}
