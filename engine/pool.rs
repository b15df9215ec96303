//! A small task pool for embarrassingly parallel, index-addressed work.
//!
//! Workers on a dedicated rayon pool pull the next task index from a shared
//! counter and send `(index, value)` pairs back over a channel. Results are
//! returned sorted by index, so the output never depends on how many workers
//! ran or which one finished first. An optional deadline stops workers from
//! starting further tasks; tasks already running are allowed to finish.

use crossbeam_channel::unbounded;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to build the worker thread pool: {0}")]
    Build(#[from] ThreadPoolBuildError),
}

/// Everything a pool run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolRun<T> {
    /// Finished tasks as `(index, value)`, ascending by index.
    pub results: Vec<(usize, T)>,
    /// Number of tasks requested.
    pub requested: usize,
    /// True when the deadline passed before every task had been started.
    pub timed_out: bool,
}

impl<T> PoolRun<T> {
    pub fn completed(&self) -> usize {
        self.results.len()
    }

    pub fn abandoned(&self) -> usize {
        self.requested - self.results.len()
    }
}

pub struct TrialPool {
    pool: ThreadPool,
    threads: usize,
}

impl TrialPool {
    /// A pool with exactly `threads` workers (at least one).
    pub fn new(threads: usize) -> Result<Self, PoolError> {
        let threads = threads.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("parcor-worker-{i}"))
            .build()?;
        Ok(Self { pool, threads })
    }

    /// A pool sized to the machine's logical CPUs.
    pub fn with_available_parallelism() -> Result<Self, PoolError> {
        Self::new(num_cpus::get())
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runs `task(i)` for every `i` in `0..count`.
    pub fn run_indexed<T, F>(&self, count: usize, deadline: Option<Instant>, task: F) -> PoolRun<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync,
    {
        let next = AtomicUsize::new(0);
        let expired = AtomicBool::new(false);
        let (sender, receiver) = unbounded::<(usize, T)>();
        let workers = self.threads.min(count.max(1));

        self.pool.scope(|scope| {
            for worker in 0..workers {
                let sender = sender.clone();
                let next = &next;
                let expired = &expired;
                let task = &task;
                scope.spawn(move |_| {
                    let mut finished = 0usize;
                    loop {
                        if deadline.is_some_and(|limit| Instant::now() >= limit) {
                            expired.store(true, Ordering::Relaxed);
                            break;
                        }
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        if index >= count {
                            break;
                        }
                        if sender.send((index, task(index))).is_err() {
                            break;
                        }
                        finished += 1;
                    }
                    log::trace!("worker {worker} finished {finished} tasks");
                });
            }
        });
        drop(sender);

        let mut results: Vec<(usize, T)> = receiver.into_iter().collect();
        results.sort_unstable_by_key(|(index, _)| *index);
        let timed_out = expired.load(Ordering::Relaxed) && results.len() < count;

        PoolRun {
            results,
            requested: count,
            timed_out,
        }
    }
}
