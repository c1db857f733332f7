// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt::{Debug, Formatter};
use std::num::NonZeroUsize;

use crossbeam_channel::{Receiver, Sender};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::task::TaskPriority;

/// A type-erased unit of work handed to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The substrate which runs [`Task`](crate::Task)s.
pub trait Executor: Send + Sync {
    /// Schedules `job` without blocking the caller.
    fn execute(&self, priority: TaskPriority, job: Job);
}

/// Options for a [`ThreadPoolExecutor`].
#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    /// How many worker threads to start.
    ///
    /// If `None`, rayon picks a value based on the available parallelism.
    pub num_threads: Option<NonZeroUsize>,
}

/// Runs jobs on a dedicated rayon thread pool.
///
/// Every worker drains two queues and always prefers high priority jobs over low
/// priority ones. Dropping the executor lets the workers finish whatever is still queued
/// and then shut down.
pub struct ThreadPoolExecutor {
    high: Sender<Job>,
    low: Sender<Job>,
    num_threads: usize,
    // Declared last so that the queues above disconnect before the pool is dropped.
    _thread_pool: ThreadPool,
}

impl Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("num_threads", &self.num_threads)
            .finish_non_exhaustive()
    }
}

impl ThreadPoolExecutor {
    /// Starts the worker threads.
    ///
    /// # Errors
    ///
    /// Returns the rayon error if the pool could not be created.
    pub fn new(options: ExecutorOptions) -> Result<Self, rayon::ThreadPoolBuildError> {
        let mut builder = ThreadPoolBuilder::new()
            .thread_name(|index| format!("vello-prep-worker-{index}"));
        if let Some(num_threads) = options.num_threads {
            builder = builder.num_threads(num_threads.get());
        }
        let thread_pool = builder.build()?;
        let num_threads = thread_pool.current_num_threads();
        let (high_sender, high_receiver) = crossbeam_channel::unbounded();
        let (low_sender, low_receiver) = crossbeam_channel::unbounded();

        log::debug!("Starting deferred resource worker pool with {num_threads} threads");
        thread_pool.spawn_broadcast(move |_| run_worker(&high_receiver, &low_receiver));

        Ok(Self {
            high: high_sender,
            low: low_sender,
            num_threads,
            _thread_pool: thread_pool,
        })
    }

    /// Number of worker threads in the pool.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, priority: TaskPriority, job: Job) {
        let sender = match priority {
            TaskPriority::High => &self.high,
            TaskPriority::Low => &self.low,
        };
        if let Err(err) = sender.send(job) {
            // Only possible once every worker is gone; don't leave the task queued.
            log::warn!("Worker pool is gone, running job on the calling thread");
            (err.into_inner())();
        }
    }
}

fn run_worker(high: &Receiver<Job>, low: &Receiver<Job>) {
    loop {
        if let Ok(job) = high.try_recv() {
            job();
            continue;
        }
        let job = crossbeam_channel::select! {
            recv(high) -> job => job,
            recv(low) -> job => job,
        };
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
    // One queue disconnected; the other may still hold work which waiters depend on.
    for job in high.try_iter().chain(low.try_iter()) {
        job();
    }
}

/// Runs every job synchronously on the calling thread.
///
/// This is the single threaded fallback, and makes the whole pipeline deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, _priority: TaskPriority, job: Job) {
        job();
    }
}
