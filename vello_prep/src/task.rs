// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Asynchronously executed units of work.

use std::fmt::{Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::executor::Executor;

/// Lifecycle of a [`Task`].
///
/// A task starts out `Queued`, becomes `Running` once a worker picks it up and ends in
/// `Finished`, `Canceled` or `Failed`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Dispatched, but no worker has started it yet.
    Queued,
    /// A worker is executing the task.
    Running,
    /// The task ran to completion and its output is available.
    Finished,
    /// The task was canceled. Its output, if it ever produced one, was dropped.
    Canceled,
    /// The work panicked. There is no output, but waiters are released.
    Failed,
}

impl TaskStatus {
    /// Whether the task will never change state again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Canceled | Self::Failed)
    }
}

/// Scheduling hint passed to an [`Executor`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum TaskPriority {
    /// Work the current frame is waiting on.
    High,
    /// Background work, such as deferred image decoding.
    #[default]
    Low,
}

/// What a call to [`Task::cancel`] achieved.
///
/// Cancellation is cooperative: work which has already started cannot be interrupted. Dropping
/// the output of such a task is intended behavior.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CancelOutcome {
    /// The task had not started and now never will.
    CanceledBeforeStart,
    /// The task is (or was) running. It runs to completion and its output is discarded.
    Discarded,
    /// The task had already finished or failed; canceling had no effect.
    AlreadyFinished,
}

/// Anything which can be waited on as a dependency, regardless of what it produces.
pub trait TaskDependency: Send + Sync {
    /// Current status of the underlying task.
    fn status(&self) -> TaskStatus;

    /// Blocks the calling thread until the task reaches a terminal status.
    fn wait(&self);
}

impl Debug for dyn TaskDependency {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDependency")
            .field("status", &self.status())
            .finish()
    }
}

struct State<T> {
    status: TaskStatus,
    discard: bool,
    output: Option<T>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // A poisoned lock only means a waiter panicked; the state itself is always consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, work: impl FnOnce() -> T) {
        {
            let mut state = self.lock();
            if state.status != TaskStatus::Queued {
                return;
            }
            state.status = TaskStatus::Running;
        }
        // A panicking job must neither take down the worker nor leave its waiters blocked.
        let output = panic::catch_unwind(AssertUnwindSafe(work));
        let discarded = {
            let mut state = self.lock();
            match output {
                Err(_) => {
                    log::error!("Task panicked, releasing its dependents without output");
                    state.status = TaskStatus::Failed;
                    None
                }
                Ok(output) if state.discard => {
                    state.status = TaskStatus::Canceled;
                    Some(output)
                }
                Ok(output) => {
                    state.output = Some(output);
                    state.status = TaskStatus::Finished;
                    None
                }
            }
        };
        self.done.notify_all();
        // Drop a discarded output outside the lock, it may be large.
        drop(discarded);
    }
}

/// A shared handle to a unit of work producing a `T`.
///
/// Cloning a `Task` produces another handle to the same work.
pub struct Task<T> {
    shared: Arc<Shared<T>>,
}

static_assertions::assert_impl_all!(Task<Vec<u8>>: Send, Sync);

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Debug for Task<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Task<T> {
    /// Dispatches `work` on `executor` and returns a handle to it without blocking.
    pub fn spawn<F>(executor: &dyn Executor, priority: TaskPriority, work: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let task = Self::with_status(TaskStatus::Queued, None);
        let shared = Arc::clone(&task.shared);
        executor.execute(priority, Box::new(move || shared.run(work)));
        task
    }

    /// A task which has already finished with `output`.
    pub fn ready(output: T) -> Self {
        Self::with_status(TaskStatus::Finished, Some(output))
    }

    /// Type-erased handle which can be waited on by dependents.
    pub fn dependency(&self) -> Arc<dyn TaskDependency> {
        Arc::new(self.clone())
    }
}

impl<T> Task<T> {
    fn with_status(status: TaskStatus, output: Option<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    status,
                    discard: false,
                    output,
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Current status, without blocking on the work.
    pub fn status(&self) -> TaskStatus {
        self.shared.lock().status
    }

    /// Blocks the calling thread until the task reaches a terminal status.
    ///
    /// Must not be called from a worker thread of the executor running this task.
    pub fn wait(&self) {
        let state = self.shared.lock();
        let _state = self
            .shared
            .done
            .wait_while(state, |state| !state.status.is_terminal())
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Requests cancellation. See [`CancelOutcome`] for what each result means.
    ///
    /// Calling this more than once is harmless.
    pub fn cancel(&self) -> CancelOutcome {
        let outcome = {
            let mut state = self.shared.lock();
            match state.status {
                TaskStatus::Queued => {
                    state.status = TaskStatus::Canceled;
                    CancelOutcome::CanceledBeforeStart
                }
                TaskStatus::Running => {
                    state.discard = true;
                    CancelOutcome::Discarded
                }
                TaskStatus::Finished | TaskStatus::Failed => CancelOutcome::AlreadyFinished,
                TaskStatus::Canceled if state.discard => CancelOutcome::Discarded,
                TaskStatus::Canceled => CancelOutcome::CanceledBeforeStart,
            }
        };
        if outcome == CancelOutcome::CanceledBeforeStart {
            self.shared.done.notify_all();
        }
        outcome
    }

    /// Takes the output of a finished task.
    ///
    /// Returns `None` if the task hasn't finished, was canceled or failed, or the output was
    /// already taken.
    pub fn take_output(&self) -> Option<T> {
        let mut state = self.shared.lock();
        if state.status == TaskStatus::Finished {
            state.output.take()
        } else {
            None
        }
    }
}

impl<T: Send> TaskDependency for Task<T> {
    fn status(&self) -> TaskStatus {
        Self::status(self)
    }

    fn wait(&self) {
        Self::wait(self);
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{CancelOutcome, Task, TaskPriority, TaskStatus};
    use crate::executor::tests::ManualExecutor;
    use crate::executor::{ExecutorOptions, InlineExecutor, ThreadPoolExecutor};

    #[test]
    fn inline_task_finishes_immediately() {
        let task = Task::spawn(&InlineExecutor, TaskPriority::High, || 42);
        assert_eq!(task.status(), TaskStatus::Finished);
        task.wait();
        assert_eq!(task.take_output(), Some(42));
        assert_eq!(task.take_output(), None);
    }

    #[test]
    fn queued_task_is_canceled_before_start() {
        let executor = ManualExecutor::default();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = Task::spawn(&executor, TaskPriority::Low, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(task.status(), TaskStatus::Queued);
        assert_eq!(task.cancel(), CancelOutcome::CanceledBeforeStart);
        assert_eq!(task.cancel(), CancelOutcome::CanceledBeforeStart);
        executor.run_all();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(task.status(), TaskStatus::Canceled);
        // Waiting on a canceled task must not block.
        task.wait();
    }

    #[test]
    fn finished_task_ignores_cancel() {
        let task = Task::ready("done");
        assert_eq!(task.cancel(), CancelOutcome::AlreadyFinished);
        assert_eq!(task.take_output(), Some("done"));
    }

    #[test]
    fn running_task_output_is_discarded() {
        let executor = ManualExecutor::default();
        let slot: Arc<std::sync::Mutex<Option<Task<u32>>>> = Arc::default();
        let inner = slot.clone();
        let task = Task::spawn(&executor, TaskPriority::Low, move || {
            // Cancel from inside the work, while the task is observably running.
            let task = inner.lock().unwrap().clone().unwrap();
            assert_eq!(task.status(), TaskStatus::Running);
            assert_eq!(task.cancel(), CancelOutcome::Discarded);
            7
        });
        *slot.lock().unwrap() = Some(task.clone());
        executor.run_all();
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert_eq!(task.cancel(), CancelOutcome::Discarded);
        assert_eq!(task.take_output(), None);
    }

    #[test]
    fn dependency_waits_across_threads() {
        let executor = ManualExecutor::default();
        let task = Task::spawn(&executor, TaskPriority::High, || 3_u8);
        let dependency = task.dependency();
        let runner = std::thread::spawn(move || executor.run_all());
        dependency.wait();
        assert_eq!(dependency.status(), TaskStatus::Finished);
        runner.join().unwrap();
    }

    #[test]
    fn panicking_work_fails_without_killing_the_worker() {
        let executor = ThreadPoolExecutor::new(ExecutorOptions {
            num_threads: NonZeroUsize::new(1),
        })
        .unwrap();
        let broken = Task::spawn(&executor, TaskPriority::Low, || -> u32 {
            panic!("decoder bug");
        });
        broken.wait();
        assert_eq!(broken.status(), TaskStatus::Failed);
        assert_eq!(broken.take_output(), None);
        assert_eq!(broken.cancel(), CancelOutcome::AlreadyFinished);

        // The single worker survived and keeps running jobs.
        let healthy = Task::spawn(&executor, TaskPriority::Low, || 5_u32);
        healthy.wait();
        assert_eq!(healthy.take_output(), Some(5));
    }

    #[test]
    fn panicking_inline_work_releases_dependents() {
        let task = Task::spawn(&InlineExecutor, TaskPriority::High, || -> Vec<u8> {
            panic!("cell rasterizer bug");
        });
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.status().is_terminal());
        // Must return immediately instead of blocking on a task stuck in `Running`.
        task.dependency().wait();
    }
}
