//! Execution contexts for deferred work.
//!
//! Every proxy belongs to one [`Scheduler`]. Work that must not run inline (signal delivery,
//! deferred relay bookkeeping, reply callbacks) is posted to it and runs on a later turn.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
    time::Instant,
};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A cooperative execution context that runs posted [`Task`]s in order.
pub trait Scheduler: Send + Sync {
    /// Queues `task` to run on this context after the current work completes.
    fn post(&self, task: Task);

    /// Returns `true` if the calling thread is the one executing this context.
    fn is_current(&self) -> bool;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A thread-confined FIFO mailbox.
///
/// A [`WorkQueue`] belongs to the thread that created it. Any thread may [`post`] to it, but
/// tasks only run when the owning thread calls [`WorkQueue::run_pending`] or
/// [`WorkQueue::run_until`].
///
/// [`post`]: Scheduler::post
pub struct WorkQueue {
    owner: ThreadId,
    tasks: Mutex<VecDeque<Task>>,
    posted: Condvar,
}

impl WorkQueue {
    /// Creates a queue owned by the calling thread.
    pub fn new() -> Self {
        Self {
            owner: thread::current().id(),
            tasks: Mutex::new(VecDeque::new()),
            posted: Condvar::new(),
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Returns the number of tasks waiting to run.
    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop(&self) -> Option<Task> {
        lock(&self.tasks).pop_front()
    }

    /// Runs queued tasks until the queue is empty, including tasks posted while doing so.
    ///
    /// Returns the number of tasks that ran.
    pub fn run_pending(&self) -> usize {
        debug_assert!(self.is_current(), "work queue run from a foreign thread");

        let mut ran = 0;
        // The lock must not be held while a task runs, since tasks may post more work.
        while let Some(task) = self.pop() {
            task();
            ran += 1;
        }
        ran
    }

    /// Runs tasks as they are posted until `done` returns `true` or `deadline` passes.
    ///
    /// `done` is checked before every task. Returns the final result of `done`.
    pub fn run_until(&self, mut done: impl FnMut() -> bool, deadline: Option<Instant>) -> bool {
        debug_assert!(self.is_current(), "work queue run from a foreign thread");

        loop {
            if done() {
                return true;
            }

            let mut tasks = lock(&self.tasks);
            while tasks.is_empty() {
                match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            drop(tasks);
                            return done();
                        }
                        tasks = self
                            .posted
                            .wait_timeout(tasks, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                    None => {
                        tasks = self
                            .posted
                            .wait(tasks)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
            let task = tasks.pop_front();
            drop(tasks);

            if let Some(task) = task {
                task();
            }
        }
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for WorkQueue {
    fn post(&self, task: Task) {
        lock(&self.tasks).push_back(task);
        self.posted.notify_one();
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.owner
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("owner", &self.owner)
            .field("queued", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::*;

    #[test]
    fn fifo() {
        let queue = Arc::new(WorkQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            queue.post(Box::new(move || log.lock().unwrap().push(i)));
        }
        assert_eq!(queue.len(), 3);
        assert!(log.lock().unwrap().is_empty());

        assert_eq!(queue.run_pending(), 3);
        assert_eq!(*log.lock().unwrap(), [0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn tasks_may_post_tasks() {
        let queue = Arc::new(WorkQueue::new());
        let count = Arc::new(AtomicUsize::new(0));

        let q = queue.clone();
        let c = count.clone();
        queue.post(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            let c = c.clone();
            q.post(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        assert_eq!(queue.run_pending(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn foreign_threads_post() {
        let queue = Arc::new(WorkQueue::new());
        assert!(queue.is_current());

        let q = queue.clone();
        let flag = Arc::new(AtomicUsize::new(0));
        let f = flag.clone();
        thread::spawn(move || {
            assert!(!q.is_current());
            q.post(Box::new(move || {
                f.store(1, Ordering::SeqCst);
            }));
        });

        let done = queue.run_until(
            || flag.load(Ordering::SeqCst) == 1,
            Some(Instant::now() + Duration::from_secs(10)),
        );
        assert!(done);
    }

    #[test]
    fn deadline() {
        let queue = WorkQueue::new();
        let start = Instant::now();
        let done = queue.run_until(|| false, Some(start + Duration::from_millis(20)));
        assert!(!done);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
