//! Strict-FIFO sequential processing.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use tracing::error;

const QUEUE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::queue");

/// What to do when the wrapped callback returns an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Log the error at error level and keep consuming.
    #[default]
    Log,
    /// Log the error and terminate the process with exit code 1.
    Abort,
}

struct Shared<T> {
    queue: Mutex<QueueState<T>>,
    work_ready: Condvar,
    cancelled: AtomicBool,
}

struct QueueState<T> {
    pending: VecDeque<T>,
    busy: bool,
}

/// Handle over a callback that processes invocations one at a time.
///
/// Every [`push`](SequentialQueue::push) enqueues its argument; a single
/// consumer thread applies the callback in strict FIFO order, never
/// overlapping two invocations.
pub struct SequentialQueue<T> {
    shared: Arc<Shared<T>>,
    worker: Option<thread::JoinHandle<()>>,
}

/// Wraps `callback` so invocations are serialised through a queue.
///
/// Equivalent to [`SequentialQueue::with_policy`] using the default
/// log-and-continue error policy.
pub fn consequentially<T, E, F>(callback: F) -> SequentialQueue<T>
where
    T: Send + 'static,
    E: Display,
    F: FnMut(T) -> Result<(), E> + Send + 'static,
{
    SequentialQueue::with_policy(callback, ErrorPolicy::default())
}

impl<T> SequentialQueue<T>
where
    T: Send + 'static,
{
    /// Builds the queue with an explicit error policy.
    #[must_use]
    pub fn with_policy<E, F>(mut callback: F, policy: ErrorPolicy) -> Self
    where
        E: Display,
        F: FnMut(T) -> Result<(), E> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                pending: VecDeque::new(),
                busy: false,
            }),
            work_ready: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || {
            loop {
                let item = {
                    let mut state = worker_shared
                        .queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    loop {
                        if worker_shared.cancelled.load(Ordering::SeqCst) {
                            return;
                        }
                        if let Some(item) = state.pending.pop_front() {
                            state.busy = true;
                            break item;
                        }
                        state = worker_shared
                            .work_ready
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                };

                let outcome = callback(item);
                {
                    let mut state = worker_shared
                        .queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    state.busy = false;
                }
                if let Err(cause) = outcome {
                    error!(
                        target: QUEUE_TARGET,
                        error = %cause,
                        "sequential callback failed"
                    );
                    if policy == ErrorPolicy::Abort {
                        std::process::exit(1);
                    }
                }
            }
        });

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Enqueues one invocation.
    ///
    /// Items pushed after [`cancel`](SequentialQueue::cancel) are dropped.
    pub fn push(&self, item: T) {
        if self.shared.cancelled.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.pending.push_back(item);
        }
        self.shared.work_ready.notify_one();
    }

    /// Number of invocations waiting plus the one currently running.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        let state = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.pending.len() + usize::from(state.busy)
    }

    /// Stops the consumer; pending invocations are discarded.
    ///
    /// The invocation currently in flight runs to completion.
    pub fn cancel(&mut self) {
        {
            // Flip the flag under the lock so a consumer about to wait
            // cannot miss the wakeup.
            let _state = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.shared.cancelled.store(true, Ordering::SeqCst);
        }
        self.shared.work_ready.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl<T> Drop for SequentialQueue<T> {
    fn drop(&mut self) {
        {
            // Flip the flag under the lock so a consumer about to wait
            // cannot miss the wakeup.
            let _state = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.shared.cancelled.store(true, Ordering::SeqCst);
        }
        self.shared.work_ready.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn invocations_run_in_push_order() {
        let (sender, receiver) = mpsc::channel();
        let queue = consequentially(move |n: u32| {
            sender.send(n).map_err(|error| error.to_string())
        });

        for n in 0..20 {
            queue.push(n);
        }

        let seen: Vec<u32> = (0..20).map(|_| receiver.recv().expect("item")).collect();
        assert_eq!(seen, (0..20).collect::<Vec<u32>>());
    }

    #[test]
    fn invocations_never_overlap() {
        let overlap = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(false));
        let (overlap_probe, running_probe) = (Arc::clone(&overlap), Arc::clone(&running));
        let (sender, receiver) = mpsc::channel();

        let queue = consequentially(move |n: u32| {
            if running_probe.swap(true, Ordering::SeqCst) {
                overlap_probe.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(10));
            running_probe.store(false, Ordering::SeqCst);
            sender.send(n).map_err(|error| error.to_string())
        });

        for n in 0..5 {
            queue.push(n);
        }
        for _ in 0..5 {
            receiver.recv().expect("item");
        }

        assert!(!overlap.load(Ordering::SeqCst));
    }

    #[test]
    fn callback_errors_do_not_stop_consumption() {
        let (sender, receiver) = mpsc::channel();
        let queue = consequentially(move |n: u32| {
            if n == 1 {
                return Err("callback failure".to_string());
            }
            sender.send(n).map_err(|error| error.to_string())
        });

        queue.push(0);
        queue.push(1);
        queue.push(2);

        assert_eq!(receiver.recv().expect("item"), 0);
        assert_eq!(receiver.recv().expect("item"), 2);
    }

    #[test]
    fn cancel_discards_pending_items() {
        let (sender, receiver) = mpsc::channel();
        let mut queue = consequentially(move |n: u32| -> Result<(), Infallible> {
            thread::sleep(Duration::from_millis(30));
            let _ = sender.send(n);
            Ok(())
        });

        for n in 0..10 {
            queue.push(n);
        }
        // Let the first item start before cancelling the rest.
        thread::sleep(Duration::from_millis(10));
        queue.cancel();

        let mut delivered = 0;
        while receiver.recv_timeout(Duration::from_millis(100)).is_ok() {
            delivered += 1;
        }
        assert!(delivered < 10, "cancel should discard pending items");
        queue.push(99);
        assert_eq!(queue.queue_length(), 0);
    }

    #[test]
    fn queue_length_reflects_pending_work() {
        let queue = consequentially(move |_n: u32| -> Result<(), Infallible> {
            thread::sleep(Duration::from_millis(50));
            Ok(())
        });

        for n in 0..5 {
            queue.push(n);
        }
        assert!(queue.queue_length() >= 4);
    }
}
