//! Bounded-concurrency worker pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use thiserror::Error;

struct Job<T, R> {
    item: T,
    result: mpsc::Sender<R>,
}

struct Shared<T, R> {
    queue: Mutex<VecDeque<Job<T, R>>>,
    work_ready: Condvar,
    idle: Condvar,
    in_flight: AtomicUsize,
    shutdown: AtomicBool,
}

impl<T, R> Shared<T, R> {
    fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Guard that releases one in-flight slot, even when the handler panics.
struct FlightGuard<'a, T, R> {
    shared: &'a Shared<T, R>,
}

impl<T, R> Drop for FlightGuard<'_, T, R> {
    fn drop(&mut self) {
        // Decrement under the queue lock so a flusher checking the condition
        // cannot miss the wakeup.
        let _queue = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.shared.idle.notify_all();
    }
}

/// Handle to a result that has not been produced yet.
pub struct PendingResult<R> {
    receiver: mpsc::Receiver<R>,
}

impl<R> PendingResult<R> {
    /// Blocks until the handler has processed the queued item.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Abandoned`] when the pool was dropped (or its
    /// worker died) before producing the result.
    pub fn wait(self) -> Result<R, QueueError> {
        self.receiver.recv().map_err(|_| QueueError::Abandoned)
    }
}

/// Errors surfaced by pool consumers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The pool shut down before the queued item was processed.
    #[error("pool abandoned the queued item")]
    Abandoned,
}

/// Runs a handler over queued items with bounded concurrency.
///
/// At most `parallel_count` handler invocations are in flight at any moment,
/// and items begin processing in strict enqueue order.
pub struct ParallelPool<T, R> {
    shared: Arc<Shared<T, R>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl<T, R> ParallelPool<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Spawns the pool with its fixed complement of workers.
    #[must_use]
    pub fn new<F>(handler: F, parallel_count: usize) -> Self
    where
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            in_flight: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });
        let handler = Arc::new(handler);

        let workers = (0..parallel_count.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                let handler = Arc::clone(&handler);
                thread::spawn(move || run_worker(&shared, handler.as_ref()))
            })
            .collect();

        Self { shared, workers }
    }

    /// Enqueues one item; its position in the queue is its start order.
    pub fn queue(&self, item: T) -> PendingResult<R> {
        let (sender, receiver) = mpsc::channel();
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            queue.push_back(Job {
                item,
                result: sender,
            });
        }
        self.shared.work_ready.notify_one();
        PendingResult { receiver }
    }

    /// Enqueues a batch of items, preserving their order.
    pub fn queue_list(&self, items: impl IntoIterator<Item = T>) -> Vec<PendingResult<R>> {
        items.into_iter().map(|item| self.queue(item)).collect()
    }

    /// Number of items waiting plus items currently being processed.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        self.shared.pending() + self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Blocks until every queued and in-flight item has completed.
    ///
    /// Items whose handler produced an error value count as completed; flush
    /// itself never fails.
    pub fn flush(&self) {
        let mut queue = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !queue.is_empty() || self.shared.in_flight.load(Ordering::SeqCst) > 0 {
            queue = self
                .shared
                .idle
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl<T, R> Drop for ParallelPool<T, R> {
    fn drop(&mut self) {
        {
            // Flip the flag under the lock so a worker about to wait cannot
            // miss the wakeup.
            let _queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.shared.shutdown.store(true, Ordering::SeqCst);
        }
        self.shared.work_ready.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn run_worker<T, R, F>(shared: &Shared<T, R>, handler: &F)
where
    F: Fn(T) -> R,
{
    loop {
        let job = {
            let mut queue = shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(job) = queue.pop_front() {
                    // Claim the flight slot before releasing the lock so
                    // queue_length never undercounts.
                    shared.in_flight.fetch_add(1, Ordering::SeqCst);
                    break job;
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                queue = shared
                    .work_ready
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let guard = FlightGuard { shared };
        let result = handler(job.item);
        // The receiver may have been dropped; completion still counts.
        let _ = job.result.send(result);
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn results_arrive_for_every_item() {
        let pool = ParallelPool::new(|n: u64| n * 2, 4);
        let pending = pool.queue_list(0..8);
        let results: Vec<u64> = pending
            .into_iter()
            .map(|handle| handle.wait().expect("result"))
            .collect();
        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn concurrency_never_exceeds_parallel_count() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (active_probe, peak_probe) = (Arc::clone(&active), Arc::clone(&peak));

        let pool = ParallelPool::new(
            move |_item: usize| {
                let now = active_probe.fetch_add(1, Ordering::SeqCst) + 1;
                peak_probe.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                active_probe.fetch_sub(1, Ordering::SeqCst);
            },
            3,
        );

        pool.queue_list(0..10);
        pool.flush();

        assert!(peak.load(Ordering::SeqCst) <= 3, "peak was {}", peak.load(Ordering::SeqCst));
    }

    #[test]
    fn flush_waits_for_queued_and_in_flight_work() {
        let pool = ParallelPool::new(
            |_item: usize| thread::sleep(Duration::from_millis(100)),
            3,
        );
        let start = Instant::now();
        pool.queue_list(0..10);
        pool.flush();
        let elapsed = start.elapsed();

        // 10 items over 3 workers is 4 rounds of ~100ms.
        assert!(elapsed >= Duration::from_millis(350), "flushed after {elapsed:?}");
        assert_eq!(pool.queue_length(), 0);
    }

    #[test]
    fn flush_completes_even_when_handler_errors() {
        let pool = ParallelPool::new(
            |item: usize| {
                if item % 2 == 0 {
                    Err("even item".to_string())
                } else {
                    Ok(item)
                }
            },
            2,
        );
        pool.queue_list(0..6);
        pool.flush();
        assert_eq!(pool.queue_length(), 0);
    }

    #[test]
    fn queue_length_counts_pending_and_in_flight() {
        let pool = ParallelPool::new(
            |_item: usize| thread::sleep(Duration::from_millis(100)),
            1,
        );
        pool.queue_list(0..5);
        thread::sleep(Duration::from_millis(30));
        let length = pool.queue_length();
        assert!(length >= 4, "length was {length}");
        pool.flush();
    }

    #[test]
    fn dropped_pool_abandons_unclaimed_results() {
        let pool = ParallelPool::new(|n: u32| n, 1);
        let handle = pool.queue(7);
        drop(pool);
        // The item either completed before shutdown or was abandoned.
        match handle.wait() {
            Ok(value) => assert_eq!(value, 7),
            Err(error) => assert_eq!(error, QueueError::Abandoned),
        }
    }
}
