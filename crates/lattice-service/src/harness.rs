//! Ordered child management and the periodic iteration loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::service::{Service, ServiceError, ServiceEvent};

const HARNESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::harness");

/// Behaviour of the periodic iteration loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopOptions {
    /// When false, an iteration firing while the previous one still runs is
    /// dropped (not queued).
    pub allow_parallel_iterations: bool,
    /// When true, an iteration error stops the loop and is kept for
    /// [`LoopHandle::take_failure`]; otherwise errors are logged and
    /// swallowed.
    pub throw_on_iteration_error: bool,
}

/// Handle over a running iteration loop.
pub struct LoopHandle {
    stop: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<ServiceError>>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl LoopHandle {
    /// Prevents further iterations. The iteration currently in flight, if
    /// any, runs to completion.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!(target: HARNESS_TARGET, "iteration loop thread panicked");
        }
    }

    /// Returns the error that stopped the loop, when one occurred.
    pub fn take_failure(&self) -> Option<ServiceError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A service that owns an ordered list of child services.
///
/// Children start in registration order; teardown walks them in reverse and
/// skips any child whose `done` flag is set. A failed start unwinds the
/// already-started prefix before propagating.
pub struct Harness {
    name: String,
    children: Vec<Box<dyn Service>>,
    started: usize,
    done: bool,
    loop_handle: Option<LoopHandle>,
    loop_options: LoopOptions,
}

impl Harness {
    /// Builds an empty harness.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            started: 0,
            done: false,
            loop_handle: None,
            loop_options: LoopOptions::default(),
        }
    }

    /// Sets the iteration loop behaviour.
    #[must_use]
    pub fn with_loop_options(mut self, options: LoopOptions) -> Self {
        self.loop_options = options;
        self
    }

    /// Appends a child; registration order is start order.
    pub fn register(&mut self, child: Box<dyn Service>) {
        self.children.push(child);
    }

    /// Number of registered children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether the harness has no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Marks this harness done; teardown by a parent will skip it.
    pub fn done(&mut self) {
        self.done = true;
        let event = ServiceEvent::Done {
            name: self.name.clone(),
        };
        for child in &mut self.children {
            child.on_event(&event);
        }
    }

    /// Schedules a periodic iteration body.
    ///
    /// The first iteration fires after `first_delay`, later ones every
    /// `interval`. A firing that would overlap the previous iteration is
    /// dropped unless parallel iterations are allowed. Only one loop can run
    /// at a time; starting a second loop replaces the first after stopping
    /// it.
    pub fn start_loop<F>(&mut self, first_delay: Duration, interval: Duration, body: F)
    where
        F: Fn() -> Result<(), ServiceError> + Send + Sync + 'static,
    {
        self.stop_loop();
        self.loop_handle = Some(spawn_loop(first_delay, interval, self.loop_options, body));
    }

    /// Stops the iteration loop without cancelling the iteration in flight.
    pub fn stop_loop(&mut self) {
        if let Some(mut handle) = self.loop_handle.take() {
            handle.stop();
        }
    }

    /// Returns the failure that stopped the loop, when one occurred.
    pub fn loop_failure(&self) -> Option<ServiceError> {
        self.loop_handle
            .as_ref()
            .and_then(LoopHandle::take_failure)
    }
}

impl Service for Harness {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<(), ServiceError> {
        for index in self.started..self.children.len() {
            debug!(
                target: HARNESS_TARGET,
                parent = self.name,
                child = self.children[index].name(),
                "starting child"
            );
            if let Err(cause) = self.children[index].start() {
                error!(
                    target: HARNESS_TARGET,
                    parent = self.name,
                    child = self.children[index].name(),
                    error = %cause,
                    "child failed to start, unwinding"
                );
                self.unwind_started();
                return Err(cause);
            }
            self.started = index + 1;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ServiceError> {
        self.stop_loop();
        self.unwind_started();
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn on_event(&mut self, event: &ServiceEvent) {
        for child in &mut self.children {
            child.on_event(event);
        }
    }
}

impl Harness {
    /// Stops the started prefix in reverse order, skipping done children.
    fn unwind_started(&mut self) {
        for index in (0..self.started).rev() {
            let child = &mut self.children[index];
            if child.is_done() {
                debug!(
                    target: HARNESS_TARGET,
                    parent = self.name,
                    child = child.name(),
                    "child already done, skipping stop"
                );
                continue;
            }
            if let Err(cause) = child.stop() {
                error!(
                    target: HARNESS_TARGET,
                    parent = self.name,
                    child = child.name(),
                    error = %cause,
                    "child failed to stop"
                );
            }
        }
        self.started = 0;
    }
}

/// Guard that clears the busy flag even when the iteration panics.
struct BusyGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

fn spawn_loop<F>(
    first_delay: Duration,
    interval: Duration,
    options: LoopOptions,
    body: F,
) -> LoopHandle
where
    F: Fn() -> Result<(), ServiceError> + Send + Sync + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let failure = Arc::new(Mutex::new(None));
    let stop_flag = Arc::clone(&stop);
    let failure_slot = Arc::clone(&failure);

    let thread = thread::spawn(move || {
        let body = Arc::new(body);
        let busy = Arc::new(AtomicBool::new(false));
        sleep_unless_stopped(first_delay, &stop_flag);
        while !stop_flag.load(Ordering::SeqCst) {
            let exclusive_claim = options.allow_parallel_iterations
                || busy
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok();
            if exclusive_claim {
                let body = Arc::clone(&body);
                let failure_slot = Arc::clone(&failure_slot);
                let stop_flag = Arc::clone(&stop_flag);
                let guard = (!options.allow_parallel_iterations).then(|| BusyGuard {
                    busy: Arc::clone(&busy),
                });
                let throw = options.throw_on_iteration_error;
                thread::spawn(move || {
                    let _guard = guard;
                    run_iteration(body.as_ref(), throw, &failure_slot, &stop_flag);
                });
            } else {
                debug!(
                    target: HARNESS_TARGET,
                    "previous iteration still running, dropping this one"
                );
            }
            sleep_unless_stopped(interval, &stop_flag);
        }
    });

    LoopHandle {
        stop,
        failure,
        thread: Some(thread),
    }
}

fn run_iteration<F>(
    body: &F,
    throw_on_error: bool,
    failure: &Mutex<Option<ServiceError>>,
    stop: &AtomicBool,
) where
    F: Fn() -> Result<(), ServiceError>,
{
    if let Err(cause) = body() {
        if throw_on_error {
            error!(
                target: HARNESS_TARGET,
                error = %cause,
                "iteration failed, stopping loop"
            );
            *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(cause);
            stop.store(true, Ordering::SeqCst);
        } else {
            warn!(
                target: HARNESS_TARGET,
                error = %cause,
                "iteration failed"
            );
        }
    }
}

fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) {
    let step = Duration::from_millis(10);
    let mut remaining = duration;
    while remaining > Duration::ZERO && !stop.load(Ordering::SeqCst) {
        let slice = remaining.min(step);
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct Journal {
        entries: Mutex<Vec<String>>,
    }

    impl Journal {
        fn record(&self, entry: impl Into<String>) {
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    struct Recorder {
        name: String,
        journal: Arc<Journal>,
        fail_start: bool,
        done: bool,
    }

    impl Recorder {
        fn new(name: &str, journal: Arc<Journal>) -> Box<Self> {
            Box::new(Self {
                name: name.to_string(),
                journal,
                fail_start: false,
                done: false,
            })
        }

        fn failing(name: &str, journal: Arc<Journal>) -> Box<Self> {
            Box::new(Self {
                name: name.to_string(),
                journal,
                fail_start: true,
                done: false,
            })
        }

        fn finished(name: &str, journal: Arc<Journal>) -> Box<Self> {
            Box::new(Self {
                name: name.to_string(),
                journal,
                fail_start: false,
                done: true,
            })
        }
    }

    impl Service for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn start(&mut self) -> Result<(), ServiceError> {
            if self.fail_start {
                return Err(ServiceError::startup(&self.name, "induced failure"));
            }
            self.journal.record(format!("start:{}", self.name));
            Ok(())
        }

        fn stop(&mut self) -> Result<(), ServiceError> {
            self.journal.record(format!("stop:{}", self.name));
            Ok(())
        }

        fn is_done(&self) -> bool {
            self.done
        }
    }

    #[test]
    fn starts_in_order_and_stops_in_reverse() {
        let journal = Arc::new(Journal::default());
        let mut harness = Harness::new("root");
        harness.register(Recorder::new("a", Arc::clone(&journal)));
        harness.register(Recorder::new("b", Arc::clone(&journal)));
        harness.register(Recorder::new("c", Arc::clone(&journal)));

        harness.start().expect("start");
        harness.stop().expect("stop");

        assert_eq!(
            journal.entries(),
            vec!["start:a", "start:b", "start:c", "stop:c", "stop:b", "stop:a"]
        );
    }

    #[test]
    fn failed_start_unwinds_started_prefix() {
        let journal = Arc::new(Journal::default());
        let mut harness = Harness::new("root");
        harness.register(Recorder::new("a", Arc::clone(&journal)));
        harness.register(Recorder::failing("b", Arc::clone(&journal)));
        harness.register(Recorder::new("c", Arc::clone(&journal)));

        let result = harness.start();

        assert!(result.is_err());
        assert_eq!(journal.entries(), vec!["start:a", "stop:a"]);
    }

    #[test]
    fn done_children_are_skipped_on_stop() {
        let journal = Arc::new(Journal::default());
        let mut harness = Harness::new("root");
        harness.register(Recorder::new("a", Arc::clone(&journal)));
        harness.register(Recorder::finished("b", Arc::clone(&journal)));

        harness.start().expect("start");
        harness.stop().expect("stop");

        let entries = journal.entries();
        assert!(entries.contains(&"stop:a".to_string()));
        assert!(!entries.contains(&"stop:b".to_string()));
    }

    #[test]
    fn stop_twice_does_not_stop_children_twice() {
        let journal = Arc::new(Journal::default());
        let mut harness = Harness::new("root");
        harness.register(Recorder::new("a", Arc::clone(&journal)));

        harness.start().expect("start");
        harness.stop().expect("stop");
        harness.stop().expect("second stop");

        let stops = journal
            .entries()
            .iter()
            .filter(|entry| entry.as_str() == "stop:a")
            .count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn loop_runs_iterations_at_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&counter);
        let mut harness = Harness::new("looper");
        harness.start_loop(Duration::from_millis(5), Duration::from_millis(20), move || {
            probe.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        thread::sleep(Duration::from_millis(120));
        harness.stop_loop();
        let seen = counter.load(Ordering::SeqCst);
        assert!(seen >= 3, "only {seen} iterations ran");

        // Allow any in-flight iteration to finish, then confirm the loop
        // stays stopped.
        thread::sleep(Duration::from_millis(30));
        let after = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(counter.load(Ordering::SeqCst), after, "loop kept running");
    }

    #[test]
    fn overlapping_iterations_are_dropped_by_default() {
        let counter = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&counter);
        let mut harness = Harness::new("looper");
        harness.start_loop(Duration::from_millis(1), Duration::from_millis(10), move || {
            probe.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            Ok(())
        });

        thread::sleep(Duration::from_millis(80));
        harness.stop_loop();

        // With a 100ms body and 10ms interval, overlap dropping keeps the
        // count at one (the in-flight iteration).
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn iteration_error_stops_loop_when_throwing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&counter);
        let mut harness = Harness::new("looper").with_loop_options(LoopOptions {
            allow_parallel_iterations: false,
            throw_on_iteration_error: true,
        });
        harness.start_loop(Duration::from_millis(1), Duration::from_millis(5), move || {
            probe.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::iteration("induced"))
        });

        thread::sleep(Duration::from_millis(60));
        let failure = harness.loop_failure();
        harness.stop_loop();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(matches!(failure, Some(ServiceError::Iteration { .. })));
    }

    #[test]
    fn iteration_error_is_swallowed_by_default() {
        let counter = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&counter);
        let mut harness = Harness::new("looper");
        harness.start_loop(Duration::from_millis(1), Duration::from_millis(10), move || {
            probe.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::iteration("induced"))
        });

        thread::sleep(Duration::from_millis(80));
        harness.stop_loop();

        assert!(counter.load(Ordering::SeqCst) >= 2);
    }
}
