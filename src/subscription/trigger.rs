//! Debounced execution of a subscription's re-query.

use super::timer::{TimerKey, TimerPool};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Default)]
struct TriggerState {
    scheduled: Option<TimerKey>,
    /// A run is executing on a worker.
    running: bool,
    /// Triggered while running; run again once the current run ends.
    rerun: bool,
    cancelled: bool,
}

struct TriggerInner {
    delay: Duration,
    timers: Arc<TimerPool>,
    target: Box<dyn Fn() + Send + Sync>,
    is_live: Box<dyn Fn() -> bool + Send + Sync>,
    state: Mutex<TriggerState>,
}

impl TriggerInner {
    fn fire(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            // Cleared before running so a trigger during the run is kept
            // as a rerun instead of being absorbed.
            state.scheduled = None;
            state.running = true;
            state.rerun = false;
        }

        if (self.is_live)() && catch_unwind(AssertUnwindSafe(|| (self.target)())).is_err() {
            tracing::error!("debounced target panicked");
        }

        let mut state = self.state.lock();
        state.running = false;
        if state.rerun && !state.cancelled {
            state.rerun = false;
            self.schedule(&mut state);
        }
    }

    fn schedule(self: &Arc<Self>, state: &mut TriggerState) {
        let weak: Weak<TriggerInner> = Arc::downgrade(self);
        let scheduled = self.timers.schedule(self.delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.fire();
            }
        });
        match scheduled {
            Ok(key) => state.scheduled = Some(key),
            Err(e) => tracing::warn!(error = %e, "cannot schedule debounced run"),
        }
    }
}

/// Runs a target at most once per delay window, always after the latest
/// trigger.
///
/// Runs happen on the shared timer pool, never on the triggering thread, and
/// never overlap: a trigger arriving during a run schedules one more run
/// after it. Triggers arriving while a run is scheduled are absorbed by that
/// run. The target re-reads everything newer than its own cursor, so nothing
/// is lost. Clones share the same schedule.
#[derive(Clone)]
pub struct DebouncedTrigger {
    inner: Arc<TriggerInner>,
}

impl DebouncedTrigger {
    pub fn new<T, L>(delay: Duration, timers: Arc<TimerPool>, target: T, is_live: L) -> Self
    where
        T: Fn() + Send + Sync + 'static,
        L: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(TriggerInner {
                delay,
                timers,
                target: Box::new(target),
                is_live: Box::new(is_live),
                state: Mutex::new(TriggerState::default()),
            }),
        }
    }

    /// Request a run. Only posts work; never runs the target itself.
    pub fn trigger(&self) {
        let mut state = self.inner.state.lock();
        if state.cancelled || state.scheduled.is_some() || !(self.inner.is_live)() {
            return;
        }
        if state.running {
            state.rerun = true;
            return;
        }
        self.inner.schedule(&mut state);
    }

    /// Stop all future runs and release the pending timer. A run already
    /// handed to a worker may still execute once.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.cancelled = true;
        state.rerun = false;
        if let Some(key) = state.scheduled.take() {
            self.inner.timers.cancel(&key);
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.state.lock().scheduled.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }
}

impl fmt::Debug for DebouncedTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebouncedTrigger")
            .field("delay", &self.inner.delay)
            .field("scheduled", &self.is_scheduled())
            .field("running", &self.is_running())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    fn counting(
        delay: Duration,
        timers: &Arc<TimerPool>,
        live: Arc<AtomicBool>,
    ) -> (DebouncedTrigger, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let trigger = DebouncedTrigger::new(
            delay,
            Arc::clone(timers),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            move || live.load(Ordering::SeqCst),
        );
        (trigger, runs)
    }

    #[test]
    fn test_burst_collapses_into_one_run() {
        let timers = Arc::new(TimerPool::new(2).unwrap());
        let fired_at = Arc::new(PlMutex::new(None));
        let at = Arc::clone(&fired_at);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let trigger = DebouncedTrigger::new(
            Duration::from_millis(100),
            Arc::clone(&timers),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                *at.lock() = Some(Instant::now());
            },
            || true,
        );

        let start = Instant::now();
        for _ in 0..100 {
            trigger.trigger();
        }
        assert!(trigger.is_scheduled());

        thread::sleep(Duration::from_millis(400));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let fired = fired_at.lock().unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(100));
        assert!(!trigger.is_scheduled());
    }

    #[test]
    fn test_trigger_after_run_schedules_again() {
        let timers = Arc::new(TimerPool::new(1).unwrap());
        let (trigger, runs) = counting(
            Duration::from_millis(20),
            &timers,
            Arc::new(AtomicBool::new(true)),
        );

        trigger.trigger();
        thread::sleep(Duration::from_millis(150));
        trigger.trigger();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_not_live_never_runs() {
        let timers = Arc::new(TimerPool::new(1).unwrap());
        let live = Arc::new(AtomicBool::new(false));
        let (delayed, delayed_runs) = counting(Duration::from_millis(10), &timers, Arc::clone(&live));
        let (immediate, immediate_runs) = counting(Duration::ZERO, &timers, live);

        delayed.trigger();
        immediate.trigger();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(delayed_runs.load(Ordering::SeqCst), 0);
        assert_eq!(immediate_runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_liveness_checked_when_firing() {
        let timers = Arc::new(TimerPool::new(1).unwrap());
        let live = Arc::new(AtomicBool::new(true));
        let (trigger, runs) = counting(Duration::from_millis(50), &timers, Arc::clone(&live));

        trigger.trigger();
        live.store(false, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_releases_timer() {
        let timers = Arc::new(TimerPool::new(1).unwrap());
        let (trigger, runs) = counting(
            Duration::from_millis(50),
            &timers,
            Arc::new(AtomicBool::new(true)),
        );

        trigger.trigger();
        assert_eq!(timers.pending(), 1);
        trigger.cancel();
        assert_eq!(timers.pending(), 0);

        trigger.trigger();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(trigger.is_cancelled());
    }

    #[test]
    fn test_zero_delay_runs_on_a_worker() {
        let timers = Arc::new(TimerPool::new(1).unwrap());
        let (tx, rx) = crossbeam_channel::unbounded();
        let trigger = DebouncedTrigger::new(
            Duration::ZERO,
            Arc::clone(&timers),
            move || {
                tx.send(thread::current().id()).unwrap();
            },
            || true,
        );

        trigger.trigger();
        let ran_on = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_ne!(ran_on, thread::current().id());
    }

    #[test]
    fn test_trigger_during_run_reruns_once_after_it() {
        let timers = Arc::new(TimerPool::new(2).unwrap());
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
        let (started_tx, started_rx) = crossbeam_channel::unbounded();
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));

        let (a, o) = (Arc::clone(&active), Arc::clone(&overlapped));
        let trigger = DebouncedTrigger::new(
            Duration::ZERO,
            Arc::clone(&timers),
            move || {
                if a.fetch_add(1, Ordering::SeqCst) > 0 {
                    o.store(true, Ordering::SeqCst);
                }
                started_tx.send(()).unwrap();
                let _ = release_rx.recv_timeout(Duration::from_secs(2));
                a.fetch_sub(1, Ordering::SeqCst);
            },
            || true,
        );

        trigger.trigger();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(trigger.is_running());

        // Absorbed into a single rerun; no second concurrent run.
        for _ in 0..10 {
            trigger.trigger();
        }
        assert!(started_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(timers.pending(), 0);

        release_tx.send(()).unwrap();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        release_tx.send(()).unwrap();
        assert!(started_rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_target_does_not_wedge_trigger() {
        let timers = Arc::new(TimerPool::new(1).unwrap());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let trigger = DebouncedTrigger::new(
            Duration::ZERO,
            Arc::clone(&timers),
            move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            },
            || true,
        );

        trigger.trigger();
        thread::sleep(Duration::from_millis(100));
        assert!(!trigger.is_running());
        trigger.trigger();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
