//! Time source and one-shot timers.
//!
//! Timer callbacks run outside of any lock held by the clock, so they are
//! free to schedule further timers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::runtime::Handle;
use tokio::task::AbortHandle;

pub type TimerCallback = Box<dyn FnOnce() + Send>;

pub trait Clock: Send + Sync {
    /// Milliseconds since the clock's epoch.
    fn now_ms(&self) -> u64;

    /// Run `callback` once after `delay` unless cancelled first.
    fn schedule_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;
}

/// Cancels a scheduled timer. Dropping the handle does not cancel it.
#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }
}

struct PendingTimer {
    due: Duration,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    callback: TimerCallback,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_seq: u64,
    timers: Vec<PendingTimer>,
}

/// Virtual clock advanced explicitly. Timers fire in due order from
/// [`ManualClock::advance`].
#[derive(Default)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move time forward by `by`, firing every timer that falls due.
    pub fn advance(&self, by: Duration) {
        let target = self.lock().now + by;
        while let Some(callback) = self.pop_due(target) {
            callback();
        }
        self.lock().now = target;
    }

    /// Live timers not yet fired or cancelled.
    pub fn pending_timers(&self) -> usize {
        self.lock()
            .timers
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }

    fn pop_due(&self, target: Duration) -> Option<TimerCallback> {
        let mut state = self.lock();
        state.timers.retain(|t| !t.cancelled.load(Ordering::SeqCst));
        let idx = state
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.due <= target)
            .min_by_key(|(_, t)| (t.due, t.seq))
            .map(|(idx, _)| idx)?;
        let timer = state.timers.swap_remove(idx);
        state.now = timer.due;
        Some(timer.callback)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.lock().now.as_millis() as u64
    }

    fn schedule_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let due = state.now + delay;
        state.timers.push(PendingTimer {
            due,
            seq,
            cancelled: cancelled.clone(),
            callback,
        });
        TimerHandle {
            cancelled,
            abort: None,
        }
    }
}

/// Wall-clock timers on a tokio runtime.
pub struct TokioClock {
    runtime: Handle,
}

impl TokioClock {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Clock bound to the runtime of the calling task, if any.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }

    fn schedule_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                // callbacks take blocking locks
                let _ = tokio::task::spawn_blocking(callback).await;
            }
        });
        TimerHandle {
            cancelled,
            abort: Some(task.abort_handle()),
        }
    }
}
