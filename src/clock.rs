// File: ./src/clock.rs
//! Wall-clock and timer capabilities.
//!
//! The engine never calls `Local::now()` or sleeps directly; it goes through
//! the `Clock` and `Timer` traits so tests can substitute a virtual clock
//! that advances deterministically and delivers callbacks in deadline order.

use chrono::{DateTime, Local};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Invoked when a timer fires. Produced once, awaited on the runtime.
pub type TimerCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// One-shot timer registration.
pub trait Timer: Send + Sync {
    /// Arm a timer firing `callback` at `at`. The returned handle cancels it.
    fn arm_at(&self, at: DateTime<Local>, callback: TimerCallback) -> CancelHandle;
}

struct CancelInner {
    cancelled: AtomicBool,
    abort: Mutex<Option<tokio::task::AbortHandle>>,
}

/// Cancel handle for an armed timer. Cancel is idempotent; cancelling a
/// fired or already-cancelled timer is a no-op.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                abort: Mutex::new(None),
            }),
        }
    }

    fn attach_abort(&self, handle: tokio::task::AbortHandle) {
        *self.inner.abort.lock().unwrap() = Some(handle);
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst)
            && let Some(handle) = self.inner.abort.lock().unwrap().take()
        {
            handle.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Production timer: one tokio task per registration, sleeping until the
/// deadline computed against the supplied clock.
pub struct TokioTimer {
    clock: Arc<dyn Clock>,
}

impl TokioTimer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl Timer for TokioTimer {
    fn arm_at(&self, at: DateTime<Local>, callback: TimerCallback) -> CancelHandle {
        let handle = CancelHandle::new();
        let flag = handle.clone();
        let delay = (at - self.clock.now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Checked after the sleep so a cancel that raced the deadline
            // still suppresses the callback.
            if !flag.is_cancelled() {
                callback().await;
            }
        });
        handle.attach_abort(task.abort_handle());
        handle
    }
}

// --- Test double ---

struct VirtualEntry {
    seq: u64,
    deadline: DateTime<Local>,
    handle: CancelHandle,
    callback: Option<TimerCallback>,
}

struct VirtualInner {
    now: DateTime<Local>,
    next_seq: u64,
    entries: Vec<VirtualEntry>,
}

/// Deterministic clock + timer for tests.
///
/// `advance_to` moves time forward, firing due callbacks one at a time in
/// `(deadline, registration order)` order and awaiting each before the next.
/// Callbacks may arm new timers; anything falling inside the window fires in
/// the same pass.
#[derive(Clone)]
pub struct VirtualClock {
    inner: Arc<Mutex<VirtualInner>>,
}

impl VirtualClock {
    pub fn new(start: DateTime<Local>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VirtualInner {
                now: start,
                next_seq: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Number of armed, not-yet-cancelled timers.
    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|e| !e.handle.is_cancelled())
            .count()
    }

    pub async fn advance(&self, duration: chrono::Duration) {
        let target = self.inner.lock().unwrap().now + duration;
        self.advance_to(target).await;
    }

    pub async fn advance_to(&self, target: DateTime<Local>) {
        loop {
            let due = {
                let mut inner = self.inner.lock().unwrap();
                inner.entries.retain(|e| !e.handle.is_cancelled());

                let next = inner
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.deadline <= target)
                    .min_by_key(|(_, e)| (e.deadline, e.seq))
                    .map(|(i, _)| i);

                match next {
                    Some(i) => {
                        let mut entry = inner.entries.remove(i);
                        if entry.deadline > inner.now {
                            inner.now = entry.deadline;
                        }
                        entry.callback.take()
                    }
                    None => None,
                }
            };

            match due {
                Some(callback) => callback().await,
                None => break,
            }
        }

        let mut inner = self.inner.lock().unwrap();
        if target > inner.now {
            inner.now = target;
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Local> {
        self.inner.lock().unwrap().now
    }
}

impl Timer for VirtualClock {
    fn arm_at(&self, at: DateTime<Local>, callback: TimerCallback) -> CancelHandle {
        let handle = CancelHandle::new();
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.push(VirtualEntry {
            seq,
            deadline: at,
            handle: handle.clone(),
            callback: Some(callback),
        });
        handle
    }
}
