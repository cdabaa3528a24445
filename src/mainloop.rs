//! Render-thread main context
//!
//! Producer threads hand work to the render thread with `invoke`; periodic
//! work (progress tick, buffering query) is registered with `add_timeout`.
//! The render thread drives everything by calling `iteration`.
//!
//! A context created with `with_manual_clock` only advances time when
//! `advance` is called, which keeps timeout-driven code deterministic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

/// Whether a timeout callback stays installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    Continue,
    Break,
}

/// Identifies an installed timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

type Task = Box<dyn FnOnce() + Send>;
type TimeoutFn = Box<dyn FnMut() -> ControlFlow + Send>;

struct TimeoutSource {
    id: SourceId,
    interval: Duration,
    deadline: Duration,
    /// None while the callback is being dispatched
    callback: Option<TimeoutFn>,
}

struct Inner {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
    timeouts: Mutex<Vec<TimeoutSource>>,
    next_id: AtomicU64,
    start: Instant,
    manual_time: Option<Mutex<Duration>>,
}

/// Handle to the render-thread main context. Cheap to clone.
#[derive(Clone)]
pub struct MainContext {
    inner: Arc<Inner>,
}

impl Default for MainContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MainContext {
    /// Create a context driven by the system clock
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a context whose clock only moves on `advance`
    pub fn with_manual_clock() -> Self {
        Self::build(Some(Mutex::new(Duration::ZERO)))
    }

    fn build(manual_time: Option<Mutex<Duration>>) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            inner: Arc::new(Inner {
                sender,
                receiver,
                timeouts: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                start: Instant::now(),
                manual_time,
            }),
        }
    }

    /// Time elapsed since the context was created
    pub fn now(&self) -> Duration {
        match &self.inner.manual_time {
            Some(t) => *t.lock(),
            None => self.inner.start.elapsed(),
        }
    }

    /// Move a manual clock forward. Ignored for system-clock contexts.
    pub fn advance(&self, by: Duration) {
        match &self.inner.manual_time {
            Some(t) => *t.lock() += by,
            None => tracing::warn!("advance() called on a system-clock main context"),
        }
    }

    /// Queue a task for the render thread. Callable from any thread.
    pub fn invoke<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // The receiver lives as long as `inner`, so the send cannot fail.
        let _ = self.inner.sender.send(Box::new(task));
    }

    /// Install a periodic callback
    pub fn add_timeout<F>(&self, interval: Duration, callback: F) -> SourceId
    where
        F: FnMut() -> ControlFlow + Send + 'static,
    {
        let id = SourceId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let deadline = self.now() + interval;
        self.inner.timeouts.lock().push(TimeoutSource {
            id,
            interval,
            deadline,
            callback: Some(Box::new(callback)),
        });
        id
    }

    /// Remove a timeout. Safe to call from inside the timeout itself.
    pub fn remove(&self, id: SourceId) -> bool {
        let mut timeouts = self.inner.timeouts.lock();
        let before = timeouts.len();
        timeouts.retain(|t| t.id != id);
        timeouts.len() != before
    }

    pub fn has_source(&self, id: SourceId) -> bool {
        self.inner.timeouts.lock().iter().any(|t| t.id == id)
    }

    /// Number of queued tasks not yet dispatched
    pub fn pending_tasks(&self) -> usize {
        self.inner.receiver.len()
    }

    /// Run one iteration: queued tasks, then due timeouts.
    ///
    /// With `may_block` the call waits for the next task or timeout when
    /// nothing is ready. Returns true if anything was dispatched.
    pub fn iteration(&self, may_block: bool) -> bool {
        let mut dispatched = self.dispatch_tasks() + self.dispatch_timeouts();

        if dispatched == 0 && may_block {
            let wait = self.next_deadline_in().unwrap_or(Duration::from_millis(10));
            match self.inner.receiver.recv_timeout(wait) {
                Ok(task) => {
                    task();
                    dispatched += 1;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
            dispatched += self.dispatch_tasks() + self.dispatch_timeouts();
        }

        dispatched > 0
    }

    /// Iterate without blocking until nothing is left to dispatch
    pub fn run_pending(&self) -> usize {
        let mut rounds = 0;
        while self.iteration(false) {
            rounds += 1;
            if rounds >= 10_000 {
                tracing::warn!("main context still busy after {} rounds", rounds);
                break;
            }
        }
        rounds
    }

    fn dispatch_tasks(&self) -> usize {
        // Bound by the queue length at entry so self-requeueing tasks cannot spin here.
        let budget = self.inner.receiver.len();
        let mut count = 0;
        while count < budget {
            match self.inner.receiver.try_recv() {
                Ok(task) => {
                    task();
                    count += 1;
                }
                Err(_) => break,
            }
        }
        count
    }

    fn dispatch_timeouts(&self) -> usize {
        let now = self.now();
        let due: Vec<(SourceId, TimeoutFn)> = {
            let mut timeouts = self.inner.timeouts.lock();
            timeouts
                .iter_mut()
                .filter(|t| t.deadline <= now)
                .filter_map(|t| t.callback.take().map(|cb| (t.id, cb)))
                .collect()
        };

        let count = due.len();
        for (id, mut callback) in due {
            let flow = callback();
            let mut timeouts = self.inner.timeouts.lock();
            if let Some(pos) = timeouts.iter().position(|t| t.id == id) {
                match flow {
                    ControlFlow::Continue => {
                        let source = &mut timeouts[pos];
                        source.callback = Some(callback);
                        source.deadline = now + source.interval;
                    }
                    ControlFlow::Break => {
                        timeouts.remove(pos);
                    }
                }
            }
        }
        count
    }

    fn next_deadline_in(&self) -> Option<Duration> {
        let now = self.now();
        self.inner
            .timeouts
            .lock()
            .iter()
            .map(|t| t.deadline.saturating_sub(now))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_invoke_runs_on_iteration() {
        let ctx = MainContext::with_manual_clock();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        ctx.invoke(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(ctx.iteration(false));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!ctx.iteration(false));
    }

    #[test]
    fn test_invoke_from_other_thread() {
        let ctx = MainContext::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let remote = ctx.clone();
        let h = Arc::clone(&hits);
        std::thread::spawn(move || {
            remote.invoke(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        })
        .join()
        .unwrap();
        ctx.run_pending();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_fires_when_due() {
        let ctx = MainContext::with_manual_clock();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = ctx.add_timeout(Duration::from_millis(250), move || {
            h.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue
        });

        ctx.advance(Duration::from_millis(100));
        ctx.run_pending();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        ctx.advance(Duration::from_millis(150));
        ctx.run_pending();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        ctx.advance(Duration::from_millis(250));
        ctx.run_pending();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(ctx.has_source(id));
    }

    #[test]
    fn test_timeout_break_removes_source() {
        let ctx = MainContext::with_manual_clock();
        let id = ctx.add_timeout(Duration::from_millis(10), || ControlFlow::Break);
        ctx.advance(Duration::from_millis(10));
        ctx.run_pending();
        assert!(!ctx.has_source(id));
    }

    #[test]
    fn test_timeout_can_remove_itself() {
        let ctx = MainContext::with_manual_clock();
        let slot: Arc<Mutex<Option<SourceId>>> = Arc::new(Mutex::new(None));
        let inner_ctx = ctx.clone();
        let inner_slot = Arc::clone(&slot);
        let id = ctx.add_timeout(Duration::from_millis(10), move || {
            if let Some(id) = *inner_slot.lock() {
                inner_ctx.remove(id);
            }
            ControlFlow::Continue
        });
        *slot.lock() = Some(id);
        ctx.advance(Duration::from_millis(10));
        ctx.run_pending();
        assert!(!ctx.has_source(id));
    }
}
