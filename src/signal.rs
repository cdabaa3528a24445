//! Handler registries used for every observable event in the crate
//!
//! A `Signal<A, R>` holds a list of handlers taking `&A` and returning `R`.
//! Emission snapshots the list first, so a handler may connect or
//! disconnect handlers (including itself) while being invoked.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Identifies a connected handler; unique across all signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<A, R> = Arc<dyn Fn(&A) -> R + Send + Sync>;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

pub struct Signal<A, R = ()> {
    handlers: Mutex<Vec<(HandlerId, Handler<A, R>)>>,
}

impl<A, R> Default for Signal<A, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, R> Signal<A, R> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Connect a handler, returning an id for `disconnect`
    pub fn connect<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&A) -> R + Send + Sync + 'static,
    {
        let id = HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Disconnect a handler. Returns false if it was not connected.
    pub fn disconnect(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    pub fn disconnect_all(&self) {
        self.handlers.lock().clear();
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    fn snapshot(&self) -> Vec<Handler<A, R>> {
        self.handlers.lock().iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    /// Invoke every handler in connection order
    pub fn emit(&self, args: &A) {
        for handler in self.snapshot() {
            handler(args);
        }
    }

    /// Invoke only the first connected handler and return its value
    pub fn emit_first(&self, args: &A) -> Option<R> {
        let first = self.handlers.lock().first().map(|(_, h)| Arc::clone(h));
        first.map(|handler| handler(args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_all_handlers() {
        let signal: Signal<u32> = Signal::new();
        let total = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let total = Arc::clone(&total);
            signal.connect(move |v| {
                total.fetch_add(*v as usize, Ordering::SeqCst);
            });
        }
        signal.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_disconnect() {
        let signal: Signal<()> = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = signal.connect(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(signal.disconnect(id));
        assert!(!signal.disconnect(id));
        signal.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_first_handler_wins() {
        let signal: Signal<i32, bool> = Signal::new();
        assert_eq!(signal.emit_first(&1), None);
        signal.connect(|v| *v > 0);
        signal.connect(|_| false);
        assert_eq!(signal.emit_first(&1), Some(true));
    }

    #[test]
    fn test_reentrant_connect_during_emit() {
        let signal: Arc<Signal<()>> = Arc::new(Signal::new());
        let inner = Arc::clone(&signal);
        signal.connect(move |_| {
            inner.connect(|_| {});
        });
        signal.emit(&());
        assert_eq!(signal.handler_count(), 2);
    }

    #[test]
    fn test_ids_from_other_signals_do_not_disconnect() {
        let a: Signal<()> = Signal::new();
        let b: Signal<()> = Signal::new();
        let id_a = a.connect(|_| {});
        let id_b = b.connect(|_| {});
        assert_ne!(id_a, id_b);
        assert!(!b.disconnect(id_a));
        assert_eq!(b.handler_count(), 1);
    }
}
