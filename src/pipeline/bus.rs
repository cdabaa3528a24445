//! Pipeline message bus
//!
//! Messages may be posted from any thread. They are queued and delivered
//! to the watchers on the render thread, in posting order, by a single
//! coalesced main-context dispatch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{BufferingMode, State};
use crate::error::MediaError;
use crate::mainloop::MainContext;
use crate::signal::{HandlerId, Signal};

/// Who posted a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSource {
    /// The top-level pipeline
    Pipeline,
    /// A child element, by name
    Element(String),
}

/// Preview image posted by a camera after a still capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewSample {
    /// Packed RGB rows, possibly padded
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Element-specific messages
#[derive(Debug, Clone, PartialEq)]
pub enum ElementMessage {
    PreviewImage(PreviewSample),
    ImageDone { filename: String },
    VideoDone,
}

#[derive(Debug, Clone)]
pub enum BusMessage {
    Error {
        source: MessageSource,
        error: MediaError,
        debug: Option<String>,
    },
    Eos,
    Buffering {
        percent: i32,
        mode: BufferingMode,
    },
    DurationChanged,
    StateChanged {
        source: MessageSource,
        old: State,
        new: State,
        pending: State,
    },
    AsyncDone,
    Element {
        source: MessageSource,
        message: ElementMessage,
    },
}

struct BusInner {
    ctx: MainContext,
    queue: Mutex<VecDeque<BusMessage>>,
    scheduled: AtomicBool,
    watchers: Signal<BusMessage>,
}

/// Cheap to clone; clones share one queue
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(ctx: &MainContext) -> Self {
        Self {
            inner: Arc::new(BusInner {
                ctx: ctx.clone(),
                queue: Mutex::new(VecDeque::new()),
                scheduled: AtomicBool::new(false),
                watchers: Signal::new(),
            }),
        }
    }

    /// Queue a message for the render thread. Callable from any thread.
    pub fn post(&self, message: BusMessage) {
        tracing::trace!(?message, "bus post");
        self.inner.queue.lock().push_back(message);
        if !self.inner.scheduled.swap(true, Ordering::SeqCst) {
            let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
            self.inner.ctx.invoke(move || {
                if let Some(inner) = weak.upgrade() {
                    Bus { inner }.drain();
                }
            });
        }
    }

    /// Deliver every queued message to the watchers
    fn drain(&self) {
        self.inner.scheduled.store(false, Ordering::SeqCst);
        loop {
            let next = self.inner.queue.lock().pop_front();
            match next {
                Some(message) => self.inner.watchers.emit(&message),
                None => break,
            }
        }
    }

    pub fn add_watch<F>(&self, watch: F) -> HandlerId
    where
        F: Fn(&BusMessage) + Send + Sync + 'static,
    {
        self.inner.watchers.connect(watch)
    }

    pub fn remove_watch(&self, id: HandlerId) -> bool {
        self.inner.watchers.disconnect(id)
    }

    /// Messages posted but not yet delivered
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn main_context(&self) -> &MainContext {
        &self.inner.ctx
    }
}
