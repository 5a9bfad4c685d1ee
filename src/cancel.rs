//! Cooperative cancellation shared between a caller and background fetchers.
use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Cloneable cancellation context.
///
/// [`CancelToken::done`] returns a receiver that never yields a value and
/// becomes disconnected once the token is cancelled, so it can sit in a
/// `crossbeam_channel::select!` next to data channels.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(tx)),
                done: rx,
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        // Dropping the only sender disconnects every `done()` receiver.
        let mut trigger = self.inner.trigger.lock().unwrap_or_else(|e| e.into_inner());
        trigger.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
