//! Hierarchical cancellation tokens.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use static_assertions::assert_impl_all;

use crate::time::{self, POLL_SLICE};

struct Inner {
    triggered: AtomicBool,
    children: Mutex<Vec<Weak<Inner>>>,
}

/// Cancellation token forming a tree.
///
/// Triggering a token cancels it and every descendant. Clones share the same
/// token, [CancelToken::child] derives a new one below it.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

assert_impl_all!(CancelToken: Send, Sync);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken { inner: Arc::new(Inner { triggered: AtomicBool::new(false), children: Mutex::new(Vec::new()) }) }
    }

    /// Derives a child token canceled along with this one.
    ///
    /// A child derived from an already triggered parent starts triggered,
    /// there is no window where it could report otherwise.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let mut children = self.inner.children.lock().unwrap();
        children.retain(|c| c.strong_count() > 0);
        children.push(Arc::downgrade(&child.inner));
        drop(children);
        if self.is_set() {
            child.trigger();
        }
        child
    }

    /// Triggers this token and its descendants. Idempotent, only the first
    /// call broadcasts.
    pub fn trigger(&self) {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        let children = std::mem::take(&mut *self.inner.children.lock().unwrap());
        for child in children {
            if let Some(inner) = child.upgrade() {
                CancelToken { inner }.trigger();
            }
        }
    }

    /// Returns true once this token has been triggered. Lock free.
    pub fn is_set(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// Waits until this token triggers or the timeout elapses. Returns true
    /// when triggered. `None` waits without bound.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if self.is_set() {
                return true;
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => return false,
                _ => time::sleep(POLL_SLICE),
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}
