//! Single-winner wakeup cells shared by channels, timers and select.

use std::cell::UnsafeCell;
use std::hint;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use crate::coroutine::{self, Coroutine};

const EMPTY: u8 = 0;
const WAITING: u8 = 1;
const LOCKED: u8 = 2;
const DELIVERED: u8 = 3;
const CLAIMED: u8 = 4;

/// Handle to resume a blocked party, either a coroutine or an OS thread.
pub(crate) enum ReadyHandle {
    Coroutine(Arc<Coroutine>),
    Thread(Thread),
}

impl ReadyHandle {
    pub fn current() -> ReadyHandle {
        match coroutine::try_current_handle() {
            Some(co) => ReadyHandle::Coroutine(co),
            None => ReadyHandle::Thread(thread::current()),
        }
    }

    pub fn wake(self) {
        match self {
            ReadyHandle::Coroutine(co) => co.unpark(),
            ReadyHandle::Thread(thread) => thread.unpark(),
        }
    }
}

/// Buffer of wakeups accumulated under a lock and issued after its release.
///
/// Waking a coroutine pushes it to scheduler queues. Deferring that until
/// locks are released keeps lock scopes small and orders free of each other.
#[derive(Default)]
pub struct WakeList {
    handles: Vec<ReadyHandle>,
}

impl WakeList {
    pub fn new() -> WakeList {
        WakeList { handles: Vec::new() }
    }

    pub(crate) fn push(&mut self, handle: ReadyHandle) {
        self.handles.push(handle);
    }

    /// Issues all buffered wakeups. Callers must not hold any channel lock.
    pub fn flush(&mut self) {
        for handle in self.handles.drain(..) {
            handle.wake();
        }
    }
}

impl Drop for WakeList {
    fn drop(&mut self) {
        self.flush();
    }
}

/// One-shot rendezvous cell between one waiter and possibly many deliverers.
///
/// The first successful [WaitCell::deliver] wins; all later attempts get
/// their value back. This compare-and-swap is what makes a multi-channel
/// select commit to exactly one clause.
pub(crate) struct WaitCell<T> {
    state: AtomicU8,
    value: UnsafeCell<Option<T>>,
    waiter: UnsafeCell<Option<ReadyHandle>>,
}

unsafe impl<T: Send> Send for WaitCell<T> {}
unsafe impl<T: Send> Sync for WaitCell<T> {}

impl<T> WaitCell<T> {
    pub fn new() -> WaitCell<T> {
        WaitCell { state: AtomicU8::new(EMPTY), value: UnsafeCell::new(None), waiter: UnsafeCell::new(None) }
    }

    /// Delivers a value if no value was delivered before.
    ///
    /// Returns the registered waiter, if any, which the caller must wake
    /// once it is safe to do so. Returns the value back on a lost race.
    pub fn deliver(&self, value: T) -> Result<Option<ReadyHandle>, T> {
        loop {
            let current = self.state.load(Ordering::Acquire);
            match current {
                EMPTY | WAITING => {
                    if self
                        .state
                        .compare_exchange(current, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                        .is_err()
                    {
                        continue;
                    }
                    unsafe { *self.value.get() = Some(value) };
                    let waiter = if current == WAITING { unsafe { (*self.waiter.get()).take() } } else { None };
                    self.state.store(DELIVERED, Ordering::Release);
                    return Ok(waiter);
                },
                LOCKED => hint::spin_loop(),
                _ => return Err(value),
            }
        }
    }

    /// Returns true once a value has been delivered.
    pub fn is_delivered(&self) -> bool {
        self.state.load(Ordering::Acquire) == DELIVERED
    }

    /// Claims the delivered value without blocking.
    pub fn try_take(&self) -> Option<T> {
        if self
            .state
            .compare_exchange(DELIVERED, CLAIMED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        unsafe { (*self.value.get()).take() }
    }

    /// Blocks the calling coroutine or thread until a value is delivered.
    pub fn wait(&self) -> T {
        loop {
            match self.state.load(Ordering::Acquire) {
                DELIVERED => {
                    self.state.store(CLAIMED, Ordering::Relaxed);
                    return unsafe { (*self.value.get()).take() }.expect("wait cell delivered no value");
                },
                EMPTY => {
                    if self
                        .state
                        .compare_exchange(EMPTY, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        unsafe { *self.waiter.get() = Some(ReadyHandle::current()) };
                        self.state.store(WAITING, Ordering::Release);
                    }
                },
                WAITING => park(),
                LOCKED => hint::spin_loop(),
                _ => unreachable!("wait cell claimed twice"),
            }
        }
    }
}

fn park() {
    match coroutine::try_current() {
        Some(_) => coroutine::park(),
        None => thread::park(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn deliver_then_take() {
        let cell = WaitCell::new();
        assert!(!cell.is_delivered());
        assert_eq!(cell.deliver(5).unwrap().is_none(), true);
        assert!(cell.is_delivered());
        assert_eq!(cell.try_take(), Some(5));
        assert_eq!(cell.try_take(), None);
    }

    #[test]
    fn deliver_single_winner() {
        let cell = WaitCell::new();
        assert!(cell.deliver(1).is_ok());
        assert_eq!(cell.deliver(2).err(), Some(2));
        assert_eq!(cell.try_take(), Some(1));
    }

    #[test]
    fn wait_from_thread() {
        let cell = Arc::new(WaitCell::new());
        let deliverer = {
            let cell = cell.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                if let Ok(Some(handle)) = cell.deliver(7) {
                    handle.wake();
                }
            })
        };
        assert_eq!(cell.wait(), 7);
        deliverer.join().unwrap();
    }

    #[test]
    fn wait_after_delivery() {
        let cell = WaitCell::new();
        cell.deliver("ready").map_err(|_| ()).unwrap();
        assert_eq!(cell.wait(), "ready");
    }

    #[test]
    fn contended_delivery() {
        for _ in 0..64 {
            let cell = Arc::new(WaitCell::new());
            let racers: Vec<_> = (0..4)
                .map(|i| {
                    let cell = cell.clone();
                    thread::spawn(move || cell.deliver(i).is_ok())
                })
                .collect();
            let wins = racers.into_iter().map(|r| r.join().unwrap()).filter(|&won| won).count();
            assert_eq!(wins, 1);
            assert!(cell.try_take().is_some());
        }
    }
}
