//! Timer facility and cooperative sleeps.

use std::cmp;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ignore_result::Ignore;
use log::trace;

use crate::wait::WaitCell;
use crate::{coroutine, runtime};

/// Granularity of timed and cancelable retry loops. Deadline overshoot and
/// cancellation latency are bounded by roughly this slice.
pub const POLL_SLICE: Duration = Duration::from_millis(1);

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    cell: Arc<WaitCell<()>>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the earliest deadline surfaces on the heap top.
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        other.deadline.cmp(&self.deadline).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    queue: BinaryHeap<TimerEntry>,
    seq: u64,
    stopped: bool,
}

pub(crate) struct TimerShared {
    state: Mutex<TimerState>,
    signal: Condvar,
}

impl TimerShared {
    /// Arms a deadline delivering into `cell` once it is due.
    pub fn register(&self, deadline: Instant, cell: Arc<WaitCell<()>>) {
        let mut state = self.state.lock().unwrap();
        state.seq += 1;
        let seq = state.seq;
        let preempts = state.queue.peek().map_or(true, |earliest| deadline < earliest.deadline);
        state.queue.push(TimerEntry { deadline, seq, cell });
        drop(state);
        if preempts {
            self.signal.notify_one();
        }
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        drop(state);
        self.signal.notify_one();
    }
}

fn fire(entries: Vec<TimerEntry>) {
    for entry in entries {
        if let Ok(Some(handle)) = entry.cell.deliver(()) {
            handle.wake();
        }
    }
}

fn run(shared: Arc<TimerShared>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.stopped {
            let pending: Vec<TimerEntry> = state.queue.drain().collect();
            drop(state);
            trace!("timer stopped with {} pending deadlines", pending.len());
            // Release every sleeper so shutdown never hangs on a timer.
            fire(pending);
            return;
        }
        let now = Instant::now();
        let mut due = Vec::new();
        while state.queue.peek().map_or(false, |entry| entry.deadline <= now) {
            due.push(state.queue.pop().unwrap());
        }
        if !due.is_empty() {
            drop(state);
            fire(due);
            state = shared.state.lock().unwrap();
            continue;
        }
        let timeout = state.queue.peek().map(|entry| entry.deadline.duration_since(now));
        state = match timeout {
            Some(timeout) => shared.signal.wait_timeout(state, timeout).unwrap().0,
            None => shared.signal.wait(state).unwrap(),
        };
    }
}

pub(crate) struct Timer {
    shared: Arc<TimerShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Timer {
    pub fn start() -> Timer {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState { queue: BinaryHeap::new(), seq: 0, stopped: false }),
            signal: Condvar::new(),
        });
        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("spindle-timer".to_string())
                .spawn(move || run(shared))
                .expect("fail to spawn timer thread")
        };
        Timer { shared, thread: Some(thread) }
    }

    pub fn shared(&self) -> Arc<TimerShared> {
        self.shared.clone()
    }

    pub fn stop(mut self) {
        self.shared.stop();
        if let Some(thread) = self.thread.take() {
            thread.join().ignore();
        }
    }
}

/// Sleeps for given duration.
///
/// A zero duration yields the calling coroutine without sleeping. Inside a
/// runtime the coroutine parks on the timer, a plain thread falls back to
/// [thread::sleep].
pub fn sleep(timeout: Duration) {
    if timeout.is_zero() {
        if coroutine::try_current().is_some() {
            coroutine::yield_now();
        }
        return;
    }
    match runtime::try_timer() {
        Some(timer) => {
            let cell = Arc::new(WaitCell::new());
            timer.register(Instant::now() + timeout, cell.clone());
            cell.wait();
        },
        None => thread::sleep(timeout),
    }
}
