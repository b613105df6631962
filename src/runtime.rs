//! Work stealing runtime serving spawned coroutines.

use std::cell::Cell;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use std::thread;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use ignore_result::Ignore;
use log::{debug, trace};

use crate::coroutine::stack::StackSize;
use crate::coroutine::{self, Coroutine, JoinHandle, Status};
use crate::time::{Timer, TimerShared};

thread_local! {
    static WORKER: Cell<Option<ptr::NonNull<WorkerContext>>> = const { Cell::new(None) };
}

// Producers deeper than this spill to the global injector so idle workers
// can pick work up without stealing.
const LOCAL_DEPTH_LIMIT: usize = 256;
const IDLE_PARK: Duration = Duration::from_millis(5);

pub(crate) struct Shared {
    injector: Injector<Arc<Coroutine>>,
    stealers: Vec<Stealer<Arc<Coroutine>>>,
    ready: Mutex<VecDeque<Arc<Coroutine>>>,
    sleepers: Condvar,
    idle: AtomicUsize,
    stopped: AtomicBool,
    timer: Arc<TimerShared>,
}

struct WorkerContext {
    shared: Arc<Shared>,
    local: Worker<Arc<Coroutine>>,
    slot: Cell<Option<Arc<Coroutine>>>,
    index: usize,
    rng: Cell<u64>,
}

struct WorkerScope;

impl WorkerScope {
    fn enter(context: &WorkerContext) -> WorkerScope {
        WORKER.with(|cell| {
            assert!(cell.get().is_none(), "worker context existed");
            cell.set(Some(ptr::NonNull::from(context)));
        });
        WorkerScope
    }
}

impl Drop for WorkerScope {
    fn drop(&mut self) {
        WORKER.with(|cell| {
            assert!(cell.get().is_some(), "worker context does not exist");
            cell.set(None);
        });
    }
}

fn with_worker<R>(f: impl FnOnce(&WorkerContext) -> R) -> Option<R> {
    WORKER.with(|cell| cell.get().map(|context| f(unsafe { context.as_ref() })))
}

pub(crate) fn current_shared() -> Option<Arc<Shared>> {
    with_worker(|context| context.shared.clone())
}

pub(crate) fn try_timer() -> Option<Arc<TimerShared>> {
    with_worker(|context| context.shared.timer.clone())
}

/// Hands a runnable coroutine to the scheduler, spawn and yield path.
pub(crate) fn schedule(shared: &Arc<Shared>, co: Arc<Coroutine>) {
    co.set_ready();
    if !co.mark_enqueued() {
        return;
    }
    let placed = with_worker(|context| {
        if !Arc::ptr_eq(&context.shared, shared) {
            return false;
        }
        match context.slot.take() {
            None => {
                context.slot.set(Some(co.clone()));
                true
            },
            Some(previous) => {
                context.slot.set(Some(previous));
                if context.local.len() < LOCAL_DEPTH_LIMIT {
                    context.local.push(co.clone());
                    true
                } else {
                    false
                }
            },
        }
    })
    .unwrap_or(false);
    if !placed {
        shared.injector.push(co);
        wake_one(shared);
    }
}

/// Requeues a woken coroutine, wake path. The waker may run on any thread,
/// so the coroutine goes to the shared ready queue.
pub(crate) fn ready(shared: &Arc<Shared>, co: Arc<Coroutine>) {
    if !co.mark_enqueued() {
        return;
    }
    let mut queue = shared.ready.lock().unwrap();
    queue.push_back(co);
    drop(queue);
    shared.sleepers.notify_one();
}

fn wake_one(shared: &Shared) {
    if shared.idle.load(Ordering::SeqCst) > 0 {
        shared.sleepers.notify_one();
    }
}

fn xorshift(rng: &Cell<u64>) -> u64 {
    let mut x = rng.get();
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    rng.set(x);
    x
}

fn next_task(context: &WorkerContext) -> Option<Arc<Coroutine>> {
    if let Some(co) = context.slot.take() {
        return Some(co);
    }
    if let Some(co) = context.local.pop() {
        return Some(co);
    }
    if let Some(co) = context.shared.ready.lock().unwrap().pop_front() {
        return Some(co);
    }
    loop {
        match context.shared.injector.steal_batch_and_pop(&context.local) {
            Steal::Success(co) => return Some(co),
            Steal::Empty => break,
            Steal::Retry => continue,
        }
    }
    let peers = context.shared.stealers.len();
    for _ in 0..peers {
        let victim = xorshift(&context.rng) as usize % peers;
        if victim == context.index {
            continue;
        }
        match context.shared.stealers[victim].steal() {
            Steal::Success(co) => {
                trace!("worker {} stole from worker {}", context.index, victim);
                return Some(co);
            },
            Steal::Empty | Steal::Retry => continue,
        }
    }
    None
}

fn run_one(shared: &Arc<Shared>, co: Arc<Coroutine>) {
    co.clear_enqueued();
    if !co.grab() {
        // Still switching out on another worker, retry later.
        if co.mark_enqueued() {
            shared.injector.push(co);
            wake_one(shared);
        }
        return;
    }
    let status = co.resume();
    co.release();
    if status == Status::Suspended {
        schedule(shared, co);
    }
}

fn idle_park(shared: &Shared) {
    shared.idle.fetch_add(1, Ordering::SeqCst);
    let queue = shared.ready.lock().unwrap();
    if queue.is_empty() && shared.injector.is_empty() && !shared.stopped.load(Ordering::Acquire) {
        let _unused = shared.sleepers.wait_timeout(queue, IDLE_PARK).unwrap();
    }
    shared.idle.fetch_sub(1, Ordering::SeqCst);
}

fn work(shared: Arc<Shared>, local: Worker<Arc<Coroutine>>, index: usize) {
    let context = WorkerContext {
        shared: shared.clone(),
        local,
        slot: Cell::new(None),
        index,
        rng: Cell::new(0x9e3779b97f4a7c15 ^ (index as u64 + 1)),
    };
    let _scope = WorkerScope::enter(&context);
    trace!("worker {} started", index);
    while !shared.stopped.load(Ordering::Acquire) {
        match next_task(&context) {
            Some(co) => run_one(&shared, co),
            None => idle_park(&shared),
        }
    }
    // Free local work, these coroutines will never complete.
    while let Some(co) = context.slot.take().or_else(|| context.local.pop()) {
        drop(co);
    }
    trace!("worker {} stopped", index);
}

/// Builder for [Runtime].
#[derive(Default)]
pub struct Builder {
    parallelism: Option<usize>,
}

impl Builder {
    /// Specifies the number of worker threads.
    pub fn parallelism(&mut self, n: usize) -> &mut Self {
        assert!(n > 0, "parallelism must not be zero");
        self.parallelism = Some(n);
        self
    }

    /// Constructs a [Runtime] to spawn and schedule coroutines.
    pub fn build(&mut self) -> Runtime {
        let parallelism = self
            .parallelism
            .unwrap_or_else(|| thread::available_parallelism().unwrap_or(NonZeroUsize::new(4).unwrap()).get());
        let locals: Vec<Worker<Arc<Coroutine>>> = (0..parallelism).map(|_| Worker::new_fifo()).collect();
        let stealers = locals.iter().map(|local| local.stealer()).collect();
        let timer = Timer::start();
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers,
            ready: Mutex::new(VecDeque::with_capacity(256)),
            sleepers: Condvar::new(),
            idle: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            timer: timer.shared(),
        });
        debug!("starting runtime with {} workers", parallelism);
        let threads = locals
            .into_iter()
            .enumerate()
            .map(|(index, local)| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("spindle-worker-{index}"))
                    .spawn(move || work(shared, local, index))
                    .expect("fail to spawn worker thread")
            })
            .collect();
        Runtime { shared, timer: Some(timer), threads }
    }
}

/// Runtime schedules spawned coroutines across worker threads.
///
/// [Runtime::drop] stops and joins all serving threads. Coroutines still
/// queued at that point are freed without completing and their joins
/// observe an error. A started coroutine's stack is freed without
/// unwinding, locals captured on it do not run destructors. Drain first
/// when completion matters.
pub struct Runtime {
    shared: Arc<Shared>,
    timer: Option<Timer>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Runtime {
    /// Constructs a runtime to serve spawned coroutines.
    pub fn new() -> Runtime {
        Builder::default().build()
    }

    /// Spawns a concurrent coroutine and returns a [JoinHandle] for it.
    pub fn spawn<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T,
        F: Send + 'static,
        T: Send + 'static,
    {
        coroutine::spawn_with(&self.shared, f, StackSize::default())
    }

    /// Same as [Runtime::spawn] with an explicit stack size.
    pub fn spawn_with_stack<F, T>(&self, f: F, stack_size: StackSize) -> JoinHandle<T>
    where
        F: FnOnce() -> T,
        F: Send + 'static,
        T: Send + 'static,
    {
        coroutine::spawn_with(&self.shared, f, stack_size)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        debug!("stopping runtime");
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.sleepers.notify_all();
        if let Some(timer) = self.timer.take() {
            timer.stop();
        }
        for thread in self.threads.drain(..) {
            thread.join().ignore();
        }
        loop {
            match self.shared.injector.steal() {
                Steal::Success(co) => drop(co),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        self.shared.ready.lock().unwrap().clear();
    }
}
