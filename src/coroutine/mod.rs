//! Stackful coroutines scheduled across worker threads.

mod context;
pub(crate) mod stack;

use std::cell::{Cell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use num_enum::{IntoPrimitive, UnsafeFromPrimitive};
use static_assertions::assert_impl_all;

use self::context::{Context, Entry};
use self::stack::StackSize;
use crate::error::JoinError;
use crate::runtime::{self, Shared};
use crate::wait::WaitCell;

thread_local! {
    static COROUTINE: Cell<Option<ptr::NonNull<Coroutine>>> = const { Cell::new(None) };
    static THREAD_CONTEXT: UnsafeCell<Context> = UnsafeCell::new(Context::empty());
}

pub(crate) fn try_current() -> Option<ptr::NonNull<Coroutine>> {
    COROUTINE.with(|p| p.get())
}

pub(crate) fn current() -> ptr::NonNull<Coroutine> {
    COROUTINE.with(|p| p.get()).expect("no running coroutine")
}

/// Clones a shared handle to the running coroutine.
pub(crate) fn try_current_handle() -> Option<Arc<Coroutine>> {
    try_current().map(|ptr| {
        let raw = ptr.as_ptr() as *const Coroutine;
        // SAFETY: the worker resuming this coroutine holds a strong count for
        // the whole duration of the resumption.
        unsafe {
            Arc::increment_strong_count(raw);
            Arc::from_raw(raw)
        }
    })
}

struct Scope {
    co: ptr::NonNull<Coroutine>,
}

impl Scope {
    fn enter(co: &Coroutine) -> Scope {
        COROUTINE.with(|cell| {
            assert!(cell.get().is_none(), "running coroutine not exited");
            cell.set(Some(ptr::NonNull::from(co)));
        });
        Scope { co: ptr::NonNull::from(co) }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        COROUTINE.with(|cell| {
            let co = cell.replace(None).expect("no running coroutine");
            assert!(co == self.co, "running coroutine changed");
        })
    }
}

struct ThisThread;

impl ThisThread {
    fn context<'a>() -> &'a Context {
        THREAD_CONTEXT.with(|c| unsafe { &*c.get() })
    }

    fn context_mut<'a>() -> &'a mut Context {
        THREAD_CONTEXT.with(|c| unsafe { &mut *c.get() })
    }

    fn resume(context: &Context) {
        context.switch(Self::context_mut());
    }

    fn suspend(context: &mut Context) {
        Self::context().switch(context);
    }

    fn restore() {
        Self::context().resume();
    }
}

/// Lifecycle of a coroutine.
///
/// `Suspended` means the coroutine yielded and is immediately runnable again,
/// while `Parked` means it blocks until some event hands it back to the
/// scheduler.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, IntoPrimitive, UnsafeFromPrimitive)]
pub(crate) enum Status {
    Created = 0,
    Ready = 1,
    Running = 2,
    Suspended = 3,
    Parked = 4,
    Finished = 5,
}

pub(crate) struct Coroutine {
    status: AtomicU8,
    running: AtomicBool,
    enqueued: AtomicBool,
    notified: AtomicBool,
    scheduler: Weak<Shared>,
    context: UnsafeCell<Option<Box<Context>>>,
    entry: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    stopper: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
}

// SAFETY: `context`, `entry` and `stopper` are only touched by the worker
// that won the `running` flag, during construction and in drop.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl Coroutine {
    pub fn new(
        f: Box<dyn FnOnce() + Send>,
        stopper: Box<dyn FnOnce() + Send>,
        stack_size: StackSize,
        scheduler: Weak<Shared>,
    ) -> Arc<Coroutine> {
        let co = Arc::new(Coroutine {
            status: AtomicU8::new(Status::Created.into()),
            running: AtomicBool::new(false),
            enqueued: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            scheduler,
            context: UnsafeCell::new(None),
            entry: UnsafeCell::new(Some(f)),
            stopper: UnsafeCell::new(Some(stopper)),
        });
        let entry = Entry { f: Self::main, arg: Arc::as_ptr(&co) as *mut libc::c_void, stack_size };
        unsafe { *co.context.get() = Some(Context::new(&entry)) };
        co
    }

    extern "C" fn main(arg: *mut libc::c_void) {
        let co = unsafe { &*(arg as *const Coroutine) };
        co.run();
        co.status.store(Status::Finished.into(), Ordering::SeqCst);
        ThisThread::restore();
        // The resume target is gone, there is no stack to return to.
        std::process::abort();
    }

    fn run(&self) {
        let f = unsafe { (*self.entry.get()).take() }.expect("no entry function");
        f();
    }

    fn context(&self) -> &Context {
        unsafe { (*self.context.get()).as_ref() }.expect("no coroutine context")
    }

    fn context_mut(&self) -> &mut Context {
        unsafe { (*self.context.get()).as_mut() }.expect("no coroutine context")
    }

    pub fn status(&self) -> Status {
        unsafe { Status::from_unchecked(self.status.load(Ordering::SeqCst)) }
    }

    /// Claims exclusive resumption. A loser must requeue instead of resuming.
    pub fn grab(&self) -> bool {
        self.running.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok()
    }

    pub fn release(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Flags this coroutine as reachable from a scheduler queue.
    ///
    /// Returns false if it already is, which keeps it reachable from at most
    /// one queue at a time.
    pub fn mark_enqueued(&self) -> bool {
        self.enqueued.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn clear_enqueued(&self) {
        self.enqueued.store(false, Ordering::Release);
    }

    pub fn set_ready(&self) {
        self.status.store(Status::Ready.into(), Ordering::SeqCst);
    }

    /// Resumes this coroutine on the calling thread until it switches out.
    pub fn resume(&self) -> Status {
        if self.status() == Status::Finished {
            return Status::Finished;
        }
        let _scope = Scope::enter(self);
        self.status.store(Status::Running.into(), Ordering::SeqCst);
        ThisThread::resume(self.context());
        self.status()
    }

    fn do_park(&self) {
        self.status.store(Status::Parked.into(), Ordering::SeqCst);
        if self.notified.swap(false, Ordering::SeqCst) {
            // Woken before we switched out. Revoke the park unless the waker
            // already queued us, in which case we must switch out for real.
            if self
                .status
                .compare_exchange(Status::Parked.into(), Status::Running.into(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
        ThisThread::suspend(self.context_mut());
    }

    fn do_yield(&self) {
        self.status.store(Status::Suspended.into(), Ordering::SeqCst);
        ThisThread::suspend(self.context_mut());
    }

    /// Makes a parked coroutine runnable again. Safe to call at any point in
    /// the race with its park.
    pub fn unpark(self: &Arc<Self>) {
        self.notified.store(true, Ordering::SeqCst);
        if self
            .status
            .compare_exchange(Status::Parked.into(), Status::Ready.into(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Some(shared) = self.scheduler.upgrade() {
                runtime::ready(&shared, self.clone());
            }
        }
    }
}

impl Drop for Coroutine {
    // Dropped before finishing means this coroutine will never complete,
    // runtime shutdown being the one way here. The stopper unblocks joiners.
    // Locals captured on the coroutine stack are freed without running
    // their destructors.
    fn drop(&mut self) {
        if self.status() != Status::Finished {
            if let Some(stop) = self.stopper.get_mut().take() {
                stop();
            }
        }
    }
}

/// Parks the running coroutine until some [Coroutine::unpark].
///
/// May return spuriously, callers recheck their wait condition in a loop.
pub(crate) fn park() {
    let co = unsafe { current().as_ref() };
    co.do_park();
}

/// Yields the running coroutine for the next scheduling cycle.
pub fn yield_now() {
    let co = unsafe { current().as_ref() };
    co.do_yield();
}

/// Handle to join a spawned coroutine.
pub struct JoinHandle<T> {
    cell: Arc<WaitCell<Result<T, JoinError>>>,
}

assert_impl_all!(JoinHandle<()>: Send);

impl<T> JoinHandle<T> {
    /// Waits for the coroutine to finish and takes its result.
    pub fn join(self) -> Result<T, JoinError> {
        self.cell.wait()
    }

    /// Takes the result if the coroutine already finished, hands the handle
    /// back otherwise.
    pub fn try_join(self) -> Result<Result<T, JoinError>, Self> {
        match self.cell.try_take() {
            Some(result) => Ok(result),
            None => Err(self),
        }
    }

    /// Returns true once the result is available.
    pub fn is_finished(&self) -> bool {
        self.cell.is_delivered()
    }
}

fn complete<T>(cell: &WaitCell<Result<T, JoinError>>, result: Result<T, JoinError>) {
    if let Ok(Some(handle)) = cell.deliver(result) {
        handle.wake();
    }
}

pub(crate) fn spawn_with<F, T>(shared: &Arc<Shared>, f: F, stack_size: StackSize) -> JoinHandle<T>
where
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    let cell = Arc::new(WaitCell::new());
    let main = {
        let cell = cell.clone();
        move || complete(&cell, panic::catch_unwind(AssertUnwindSafe(f)).map_err(JoinError::new))
    };
    // Fired from the coroutine's drop when it never finished, a lost
    // delivery race against normal completion is harmless.
    let stopper = {
        let cell = cell.clone();
        move || complete(&cell, Err(JoinError::stopped()))
    };
    let co = Coroutine::new(Box::new(main), Box::new(stopper), stack_size, Arc::downgrade(shared));
    runtime::schedule(shared, co);
    JoinHandle { cell }
}

/// Spawns a coroutine in the runtime the caller runs in.
///
/// Panics when called from outside a runtime worker.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    spawn_with_stack(f, StackSize::default())
}

/// Same as [spawn] with an explicit stack size.
pub fn spawn_with_stack<F, T>(f: F, stack_size: StackSize) -> JoinHandle<T>
where
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    let shared = runtime::current_shared().expect("no running runtime");
    spawn_with(&shared, f, stack_size)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use crate::channel;
    use crate::coroutine;
    use crate::runtime::Runtime;

    #[test]
    fn spawn_in_runtime() {
        let runtime = Runtime::new();
        let five = runtime.spawn(|| coroutine::spawn(|| 5).join().unwrap());
        assert_eq!(5, five.join().unwrap());
    }

    #[test]
    fn yield_interleaves() {
        let runtime = Runtime::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let observed = {
            let counter = counter.clone();
            runtime.spawn(move || {
                let bump = coroutine::spawn({
                    let counter = counter.clone();
                    move || counter.fetch_add(1, Ordering::SeqCst)
                });
                while counter.load(Ordering::SeqCst) == 0 {
                    coroutine::yield_now();
                }
                bump.join().unwrap();
                counter.load(Ordering::SeqCst)
            })
        };
        assert_eq!(1, observed.join().unwrap());
    }

    #[test]
    fn try_join_nonblocking() {
        let runtime = Runtime::new();
        let (sender, receiver) = channel::bounded(1);
        let handle = runtime.spawn(move || receiver.recv().unwrap());
        let handle = match handle.try_join() {
            Err(handle) => handle,
            Ok(result) => panic!("coroutine finished early: {result:?}"),
        };
        sender.send(5).unwrap();
        while !handle.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(handle.try_join().map_err(|_| ()).unwrap().unwrap(), 5);
    }

    #[test]
    fn join_panicked() {
        let runtime = Runtime::new();
        let handle = runtime.spawn(|| panic!("boom"));
        let err = handle.join().unwrap_err();
        assert!(format!("{err}").contains("boom"));
    }
}
