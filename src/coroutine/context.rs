//! ucontext based register switching, the one platform specific piece of
//! the coroutine core.

use std::{mem, ptr};

use super::stack::{Stack, StackSize};

#[allow(improper_ctypes)] // ucontext_t embeds u128 aligned register fields
extern "C" {
    fn getcontext(ucp: *mut libc::ucontext_t) -> libc::c_int;
    fn setcontext(ucp: *const libc::ucontext_t) -> libc::c_int;
    fn swapcontext(oucp: *mut libc::ucontext_t, ucp: *const libc::ucontext_t) -> libc::c_int;
    fn makecontext(ucp: *mut libc::ucontext_t, func: extern "C" fn(*mut libc::c_void), argc: libc::c_int, ...);
}

/// Saved register image together with the stack it executes on.
#[repr(C, align(16))]
pub struct Context {
    stack: Stack,
    context: libc::ucontext_t,
    // Apple targets point uc_mcontext at storage trailing the struct which
    // the libc binding does not declare, reserve it inline.
    // https://github.com/rust-lang/libc/issues/2812
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "tvos", target_os = "watchos"))]
    _mcontext: libc::__darwin_mcontext64,
}

/// First frame of a freshly built context.
#[derive(Debug)]
pub struct Entry {
    pub f: extern "C" fn(*mut libc::c_void),
    pub arg: *mut libc::c_void,
    pub stack_size: StackSize,
}

unsafe impl Sync for Context {}

impl Context {
    pub fn empty() -> Context {
        unsafe { mem::zeroed() }
    }

    /// Builds a context that enters `entry.f` on its own guarded stack.
    ///
    /// Boxed since an initialized ucontext_t may point into itself and must
    /// never move. The link context stays null: entry functions must switch
    /// away instead of returning, the trampoline above aborts if one falls
    /// through.
    pub fn new(entry: &Entry) -> Box<Context> {
        let mut ctx = Box::new(Context::empty());
        let rc = unsafe { getcontext(&mut ctx.context) };
        assert!(rc == 0, "getcontext returns {rc}");
        let stack = Stack::alloc(entry.stack_size);
        ctx.context.uc_stack.ss_sp = stack.base() as *mut libc::c_void;
        ctx.context.uc_stack.ss_size = stack.size();
        ctx.context.uc_link = ptr::null_mut();
        ctx.stack = stack;
        unsafe { makecontext(&mut ctx.context, entry.f, 1, entry.arg) };
        ctx
    }

    /// Switches to this context with no way back.
    pub fn resume(&self) {
        let rc = unsafe { setcontext(&self.context) };
        panic!("setcontext returns {rc}");
    }

    /// Switches to this context, saving the current one into `backup`.
    pub fn switch(&self, backup: &mut Context) {
        let rc = unsafe { swapcontext(&mut backup.context, &self.context) };
        assert!(rc == 0, "swapcontext returns {rc}");
    }
}
