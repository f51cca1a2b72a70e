//! Machine-context and stack primitives.
//!
//! Everything that touches `ucontext_t` or raw stack memory is confined
//! to this module; the rest of the crate deals only in fiber handles.

use std::io;
use std::mem::MaybeUninit;
use std::os::raw::c_void;
use std::ptr;

/// Smallest stack the runtime will hand a fiber. Panic formatting and
/// backtrace capture need headroom even in trivial fibers.
const MIN_STACK_SIZE: usize = 16 * 1024;

/// Saved machine context, sufficient to resume execution.
pub(crate) struct Context {
    inner: Box<libc::ucontext_t>,
}

impl Context {
    /// An empty context, filled in by the first swap that saves into it.
    pub(crate) fn empty() -> Self {
        let inner = unsafe { Box::new(MaybeUninit::<libc::ucontext_t>::zeroed().assume_init()) };
        Context { inner }
    }

    /// A context that begins executing `entry` on `stack` when first
    /// switched to. `entry` must never return; there is no successor
    /// context to fall back into.
    pub(crate) fn with_entry(stack: &Stack, entry: extern "C" fn()) -> Self {
        let mut ctx = Context::empty();
        unsafe {
            if libc::getcontext(&mut *ctx.inner) != 0 {
                panic!("getcontext failed: {}", io::Error::last_os_error());
            }
            ctx.inner.uc_link = ptr::null_mut();
            ctx.inner.uc_stack.ss_sp = stack.base() as *mut c_void;
            ctx.inner.uc_stack.ss_size = stack.len();
            libc::makecontext(&mut *ctx.inner, entry, 0);
        }
        ctx
    }

    /// Point the context back at `entry` for a fresh run on the same stack.
    pub(crate) fn rearm(&mut self, stack: &Stack, entry: extern "C" fn()) {
        *self = Context::with_entry(stack, entry);
    }
}

/// Switch execution from `save` to `load`: the current thread of control
/// is captured into `save` and the state in `load` becomes live.
///
/// # Safety
///
/// Both contexts must stay allocated until control returns. `load` must
/// hold either a state captured by a previous swap or one prepared by
/// [`Context::with_entry`].
pub(crate) unsafe fn swap(save: *mut Context, load: *const Context) {
    let save_ucp: *mut libc::ucontext_t = &mut *(*save).inner;
    let load_ucp: *const libc::ucontext_t = &*(*load).inner;
    if libc::swapcontext(save_ucp, load_ucp) != 0 {
        panic!("swapcontext failed: {}", io::Error::last_os_error());
    }
}

/// An owned fiber stack: an anonymous mapping with a guard page at the
/// low end.
pub(crate) struct Stack {
    map: *mut u8,
    map_len: usize,
    page: usize,
}

impl Stack {
    /// Map a stack of at least `size` usable bytes, rounded up to whole
    /// pages. Mapping failure is treated like any other allocation
    /// failure and aborts.
    pub(crate) fn new(size: usize) -> Stack {
        let page = page_size();
        let usable = (size.max(MIN_STACK_SIZE) + page - 1) / page * page;
        let map_len = usable + page;
        unsafe {
            let map = libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            );
            if map == libc::MAP_FAILED {
                panic!(
                    "mmap of {} byte fiber stack failed: {}",
                    map_len,
                    io::Error::last_os_error()
                );
            }
            if libc::mprotect(map, page, libc::PROT_NONE) != 0 {
                let err = io::Error::last_os_error();
                libc::munmap(map, map_len);
                panic!("mprotect of stack guard page failed: {}", err);
            }
            Stack {
                map: map as *mut u8,
                map_len,
                page,
            }
        }
    }

    /// Lowest usable address, just above the guard page.
    fn base(&self) -> *mut u8 {
        unsafe { self.map.add(self.page) }
    }

    /// Usable length in bytes.
    pub(crate) fn len(&self) -> usize {
        self.map_len - self.page
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map as *mut c_void, self.map_len);
        }
    }
}

// The mapping is exclusively owned; only the fiber that owns it ever
// executes on it.
unsafe impl Send for Stack {}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_is_page_rounded() {
        let stack = Stack::new(100_000);
        let page = page_size();
        assert_eq!(stack.len() % page, 0);
        assert!(stack.len() >= 100_000);
    }

    #[test]
    fn tiny_request_gets_the_floor() {
        let stack = Stack::new(1);
        assert!(stack.len() >= MIN_STACK_SIZE);
    }
}
