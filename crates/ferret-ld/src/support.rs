//! Plumbing shared by every wrapper: the started gate, the per-thread
//! reentrancy flag, errno save/restore, original-symbol lookup and the
//! process-wide recorder lock.

use ferret_record::Recorder;
use std::cell::Cell;
use std::ffi::CStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Set once the dynamic loader ran our constructor: before that point (early
/// startup, allocator init) every wrapper must forward straight to libc.
static STARTED: AtomicBool = AtomicBool::new(false);

/// Runs before main, after the loader finished relocating us.
#[used]
#[link_section = ".init_array"]
static INIT: extern "C" fn() = {
    extern "C" fn init() {
        STARTED.store(true, Ordering::Release);
    }
    init
};

pub fn started() -> bool {
    STARTED.load(Ordering::Acquire)
}

thread_local! {
    /// True while this thread is inside a wrapper: libc self-calls (dlsym
    /// may readlink, the allocator may open /proc) must pass through.
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

pub fn in_hook() -> bool {
    IN_HOOK.with(|f| f.get())
}

/// Scoped reentrancy marker.
pub struct HookGuard;

impl HookGuard {
    pub fn new() -> Self {
        IN_HOOK.with(|f| f.set(true));
        HookGuard
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        IN_HOOK.with(|f| f.set(false));
    }
}

/// Errno must be exactly what libc set for the underlying call, never
/// touched by our bookkeeping. No allocator-touching primitive in here: the
/// allocator itself may be an early caller.
pub struct Errno(i32);

impl Errno {
    pub fn save() -> Self {
        Errno(unsafe { *libc::__errno_location() })
    }

    pub fn resave(&mut self) {
        self.0 = unsafe { *libc::__errno_location() };
    }

    pub fn restore(&self) {
        unsafe { *libc::__errno_location() = self.0 };
    }
}

/// One process-wide exclusive lock: the symlink walk reads the tracked cwd
/// and the access cache, both of which some wrappers mutate.
static RECORDER: Mutex<Option<Recorder>> = Mutex::new(None);

/// Acquire the recorder, initializing it on the first locked access after
/// startup. `None` if no autodep environment is configured (process not run
/// under the engine) or recording is disabled.
pub fn lock() -> MutexGuard<'static, Option<Recorder>> {
    let mut guard = match RECORDER.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    if guard.is_none() {
        *guard = Recorder::from_env();
    }
    guard
}

/// Take the lock without touching the recorder: fork needs the lock held
/// across the syscall so the child never inherits a mutex owned by another
/// pre-fork thread, then released on both sides.
pub fn lock_raw() -> MutexGuard<'static, Option<Recorder>> {
    match RECORDER.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Look up the next definition of `name` (the real libc one). The result is
/// cached by the caller through a per-site static.
pub fn dlsym_next(name: &'static str) -> usize {
    debug_assert!(name.ends_with('\0'));
    unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const libc::c_char) as usize }
}

/// Per-call-site original-function cache.
#[macro_export]
macro_rules! orig {
    ($name:ident : unsafe extern "C" fn($($a:ty),*) -> $r:ty) => {{
        use std::sync::atomic::{AtomicUsize, Ordering};
        static PTR: AtomicUsize = AtomicUsize::new(0);
        let mut p = PTR.load(Ordering::Relaxed);
        if p == 0 {
            p = $crate::support::dlsym_next(concat!(stringify!($name), "\0"));
            PTR.store(p, Ordering::Relaxed);
        }
        std::mem::transmute::<usize, unsafe extern "C" fn($($a),*) -> $r>(p)
    }};
}

/// Borrow a C path as &str; non-UTF8 paths fall back to lossless-enough
/// lossy text (the engine's domains are UTF-8 by construction, anything else
/// is external).
pub unsafe fn cpath<'a>(p: *const libc::c_char) -> std::borrow::Cow<'a, str> {
    if p.is_null() {
        return std::borrow::Cow::Borrowed("");
    }
    String::from_utf8_lossy(CStr::from_ptr(p).to_bytes())
}

/// True if the wrapper can skip locking and recording altogether.
pub unsafe fn simple(p: *const libc::c_char) -> bool {
    if p.is_null() {
        return true;
    }
    ferret_record::is_simple(&cpath(p))
}

/// Owned C string for a rewritten (tmp-mapped) argument.
pub struct CPath {
    buf: Option<std::ffi::CString>,
    orig: *const libc::c_char,
}

impl CPath {
    /// Keep the user's pointer unless the recorder rewrote the path.
    pub fn new(orig: *const libc::c_char, rewritten: &Option<String>) -> Self {
        let buf = rewritten
            .as_ref()
            .and_then(|r| std::ffi::CString::new(r.as_str()).ok());
        CPath { buf, orig }
    }

    pub fn as_ptr(&self) -> *const libc::c_char {
        match &self.buf {
            Some(b) => b.as_ptr(),
            None => self.orig,
        }
    }
}
