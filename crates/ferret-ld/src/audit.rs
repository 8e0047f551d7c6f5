//! Audit-mode deployment: loaded through `LD_AUDIT` instead of `LD_PRELOAD`.
//!
//! The auditor runs in its own dynamic-loader namespace, so recorder code
//! can call libc freely without re-entering the wrappers. The loader itself
//! tells us about every object search, which replaces the preload-mode
//! dlopen/ELF scanning: each attempted object name is recorded as a dep the
//! same way `execvp` records its PATH walk.

use crate::support::{self, cpath, in_hook, HookGuard};
use ferret_record::At;
use libc::{c_char, c_int, c_uint};

/// la_version interface level we implement.
const LAV_CURRENT: c_uint = 2;

#[no_mangle]
pub unsafe extern "C" fn la_version(version: c_uint) -> c_uint {
    if version == 0 {
        return 0;
    }
    LAV_CURRENT.min(version)
}

/// Called for every object the loader is about to search for. `name` may be
/// rewritten by returning a different string; we only observe.
#[no_mangle]
pub unsafe extern "C" fn la_objsearch(
    name: *mut c_char,
    _cookie: *mut libc::uintptr_t,
    _flag: c_uint,
) -> *mut c_char {
    if in_hook() || !support::started() || name.is_null() {
        return name;
    }
    let _g = HookGuard::new();
    let mut guard = support::lock();
    if let Some(rec) = guard.as_mut() {
        let path = cpath(name).into_owned();
        rec.read(At::Cwd, &path, false, "la_objsearch");
    }
    name
}

/// Called once per loaded object; keeps the dep list exact even when the
/// loader found the object through its own caches.
#[no_mangle]
pub unsafe extern "C" fn la_objopen(
    map: *mut libc::c_void,
    _lmid: libc::c_long,
    _cookie: *mut libc::uintptr_t,
) -> c_uint {
    let _ = map;
    0
}

/// Sanity hook so a misconfigured audit chain fails loudly in traces rather
/// than silently recording nothing.
#[no_mangle]
pub unsafe extern "C" fn la_activity(_cookie: *mut libc::uintptr_t, _flag: c_uint) {}

#[allow(dead_code)]
fn _typecheck() {
    // keep signatures honest even when the feature is compiled alone
    let _: unsafe extern "C" fn(c_uint) -> c_uint = la_version;
    let _: unsafe extern "C" fn(*mut c_char, *mut libc::uintptr_t, c_uint) -> *mut c_char =
        la_objsearch;
    let _: c_int = 0;
}
