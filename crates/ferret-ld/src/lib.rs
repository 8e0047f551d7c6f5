//! libc interposition layer.
//!
//! Built as a `cdylib` and loaded ahead of libc with `LD_PRELOAD`, this
//! crate exports one wrapper per filesystem entry point. Every wrapper obeys
//! the same contract:
//!
//! 1. before the recorder is started (early process boot) or while this
//!    thread is already inside a wrapper, forward straight to libc;
//! 2. paths that cannot lie in any tracked domain skip locking entirely;
//! 3. otherwise take the process-wide recorder lock, build the recording
//!    context, call libc with possibly-rewritten arguments, finalize the
//!    context with the result;
//! 4. the errno the caller observes is exactly the errno libc set for the
//!    underlying call.
//!
//! Variadic entry points cannot be declared on stable Rust; the `open`
//! family instead takes an explicit trailing `mode_t` (reading one extra
//! register argument is harmless on the supported SysV ABIs and the value is
//! only consulted under `O_CREAT|O_TMPFILE`), and `syscall` uses the same
//! fixed-six-slot trick. glibc's `execl*` build their argv internally and
//! reach the kernel without traversing any `execv*` export, so they have no
//! wrapper here.

pub mod support;

#[cfg(feature = "audit")]
pub mod audit;

use ferret_record::{At, Recorder, BACKDOOR_FD};
use libc::{c_char, c_int, c_long, c_uint, mode_t, size_t, ssize_t};
use support::{cpath, in_hook, simple, started, CPath, Errno, HookGuard};

/// Common prologue: resolve the original symbol and forward when recording
/// must not run. Evaluates to the original function pointer.
macro_rules! hdr {
    ($name:ident, ($($aty:ty),*) -> $r:ty, ($($arg:expr),*), $simple:expr) => {{
        let orig = orig!($name: unsafe extern "C" fn($($aty),*) -> $r);
        if in_hook() || !started() || $simple {
            return orig($($arg),*);
        }
        orig
    }};
}

/// Acquire the recorder or forward. Binds `$rec` inside the wrapper body.
macro_rules! rec {
    ($guard:ident, $orig:ident, ($($arg:expr),*)) => {
        let mut $guard = support::lock();
        let Some($guard) = $guard.as_mut() else {
            return $orig($($arg),*);
        };
    };
}

// =============================================================================
// chdir
// =============================================================================
// chdir must be tracked to keep the engine's view of cwd coherent; cwd
// mutation mandates the exclusive lock.

#[no_mangle]
pub unsafe extern "C" fn chdir(p: *const c_char) -> c_int {
    let orig = hdr!(chdir, (*const c_char) -> c_int, (p), false);
    let _g = HookGuard::new();
    rec!(rec, orig, (p));
    let mut en = Errno::save();
    let ctx = rec.chdir(At::Cwd, &cpath(p), "chdir");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(np.as_ptr());
    en.resave();
    if rc == 0 {
        rec.chdir_done(0);
    }
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn fchdir(fd: c_int) -> c_int {
    let orig = hdr!(fchdir, (c_int) -> c_int, (fd), false);
    let _g = HookGuard::new();
    rec!(rec, orig, (fd));
    let mut en = Errno::save();
    en.restore();
    let rc = orig(fd);
    en.resave();
    if rc == 0 {
        rec.chdir_done(0);
    }
    en.restore();
    rc
}

// =============================================================================
// chmod
// =============================================================================
// The file itself is not rewritten, but the resulting file depends on the
// previous content, much like a copy.

#[no_mangle]
pub unsafe extern "C" fn chmod(p: *const c_char, m: mode_t) -> c_int {
    let orig = hdr!(chmod, (*const c_char, mode_t) -> c_int, (p, m), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (p, m));
    let mut en = Errno::save();
    let ctx = rec.chmod(At::Cwd, &cpath(p), m & libc::S_IXUSR != 0, false, "chmod");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(np.as_ptr(), m);
    en.resave();
    rec.confirm(ctx.loc, rc >= 0);
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn fchmodat(d: c_int, p: *const c_char, m: mode_t, f: c_int) -> c_int {
    let orig = hdr!(fchmodat, (c_int, *const c_char, mode_t, c_int) -> c_int, (d, p, m, f), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (d, p, m, f));
    let mut en = Errno::save();
    let no_follow = f & libc::AT_SYMLINK_NOFOLLOW != 0;
    let ctx = rec.chmod(At::Fd(d), &cpath(p), m & libc::S_IXUSR != 0, no_follow, "fchmodat");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(d, np.as_ptr(), m, f);
    en.resave();
    rec.confirm(ctx.loc, rc >= 0);
    en.restore();
    rc
}

// =============================================================================
// close / dup
// =============================================================================
// In case the user closes or shadows one of our own descriptors, move it out
// of the way first.

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    let orig = hdr!(close, (c_int) -> c_int, (fd), false);
    let _g = HookGuard::new();
    rec!(rec, orig, (fd));
    let en = Errno::save();
    rec.hide(fd);
    en.restore();
    orig(fd)
}

#[no_mangle]
pub unsafe extern "C" fn close_range(fd1: c_uint, fd2: c_uint, f: c_int) -> c_int {
    let orig = hdr!(close_range, (c_uint, c_uint, c_int) -> c_int, (fd1, fd2, f), false);
    let _g = HookGuard::new();
    rec!(rec, orig, (fd1, fd2, f));
    let en = Errno::save();
    if (f & libc::CLOSE_RANGE_CLOEXEC as c_int) == 0 {
        rec.hide_range(fd1, fd2);
    }
    en.restore();
    orig(fd1, fd2, f)
}

#[no_mangle]
pub unsafe extern "C" fn dup2(ofd: c_int, nfd: c_int) -> c_int {
    let orig = hdr!(dup2, (c_int, c_int) -> c_int, (ofd, nfd), false);
    let _g = HookGuard::new();
    rec!(rec, orig, (ofd, nfd));
    let en = Errno::save();
    rec.hide(nfd);
    en.restore();
    orig(ofd, nfd)
}

#[no_mangle]
pub unsafe extern "C" fn dup3(ofd: c_int, nfd: c_int, f: c_int) -> c_int {
    let orig = hdr!(dup3, (c_int, c_int, c_int) -> c_int, (ofd, nfd, f), false);
    let _g = HookGuard::new();
    rec!(rec, orig, (ofd, nfd, f));
    let en = Errno::save();
    rec.hide(nfd);
    en.restore();
    orig(ofd, nfd, f)
}

// =============================================================================
// dlopen
// =============================================================================
// With LD_PRELOAD the loader gives us no indirect-dep channel, so the search
// along the captured LD_LIBRARY_PATH is recorded here.

#[no_mangle]
pub unsafe extern "C" fn dlopen(p: *const c_char, f: c_int) -> *mut libc::c_void {
    let orig = hdr!(dlopen, (*const c_char, c_int) -> *mut libc::c_void, (p, f), p.is_null() || *p == 0);
    let _g = HookGuard::new();
    rec!(rec, orig, (p, f));
    let en = Errno::save();
    let lib_path = rec.ld_library_path().map(|s| s.to_string());
    rec.search(&cpath(p), lib_path.as_deref(), false, "dlopen");
    en.restore();
    orig(p, f)
}

#[no_mangle]
pub unsafe extern "C" fn dlmopen(lm: c_long, p: *const c_char, f: c_int) -> *mut libc::c_void {
    let orig = hdr!(dlmopen, (c_long, *const c_char, c_int) -> *mut libc::c_void, (lm, p, f), p.is_null() || *p == 0);
    let _g = HookGuard::new();
    rec!(rec, orig, (lm, p, f));
    let en = Errno::save();
    let lib_path = rec.ld_library_path().map(|s| s.to_string());
    rec.search(&cpath(p), lib_path.as_deref(), false, "dlmopen");
    en.restore();
    orig(lm, p, f)
}

// =============================================================================
// exec
// =============================================================================
// execv*p cannot take the simple fast path: we do not know yet which file
// will be accessed.

#[no_mangle]
pub unsafe extern "C" fn execv(p: *const c_char, argv: *const *mut c_char) -> c_int {
    let orig = hdr!(execv, (*const c_char, *const *mut c_char) -> c_int, (p, argv), false);
    let _g = HookGuard::new();
    rec!(rec, orig, (p, argv));
    let mut en = Errno::save();
    let ctx = rec.exec(At::Cwd, &cpath(p), false, "execv");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(np.as_ptr(), argv);
    en.resave();
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn execve(
    p: *const c_char,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
) -> c_int {
    let orig = hdr!(execve, (*const c_char, *const *mut c_char, *const *mut c_char) -> c_int, (p, argv, envp), false);
    let _g = HookGuard::new();
    rec!(rec, orig, (p, argv, envp));
    let mut en = Errno::save();
    let ctx = rec.exec(At::Cwd, &cpath(p), false, "execve");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(np.as_ptr(), argv, envp);
    en.resave();
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn execveat(
    dfd: c_int,
    p: *const c_char,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
    flags: c_int,
) -> c_int {
    let orig = hdr!(execveat, (c_int, *const c_char, *const *mut c_char, *const *mut c_char, c_int) -> c_int, (dfd, p, argv, envp, flags), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (dfd, p, argv, envp, flags));
    let mut en = Errno::save();
    let no_follow = flags & libc::AT_SYMLINK_NOFOLLOW != 0;
    let ctx = rec.exec(At::Fd(dfd), &cpath(p), no_follow, "execveat");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(dfd, np.as_ptr(), argv, envp, flags);
    en.resave();
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn execvp(p: *const c_char, argv: *const *mut c_char) -> c_int {
    let orig = hdr!(execvp, (*const c_char, *const *mut c_char) -> c_int, (p, argv), false);
    let _g = HookGuard::new();
    rec!(rec, orig, (p, argv));
    let mut en = Errno::save();
    let found = execp_prepare(rec, &cpath(p), "execvp");
    en.restore();
    let rc = match &found {
        Some(full) => orig(full.as_ptr(), argv),
        None => orig(p, argv),
    };
    en.resave();
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn execvpe(
    p: *const c_char,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
) -> c_int {
    let orig = hdr!(execvpe, (*const c_char, *const *mut c_char, *const *mut c_char) -> c_int, (p, argv, envp), false);
    let _g = HookGuard::new();
    rec!(rec, orig, (p, argv, envp));
    let mut en = Errno::save();
    let found = execp_prepare(rec, &cpath(p), "execvpe");
    en.restore();
    let rc = match &found {
        Some(full) => orig(full.as_ptr(), argv, envp),
        None => orig(p, argv, envp),
    };
    en.resave();
    en.restore();
    rc
}

/// Shared execvp prep: search PATH recording every attempt, then run the
/// exec analysis (interpreter chain, ELF needs) on the winner.
fn execp_prepare(rec: &mut Recorder, file: &str, c: &str) -> Option<std::ffi::CString> {
    let path_var = std::env::var("PATH").ok();
    let full = rec.search(file, path_var.as_deref(), true, c)?;
    rec.exec(At::Cwd, &full, false, c);
    std::ffi::CString::new(full).ok()
}

// =============================================================================
// fopen
// =============================================================================

/// fopen mode → open flags. A mode with other than exactly one of {a,r,w}
/// yields a no-access probe.
fn fopen_flags(mode: &str) -> c_int {
    let mut a = false;
    let mut c = false;
    let mut p = false;
    let mut r = false;
    let mut w = false;
    for ch in mode.bytes() {
        match ch {
            b',' => break, // a ,ccs=xxx suffix does not matter here
            b'a' => a = true,
            b'c' => c = true,
            b'+' => p = true,
            b'r' => r = true,
            b'w' => w = true,
            _ => {}
        }
    }
    if (a as u8 + r as u8 + w as u8) != 1 || c {
        return libc::O_PATH;
    }
    let acc = if p {
        libc::O_RDWR
    } else if r {
        libc::O_RDONLY
    } else {
        libc::O_WRONLY
    };
    acc | if w { libc::O_TRUNC } else { 0 }
}

macro_rules! fopen_wrapper {
    ($name:ident) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(p: *const c_char, mode: *const c_char) -> *mut libc::FILE {
            let orig = hdr!($name, (*const c_char, *const c_char) -> *mut libc::FILE, (p, mode), simple(p));
            let _g = HookGuard::new();
            rec!(rec, orig, (p, mode));
            let mut en = Errno::save();
            let flags = fopen_flags(&cpath(mode));
            let ctx = rec.open(At::Cwd, &cpath(p), flags, stringify!($name));
            let np = CPath::new(p, &ctx.solved.rewritten);
            en.restore();
            let fp = orig(np.as_ptr(), mode);
            en.resave();
            if ctx.confirm {
                rec.confirm(ctx.solved.loc, !fp.is_null());
            }
            en.restore();
            fp
        }
    };
}

fopen_wrapper!(fopen);
fopen_wrapper!(fopen64);

macro_rules! freopen_wrapper {
    ($name:ident) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(
            p: *const c_char,
            mode: *const c_char,
            stream: *mut libc::FILE,
        ) -> *mut libc::FILE {
            let orig = hdr!($name, (*const c_char, *const c_char, *mut libc::FILE) -> *mut libc::FILE, (p, mode, stream), simple(p));
            let _g = HookGuard::new();
            rec!(rec, orig, (p, mode, stream));
            let mut en = Errno::save();
            let flags = fopen_flags(&cpath(mode));
            let ctx = rec.open(At::Cwd, &cpath(p), flags, stringify!($name));
            let np = CPath::new(p, &ctx.solved.rewritten);
            en.restore();
            let fp = orig(np.as_ptr(), mode, stream);
            en.resave();
            if ctx.confirm {
                rec.confirm(ctx.solved.loc, !fp.is_null());
            }
            en.restore();
            fp
        }
    };
}

freopen_wrapper!(freopen);
freopen_wrapper!(freopen64);

// =============================================================================
// fork
// =============================================================================
// The lock is taken around the fork and released on both sides: if another
// thread held it across the fork, the child would deadlock on a mutex owned
// by a thread it does not have. vfork is redirected to fork because its
// restricted semantics forbid the work the recorder must do before exec.

#[no_mangle]
pub unsafe extern "C" fn fork() -> libc::pid_t {
    let orig = orig!(fork: unsafe extern "C" fn() -> libc::pid_t);
    if in_hook() || !started() {
        return orig();
    }
    let _g = HookGuard::new();
    let guard = support::lock_raw();
    let rc = orig();
    drop(guard); // both parent and child unlock their own copy
    rc
}

#[no_mangle]
pub unsafe extern "C" fn vfork() -> libc::pid_t {
    fork()
}

#[no_mangle]
pub unsafe extern "C" fn system(cmd: *const c_char) -> c_int {
    let orig = orig!(system: unsafe extern "C" fn(*const c_char) -> c_int);
    if in_hook() || !started() {
        return orig(cmd);
    }
    let _g = HookGuard::new();
    let guard = support::lock_raw(); // system forks underneath
    let rc = orig(cmd);
    drop(guard);
    rc
}

// =============================================================================
// getcwd
// =============================================================================
// Needed for the tmp mapping: the kernel cwd is in disk space, the job must
// see view space.

unsafe fn fix_cwd(
    rec: &Recorder,
    res: *mut c_char,
    buf: *mut c_char,
    size: size_t,
    allocated: bool,
) -> *mut c_char {
    if res.is_null() {
        return res;
    }
    let disk = cpath(res).into_owned();
    let view = rec.mk_view(&disk);
    if view == disk {
        return res;
    }
    if allocated {
        // glibc malloc'd the buffer: swap it for one holding the view
        libc::free(res as *mut libc::c_void);
        let c = match std::ffi::CString::new(view) {
            Ok(c) => c,
            Err(_) => return std::ptr::null_mut(),
        };
        return libc::strdup(c.as_ptr());
    }
    if view.len() + 1 > size {
        *libc::__errno_location() = libc::ERANGE;
        return std::ptr::null_mut();
    }
    std::ptr::copy_nonoverlapping(view.as_ptr(), buf as *mut u8, view.len());
    *buf.add(view.len()) = 0;
    buf
}

#[no_mangle]
pub unsafe extern "C" fn getcwd(buf: *mut c_char, size: size_t) -> *mut c_char {
    let orig = hdr!(getcwd, (*mut c_char, size_t) -> *mut c_char, (buf, size), false);
    let _g = HookGuard::new();
    rec!(rec, orig, (buf, size));
    let mut en = Errno::save();
    en.restore();
    let res = orig(buf, size);
    en.resave();
    let res = fix_cwd(rec, res, buf, size, buf.is_null());
    en.restore();
    res
}

#[no_mangle]
pub unsafe extern "C" fn get_current_dir_name() -> *mut c_char {
    let orig = hdr!(get_current_dir_name, () -> *mut c_char, (), false);
    let _g = HookGuard::new();
    rec!(rec, orig, ());
    let mut en = Errno::save();
    en.restore();
    let res = orig();
    en.resave();
    let res = fix_cwd(rec, res, std::ptr::null_mut(), 0, true);
    en.restore();
    res
}

#[no_mangle]
pub unsafe extern "C" fn getwd(buf: *mut c_char) -> *mut c_char {
    let orig = hdr!(getwd, (*mut c_char) -> *mut c_char, (buf), false);
    let _g = HookGuard::new();
    rec!(rec, orig, (buf));
    let mut en = Errno::save();
    en.restore();
    let res = orig(buf);
    en.resave();
    let res = fix_cwd(rec, res, buf, libc::PATH_MAX as size_t, false);
    en.restore();
    res
}

// =============================================================================
// link
// =============================================================================

#[no_mangle]
pub unsafe extern "C" fn link(op: *const c_char, np: *const c_char) -> c_int {
    let orig = hdr!(link, (*const c_char, *const c_char) -> c_int, (op, np), simple(op) && simple(np));
    let _g = HookGuard::new();
    rec!(rec, orig, (op, np));
    let mut en = Errno::save();
    let ctx = rec.lnk((At::Cwd, &cpath(op)), (At::Cwd, &cpath(np)), false, "link");
    let (o2, n2) = (CPath::new(op, &ctx.src.rewritten), CPath::new(np, &ctx.dst.rewritten));
    en.restore();
    let rc = orig(o2.as_ptr(), n2.as_ptr());
    en.resave();
    rec.confirm(ctx.dst.loc, rc >= 0);
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn linkat(
    od: c_int,
    op: *const c_char,
    nd: c_int,
    np: *const c_char,
    f: c_int,
) -> c_int {
    let orig = hdr!(linkat, (c_int, *const c_char, c_int, *const c_char, c_int) -> c_int, (od, op, nd, np, f), simple(op) && simple(np));
    let _g = HookGuard::new();
    rec!(rec, orig, (od, op, nd, np, f));
    let mut en = Errno::save();
    let no_follow = f & libc::AT_SYMLINK_NOFOLLOW != 0;
    let ctx = rec.lnk((At::Fd(od), &cpath(op)), (At::Fd(nd), &cpath(np)), no_follow, "linkat");
    let (o2, n2) = (CPath::new(op, &ctx.src.rewritten), CPath::new(np, &ctx.dst.rewritten));
    en.restore();
    let rc = orig(od, o2.as_ptr(), nd, n2.as_ptr(), f);
    en.resave();
    rec.confirm(ctx.dst.loc, rc >= 0);
    en.restore();
    rc
}

// =============================================================================
// mkdir
// =============================================================================

#[no_mangle]
pub unsafe extern "C" fn mkdir(p: *const c_char, m: mode_t) -> c_int {
    let orig = hdr!(mkdir, (*const c_char, mode_t) -> c_int, (p, m), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (p, m));
    let mut en = Errno::save();
    let ctx = rec.mkdir(At::Cwd, &cpath(p), "mkdir");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(np.as_ptr(), m);
    en.resave();
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn mkdirat(d: c_int, p: *const c_char, m: mode_t) -> c_int {
    let orig = hdr!(mkdirat, (c_int, *const c_char, mode_t) -> c_int, (d, p, m), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (d, p, m));
    let mut en = Errno::save();
    let ctx = rec.mkdir(At::Fd(d), &cpath(p), "mkdirat");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(d, np.as_ptr(), m);
    en.resave();
    en.restore();
    rc
}

// =============================================================================
// mkstemp
// =============================================================================
// libc rewrites the template in place; the wrapper re-reads the mutated six
// X chars and synthesizes the open of the actually created file. When the
// template lies under the tmp view, libc runs on a disk-space copy and the
// mutated chars are copied back into the user's buffer.

unsafe fn mkstemp_common(
    rec: &mut Recorder,
    tmpl: *mut c_char,
    sfx_len: c_int,
    c: &str,
    call: impl FnOnce(*mut c_char) -> c_int,
) -> c_int {
    let user = cpath(tmpl).into_owned();
    let solved = rec.path_only(At::Cwd, &user, true, c);
    let tail = sfx_len as usize + 6;
    let fd = match &solved.rewritten {
        Some(disk) if disk.len() >= tail && user.len() >= tail => {
            let mut buf: Vec<u8> = disk.as_bytes().to_vec();
            buf.push(0);
            let fd = call(buf.as_mut_ptr() as *mut c_char);
            if fd >= 0 {
                // copy the six mutated chars back into the user's template
                let mutated = &buf[..buf.len() - 1];
                std::ptr::copy_nonoverlapping(
                    mutated[mutated.len() - tail..].as_ptr(),
                    (tmpl as *mut u8).add(user.len() - tail),
                    6,
                );
            }
            fd
        }
        _ => call(tmpl),
    };
    if fd >= 0 {
        let created = cpath(tmpl).into_owned();
        let ctx = rec.open(
            At::Cwd,
            &created,
            libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC | libc::O_NOFOLLOW,
            c,
        );
        if ctx.confirm {
            rec.confirm(ctx.solved.loc, true);
        }
    }
    fd
}

macro_rules! mkstemp_wrapper {
    ($name:ident) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(t: *mut c_char) -> c_int {
            let orig = hdr!($name, (*mut c_char) -> c_int, (t), false);
            let _g = HookGuard::new();
            rec!(rec, orig, (t));
            let mut en = Errno::save();
            en.restore();
            let rc = mkstemp_common(rec, t, 0, stringify!($name), |t2| unsafe { orig(t2) });
            en.resave();
            en.restore();
            rc
        }
    };
    ($name:ident, sfx) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(t: *mut c_char, sl: c_int) -> c_int {
            let orig = hdr!($name, (*mut c_char, c_int) -> c_int, (t, sl), false);
            let _g = HookGuard::new();
            rec!(rec, orig, (t, sl));
            let mut en = Errno::save();
            en.restore();
            let rc = mkstemp_common(rec, t, sl, stringify!($name), |t2| unsafe { orig(t2, sl) });
            en.resave();
            en.restore();
            rc
        }
    };
    ($name:ident, flags) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(t: *mut c_char, f: c_int) -> c_int {
            let orig = hdr!($name, (*mut c_char, c_int) -> c_int, (t, f), false);
            let _g = HookGuard::new();
            rec!(rec, orig, (t, f));
            let mut en = Errno::save();
            en.restore();
            let rc = mkstemp_common(rec, t, 0, stringify!($name), |t2| unsafe { orig(t2, f) });
            en.resave();
            en.restore();
            rc
        }
    };
    ($name:ident, flags_sfx) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(t: *mut c_char, f: c_int, sl: c_int) -> c_int {
            let orig = hdr!($name, (*mut c_char, c_int, c_int) -> c_int, (t, f, sl), false);
            let _g = HookGuard::new();
            rec!(rec, orig, (t, f, sl));
            let mut en = Errno::save();
            en.restore();
            let rc = mkstemp_common(rec, t, sl, stringify!($name), |t2| unsafe { orig(t2, f, sl) });
            en.resave();
            en.restore();
            rc
        }
    };
}

mkstemp_wrapper!(mkstemp);
mkstemp_wrapper!(mkstemp64);
mkstemp_wrapper!(mkostemp, flags);
mkstemp_wrapper!(mkostemp64, flags);
mkstemp_wrapper!(mkstemps, sfx);
mkstemp_wrapper!(mkstemps64, sfx);
mkstemp_wrapper!(mkostemps, flags_sfx);
mkstemp_wrapper!(mkostemps64, flags_sfx);

// =============================================================================
// open
// =============================================================================
// The trailing mode is only meaningful under O_CREAT|O_TMPFILE; passing it
// unconditionally to libc is harmless.

macro_rules! open_wrapper {
    ($name:ident) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(p: *const c_char, flags: c_int, mode: mode_t) -> c_int {
            let orig = hdr!($name, (*const c_char, c_int, mode_t) -> c_int, (p, flags, mode), simple(p));
            let _g = HookGuard::new();
            rec!(rec, orig, (p, flags, mode));
            let mut en = Errno::save();
            let ctx = rec.open(At::Cwd, &cpath(p), flags, stringify!($name));
            let np = CPath::new(p, &ctx.solved.rewritten);
            en.restore();
            let rc = orig(np.as_ptr(), flags, mode);
            en.resave();
            if ctx.confirm {
                rec.confirm(ctx.solved.loc, rc >= 0);
            }
            en.restore();
            rc
        }
    };
}

macro_rules! openat_wrapper {
    ($name:ident) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(d: c_int, p: *const c_char, flags: c_int, mode: mode_t) -> c_int {
            let orig = hdr!($name, (c_int, *const c_char, c_int, mode_t) -> c_int, (d, p, flags, mode), simple(p));
            let _g = HookGuard::new();
            rec!(rec, orig, (d, p, flags, mode));
            let mut en = Errno::save();
            let ctx = rec.open(At::Fd(d), &cpath(p), flags, stringify!($name));
            let np = CPath::new(p, &ctx.solved.rewritten);
            en.restore();
            let rc = orig(d, np.as_ptr(), flags, mode);
            en.resave();
            if ctx.confirm {
                rec.confirm(ctx.solved.loc, rc >= 0);
            }
            en.restore();
            rc
        }
    };
}

open_wrapper!(open);
open_wrapper!(open64);
openat_wrapper!(openat);
openat_wrapper!(openat64);

macro_rules! creat_wrapper {
    ($name:ident) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(p: *const c_char, m: mode_t) -> c_int {
            let orig = hdr!($name, (*const c_char, mode_t) -> c_int, (p, m), simple(p));
            let _g = HookGuard::new();
            rec!(rec, orig, (p, m));
            let mut en = Errno::save();
            let flags = libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC;
            let ctx = rec.open(At::Cwd, &cpath(p), flags, stringify!($name));
            let np = CPath::new(p, &ctx.solved.rewritten);
            en.restore();
            let rc = orig(np.as_ptr(), m);
            en.resave();
            if ctx.confirm {
                rec.confirm(ctx.solved.loc, rc >= 0);
            }
            en.restore();
            rc
        }
    };
}

creat_wrapper!(creat);
creat_wrapper!(creat64);

// =============================================================================
// readlink
// =============================================================================
// Two emulated surfaces live here: backdoor queries (a sentinel dirfd or a
// path under <admin>/backdoor/) and the view rewrite of /proc results that
// point into the on-disk tmp dir.

unsafe fn readlink_post(
    rec: &Recorder,
    ctx: &ferret_record::ReadlinkCtx,
    buf: *mut c_char,
    sz: size_t,
    len: ssize_t,
) -> ssize_t {
    use ferret_proto::FileLoc;
    if ctx.solved.loc != FileLoc::Proc || len <= 0 {
        return len;
    }
    let env = rec.env();
    if env.tmp_view.is_empty() {
        return len;
    }
    let got = std::slice::from_raw_parts(buf as *const u8, len as usize);
    let tmp_dir = env.tmp_dir.as_bytes();
    if !got.starts_with(tmp_dir) || (got.len() > tmp_dir.len() && got[tmp_dir.len()] != b'/') {
        return len;
    }
    let mut view: Vec<u8> = env.tmp_view.as_bytes().to_vec();
    view.extend_from_slice(&got[tmp_dir.len()..]);
    let out = view.len().min(sz);
    std::ptr::copy_nonoverlapping(view.as_ptr(), buf as *mut u8, out);
    out as ssize_t
}

#[no_mangle]
pub unsafe extern "C" fn readlink(p: *const c_char, buf: *mut c_char, sz: size_t) -> ssize_t {
    let orig = hdr!(readlink, (*const c_char, *mut c_char, size_t) -> ssize_t, (p, buf, sz), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (p, buf, sz));
    let mut en = Errno::save();
    let ctx = rec.readlink(At::Cwd, &cpath(p), "readlink");
    if let Some(content) = &ctx.backdoor {
        let out = content.len().min(sz);
        std::ptr::copy_nonoverlapping(content.as_ptr(), buf as *mut u8, out);
        en.restore();
        return out as ssize_t;
    }
    let np = CPath::new(p, &ctx.solved.rewritten);
    en.restore();
    let len = orig(np.as_ptr(), buf, sz);
    en.resave();
    let len = readlink_post(rec, &ctx, buf, sz, len);
    en.restore();
    len
}

#[no_mangle]
pub unsafe extern "C" fn readlinkat(
    d: c_int,
    p: *const c_char,
    buf: *mut c_char,
    sz: size_t,
) -> ssize_t {
    let orig = hdr!(readlinkat, (c_int, *const c_char, *mut c_char, size_t) -> ssize_t, (d, p, buf, sz), d != BACKDOOR_FD && simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (d, p, buf, sz));
    let mut en = Errno::save();
    let ctx = rec.readlink(At::Fd(d), &cpath(p), "readlinkat");
    if let Some(content) = &ctx.backdoor {
        let out = content.len().min(sz);
        std::ptr::copy_nonoverlapping(content.as_ptr(), buf as *mut u8, out);
        en.restore();
        return out as ssize_t;
    }
    let np = CPath::new(p, &ctx.solved.rewritten);
    en.restore();
    let len = orig(d, np.as_ptr(), buf, sz);
    en.resave();
    let len = readlink_post(rec, &ctx, buf, sz, len);
    en.restore();
    len
}

// =============================================================================
// rename
// =============================================================================

#[no_mangle]
pub unsafe extern "C" fn rename(op: *const c_char, np: *const c_char) -> c_int {
    let orig = hdr!(rename, (*const c_char, *const c_char) -> c_int, (op, np), simple(op) && simple(np));
    let _g = HookGuard::new();
    rec!(rec, orig, (op, np));
    let mut en = Errno::save();
    let ctx = rec.rename((At::Cwd, &cpath(op)), (At::Cwd, &cpath(np)), false, false, "rename");
    let (o2, n2) = (CPath::new(op, &ctx.src.rewritten), CPath::new(np, &ctx.dst.rewritten));
    en.restore();
    let rc = orig(o2.as_ptr(), n2.as_ptr());
    en.resave();
    rec.confirm(ctx.dst.loc.min(ctx.src.loc), rc >= 0);
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn renameat(
    od: c_int,
    op: *const c_char,
    nd: c_int,
    np: *const c_char,
) -> c_int {
    let orig = hdr!(renameat, (c_int, *const c_char, c_int, *const c_char) -> c_int, (od, op, nd, np), simple(op) && simple(np));
    let _g = HookGuard::new();
    rec!(rec, orig, (od, op, nd, np));
    let mut en = Errno::save();
    let ctx = rec.rename((At::Fd(od), &cpath(op)), (At::Fd(nd), &cpath(np)), false, false, "renameat");
    let (o2, n2) = (CPath::new(op, &ctx.src.rewritten), CPath::new(np, &ctx.dst.rewritten));
    en.restore();
    let rc = orig(od, o2.as_ptr(), nd, n2.as_ptr());
    en.resave();
    rec.confirm(ctx.dst.loc.min(ctx.src.loc), rc >= 0);
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn renameat2(
    od: c_int,
    op: *const c_char,
    nd: c_int,
    np: *const c_char,
    f: c_uint,
) -> c_int {
    let orig = hdr!(renameat2, (c_int, *const c_char, c_int, *const c_char, c_uint) -> c_int, (od, op, nd, np, f), simple(op) && simple(np));
    let _g = HookGuard::new();
    rec!(rec, orig, (od, op, nd, np, f));
    let mut en = Errno::save();
    let exchange = f & libc::RENAME_EXCHANGE != 0;
    let no_replace = f & libc::RENAME_NOREPLACE != 0;
    let ctx = rec.rename((At::Fd(od), &cpath(op)), (At::Fd(nd), &cpath(np)), exchange, no_replace, "renameat2");
    let (o2, n2) = (CPath::new(op, &ctx.src.rewritten), CPath::new(np, &ctx.dst.rewritten));
    en.restore();
    let rc = orig(od, o2.as_ptr(), nd, n2.as_ptr(), f);
    en.resave();
    rec.confirm(ctx.dst.loc.min(ctx.src.loc), rc >= 0);
    en.restore();
    rc
}

// =============================================================================
// rmdir / unlink
// =============================================================================

#[no_mangle]
pub unsafe extern "C" fn rmdir(p: *const c_char) -> c_int {
    let orig = hdr!(rmdir, (*const c_char) -> c_int, (p), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (p));
    let mut en = Errno::save();
    let ctx = rec.unlnk(At::Cwd, &cpath(p), true, "rmdir");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(np.as_ptr());
    en.resave();
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn unlink(p: *const c_char) -> c_int {
    let orig = hdr!(unlink, (*const c_char) -> c_int, (p), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (p));
    let mut en = Errno::save();
    let ctx = rec.unlnk(At::Cwd, &cpath(p), false, "unlink");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(np.as_ptr());
    en.resave();
    rec.confirm(ctx.loc, rc >= 0);
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn unlinkat(d: c_int, p: *const c_char, f: c_int) -> c_int {
    let orig = hdr!(unlinkat, (c_int, *const c_char, c_int) -> c_int, (d, p, f), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (d, p, f));
    let mut en = Errno::save();
    let rmdir = f & libc::AT_REMOVEDIR != 0;
    let ctx = rec.unlnk(At::Fd(d), &cpath(p), rmdir, "unlinkat");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(d, np.as_ptr(), f);
    en.resave();
    rec.confirm(ctx.loc, rc >= 0);
    en.restore();
    rc
}

// =============================================================================
// symlink
// =============================================================================

#[no_mangle]
pub unsafe extern "C" fn symlink(target: *const c_char, p: *const c_char) -> c_int {
    let orig = hdr!(symlink, (*const c_char, *const c_char) -> c_int, (target, p), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (target, p));
    let mut en = Errno::save();
    let ctx = rec.symlnk(At::Cwd, &cpath(p), "symlink");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(target, np.as_ptr());
    en.resave();
    rec.confirm(ctx.loc, rc >= 0);
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn symlinkat(target: *const c_char, d: c_int, p: *const c_char) -> c_int {
    let orig = hdr!(symlinkat, (*const c_char, c_int, *const c_char) -> c_int, (target, d, p), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (target, d, p));
    let mut en = Errno::save();
    let ctx = rec.symlnk(At::Fd(d), &cpath(p), "symlinkat");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(target, d, np.as_ptr());
    en.resave();
    rec.confirm(ctx.loc, rc >= 0);
    en.restore();
    rc
}

// =============================================================================
// truncate
// =============================================================================

macro_rules! truncate_wrapper {
    ($name:ident, $off:ty) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(p: *const c_char, l: $off) -> c_int {
            let orig = hdr!($name, (*const c_char, $off) -> c_int, (p, l), simple(p));
            let _g = HookGuard::new();
            rec!(rec, orig, (p, l));
            let mut en = Errno::save();
            let flags = if l != 0 { libc::O_RDWR } else { libc::O_WRONLY };
            let ctx = rec.open(At::Cwd, &cpath(p), flags, stringify!($name));
            let np = CPath::new(p, &ctx.solved.rewritten);
            en.restore();
            let rc = orig(np.as_ptr(), l);
            en.resave();
            if ctx.confirm {
                rec.confirm(ctx.solved.loc, rc >= 0);
            }
            en.restore();
            rc
        }
    };
}

truncate_wrapper!(truncate, libc::off_t);
truncate_wrapper!(truncate64, libc::off64_t);

// =============================================================================
// utime — a path solve only: dates are not content
// =============================================================================

macro_rules! solve_only_wrapper {
    ($name:ident, ($($aname:ident : $aty:ty),*), $no_follow:expr) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(p: *const c_char, $($aname: $aty),*) -> c_int {
            let orig = hdr!($name, (*const c_char, $($aty),*) -> c_int, (p, $($aname),*), simple(p));
            let _g = HookGuard::new();
            rec!(rec, orig, (p, $($aname),*));
            let mut en = Errno::save();
            let ctx = rec.path_only(At::Cwd, &cpath(p), $no_follow, stringify!($name));
            let np = CPath::new(p, &ctx.rewritten);
            en.restore();
            let rc = orig(np.as_ptr(), $($aname),*);
            en.resave();
            en.restore();
            rc
        }
    };
}

solve_only_wrapper!(utime, (times: *const libc::utimbuf), false);
solve_only_wrapper!(utimes, (times: *const libc::timeval), false);
solve_only_wrapper!(lutimes, (times: *const libc::timeval), true);

#[no_mangle]
pub unsafe extern "C" fn futimesat(d: c_int, p: *const c_char, times: *const libc::timeval) -> c_int {
    let orig = hdr!(futimesat, (c_int, *const c_char, *const libc::timeval) -> c_int, (d, p, times), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (d, p, times));
    let mut en = Errno::save();
    let ctx = rec.path_only(At::Fd(d), &cpath(p), false, "futimesat");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(d, np.as_ptr(), times);
    en.resave();
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn utimensat(
    d: c_int,
    p: *const c_char,
    times: *const libc::timespec,
    f: c_int,
) -> c_int {
    let orig = hdr!(utimensat, (c_int, *const c_char, *const libc::timespec, c_int) -> c_int, (d, p, times, f), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (d, p, times, f));
    let mut en = Errno::save();
    let no_follow = f & libc::AT_SYMLINK_NOFOLLOW != 0;
    let ctx = rec.path_only(At::Fd(d), &cpath(p), no_follow, "utimensat");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(d, np.as_ptr(), times, f);
    en.resave();
    en.restore();
    rc
}

// =============================================================================
// access / stat / realpath — mere path accesses
// =============================================================================

#[no_mangle]
pub unsafe extern "C" fn access(p: *const c_char, m: c_int) -> c_int {
    let orig = hdr!(access, (*const c_char, c_int) -> c_int, (p, m), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (p, m));
    let mut en = Errno::save();
    let ctx = rec.stat(At::Cwd, &cpath(p), false, "access");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(np.as_ptr(), m);
    en.resave();
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn faccessat(d: c_int, p: *const c_char, m: c_int, f: c_int) -> c_int {
    let orig = hdr!(faccessat, (c_int, *const c_char, c_int, c_int) -> c_int, (d, p, m, f), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (d, p, m, f));
    let mut en = Errno::save();
    let no_follow = f & libc::AT_SYMLINK_NOFOLLOW != 0;
    let ctx = rec.stat(At::Fd(d), &cpath(p), no_follow, "faccessat");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(d, np.as_ptr(), m, f);
    en.resave();
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn opendir(p: *const c_char) -> *mut libc::DIR {
    let orig = hdr!(opendir, (*const c_char) -> *mut libc::DIR, (p), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (p));
    let mut en = Errno::save();
    let ctx = rec.path_only(At::Cwd, &cpath(p), true, "opendir");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(np.as_ptr());
    en.resave();
    en.restore();
    rc
}

macro_rules! stat_wrapper {
    ($name:ident, $statbuf:ty, $no_follow:expr) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(p: *const c_char, b: *mut $statbuf) -> c_int {
            let orig = hdr!($name, (*const c_char, *mut $statbuf) -> c_int, (p, b), simple(p));
            let _g = HookGuard::new();
            rec!(rec, orig, (p, b));
            let mut en = Errno::save();
            let ctx = rec.stat(At::Cwd, &cpath(p), $no_follow, stringify!($name));
            let np = CPath::new(p, &ctx.rewritten);
            en.restore();
            let rc = orig(np.as_ptr(), b);
            en.resave();
            en.restore();
            rc
        }
    };
}

stat_wrapper!(stat, libc::stat, false);
stat_wrapper!(stat64, libc::stat64, false);
stat_wrapper!(lstat, libc::stat, true);
stat_wrapper!(lstat64, libc::stat64, true);

macro_rules! fstatat_wrapper {
    ($name:ident, $statbuf:ty) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(d: c_int, p: *const c_char, b: *mut $statbuf, f: c_int) -> c_int {
            let orig = hdr!($name, (c_int, *const c_char, *mut $statbuf, c_int) -> c_int, (d, p, b, f), simple(p));
            let _g = HookGuard::new();
            rec!(rec, orig, (d, p, b, f));
            let mut en = Errno::save();
            let no_follow = f & libc::AT_SYMLINK_NOFOLLOW != 0;
            let ctx = rec.stat(At::Fd(d), &cpath(p), no_follow, stringify!($name));
            let np = CPath::new(p, &ctx.rewritten);
            en.restore();
            let rc = orig(d, np.as_ptr(), b, f);
            en.resave();
            en.restore();
            rc
        }
    };
}

fstatat_wrapper!(fstatat, libc::stat);
fstatat_wrapper!(fstatat64, libc::stat64);

// glibc versioned stat entry points, still reachable from older binaries

macro_rules! xstat_wrapper {
    ($name:ident, $statbuf:ty, $no_follow:expr) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(v: c_int, p: *const c_char, b: *mut $statbuf) -> c_int {
            let orig = hdr!($name, (c_int, *const c_char, *mut $statbuf) -> c_int, (v, p, b), simple(p));
            let _g = HookGuard::new();
            rec!(rec, orig, (v, p, b));
            let mut en = Errno::save();
            let ctx = rec.stat(At::Cwd, &cpath(p), $no_follow, stringify!($name));
            let np = CPath::new(p, &ctx.rewritten);
            en.restore();
            let rc = orig(v, np.as_ptr(), b);
            en.resave();
            en.restore();
            rc
        }
    };
}

xstat_wrapper!(__xstat, libc::stat, false);
xstat_wrapper!(__xstat64, libc::stat64, false);
xstat_wrapper!(__lxstat, libc::stat, true);
xstat_wrapper!(__lxstat64, libc::stat64, true);

#[no_mangle]
pub unsafe extern "C" fn __fxstatat(
    v: c_int,
    d: c_int,
    p: *const c_char,
    b: *mut libc::stat,
    f: c_int,
) -> c_int {
    let orig = hdr!(__fxstatat, (c_int, c_int, *const c_char, *mut libc::stat, c_int) -> c_int, (v, d, p, b, f), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (v, d, p, b, f));
    let mut en = Errno::save();
    let no_follow = f & libc::AT_SYMLINK_NOFOLLOW != 0;
    let ctx = rec.stat(At::Fd(d), &cpath(p), no_follow, "__fxstatat");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(v, d, np.as_ptr(), b, f);
    en.resave();
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn statx(
    d: c_int,
    p: *const c_char,
    f: c_int,
    msk: c_uint,
    b: *mut libc::statx,
) -> c_int {
    let orig = hdr!(statx, (c_int, *const c_char, c_int, c_uint, *mut libc::statx) -> c_int, (d, p, f, msk, b), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (d, p, f, msk, b));
    let mut en = Errno::save();
    let ctx = rec.stat(At::Fd(d), &cpath(p), true, "statx");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(d, np.as_ptr(), f, msk, b);
    en.resave();
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn realpath(p: *const c_char, resolved: *mut c_char) -> *mut c_char {
    let orig = hdr!(realpath, (*const c_char, *mut c_char) -> *mut c_char, (p, resolved), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (p, resolved));
    let mut en = Errno::save();
    let ctx = rec.stat(At::Cwd, &cpath(p), false, "realpath");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(np.as_ptr(), resolved);
    en.resave();
    en.restore();
    rc
}

#[no_mangle]
pub unsafe extern "C" fn canonicalize_file_name(p: *const c_char) -> *mut c_char {
    let orig = hdr!(canonicalize_file_name, (*const c_char) -> *mut c_char, (p), simple(p));
    let _g = HookGuard::new();
    rec!(rec, orig, (p));
    let mut en = Errno::save();
    let ctx = rec.stat(At::Cwd, &cpath(p), false, "canonicalize_file_name");
    let np = CPath::new(p, &ctx.rewritten);
    en.restore();
    let rc = orig(np.as_ptr());
    en.resave();
    en.restore();
    rc
}

// =============================================================================
// syscall
// =============================================================================
// The descriptor table must allocate nothing: it is consulted before taking
// the lock, and a mutex can itself end up in syscall via futex management.

struct SyscallDescr {
    /// 1-based index of the path argument used for the simple-path filter.
    filter: u8,
    record: fn(&mut Recorder, &[c_long; 6]),
}

unsafe fn arg_path<'a>(args: &[c_long; 6], idx: usize) -> std::borrow::Cow<'a, str> {
    cpath(args[idx] as *const c_char)
}

fn syscall_descr(n: c_long) -> Option<&'static SyscallDescr> {
    macro_rules! descr {
        ($filter:expr, $record:expr) => {{
            static D: SyscallDescr = SyscallDescr {
                filter: $filter,
                record: $record,
            };
            Some(&D)
        }};
    }
    match n {
        libc::SYS_openat => descr!(2, |rec, a| {
            let (fd, flags) = (a[0] as c_int, a[2] as c_int);
            let ctx = rec.open(At::Fd(fd), unsafe { &arg_path(a, 1) }, flags, "sys_openat");
            if ctx.confirm {
                rec.confirm(ctx.solved.loc, true); // rc unseen here, assume done
            }
        }),
        libc::SYS_unlinkat => descr!(2, |rec, a| {
            let rmdir = a[2] as c_int & libc::AT_REMOVEDIR != 0;
            let ctx = rec.unlnk(At::Fd(a[0] as c_int), unsafe { &arg_path(a, 1) }, rmdir, "sys_unlinkat");
            rec.confirm(ctx.loc, true);
        }),
        libc::SYS_mkdirat => descr!(2, |rec, a| {
            rec.mkdir(At::Fd(a[0] as c_int), unsafe { &arg_path(a, 1) }, "sys_mkdirat");
        }),
        libc::SYS_symlinkat => descr!(3, |rec, a| {
            let ctx = rec.symlnk(At::Fd(a[1] as c_int), unsafe { &arg_path(a, 2) }, "sys_symlinkat");
            rec.confirm(ctx.loc, true);
        }),
        libc::SYS_linkat => descr!(2, |rec, a| {
            let no_follow = a[4] as c_int & libc::AT_SYMLINK_NOFOLLOW != 0;
            let ctx = rec.lnk(
                (At::Fd(a[0] as c_int), unsafe { &arg_path(a, 1) }),
                (At::Fd(a[2] as c_int), unsafe { &arg_path(a, 3) }),
                no_follow,
                "sys_linkat",
            );
            rec.confirm(ctx.dst.loc, true);
        }),
        libc::SYS_renameat2 => descr!(2, |rec, a| {
            let f = a[4] as c_uint;
            let ctx = rec.rename(
                (At::Fd(a[0] as c_int), unsafe { &arg_path(a, 1) }),
                (At::Fd(a[2] as c_int), unsafe { &arg_path(a, 3) }),
                f & libc::RENAME_EXCHANGE != 0,
                f & libc::RENAME_NOREPLACE != 0,
                "sys_renameat2",
            );
            rec.confirm(ctx.dst.loc.min(ctx.src.loc), true);
        }),
        libc::SYS_readlinkat => descr!(2, |rec, a| {
            rec.readlink(At::Fd(a[0] as c_int), unsafe { &arg_path(a, 1) }, "sys_readlinkat");
        }),
        libc::SYS_newfstatat => descr!(2, |rec, a| {
            let no_follow = a[3] as c_int & libc::AT_SYMLINK_NOFOLLOW != 0;
            rec.stat(At::Fd(a[0] as c_int), unsafe { &arg_path(a, 1) }, no_follow, "sys_newfstatat");
        }),
        libc::SYS_faccessat => descr!(2, |rec, a| {
            rec.stat(At::Fd(a[0] as c_int), unsafe { &arg_path(a, 1) }, false, "sys_faccessat");
        }),
        libc::SYS_chdir => descr!(1, |rec, a| {
            rec.chdir(At::Cwd, unsafe { &arg_path(a, 0) }, "sys_chdir");
        }),
        _ => None,
    }
}

#[no_mangle]
pub unsafe extern "C" fn syscall(
    n: c_long,
    a1: c_long,
    a2: c_long,
    a3: c_long,
    a4: c_long,
    a5: c_long,
    a6: c_long,
) -> c_long {
    let orig = orig!(syscall: unsafe extern "C" fn(c_long, c_long, c_long, c_long, c_long, c_long, c_long) -> c_long);
    let args = [a1, a2, a3, a4, a5, a6];
    let descr = syscall_descr(n);
    let skip = match descr {
        None => true,
        Some(d) if d.filter > 0 => simple(args[d.filter as usize - 1] as *const c_char),
        Some(_) => false,
    };
    if in_hook() || !started() || skip {
        return orig(n, a1, a2, a3, a4, a5, a6);
    }
    let _g = HookGuard::new();
    rec!(rec, orig, (n, a1, a2, a3, a4, a5, a6));
    let mut en = Errno::save();
    (descr.unwrap().record)(rec, &args);
    en.restore();
    let rc = orig(n, a1, a2, a3, a4, a5, a6);
    en.resave();
    if n == libc::SYS_chdir && rc == 0 {
        rec.chdir_done(0);
    }
    en.restore();
    rc
}

#[cfg(test)]
mod tests {
    use super::fopen_flags;

    #[test]
    fn fopen_mode_parsing() {
        assert_eq!(fopen_flags("r"), libc::O_RDONLY);
        assert_eq!(fopen_flags("w"), libc::O_WRONLY | libc::O_TRUNC);
        assert_eq!(fopen_flags("a"), libc::O_WRONLY);
        assert_eq!(fopen_flags("r+"), libc::O_RDWR);
        assert_eq!(fopen_flags("w+"), libc::O_RDWR | libc::O_TRUNC);
        assert_eq!(fopen_flags("rb"), libc::O_RDONLY);
        assert_eq!(fopen_flags("r,ccs=utf8"), libc::O_RDONLY);
        // degenerate combinations become a no-access probe
        assert_eq!(fopen_flags("a+r+w"), libc::O_PATH);
        assert_eq!(fopen_flags(""), libc::O_PATH);
        assert_eq!(fopen_flags("wc"), libc::O_PATH);
    }
}
