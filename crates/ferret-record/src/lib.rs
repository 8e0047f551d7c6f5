//! Per-process access recording.
//!
//! A [`Recorder`] sits between the libc interposer and the supervisor: every
//! intercepted syscall is turned into one constructor call here, which
//! resolves the involved paths against the virtual filesystem view and emits
//! access reports on the channel. Constructors run *before* the real libc
//! call (so writes can be announced as `Maybe` first) and return a context;
//! the wrapper finalizes the context with the syscall's return value.
//!
//! Nothing here ever fails a syscall: resolution anomalies are reported, not
//! raised. Errno discipline is owned by the interposer layer.

mod elf;
pub mod report;

use ferret_proto::{
    AccessDigest, AccessKind, AccessReport, Accesses, AutodepEnv, Bool3, ChkDepsVerdict, Crc,
    Dflags, FileLoc, FileSig,
};
use ferret_solve::{dir_name, is_abs, FileInfo, RealPath, SolveReport};
use report::Channel;
use std::collections::{HashMap, HashSet};

pub use ferret_solve::At;

/// Sentinel dirfd: a `readlinkat(BACKDOOR_FD, query, ..)` is not a
/// filesystem access but a query to the recorder.
pub const BACKDOOR_FD: i32 = -20_041;

/// Queries understood through the backdoor (as the path argument).
const BACKDOOR_AUTODEP: &str = "autodep";
const BACKDOOR_ENABLE: &str = "enable";
const BACKDOOR_DISABLE: &str = "disable";

/// Accesses perceived by a user-visible stat. The user might look at st_size,
/// which gives away regular and link content, but tracking only the tag keeps
/// stat cheap and is the observed-sufficient policy.
const USER_STAT_ACCESSES: Accesses = Accesses::STAT;

// =============================================================================
// Simple paths
// =============================================================================

/// Paths that cannot lie in any tracked domain and need no resolution at
/// all. This is the fast path that keeps interposition cheap: a simple path
/// skips locking and the recorder entirely.
pub fn is_simple(file: &str) -> bool {
    if file.is_empty() {
        return true; // no file is simple
    }
    let b = file.as_bytes();
    if b[0] != b'/' {
        return false; // relative: we do not even know relative to what
    }
    // recognize frequent top-level system dirs
    let top_sz = if file.len() >= 2 {
        match b[1] {
            b'b' if file.starts_with("/bin/") => 5,
            b'd' if file.starts_with("/dev/") => 5,
            b'e' if file.starts_with("/etc/") => 5,
            b's' if file.starts_with("/sys/") => 5,
            b'u' if file.starts_with("/usr/") => 5,
            b'v' if file.starts_with("/var/") => 5,
            b'l' if file.starts_with("/lib/") => 5,
            b'l' if file.starts_with("/lib32/") => 7,
            b'l' if file.starts_with("/lib64/") => 7,
            b'p' => {
                // /proc/<pid> and /proc/self are meaningful, the rest of
                // /proc is simple (jemalloc pokes at it before init)
                if !file.starts_with("/proc/") {
                    0
                } else if b.len() > 6 && b[6].is_ascii_digit() {
                    0
                } else if file[6..].starts_with("self/") {
                    0
                } else {
                    6
                }
            }
            _ => 0,
        }
    } else {
        0
    };
    if top_sz == 0 {
        return false;
    }
    // ensure the path does not escape its top-level dir through ..
    let mut depth = 0i32;
    for comp in file[top_sz..].split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => depth += 1,
        }
    }
    true
}

// =============================================================================
// Contexts
// =============================================================================

/// Common context of every path-resolving operation.
#[derive(Debug, Default, Clone)]
pub struct Solved {
    pub loc: FileLoc,
    /// Canonical form (repo-relative when in repo).
    pub real: String,
    /// `LNK` if the final component was accessed as a symlink.
    pub accesses: Accesses,
    /// Disk-space path to hand to libc instead of the original argument,
    /// when the tmp mapping rewrote it.
    pub rewritten: Option<String>,
}

/// Context of an `open`-family call.
#[derive(Debug, Default)]
pub struct OpenCtx {
    pub solved: Solved,
    /// True if a Maybe-write was announced and must be confirmed.
    pub confirm: bool,
}

/// Context of a `readlink`-family call.
#[derive(Debug, Default)]
pub struct ReadlinkCtx {
    pub solved: Solved,
    /// If set, the call is emulated: this is the content to copy into the
    /// user's buffer instead of performing the syscall.
    pub backdoor: Option<Vec<u8>>,
}

/// Context of the two-path operations.
#[derive(Debug, Default)]
pub struct PairCtx {
    pub src: Solved,
    pub dst: Solved,
}

// =============================================================================
// Recorder
// =============================================================================

pub struct Recorder {
    real_path: RealPath,
    channel: Channel,
    /// file → (accesses reported, accesses reported with an existing file):
    /// repeated reads need not be reported twice.
    access_cache: HashMap<String, (Accesses, Accesses)>,
    tmp_reported: bool,
    next_parallel: u64,
    disabled: bool,
    /// LD_LIBRARY_PATH as captured at startup; later mutations by the job
    /// must not change ELF dep discovery.
    ld_library_path: Option<String>,
    pub seen_chdir: bool,
}

impl Recorder {
    pub fn new(env: AutodepEnv, pid: i32) -> Option<Self> {
        let disabled = env.disabled;
        let channel = Channel::connect(&env);
        let real_path = RealPath::new(env, pid).ok()?;
        let ld_library_path = std::env::var(ferret_proto::LD_LIBRARY_PATH_VAR)
            .or_else(|_| std::env::var("LD_LIBRARY_PATH"))
            .ok();
        Some(Recorder {
            real_path,
            channel,
            access_cache: HashMap::new(),
            tmp_reported: false,
            next_parallel: 0,
            disabled,
            ld_library_path,
            seen_chdir: false,
        })
    }

    /// Build from [`ferret_proto::AUTODEP_ENV_VAR`]; used by the interposer.
    pub fn from_env() -> Option<Self> {
        Self::new(AutodepEnv::from_env()?, 0)
    }

    /// Recorder accumulating reports in memory, for in-process use.
    pub fn new_static(env: AutodepEnv, cwd: String) -> Self {
        Recorder {
            real_path: RealPath::with_cwd(env, cwd, 0),
            channel: Channel::Static(Vec::new()),
            access_cache: HashMap::new(),
            tmp_reported: false,
            next_parallel: 0,
            disabled: false,
            ld_library_path: None,
            seen_chdir: false,
        }
    }

    /// Drain the accumulated reports of a static recorder.
    pub fn take_static(&mut self) -> Vec<AccessReport> {
        match &mut self.channel {
            Channel::Static(acc) => std::mem::take(acc),
            _ => Vec::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.disabled
    }

    pub fn set_enabled(&mut self, e: bool) {
        self.disabled = !e;
    }

    pub fn env(&self) -> &AutodepEnv {
        self.real_path.env()
    }

    /// Raw fd of the report channel, so wrappers can keep it clear of user
    /// descriptor manipulations.
    pub fn channel_fd(&self) -> Option<i32> {
        self.channel.raw_fd()
    }

    /// LD_LIBRARY_PATH as captured at startup.
    pub fn ld_library_path(&self) -> Option<&str> {
        self.ld_library_path.as_deref()
    }

    /// The user is about to shadow or release `fd`: if it is ours, abandon
    /// it to the user and reconnect elsewhere.
    pub fn hide(&mut self, fd: i32) {
        if self.channel.raw_fd() == Some(fd) {
            self.reconnect();
        }
    }

    /// Same for a `close_range`/`closefrom` span.
    pub fn hide_range(&mut self, min: u32, max: u32) {
        if let Some(fd) = self.channel.raw_fd() {
            if fd >= 0 && (fd as u32) >= min && (fd as u32) <= max {
                self.reconnect();
            }
        }
    }

    fn reconnect(&mut self) {
        let old = std::mem::replace(&mut self.channel, Channel::Disabled);
        old.abandon();
        self.channel = Channel::connect(&self.env().clone());
    }

    // -------------------------------------------------------------------------
    // Low-level reporting
    // -------------------------------------------------------------------------

    fn file_sig(&self, f: &str) -> FileSig {
        let abs;
        let path = if is_abs(f) {
            f
        } else {
            abs = format!("{}/{}", self.env().root_dir, f);
            &abs
        };
        FileInfo::of(path, true).sig()
    }

    fn report(&mut self, report: AccessReport) {
        if self.disabled {
            return;
        }
        let _ = self.channel.send(&report);
    }

    fn report_access(&mut self, mut report: AccessReport) {
        if self.disabled {
            return;
        }
        if !report.sync {
            // cache pure reads; writes poison the entry so later reads of a
            // written file are never reported as deps again
            let mut miss = false;
            for (f, sig) in &report.files {
                let entry = self
                    .access_cache
                    .entry(f.clone())
                    .or_insert((Accesses::NONE, Accesses::NONE));
                if report.digest.write == Bool3::No {
                    let seen = if sig.exists() { entry.1 } else { entry.0 };
                    if (report.digest.accesses & !seen) == Accesses::NONE
                        && entry != &(Accesses::NONE, Accesses::NONE)
                    {
                        continue; // nothing new to report for this file
                    }
                    entry.0 |= report.digest.accesses;
                    if sig.exists() {
                        entry.1 |= report.digest.accesses;
                    }
                } else {
                    *entry = (Accesses::ALL, Accesses::ALL);
                }
                miss = true;
            }
            if !miss {
                return;
            }
        }
        if report.files.len() > 1 {
            self.next_parallel += 1;
            report.parallel_id = self.next_parallel;
        }
        self.report(report);
    }

    fn report_dep(&mut self, f: String, a: Accesses, comment: &str) {
        if a.is_empty() {
            return;
        }
        let sig = self.file_sig(&f);
        self.report_access(AccessReport {
            kind: AccessKind::Access as u8,
            files: vec![(f, sig)],
            digest: AccessDigest {
                write: Bool3::No,
                unlink: false,
                accesses: a,
                dflags: Dflags::default(),
            },
            comment: comment.to_string(),
            ..Default::default()
        });
    }

    fn report_update(&mut self, f: String, a: Accesses, comment: &str) {
        let sig = self.file_sig(&f);
        self.report_access(AccessReport {
            kind: AccessKind::Access as u8,
            files: vec![(f, sig)],
            digest: AccessDigest {
                write: Bool3::Maybe,
                unlink: false,
                accesses: a,
                dflags: Dflags::default(),
            },
            comment: comment.to_string(),
            ..Default::default()
        });
    }

    fn report_unlnk(&mut self, f: String, comment: &str) {
        self.report_access(AccessReport {
            kind: AccessKind::Access as u8,
            files: vec![(f, FileSig::default())],
            digest: AccessDigest {
                write: Bool3::Maybe,
                unlink: true,
                accesses: Accesses::NONE,
                dflags: Dflags::default(),
            },
            comment: comment.to_string(),
            ..Default::default()
        });
    }

    fn report_deps(&mut self, fs: Vec<String>, a: Accesses, unlnk: bool, comment: &str) {
        if fs.is_empty() {
            return;
        }
        let files = fs
            .into_iter()
            .map(|f| {
                let sig = self.file_sig(&f);
                (f, sig)
            })
            .collect();
        self.report_access(AccessReport {
            kind: AccessKind::Access as u8,
            files,
            digest: AccessDigest {
                write: if unlnk { Bool3::Maybe } else { Bool3::No },
                unlink: unlnk,
                accesses: a,
                dflags: Dflags::default(),
            },
            comment: comment.to_string(),
            ..Default::default()
        });
    }

    fn report_targets(&mut self, fs: Vec<String>, comment: &str) {
        if fs.is_empty() {
            return;
        }
        let files = fs.into_iter().map(|f| (f, FileSig::default())).collect();
        self.report_access(AccessReport {
            kind: AccessKind::Access as u8,
            files,
            digest: AccessDigest {
                write: Bool3::Maybe,
                unlink: false,
                accesses: Accesses::NONE,
                dflags: Dflags::default(),
            },
            comment: comment.to_string(),
            ..Default::default()
        });
    }

    fn report_tmp(&mut self) {
        if self.tmp_reported {
            return;
        }
        self.tmp_reported = true;
        self.report(AccessReport {
            kind: AccessKind::Tmp as u8,
            ..Default::default()
        });
    }

    fn report_guard(&mut self, f: String, comment: &str) {
        self.report(AccessReport {
            kind: AccessKind::Guard as u8,
            files: vec![(f, FileSig::default())],
            comment: comment.to_string(),
            ..Default::default()
        });
    }

    /// Confirm (or retract) the last announced Maybe-write for a repo file.
    pub fn confirm(&mut self, loc: FileLoc, ok: bool) {
        if loc != FileLoc::Repo {
            return;
        }
        self.report(AccessReport {
            kind: AccessKind::Confirm as u8,
            ok,
            ..Default::default()
        });
    }

    pub fn report_trace(&mut self, msg: &str) {
        self.report(AccessReport {
            kind: AccessKind::Trace as u8,
            comment: msg.to_string(),
            ..Default::default()
        });
    }

    /// Unrecoverable: tell the supervisor the analysis is broken. The caller
    /// is expected to exit.
    pub fn report_panic(&mut self, msg: &str) {
        self.report(AccessReport {
            kind: AccessKind::Panic as u8,
            comment: msg.to_string(),
            ..Default::default()
        });
    }

    // -------------------------------------------------------------------------
    // Resolution core shared by all ops
    // -------------------------------------------------------------------------

    fn solve(&mut self, at: At, file: &str, no_follow: bool, read: bool, c: &str) -> Solved {
        if file.is_empty() {
            return Solved::default();
        }
        let sr: SolveReport = self.real_path.solve(at, file, no_follow);
        let mut accesses = Accesses::NONE;
        if sr.file_accessed == Bool3::Yes {
            accesses |= Accesses::LNK;
        }
        for lnk in sr.lnks {
            self.report_dep(lnk, Accesses::LNK, &format!("{c}.lnk"));
        }
        if !read && sr.file_accessed == Bool3::Maybe {
            // the dir of the accessed file was possibly a link and is not
            // protected by the access itself
            let dir = dir_name(&sr.real).to_string();
            if !dir.is_empty() {
                self.report_dep(dir, Accesses::LNK, &format!("{c}.last"));
            }
        }
        if !read && sr.loc == FileLoc::Tmp {
            self.report_tmp();
        }
        let rewritten = if sr.mapped {
            Some(if is_abs(&sr.real) {
                sr.real.clone()
            } else {
                format!("{}/{}", self.env().root_dir, sr.real)
            })
        } else {
            None
        };
        Solved {
            loc: sr.loc,
            real: sr.real,
            accesses,
            rewritten,
        }
    }

    // -------------------------------------------------------------------------
    // One operation per access kind
    // -------------------------------------------------------------------------

    /// `open`-family. Flags decide reads vs writes; writes are announced as
    /// Maybe and must be confirmed with the syscall result.
    pub fn open(&mut self, at: At, file: &str, flags: i32, c: &str) -> OpenCtx {
        let no_follow = flags & libc::O_NOFOLLOW != 0
            || (flags & libc::O_CREAT != 0 && flags & libc::O_EXCL != 0);
        let do_stat =
            flags & libc::O_PATH != 0 || (flags & libc::O_CREAT != 0 && flags & libc::O_EXCL != 0);
        let do_read = flags & libc::O_PATH == 0
            && flags & libc::O_ACCMODE != libc::O_WRONLY
            && flags & libc::O_TRUNC == 0;
        let do_write = flags & libc::O_PATH == 0 && flags & libc::O_ACCMODE != libc::O_RDONLY;
        let mut solved = self.solve(at, file, no_follow, do_read, c);
        if flags & (libc::O_DIRECTORY | libc::O_TMPFILE) != 0 {
            return OpenCtx {
                solved,
                confirm: false,
            }; // solving was enough
        }
        if !solved.loc.is_dep() && solved.loc != FileLoc::Repo {
            return OpenCtx {
                solved,
                confirm: false,
            };
        }
        let do_write = do_write && solved.loc == FileLoc::Repo;
        let mut comment = format!("{c}.");
        if do_stat {
            comment.push('S');
            solved.accesses |= USER_STAT_ACCESSES;
        }
        if do_read {
            comment.push('R');
            solved.accesses |= USER_STAT_ACCESSES | Accesses::REG;
        }
        if do_write {
            comment.push('W');
        }
        let a = solved.accesses;
        if do_write {
            self.report_update(solved.real.clone(), a, &comment);
            OpenCtx {
                solved,
                confirm: true,
            }
        } else {
            if do_read || do_stat {
                self.report_dep(solved.real.clone(), a, &comment);
            }
            OpenCtx {
                solved,
                confirm: false,
            }
        }
    }

    /// Plain content read (used for exec preps, search, stdin redirection).
    pub fn read(&mut self, at: At, file: &str, no_follow: bool, c: &str) -> Solved {
        let solved = self.solve(at, file, no_follow, true, c);
        if solved.loc.is_dep() {
            let a = solved.accesses | Accesses::REG;
            self.report_dep(solved.real.clone(), a, c);
        }
        solved
    }

    /// `stat`-family (also `access`, `realpath`).
    pub fn stat(&mut self, at: At, file: &str, no_follow: bool, c: &str) -> Solved {
        let solved = self.solve(at, file, no_follow, true, c);
        if solved.loc.is_dep() {
            let a = solved.accesses | USER_STAT_ACCESSES;
            self.report_dep(solved.real.clone(), a, c);
        }
        solved
    }

    /// Pure path solving (`opendir`, `utime*`, `scandir*`).
    pub fn path_only(&mut self, at: At, file: &str, no_follow: bool, c: &str) -> Solved {
        self.solve(at, file, no_follow, false, c)
    }

    /// `readlink`-family, with the backdoor surface.
    pub fn readlink(&mut self, at: At, file: &str, c: &str) -> ReadlinkCtx {
        if let At::Fd(fd) = at {
            if fd == BACKDOOR_FD {
                return ReadlinkCtx {
                    solved: Solved::default(),
                    backdoor: Some(self.backdoor_query(file)),
                };
            }
        }
        let solved = self.solve(at, file, true, true, c);
        let mut backdoor = None;
        if solved.loc == FileLoc::Admin {
            let marker = format!("{}/{}/backdoor/", self.env().root_dir, self.env().admin_dir);
            if let Some(q) = solved.real.strip_prefix(marker.as_str()) {
                let q = q.to_string();
                backdoor = Some(self.backdoor_query(&q));
            }
        }
        if backdoor.is_none() && solved.loc.is_dep() {
            let a = solved.accesses | Accesses::LNK;
            self.report_dep(solved.real.clone(), a, c);
        }
        ReadlinkCtx { solved, backdoor }
    }

    fn backdoor_query(&mut self, q: &str) -> Vec<u8> {
        match q {
            BACKDOOR_AUTODEP => {
                vec![if self.disabled { b'0' } else { b'1' }]
            }
            BACKDOOR_ENABLE => {
                self.set_enabled(true);
                Vec::new()
            }
            BACKDOOR_DISABLE => {
                self.set_enabled(false);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Hard link: the source is read (as a link too if no_follow, since a
    /// symlink may be hard linked), the destination is written.
    pub fn lnk(&mut self, src: (At, &str), dst: (At, &str), no_follow: bool, c: &str) -> PairCtx {
        let s = self.solve(src.0, src.1, no_follow, true, &format!("{c}.src"));
        let mut d = self.solve(dst.0, dst.1, true, false, &format!("{c}.dst"));
        if s.real == d.real {
            d.loc = FileLoc::Ext; // posix says nop in that case
            return PairCtx { src: s, dst: d };
        }
        let mut sa = Accesses::REG;
        if no_follow {
            sa |= Accesses::LNK;
        }
        if s.loc.is_dep() {
            let a = s.accesses | sa;
            self.report_dep(s.real.clone(), a, &format!("{c}.src"));
        }
        // link fails if dst exists, hence it is sensitive to existence
        if d.loc == FileLoc::Repo {
            let a = d.accesses | Accesses::STAT;
            self.report_update(d.real.clone(), a, &format!("{c}.dst"));
        } else if d.loc.is_dep() {
            let a = d.accesses | Accesses::STAT;
            self.report_dep(d.real.clone(), a, &format!("{c}.dst"));
        }
        PairCtx { src: s, dst: d }
    }

    pub fn symlnk(&mut self, at: At, file: &str, c: &str) -> Solved {
        let solved = self.solve(at, file, true, false, c);
        // fails if file exists, hence sensitive to existence
        let a = solved.accesses | Accesses::STAT;
        if solved.loc == FileLoc::Repo {
            self.report_update(solved.real.clone(), a, c);
        } else if solved.loc.is_dep() {
            self.report_dep(solved.real.clone(), a, c);
        }
        solved
    }

    pub fn unlnk(&mut self, at: At, file: &str, remove_dir: bool, c: &str) -> Solved {
        let mut solved = self.solve(at, file, true, false, c);
        if solved.loc != FileLoc::Repo {
            return solved;
        }
        if remove_dir {
            self.report_guard(solved.real.clone(), c);
            solved.loc = FileLoc::Ext; // no confirm expected for dirs
        } else {
            self.report_unlnk(solved.real.clone(), c);
        }
        solved
    }

    pub fn mkdir(&mut self, at: At, file: &str, c: &str) -> Solved {
        let solved = self.solve(at, file, true, false, c);
        if solved.loc.is_dep() {
            // mkdir fails if file exists, hence sensitive to existence
            let a = solved.accesses | Accesses::STAT;
            self.report_dep(solved.real.clone(), a, c);
        }
        if solved.loc == FileLoc::Repo {
            self.report_guard(solved.real.clone(), c);
        }
        solved
    }

    /// Behaves like a read-modify-write, but only matters when the exe bit
    /// actually changes.
    pub fn chmod(&mut self, at: At, file: &str, exe: bool, no_follow: bool, c: &str) -> Solved {
        let mut solved = self.solve(at, file, no_follow, true, c);
        if !solved.loc.is_dep() && solved.loc != FileLoc::Repo {
            return solved;
        }
        let abs = format!("{}/{}", self.env().root_dir, solved.real);
        let fi = FileInfo::of(&abs, true);
        if !fi.exists() || exe == (fi.tag == ferret_proto::FileTag::Exe) {
            solved.loc = FileLoc::Ext; // only a target if the exe bit changes
            return solved;
        }
        if solved.loc == FileLoc::Repo {
            let a = solved.accesses | Accesses::REG;
            self.report_update(solved.real.clone(), a, c);
        }
        solved
    }

    /// Rename: before it occurs, every file under the source is read and
    /// unlinked and its counterpart under the destination written; in case
    /// of exchange both dirs play both roles.
    pub fn rename(
        &mut self,
        src: (At, &str),
        dst: (At, &str),
        exchange: bool,
        no_replace: bool,
        c: &str,
    ) -> PairCtx {
        let s = self.solve(src.0, src.1, true, true, &format!("{c}.src"));
        let d = self.solve(dst.0, dst.1, true, exchange, &format!("{c}.dst"));
        if s.real == d.real {
            return PairCtx { src: s, dst: d }; // posix says nop
        }
        let mut reads: Vec<String> = Vec::new();
        let mut unlnks: HashSet<String> = HashSet::new();
        let mut writes: Vec<String> = Vec::new();
        if s.loc.is_dep() || d.loc == FileLoc::Repo {
            let sfxs = self.walk_suffixes(&s.real);
            if s.loc.is_dep() {
                for sfx in &sfxs {
                    unlnks.insert(format!("{}{}", s.real, sfx));
                }
            }
            if d.loc == FileLoc::Repo {
                for sfx in &sfxs {
                    writes.push(format!("{}{}", d.real, sfx));
                }
            }
        }
        if exchange && (d.loc.is_dep() || s.loc == FileLoc::Repo) {
            let sfxs = self.walk_suffixes(&d.real);
            if d.loc.is_dep() {
                for sfx in &sfxs {
                    unlnks.insert(format!("{}{}", d.real, sfx));
                }
            }
            if s.loc == FileLoc::Repo {
                for sfx in &sfxs {
                    writes.push(format!("{}{}", s.real, sfx));
                }
            }
        }
        // a file both written and unlinked is actually read-and-rewritten
        for w in &writes {
            if unlnks.remove(w) {
                reads.push(w.clone());
            }
        }
        let unlnks: Vec<String> = unlnks.into_iter().collect();
        self.report_deps(reads, Accesses::DATA, false, &format!("{c}.src"));
        self.report_deps(unlnks, Accesses::DATA, true, &format!("{c}.unlnk"));
        if d.loc.is_dep() && no_replace {
            self.report_dep(d.real.clone(), Accesses::STAT, &format!("{c}.probe"));
        }
        self.report_targets(writes, &format!("{c}.dst"));
        // renamed dirs invalidate whole subtrees
        if s.loc == FileLoc::Repo {
            self.report_guard(s.real.clone(), &format!("{c}.src"));
        }
        if d.loc == FileLoc::Repo {
            self.report_guard(d.real.clone(), &format!("{c}.dst"));
        }
        PairCtx { src: s, dst: d }
    }

    /// Deep-list the suffixes under a repo-relative file ("" if it is not a
    /// dir), so renames can enumerate what actually moves.
    fn walk_suffixes(&self, real: &str) -> Vec<String> {
        let abs = if is_abs(real) {
            real.to_string()
        } else {
            format!("{}/{}", self.env().root_dir, real)
        };
        let mut res = Vec::new();
        fn rec(abs: &str, sfx: &str, res: &mut Vec<String>) {
            if FileInfo::of(abs, true).tag != ferret_proto::FileTag::Dir {
                res.push(sfx.to_string());
                return;
            }
            let Ok(entries) = std::fs::read_dir(abs) else {
                return; // list only accessible files
            };
            for e in entries.flatten() {
                let name = e.file_name();
                let name = name.to_string_lossy();
                rec(
                    &format!("{abs}/{name}"),
                    &format!("{sfx}/{name}"),
                    res,
                );
            }
        }
        rec(&abs, "", &mut res);
        res
    }

    /// `chdir`/`fchdir` pre-step: resolve (and auto-guard nothing; cwd
    /// changes race with every other resolution and the lock discipline is
    /// owned by the interposer).
    pub fn chdir(&mut self, at: At, file: &str, c: &str) -> Solved {
        self.solve(at, file, true, false, c)
    }

    /// `chdir` post-step, once the syscall succeeded.
    pub fn chdir_done(&mut self, pid: i32) {
        self.seen_chdir = true;
        let cwd = if pid != 0 {
            ferret_solve::read_lnk(&format!("/proc/{pid}/cwd"))
        } else {
            ferret_solve::cwd().ok()
        };
        if let Some(cwd) = cwd {
            self.real_path.chdir(cwd);
        }
    }

    /// Exec prep: resolve the file, follow `#!` chains, then scan the ELF
    /// for needed libraries along the captured LD_LIBRARY_PATH.
    pub fn exec(&mut self, at: At, file: &str, no_follow: bool, c: &str) -> Solved {
        let solved = self.solve(at, file, no_follow, true, c);
        let mut sr = SolveReport {
            real: solved.real.clone(),
            loc: solved.loc,
            file_accessed: if solved.accesses.contains(ferret_proto::Access::Lnk) {
                Bool3::Yes
            } else {
                Bool3::No
            },
            ..Default::default()
        };
        match self.real_path.exec(&mut sr) {
            Ok(deps) => {
                for (f, a) in deps {
                    self.report_dep(f, a, c);
                }
            }
            Err(e) => {
                self.report_panic(&e.to_string());
            }
        }
        // the last interpreter is the ELF actually loaded
        let abs = if is_abs(&sr.real) {
            sr.real.clone()
        } else {
            format!("{}/{}", self.env().root_dir, sr.real)
        };
        let lib_path = self.ld_library_path.clone();
        for lib in elf::needed_libs(&abs) {
            self.search(&lib, lib_path.as_deref(), false, &format!("{c}.dep"));
        }
        solved
    }

    /// Walk a colon-delimited search variable, recording every *attempted*
    /// entry (a later addition earlier in the path must invalidate the
    /// build), stopping at the first that satisfies the access.
    ///
    /// Returns the winning full path if any. Used for `execvp` (is_exec) and
    /// for dlopen-style library lookups.
    pub fn search(
        &mut self,
        file: &str,
        path_var: Option<&str>,
        is_exec: bool,
        c: &str,
    ) -> Option<String> {
        if file.is_empty() {
            return None;
        }
        if file.contains('/') {
            // no search is performed when the name carries a /
            self.read(At::Cwd, file, false, c);
            return Some(file.to_string());
        }
        let path = path_var?.to_string();
        for entry in path.split(':') {
            let full = if entry.is_empty() {
                file.to_string()
            } else {
                format!("{entry}/{file}")
            };
            let solved = self.read(At::Cwd, &full, false, c);
            let abs = if solved.real.is_empty() {
                full.clone()
            } else if is_abs(&solved.real) {
                solved.real.clone()
            } else {
                format!("{}/{}", self.env().root_dir, solved.real)
            };
            let fi = FileInfo::of(&abs, false);
            let found = if is_exec {
                fi.tag == ferret_proto::FileTag::Exe
            } else {
                fi.exists()
            };
            if found {
                return Some(full);
            }
        }
        None
    }

    // -------------------------------------------------------------------------
    // Sync queries
    // -------------------------------------------------------------------------

    /// Ask the server (through the supervisor) whether our deps so far are
    /// still up to date.
    pub fn chk_deps(&mut self) -> ChkDepsVerdict {
        if self.disabled {
            return ChkDepsVerdict::Ok;
        }
        let req = AccessReport {
            kind: AccessKind::ChkDeps as u8,
            sync: true,
            ..Default::default()
        };
        if self.channel.send(&req).is_err() {
            return ChkDepsVerdict::Ok;
        }
        match self.channel.recv_reply() {
            Ok(reply) => ChkDepsVerdict::from_u8(reply.verdict),
            Err(_) => ChkDepsVerdict::Ok,
        }
    }

    /// Content digests for specific paths, resolved through the server.
    pub fn dep_infos(&mut self, paths: Vec<String>) -> Vec<Crc> {
        if self.disabled {
            return vec![Crc::Unknown; paths.len()];
        }
        let n = paths.len();
        let files = paths
            .into_iter()
            .map(|f| {
                let sig = self.file_sig(&f);
                (f, sig)
            })
            .collect();
        let req = AccessReport {
            kind: AccessKind::DepInfos as u8,
            files,
            sync: true,
            ..Default::default()
        };
        if self.channel.send(&req).is_err() {
            return vec![Crc::Unknown; n];
        }
        match self.channel.recv_reply() {
            Ok(reply) if reply.crcs.len() == n => reply.crcs,
            _ => vec![Crc::Unknown; n],
        }
    }

    /// Reverse tmp mapping for getcwd and friends.
    pub fn mk_view(&self, disk: &str) -> String {
        let env = self.env();
        if !env.tmp_view.is_empty() && disk.starts_with(&env.tmp_dir) {
            format!("{}{}", env.tmp_view, &disk[env.tmp_dir.len()..])
        } else {
            disk.to_string()
        }
    }
}

#[cfg(test)]
mod tests;
